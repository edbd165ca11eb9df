//! Narrow wrappers around the memory-access instructions the test engine
//! needs: volatile scalar access, non-temporal stores, SSE2/AVX vector
//! stores, string moves, fences and cache-line flushes. Everything the
//! engine does to RAM funnels through these.

use engine::Testword;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::{
    __m128i, __m256i, _mm256_load_si256, _mm256_set1_epi64x, _mm256_store_si256,
    _mm256_stream_si256, _mm_clflush, _mm_load_si128, _mm_mfence, _mm_set1_epi64x,
    _mm_store_si128, _mm_stream_si128, _mm_stream_si64,
};

/// The vector store widths the host supports, detected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    Scalar,
    Sse2,
    Avx,
}

impl SimdLevel {
    pub fn detect() -> Self {
        let cpuid = x86::cpuid::CpuId::new();
        match cpuid.get_feature_info() {
            Some(features) if features.has_avx() => SimdLevel::Avx,
            Some(features) if features.has_sse2() => SimdLevel::Sse2,
            _ => SimdLevel::Scalar,
        }
    }

    /// The widest store, in testwords.
    pub fn vector_words(self) -> usize {
        match self {
            SimdLevel::Scalar => 1,
            SimdLevel::Sse2 => 16 / core::mem::size_of::<Testword>(),
            SimdLevel::Avx => 32 / core::mem::size_of::<Testword>(),
        }
    }
}

/// Reads the testword at p with a single volatile load.
///
/// # Safety
///
/// p must be mapped and testword-aligned.
#[inline]
pub unsafe fn read_word(p: *const Testword) -> Testword {
    core::ptr::read_volatile(p)
}

/// Writes v to p with a single volatile store.
///
/// # Safety
///
/// p must be mapped and testword-aligned.
#[inline]
pub unsafe fn write_word(p: *mut Testword, v: Testword) {
    core::ptr::write_volatile(p, v);
}

/// Writes v to p with a non-temporal hint, bypassing the cache. Must be
/// followed by [`fence`] before the data is handed to another core.
///
/// # Safety
///
/// p must be mapped and testword-aligned.
#[inline]
pub unsafe fn write_word_nt(p: *mut Testword, v: Testword) {
    #[cfg(target_arch = "x86_64")]
    _mm_stream_si64(p as *mut i64, v as i64);

    #[cfg(not(target_arch = "x86_64"))]
    write_word(p, v);
}

/// Broadcasts v and stores one 128-bit vector at p.
///
/// # Safety
///
/// p must be mapped and 16-byte aligned; the CPU must support SSE2.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn fill128(p: *mut Testword, v: Testword, nt: bool) {
    let value = _mm_set1_epi64x(v as i64);
    if nt {
        _mm_stream_si128(p as *mut __m128i, value);
    } else {
        _mm_store_si128(p as *mut __m128i, value);
    }
}

/// Broadcasts v and stores one 256-bit vector at p.
///
/// # Safety
///
/// p must be mapped and 32-byte aligned; the CPU must support AVX.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
pub unsafe fn fill256(p: *mut Testword, v: Testword, nt: bool) {
    let value = _mm256_set1_epi64x(v as i64);
    if nt {
        _mm256_stream_si256(p as *mut __m256i, value);
    } else {
        _mm256_store_si256(p as *mut __m256i, value);
    }
}

/// Reads one 128-bit vector from p into two testwords.
///
/// # Safety
///
/// p must be mapped and 16-byte aligned; the CPU must support SSE2.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn read128(p: *const Testword, out: &mut [Testword]) {
    let value = _mm_load_si128(p as *const __m128i);
    let lanes: [Testword; 2] = core::mem::transmute(value);
    out[..2].copy_from_slice(&lanes);
}

/// Reads one 256-bit vector from p into four testwords.
///
/// # Safety
///
/// p must be mapped and 32-byte aligned; the CPU must support AVX.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
pub unsafe fn read256(p: *const Testword, out: &mut [Testword]) {
    let value = _mm256_load_si256(p as *const __m256i);
    let lanes: [Testword; 4] = core::mem::transmute(value);
    out[..4].copy_from_slice(&lanes);
}

/// Copies n testwords forward with the string-move engine.
///
/// # Safety
///
/// Both ranges must be mapped and testword-aligned.
#[inline]
pub unsafe fn copy_words(dst: *mut Testword, src: *const Testword, n: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let mut dst = dst;
        let mut src = src;
        let mut n = n;
        core::arch::asm!(
            "cld",
            "rep movsq",
            inout("rdi") dst,
            inout("rsi") src,
            inout("rcx") n,
            options(nostack)
        );
        let _ = (dst, src, n);
    }

    #[cfg(not(target_arch = "x86_64"))]
    core::ptr::copy(src, dst, n);
}

/// Full memory fence, ordering non-temporal stores as well.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_mfence()
    };

    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Evicts the cache line containing p from the whole hierarchy.
///
/// # Safety
///
/// p must be mapped.
#[inline]
pub unsafe fn flush_cache_line(p: *const Testword) {
    #[cfg(target_arch = "x86_64")]
    _mm_clflush(p as *const u8);

    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simd_levels_report_their_width() {
        assert_eq!(SimdLevel::Scalar.vector_words(), 1);
        assert_eq!(SimdLevel::Sse2.vector_words(), 2);
        assert_eq!(SimdLevel::Avx.vector_words(), 4);
    }

    #[test]
    fn scalar_and_string_moves_round_trip() {
        let mut src = [0 as Testword; 64];
        let mut dst = [0 as Testword; 64];
        for (i, word) in src.iter_mut().enumerate() {
            *word = i as Testword * 0x0101;
        }

        unsafe { copy_words(dst.as_mut_ptr(), src.as_ptr(), 64) };
        assert_eq!(src, dst);

        unsafe {
            write_word_nt(dst.as_mut_ptr(), 0xdead);
        }
        fence();
        assert_eq!(unsafe { read_word(dst.as_ptr()) }, 0xdead);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn vector_fill_broadcasts_the_word() {
        if SimdLevel::detect() == SimdLevel::Scalar {
            return;
        }

        #[repr(align(32))]
        struct Aligned([Testword; 8]);
        let mut buf = Aligned([0; 8]);

        unsafe { fill128(buf.0.as_mut_ptr(), 0x5a5a, false) };
        fence();
        assert_eq!(&buf.0[..2], &[0x5a5a, 0x5a5a]);

        let mut out = [0 as Testword; 2];
        unsafe { read128(buf.0.as_ptr(), &mut out) };
        assert_eq!(out, [0x5a5a, 0x5a5a]);
    }
}
