//! The x86 firmware implementation of the engine's [`System`] interface.

use crate::memrw::{self, SimdLevel};
use crate::smp::LocalApic;
use crate::vmem::VirtualMemory;
use engine::system::{EccStatus, System};
use engine::Testword;

pub struct X86System {
    vmem: VirtualMemory,
    apic: LocalApic,
    simd: SimdLevel,
    tsc_hz: u64,
    has_tsc: bool,
    ecc_polling: bool,
}

impl X86System {
    pub fn new(vmem: VirtualMemory, apic: LocalApic, tsc_hz: u64, ecc_polling: bool) -> Self {
        let simd = SimdLevel::detect();
        let has_tsc = x86::cpuid::CpuId::new()
            .get_feature_info()
            .map(|features| features.has_tsc())
            .unwrap_or(false);

        log::info!("SIMD level: {:?}", simd);

        Self { vmem, apic, simd, tsc_hz, has_tsc, ecc_polling }
    }

    pub fn vmem(&self) -> &VirtualMemory {
        &self.vmem
    }
}

impl System for X86System {
    unsafe fn read_word(&self, p: *const Testword) -> Testword {
        memrw::read_word(p)
    }

    unsafe fn write_word(&self, p: *mut Testword, v: Testword) {
        memrw::write_word(p, v);
    }

    unsafe fn write_word_nt(&self, p: *mut Testword, v: Testword) {
        memrw::write_word_nt(p, v);
    }

    fn vector_words(&self) -> usize {
        self.simd.vector_words()
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn fill_vector(&self, p: *mut Testword, v: Testword, nt: bool) {
        match self.simd {
            SimdLevel::Avx => memrw::fill256(p, v, nt),
            SimdLevel::Sse2 => memrw::fill128(p, v, nt),
            SimdLevel::Scalar => memrw::write_word(p, v),
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn read_vector(&self, p: *const Testword, out: &mut [Testword]) {
        match self.simd {
            SimdLevel::Avx => memrw::read256(p, out),
            SimdLevel::Sse2 => memrw::read128(p, out),
            SimdLevel::Scalar => out[0] = memrw::read_word(p),
        }
    }

    unsafe fn copy_words(&self, dst: *mut Testword, src: *const Testword, n: usize) {
        memrw::copy_words(dst, src, n);
    }

    fn fence(&self) {
        memrw::fence();
    }

    unsafe fn flush_cache_line(&self, p: *const Testword) {
        memrw::flush_cache_line(p);
    }

    fn cache_on(&self) {
        unsafe { crate::cache::cache_on() };
    }

    fn cache_off(&self) {
        unsafe { crate::cache::cache_off() };
    }

    fn cache_flush(&self) {
        unsafe { crate::cache::cache_flush() };
    }

    fn map_window(&self, start_page: usize) -> bool {
        self.vmem.map_window(start_page)
    }

    fn map_device_region(
        &self,
        phys_addr: usize,
        size: usize,
        only_for_startup: bool,
    ) -> Option<usize> {
        self.vmem.map_region(phys_addr, size, only_for_startup)
    }

    fn first_word_mapping(&self, page: usize) -> *mut Testword {
        self.vmem.first_word_mapping(page)
    }

    fn last_word_mapping(&self, page: usize) -> *mut Testword {
        self.vmem.last_word_mapping(page)
    }

    fn page_of(&self, addr: *const Testword) -> usize {
        self.vmem.page_of(addr)
    }

    fn current_cpu(&self) -> usize {
        self.apic.current_cpu()
    }

    fn park(&self) {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::hlt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }

    fn wake(&self, cpu: usize) {
        self.apic.send_nmi(cpu);
    }

    fn timestamp(&self) -> u64 {
        if !self.has_tsc {
            return 0;
        }

        #[cfg(target_arch = "x86_64")]
        return unsafe { x86::time::rdtsc() };

        #[allow(unreachable_code)]
        0
    }

    fn sleep_secs(&self, secs: usize) {
        if self.tsc_hz == 0 || !self.has_tsc {
            return;
        }
        let end = self.timestamp() + self.tsc_hz * secs as u64;
        while self.timestamp() < end {
            core::hint::spin_loop();
        }
    }

    fn reboot(&self) -> ! {
        crate::hwctrl::reboot()
    }

    fn poll_ecc(&self) -> Option<EccStatus> {
        if !self.ecc_polling {
            return None;
        }
        unsafe { crate::memctrl::poll() }
    }
}
