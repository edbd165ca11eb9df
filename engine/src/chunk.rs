//! Splits a memory segment into per-core chunks for the parallel tests.

use crate::testword::{round_down, Testword};
use crate::window::VmMapEntry;

/// Calculates the start and end word address for the chunk of the segment
/// that is to be tested by the core with the given chunk index. The chunk
/// start is aligned to a multiple of chunk_align (at least one testword,
/// up to 256 bytes for the vector tests).
///
/// Chunks for the same segment are disjoint and together cover the segment
/// except for a tail of fewer than chunk_align bytes. An empty chunk is
/// signalled by end < start.
pub fn calculate_chunk(
    segment: &VmMapEntry,
    chunk_idx: usize,
    num_active_cpus: usize,
    chunk_align: usize,
) -> (*mut Testword, *mut Testword) {
    const WORD: usize = core::mem::size_of::<Testword>();

    // If we are only running 1 CPU then test the whole segment.
    if num_active_cpus == 1 {
        return (segment.start, segment.end);
    }

    let seg_start = segment.start as usize;
    let seg_end = segment.end as usize;

    let segment_size = seg_end - seg_start + WORD;
    let chunk_size = round_down(segment_size / num_active_cpus, chunk_align);

    let start = seg_start + chunk_size * chunk_idx;
    let mut end = start.wrapping_add(chunk_size).wrapping_sub(WORD);
    if end > seg_end {
        end = seg_end;
    }

    (start as *mut Testword, end as *mut Testword)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testword::PAGE_SIZE;

    const WORD: usize = core::mem::size_of::<Testword>();

    fn segment(base: usize, bytes: usize) -> VmMapEntry {
        VmMapEntry {
            pm_base_addr: 0,
            start: base as *mut Testword,
            end: (base + bytes - WORD) as *mut Testword,
        }
    }

    #[test]
    fn single_cpu_gets_the_whole_segment() {
        let seg = segment(0x10000, PAGE_SIZE);
        let (start, end) = calculate_chunk(&seg, 0, 1, WORD);
        assert_eq!(start, seg.start);
        assert_eq!(end, seg.end);
    }

    #[test]
    fn chunks_are_disjoint_aligned_and_cover_the_segment() {
        for &cpus in &[2usize, 3, 4, 7] {
            for &align in &[WORD, 32, 256] {
                let seg = segment(0x40000, 3 * PAGE_SIZE + 64);
                let mut covered = 0usize;
                let mut prev_end = seg.start as usize - WORD;
                for i in 0..cpus {
                    let (start, end) = calculate_chunk(&seg, i, cpus, align);
                    let (start, end) = (start as usize, end as usize);
                    assert_eq!(start % align, 0, "cpus={} align={}", cpus, align);
                    assert_eq!(start, prev_end + WORD, "chunks must be adjacent");
                    assert!(end <= seg.end as usize);
                    covered += end - start + WORD;
                    prev_end = end;
                }
                // At most an alignment tail is left untested.
                let total = seg.end as usize - seg.start as usize + WORD;
                assert!(total - covered < align * cpus);
            }
        }
    }

    #[test]
    fn too_small_segment_yields_empty_chunks() {
        // Twelve words split 4 ways at 256-byte alignment: no chunk fits.
        let seg = segment(0x40000, 12 * WORD);
        for i in 0..4 {
            let (start, end) = calculate_chunk(&seg, i, 4, 256);
            assert!((end as usize) < (start as usize));
        }
    }
}
