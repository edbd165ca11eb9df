//! The virtual test window and the per-window memory map.
//!
//! One 1 GiB slice of physical memory is mapped into the engine's address
//! space at a time. At the start of each window the driver intersects the
//! window with the physical segments and the user's page limits to build
//! the list of [`VmMapEntry`] segments the workers operate on.

use crate::pmem::PhysMemMap;
use crate::system::System;
use crate::testword::{Testword, PAGE_SHIFT, PAGE_SIZE};
use tinyvec::ArrayVec;

/// One test window covers a gigabyte of physical memory.
pub const VM_WINDOW_PAGES: usize = 1 << (30 - PAGE_SHIFT);

/// Physical memory below this is permanently identity mapped; windows at or
/// above it are remapped into the third gigabyte of the address space.
pub const VM_PINNED_PAGES: usize = 2 * VM_WINDOW_PAGES;

/// The low program load site must stay below this (4 MiB).
pub const LOW_LOAD_LIMIT_PAGES: usize = (4 << 20) >> PAGE_SHIFT;

pub const MAX_MEM_SEGMENTS: usize = crate::pmem::MAX_MEM_RANGES;

/// A contiguous slice of the current window. `start` and `end` are the
/// first and last (inclusive) testword pointers; the whole byte range lies
/// inside the mapped window.
#[derive(Debug, Clone, Copy)]
pub struct VmMapEntry {
    pub pm_base_addr: usize,
    pub start: *mut Testword,
    pub end: *mut Testword,
}

impl Default for VmMapEntry {
    fn default() -> Self {
        Self { pm_base_addr: 0, start: core::ptr::null_mut(), end: core::ptr::null_mut() }
    }
}

/// The list of memory segments currently mapped into the test window.
///
/// Written only by the master between barriers; read by all workers after.
/// The raw pointers refer to the shared window mapping, which is why this
/// is safe to hand across cores.
#[derive(Debug, Default)]
pub struct VmMap {
    pub entries: ArrayVec<[VmMapEntry; MAX_MEM_SEGMENTS]>,
    pub mapped_pages: usize,
}

unsafe impl Send for VmMap {}
unsafe impl Sync for VmMap {}

impl VmMap {
    /// Initialises the map with the intersection of the window
    /// `[win_start, win_end)` (in pages), the physical segments, and the
    /// user-configured page limits.
    pub fn setup<S: System>(
        sys: &S,
        pm_map: &PhysMemMap,
        mut win_start: usize,
        mut win_end: usize,
        limit_lower: usize,
        limit_upper: usize,
    ) -> Self {
        let mut map = VmMap::default();

        // Reduce the window to fit in the user-specified limits.
        if win_start < limit_lower {
            win_start = limit_lower;
        }
        if win_end > limit_upper {
            win_end = limit_upper;
        }
        if win_start >= win_end {
            return map;
        }

        for range in pm_map.get_ranges() {
            let seg_start = range.start.max(win_start);
            let seg_end = range.end.min(win_end);
            if seg_start < seg_end {
                map.mapped_pages += seg_end - seg_start;
                map.entries.push(VmMapEntry {
                    pm_base_addr: seg_start,
                    start: sys.first_word_mapping(seg_start),
                    end: sys.last_word_mapping(seg_end - 1),
                });
            }
        }

        map
    }
}

/// The byte offset added to each stored address by the own-address-plus-
/// window test: the difference between the virtual address of a word in
/// the window and its physical address. Detects aliasing between windows.
pub fn window_offset(pm_base_page: usize) -> Testword {
    let window_base = (pm_base_page / VM_WINDOW_PAGES) * VM_WINDOW_PAGES;
    let offset_pages = window_base.saturating_sub(VM_PINNED_PAGES);
    offset_pages * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::PmRange;
    use crate::sim::SimSystem;

    #[test]
    fn intersects_window_with_segments_and_limits() {
        let sys = SimSystem::new(0x800);
        let pm_map = PhysMemMap::new(&[
            PmRange { start: 0, end: 0x9f },
            PmRange { start: 0x100, end: 0x800 },
        ])
        .unwrap();

        let map = VmMap::setup(&sys, &pm_map, 0, 0x400, 0x10, 0x300);
        assert_eq!(map.entries.len(), 2);
        assert_eq!(map.entries[0].pm_base_addr, 0x10);
        assert_eq!(map.entries[1].pm_base_addr, 0x100);
        assert_eq!(map.mapped_pages, (0x9f - 0x10) + (0x300 - 0x100));

        // Each segment ends on the last word of its last page.
        let end = map.entries[1].end as usize;
        let start = map.entries[1].start as usize;
        assert_eq!(end - start, (0x300 - 0x100) * PAGE_SIZE - core::mem::size_of::<Testword>());
    }

    #[test]
    fn empty_when_window_outside_limits() {
        let sys = SimSystem::new(0x100);
        let pm_map = PhysMemMap::new(&[PmRange { start: 0, end: 0x100 }]).unwrap();

        let map = VmMap::setup(&sys, &pm_map, 0x200, 0x400, 0, usize::MAX);
        assert!(map.entries.is_empty());
        assert_eq!(map.mapped_pages, 0);
    }

    #[test]
    fn window_offset_is_zero_below_the_pinned_region() {
        assert_eq!(window_offset(0), 0);
        assert_eq!(window_offset(VM_WINDOW_PAGES + 5), 0);
        // The window for physical 2-3 GiB lands on the third virtual
        // gigabyte, so its stored addresses need no correction either.
        assert_eq!(window_offset(VM_PINNED_PAGES + 5), 0);
        // Higher windows are remapped down and carry the difference.
        assert_eq!(window_offset(3 * VM_WINDOW_PAGES + 5), VM_WINDOW_PAGES * PAGE_SIZE);
    }
}
