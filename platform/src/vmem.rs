//! Virtual memory window management.
//!
//! The startup code gives us 4 GiB of virtual address space on 2 MiB
//! pages, identity mapped to the first 2 GiB of physical memory. The
//! third gigabyte maps the physical window currently under test, and the
//! space above it maps the screen frame buffer, ACPI tables and any other
//! device regions that are not in the permanently mapped range.

use elain::Align;
use engine::testword::{Testword, PAGE_SHIFT, PAGE_SIZE};
use engine::window::VM_WINDOW_PAGES;
use spin::Mutex;

/// Present + writable + 2 MiB page size.
const PD_FLAGS: u64 = 0x83;
const NX: u64 = 1 << 63;

const VM_PAGE_SHIFT: usize = 21;
const VM_PAGE_SIZE: usize = 1 << VM_PAGE_SHIFT;

/// Virtual base of the test window (the third gigabyte).
pub const VM_WINDOW_START: usize = 2 << 30;
/// Virtual base of the device region map.
pub const VM_REGION_START: usize = VM_WINDOW_START + (1 << 30);

/// Device regions get at most this many 2 MiB pages.
const MAX_REGION_PAGES: usize = 256;

/// The two page directories backing the remappable part of the address
/// space. The startup code points the third and fourth PDPT entries here
/// and never touches them again.
#[repr(C, align(4096))]
pub struct WindowTables {
    /// Maps the 1 GiB test window.
    pub window_pd: [u64; 512],
    align_0: Align<4096>,

    /// Maps device regions, one slot per 2 MiB page.
    pub device_pd: [u64; 512],
}

const_assert_eq!(core::mem::size_of::<WindowTables>(), 2 * 4096);

impl WindowTables {
    pub const fn empty() -> Self {
        Self { window_pd: [0; 512], align_0: Align::NEW, device_pd: [0; 512] }
    }
}

struct VmemState {
    tables: &'static mut WindowTables,
    device_pages_used: usize,
    mapped_window: usize,
}

pub struct VirtualMemory {
    state: Mutex<VmemState>,
    nx_supported: bool,
    max_phys_pages: usize,
}

impl VirtualMemory {
    /// Takes ownership of the page directories. `max_phys_pages` is the
    /// highest physical page the platform can address, from CPUID leaf
    /// 0x80000008.
    pub fn new(
        tables: &'static mut WindowTables,
        nx_supported: bool,
        max_phys_pages: usize,
    ) -> Self {
        Self {
            state: Mutex::new(VmemState { tables, device_pages_used: 0, mapped_window: 2 }),
            nx_supported,
            max_phys_pages,
        }
    }

    /// Grants access to a non-memory region for the lifetime of the run
    /// (or only until testing starts). Returns the virtual address, or
    /// None if the device-map slot table is exhausted.
    pub fn map_region(
        &self,
        base_addr: usize,
        size: usize,
        only_for_startup: bool,
    ) -> Option<usize> {
        let last_addr = base_addr + size - 1;

        // A region below the remappable space is permanently identity
        // mapped. If it is only needed during startup, the window range
        // (still identity at that point) counts as mapped too.
        let pinned_end = if only_for_startup { VM_REGION_START } else { VM_WINDOW_START };
        if last_addr < pinned_end {
            return Some(base_addr);
        }

        let mut state = self.state.lock();

        // Check if the requested region is already mapped; a partial
        // match at the end of the current map is extended.
        let first_phys_page = base_addr >> VM_PAGE_SHIFT;
        let last_phys_page = last_addr >> VM_PAGE_SHIFT;
        let mut first_virt_page = 0;
        let mut curr_virt_page = 0;
        let mut curr_phys_page = first_phys_page;
        while curr_virt_page < state.device_pages_used && curr_phys_page <= last_phys_page {
            let mapped_phys_page = (state.tables.device_pd[curr_virt_page] >> VM_PAGE_SHIFT) as usize;
            curr_virt_page += 1;
            if mapped_phys_page == curr_phys_page {
                curr_phys_page += 1;
            } else {
                first_virt_page = curr_virt_page;
                curr_phys_page = first_phys_page;
            }
        }

        while curr_phys_page <= last_phys_page {
            if state.device_pages_used == MAX_REGION_PAGES {
                return None;
            }
            let slot = state.device_pages_used;
            state.tables.device_pd[slot] = ((curr_phys_page as u64) << VM_PAGE_SHIFT) + PD_FLAGS;
            state.device_pages_used += 1;
            curr_phys_page += 1;
        }

        // Flush any remnants of the old mapping.
        reload_page_tables();

        Some(VM_REGION_START + first_virt_page * VM_PAGE_SIZE + base_addr % VM_PAGE_SIZE)
    }

    /// Points the test window at the physical gigabyte containing
    /// start_page. Returns false when the platform cannot address it.
    pub fn map_window(&self, start_page: usize) -> bool {
        let window = start_page >> (30 - PAGE_SHIFT);

        if window < 2 {
            // The first two gigabytes are permanently identity mapped.
            return true;
        }
        if start_page >= self.max_phys_pages {
            return false;
        }

        let mut state = self.state.lock();
        let flags = if self.nx_supported { PD_FLAGS | NX } else { PD_FLAGS };
        for i in 0..512 {
            state.tables.window_pd[i] =
                ((window as u64) << 30) + ((i as u64) << VM_PAGE_SHIFT) + flags;
        }
        state.mapped_window = window;
        drop(state);

        reload_page_tables();
        true
    }

    pub fn first_word_mapping(&self, page: usize) -> *mut Testword {
        let addr = if page < (VM_WINDOW_START >> PAGE_SHIFT) {
            // Below 2 GiB, the address is directly mapped.
            page << PAGE_SHIFT
        } else {
            // Otherwise it is mapped into the third gigabyte.
            let alias = (VM_WINDOW_START >> PAGE_SHIFT) + page % VM_WINDOW_PAGES;
            alias << PAGE_SHIFT
        };
        addr as *mut Testword
    }

    pub fn last_word_mapping(&self, page: usize) -> *mut Testword {
        ((self.first_word_mapping(page) as usize) + PAGE_SIZE - core::mem::size_of::<Testword>())
            as *mut Testword
    }

    pub fn page_of(&self, addr: *const Testword) -> usize {
        let mut page = addr as usize >> PAGE_SHIFT;
        if page >= (VM_WINDOW_START >> PAGE_SHIFT) {
            page %= VM_WINDOW_PAGES;
            page += self.state.lock().mapped_window << (30 - PAGE_SHIFT);
        }
        page
    }
}

/// Reloads CR3 to flush stale translations after a mapping change.
fn reload_page_tables() {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    x86_64::instructions::tlb::flush_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmem() -> VirtualMemory {
        let tables = Box::leak(Box::new(WindowTables::empty()));
        VirtualMemory::new(tables, true, 1 << (39 - PAGE_SHIFT))
    }

    #[test]
    fn low_windows_need_no_mapping() {
        let vmem = vmem();
        assert!(vmem.map_window(0));
        assert!(vmem.map_window(VM_WINDOW_PAGES + 1));
    }

    #[test]
    fn high_windows_rewrite_the_window_directory() {
        let vmem = vmem();
        let page = 3 * VM_WINDOW_PAGES + 7;
        assert!(vmem.map_window(page));

        let state = vmem.state.lock();
        assert_eq!(state.mapped_window, 3);
        assert_eq!(state.tables.window_pd[0], (3u64 << 30) + PD_FLAGS + NX);
        assert_eq!(state.tables.window_pd[1], (3u64 << 30) + (1 << VM_PAGE_SHIFT) + PD_FLAGS + NX);
        drop(state);

        // Round trip: a window address translates back to its physical
        // page.
        let virt = vmem.first_word_mapping(page);
        assert_eq!(virt as usize, VM_WINDOW_START + 7 * PAGE_SIZE);
        assert_eq!(vmem.page_of(virt), page);
    }

    #[test]
    fn unaddressable_windows_are_refused() {
        let tables = Box::leak(Box::new(WindowTables::empty()));
        let vmem = VirtualMemory::new(tables, false, 4 * VM_WINDOW_PAGES);
        assert!(!vmem.map_window(4 * VM_WINDOW_PAGES + 1));
    }

    #[test]
    fn device_regions_reuse_and_exhaust_slots() {
        let vmem = vmem();

        // Identity-mapped regions come straight back.
        assert_eq!(vmem.map_region(0xb8000, 0x1000, false), Some(0xb8000));

        // A high region gets a slot above the window.
        let fb = 0x1_2000_0000;
        let virt = vmem.map_region(fb, VM_PAGE_SIZE, false).unwrap();
        assert_eq!(virt, VM_REGION_START + fb % VM_PAGE_SIZE);

        // Mapping it again reuses the existing slot.
        assert_eq!(vmem.map_region(fb, VM_PAGE_SIZE, false), Some(virt));
        assert_eq!(vmem.state.lock().device_pages_used, 1);

        // Exhaust the table.
        let mut mapped = 1;
        for i in 0..MAX_REGION_PAGES {
            let base = 0x2_0000_0000 + i * VM_PAGE_SIZE;
            if vmem.map_region(base, VM_PAGE_SIZE, false).is_none() {
                break;
            }
            mapped += 1;
        }
        assert_eq!(mapped, MAX_REGION_PAGES);
        assert!(vmem.map_region(0x3_0000_0000, VM_PAGE_SIZE, false).is_none());
    }
}
