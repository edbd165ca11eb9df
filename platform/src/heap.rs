//! The firmware heap. Everything long-lived the engine allocates (the
//! engine state itself, the page directories, report strings) comes from
//! a fixed arena handed over by the bootloader, pinned below 2 GiB so it
//! stays identity mapped across window switches.

use linked_list_allocator::LockedHeap;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hands the arena to the allocator. Called once, before anything
/// allocates.
///
/// # Safety
///
/// The range must be unused RAM, identity mapped, and never handed to the
/// memory tests.
pub unsafe fn init(heap_base: usize, heap_size: usize) {
    ALLOCATOR.lock().init(heap_base as *mut u8, heap_size);
}
