//! The physical memory map: an ordered sequence of page-aligned segments
//! covering usable RAM, derived once at startup and then read-only.

use crate::driver::EngineError;
use crate::testword::{PAGE_SHIFT, PAGE_SIZE};
use tinyvec::ArrayVec;

pub const MAX_MEM_RANGES: usize = 32;

/// A usable RAM segment, as page numbers: `[start, end)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PmRange {
    pub start: usize,
    pub end: usize,
}

impl PmRange {
    pub fn page_count(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug)]
pub struct PhysMemMap {
    ranges: ArrayVec<[PmRange; MAX_MEM_RANGES]>,
}

impl PhysMemMap {
    /// Builds the map from the ranges handed over by the bootloader.
    /// Ranges must be non-empty, non-overlapping and sorted by start page.
    pub fn new(ranges: &[PmRange]) -> Result<Self, EngineError> {
        if ranges.is_empty() || ranges.len() > MAX_MEM_RANGES {
            return Err(EngineError::InvalidMemoryMap);
        }

        let mut last_end = 0;
        let mut map = ArrayVec::new();
        for (i, range) in ranges.iter().enumerate() {
            if range.start >= range.end || (i > 0 && range.start < last_end) {
                return Err(EngineError::InvalidMemoryMap);
            }
            last_end = range.end;
            map.push(*range);
        }

        Ok(Self { ranges: map })
    }

    pub fn get_ranges(&self) -> &[PmRange] {
        &self.ranges
    }

    /// The last testable page number, exclusive.
    pub fn end_page(&self) -> usize {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    /// Returns the number of physical memory pages.
    pub fn page_count(&self) -> usize {
        self.get_ranges().iter().fold(0, |acc, range| acc + range.page_count())
    }

    /// Returns the total physical memory size in bytes.
    pub fn total_size(&self) -> usize {
        self.page_count() * PAGE_SIZE
    }

    /// Returns the total physical memory size in gibibytes, rounded down.
    pub fn total_size_in_gb(&self) -> usize {
        self.page_count() >> (30 - PAGE_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordered_ranges() {
        let map = PhysMemMap::new(&[
            PmRange { start: 0, end: 0xa0 },
            PmRange { start: 0x100, end: 0x8000 },
        ])
        .unwrap();

        assert_eq!(map.page_count(), 0xa0 + 0x7f00);
        assert_eq!(map.end_page(), 0x8000);
    }

    #[test]
    fn rejects_empty_and_unordered_maps() {
        assert!(PhysMemMap::new(&[]).is_err());
        assert!(PhysMemMap::new(&[PmRange { start: 5, end: 5 }]).is_err());
        assert!(PhysMemMap::new(&[
            PmRange { start: 0x100, end: 0x200 },
            PmRange { start: 0x150, end: 0x300 },
        ])
        .is_err());
    }
}
