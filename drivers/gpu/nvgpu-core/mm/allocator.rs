// SPDX-License-Identifier: GPL-2.0

//! First-fit allocator for GPU virtual address ranges.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{code::*, Result};
use crate::util::align_up;

/// Allocator over a fixed VA range. Free space is kept as a map from start to end, with adjacent
/// holes always merged.
#[derive(Debug)]
pub(crate) struct VaAllocator {
    range: Range<u64>,
    free: BTreeMap<u64, u64>,
}

impl VaAllocator {
    pub(crate) fn new(range: Range<u64>) -> Self {
        let mut free = BTreeMap::new();
        if !range.is_empty() {
            free.insert(range.start, range.end);
        }

        Self { range, free }
    }

    pub(crate) fn range(&self) -> &Range<u64> {
        &self.range
    }

    pub(crate) fn contains(&self, va: u64) -> bool {
        self.range.contains(&va)
    }

    /// Allocates `size` bytes aligned to `align`, which must be a power of two.
    pub(crate) fn alloc(&mut self, size: u64, align: u64) -> Result<u64> {
        if size == 0 || !align.is_power_of_two() {
            return Err(EINVAL);
        }

        let start = self
            .free
            .iter()
            .map(|(&start, &end)| (align_up(start, align), end))
            .find(|&(start, end)| start.checked_add(size).is_some_and(|e| e <= end))
            .map(|(start, _)| start)
            .ok_or(ENOMEM)?;

        self.carve(start, size)?;

        Ok(start)
    }

    /// Allocates exactly `start..start + size`.
    pub(crate) fn alloc_fixed(&mut self, start: u64, size: u64) -> Result {
        if size == 0 {
            return Err(EINVAL);
        }

        self.carve(start, size)
    }

    fn carve(&mut self, start: u64, size: u64) -> Result {
        let end = start.checked_add(size).ok_or(EINVAL)?;
        let (&hole_start, &hole_end) = self.free.range(..=start).next_back().ok_or(EBUSY)?;
        if end > hole_end {
            return Err(EBUSY);
        }

        self.free.remove(&hole_start);
        if hole_start < start {
            self.free.insert(hole_start, start);
        }
        if end < hole_end {
            self.free.insert(end, hole_end);
        }

        Ok(())
    }

    /// Returns `start..start + size` to the free space.
    pub(crate) fn free(&mut self, start: u64, size: u64) {
        let mut start = start;
        let mut end = start + size;

        if let Some((&prev_start, &prev_end)) = self.free.range(..start).next_back() {
            if prev_end == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.free.remove(&end) {
            end = next_end;
        }

        self.free.insert(start, end);
    }

    /// Total free bytes.
    pub(crate) fn available(&self) -> u64 {
        self.free.iter().map(|(s, e)| e - s).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_with_alignment() {
        let mut a = VaAllocator::new(0x1000..0x100000);

        assert_eq!(a.alloc(0x1000, 0x1000), Ok(0x1000));
        assert_eq!(a.alloc(0x1000, 0x10000), Ok(0x10000));
        // The hole left below the aligned allocation is still used.
        assert_eq!(a.alloc(0x2000, 0x1000), Ok(0x2000));
    }

    #[test]
    fn free_coalesces() {
        let mut a = VaAllocator::new(0..0x10000);
        let x = a.alloc(0x4000, 0x1000).unwrap();
        let y = a.alloc(0x4000, 0x1000).unwrap();
        let z = a.alloc(0x4000, 0x1000).unwrap();

        a.free(x, 0x4000);
        a.free(z, 0x4000);
        a.free(y, 0x4000);

        assert_eq!(a.available(), 0x10000);
        assert_eq!(a.alloc(0x10000, 0x1000), Ok(0));
    }

    #[test]
    fn exhaustion_and_fixed() {
        let mut a = VaAllocator::new(0..0x4000);
        assert_eq!(a.alloc_fixed(0x1000, 0x1000), Ok(()));
        assert_eq!(a.alloc_fixed(0x1800, 0x1000), Err(EBUSY));
        assert_eq!(a.alloc(0x2000, 0x1000), Ok(0x2000));
        assert_eq!(a.alloc(0x2000, 0x1000), Err(ENOMEM));
    }
}
