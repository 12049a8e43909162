// SPDX-License-Identifier: GPL-2.0

//! Fixed-capacity ID pool backed by a bitmap.
//!
//! Channel ids and TSG ids are handed out from these. Unlike a growable pool, the capacity is
//! fixed by the hardware (number of CCSR channel slots), so running out is an allocation error.

/// Pool of small integer ids in `0..capacity`.
///
/// # Examples
///
/// ```ignore
/// let mut pool = IdPool::with_capacity(4);
/// assert_eq!(pool.acquire_next_id(0), Some(0));
/// assert_eq!(pool.acquire_next_id(0), Some(1));
/// pool.release_id(0);
/// assert_eq!(pool.acquire_next_id(0), Some(0));
/// ```
#[derive(Debug, Clone)]
pub(crate) struct IdPool {
    map: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl IdPool {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            map: vec![0; capacity.div_ceil(64)],
            capacity,
            used: 0,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of ids currently handed out.
    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub(crate) fn is_used(&self, id: usize) -> bool {
        id < self.capacity && self.map[id / 64] & (1 << (id % 64)) != 0
    }

    /// Finds the first unused id at or above `offset` and marks it used.
    pub(crate) fn acquire_next_id(&mut self, offset: usize) -> Option<usize> {
        let id = (offset..self.capacity).find(|&id| !self.is_used(id))?;
        self.map[id / 64] |= 1 << (id % 64);
        self.used += 1;

        Some(id)
    }

    /// Marks `id` as unused. Releasing an id that is not in use is a no-op.
    pub(crate) fn release_id(&mut self, id: usize) {
        if self.is_used(id) {
            self.map[id / 64] &= !(1 << (id % 64));
            self.used -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release() {
        let mut pool = IdPool::with_capacity(70);
        for i in 0..70 {
            assert_eq!(pool.acquire_next_id(0), Some(i));
        }
        assert_eq!(pool.acquire_next_id(0), None);
        assert_eq!(pool.used(), 70);

        pool.release_id(65);
        pool.release_id(65);
        assert_eq!(pool.used(), 69);
        assert_eq!(pool.acquire_next_id(0), Some(65));
    }

    #[test]
    fn offset_skips_low_ids() {
        let mut pool = IdPool::with_capacity(8);
        assert_eq!(pool.acquire_next_id(3), Some(3));
        assert_eq!(pool.acquire_next_id(0), Some(0));
        assert!(!pool.is_used(8));
    }
}
