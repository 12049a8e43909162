// SPDX-License-Identifier: GPL-2.0

//! Page directory cache.
//!
//! Most page directories of the GMMU tree are smaller than a page. The cache packs them into
//! shared pages, one page per size class, tracking the occupied slots of every page in a bitmap.
//! Directories of a page or more bypass the cache and get their own buffer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::dma::{Aperture, DmaAllocator, DmaObject, PAGE_SIZE};
use crate::error::{self, code::*, Result};

/// Smallest cached directory size.
pub(crate) const PD_CACHE_MIN: usize = 256;
const PD_CACHE_MIN_SHIFT: u32 = PD_CACHE_MIN.trailing_zeros();
/// Number of size classes: 256, 512, 1024 and 2048 bytes.
const PD_CACHE_COUNT: usize = 4;

/// Memory backing one page directory.
#[derive(Debug)]
pub(crate) enum PdMem {
    /// A slot of a page shared with other directories of the same size.
    Cached {
        mem: Arc<DmaObject>,
        offset: usize,
        size: usize,
    },
    /// A buffer of its own.
    Direct { mem: Arc<DmaObject> },
}

impl PdMem {
    pub(crate) fn mem(&self) -> &Arc<DmaObject> {
        match self {
            PdMem::Cached { mem, .. } | PdMem::Direct { mem } => mem,
        }
    }

    /// Offset of the directory in its backing buffer.
    pub(crate) fn offset(&self) -> usize {
        match self {
            PdMem::Cached { offset, .. } => *offset,
            PdMem::Direct { .. } => 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            PdMem::Cached { size, .. } => *size,
            PdMem::Direct { mem } => mem.size(),
        }
    }

    /// Address the GMMU uses to reach the directory.
    pub(crate) fn addr(&self) -> u64 {
        self.mem().addr() + self.offset() as u64
    }

    pub(crate) fn aperture(&self) -> Aperture {
        self.mem().aperture()
    }

    pub(crate) fn rd64(&self, offset: usize) -> u64 {
        self.mem().rd64(self.offset() + offset)
    }

    pub(crate) fn wr64(&self, offset: usize, value: u64) {
        self.mem().wr64(self.offset() + offset, value)
    }
}

/// A page split into directories of one size class.
struct CachePage {
    mem: Arc<DmaObject>,
    class: usize,
    /// One bit per slot.
    alloc_map: u16,
    nr_allocs: usize,
}

impl CachePage {
    fn slots(&self) -> usize {
        PAGE_SIZE >> (self.class as u32 + PD_CACHE_MIN_SHIFT)
    }

    fn is_full(&self) -> bool {
        self.nr_allocs == self.slots()
    }
}

#[derive(Default)]
struct PdCacheInner {
    partial: [VecDeque<u64>; PD_CACHE_COUNT],
    full: [VecDeque<u64>; PD_CACHE_COUNT],
    /// Backing pages, keyed by their address.
    pages: BTreeMap<u64, CachePage>,
}

/// Occupancy of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PdCacheStats {
    pub(crate) full_pages: usize,
    pub(crate) partial_pages: usize,
    pub(crate) slots_used: usize,
}

pub(crate) struct PdCache {
    dma: DmaAllocator,
    aperture: Aperture,
    inner: Mutex<PdCacheInner>,
}

/// Size class of a directory of `bytes` bytes, or `None` if it is not cached.
fn class_of(bytes: usize) -> Option<usize> {
    if bytes >= PAGE_SIZE {
        return None;
    }

    let rounded = bytes.max(PD_CACHE_MIN).next_power_of_two();
    Some((rounded.trailing_zeros() - PD_CACHE_MIN_SHIFT) as usize)
}

impl PdCache {
    /// Creates an empty cache allocating its pages from `dma` in `aperture`.
    pub(crate) fn new(dma: DmaAllocator, aperture: Aperture) -> Self {
        Self {
            dma,
            aperture,
            inner: Mutex::new(PdCacheInner::default()),
        }
    }

    pub(crate) fn aperture(&self) -> Aperture {
        self.aperture
    }

    /// Allocates a zeroed directory of at least `bytes` bytes.
    pub(crate) fn alloc(&self, bytes: usize) -> Result<PdMem> {
        if bytes == 0 {
            return Err(EINVAL);
        }

        let Some(class) = class_of(bytes) else {
            let mem = self.dma.alloc(bytes, self.aperture)?;
            return Ok(PdMem::Direct { mem });
        };

        let mut inner = error::lock(&self.inner);
        let inner = &mut *inner;

        let addr = match inner.partial[class].front().copied() {
            Some(addr) => addr,
            None => {
                let mem = self.dma.alloc(PAGE_SIZE, self.aperture)?;
                let addr = mem.addr();
                debug!(
                    "pd_cache: new page {:#x} for {} byte directories",
                    addr,
                    PD_CACHE_MIN << class
                );

                inner.pages.insert(
                    addr,
                    CachePage {
                        mem,
                        class,
                        alloc_map: 0,
                        nr_allocs: 0,
                    },
                );
                inner.partial[class].push_front(addr);
                addr
            }
        };

        let page = inner.pages.get_mut(&addr).ok_or(EINVAL)?;
        let slot = (!page.alloc_map).trailing_zeros() as usize;
        if slot >= page.slots() {
            return Err(EINVAL);
        }
        page.alloc_map |= 1 << slot;
        page.nr_allocs += 1;

        let size = PD_CACHE_MIN << class;
        let pd = PdMem::Cached {
            mem: page.mem.clone(),
            offset: slot * size,
            size,
        };
        // Slots are recycled, so they may hold stale entries.
        page.mem.memset(slot * size, 0, size)?;

        if page.is_full() {
            inner.partial[class].retain(|a| *a != addr);
            inner.full[class].push_back(addr);
        }

        Ok(pd)
    }

    /// Releases `pd`. Its backing page is freed along with its last directory.
    pub(crate) fn free(&self, pd: PdMem) {
        let (mem, offset) = match pd {
            PdMem::Direct { .. } => return,
            PdMem::Cached { mem, offset, .. } => (mem, offset),
        };

        let mut inner = error::lock(&self.inner);
        let inner = &mut *inner;
        let addr = mem.addr();

        let Some(page) = inner.pages.get_mut(&addr) else {
            warn!("pd_cache: free of unknown directory at {:#x}", addr);
            return;
        };
        let class = page.class;
        let slot = offset >> (class as u32 + PD_CACHE_MIN_SHIFT);
        let was_full = page.is_full();

        page.alloc_map &= !(1 << slot);
        page.nr_allocs -= 1;
        let empty = page.nr_allocs == 0;

        if was_full {
            inner.full[class].retain(|a| *a != addr);
            if !empty {
                inner.partial[class].push_back(addr);
            }
        }

        if empty {
            inner.partial[class].retain(|a| *a != addr);
            inner.pages.remove(&addr);
        }
    }

    /// Occupancy of the class serving directories of `bytes` bytes.
    pub(crate) fn stats(&self, bytes: usize) -> PdCacheStats {
        let Some(class) = class_of(bytes) else {
            return PdCacheStats::default();
        };
        let inner = error::lock(&self.inner);

        PdCacheStats {
            full_pages: inner.full[class].len(),
            partial_pages: inner.partial[class].len(),
            slots_used: inner
                .pages
                .values()
                .filter(|p| p.class == class)
                .map(|p| p.nr_allocs)
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache() -> (DmaAllocator, PdCache) {
        let dma = DmaAllocator::new(false, false);
        (dma.clone(), PdCache::new(dma, Aperture::Sysmem))
    }

    #[test]
    fn packs_seventeen_small_directories() {
        let (_, cache) = cache();
        let mut pds: Vec<PdMem> = (0..17).map(|_| cache.alloc(256).unwrap()).collect();

        assert_eq!(
            cache.stats(256),
            PdCacheStats {
                full_pages: 1,
                partial_pages: 1,
                slots_used: 17,
            }
        );

        // The first sixteen share the full page.
        let full_page = pds[0].mem().addr();
        assert!(pds[..16].iter().all(|pd| pd.mem().addr() == full_page));

        cache.free(pds.remove(3));
        assert_eq!(
            cache.stats(256),
            PdCacheStats {
                full_pages: 0,
                partial_pages: 2,
                slots_used: 16,
            }
        );

        for pd in pds {
            cache.free(pd);
        }
        assert_eq!(cache.stats(256), PdCacheStats::default());
    }

    #[test]
    fn round_trip_every_size() {
        for bytes in [256, 512, 1024, 2048, 4096] {
            let (dma, cache) = cache();
            let per_page = (PAGE_SIZE / bytes).max(1);
            let n = 3 * per_page + 1;
            let before = dma.total_allocs();

            let pds: Vec<PdMem> = (0..n).map(|_| cache.alloc(bytes).unwrap()).collect();
            for (i, pd) in pds.iter().enumerate() {
                assert_eq!(pd.size(), bytes);
                for off in (0..bytes).step_by(8) {
                    pd.wr64(off, (i as u64) << 32 | off as u64);
                }
            }
            for (i, pd) in pds.iter().enumerate() {
                for off in (0..bytes).step_by(8) {
                    assert_eq!(pd.rd64(off), (i as u64) << 32 | off as u64);
                }
            }

            assert!(dma.total_allocs() - before <= (n * bytes).div_ceil(PAGE_SIZE));

            let live = dma.live_allocs();
            for pd in pds {
                cache.free(pd);
            }
            if bytes < PAGE_SIZE {
                assert_eq!(dma.live_allocs(), live - n.div_ceil(per_page));
            }
        }
    }

    #[test]
    fn reused_slot_is_zeroed() {
        let (_, cache) = cache();
        let keep = cache.alloc(512).unwrap();
        let pd = cache.alloc(512).unwrap();
        pd.wr64(0, u64::MAX);
        let offset = pd.offset();
        cache.free(pd);

        let pd = cache.alloc(512).unwrap();
        assert_eq!(pd.offset(), offset);
        assert_eq!(pd.rd64(0), 0);
        cache.free(pd);
        cache.free(keep);
    }

    #[test]
    fn odd_sizes_round_up() {
        assert_eq!(class_of(32), Some(0));
        assert_eq!(class_of(257), Some(1));
        assert_eq!(class_of(2048), Some(3));
        assert_eq!(class_of(4096), None);
    }
}
