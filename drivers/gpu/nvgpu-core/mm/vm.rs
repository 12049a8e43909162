// SPDX-License-Identifier: GPL-2.0

//! GPU virtual address spaces.
//!
//! A [`Vm`] owns a GMMU page table tree and the allocators handing out its address ranges.
//! User mappings come from the small page region or, for suitably sized and aligned buffers,
//! from the big page region. Driver buffers are mapped in the kernel region at the top.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use log::{debug, warn};

use crate::dma::{Aperture, DmaObject};
use crate::error::{self, code::*, Result};
use crate::mm::allocator::VaAllocator;
use crate::mm::gmmu::{
    self, pt_level, PageSize, PteAttrs, IOMMU_BIT, PDE0_BIG_OFFSET, PDE0_SMALL_OFFSET, PD_LEVELS,
    PTE_SPARSE, SMALL_PAGE_SIZE,
};
use crate::mm::pd_cache::{PdCache, PdMem};
use crate::mm::Mm;

const SZ_1G: u64 = 1 << 30;

/// Unmapped area at the bottom of every address space.
pub const VA_LOW_HOLE: u64 = 64 << 10;
/// Top of the small page region when small and big pages have separate regions.
pub const VA_SMALL_END: u64 = 56 * SZ_1G;
/// Start of the driver-only region.
pub const VA_KERNEL_START: u64 = 124 * SZ_1G;
pub const VA_SIZE: u64 = 128 * SZ_1G;

bitflags! {
    /// Mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        const READ_ONLY = 1 << 0;
        /// Only privileged engine accesses (context switch firmware) may use the mapping.
        const PRIV = 1 << 1;
        const CACHEABLE = 1 << 2;
        /// Map in the driver-only region.
        const KERNEL = 1 << 3;
    }
}

/// Driver mappings shared by every channel of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SyncMap {
    SemaphoreRo,
    SemaphoreRw,
    SyncptRo,
    SyncptRw,
}

struct PdNode {
    mem: PdMem,
    /// Children keyed by entry index. Dual PD0 entries use `index << 1 | is_big`.
    children: BTreeMap<usize, PdNode>,
}

impl PdNode {
    fn new(mem: PdMem) -> Self {
        Self {
            mem,
            children: BTreeMap::new(),
        }
    }

    fn free(self, cache: &PdCache) {
        for child in self.children.into_values() {
            child.free(cache);
        }
        cache.free(self.mem);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Small,
    Big,
    Kernel,
}

struct Mapping {
    mem: Option<Arc<DmaObject>>,
    size: u64,
    pgsz: PageSize,
    region: Region,
}

struct VmInner {
    root: Option<PdNode>,
    small: VaAllocator,
    big: Option<VaAllocator>,
    kernel: VaAllocator,
    mappings: BTreeMap<u64, Mapping>,
    sync: BTreeMap<SyncMap, u64>,
}

impl VmInner {
    fn allocator(&mut self, region: Region) -> Result<&mut VaAllocator> {
        match region {
            Region::Small => Ok(&mut self.small),
            Region::Big => self.big.as_mut().ok_or(EINVAL),
            Region::Kernel => Ok(&mut self.kernel),
        }
    }
}

/// A GPU virtual address space.
pub struct Vm {
    mm: Arc<Mm>,
    name: String,
    big_page_size: u32,
    pdb_addr: u64,
    pdb_aperture: Aperture,
    inner: Mutex<VmInner>,
}

/// Returns the page table node covering `va`, allocating the missing directories on the way if
/// `alloc` is set.
fn walk<'a>(
    mm: &Mm,
    root: &'a mut PdNode,
    va: u64,
    pgsz: PageSize,
    alloc: bool,
) -> Result<Option<&'a mut PdNode>> {
    let mut node = root;

    for (i, level) in PD_LEVELS.iter().enumerate() {
        let idx = level.index(va);
        let is_pd0 = i == PD_LEVELS.len() - 1;
        let key = if is_pd0 {
            (idx << 1) | usize::from(pgsz == PageSize::Big)
        } else {
            idx
        };

        if !node.children.contains_key(&key) {
            if !alloc {
                return Ok(None);
            }

            let (size, entry_off) = if is_pd0 {
                let half = match pgsz {
                    PageSize::Big => PDE0_BIG_OFFSET,
                    PageSize::Small => PDE0_SMALL_OFFSET,
                };
                (pt_level(pgsz).size(), idx * level.entry_size + half)
            } else {
                (PD_LEVELS[i + 1].size(), idx * level.entry_size)
            };

            let mem = mm.pd_cache.alloc(size)?;
            node.mem.wr64(
                entry_off,
                gmmu::pde(mm.honors_aperture, mem.aperture(), mem.addr()),
            );
            node.children.insert(key, PdNode::new(mem));
        }

        node = node.children.get_mut(&key).ok_or(EINVAL)?;
    }

    Ok(Some(node))
}

impl Vm {
    /// Creates an address space using big pages of `big_page_size` bytes, or the device default if
    /// zero.
    pub(crate) fn new(mm: &Arc<Mm>, big_page_size: u32, name: &str) -> Result<Arc<Self>> {
        let big_page_size = match big_page_size {
            0 => mm.default_big_page_size,
            size if size.is_power_of_two() && u64::from(size) > SMALL_PAGE_SIZE => size,
            _ => return Err(EINVAL),
        };

        let root = mm.pd_cache.alloc(PD_LEVELS[0].size())?;
        let pdb_addr = root.addr();
        let pdb_aperture = root.aperture();

        let (small, big) = if mm.unified_va {
            (VaAllocator::new(VA_LOW_HOLE..VA_KERNEL_START), None)
        } else {
            (
                VaAllocator::new(VA_LOW_HOLE..VA_SMALL_END),
                Some(VaAllocator::new(VA_SMALL_END..VA_KERNEL_START)),
            )
        };

        debug!(
            "vm {}: pdb {:#x}, big pages {:#x}",
            name, pdb_addr, big_page_size
        );

        Ok(Arc::new(Self {
            mm: mm.clone(),
            name: name.to_owned(),
            big_page_size,
            pdb_addr,
            pdb_aperture,
            inner: Mutex::new(VmInner {
                root: Some(PdNode::new(root)),
                small,
                big,
                kernel: VaAllocator::new(VA_KERNEL_START..VA_SIZE),
                mappings: BTreeMap::new(),
                sync: BTreeMap::new(),
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn big_page_size(&self) -> u32 {
        self.big_page_size
    }

    /// Address of the root page directory.
    pub fn pdb_addr(&self) -> u64 {
        self.pdb_addr
    }

    pub fn pdb_aperture(&self) -> Aperture {
        self.pdb_aperture
    }

    pub(crate) fn mm(&self) -> &Arc<Mm> {
        &self.mm
    }

    /// Page size to map `mem` with.
    fn page_size_for(&self, mem: &DmaObject, flags: MapFlags) -> PageSize {
        let big = u64::from(self.big_page_size);

        if flags.contains(MapFlags::KERNEL) {
            return PageSize::Small;
        }
        if mem.size() as u64 % big == 0 && mem.sgt().alignment(self.mm.iommu_bypass) >= big {
            PageSize::Big
        } else {
            PageSize::Small
        }
    }

    fn region_for(&self, pgsz: PageSize, flags: MapFlags) -> Region {
        if flags.contains(MapFlags::KERNEL) {
            Region::Kernel
        } else if pgsz == PageSize::Big && !self.mm.unified_va {
            Region::Big
        } else {
            Region::Small
        }
    }

    /// Address ranges the GMMU should use for `mem`, as `(address, length)` pairs.
    fn gpu_ranges(&self, mem: &DmaObject) -> Vec<(u64, u64)> {
        let sgt = mem.sgt();

        if mem.aperture().is_sysmem() && sgt.is_iommuable() && !self.mm.iommu_bypass {
            let first = sgt.chunks().first().map_or(0, |c| c.dma);
            return vec![(first | IOMMU_BIT, sgt.len())];
        }

        sgt.chunks().iter().map(|c| (c.phys, c.len)).collect()
    }

    /// Writes one PTE per page of `ranges`, starting at `va`. Returns the number of pages written.
    fn write_ptes(
        &self,
        inner: &mut VmInner,
        va: u64,
        pgsz: PageSize,
        ranges: &[(u64, u64)],
        entry: impl Fn(u64) -> u64,
    ) -> (u64, Result) {
        let page = pgsz.bytes(u64::from(self.big_page_size));
        let Some(root) = inner.root.as_mut() else {
            return (0, Err(EINVAL));
        };
        let mut written = 0;

        for &(addr, len) in ranges {
            for off in (0..len).step_by(page as usize) {
                let cur = va + written * page;
                let pt = match walk(&self.mm, root, cur, pgsz, true) {
                    Ok(Some(pt)) => pt,
                    Ok(None) => return (written, Err(EINVAL)),
                    Err(e) => return (written, Err(e)),
                };
                let idx = pt_level(pgsz).index(cur);
                pt.mem.wr64(idx * 8, entry(addr + off));
                written += 1;
            }
        }

        (written, Ok(()))
    }

    /// Clears `pages` PTEs starting at `va`.
    fn clear_ptes(&self, inner: &mut VmInner, va: u64, pgsz: PageSize, pages: u64) {
        let page = pgsz.bytes(u64::from(self.big_page_size));
        let Some(root) = inner.root.as_mut() else {
            return;
        };

        for i in 0..pages {
            let cur = va + i * page;
            if let Ok(Some(pt)) = walk(&self.mm, root, cur, pgsz, false) {
                pt.mem.wr64(pt_level(pgsz).index(cur) * 8, 0);
            }
        }
    }

    fn do_map(
        &self,
        inner: &mut VmInner,
        fixed: Option<u64>,
        mem: &Arc<DmaObject>,
        flags: MapFlags,
        kind: u8,
    ) -> Result<u64> {
        let pgsz = self.page_size_for(mem, flags);
        let region = self.region_for(pgsz, flags);
        let page = pgsz.bytes(u64::from(self.big_page_size));
        let size = (mem.size() as u64).next_multiple_of(page);

        let va = match fixed {
            Some(va) => {
                if va % page != 0 {
                    return Err(EINVAL);
                }
                inner.allocator(region)?.alloc_fixed(va, size)?;
                va
            }
            None => inner.allocator(region)?.alloc(size, page)?,
        };

        let attrs = PteAttrs {
            kind,
            cacheable: flags.contains(MapFlags::CACHEABLE),
            read_only: flags.contains(MapFlags::READ_ONLY),
            privileged: flags.contains(MapFlags::PRIV),
        };
        let honors = self.mm.honors_aperture;
        let aperture = mem.aperture();
        let ranges = self.gpu_ranges(mem);

        let (written, res) = self.write_ptes(inner, va, pgsz, &ranges, |addr| {
            gmmu::pte(honors, aperture, addr, attrs)
        });
        if let Err(e) = res {
            self.clear_ptes(inner, va, pgsz, written);
            if let Ok(a) = inner.allocator(region) {
                a.free(va, size);
            }
            warn!("vm {}: mapping of {:#x} bytes failed: {:?}", self.name, size, e);
            return Err(e);
        }

        inner.mappings.insert(
            va,
            Mapping {
                mem: Some(mem.clone()),
                size,
                pgsz,
                region,
            },
        );
        if mem.gpu_va() == 0 {
            mem.set_gpu_va(va);
        }

        Ok(va)
    }

    /// Maps `mem` at an address of the allocator's choosing and returns it.
    pub fn map(&self, mem: &Arc<DmaObject>, flags: MapFlags, kind: u8) -> Result<u64> {
        let mut inner = error::lock(&self.inner);
        self.do_map(&mut inner, None, mem, flags, kind)
    }

    /// Maps `mem` at `va`.
    pub fn map_fixed(&self, va: u64, mem: &Arc<DmaObject>, flags: MapFlags, kind: u8) -> Result<u64> {
        let mut inner = error::lock(&self.inner);
        self.do_map(&mut inner, Some(va), mem, flags, kind)
    }

    /// Reserves `size` bytes of small pages whose accesses neither fault nor reach memory.
    pub fn map_sparse(&self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(EINVAL);
        }

        let mut inner = error::lock(&self.inner);
        let size = size.next_multiple_of(SMALL_PAGE_SIZE);
        let va = inner.small.alloc(size, SMALL_PAGE_SIZE)?;

        let (written, res) =
            self.write_ptes(&mut inner, va, PageSize::Small, &[(0, size)], |_| PTE_SPARSE);
        if let Err(e) = res {
            self.clear_ptes(&mut inner, va, PageSize::Small, written);
            inner.small.free(va, size);
            return Err(e);
        }

        inner.mappings.insert(
            va,
            Mapping {
                mem: None,
                size,
                pgsz: PageSize::Small,
                region: Region::Small,
            },
        );

        Ok(va)
    }

    /// Removes the mapping starting at `va` and invalidates the TLBs.
    pub fn unmap(&self, va: u64) -> Result {
        let mut inner = error::lock(&self.inner);
        let mapping = inner.mappings.remove(&va).ok_or(EINVAL)?;

        let pages = mapping.size / mapping.pgsz.bytes(u64::from(self.big_page_size));
        self.clear_ptes(&mut inner, va, mapping.pgsz, pages);
        inner.allocator(mapping.region)?.free(va, mapping.size);

        if let Some(mem) = &mapping.mem {
            if mem.gpu_va() == va {
                mem.set_gpu_va(0);
            }
        }
        inner.sync.retain(|_, v| *v != va);
        drop(inner);

        self.mm.tlb_invalidate(self.pdb_addr, self.pdb_aperture)
    }

    /// Buffer mapped at `va` and the offset of `va` in it.
    pub fn lookup(&self, va: u64) -> Option<(Arc<DmaObject>, usize)> {
        let inner = error::lock(&self.inner);
        let (&start, mapping) = inner.mappings.range(..=va).next_back()?;
        if va >= start + mapping.size {
            return None;
        }
        let mem = mapping.mem.as_ref()?;
        let offset = (va - start) as usize;

        (offset < mem.size()).then(|| (mem.clone(), offset))
    }

    /// Raw PTE mapping `va`, if its page table exists.
    pub(crate) fn pte(&self, va: u64) -> Option<u64> {
        let mut inner = error::lock(&self.inner);
        let pgsz = {
            let (&start, mapping) = inner.mappings.range(..=va).next_back()?;
            if va >= start + mapping.size {
                return None;
            }
            mapping.pgsz
        };
        let root = inner.root.as_mut()?;
        let pt = walk(&self.mm, root, va, pgsz, false).ok()??;

        Some(pt.mem.rd64(pt_level(pgsz).index(va) * 8))
    }

    /// Returns the VA of the shared driver mapping `which`, mapping `mem` on first use.
    pub(crate) fn sync_map(&self, which: SyncMap, mem: &Arc<DmaObject>) -> Result<u64> {
        let mut inner = error::lock(&self.inner);
        if let Some(va) = inner.sync.get(&which) {
            return Ok(*va);
        }

        let flags = match which {
            SyncMap::SemaphoreRo | SyncMap::SyncptRo => MapFlags::KERNEL | MapFlags::READ_ONLY,
            SyncMap::SemaphoreRw | SyncMap::SyncptRw => MapFlags::KERNEL | MapFlags::CACHEABLE,
        };
        let va = self.do_map(&mut inner, None, mem, flags, 0)?;
        inner.sync.insert(which, va);

        Ok(va)
    }

    /// VA of the shared driver mapping `which`, if it exists.
    pub(crate) fn sync_va(&self, which: SyncMap) -> Option<u64> {
        error::lock(&self.inner).sync.get(&which).copied()
    }

    /// Number of live mappings.
    pub fn mapping_count(&self) -> usize {
        error::lock(&self.inner).mappings.len()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(root) = inner.root.take() {
            root.free(&self.mm.pd_cache);
        }
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("name", &self.name)
            .field("pdb", &format_args!("{:#x}", self.pdb_addr))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuConfig;
    use crate::dma::DmaAllocator;
    use crate::gpu::Chipset;
    use crate::mm::gmmu::{entry_addr, pte_is_valid, pte_read_only, BIG_PAGE_SIZE_64K};
    use crate::sim::Sim;

    fn mm(sim: &Sim, config: &GpuConfig, is_dgpu: bool) -> Arc<Mm> {
        let dma = DmaAllocator::new(false, config.pramin_enabled);
        Arc::new(Mm::new(sim.bar(), dma, config, is_dgpu))
    }

    #[test]
    fn small_and_big_mappings() {
        let sim = Sim::new(Chipset::GV11B);
        let mm = mm(&sim, &GpuConfig::default(), false);
        let vm = Vm::new(&mm, 0, "test").unwrap();

        let small = mm.dma.alloc(0x3000, Aperture::Sysmem).unwrap();
        let va = vm.map(&small, MapFlags::empty(), 0).unwrap();
        assert!((VA_LOW_HOLE..VA_SMALL_END).contains(&va));
        assert_eq!(small.gpu_va(), va);

        let pte = vm.pte(va + 0x2000).unwrap();
        assert!(pte_is_valid(pte));
        assert_eq!(entry_addr(pte), small.phys() + 0x2000);

        let big = mm.dma.alloc(0x20000, Aperture::Sysmem).unwrap();
        let bva = vm.map(&big, MapFlags::READ_ONLY, 0).unwrap();
        assert!((VA_SMALL_END..VA_KERNEL_START).contains(&bva));
        assert_eq!(bva % BIG_PAGE_SIZE_64K, 0);
        let pte = vm.pte(bva + BIG_PAGE_SIZE_64K).unwrap();
        assert_eq!(entry_addr(pte), big.phys() + BIG_PAGE_SIZE_64K);
        assert!(pte_read_only(pte));

        let (mem, off) = vm.lookup(va + 0x1004).unwrap();
        assert!(Arc::ptr_eq(&mem, &small));
        assert_eq!(off, 0x1004);
    }

    #[test]
    fn unified_va_uses_one_region() {
        let sim = Sim::new(Chipset::GV11B);
        let config = GpuConfig {
            unified_va: true,
            ..Default::default()
        };
        let mm = mm(&sim, &config, false);
        let vm = Vm::new(&mm, 0, "unified").unwrap();

        let big = mm.dma.alloc(0x20000, Aperture::Sysmem).unwrap();
        let va = vm.map(&big, MapFlags::empty(), 0).unwrap();
        assert!(va < VA_SMALL_END);
        assert_eq!(va % BIG_PAGE_SIZE_64K, 0);
    }

    #[test]
    fn unmap_clears_ptes_and_frees_va() {
        let sim = Sim::new(Chipset::GV11B);
        let mm = mm(&sim, &GpuConfig::default(), false);
        let vm = Vm::new(&mm, 0, "test").unwrap();
        let mem = mm.dma.alloc(0x1000, Aperture::Sysmem).unwrap();

        let va = vm.map(&mem, MapFlags::empty(), 0).unwrap();
        vm.unmap(va).unwrap();

        assert!(vm.lookup(va).is_none());
        assert_eq!(vm.mapping_count(), 0);
        assert_eq!(mem.gpu_va(), 0);
        assert_eq!(vm.unmap(va), Err(EINVAL));
        assert_eq!(vm.map(&mem, MapFlags::empty(), 0), Ok(va));
    }

    #[test]
    fn sparse_ptes_are_invalid_but_volatile() {
        let sim = Sim::new(Chipset::GV11B);
        let mm = mm(&sim, &GpuConfig::default(), false);
        let vm = Vm::new(&mm, 0, "test").unwrap();

        let va = vm.map_sparse(0x2000).unwrap();
        assert_eq!(vm.pte(va + 0x1000), Some(PTE_SPARSE));
        assert!(vm.lookup(va).is_none());
    }

    #[test]
    fn failed_directory_alloc_unwinds() {
        let sim = Sim::new(Chipset::GV11B);
        let mm = mm(&sim, &GpuConfig::default(), false);
        let vm = Vm::new(&mm, 0, "test").unwrap();
        let mem = mm.dma.alloc(0x1000, Aperture::Sysmem).unwrap();

        mm.dma.fail_after(Some(0));
        assert_eq!(vm.map(&mem, MapFlags::empty(), 0), Err(ENOMEM));
        mm.dma.fail_after(None);

        assert_eq!(vm.mapping_count(), 0);
        assert_eq!(vm.map(&mem, MapFlags::empty(), 0), Ok(VA_LOW_HOLE));
    }

    #[test]
    fn directories_return_to_cache_on_drop() {
        let sim = Sim::new(Chipset::GV11B);
        let mm = mm(&sim, &GpuConfig::default(), false);
        let live = mm.dma.live_allocs();

        let vm = Vm::new(&mm, 0, "test").unwrap();
        let mem = mm.dma.alloc(0x1000, Aperture::Sysmem).unwrap();
        vm.map(&mem, MapFlags::empty(), 0).unwrap();
        drop(vm);
        drop(mem);

        assert_eq!(mm.dma.live_allocs(), live);
    }

    #[test]
    fn kernel_mappings_stay_high() {
        let sim = Sim::new(Chipset::GV11B);
        let mm = mm(&sim, &GpuConfig::default(), false);
        let vm = Vm::new(&mm, 0, "test").unwrap();
        let mem = mm.dma.alloc(0x1000, Aperture::Sysmem).unwrap();

        let va = vm.sync_map(SyncMap::SemaphoreRo, &mem).unwrap();
        assert!(va >= VA_KERNEL_START);
        assert_eq!(vm.sync_map(SyncMap::SemaphoreRo, &mem), Ok(va));
        assert_eq!(vm.sync_va(SyncMap::SemaphoreRw), None);
    }
}
