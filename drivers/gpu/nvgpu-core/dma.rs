// SPDX-License-Identifier: GPL-2.0

//! DMA buffers.
//!
//! A [`DmaObject`] is a buffer the GPU can reach through one of two apertures: system memory or,
//! on discrete parts, video memory. CPU accesses to video memory go through the PRAMIN window,
//! which is shared by the whole device and serialized with a spinlock.

use std::sync::atomic::{self, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};

use crate::error::{code::*, Result};
use crate::util;

pub(crate) const PAGE_SIZE: usize = 4096;

/// Size of the PRAMIN window into video memory.
const PRAMIN_WINDOW_SIZE: u64 = 1 << 20;

const SYSMEM_PHYS_BASE: u64 = 0x1_0000_0000;
const SYSMEM_IOVA_BASE: u64 = 0x0010_0000;
const VIDMEM_PHYS_BASE: u64 = 0x1000_0000;

/// Memory a buffer lives in, as seen by the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aperture {
    /// Non-coherent system memory.
    Sysmem,
    /// Coherent system memory.
    SysmemCoh,
    /// Video memory. Only present on discrete GPUs.
    Vidmem,
}

impl Aperture {
    pub fn is_sysmem(self) -> bool {
        matches!(self, Aperture::Sysmem | Aperture::SysmemCoh)
    }
}

/// Selects which of `sysmem`, `sysmem_coh` or `vidmem` to emit into a hardware descriptor for
/// `aperture`.
///
/// GPUs that do not honor the aperture field (integrated parts, where all memory is system
/// memory) expect system memory to be described as video memory.
pub(crate) fn aperture_mask_raw(
    honors_aperture: bool,
    aperture: Aperture,
    sysmem: u32,
    sysmem_coh: u32,
    vidmem: u32,
) -> u32 {
    let aperture = if !honors_aperture && aperture.is_sysmem() {
        Aperture::Vidmem
    } else {
        aperture
    };

    match aperture {
        Aperture::Sysmem => sysmem,
        Aperture::SysmemCoh => sysmem_coh,
        Aperture::Vidmem => vidmem,
    }
}

/// One physically contiguous piece of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgChunk {
    /// CPU physical address.
    pub phys: u64,
    /// Bus address after IOMMU translation. Equal to `phys` when there is no IOMMU.
    pub dma: u64,
    pub len: u64,
}

/// Scatter-gather description of a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    chunks: Vec<SgChunk>,
}

impl SgTable {
    pub fn new(chunks: Vec<SgChunk>) -> Self {
        Self { chunks }
    }

    pub fn chunks(&self) -> &[SgChunk] {
        &self.chunks
    }

    /// Whether the buffer is reached through an IOMMU.
    pub fn is_iommuable(&self) -> bool {
        self.chunks.first().is_some_and(|c| c.dma != c.phys)
    }

    /// Largest power of two that every chunk of the buffer is aligned to.
    ///
    /// An IOMMU-mapped buffer is contiguous in bus address space, so only its start address
    /// matters. Otherwise each chunk contributes the lowest set bit of `phys | len`.
    pub fn alignment(&self, iommu_bypassed: bool) -> u64 {
        if self.is_iommuable() && !iommu_bypassed {
            if let Some(first) = self.chunks.first() {
                if first.dma != 0 {
                    return 1 << first.dma.trailing_zeros();
                }
            }
        }

        self.chunks
            .iter()
            .map(|c| 1u64 << (c.phys | c.len).trailing_zeros().min(63))
            .min()
            .unwrap_or(0)
    }

    pub fn len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len).sum()
    }
}

bitflags! {
    /// Allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaFlags: u32 {
        /// Do not issue a write barrier after CPU writes. Only for buffers the CPU never reads
        /// back after writing.
        const SKIP_WMB = 1 << 0;
    }
}

struct PraminWindow {
    base: u64,
}

struct DmaShared {
    next_sysmem: AtomicU64,
    next_iova: AtomicU64,
    next_vidmem: AtomicU64,
    iommu: bool,
    pramin_enabled: bool,
    pramin: spin::Mutex<PraminWindow>,
    total_allocs: AtomicUsize,
    live_allocs: AtomicUsize,
    /// Remaining allocations before injected failure, negative for never.
    fail_after: AtomicIsize,
}

/// Allocator for [`DmaObject`]s, shared by every subsystem of a device.
#[derive(Clone)]
pub struct DmaAllocator {
    shared: Arc<DmaShared>,
}

impl DmaAllocator {
    /// Creates an allocator. `iommu` gives system memory buffers bus addresses distinct from
    /// their physical addresses. `pramin_enabled` routes CPU access to video memory through the
    /// PRAMIN window.
    pub fn new(iommu: bool, pramin_enabled: bool) -> Self {
        Self {
            shared: Arc::new(DmaShared {
                next_sysmem: AtomicU64::new(SYSMEM_PHYS_BASE),
                next_iova: AtomicU64::new(SYSMEM_IOVA_BASE),
                next_vidmem: AtomicU64::new(VIDMEM_PHYS_BASE),
                iommu,
                pramin_enabled,
                pramin: spin::Mutex::new(PraminWindow { base: 0 }),
                total_allocs: AtomicUsize::new(0),
                live_allocs: AtomicUsize::new(0),
                fail_after: AtomicIsize::new(-1),
            }),
        }
    }

    fn reserve(&self) -> Result {
        let shared = &self.shared;
        let left = shared.fail_after.load(Ordering::Relaxed);
        if left == 0 {
            return Err(ENOMEM);
        }
        if left > 0 {
            shared.fail_after.store(left - 1, Ordering::Relaxed);
        }

        shared.total_allocs.fetch_add(1, Ordering::Relaxed);
        shared.live_allocs.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn bump(counter: &AtomicU64, len: u64, align: u64) -> u64 {
        let mut cur = counter.load(Ordering::Relaxed);
        loop {
            let start = util::align_up(cur, align);
            match counter.compare_exchange(cur, start + len, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return start,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Allocates a zeroed buffer of at least `size` bytes, rounded up to a page.
    pub fn alloc(&self, size: usize, aperture: Aperture) -> Result<Arc<DmaObject>> {
        self.alloc_flags(size, aperture, DmaFlags::empty())
    }

    pub fn alloc_flags(
        &self,
        size: usize,
        aperture: Aperture,
        flags: DmaFlags,
    ) -> Result<Arc<DmaObject>> {
        if size == 0 {
            return Err(EINVAL);
        }
        let len = size.next_multiple_of(PAGE_SIZE) as u64;
        // Naturally align buffers up to 2 MiB so that large buffers can use big pages.
        let align = len.next_power_of_two().clamp(PAGE_SIZE as u64, 1 << 21);

        self.reserve()?;

        let chunk = self.place(len, align, aperture);

        Ok(Arc::new(DmaObject {
            shared: self.shared.clone(),
            size: len as usize,
            aperture,
            sgt: SgTable::new(vec![chunk]),
            mem: Some(spin::Mutex::new(vec![0; len as usize])),
            gpu_va: AtomicU64::new(0),
            skip_wmb: flags.contains(DmaFlags::SKIP_WMB),
            counted: true,
        }))
    }

    /// Allocates a buffer made of several physically discontiguous chunks of the given sizes.
    pub fn alloc_sg(&self, chunk_sizes: &[usize], aperture: Aperture) -> Result<Arc<DmaObject>> {
        if chunk_sizes.is_empty() || chunk_sizes.iter().any(|s| s % PAGE_SIZE != 0 || *s == 0) {
            return Err(EINVAL);
        }

        self.reserve()?;

        let chunks: Vec<SgChunk> = chunk_sizes
            .iter()
            .map(|&s| {
                let chunk = self.place(s as u64, PAGE_SIZE as u64, aperture);
                // Leave a hole so that chunks never merge.
                self.place(PAGE_SIZE as u64, PAGE_SIZE as u64, aperture);
                chunk
            })
            .collect();
        let size: usize = chunk_sizes.iter().sum();

        Ok(Arc::new(DmaObject {
            shared: self.shared.clone(),
            size,
            aperture,
            sgt: SgTable::new(chunks),
            mem: Some(spin::Mutex::new(vec![0; size])),
            gpu_va: AtomicU64::new(0),
            skip_wmb: false,
            counted: true,
        }))
    }

    fn place(&self, len: u64, align: u64, aperture: Aperture) -> SgChunk {
        let shared = &self.shared;
        match aperture {
            Aperture::Vidmem => {
                let phys = Self::bump(&shared.next_vidmem, len, align);
                SgChunk { phys, dma: phys, len }
            }
            Aperture::Sysmem | Aperture::SysmemCoh => {
                let phys = Self::bump(&shared.next_sysmem, len, align);
                let dma = if shared.iommu {
                    Self::bump(&shared.next_iova, len, align)
                } else {
                    phys
                };
                SgChunk { phys, dma, len }
            }
        }
    }

    /// Describes an existing physical range (e.g. a register aperture) as a buffer that can be
    /// mapped into GPU address spaces. The CPU cannot access it through the returned object.
    pub fn wrap_phys(&self, phys: u64, size: usize, aperture: Aperture) -> Arc<DmaObject> {
        Arc::new(DmaObject {
            shared: self.shared.clone(),
            size,
            aperture,
            sgt: SgTable::new(vec![SgChunk {
                phys,
                dma: phys,
                len: size as u64,
            }]),
            mem: None,
            gpu_va: AtomicU64::new(0),
            skip_wmb: true,
            counted: false,
        })
    }

    /// Number of buffers allocated since creation.
    pub fn total_allocs(&self) -> usize {
        self.shared.total_allocs.load(Ordering::Relaxed)
    }

    /// Number of buffers currently alive.
    pub fn live_allocs(&self) -> usize {
        self.shared.live_allocs.load(Ordering::Relaxed)
    }

    /// Makes every allocation after the next `count` ones fail with `ENOMEM`. `None` disables
    /// failure injection.
    pub fn fail_after(&self, count: Option<usize>) {
        let v = count.map_or(-1, |c| c as isize);
        self.shared.fail_after.store(v, Ordering::Relaxed);
    }
}

/// A buffer reachable by the GPU.
pub struct DmaObject {
    shared: Arc<DmaShared>,
    size: usize,
    aperture: Aperture,
    sgt: SgTable,
    mem: Option<spin::Mutex<Vec<u8>>>,
    gpu_va: AtomicU64,
    skip_wmb: bool,
    counted: bool,
}

impl DmaObject {
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn aperture(&self) -> Aperture {
        self.aperture
    }

    #[inline]
    pub fn sgt(&self) -> &SgTable {
        &self.sgt
    }

    #[inline]
    pub fn skip_wmb(&self) -> bool {
        self.skip_wmb
    }

    /// Physical address of the first byte.
    pub fn phys(&self) -> u64 {
        self.sgt.chunks.first().map_or(0, |c| c.phys)
    }

    /// Address hardware uses to reach the first byte: the IOMMU address for system memory behind
    /// an IOMMU, the physical address otherwise.
    pub fn addr(&self) -> u64 {
        self.sgt.chunks.first().map_or(0, |c| c.dma)
    }

    /// GPU virtual address of the buffer's primary mapping, or zero if unmapped.
    pub fn gpu_va(&self) -> u64 {
        self.gpu_va.load(Ordering::Acquire)
    }

    pub(crate) fn set_gpu_va(&self, va: u64) {
        self.gpu_va.store(va, Ordering::Release);
    }

    fn check(&self, offset: usize, len: usize) -> Result<&spin::Mutex<Vec<u8>>> {
        let mem = self.mem.as_ref().ok_or(EINVAL)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(mem),
            _ => {
                warn!(
                    "dma: access {:#x}+{:#x} outside buffer of {:#x} bytes",
                    offset, len, self.size
                );
                Err(EINVAL)
            }
        }
    }

    /// Runs `f` on the backing memory, through the PRAMIN window for video memory.
    fn access<R>(
        &self,
        mem: &spin::Mutex<Vec<u8>>,
        offset: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        if self.aperture == Aperture::Vidmem && self.shared.pramin_enabled {
            let mut window = self.shared.pramin.lock();
            let target = util::align_down(self.phys() + offset as u64, PRAMIN_WINDOW_SIZE);
            if window.base != target {
                debug!("pramin: window {:#x} -> {:#x}", window.base, target);
                window.base = target;
            }
            f(mem.lock().as_mut_slice())
        } else {
            f(mem.lock().as_mut_slice())
        }
    }

    fn wmb(&self) {
        if self.aperture != Aperture::SysmemCoh && !self.skip_wmb {
            atomic::fence(Ordering::Release);
        }
    }

    /// Reads the 32-bit word at byte `offset`. Out-of-range reads return zero.
    pub fn rd32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        match self.rd_n(offset, &mut word) {
            Ok(()) => u32::from_le_bytes(word),
            Err(_) => 0,
        }
    }

    /// Writes the 32-bit word at byte `offset`. Out-of-range writes are dropped with a warning.
    pub fn wr32(&self, offset: usize, value: u32) {
        let _ = self.wr_n(offset, &value.to_le_bytes());
    }

    pub fn rd64(&self, offset: usize) -> u64 {
        u64::from(self.rd32(offset)) | (u64::from(self.rd32(offset + 4)) << 32)
    }

    pub fn wr64(&self, offset: usize, value: u64) {
        self.wr32(offset, util::lo32(value));
        self.wr32(offset + 4, util::hi32(value));
    }

    pub fn rd_n(&self, offset: usize, dst: &mut [u8]) -> Result {
        let mem = self.check(offset, dst.len())?;
        self.access(mem, offset, |m| dst.copy_from_slice(&m[offset..offset + dst.len()]));
        Ok(())
    }

    pub fn wr_n(&self, offset: usize, src: &[u8]) -> Result {
        let mem = self.check(offset, src.len())?;
        self.access(mem, offset, |m| m[offset..offset + src.len()].copy_from_slice(src));
        self.wmb();
        Ok(())
    }

    pub fn memset(&self, offset: usize, value: u8, len: usize) -> Result {
        let mem = self.check(offset, len)?;
        self.access(mem, offset, |m| m[offset..offset + len].fill(value));
        self.wmb();
        Ok(())
    }

    /// Returns a copy of the whole buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.size];
        let _ = self.rd_n(0, &mut out);
        out
    }
}

impl Drop for DmaObject {
    fn drop(&mut self) {
        if self.counted {
            self.shared.live_allocs.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl core::fmt::Debug for DmaObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaObject")
            .field("size", &self.size)
            .field("aperture", &self.aperture)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_to_page_and_zeroes() {
        let dma = DmaAllocator::new(false, false);
        let buf = dma.alloc(100, Aperture::Sysmem).unwrap();

        assert_eq!(buf.size(), PAGE_SIZE);
        assert_eq!(buf.rd32(0x40), 0);
        buf.wr32(0x40, 0xdead_beef);
        assert_eq!(buf.rd32(0x40), 0xdead_beef);
        assert_eq!(buf.rd32(PAGE_SIZE), 0);
        assert_eq!(buf.wr_n(PAGE_SIZE - 2, &[0; 4]), Err(EINVAL));
    }

    #[test]
    fn vidmem_goes_through_pramin() {
        let dma = DmaAllocator::new(false, true);
        let buf = dma.alloc(PAGE_SIZE, Aperture::Vidmem).unwrap();

        buf.wr64(8, 0x1122_3344_5566_7788);
        assert_eq!(buf.rd64(8), 0x1122_3344_5566_7788);
        assert_eq!(
            dma.shared.pramin.lock().base,
            util::align_down(buf.phys(), PRAMIN_WINDOW_SIZE)
        );
    }

    #[test]
    fn live_count_and_failure_injection() {
        let dma = DmaAllocator::new(false, false);
        let a = dma.alloc(1, Aperture::Sysmem).unwrap();
        dma.fail_after(Some(1));
        let b = dma.alloc(1, Aperture::Sysmem).unwrap();
        assert_eq!(dma.alloc(1, Aperture::Sysmem).err(), Some(ENOMEM));
        assert_eq!(dma.live_allocs(), 2);
        drop(a);
        drop(b);
        assert_eq!(dma.live_allocs(), 0);
        assert_eq!(dma.total_allocs(), 2);
    }

    #[test]
    fn sgt_alignment() {
        let sgt = SgTable::new(vec![
            SgChunk { phys: 0x10000, dma: 0x10000, len: 0x10000 },
            SgChunk { phys: 0x31000, dma: 0x31000, len: 0x2000 },
        ]);
        assert_eq!(sgt.alignment(false), 0x1000);

        let iommu = SgTable::new(vec![
            SgChunk { phys: 0x31000, dma: 0x20000, len: 0x1000 },
            SgChunk { phys: 0x55000, dma: 0x21000, len: 0x1000 },
        ]);
        assert_eq!(iommu.alignment(false), 0x20000);
        assert_eq!(iommu.alignment(true), 0x1000);
    }

    #[test]
    fn aperture_mask_on_igpu() {
        assert_eq!(aperture_mask_raw(true, Aperture::Sysmem, 2, 3, 1), 2);
        assert_eq!(aperture_mask_raw(true, Aperture::SysmemCoh, 2, 3, 1), 3);
        assert_eq!(aperture_mask_raw(false, Aperture::Sysmem, 2, 3, 1), 1);
        assert_eq!(aperture_mask_raw(false, Aperture::Vidmem, 2, 3, 1), 1);
    }
}
