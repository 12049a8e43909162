// SPDX-License-Identifier: GPL-2.0

//! GPU memory management: address spaces, their page tables and TLB maintenance.

use std::sync::Mutex;
use std::time::Duration;

use log::warn;

use crate::config::GpuConfig;
use crate::dma::{Aperture, DmaAllocator};
use crate::error::{self, Result};
use crate::io::Bar0;
use crate::mm::gmmu::BIG_PAGE_SIZE_64K;
use crate::mm::pd_cache::PdCache;
use crate::regs;
use crate::util;

pub(crate) mod allocator;
pub(crate) mod gmmu;
pub(crate) mod inst;
pub(crate) mod pd_cache;
pub mod vm;

/// Memory management state shared by every address space of a device.
pub(crate) struct Mm {
    pub(crate) dma: DmaAllocator,
    pub(crate) pd_cache: PdCache,
    bar: Bar0,
    /// Whether descriptors distinguish system memory from video memory.
    pub(crate) honors_aperture: bool,
    pub(crate) iommu_bypass: bool,
    pub(crate) unified_va: bool,
    pub(crate) default_big_page_size: u32,
    poll_timeout: Duration,
    /// Serializes the MMU invalidate FIFO.
    tlb_lock: Mutex<()>,
}

impl Mm {
    pub(crate) fn new(bar: Bar0, dma: DmaAllocator, config: &GpuConfig, is_dgpu: bool) -> Self {
        // Discrete GPUs keep their page tables in video memory.
        let pd_aperture = if is_dgpu {
            Aperture::Vidmem
        } else {
            Aperture::Sysmem
        };
        let default_big_page_size = match config.big_page_size {
            0 => BIG_PAGE_SIZE_64K as u32,
            size => size,
        };

        Self {
            pd_cache: PdCache::new(dma.clone(), pd_aperture),
            dma,
            bar,
            honors_aperture: is_dgpu,
            iommu_bypass: config.iommu_bypass,
            unified_va: config.unified_va,
            default_big_page_size,
            poll_timeout: config.poll_timeout,
            tlb_lock: Mutex::new(()),
        }
    }

    /// Aperture new instance blocks and GPU-visible driver buffers are allocated from.
    pub(crate) fn inst_aperture(&self) -> Aperture {
        self.pd_cache.aperture()
    }

    /// Invalidates every TLB entry of the address space whose page directory is at `pdb_addr`.
    pub(crate) fn tlb_invalidate(&self, pdb_addr: u64, aperture: Aperture) -> Result {
        let bar = &self.bar;
        let _guard = error::lock(&self.tlb_lock);

        util::read_poll_timeout(
            || Ok(regs::NV_PFB_PRI_MMU_CTRL::read(bar)),
            |r| r.pri_fifo_space() > 0,
            Duration::from_micros(2),
            self.poll_timeout,
        )
        .inspect_err(|_| warn!("mm: invalidate FIFO is full"))?;

        regs::NV_PFB_PRI_MMU_INVALIDATE_PDB::default()
            .set_aperture_sys(aperture.is_sysmem())
            .set_addr((pdb_addr >> 12) as u32)
            .write(bar);
        regs::NV_PFB_PRI_MMU_INVALIDATE::default()
            .set_all_va(true)
            .set_trigger(true)
            .write(bar);

        util::read_poll_timeout(
            || Ok(regs::NV_PFB_PRI_MMU_CTRL::read(bar)),
            |r| r.pri_fifo_empty(),
            Duration::from_micros(2),
            self.poll_timeout,
        )
        .map(|_| ())
        .inspect_err(|_| warn!("mm: TLB invalidate of {:#x} timed out", pdb_addr))
    }
}
