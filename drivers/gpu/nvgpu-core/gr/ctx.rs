// SPDX-License-Identifier: GPL-2.0

//! GR context of a TSG.
//!
//! The main buffer starts with a header the firmware reads on every context switch. It points
//! at the side buffers and carries the preemption modes; the rest of the buffer is the saved
//! GR state, initialized from the golden image.

use std::sync::Arc;

use log::warn;

use crate::dma::{Aperture, DmaAllocator, DmaObject};
use crate::error::Result;
use crate::gr::{ComputePreemption, GraphicsPreemption};
use crate::mm::vm::{MapFlags, Vm};
use crate::util::{hi32, lo32};

pub(crate) const CTXSW_PROG_MAIN_IMAGE_CTL: usize = 0x0c;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PATCH_COUNT: usize = 0x10;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_LO: usize = 0x14;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_HI: usize = 0x18;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_ZCULL: usize = 0x1c;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_ZCULL_PTR: usize = 0x20;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PM: usize = 0x28;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PM_PTR: usize = 0x2c;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_FULL_PREEMPTION_PTR: usize = 0x5c;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_CONTEXT_BUFFER_PTR_HI: usize = 0x64;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_CONTEXT_BUFFER_PTR_LO: usize = 0x68;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_GRAPHICS_PREEMPTION_OPTIONS: usize = 0x80;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_COMPUTE_PREEMPTION_OPTIONS: usize = 0x84;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_CONFIG: usize = 0xa0;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_LO: usize = 0xa4;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_HI: usize = 0xa8;
pub(crate) const CTXSW_PROG_MAIN_IMAGE_NUM_SAVE_OPS: usize = 0xf4;

/// Header type of a subcontext header.
pub(crate) const CTL_TYPE_PER_VEID_HEADER: u32 = 0x21;
const ZCULL_MODE_NO_CTXSW: u32 = 1;
const PM_MODE_NO_CTXSW: u32 = 0;
const PRIV_ACCESS_MAP_MODE_USE_MAP: u32 = 2;

// Registers patched in at every context load.
pub(crate) const PATCH_SCC_BUNDLE_CB_BASE: u32 = 0x0040_8004;
pub(crate) const PATCH_SCC_PAGEPOOL_BASE: u32 = 0x0040_800c;
pub(crate) const PATCH_GPCS_SETUP_ATTRIB_CB_BASE: u32 = 0x0041_8810;
pub(crate) const PATCH_GPCS_RTV_CB_BASE: u32 = 0x0041_8f0c;
pub(crate) const PATCH_GPCS_SWDX_SPILL_BASE: u32 = 0x0041_8e24;
pub(crate) const PATCH_GPCS_SWDX_BETACB_BASE: u32 = 0x0041_8e28;

/// Capacity of the patch buffer, in (address, value) pairs.
pub(crate) const PATCH_SLOTS: usize = 128;

pub(crate) fn graphics_option(mode: GraphicsPreemption) -> u32 {
    match mode {
        GraphicsPreemption::Wfi => 0,
        GraphicsPreemption::Gfxp => 1,
    }
}

pub(crate) fn compute_option(mode: ComputePreemption) -> u32 {
    match mode {
        ComputePreemption::Wfi => 0,
        ComputePreemption::Cta => 1,
        ComputePreemption::Cilp => 2,
    }
}

/// A buffer and its mapping.
#[derive(Debug)]
pub(crate) struct CtxBuffer {
    pub(crate) mem: Arc<DmaObject>,
    pub(crate) va: u64,
}

impl CtxBuffer {
    pub(crate) fn alloc(
        dma: &DmaAllocator,
        vm: &Vm,
        size: usize,
        aperture: Aperture,
        flags: MapFlags,
    ) -> Result<Self> {
        let mem = dma.alloc(size.max(4), aperture)?;
        Self::map(vm, mem, flags)
    }

    pub(crate) fn map(vm: &Vm, mem: Arc<DmaObject>, flags: MapFlags) -> Result<Self> {
        let va = vm.map(&mem, flags, 0)?;
        Ok(Self { mem, va })
    }

    fn unmap(&self, vm: &Vm) {
        if let Err(e) = vm.unmap(self.va) {
            warn!("gr: unmap of ctx buffer at {:#x}: {:?}", self.va, e);
        }
    }
}

/// Mappings of the device-wide buffers in the TSG's address space.
#[derive(Debug)]
pub(crate) struct GlobalMappings {
    pub(crate) circular: CtxBuffer,
    pub(crate) pagepool: CtxBuffer,
    pub(crate) attribute: CtxBuffer,
    pub(crate) priv_access_map: CtxBuffer,
    pub(crate) rtv: Option<CtxBuffer>,
}

impl GlobalMappings {
    fn buffers(&self) -> impl Iterator<Item = &CtxBuffer> {
        [
            &self.circular,
            &self.pagepool,
            &self.attribute,
            &self.priv_access_map,
        ]
        .into_iter()
        .chain(self.rtv.as_ref())
    }
}

/// Buffers of the fine-grained preemption modes.
#[derive(Debug)]
pub(crate) struct PreemptBuffers {
    pub(crate) preempt: CtxBuffer,
    pub(crate) spill: CtxBuffer,
    pub(crate) betacb: CtxBuffer,
    pub(crate) pagepool: CtxBuffer,
}

impl PreemptBuffers {
    fn buffers(&self) -> [&CtxBuffer; 4] {
        [&self.preempt, &self.spill, &self.betacb, &self.pagepool]
    }
}

pub(crate) struct GrCtx {
    pub(crate) vm: Arc<Vm>,
    pub(crate) main: CtxBuffer,
    pub(crate) patch: CtxBuffer,
    pub(crate) pm: CtxBuffer,
    pub(crate) zcull: CtxBuffer,
    pub(crate) globals: GlobalMappings,
    pub(crate) preempt: Option<PreemptBuffers>,
    pub(crate) graphics_mode: GraphicsPreemption,
    pub(crate) compute_mode: ComputePreemption,
    patch_count: usize,
}

impl GrCtx {
    pub(crate) fn new(
        vm: Arc<Vm>,
        main: CtxBuffer,
        patch: CtxBuffer,
        pm: CtxBuffer,
        zcull: CtxBuffer,
        globals: GlobalMappings,
    ) -> Self {
        Self {
            vm,
            main,
            patch,
            pm,
            zcull,
            globals,
            preempt: None,
            graphics_mode: GraphicsPreemption::Wfi,
            compute_mode: ComputePreemption::Cta,
            patch_count: 0,
        }
    }

    pub(crate) fn patch_count(&self) -> usize {
        self.patch_count
    }

    /// Appends a register write to the patch buffer. Writes past its capacity are dropped.
    pub(crate) fn patch_write(&mut self, addr: u32, value: u32) {
        if self.patch_count >= PATCH_SLOTS {
            warn!("gr: patch buffer full, dropping write to {:#x}", addr);
            return;
        }

        let off = self.patch_count * 8;
        self.patch.mem.wr32(off, addr);
        self.patch.mem.wr32(off + 4, value);
        self.patch_count += 1;
    }

    /// Points the patch buffer at the global buffers, then at the preemption buffers if any.
    pub(crate) fn write_patches(&mut self) {
        self.patch_count = 0;

        // Bases are 256 byte aligned.
        let base = |b: &CtxBuffer| (b.va >> 8) as u32;
        let circular = base(&self.globals.circular);
        let pagepool = base(&self.globals.pagepool);
        let attribute = base(&self.globals.attribute);
        let rtv = self.globals.rtv.as_ref().map(base);
        let preempt = self
            .preempt
            .as_ref()
            .map(|p| (base(&p.spill), base(&p.betacb)));

        self.patch_write(PATCH_SCC_BUNDLE_CB_BASE, circular);
        self.patch_write(PATCH_SCC_PAGEPOOL_BASE, pagepool);
        self.patch_write(PATCH_GPCS_SETUP_ATTRIB_CB_BASE, attribute);
        if let Some(rtv) = rtv {
            self.patch_write(PATCH_GPCS_RTV_CB_BASE, rtv);
        }
        if let Some((spill, betacb)) = preempt {
            self.patch_write(PATCH_GPCS_SWDX_SPILL_BASE, spill);
            self.patch_write(PATCH_GPCS_SWDX_BETACB_BASE, betacb);
        }
    }

    /// Rewrites the header of the main buffer from the current state of the context.
    pub(crate) fn write_header(&self) {
        let m = &self.main.mem;

        m.wr32(CTXSW_PROG_MAIN_IMAGE_NUM_SAVE_OPS, 0);
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PATCH_COUNT, self.patch_count as u32);
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_LO, lo32(self.patch.va));
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_HI, hi32(self.patch.va));

        m.wr32(CTXSW_PROG_MAIN_IMAGE_ZCULL, ZCULL_MODE_NO_CTXSW);
        m.wr32(CTXSW_PROG_MAIN_IMAGE_ZCULL_PTR, (self.zcull.va >> 8) as u32);
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PM, PM_MODE_NO_CTXSW);
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PM_PTR, (self.pm.va >> 8) as u32);

        let map = &self.globals.priv_access_map;
        m.wr32(
            CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_CONFIG,
            PRIV_ACCESS_MAP_MODE_USE_MAP,
        );
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_LO, lo32(map.va));
        m.wr32(CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_HI, hi32(map.va));

        self.write_preemption_options();
    }

    pub(crate) fn write_preemption_options(&self) {
        let m = &self.main.mem;

        m.wr32(
            CTXSW_PROG_MAIN_IMAGE_GRAPHICS_PREEMPTION_OPTIONS,
            graphics_option(self.graphics_mode),
        );
        m.wr32(
            CTXSW_PROG_MAIN_IMAGE_COMPUTE_PREEMPTION_OPTIONS,
            compute_option(self.compute_mode),
        );
        let full = self.preempt.as_ref().map_or(0, |p| (p.preempt.va >> 8) as u32);
        m.wr32(CTXSW_PROG_MAIN_IMAGE_FULL_PREEMPTION_PTR, full);
    }
}

impl Drop for GrCtx {
    fn drop(&mut self) {
        for b in [&self.main, &self.patch, &self.pm, &self.zcull] {
            b.unmap(&self.vm);
        }
        for b in self.globals.buffers() {
            b.unmap(&self.vm);
        }
        if let Some(p) = &self.preempt {
            for b in p.buffers() {
                b.unmap(&self.vm);
            }
        }
    }
}
