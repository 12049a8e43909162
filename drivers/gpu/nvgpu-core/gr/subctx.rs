// SPDX-License-Identifier: GPL-2.0

//! Subcontext headers.
//!
//! On Volta and later the instance block of a channel points at a small per-channel header
//! instead of the TSG's context. The header repeats the pointers of the main header and points
//! at the shared context buffer.

use std::sync::Arc;

use log::warn;

use crate::dma::{DmaObject, PAGE_SIZE};
use crate::error::Result;
use crate::gpu::Gpu;
use crate::gr::ctx::{self, GrCtx};
use crate::mm::vm::{MapFlags, Vm};
use crate::util::{hi32, lo32};

#[derive(Debug)]
pub(crate) struct SubctxHeader {
    mem: Arc<DmaObject>,
    va: u64,
}

impl SubctxHeader {
    pub(crate) fn alloc(gpu: &Gpu, vm: &Vm) -> Result<Self> {
        let mem = gpu.dma.alloc(PAGE_SIZE, gpu.mm.inst_aperture())?;
        let va = vm.map(&mem, MapFlags::PRIV, 0)?;

        Ok(Self { mem, va })
    }

    pub(crate) fn va(&self) -> u64 {
        self.va
    }

    pub(crate) fn mem(&self) -> &Arc<DmaObject> {
        &self.mem
    }

    /// Points the header at `ctx`.
    pub(crate) fn write(&self, gpu: &Gpu, ctx: &GrCtx) -> Result {
        // The firmware reads the header through L2.
        gpu.fb
            .l2_flush(&gpu.bar, true, gpu.config.poll_timeout)
            .inspect_err(|e| warn!("gr: L2 flush before subctx header: {:?}", e))?;

        let m = &self.mem;
        let map = ctx.globals.priv_access_map.va;
        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_LO, lo32(map));
        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_HI, hi32(map));

        m.wr32(
            ctx::CTXSW_PROG_MAIN_IMAGE_PATCH_COUNT,
            ctx.patch_count() as u32,
        );
        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_LO, lo32(ctx.patch.va));
        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_HI, hi32(ctx.patch.va));

        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_PM_PTR, (ctx.pm.va >> 8) as u32);
        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_ZCULL_PTR, (ctx.zcull.va >> 8) as u32);

        m.wr32(
            ctx::CTXSW_PROG_MAIN_IMAGE_CONTEXT_BUFFER_PTR_HI,
            hi32(ctx.main.va),
        );
        m.wr32(
            ctx::CTXSW_PROG_MAIN_IMAGE_CONTEXT_BUFFER_PTR_LO,
            lo32(ctx.main.va),
        );
        m.wr32(ctx::CTXSW_PROG_MAIN_IMAGE_CTL, ctx::CTL_TYPE_PER_VEID_HEADER);

        Ok(())
    }

    pub(crate) fn unmap(&self, vm: &Vm) {
        let _ = vm.unmap(self.va);
    }
}
