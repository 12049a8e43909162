// SPDX-License-Identifier: GPL-2.0

//! Graphics and compute engine.
//!
//! GR state is saved and restored by the FECS firmware on every context switch, into a context
//! buffer owned by the TSG. New contexts start from a golden image, captured once per device
//! from the first context created.

use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, error, info, warn};

use crate::channel::{Channel, ChannelEvent};
use crate::dma::DmaObject;
use crate::ecc::EccCounter;
use crate::error::{self, code::*, Result};
use crate::falcon::FalconId;
use crate::fifo::engines::EngineType;
use crate::fifo::recovery::{self, RecoveryScope};
use crate::fifo::ErrorNotifier;
use crate::gpu::{Chipset, Gpu};
use crate::intr::NonstallOps;
use crate::io::Bar0;
use crate::mc;
use crate::mm::vm::{MapFlags, Vm};
use crate::regs;
use crate::tsg::{SmErrorState, Tsg};

use ctx::{CtxBuffer, GlobalMappings, GrCtx, PreemptBuffers};
use fecs::ImageSizes;
use hal::GrHal;
use subctx::SubctxHeader;

pub(crate) mod ctx;
pub(crate) mod fecs;
pub(crate) mod hal;
pub(crate) mod subctx;

/// Bytes of the priv access map: one bit per register word of the 16 MiB register space.
const PRIV_ACCESS_MAP_SIZE: usize = 512 * 1024;

/// Registers user contexts may access.
const PRIV_ACCESS_WHITELIST: [usize; 3] = [
    regs::NV_PGRAPH_PRI_SM_HWW_GLOBAL_ESR::OFFSET,
    regs::NV_PGRAPH_PRI_SM_HWW_WARP_ESR_PC::OFFSET,
    regs::NV_PGRAPH_PRI_SM_HWW_WARP_ESR::OFFSET,
];

/// Graphics preemption modes, from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphicsPreemption {
    /// Wait for idle.
    Wfi,
    /// Preemption at pixel granularity.
    Gfxp,
}

/// Compute preemption modes, from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComputePreemption {
    /// Wait for idle.
    Wfi,
    /// Preemption at thread block boundaries.
    Cta,
    /// Preemption at instruction level.
    Cilp,
}

/// Floorsweeping of the GR engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GrConfig {
    pub(crate) num_gpc: u32,
    pub(crate) max_tpc_per_gpc: u32,
    /// Available TPCs of every GPC.
    pub(crate) tpc_count: Vec<u32>,
    pub(crate) num_tpc: u32,
    pub(crate) num_sm: u32,
}

static EMPTY_CONFIG: GrConfig = GrConfig {
    num_gpc: 0,
    max_tpc_per_gpc: 0,
    tpc_count: Vec::new(),
    num_tpc: 0,
    num_sm: 0,
};

impl GrConfig {
    fn read(bar: &Bar0, hal: &dyn GrHal) -> Self {
        let num_gpc = regs::NV_PTOP_SCAL_NUM_GPCS::read(bar)
            .value()
            .min(regs::NV_PGRAPH_PRI_GPC_FS::SIZE as u32);
        let max_tpc_per_gpc = regs::NV_PTOP_SCAL_NUM_TPC_PER_GPC::read(bar).value();

        let tpc_count = (0..num_gpc as usize)
            .map(|gpc| {
                regs::NV_PGRAPH_PRI_GPC_FS::read(bar, gpc)
                    .num_available_tpcs()
                    .min(max_tpc_per_gpc)
            })
            .collect::<Vec<_>>();
        let num_tpc = tpc_count.iter().sum::<u32>();

        Self {
            num_gpc,
            max_tpc_per_gpc,
            tpc_count,
            num_tpc,
            num_sm: num_tpc * hal.sm_per_tpc(),
        }
    }
}

/// Buffers shared by every context of the device.
struct GlobalBuffers {
    circular: Arc<DmaObject>,
    pagepool: Arc<DmaObject>,
    attribute: Arc<DmaObject>,
    priv_access_map: Arc<DmaObject>,
    rtv: Option<Arc<DmaObject>>,
}

impl GlobalBuffers {
    /// Maps every buffer in `vm`. Nothing stays mapped on failure.
    fn map(&self, vm: &Vm) -> Result<GlobalMappings> {
        let mut mapped: Vec<CtxBuffer> = Vec::new();
        let bufs = [
            (&self.circular, MapFlags::PRIV),
            (&self.pagepool, MapFlags::PRIV),
            (&self.attribute, MapFlags::PRIV),
            (&self.priv_access_map, MapFlags::PRIV | MapFlags::READ_ONLY),
        ]
        .into_iter()
        .chain(self.rtv.as_ref().map(|rtv| (rtv, MapFlags::PRIV)));

        for (mem, flags) in bufs {
            match CtxBuffer::map(vm, mem.clone(), flags) {
                Ok(b) => mapped.push(b),
                Err(e) => {
                    for b in &mapped {
                        let _ = vm.unmap(b.va);
                    }
                    return Err(e);
                }
            }
        }

        let rtv = if self.rtv.is_some() { mapped.pop() } else { None };
        let mut it = mapped.into_iter();
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(circular), Some(pagepool), Some(attribute), Some(priv_access_map)) => {
                Ok(GlobalMappings {
                    circular,
                    pagepool,
                    attribute,
                    priv_access_map,
                    rtv,
                })
            }
            _ => Err(EINVAL),
        }
    }
}

pub(crate) struct Gr {
    chipset: Chipset,
    hal: &'static dyn GrHal,
    config: OnceLock<GrConfig>,
    sizes: OnceLock<ImageSizes>,
    preempt_size: Mutex<Option<usize>>,
    globals: OnceLock<GlobalBuffers>,
    golden: Mutex<Option<Vec<u8>>>,
    /// Serializes FECS methods.
    fecs_lock: Mutex<()>,
}

impl Gr {
    pub(crate) fn new(chipset: Chipset) -> Result<Self> {
        Ok(Self {
            chipset,
            hal: hal::gr_hal(chipset),
            config: OnceLock::new(),
            sizes: OnceLock::new(),
            preempt_size: Mutex::new(None),
            globals: OnceLock::new(),
            golden: Mutex::new(None),
            fecs_lock: Mutex::new(()),
        })
    }

    pub(crate) fn hal(&self) -> &'static dyn GrHal {
        self.hal
    }

    /// Floorsweeping configuration. Empty until the engine is initialized.
    pub(crate) fn config(&self) -> &GrConfig {
        self.config.get().unwrap_or(&EMPTY_CONFIG)
    }

    pub(crate) fn image_sizes(&self) -> Option<ImageSizes> {
        self.sizes.get().copied()
    }

    pub(crate) fn has_golden(&self) -> bool {
        error::lock(&self.golden).is_some()
    }

    fn intr_en_mask() -> u32 {
        regs::NV_PGRAPH_INTR::default()
            .set_notify(true)
            .set_semaphore(true)
            .set_semaphore_timeout(true)
            .set_illegal_method(true)
            .set_illegal_class(true)
            .set_illegal_notify(true)
            .set_firmware_method(true)
            .set_fecs_error(true)
            .set_class_error(true)
            .set_exception(true)
            .raw()
    }

    fn enable_intr(bar: &Bar0) {
        regs::NV_PGRAPH_INTR::from(u32::MAX).write(bar);
        regs::NV_PGRAPH_INTR_EN::default()
            .set_value(Self::intr_en_mask())
            .write(bar);
    }

    /// Waits for the context switch firmware, queries the context sizes and allocates the
    /// global buffers.
    pub(crate) fn init_hw(&self, gpu: &Gpu) -> Result {
        let bar = &gpu.bar;
        let timeout = gpu.config.fecs_timeout;

        gpu.pmu.elpg_protected(|| {
            fecs::wait_ready(bar, timeout)?;
            let config = self.config.get_or_init(|| GrConfig::read(bar, self.hal));

            let sizes = {
                let _fecs = error::lock(&self.fecs_lock);
                let sizes = fecs::discover_image_sizes(bar, timeout)?;
                fecs::set_watchdog(bar, fecs::WATCHDOG_TIMEOUT, timeout)?;
                sizes
            };
            if sizes.golden == 0 {
                error!("gr: firmware reports an empty context image");
                return Err(EFATAL);
            }
            let _ = self.sizes.set(sizes);

            if self.globals.get().is_none() {
                let globals = self.alloc_globals(gpu, config)?;
                let _ = self.globals.set(globals);
            }

            Self::enable_intr(bar);

            info!(
                "gr: {} GPCs, {} TPCs, {} SMs, context image {:#x} bytes",
                config.num_gpc, config.num_tpc, config.num_sm, sizes.golden
            );
            Ok(())
        })
    }

    fn alloc_globals(&self, gpu: &Gpu, config: &GrConfig) -> Result<GlobalBuffers> {
        let sizes = self.hal.global_sizes(config.num_tpc);
        let ap = gpu.mm.inst_aperture();
        let dma = &gpu.dma;

        let priv_access_map = dma.alloc(PRIV_ACCESS_MAP_SIZE, ap)?;
        for reg in PRIV_ACCESS_WHITELIST {
            let word = reg >> 2;
            let off = (word / 32) * 4;
            priv_access_map.wr32(off, priv_access_map.rd32(off) | (1 << (word % 32)));
        }

        Ok(GlobalBuffers {
            circular: dma.alloc(sizes.circular, ap)?,
            pagepool: dma.alloc(sizes.pagepool, ap)?,
            attribute: dma.alloc(sizes.attribute, ap)?,
            priv_access_map,
            rtv: match sizes.rtv {
                0 => None,
                size => Some(dma.alloc(size, ap)?),
            },
        })
    }

    /// Resets the engine and restarts its firmware.
    pub(crate) fn reset(&self, gpu: &Gpu) -> Result {
        let bar = &gpu.bar;
        let timeout = gpu.config.fecs_timeout;

        warn!("gr: engine reset");
        mc::reset(bar, mc::ENABLE_GR, mc::RESET_SETTLE);

        if gpu.acr.is_bootstrapped(FalconId::Fecs) {
            gpu.acr
                .rebootstrap(gpu, &[FalconId::Fecs, FalconId::Gpccs])?;
        }

        gpu.pmu.elpg_protected(|| {
            let _fecs = error::lock(&self.fecs_lock);
            fecs::wait_ready(bar, timeout)?;
            fecs::set_watchdog(bar, fecs::WATCHDOG_TIMEOUT, timeout)?;
            Self::enable_intr(bar);
            Ok(())
        })
    }

    /// Allocates an object of `class` on `ch`, creating the GR context of `tsg` on first use.
    ///
    /// A firmware timeout while doing so recovers the TSG.
    pub(crate) fn alloc_obj_ctx(
        &self,
        gpu: &Gpu,
        ch: &Channel,
        tsg: &Arc<Tsg>,
        class: u32,
    ) -> Result {
        if !self.hal.is_valid_class(class) {
            warn!("gr: invalid class {:#x} on {}", class, self.chipset);
            return Err(EINVAL);
        }

        let is_copy = class == self.hal.classes().copy;
        match (is_copy, ch.engine()) {
            (true, EngineType::Ce) | (false, EngineType::Gr) => (),
            _ => return Err(EINVAL),
        }

        if !is_copy {
            let res = self.setup_ctx(gpu, ch, tsg);
            if res == Err(ETIMEDOUT) {
                let _ = recovery::recover(
                    gpu,
                    RecoveryScope::Channel(ch.chid()),
                    ErrorNotifier::IdleTimeout,
                );
            }
            res?;
        }

        let mut classes = error::lock(ch.classes());
        if !classes.contains(&class) {
            classes.push(class);
        }
        debug!("gr: channel {}: class {:#x}", ch.chid(), class);

        Ok(())
    }

    fn setup_ctx(&self, gpu: &Gpu, ch: &Channel, tsg: &Tsg) -> Result {
        let mut slot = error::lock(tsg.gr_ctx());

        if let Some(ctx) = slot.as_ref() {
            return self.commit(gpu, ch, ctx);
        }

        let vm = tsg.vm().ok_or(EINVAL)?;
        let mut ctx = self.create_ctx(gpu, vm)?;

        let mut golden = error::lock(&self.golden);
        match golden.as_ref() {
            Some(image) => {
                ctx.main.mem.wr_n(0, image)?;
                ctx.write_header();
                self.commit(gpu, ch, &ctx)?;
            }
            None => {
                ctx.write_header();
                self.commit(gpu, ch, &ctx)?;
                let image = self.capture_golden(gpu, ch, &ctx).inspect_err(|_| {
                    ch.inst().set_engine_ctx(0);
                    let header = error::lock(ch.subctx()).take();
                    if let Some(header) = header {
                        header.unmap(ch.vm());
                    }
                })?;
                info!("gr: golden context captured, {:#x} bytes", image.len());
                *golden = Some(image);
                // The capture overwrote the header.
                ctx.write_header();
            }
        }
        drop(golden);

        *slot = Some(ctx);
        debug!("tsg {}: GR context created", tsg.tsgid());
        Ok(())
    }

    fn create_ctx(&self, gpu: &Gpu, vm: Arc<Vm>) -> Result<GrCtx> {
        let sizes = self.sizes.get().ok_or(EINVAL)?;
        let globals = self.globals.get().ok_or(EINVAL)?;
        let dma = &gpu.dma;
        let ap = gpu.mm.inst_aperture();

        let main = CtxBuffer::alloc(dma, &vm, sizes.golden, ap, MapFlags::PRIV)?;
        let undo = |bufs: &[&CtxBuffer]| {
            for b in bufs {
                let _ = vm.unmap(b.va);
            }
        };

        let patch = CtxBuffer::alloc(dma, &vm, ctx::PATCH_SLOTS * 8, ap, MapFlags::PRIV)
            .inspect_err(|_| undo(&[&main]))?;
        let pm = CtxBuffer::alloc(dma, &vm, sizes.pm, ap, MapFlags::PRIV)
            .inspect_err(|_| undo(&[&main, &patch]))?;
        let zcull = CtxBuffer::alloc(dma, &vm, sizes.zcull, ap, MapFlags::PRIV)
            .inspect_err(|_| undo(&[&main, &patch, &pm]))?;
        let globals = globals
            .map(&vm)
            .inspect_err(|_| undo(&[&main, &patch, &pm, &zcull]))?;

        let mut ctx = GrCtx::new(vm, main, patch, pm, zcull, globals);
        ctx.write_patches();
        Ok(ctx)
    }

    /// Points the instance block of `ch` at `ctx`.
    fn commit(&self, gpu: &Gpu, ch: &Channel, ctx: &GrCtx) -> Result {
        if !self.hal.uses_subctx_header() {
            ch.inst().set_engine_ctx(ctx.main.va);
            return Ok(());
        }

        let mut slot = error::lock(ch.subctx());
        let header = match slot.take() {
            Some(header) => header,
            None => SubctxHeader::alloc(gpu, ch.vm())?,
        };
        if let Err(e) = header.write(gpu, ctx) {
            header.unmap(ch.vm());
            return Err(e);
        }

        ch.inst().set_engine_ctx(header.va());
        *slot = Some(header);
        Ok(())
    }

    /// Has the firmware save the context bound to `ch` and returns the image.
    fn capture_golden(&self, gpu: &Gpu, ch: &Channel, ctx: &GrCtx) -> Result<Vec<u8>> {
        let bar = &gpu.bar;
        let timeout = gpu.config.fecs_timeout;
        let inst = ch.inst();

        let _fecs = error::lock(&self.fecs_lock);
        gpu.pmu.elpg_protected(|| {
            fecs::bind_pointer(
                bar,
                inst.addr(),
                inst.aperture(),
                gpu.mm.honors_aperture,
                timeout,
            )?;
            fecs::golden_save(bar, timeout)?;
            gpu.fb.l2_flush(bar, true, gpu.config.poll_timeout)?;

            let mut image = ctx.main.mem.to_vec();
            image.truncate(self.sizes.get().map_or(image.len(), |s| s.golden));
            Ok(image)
        })
    }

    fn preempt_buffer_size(&self, gpu: &Gpu) -> Result<usize> {
        let mut size = error::lock(&self.preempt_size);
        if let Some(size) = *size {
            return Ok(size);
        }

        let value = {
            let _fecs = error::lock(&self.fecs_lock);
            gpu.pmu.elpg_protected(|| {
                fecs::discover_preemption_size(&gpu.bar, gpu.config.fecs_timeout)
            })?
        };
        if value == 0 {
            return Err(EFATAL);
        }

        *size = Some(value);
        Ok(value)
    }

    fn alloc_preempt_buffers(&self, gpu: &Gpu, vm: &Vm) -> Result<PreemptBuffers> {
        let preempt_size = self.preempt_buffer_size(gpu)?;
        let sizes = self.hal.preempt_sizes(self.config().num_sm);
        let dma = &gpu.dma;
        let ap = gpu.mm.inst_aperture();
        let undo = |bufs: &[&CtxBuffer]| {
            for b in bufs {
                let _ = vm.unmap(b.va);
            }
        };

        let preempt = CtxBuffer::alloc(dma, vm, preempt_size, ap, MapFlags::PRIV)?;
        let spill = CtxBuffer::alloc(dma, vm, sizes.spill, ap, MapFlags::PRIV)
            .inspect_err(|_| undo(&[&preempt]))?;
        let betacb = CtxBuffer::alloc(dma, vm, sizes.betacb, ap, MapFlags::PRIV)
            .inspect_err(|_| undo(&[&preempt, &spill]))?;
        let pagepool = CtxBuffer::alloc(dma, vm, sizes.pagepool, ap, MapFlags::PRIV)
            .inspect_err(|_| undo(&[&preempt, &spill, &betacb]))?;

        Ok(PreemptBuffers {
            preempt,
            spill,
            betacb,
            pagepool,
        })
    }

    /// Selects the preemption modes of the GR context of `tsg`. Modes left as `None` are
    /// unchanged. A mode cannot be made coarser than it is.
    pub(crate) fn set_preemption_mode(
        &self,
        gpu: &Gpu,
        tsg: &Arc<Tsg>,
        graphics: Option<GraphicsPreemption>,
        compute: Option<ComputePreemption>,
    ) -> Result {
        if graphics == Some(GraphicsPreemption::Gfxp) && !self.hal.supports_gfxp() {
            return Err(EINVAL);
        }
        if compute == Some(ComputePreemption::Cilp) && !self.hal.supports_cilp() {
            return Err(EINVAL);
        }

        let channels = tsg.channels();
        let mut slot = error::lock(tsg.gr_ctx());
        let ctx = slot.as_mut().ok_or(EINVAL)?;

        let g = graphics.unwrap_or(ctx.graphics_mode);
        let c = compute.unwrap_or(ctx.compute_mode);
        if g < ctx.graphics_mode || c < ctx.compute_mode {
            return Err(EINVAL);
        }
        if (g, c) == (ctx.graphics_mode, ctx.compute_mode) {
            return Ok(());
        }

        if (g == GraphicsPreemption::Gfxp || c == ComputePreemption::Cilp) && ctx.preempt.is_none()
        {
            ctx.preempt = Some(self.alloc_preempt_buffers(gpu, &ctx.vm)?);
            ctx.write_patches();
        }

        gpu.fifo.preempt_tsg(gpu, tsg.tsgid())?;

        ctx.graphics_mode = g;
        ctx.compute_mode = c;
        ctx.write_header();

        if self.hal.uses_subctx_header() {
            for ch in &channels {
                if let Some(header) = error::lock(ch.subctx()).as_ref() {
                    header.write(gpu, ctx)?;
                }
            }
        }

        debug!("tsg {}: preemption {:?}/{:?}", tsg.tsgid(), g, c);
        Ok(())
    }

    /// Services the stall interrupt of GR. Faults recover the TSG of the current context.
    pub(crate) fn isr(&self, gpu: &Gpu) -> Result {
        match gpu.pmu.elpg_protected(|| self.handle_intr(gpu)) {
            Some((chid, notifier)) => {
                recovery::recover(gpu, RecoveryScope::Channel(chid), notifier)
            }
            None => Ok(()),
        }
    }

    fn handle_intr(&self, gpu: &Gpu) -> Option<(u32, ErrorNotifier)> {
        let bar = &gpu.bar;
        let intr = regs::NV_PGRAPH_INTR::read(bar);
        if intr.raw() == 0 {
            return None;
        }

        let ch = fecs::current_ctx(bar).and_then(|inst| gpu.fifo.channel_by_inst(inst));
        let mut notifier = None;

        if intr.notify() || intr.semaphore() {
            if let Some(ch) = &ch {
                ch.post_event(ChannelEvent::Blocking);
            }
            gpu.sema_sea.wake_all();
        }

        if intr.semaphore_timeout() {
            notifier = Some(ErrorNotifier::GrSemaphoreTimeout);
        }

        if intr.illegal_method() {
            let addr = regs::NV_PGRAPH_TRAPPED_ADDR::read(bar);
            let data = regs::NV_PGRAPH_TRAPPED_DATA_LO::read(bar).value();
            let offset = addr.mthd() << 2;
            let class = ch
                .as_ref()
                .and_then(|ch| error::lock(ch.classes()).get(addr.subch() as usize).copied());

            let handled = class
                .ok_or(EINVAL)
                .and_then(|class| self.hal.handle_sw_method(class, offset, data));
            if handled.is_err() {
                warn!("gr: illegal method {:#x} ({:#x}) on class {:?}", offset, data, class);
                notifier = Some(ErrorNotifier::GrSwMethod);
            }
        }

        if intr.illegal_class() || intr.class_error() {
            warn!("gr: class error, intr {:#x}", intr.raw());
            notifier = Some(ErrorNotifier::GrSwNotify);
        }

        if intr.illegal_notify() {
            notifier = Some(ErrorNotifier::GrIllegalNotify);
        }

        if intr.firmware_method() {
            let mailbox = regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::read(bar, 6).value();
            warn!("gr: firmware method, mailbox6 {:#x}", mailbox);
            notifier = Some(ErrorNotifier::FecsFirmwareMethod);
        }

        if intr.fecs_error() {
            error!("gr: fecs error");
            notifier = Some(ErrorNotifier::GrException);
        }

        if intr.exception() {
            let exc = regs::NV_PGRAPH_EXCEPTION::read(bar);
            let state = SmErrorState {
                hww_global_esr: regs::NV_PGRAPH_PRI_SM_HWW_GLOBAL_ESR::read(bar).value(),
                hww_warp_esr: regs::NV_PGRAPH_PRI_SM_HWW_WARP_ESR::read(bar).error(),
                hww_warp_esr_pc: u64::from(
                    regs::NV_PGRAPH_PRI_SM_HWW_WARP_ESR_PC::read(bar).value(),
                ),
            };
            error!(
                "gr: exception {:#x}, sm global esr {:#x} warp esr {:#x} pc {:#x}",
                exc.raw(),
                state.hww_global_esr,
                state.hww_warp_esr,
                state.hww_warp_esr_pc
            );

            if exc.gpc() {
                if let Some(tsg) = ch.as_ref().and_then(|ch| ch.tsg()) {
                    let _ = tsg.record_sm_error(0, state);
                }
                regs::NV_PGRAPH_PRI_SM_HWW_GLOBAL_ESR::from(state.hww_global_esr).write(bar);
            }

            gpu.ecc.add(EccCounter::GrException, 1);
            notifier = Some(ErrorNotifier::GrException);
        }

        intr.write(bar);

        let notifier = notifier?;
        match ch {
            Some(ch) => Some((ch.chid(), notifier)),
            None => {
                error!("gr: {:?} with no current context", notifier);
                None
            }
        }
    }

    /// Services the non-stall interrupt of GR.
    pub(crate) fn isr_nonstall(&self, bar: &Bar0) -> NonstallOps {
        if !regs::NV_PGRAPH_NONSTALL_INTR::read(bar).trap() {
            return NonstallOps::empty();
        }

        regs::NV_PGRAPH_NONSTALL_INTR::default()
            .set_trap(true)
            .write(bar);

        NonstallOps::WAKEUP_SEMAPHORE | NonstallOps::POST_EVENTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelParams;
    use crate::config::GpuConfig;
    use crate::sim;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn gr_channel(gpu: &Arc<Gpu>, vm: &Arc<Vm>) -> (Arc<Tsg>, Arc<Channel>) {
        let tsg = Tsg::open(gpu).unwrap();
        let ch = Channel::open(gpu, vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();
        (tsg, ch)
    }

    #[test]
    fn init_reads_config_and_sizes() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let gr = &gpu.gr;

        assert_eq!(gr.config().num_gpc, sim::NUM_GPCS);
        assert_eq!(gr.config().num_tpc, sim::NUM_GPCS * sim::NUM_TPC_PER_GPC);
        assert_eq!(
            gr.image_sizes(),
            Some(ImageSizes {
                golden: sim::GOLDEN_SIZE,
                zcull: sim::ZCULL_SIZE,
                pm: sim::PM_SIZE,
            })
        );
        assert_eq!(
            regs::NV_PGRAPH_INTR_EN::read(&gpu.bar).value(),
            Gr::intr_en_mask()
        );
    }

    #[test]
    fn empty_golden_image_is_fatal() {
        let config = GpuConfig {
            fecs_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (sim, gpu) = sim::probe(Chipset::GP10B, config, sim::platform());
        sim.set_fecs_size(fecs::METHOD_DISCOVER_IMAGE_SIZE, 0);

        assert_eq!(gpu.init(), Err(EFATAL));
        assert_eq!(gpu.init(), Err(EFATAL));
    }

    #[test]
    fn fecs_method_timeout() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);
        sim.set_fecs_hang(true);

        assert_eq!(
            fecs::golden_save(&gpu.bar, Duration::from_millis(5)),
            Err(ETIMEDOUT)
        );
    }

    #[test]
    fn classes_are_validated() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "classes").unwrap();
        let (_tsg, ch) = gr_channel(&gpu, &vm);
        let classes = gpu.gr.hal().classes();

        assert_eq!(ch.alloc_obj_ctx(0x1234), Err(EINVAL));
        // Pascal compute class on Volta.
        assert_eq!(ch.alloc_obj_ctx(0xc0c0), Err(EINVAL));
        // Copy objects go on copy engine channels.
        assert_eq!(ch.alloc_obj_ctx(classes.copy), Err(EINVAL));

        ch.alloc_obj_ctx(classes.compute).unwrap();
        ch.alloc_obj_ctx(hal::FERMI_TWOD_A).unwrap();
        assert_eq!(
            *error::lock(ch.classes()),
            vec![classes.compute, hal::FERMI_TWOD_A]
        );

        let unbound = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        assert_eq!(unbound.alloc_obj_ctx(classes.compute), Err(EINVAL));
    }

    #[test]
    fn golden_image_is_captured_once() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let vm = gpu.create_vm(0, "golden").unwrap();
        let compute = gpu.gr.hal().classes().compute;

        let (tsg_a, a) = gr_channel(&gpu, &vm);
        a.alloc_obj_ctx(compute).unwrap();
        assert!(gpu.gr.has_golden());

        let (tsg_b, b) = gr_channel(&gpu, &vm);
        b.alloc_obj_ctx(compute).unwrap();

        let saves = sim
            .fecs_methods()
            .into_iter()
            .filter(|m| *m == fecs::METHOD_WFI_GOLDEN_SAVE)
            .count();
        assert_eq!(saves, 1);

        // Both contexts are committed to their channel, with their own patch buffer.
        for (tsg, ch) in [(&tsg_a, &a), (&tsg_b, &b)] {
            let slot = error::lock(tsg.gr_ctx());
            let ctx = slot.as_ref().unwrap();
            assert_eq!(ch.inst().engine_ctx(), ctx.main.va);
            assert_eq!(
                ctx.main.mem.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_PATCH_ADR_LO),
                ctx.patch.va as u32
            );
            assert_eq!(
                ctx.main.mem.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_COMPUTE_PREEMPTION_OPTIONS),
                ctx::compute_option(ComputePreemption::Cta)
            );
        }
    }

    #[test]
    fn volta_channels_get_a_subctx_header() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "subctx").unwrap();
        let (tsg, ch) = gr_channel(&gpu, &vm);
        let mappings = vm.mapping_count();

        ch.alloc_obj_ctx(gpu.gr.hal().classes().compute).unwrap();
        // Main, patch, pm and zcull buffers, four global buffers and the header.
        assert_eq!(vm.mapping_count() - mappings, 9);

        {
            let slot = error::lock(tsg.gr_ctx());
            let ctx = slot.as_ref().unwrap();
            let sub = error::lock(ch.subctx());
            let header = sub.as_ref().unwrap();

            assert_eq!(ch.inst().engine_ctx(), header.va());
            let m = header.mem();
            assert_eq!(
                m.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_CTL),
                ctx::CTL_TYPE_PER_VEID_HEADER
            );
            assert_eq!(
                m.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_CONTEXT_BUFFER_PTR_LO),
                ctx.main.va as u32
            );
            assert_eq!(
                m.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_PRIV_ACCESS_MAP_ADDR_LO),
                ctx.globals.priv_access_map.va as u32
            );
        }

        ch.close().unwrap();
        drop(ch);
        drop(tsg);
        assert!(vm.mapping_count() < mappings);
    }

    #[test]
    fn preemption_modes() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "preempt").unwrap();
        let (tsg, ch) = gr_channel(&gpu, &vm);

        assert_eq!(
            ch.set_preemption_mode(None, Some(ComputePreemption::Cilp)),
            Err(EINVAL)
        );

        ch.alloc_obj_ctx(gpu.gr.hal().classes().compute).unwrap();
        ch.set_preemption_mode(Some(GraphicsPreemption::Gfxp), Some(ComputePreemption::Cilp))
            .unwrap();
        assert!(sim.preempted_tsgs().contains(&tsg.tsgid()));

        {
            let slot = error::lock(tsg.gr_ctx());
            let ctx = slot.as_ref().unwrap();
            let m = &ctx.main.mem;
            assert!(ctx.preempt.is_some());
            assert_eq!(
                m.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_GRAPHICS_PREEMPTION_OPTIONS),
                1
            );
            assert_eq!(
                m.rd32(ctx::CTXSW_PROG_MAIN_IMAGE_COMPUTE_PREEMPTION_OPTIONS),
                2
            );
        }

        // No way back to a coarser mode.
        assert_eq!(
            ch.set_preemption_mode(None, Some(ComputePreemption::Cta)),
            Err(EINVAL)
        );
        ch.set_preemption_mode(None, Some(ComputePreemption::Cilp))
            .unwrap();
    }

    #[test]
    fn exception_recovers_the_current_context() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "exc").unwrap();
        let (tsg, ch) = gr_channel(&gpu, &vm);
        ch.alloc_obj_ctx(gpu.gr.hal().classes().compute).unwrap();

        sim.poke(regs::NV_PGRAPH_PRI_SM_HWW_GLOBAL_ESR::OFFSET, 0x10);
        sim.poke(regs::NV_PGRAPH_PRI_SM_HWW_WARP_ESR::OFFSET, 0x2a);
        sim.poke(regs::NV_PGRAPH_PRI_SM_HWW_WARP_ESR_PC::OFFSET, 0x400);
        sim.poke(
            regs::NV_PGRAPH_EXCEPTION::OFFSET,
            regs::NV_PGRAPH_EXCEPTION::default().set_gpc(true).raw(),
        );
        sim.inject_gr_intr(
            regs::NV_PGRAPH_INTR::default().set_exception(true).raw(),
            Some(&ch),
        );
        gpu.isr_stall().unwrap();

        assert_eq!(
            tsg.sm_error(0),
            Some(SmErrorState {
                hww_global_esr: 0x10,
                hww_warp_esr: 0x2a,
                hww_warp_esr_pc: 0x400,
            })
        );
        assert_eq!(gpu.ecc.get(EccCounter::GrException), 1);
        assert_eq!(ch.error_notifier(), Some(ErrorNotifier::GrException.code()));
        assert!(tsg.is_unserviceable());
        assert_eq!(regs::NV_PGRAPH_INTR::read(&gpu.bar).raw(), 0);
    }

    #[test]
    fn known_sw_methods_are_emulated() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let vm = gpu.create_vm(0, "swm").unwrap();
        let (tsg, ch) = gr_channel(&gpu, &vm);
        ch.alloc_obj_ctx(gpu.gr.hal().classes().compute).unwrap();

        let illegal = regs::NV_PGRAPH_INTR::default().set_illegal_method(true).raw();
        sim.poke(regs::NV_PGRAPH_TRAPPED_ADDR::OFFSET, 0x1528);
        sim.inject_gr_intr(illegal, Some(&ch));
        gpu.isr_stall().unwrap();
        assert_eq!(ch.error_notifier(), None);

        sim.poke(regs::NV_PGRAPH_TRAPPED_ADDR::OFFSET, 0x1ffc);
        sim.inject_gr_intr(illegal, Some(&ch));
        gpu.isr_stall().unwrap();
        assert_eq!(ch.error_notifier(), Some(ErrorNotifier::GrSwMethod.code()));
        assert!(tsg.is_unserviceable());
    }

    #[test]
    fn semaphore_interrupt_posts_an_event() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let vm = gpu.create_vm(0, "sema").unwrap();
        let (_tsg, ch) = gr_channel(&gpu, &vm);
        ch.alloc_obj_ctx(gpu.gr.hal().classes().compute).unwrap();

        sim.inject_gr_intr(
            regs::NV_PGRAPH_INTR::default().set_semaphore(true).raw(),
            Some(&ch),
        );
        gpu.isr_stall().unwrap();

        assert_eq!(
            ch.wait_event(Duration::from_millis(10)),
            Ok(ChannelEvent::Blocking)
        );
        assert_eq!(ch.error_notifier(), None);
    }
}
