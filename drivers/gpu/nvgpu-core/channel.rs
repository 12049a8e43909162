// SPDX-License-Identifier: GPL-2.0

//! Channels.
//!
//! A channel is a GPFIFO ring the host fetches push buffers from, an instance block describing
//! it to the scheduler, and the synchronization state used to track its jobs. Channels are
//! scheduled through the TSG they are bound to and start disabled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::dma::DmaObject;
use crate::error::{self, code::*, Result};
use crate::fence::{Fence, FencePool};
use crate::fifo::engines::EngineType;
use crate::fifo::runlist::RunlistChannel;
use crate::fifo::{self, ErrorNotifier};
use crate::gpu::{Architecture, Gpu, GpuState};
use crate::gr::subctx::SubctxHeader;
use crate::gr::{ComputePreemption, GraphicsPreemption};
use crate::mm::inst::InstBlock;
use crate::mm::vm::{MapFlags, Vm};
use crate::sync::{self, ChannelSync};
use crate::tsg::Tsg;

mod priv_cmd;
mod submit;

use priv_cmd::PrivCmdQueue;
pub use submit::{FenceWait, GpfifoEntry, SubmitArgs};
use submit::Job;

/// Bytes per GPFIFO entry.
pub(crate) const GPFIFO_ENTRY_SIZE: usize = 8;
/// Host semaphore acquire timeout written to the RAMFC.
const ACQUIRE_TIMEOUT: u32 = 0x7fff_f000;

/// Parameters of [`Channel::open`].
#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub engine: EngineType,
    /// GPFIFO ring entries, a power of two. Zero selects the configured default.
    pub gpfifo_entries: u32,
    /// Reserves fences for this many in-flight jobs. Zero allocates fences on demand.
    pub num_inflight_jobs: u32,
    /// Subcontext the channel runs in.
    pub veid: u32,
    pub replayable_faults: bool,
    /// Track jobs with a syncpoint instead of a semaphore.
    pub use_syncpoint: bool,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            engine: EngineType::Gr,
            gpfifo_entries: 0,
            num_inflight_jobs: 0,
            veid: 0,
            replayable_faults: false,
            use_syncpoint: false,
        }
    }
}

/// Notification posted on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An error was written to the error notifier.
    ErrorNotifier,
    /// A semaphore the channel may be blocked on was released.
    Blocking,
    /// The channel went through recovery.
    Recovery,
}

/// GPFIFO ring state, protected by the submit lock.
pub(crate) struct Ring {
    pub(crate) put: u32,
    /// Last entry known consumed, from retired jobs.
    pub(crate) get: u32,
    pub(crate) jobs: VecDeque<Job>,
    pub(crate) priv_cmd: PrivCmdQueue,
}

pub struct Channel {
    gpu: Arc<Gpu>,
    vm: Arc<Vm>,
    chid: u32,
    engine: EngineType,
    runlist_id: u32,
    veid: u32,
    inst: InstBlock,
    gpfifo: Arc<DmaObject>,
    gpfifo_va: u64,
    num_entries: u32,
    userd: Arc<DmaObject>,
    userd_offset: usize,
    sync: Box<dyn ChannelSync>,
    fence_pool: Option<Arc<FencePool>>,
    ring: Mutex<Ring>,
    tsg: Mutex<Option<Arc<Tsg>>>,
    subctx: Mutex<Option<SubctxHeader>>,
    classes: Mutex<Vec<u32>>,
    enabled: AtomicBool,
    unserviceable: AtomicBool,
    closed: AtomicBool,
    events: Mutex<VecDeque<ChannelEvent>>,
    events_cond: Condvar,
}

impl Channel {
    /// Opens a channel in `vm` on the engine selected by `params`.
    pub fn open(gpu: &Arc<Gpu>, vm: &Arc<Vm>, params: ChannelParams) -> Result<Arc<Channel>> {
        if gpu.state() != GpuState::Ready {
            return Err(EINVAL);
        }
        if gpu.fifo.is_quiesced() {
            return Err(EFATAL);
        }

        let engine = gpu.fifo.engine_of_type(params.engine).ok_or(ENOTSUPP)?;
        let num_entries = match params.gpfifo_entries {
            0 => gpu.config.gpfifo_entries,
            n => n,
        };
        if !num_entries.is_power_of_two() || num_entries < 2 {
            return Err(EINVAL);
        }
        if params.veid >= gpu.gr.hal().max_subctx() {
            return Err(EINVAL);
        }

        let chid = gpu.fifo.alloc_chid()?;
        Self::open_chid(gpu, vm, &params, engine.runlist_id, num_entries, chid).inspect_err(
            |e| {
                warn!("channel {}: open failed: {:?}", chid, e);
                gpu.fifo.release_chid(chid);
            },
        )
    }

    fn open_chid(
        gpu: &Arc<Gpu>,
        vm: &Arc<Vm>,
        params: &ChannelParams,
        runlist_id: u32,
        num_entries: u32,
        chid: u32,
    ) -> Result<Arc<Channel>> {
        let fifo = &gpu.fifo;
        let inst = InstBlock::alloc(&gpu.dma, gpu.mm.inst_aperture())?;
        inst.init_pdb(vm, gpu.mm.honors_aperture);
        if gpu.chipset().arch() >= Architecture::Volta {
            inst.init_subctx_pdbs(vm, gpu.mm.honors_aperture, params.replayable_faults);
        }

        let gpfifo = gpu.dma.alloc(
            num_entries as usize * GPFIFO_ENTRY_SIZE,
            crate::dma::Aperture::Sysmem,
        )?;
        let gpfifo_va = vm.map(&gpfifo, MapFlags::KERNEL | MapFlags::READ_ONLY, 0)?;

        let res = (|| {
            let (userd, userd_offset) = fifo.userd_slot(chid)?;
            userd.memset(userd_offset, 0, fifo::USERD_SIZE)?;
            inst.setup_ramfc(
                chid,
                gpfifo_va,
                num_entries,
                (
                    userd.addr() + userd_offset as u64,
                    fifo.target(userd.aperture()),
                ),
                ACQUIRE_TIMEOUT,
            )?;
            inst.set_channel_info(params.veid);

            let priv_cmd = PrivCmdQueue::new(&gpu.dma, vm, gpu.config.priv_cmd_words)?;
            let sync = sync::create(gpu, vm, chid, params.use_syncpoint)
                .inspect_err(|_| priv_cmd.unmap(vm))?;
            let fence_pool =
                (params.num_inflight_jobs > 0).then(|| FencePool::new(params.num_inflight_jobs as usize));

            Ok((userd, userd_offset, priv_cmd, sync, fence_pool))
        })();

        let (userd, userd_offset, priv_cmd, sync, fence_pool) = res.inspect_err(|_| {
            let _ = vm.unmap(gpfifo_va);
        })?;

        fifo.bind_channel_inst(&gpu.bar, chid, inst.addr(), inst.aperture());

        let ch = Arc::new(Channel {
            gpu: gpu.clone(),
            vm: vm.clone(),
            chid,
            engine: params.engine,
            runlist_id,
            veid: params.veid,
            inst,
            gpfifo,
            gpfifo_va,
            num_entries,
            userd,
            userd_offset,
            sync,
            fence_pool,
            ring: Mutex::new(Ring {
                put: 0,
                get: 0,
                jobs: VecDeque::new(),
                priv_cmd,
            }),
            tsg: Mutex::new(None),
            subctx: Mutex::new(None),
            classes: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
            unserviceable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: Mutex::new(VecDeque::new()),
            events_cond: Condvar::new(),
        });
        fifo.register_channel(&ch);

        debug!(
            "channel {}: open on runlist {}, {} entries at {:#x}",
            chid, runlist_id, num_entries, gpfifo_va
        );

        Ok(ch)
    }

    pub fn chid(&self) -> u32 {
        self.chid
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn veid(&self) -> u32 {
        self.veid
    }

    pub(crate) fn gpu(&self) -> &Arc<Gpu> {
        &self.gpu
    }

    pub(crate) fn runlist_id(&self) -> u32 {
        self.runlist_id
    }

    pub(crate) fn inst(&self) -> &InstBlock {
        &self.inst
    }

    pub(crate) fn gpfifo(&self) -> (&Arc<DmaObject>, u64, u32) {
        (&self.gpfifo, self.gpfifo_va, self.num_entries)
    }

    /// USERD buffer and the offset of this channel's slot.
    pub(crate) fn userd(&self) -> (&Arc<DmaObject>, usize) {
        (&self.userd, self.userd_offset)
    }

    pub(crate) fn subctx(&self) -> &Mutex<Option<SubctxHeader>> {
        &self.subctx
    }

    pub(crate) fn classes(&self) -> &Mutex<Vec<u32>> {
        &self.classes
    }

    /// Snapshot of the channel as the runlist describes it.
    pub(crate) fn runlist_entry(&self) -> RunlistChannel {
        let fifo = &self.gpu.fifo;

        RunlistChannel {
            chid: self.chid,
            inst_addr: self.inst.addr(),
            inst_target: fifo.target(self.inst.aperture()),
            userd_addr: self.userd.addr() + self.userd_offset as u64,
            userd_target: fifo.target(self.userd.aperture()),
        }
    }

    pub fn tsg(&self) -> Option<Arc<Tsg>> {
        error::lock(&self.tsg).clone()
    }

    pub(crate) fn set_tsg(&self, tsg: Option<Arc<Tsg>>) {
        *error::lock(&self.tsg) = tsg;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Lets the scheduler run the channel.
    pub fn enable(&self) -> Result {
        if self.is_unserviceable() {
            return Err(EFATAL);
        }

        self.enabled.store(true, Ordering::Release);
        self.gpu.fifo.enable_channel(&self.gpu.bar, self.chid);
        Ok(())
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.gpu.fifo.disable_channel(&self.gpu.bar, self.chid);
    }

    /// Whether the channel was stopped by a fault.
    pub fn is_unserviceable(&self) -> bool {
        self.unserviceable.load(Ordering::Acquire)
    }

    /// Error code last written to the channel's error notifier.
    pub fn error_notifier(&self) -> Option<u32> {
        fifo::read_error_notifier(&self.userd, self.userd_offset)
    }

    /// Stops the channel after a fault and tells its users.
    pub(crate) fn abort(&self, notifier: ErrorNotifier) {
        fifo::write_error_notifier(&self.gpu.bar, &self.userd, self.userd_offset, notifier.code());
        self.unserviceable.store(true, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        self.sync.set_min_eq_max();

        self.post_event(ChannelEvent::ErrorNotifier);
        self.post_event(ChannelEvent::Recovery);
        warn!(
            "channel {}: aborted with error {} ({:?})",
            self.chid,
            notifier.code(),
            notifier
        );
    }

    pub(crate) fn post_event(&self, event: ChannelEvent) {
        error::lock(&self.events).push_back(event);
        self.events_cond.notify_all();
    }

    /// Waits for the next event posted on the channel.
    pub fn wait_event(&self, timeout: Duration) -> Result<ChannelEvent> {
        // `None` waits forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut events = error::lock(&self.events);

        loop {
            if let Some(event) = events.pop_front() {
                return Ok(event);
            }

            events = match deadline {
                None => self
                    .events_cond
                    .wait(events)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ETIMEDOUT);
                    }
                    match self.events_cond.wait_timeout(events, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }

    /// Allocates an object of `class` on the channel. The first object of a TSG creates its GR
    /// context.
    pub fn alloc_obj_ctx(&self, class: u32) -> Result {
        let tsg = self.tsg().ok_or(EINVAL)?;
        self.gpu.gr.alloc_obj_ctx(&self.gpu, self, &tsg, class)
    }

    /// Selects the preemption modes of the channel's GR context.
    pub fn set_preemption_mode(
        &self,
        graphics: Option<GraphicsPreemption>,
        compute: Option<ComputePreemption>,
    ) -> Result {
        let tsg = self.tsg().ok_or(EINVAL)?;
        self.gpu
            .gr
            .set_preemption_mode(&self.gpu, &tsg, graphics, compute)
    }

    /// Disables the channel and waits for the submitted jobs, then releases it. Jobs still
    /// running after the close timeout are abandoned.
    pub fn close(&self) -> Result {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.disable();
        let res = self.wait_idle(self.gpu.config.channel_close_timeout);
        if res.is_err() {
            warn!("channel {}: jobs still pending at close", self.chid);
        }

        self.teardown();
        res
    }

    fn wait_idle(&self, timeout: Duration) -> Result {
        let last = error::lock(&self.ring)
            .jobs
            .back()
            .map(|job| job.fence.clone());

        match last {
            Some(fence) if !self.is_unserviceable() => fence.wait(timeout),
            _ => Ok(()),
        }
    }

    fn teardown(&self) {
        let gpu = &self.gpu;
        let fifo = &gpu.fifo;

        self.disable();

        let tsg = error::lock(&self.tsg).take();
        if let Some(tsg) = tsg {
            if let Err(e) = tsg.unbind_channel(self.chid) {
                warn!("channel {}: unbind from TSG {}: {:?}", self.chid, tsg.tsgid(), e);
            }
        }

        fifo.unbind_channel_inst(&gpu.bar, self.chid);

        let mut ring = error::lock(&self.ring);
        ring.jobs.clear();
        ring.priv_cmd.unmap(&self.vm);
        drop(ring);

        let subctx = error::lock(&self.subctx).take();
        if let Some(subctx) = subctx {
            subctx.unmap(&self.vm);
        }
        let _ = self.vm.unmap(self.gpfifo_va);

        fifo.release_chid(self.chid);
        debug!("channel {}: closed", self.chid);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuConfig;
    use crate::gpu::Chipset;
    use crate::sim;
    use pretty_assertions::assert_eq;

    #[test]
    fn open_starts_disabled_and_bound() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ch").unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();

        assert!(!ch.is_enabled());
        let inst = crate::regs::NV_PCCSR_CHANNEL_INST::from(
            sim.peek(crate::regs::NV_PCCSR_CHANNEL_INST::offset(ch.chid() as usize)),
        );
        assert!(inst.bind());
        assert_eq!(u64::from(inst.ptr()) << 12, ch.inst().addr());
        assert_eq!(ch.inst().gpfifo(), (ch.gpfifo().1, 128));
        assert_eq!(ch.inst().pdb_addr(), vm.pdb_addr() & !0xfff);
        assert_eq!(ch.error_notifier(), None);
    }

    #[test]
    fn open_validates_parameters() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let vm = gpu.create_vm(0, "ch").unwrap();

        let bad_ring = ChannelParams {
            gpfifo_entries: 100,
            ..Default::default()
        };
        assert!(matches!(Channel::open(&gpu, &vm, bad_ring), Err(EINVAL)));

        // No subcontexts before Volta.
        let bad_veid = ChannelParams {
            veid: 1,
            ..Default::default()
        };
        assert!(matches!(Channel::open(&gpu, &vm, bad_veid), Err(EINVAL)));

        // No video decoder on an iGPU.
        let nvdec = ChannelParams {
            engine: EngineType::Nvdec,
            ..Default::default()
        };
        assert!(matches!(Channel::open(&gpu, &vm, nvdec), Err(ENOTSUPP)));
        assert_eq!(gpu.fifo.channels_in_use(), 0);
    }

    #[test]
    fn failed_open_releases_the_chid() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ch").unwrap();
        gpu.dma.fail_after(Some(1));

        assert!(matches!(
            Channel::open(&gpu, &vm, ChannelParams::default()),
            Err(ENOMEM)
        ));
        gpu.dma.fail_after(None);
        assert_eq!(gpu.fifo.channels_in_use(), 0);
    }

    #[test]
    fn drop_releases_the_chid() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ch").unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        let chid = ch.chid();
        assert_eq!(gpu.fifo.channels_in_use(), 1);

        drop(ch);
        assert_eq!(gpu.fifo.channels_in_use(), 0);
        assert!(gpu.fifo.channel(chid).is_none());
        assert_eq!(
            sim.peek(crate::regs::NV_PCCSR_CHANNEL_INST::offset(chid as usize)),
            0
        );
    }

    #[test]
    fn events_are_delivered_in_order() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ch").unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();

        assert_eq!(ch.wait_event(Duration::from_millis(1)), Err(ETIMEDOUT));
        ch.abort(ErrorNotifier::GrException);
        assert_eq!(ch.wait_event(Duration::ZERO), Ok(ChannelEvent::ErrorNotifier));
        assert_eq!(ch.wait_event(Duration::ZERO), Ok(ChannelEvent::Recovery));
        assert_eq!(ch.error_notifier(), Some(13));
        assert!(ch.is_unserviceable());
        assert_eq!(ch.enable(), Err(EFATAL));
    }

    #[test]
    fn unbounded_event_wait() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ch").unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();

        ch.abort(ErrorNotifier::GrException);
        assert_eq!(ch.wait_event(Duration::MAX), Ok(ChannelEvent::ErrorNotifier));
        assert_eq!(ch.wait_event(Duration::MAX), Ok(ChannelEvent::Recovery));

        // Sleeps until another thread posts.
        std::thread::scope(|s| {
            let waiter = s.spawn(|| ch.wait_event(Duration::MAX));
            std::thread::sleep(Duration::from_millis(5));
            ch.post_event(ChannelEvent::Blocking);
            assert_eq!(waiter.join().unwrap(), Ok(ChannelEvent::Blocking));
        });
    }

    #[test]
    fn close_disables_before_waiting() {
        let config = GpuConfig {
            channel_close_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (_sim, gpu) = sim::probe(Chipset::GV11B, config, sim::platform());
        gpu.init().unwrap();
        let vm = gpu.create_vm(0, "ch").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();
        ch.enable().unwrap();
        ch.submit(&[], Default::default()).unwrap();

        // The job never runs, so close waits out its timeout.
        std::thread::scope(|s| {
            let closer = s.spawn(|| ch.close());
            std::thread::sleep(Duration::from_millis(20));
            assert!(!closer.is_finished());
            assert!(!ch.is_enabled());
            assert_eq!(closer.join().unwrap(), Err(ETIMEDOUT));
        });
        assert_eq!(tsg.num_channels(), 0);
    }

    #[test]
    fn quiesced_device_refuses_channels() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ch").unwrap();
        gpu.fifo.set_quiesced();

        assert!(matches!(
            Channel::open(&gpu, &vm, ChannelParams::default()),
            Err(EFATAL)
        ));
    }
}
