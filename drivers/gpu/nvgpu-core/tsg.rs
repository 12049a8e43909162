// SPDX-License-Identifier: GPL-2.0

//! Timeslice groups.
//!
//! A TSG is the unit the scheduler runs: its channels share one GR context and one timeslice,
//! and appear together in their runlist. A channel holds a reference on its TSG for as long as
//! it is bound; the TSG only keeps weak references on its channels.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, warn};

use crate::channel::Channel;
use crate::error::{self, code::*, Result};
use crate::fifo::runlist::{InterleaveLevel, RunlistChannel, RunlistTsg};
use crate::fifo::Fifo;
use crate::gpu::{Gpu, GpuState};
use crate::gr::ctx::GrCtx;
use crate::mm::vm::Vm;

/// Error state an SM reported, kept for the debugger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmErrorState {
    pub hww_global_esr: u32,
    pub hww_warp_esr: u32,
    pub hww_warp_esr_pc: u64,
}

struct Member {
    chid: u32,
    ch: Weak<Channel>,
    entry: RunlistChannel,
}

#[derive(Default)]
struct Members {
    /// Set by the first bind, for the lifetime of the TSG.
    runlist_id: Option<u32>,
    vm: Option<Arc<Vm>>,
    list: Vec<Member>,
}

pub struct Tsg {
    gpu: Arc<Gpu>,
    tsgid: u32,
    members: RwLock<Members>,
    timeslice_us: AtomicU32,
    interleave: Mutex<InterleaveLevel>,
    unserviceable: AtomicBool,
    gr_ctx: Mutex<Option<GrCtx>>,
    sm_errors: Mutex<Vec<SmErrorState>>,
}

impl Tsg {
    /// Opens an empty TSG with the configured timeslice and interleave level.
    pub fn open(gpu: &Arc<Gpu>) -> Result<Arc<Tsg>> {
        if gpu.state() != GpuState::Ready {
            return Err(EINVAL);
        }
        if gpu.fifo.is_quiesced() {
            return Err(EFATAL);
        }

        let tsgid = gpu.fifo.alloc_tsgid()?;
        let num_sm = gpu.gr.config().num_sm as usize;

        let tsg = Arc::new(Tsg {
            gpu: gpu.clone(),
            tsgid,
            members: RwLock::new(Members::default()),
            timeslice_us: AtomicU32::new(gpu.config.default_timeslice_us),
            interleave: Mutex::new(gpu.config.default_interleave),
            unserviceable: AtomicBool::new(false),
            gr_ctx: Mutex::new(None),
            sm_errors: Mutex::new(vec![SmErrorState::default(); num_sm]),
        });
        gpu.fifo.register_tsg(&tsg);
        debug!("tsg {}: open", tsgid);

        Ok(tsg)
    }

    pub fn tsgid(&self) -> u32 {
        self.tsgid
    }

    pub(crate) fn runlist_id(&self) -> Option<u32> {
        error::read(&self.members).runlist_id
    }

    /// Address space of the TSG's GR context, from the first channel bound.
    pub(crate) fn vm(&self) -> Option<Arc<Vm>> {
        error::read(&self.members).vm.clone()
    }

    pub(crate) fn gr_ctx(&self) -> &Mutex<Option<GrCtx>> {
        &self.gr_ctx
    }

    pub fn num_channels(&self) -> usize {
        error::read(&self.members).list.len()
    }

    /// Bound channels that are still alive.
    pub(crate) fn channels(&self) -> Vec<Arc<Channel>> {
        let weak = error::read(&self.members)
            .list
            .iter()
            .map(|m| m.ch.clone())
            .collect::<Vec<_>>();

        weak.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn is_unserviceable(&self) -> bool {
        self.unserviceable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unserviceable(&self) {
        self.unserviceable.store(true, Ordering::Release);
    }

    fn check_compatible(&self, members: &Members, ch: &Channel) -> Result {
        if members.runlist_id.is_some_and(|id| id != ch.runlist_id()) {
            return Err(EINVAL);
        }

        // Every subcontext of the TSG runs in the address space its GR context is mapped in.
        if members.vm.as_ref().is_some_and(|vm| !Arc::ptr_eq(vm, ch.vm())) {
            return Err(EINVAL);
        }

        Ok(())
    }

    /// Binds `ch` to the TSG and resubmits the runlist with it.
    pub fn bind_channel(self: &Arc<Self>, ch: &Arc<Channel>) -> Result {
        if self.is_unserviceable() {
            return Err(EFATAL);
        }
        if ch.tsg().is_some() || ch.is_unserviceable() {
            return Err(EINVAL);
        }

        let runlist_id = ch.runlist_id();
        {
            let mut members = error::write(&self.members);
            self.check_compatible(&members, ch)
                .inspect_err(|_| warn!("tsg {}: channel {} incompatible", self.tsgid, ch.chid()))?;

            members.runlist_id = Some(runlist_id);
            members.vm.get_or_insert_with(|| ch.vm().clone());
            members.list.push(Member {
                chid: ch.chid(),
                ch: Arc::downgrade(ch),
                entry: ch.runlist_entry(),
            });
        }
        ch.set_tsg(Some(self.clone()));

        let fifo = &self.gpu.fifo;
        if let Some(rl) = fifo.runlist(runlist_id) {
            rl.set_active(self.tsgid, true);
        }

        fifo.runlist_reload(&self.gpu, runlist_id, false, true)
            .inspect_err(|e| {
                warn!("tsg {}: bind of channel {} failed: {:?}", self.tsgid, ch.chid(), e);
                ch.set_tsg(None);
                self.remove(ch.chid());
            })?;

        debug!("tsg {}: bound channel {}", self.tsgid, ch.chid());
        Ok(())
    }

    /// Drops `chid` from the member list. Returns whether it was there.
    fn remove(&self, chid: u32) -> bool {
        let (found, empty, runlist_id) = {
            let mut members = error::write(&self.members);
            let before = members.list.len();
            members.list.retain(|m| m.chid != chid);
            (
                members.list.len() != before,
                members.list.is_empty(),
                members.runlist_id,
            )
        };

        if found && empty {
            if let Some(rl) = runlist_id.and_then(|id| self.gpu.fifo.runlist(id)) {
                rl.set_active(self.tsgid, false);
            }
        }

        found
    }

    /// Removes channel `chid` from the TSG. The TSG is preempted first, and leaves its runlist
    /// with its last channel.
    pub(crate) fn unbind_channel(&self, chid: u32) -> Result {
        let gpu = &self.gpu;
        let fifo = &gpu.fifo;

        if !error::read(&self.members).list.iter().any(|m| m.chid == chid) {
            return Err(EINVAL);
        }

        if let Err(e) = fifo.preempt_tsg(gpu, self.tsgid) {
            warn!("tsg {}: preempt for unbind failed: {:?}", self.tsgid, e);
        }

        self.remove(chid);

        match self.runlist_id() {
            Some(id) => fifo.runlist_reload(gpu, id, false, true),
            None => Ok(()),
        }
    }

    /// Enables every channel of the TSG.
    pub fn enable(&self) -> Result {
        self.channels().iter().try_for_each(|ch| ch.enable())
    }

    pub fn disable(&self) {
        for ch in self.channels() {
            ch.disable();
        }
    }

    pub fn timeslice(&self) -> u32 {
        self.timeslice_us.load(Ordering::Relaxed)
    }

    fn reload(&self) -> Result {
        match self.runlist_id() {
            Some(id) if self.num_channels() > 0 => {
                self.gpu.fifo.runlist_reload(&self.gpu, id, false, true)
            }
            _ => Ok(()),
        }
    }

    /// Sets the timeslice of the TSG, in microseconds.
    pub fn set_timeslice(&self, us: u32) -> Result {
        let config = &self.gpu.config;
        if !(config.min_timeslice_us..=config.max_timeslice_us).contains(&us) {
            return Err(EINVAL);
        }

        self.timeslice_us.store(us, Ordering::Relaxed);
        self.reload()
    }

    pub fn interleave(&self) -> InterleaveLevel {
        *error::lock(&self.interleave)
    }

    pub fn set_interleave(&self, level: InterleaveLevel) -> Result {
        *error::lock(&self.interleave) = level;
        self.reload()
    }

    /// Description of the TSG for the runlist builder.
    pub(crate) fn runlist_entry(&self, _fifo: &Fifo) -> RunlistTsg {
        let channels = error::read(&self.members)
            .list
            .iter()
            .map(|m| m.entry)
            .collect();

        RunlistTsg {
            tsgid: self.tsgid,
            timeslice: self.timeslice(),
            level: self.interleave(),
            channels,
        }
    }

    /// Records the error state of SM `sm`.
    pub(crate) fn record_sm_error(&self, sm: usize, state: SmErrorState) -> Result {
        let mut errors = error::lock(&self.sm_errors);
        let slot = errors.get_mut(sm).ok_or(EINVAL)?;
        *slot = state;
        Ok(())
    }

    pub fn sm_error(&self, sm: usize) -> Option<SmErrorState> {
        error::lock(&self.sm_errors).get(sm).copied()
    }

    pub fn clear_sm_errors(&self) {
        error::lock(&self.sm_errors).fill(SmErrorState::default());
    }
}

impl Drop for Tsg {
    fn drop(&mut self) {
        let members = match self.members.get_mut() {
            Ok(members) => members,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(rl) = members.runlist_id.and_then(|id| self.gpu.fifo.runlist(id)) {
            rl.set_active(self.tsgid, false);
        }

        // Unmaps from the TSG's address space.
        error::lock(&self.gr_ctx).take();
        self.gpu.fifo.release_tsgid(self.tsgid);
        debug!("tsg {}: released", self.tsgid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelParams, GpfifoEntry, SubmitArgs};
    use crate::dma::Aperture;
    use crate::fifo::engines::EngineType;
    use crate::fifo::runlist::RunlistEntry;
    use crate::fifo::ErrorNotifier;
    use crate::gpu::Chipset;
    use crate::mm::vm::{MapFlags, SyncMap};
    use crate::regs;
    use crate::semaphore::Semaphore;
    use crate::sim;
    use crate::sync::hal::sync_hal;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn runlist_tsgs(gpu: &Gpu, runlist_id: u32) -> Vec<u32> {
        let fifo = &gpu.fifo;
        fifo.runlist(runlist_id)
            .unwrap()
            .current(fifo.runlist_format())
            .into_iter()
            .filter_map(|e| match e {
                RunlistEntry::Tsg { tsgid, .. } => Some(tsgid),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn submit_release_then_close() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let chids = gpu.fifo.channels_in_use();
        let tsgids = gpu.fifo.tsgs_in_use();

        let tsg = Tsg::open(&gpu).unwrap();
        assert_eq!(tsg.timeslice(), 5000);
        assert_eq!(tsg.interleave(), InterleaveLevel::Medium);

        let vm = gpu.create_vm(0, "s1").unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();
        tsg.enable().unwrap();
        assert_eq!(runlist_tsgs(&gpu, ch.runlist_id()), vec![tsg.tsgid()]);

        // A push buffer releasing S to 1.
        let s = gpu.sema_sea.alloc().unwrap();
        let s_va = vm
            .sync_map(SyncMap::SemaphoreRw, &gpu.sema_sea.mem().unwrap())
            .unwrap()
            + s.offset();
        let mut cmd = Vec::new();
        sync_hal(Chipset::GV11B).sema_release(s_va, 1, false, &mut cmd);
        let pb = gpu.dma.alloc(cmd.len() * 4, Aperture::Sysmem).unwrap();
        for (i, word) in cmd.iter().enumerate() {
            pb.wr32(i * 4, *word);
        }
        let pb_va = vm.map(&pb, MapFlags::empty(), 0).unwrap();

        let entry = GpfifoEntry {
            va: pb_va,
            words: cmd.len() as u32,
        };
        let fence = ch
            .submit(
                &[entry],
                SubmitArgs {
                    get_fence: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        sim.run_channel(&ch);

        let sema = Semaphore::new(s.clone(), 1);
        gpu.sema_sea
            .wait_until(|| sema.is_released(), Duration::from_millis(100))
            .unwrap();
        fence.wait(Duration::from_millis(100)).unwrap();

        ch.close().unwrap();
        drop(ch);
        assert_eq!(tsg.num_channels(), 0);
        assert!(runlist_tsgs(&gpu, 0).is_empty());
        drop(tsg);

        assert_eq!(gpu.fifo.channels_in_use(), chids);
        assert_eq!(gpu.fifo.tsgs_in_use(), tsgids);
    }

    #[test]
    fn fatal_pbdma_fault_recovers_the_tsg() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "s4").unwrap();

        let victim = Tsg::open(&gpu).unwrap();
        let other = Tsg::open(&gpu).unwrap();
        let chans = (0..2)
            .map(|_| Channel::open(&gpu, &vm, ChannelParams::default()).unwrap())
            .collect::<Vec<_>>();
        let bystander = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        for ch in &chans {
            victim.bind_channel(ch).unwrap();
        }
        other.bind_channel(&bystander).unwrap();
        assert_eq!(
            runlist_tsgs(&gpu, 0),
            vec![victim.tsgid(), other.tsgid()]
        );

        let method = regs::NV_PPBDMA_INTR_0::default().set_method(true).raw();
        sim.inject_pbdma_intr(0, method, Some(victim.tsgid()));
        sim.set_engine_running(0, victim.tsgid());
        gpu.isr_stall().unwrap();

        assert_eq!(sim.preempted_tsgs(), vec![victim.tsgid()]);
        for ch in &chans {
            assert_eq!(ch.error_notifier(), Some(ErrorNotifier::PbdmaError.code()));
            assert!(ch.is_unserviceable());
        }
        assert_eq!(bystander.error_notifier(), None);
        assert!(victim.is_unserviceable());
        assert_eq!(runlist_tsgs(&gpu, 0), vec![other.tsgid()]);

        let extra = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        assert_eq!(victim.bind_channel(&extra), Err(EFATAL));
    }

    #[test]
    fn timeslice_is_range_checked() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let tsg = Tsg::open(&gpu).unwrap();

        assert_eq!(tsg.set_timeslice(999), Err(EINVAL));
        assert_eq!(tsg.set_timeslice(50_001), Err(EINVAL));
        tsg.set_timeslice(1000).unwrap();
        tsg.set_timeslice(50_000).unwrap();
        assert_eq!(tsg.timeslice(), 50_000);
    }

    #[test]
    fn timeslice_reaches_the_runlist() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "ts").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();
        tsg.set_timeslice(20_000).unwrap();

        let fifo = &gpu.fifo;
        let entries = fifo.runlist(0).unwrap().current(fifo.runlist_format());
        let expected = crate::fifo::runlist::encode_timeslice(20_000);
        assert!(entries.iter().any(|e| matches!(
            e,
            RunlistEntry::Tsg { timeout, scale, .. } if (*timeout, *scale) == expected
        )));
    }

    #[test]
    fn high_interleave_repeats_in_the_runlist() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "il").unwrap();

        let mut tsgs = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..3 {
            let tsg = Tsg::open(&gpu).unwrap();
            let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
            tsg.bind_channel(&ch).unwrap();
            tsgs.push(tsg);
            channels.push(ch);
        }

        let high = &tsgs[2];
        high.set_interleave(InterleaveLevel::High).unwrap();
        assert_eq!(high.interleave(), InterleaveLevel::High);

        let fifo = &gpu.fifo;
        let entries = fifo.runlist(0).unwrap().current(fifo.runlist_format());
        let count = |id: u32| {
            entries
                .iter()
                .filter(|e| matches!(e, RunlistEntry::Tsg { tsgid, .. } if *tsgid == id))
                .count()
        };
        assert_eq!(count(high.tsgid()), 2);
        assert_eq!(count(tsgs[0].tsgid()), 1);
        assert_eq!(count(tsgs[1].tsgid()), 1);
    }

    #[test]
    fn bind_rejects_incompatible_channels() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "a").unwrap();
        let other_vm = gpu.create_vm(0, "b").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();

        let gr = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&gr).unwrap();
        assert_eq!(tsg.bind_channel(&gr), Err(EINVAL));

        // Copy engines are on their own runlist.
        let ce = ChannelParams {
            engine: EngineType::Ce,
            ..Default::default()
        };
        let ce = Channel::open(&gpu, &vm, ce).unwrap();
        assert_eq!(tsg.bind_channel(&ce), Err(EINVAL));

        // Same subcontext, other address space.
        let foreign = Channel::open(&gpu, &other_vm, ChannelParams::default()).unwrap();
        assert_eq!(tsg.bind_channel(&foreign), Err(EINVAL));

        // Other subcontexts share the address space too.
        let params = ChannelParams {
            veid: 1,
            ..Default::default()
        };
        let subctx = Channel::open(&gpu, &other_vm, params.clone()).unwrap();
        assert_eq!(tsg.bind_channel(&subctx), Err(EINVAL));
        let subctx = Channel::open(&gpu, &vm, params).unwrap();
        tsg.bind_channel(&subctx).unwrap();
        assert_eq!(tsg.num_channels(), 2);
    }

    #[test]
    fn pascal_tsg_shares_one_address_space() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let vm = gpu.create_vm(0, "a").unwrap();
        let other_vm = gpu.create_vm(0, "b").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();

        let a = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        let b = Channel::open(&gpu, &other_vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&a).unwrap();
        assert_eq!(tsg.bind_channel(&b), Err(EINVAL));
        assert!(b.tsg().is_none());
    }

    #[test]
    fn sm_error_states() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let tsg = Tsg::open(&gpu).unwrap();
        let num_sm = gpu.gr.config().num_sm as usize;

        let state = SmErrorState {
            hww_global_esr: 0x10,
            hww_warp_esr: 0x20,
            hww_warp_esr_pc: 0x1234,
        };
        tsg.record_sm_error(num_sm - 1, state).unwrap();
        assert_eq!(tsg.sm_error(num_sm - 1), Some(state));
        assert_eq!(tsg.record_sm_error(num_sm, state), Err(EINVAL));

        tsg.clear_sm_errors();
        assert_eq!(tsg.sm_error(num_sm - 1), Some(SmErrorState::default()));
    }
}
