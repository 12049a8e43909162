// SPDX-License-Identifier: GPL-2.0

//! Host FIFO.
//!
//! Owns the engine registry, the runlists and the channel and TSG id spaces, and services the
//! PFIFO interrupt. USERD, the per-channel memory the host reads GP_PUT from, is one buffer
//! shared by every channel.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::Channel;
use crate::config::GpuConfig;
use crate::dma::{aperture_mask_raw, Aperture, DmaAllocator, DmaObject};
use crate::ecc::EccCounter;
use crate::error::{self, code::*, Result};
use crate::fb::MmuFaultInfo;
use crate::gpu::{Architecture, Chipset, Gpu};
use crate::id_pool::IdPool;
use crate::intr::NonstallOps;
use crate::io::Bar0;
use crate::regs;
use crate::tsg::Tsg;
use crate::util;

use engines::{EngineInfo, EngineType};
use hal::FifoHal;
use recovery::RecoveryScope;
use runlist::{Runlist, RunlistFormat};

pub(crate) mod engines;
mod hal;
pub(crate) mod pbdma;
pub(crate) mod recovery;
pub mod runlist;

/// Bytes of USERD per channel.
pub(crate) const USERD_SIZE: usize = 512;
pub(crate) const USERD_GP_GET: usize = 0x88;
pub(crate) const USERD_GP_PUT: usize = 0x8c;
/// Error notifier record: timestamp, info32, then info16 and status.
pub(crate) const USERD_ERROR_NOTIFIER: usize = 0x1e0;
const ERROR_NOTIFIER_STATUS_SET: u32 = 0xffff << 16;

/// Error reported to a channel through its error notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorNotifier {
    IdleTimeout,
    GrSwMethod,
    GrSwNotify,
    GrException,
    GrSemaphoreTimeout,
    GrIllegalNotify,
    MmuFault,
    PbdmaError,
    FecsFirmwareMethod,
    ResetChannelVerif,
    PbdmaCrc,
}

impl ErrorNotifier {
    /// Value written to the notifier's info32 word.
    pub fn code(self) -> u32 {
        match self {
            Self::IdleTimeout => 8,
            Self::GrSwMethod => 12,
            Self::GrSwNotify | Self::GrException => 13,
            Self::GrSemaphoreTimeout => 24,
            Self::GrIllegalNotify => 25,
            Self::MmuFault => 31,
            Self::PbdmaError => 32,
            Self::FecsFirmwareMethod => 37,
            Self::ResetChannelVerif => 43,
            Self::PbdmaCrc => 80,
        }
    }
}

/// Writes the error notifier record of the channel whose USERD slot starts at `offset`.
pub(crate) fn write_error_notifier(bar: &Bar0, userd: &DmaObject, offset: usize, code: u32) {
    let base = offset + USERD_ERROR_NOTIFIER;
    let lo = regs::NV_PTIMER_TIME_0::read(bar).value();
    let hi = regs::NV_PTIMER_TIME_1::read(bar).value();

    userd.wr32(base, lo);
    userd.wr32(base + 4, hi);
    userd.wr32(base + 8, code);
    userd.wr32(base + 12, ERROR_NOTIFIER_STATUS_SET);
}

/// Reads back the code of the error notifier record, if one was written.
pub(crate) fn read_error_notifier(userd: &DmaObject, offset: usize) -> Option<u32> {
    let base = offset + USERD_ERROR_NOTIFIER;

    (userd.rd32(base + 12) & ERROR_NOTIFIER_STATUS_SET != 0).then(|| userd.rd32(base + 8))
}

const fn max_channels(chipset: Chipset) -> u32 {
    match chipset.arch() {
        Architecture::Pascal | Architecture::Volta => 512,
        Architecture::Turing => 4096,
    }
}

pub(crate) struct Fifo {
    chipset: Chipset,
    hal: &'static dyn FifoHal,
    num_channels: u32,
    is_dgpu: bool,
    engines: OnceLock<Vec<EngineInfo>>,
    num_pbdma: AtomicU32,
    runlists: OnceLock<Vec<Runlist>>,
    userd: OnceLock<Arc<DmaObject>>,
    channels: RwLock<Vec<Option<Weak<Channel>>>>,
    chids: Mutex<IdPool>,
    tsgs: RwLock<Vec<Option<Weak<Tsg>>>>,
    tsgids: Mutex<IdPool>,
    /// Set once an unrecovered fault stopped the device.
    quiesced: AtomicBool,
    /// Serializes recoveries.
    pub(crate) recovery_lock: Mutex<()>,
}

impl Fifo {
    pub(crate) fn new(chipset: Chipset, config: &GpuConfig) -> Self {
        let num_channels = config.num_channels.clamp(1, max_channels(chipset));
        let n = num_channels as usize;

        Self {
            chipset,
            hal: hal::fifo_hal(chipset),
            num_channels,
            is_dgpu: !chipset.is_igpu(),
            engines: OnceLock::new(),
            num_pbdma: AtomicU32::new(0),
            runlists: OnceLock::new(),
            userd: OnceLock::new(),
            channels: RwLock::new(vec![None; n]),
            chids: Mutex::new(IdPool::with_capacity(n)),
            tsgs: RwLock::new(vec![None; n]),
            tsgids: Mutex::new(IdPool::with_capacity(n)),
            quiesced: AtomicBool::new(false),
            recovery_lock: Mutex::new(()),
        }
    }

    pub(crate) fn num_channels(&self) -> u32 {
        self.num_channels
    }

    pub(crate) fn num_pbdma(&self) -> u32 {
        self.num_pbdma.load(Ordering::Relaxed)
    }

    pub(crate) fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    pub(crate) fn set_quiesced(&self) {
        self.quiesced.store(true, Ordering::Release);
    }

    pub(crate) fn runlist_format(&self) -> &'static dyn RunlistFormat {
        self.hal.runlist_format()
    }

    /// Reads the engine registry from the device info table.
    pub(crate) fn init_engines(&self, bar: &Bar0) -> Result {
        let num_pbdma = regs::NV_PFIFO_HOST_NUM_PBDMA::read(bar).value();
        self.num_pbdma.store(num_pbdma, Ordering::Relaxed);

        if self.engines.get().is_none() {
            let engines = engines::read_device_info(bar, num_pbdma)?;
            info!(
                "{}: {} engines, {} PBDMAs",
                self.chipset,
                engines.len(),
                num_pbdma
            );
            let _ = self.engines.set(engines);
        }

        Ok(())
    }

    pub(crate) fn engines(&self) -> &[EngineInfo] {
        self.engines.get().map_or(&[], Vec::as_slice)
    }

    /// First engine of type `ty`.
    pub(crate) fn engine_of_type(&self, ty: EngineType) -> Option<EngineInfo> {
        self.engines().iter().find(|e| e.engine_type == ty).copied()
    }

    /// `NV_PMC_ENABLE` bits of every engine.
    pub(crate) fn engine_reset_mask(&self) -> u32 {
        self.engines().iter().fold(0, |mask, e| mask | e.reset_mask)
    }

    /// `NV_PMC_INTR` bits of the engines of type `ty`.
    pub(crate) fn engine_intr_mask(&self, ty: EngineType) -> u32 {
        self.engines()
            .iter()
            .filter(|e| e.engine_type == ty)
            .fold(0, |mask, e| mask | e.intr_mask)
    }

    pub(crate) fn runlists(&self) -> &[Runlist] {
        self.runlists.get().map_or(&[], Vec::as_slice)
    }

    pub(crate) fn runlist(&self, runlist_id: u32) -> Option<&Runlist> {
        self.runlists().iter().find(|r| r.id == runlist_id)
    }

    /// Value describing `aperture` in runlist, PCCSR and RAMFC target fields.
    pub(crate) fn target(&self, aperture: Aperture) -> u32 {
        aperture_mask_raw(self.is_dgpu, aperture, 3, 2, 0)
    }

    pub(crate) fn init_hw(&self, bar: &Bar0, dma: &DmaAllocator, aperture: Aperture) -> Result {
        if self.userd.get().is_none() {
            let userd = dma.alloc(self.num_channels as usize * USERD_SIZE, aperture)?;
            let _ = self.userd.set(userd);
        }

        if self.runlists.get().is_none() {
            let runlists = self.alloc_runlists(bar, dma, aperture)?;
            let _ = self.runlists.set(runlists);
        }

        for id in 0..self.num_pbdma() as usize {
            regs::NV_PPBDMA_INTR_0::from(u32::MAX).write(bar, id);
            regs::NV_PPBDMA_INTR_1::default().set_value(u32::MAX).write(bar, id);
            regs::NV_PPBDMA_INTR_STALL::default().set_value(u32::MAX).write(bar, id);
            regs::NV_PPBDMA_INTR_EN_0::default().set_value(u32::MAX).write(bar, id);
            regs::NV_PPBDMA_INTR_STALL_1::default().set_value(u32::MAX).write(bar, id);
            regs::NV_PPBDMA_INTR_EN_1::default().set_value(u32::MAX).write(bar, id);
        }

        regs::NV_PFIFO_ENG_TIMEOUT::default()
            .set_period(u32::MAX >> 1)
            .set_detection(true)
            .write(bar);

        regs::NV_PFIFO_INTR_0::from(u32::MAX).write(bar);
        regs::NV_PFIFO_INTR_EN_0::default()
            .set_value(
                self.hal.intr_0_error_mask()
                    | regs::NV_PFIFO_INTR_0::default()
                        .set_pbdma_intr(true)
                        .set_runlist_event(true)
                        .raw(),
            )
            .write(bar);
        regs::NV_PFIFO_INTR_EN_1::default()
            .set_value(regs::NV_PFIFO_INTR_0::default().set_channel_intr(true).raw())
            .write(bar);

        Ok(())
    }

    fn alloc_runlists(
        &self,
        bar: &Bar0,
        dma: &DmaAllocator,
        aperture: Aperture,
    ) -> Result<Vec<Runlist>> {
        let format = self.hal.runlist_format();
        // A header and an entry per channel in the worst case.
        let max_entries = self.num_channels as usize * 2;
        let mut ids = self.engines().iter().map(|e| e.runlist_id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();

        ids.into_iter()
            .map(|id| {
                let mut rl = Runlist::new(dma, aperture, id, format, max_entries)?;
                rl.pbdma_mask = (0..self.num_pbdma())
                    .filter(|&p| {
                        regs::NV_PFIFO_PBDMA_MAP::try_read(bar, p as usize)
                            .map(|m| m.runlists() & (1 << id) != 0)
                            .unwrap_or(false)
                    })
                    .fold(0, |mask, p| mask | (1 << p));
                rl.eng_mask = self
                    .engines()
                    .iter()
                    .filter(|e| e.runlist_id == id)
                    .fold(0, |mask, e| mask | (1 << e.engine_id));
                debug!(
                    "runlist {}: pbdmas {:#x}, engines {:#x}",
                    id, rl.pbdma_mask, rl.eng_mask
                );
                Ok(rl)
            })
            .collect()
    }

    /// USERD buffer and offset of the slot of `chid`.
    pub(crate) fn userd_slot(&self, chid: u32) -> Result<(Arc<DmaObject>, usize)> {
        let userd = self.userd.get().ok_or(EINVAL)?;
        Ok((userd.clone(), chid as usize * USERD_SIZE))
    }

    pub(crate) fn alloc_chid(&self) -> Result<u32> {
        error::lock(&self.chids)
            .acquire_next_id(0)
            .map(|id| id as u32)
            .ok_or_else(|| {
                warn!("{}: out of channels", self.chipset);
                ENOMEM
            })
    }

    pub(crate) fn register_channel(&self, ch: &Arc<Channel>) {
        if let Some(slot) = error::write(&self.channels).get_mut(ch.chid() as usize) {
            *slot = Some(Arc::downgrade(ch));
        }
    }

    pub(crate) fn release_chid(&self, chid: u32) {
        if let Some(slot) = error::write(&self.channels).get_mut(chid as usize) {
            *slot = None;
        }
        error::lock(&self.chids).release_id(chid as usize);
    }

    pub(crate) fn channels_in_use(&self) -> usize {
        error::lock(&self.chids).used()
    }

    pub(crate) fn channel(&self, chid: u32) -> Option<Arc<Channel>> {
        error::read(&self.channels)
            .get(chid as usize)?
            .as_ref()?
            .upgrade()
    }

    /// Every open channel.
    pub(crate) fn channels(&self) -> Vec<Arc<Channel>> {
        error::read(&self.channels)
            .iter()
            .filter_map(|slot| slot.as_ref()?.upgrade())
            .collect()
    }

    /// Channel whose instance block is at `inst_addr`.
    pub(crate) fn channel_by_inst(&self, inst_addr: u64) -> Option<Arc<Channel>> {
        self.channels()
            .into_iter()
            .find(|ch| ch.inst().addr() == inst_addr)
    }

    pub(crate) fn alloc_tsgid(&self) -> Result<u32> {
        error::lock(&self.tsgids)
            .acquire_next_id(0)
            .map(|id| id as u32)
            .ok_or(ENOMEM)
    }

    pub(crate) fn register_tsg(&self, tsg: &Arc<Tsg>) {
        if let Some(slot) = error::write(&self.tsgs).get_mut(tsg.tsgid() as usize) {
            *slot = Some(Arc::downgrade(tsg));
        }
    }

    pub(crate) fn release_tsgid(&self, tsgid: u32) {
        if let Some(slot) = error::write(&self.tsgs).get_mut(tsgid as usize) {
            *slot = None;
        }
        error::lock(&self.tsgids).release_id(tsgid as usize);
    }

    pub(crate) fn tsgs_in_use(&self) -> usize {
        error::lock(&self.tsgids).used()
    }

    pub(crate) fn tsg(&self, tsgid: u32) -> Option<Arc<Tsg>> {
        error::read(&self.tsgs).get(tsgid as usize)?.as_ref()?.upgrade()
    }

    /// Rebuilds runlist `runlist_id` from its active TSGs and submits it.
    ///
    /// With `wait_preempt` the runlist is preempted first. With `wait_commit` the call returns
    /// once the scheduler accepted the new list.
    pub(crate) fn runlist_reload(
        &self,
        gpu: &Gpu,
        runlist_id: u32,
        wait_preempt: bool,
        wait_commit: bool,
    ) -> Result {
        let bar = &gpu.bar;
        let rl = self.runlist(runlist_id).ok_or(EINVAL)?;
        let format = self.hal.runlist_format();

        let tsgs = rl
            .active_tsgs()
            .into_iter()
            .filter_map(|id| self.tsg(id))
            .collect::<Vec<_>>();
        let entries = tsgs
            .iter()
            .map(|tsg| tsg.runlist_entry(self))
            .filter(|e| !e.channels.is_empty())
            .collect::<Vec<_>>();
        // The last reference to a TSG may go away here; no lock is held.
        drop(tsgs);

        if wait_preempt {
            self.preempt_runlists(bar, 1 << runlist_id, gpu.config.preempt_timeout)?;
        }

        let words = runlist::build(format, &entries, gpu.config.runlist_interleave, rl.max_entries)?;

        rl.update(format, &words, |buf, count| {
            self.hal
                .runlist_submit(bar, runlist_id, buf.addr(), self.target(buf.aperture()), count);
            if wait_commit {
                self.hal
                    .runlist_wait_pending(bar, runlist_id, gpu.config.runlist_timeout)
                    .inspect_err(|_| warn!("runlist {}: submit not accepted", runlist_id))
            } else {
                Ok(())
            }
        })?;

        debug!("runlist {}: {} TSGs submitted", runlist_id, entries.len());
        Ok(())
    }

    fn preempt(&self, bar: &Bar0, id: u32, id_type: u8, timeout: Duration) -> Result {
        regs::NV_PFIFO_PREEMPT::default()
            .set_id(id)
            .set_id_type(id_type)
            .write(bar);

        util::read_poll_timeout(
            || Ok(regs::NV_PFIFO_PREEMPT::read(bar)),
            |r| !r.pending(),
            Duration::from_micros(2),
            timeout,
        )
        .map(|_| ())
    }

    /// Preempts TSG `tsgid` without escalating. Used by the recovery path itself.
    pub(crate) fn preempt_tsg_raw(&self, gpu: &Gpu, tsgid: u32) -> Result {
        self.preempt(
            &gpu.bar,
            tsgid,
            regs::PREEMPT_TYPE_TSG,
            gpu.config.preempt_timeout,
        )
    }

    /// Preempts TSG `tsgid` off its engines. A preempt that does not complete triggers the
    /// recovery of the TSG.
    pub(crate) fn preempt_tsg(&self, gpu: &Gpu, tsgid: u32) -> Result {
        self.preempt_tsg_raw(gpu, tsgid).inspect_err(|_| {
            warn!("{}: preempt of TSG {} timed out", self.chipset, tsgid);
            let _ = recovery::recover(gpu, RecoveryScope::Tsg(tsgid), ErrorNotifier::IdleTimeout)
                .inspect_err(|e| {
                    warn!("{}: recovery of TSG {} failed: {:?}", self.chipset, tsgid, e)
                });
        })
    }

    pub(crate) fn preempt_runlists(&self, bar: &Bar0, mask: u32, timeout: Duration) -> Result {
        regs::NV_PFIFO_RUNLIST_PREEMPT::default()
            .set_runlists(mask)
            .write(bar);

        util::read_poll_timeout(
            || Ok(regs::NV_PFIFO_RUNLIST_PREEMPT::read(bar)),
            |r| r.runlists() & mask == 0,
            Duration::from_micros(2),
            timeout,
        )
        .map(|_| ())
        .inspect_err(|_| warn!("fifo: runlist preempt {:#x} timed out", mask))
    }

    /// Stops the scheduler on the runlists in `mask`.
    pub(crate) fn sched_disable(&self, bar: &Bar0, mask: u32) {
        regs::NV_PFIFO_SCHED_DISABLE::update(bar, |r| r.set_runlists(r.runlists() | mask));
    }

    pub(crate) fn sched_enable(&self, bar: &Bar0, mask: u32) {
        regs::NV_PFIFO_SCHED_DISABLE::update(bar, |r| r.set_runlists(r.runlists() & !mask));
    }

    pub(crate) fn bind_channel_inst(&self, bar: &Bar0, chid: u32, inst_addr: u64, ap: Aperture) {
        regs::NV_PCCSR_CHANNEL_INST::default()
            // CAST: instance blocks are below 1 TiB.
            .set_ptr((inst_addr >> 12) as u32)
            .set_target(self.target(ap) as u8)
            .set_bind(true)
            .write(bar, chid as usize);
    }

    pub(crate) fn unbind_channel_inst(&self, bar: &Bar0, chid: u32) {
        regs::NV_PCCSR_CHANNEL_INST::default().write(bar, chid as usize);
    }

    pub(crate) fn enable_channel(&self, bar: &Bar0, chid: u32) {
        regs::NV_PCCSR_CHANNEL::update(bar, chid as usize, |r| r.set_enable_set(true));
    }

    pub(crate) fn disable_channel(&self, bar: &Bar0, chid: u32) {
        regs::NV_PCCSR_CHANNEL::update(bar, chid as usize, |r| r.set_enable_clr(true));
    }

    /// Clears the faulted state the host leaves on a channel after a fault.
    pub(crate) fn clear_channel_faulted(&self, bar: &Bar0, chid: u32) {
        regs::NV_PCCSR_CHANNEL::update(bar, chid as usize, |r| {
            r.set_pbdma_faulted_reset(true).set_eng_faulted_reset(true)
        });
    }

    pub(crate) fn ring_doorbell(&self, bar: &Bar0, chid: u32) {
        self.hal.ring_doorbell(bar, chid)
    }

    /// Whether any engine reports work.
    pub(crate) fn engines_busy(&self, bar: &Bar0) -> bool {
        self.engines().iter().any(|e| {
            regs::NV_PFIFO_ENGINE_STATUS::try_read(bar, e.engine_id as usize)
                .map(|s| s.busy())
                .unwrap_or(false)
        })
    }

    /// Engines with the context of TSG `tsgid` loaded or being loaded.
    pub(crate) fn engines_running_tsg(&self, bar: &Bar0, tsgid: u32) -> Vec<EngineInfo> {
        self.engines()
            .iter()
            .filter(|e| {
                regs::NV_PFIFO_ENGINE_STATUS::try_read(bar, e.engine_id as usize)
                    .map(|s| {
                        s.ctx_status() != 0
                            && ((s.id_type() && s.id() == tsgid)
                                || (s.next_id_type() && s.next_id() == tsgid))
                    })
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Resolves the owner of `fault`, records it and returns the recovery it calls for.
    pub(crate) fn handle_mmu_fault(
        &self,
        gpu: &Gpu,
        mut fault: MmuFaultInfo,
    ) -> Option<(RecoveryScope, ErrorNotifier)> {
        gpu.ecc.add(EccCounter::MmuFault, 1);

        if let Some(ch) = self.channel_by_inst(fault.inst_addr) {
            fault.chid = Some(ch.chid());
            fault.tsgid = ch.tsg().map(|tsg| tsg.tsgid());
        }

        error!(
            "{}: MMU fault at {:#x}, type {}, client {}, chid {:?}",
            self.chipset, fault.addr, fault.fault_type, fault.client, fault.chid
        );
        gpu.fb.record_fault(fault);

        if fault.replayable {
            return None;
        }

        let scope = match (fault.tsgid, fault.chid) {
            (Some(tsgid), _) => RecoveryScope::Tsg(tsgid),
            (None, Some(chid)) => RecoveryScope::Channel(chid),
            (None, None) => return None,
        };

        Some((scope, ErrorNotifier::MmuFault))
    }

    fn log_errors(&self, bar: &Bar0, intr: regs::NV_PFIFO_INTR_0) {
        if intr.bind_error() {
            let code = regs::NV_PFIFO_INTR_BIND_ERROR::read(bar).code();
            error!("{}: fifo bind error {:#x}", self.chipset, code);
        }
        if intr.sched_error() {
            let code = regs::NV_PFIFO_INTR_SCHED_ERROR::read(bar).code();
            error!("{}: fifo sched error {:#x}", self.chipset, code);
        }
        if intr.chsw_error() {
            let info = regs::NV_PFIFO_INTR_CHSW_ERROR::read(bar);
            error!("{}: fifo channel switch error {:#x}", self.chipset, info.value());
            info.write(bar);
        }
        if intr.fb_flush_timeout() {
            error!("{}: fifo fb flush timeout", self.chipset);
        }
        if intr.lb_error() {
            error!("{}: fifo lb error", self.chipset);
        }
        if intr.pio_error() {
            error!("{}: fifo pio error", self.chipset);
        }
        if intr.dropped_mmu_fault() {
            error!("{}: fifo dropped MMU fault", self.chipset);
        }
    }

    /// Services the stall part of the PFIFO interrupt.
    pub(crate) fn isr_stall(&self, gpu: &Gpu) -> Result {
        let bar = &gpu.bar;
        let intr = regs::NV_PFIFO_INTR_0::read(bar);
        let mut clear = 0;
        let mut recover = Vec::new();

        if intr.pbdma_intr() {
            let pending = regs::NV_PFIFO_INTR_PBDMA_ID::read(bar).value();
            for id in (0..self.num_pbdma()).filter(|id| pending & (1 << id) != 0) {
                let report = pbdma::isr(gpu, id);
                if report.recover {
                    if let Some(scope) = report.scope {
                        recover.push((scope, report.notifier));
                    }
                }
            }
            clear |= regs::NV_PFIFO_INTR_0::default().set_pbdma_intr(true).raw();
        }

        if intr.mmu_fault() {
            while let Some(fault) = self.hal.take_mmu_fault(bar) {
                recover.extend(self.handle_mmu_fault(gpu, fault));
            }
            clear |= regs::NV_PFIFO_INTR_0::default().set_mmu_fault(true).raw();
        }

        if intr.runlist_event() {
            let runlists = regs::NV_PFIFO_INTR_RUNLIST::read(bar);
            debug!("fifo: runlist event {:#x}", runlists.value());
            runlists.write(bar);
            clear |= regs::NV_PFIFO_INTR_0::default().set_runlist_event(true).raw();
        }

        let errors = intr.raw() & self.hal.intr_0_error_mask() & !clear;
        if errors != 0 {
            self.log_errors(bar, intr);
            clear |= errors;
        }

        if clear != 0 {
            regs::NV_PFIFO_INTR_0::from(clear).write(bar);
        }

        recover
            .into_iter()
            .try_for_each(|(scope, notifier)| recovery::recover(gpu, scope, notifier))
    }

    /// Services the non-stall part of the PFIFO interrupt. Only the channel interrupt is
    /// acknowledged.
    pub(crate) fn isr_nonstall(&self, bar: &Bar0) -> NonstallOps {
        let intr = regs::NV_PFIFO_INTR_0::read(bar);
        if !intr.channel_intr() {
            return NonstallOps::empty();
        }

        regs::NV_PFIFO_INTR_0::default()
            .set_channel_intr(true)
            .write(bar);

        NonstallOps::WAKEUP_SEMAPHORE
    }

    /// Stops every channel and preempts the TSGs off the engines.
    pub(crate) fn suspend(&self, gpu: &Gpu) -> Result {
        let bar = &gpu.bar;

        for ch in self.channels() {
            if ch.is_enabled() {
                self.disable_channel(bar, ch.chid());
            }
        }

        for rl in self.runlists() {
            for tsgid in rl.active_tsgs() {
                self.preempt_tsg_raw(gpu, tsgid)
                    .inspect_err(|_| warn!("{}: TSG {} did not preempt", self.chipset, tsgid))?;
            }
        }

        Ok(())
    }

    /// Resubmits the runlists and restarts the channels stopped by [`Fifo::suspend`].
    pub(crate) fn resume(&self, gpu: &Gpu) -> Result {
        for rl in self.runlists() {
            self.runlist_reload(gpu, rl.id, false, true)?;
        }

        for ch in self.channels() {
            if ch.is_enabled() {
                self.enable_channel(&gpu.bar, ch.chid());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, Sim};
    use pretty_assertions::assert_eq;

    #[test]
    fn init_programs_interrupts_and_runlists() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let fifo = &gpu.fifo;

        assert_eq!(
            fifo.runlists().iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(fifo.runlist(1).map(|r| r.pbdma_mask), Some(1 << 1));

        let en_0 = sim.peek(regs::NV_PFIFO_INTR_EN_0::OFFSET);
        let en_0 = regs::NV_PFIFO_INTR_0::from(en_0);
        assert!(en_0.pbdma_intr() && en_0.runlist_event() && en_0.sched_error());
        assert!(!en_0.channel_intr());
        assert_eq!(
            sim.peek(regs::NV_PFIFO_INTR_EN_1::OFFSET),
            regs::NV_PFIFO_INTR_0::default().set_channel_intr(true).raw()
        );
    }

    #[test]
    fn nonstall_without_pending_is_a_no_op() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let bar = sim.bar();
        let writes = sim.write_count();

        assert_eq!(gpu.fifo.isr_nonstall(&bar), NonstallOps::empty());
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn nonstall_clears_only_the_channel_interrupt() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let bar = sim.bar();
        let pending = regs::NV_PFIFO_INTR_0::default()
            .set_channel_intr(true)
            .set_runlist_event(true);
        sim.poke(regs::NV_PFIFO_INTR_0::OFFSET, pending.raw());

        assert_eq!(gpu.fifo.isr_nonstall(&bar), NonstallOps::WAKEUP_SEMAPHORE);
        assert_eq!(
            sim.peek(regs::NV_PFIFO_INTR_0::OFFSET),
            regs::NV_PFIFO_INTR_0::default().set_runlist_event(true).raw()
        );
    }

    #[test]
    fn stall_errors_are_acknowledged() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let pending = regs::NV_PFIFO_INTR_0::default()
            .set_bind_error(true)
            .set_channel_intr(true);
        sim.poke(regs::NV_PFIFO_INTR_0::OFFSET, pending.raw());

        gpu.fifo.isr_stall(&gpu).unwrap();
        assert_eq!(
            sim.peek(regs::NV_PFIFO_INTR_0::OFFSET),
            regs::NV_PFIFO_INTR_0::default().set_channel_intr(true).raw()
        );
    }

    #[test]
    fn chid_pool_is_bounded() {
        let sim = Sim::new(Chipset::GV11B);
        let config = GpuConfig {
            num_channels: 2,
            ..Default::default()
        };
        let fifo = Fifo::new(Chipset::GV11B, &config);
        let _ = sim;

        assert_eq!(fifo.alloc_chid(), Ok(0));
        assert_eq!(fifo.alloc_chid(), Ok(1));
        assert_eq!(fifo.alloc_chid(), Err(ENOMEM));
        fifo.release_chid(0);
        assert_eq!(fifo.alloc_chid(), Ok(0));
        assert_eq!(fifo.channels_in_use(), 2);
    }

    #[test]
    fn error_notifier_record() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let dma = DmaAllocator::new(false, false);
        let userd = dma.alloc(2 * USERD_SIZE, Aperture::Sysmem).unwrap();

        assert_eq!(read_error_notifier(&userd, USERD_SIZE), None);
        write_error_notifier(&bar, &userd, USERD_SIZE, ErrorNotifier::PbdmaError.code());
        assert_eq!(read_error_notifier(&userd, USERD_SIZE), Some(32));
        assert_eq!(read_error_notifier(&userd, 0), None);
    }

    #[test]
    fn suspend_and_resume_without_channels() {
        let (_sim, gpu) = sim::test_gpu(Chipset::TU104);

        gpu.fifo.suspend(&gpu).unwrap();
        gpu.fifo.resume(&gpu).unwrap();
    }

    #[test]
    fn stuck_preempt_recovers_the_tsg() {
        let config = GpuConfig {
            preempt_timeout: Duration::from_millis(5),
            ..Default::default()
        };
        let (sim, gpu) = sim::probe(Chipset::GV11B, config, sim::platform());
        gpu.init().unwrap();
        let vm = gpu.create_vm(0, "preempt").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let ch = Channel::open(&gpu, &vm, Default::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();

        sim.set_preempt_hang(true);
        assert!(gpu.fifo.preempt_tsg(&gpu, tsg.tsgid()).is_err());
        assert!(tsg.is_unserviceable());
        assert_eq!(ch.error_notifier(), Some(ErrorNotifier::IdleTimeout.code()));
        sim.set_preempt_hang(false);
    }

    #[test]
    fn channel_limit_follows_chip() {
        let config = GpuConfig {
            num_channels: 8192,
            ..Default::default()
        };

        assert_eq!(Fifo::new(Chipset::GP10B, &config).num_channels(), 512);
        assert_eq!(Fifo::new(Chipset::TU104, &config).num_channels(), 4096);
    }
}
