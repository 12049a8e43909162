// SPDX-License-Identifier: GPL-2.0

//! Fault recovery.
//!
//! A recovery stops the scheduler on the affected runlists, preempts the TSGs in scope, resets
//! the engines they were running on (and a wedged PBDMA), and removes them from their runlist.
//! Their channels are told through the error notifier and the event list, and become
//! unserviceable. Scheduling resumes for everything else.
//!
//! With fault recovery disabled the first fault stops the whole device instead.

use std::sync::Arc;

use log::{error, info, warn};

use crate::channel::Channel;
use crate::error::{self, Result};
use crate::falcon::FalconId;
use crate::fifo::engines::{EngineInfo, EngineType};
use crate::fifo::ErrorNotifier;
use crate::gpu::Gpu;
use crate::mc;
use crate::tsg::Tsg;

/// What a recovery applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryScope {
    Channel(u32),
    Tsg(u32),
    Runlist(u32),
    /// A wedged PBDMA: the runlist it serves, and the PBDMA itself, are reset.
    Pbdma(u32),
}

/// Objects in scope, resolved before the recovery lock is taken so that the last reference to a
/// channel is never dropped under it.
#[derive(Default)]
struct Targets {
    tsgs: Vec<Arc<Tsg>>,
    channels: Vec<Arc<Channel>>,
    runlist_mask: u32,
    pbdma_mask: u32,
    /// Engines reset regardless of what they are running.
    engines: Vec<EngineInfo>,
}

fn resolve(gpu: &Gpu, scope: RecoveryScope) -> Targets {
    let fifo = &gpu.fifo;
    let mut t = Targets::default();

    let scope = match scope {
        RecoveryScope::Channel(chid) => match fifo.channel(chid) {
            Some(ch) => match ch.tsg() {
                // A TSG is recovered as a whole.
                Some(tsg) => RecoveryScope::Tsg(tsg.tsgid()),
                None => {
                    t.channels.push(ch);
                    return t;
                }
            },
            None => return t,
        },
        RecoveryScope::Pbdma(id) => {
            t.pbdma_mask = 1 << id;
            match fifo.runlists().iter().find(|rl| rl.pbdma_mask & (1 << id) != 0) {
                Some(rl) => RecoveryScope::Runlist(rl.id),
                None => return t,
            }
        }
        scope => scope,
    };

    match scope {
        RecoveryScope::Tsg(tsgid) => {
            if let Some(tsg) = fifo.tsg(tsgid) {
                t.tsgs.push(tsg);
            }
        }
        RecoveryScope::Runlist(id) => {
            if let Some(rl) = fifo.runlist(id) {
                t.tsgs = rl
                    .active_tsgs()
                    .into_iter()
                    .filter_map(|tsgid| fifo.tsg(tsgid))
                    .collect();
            }
            t.runlist_mask |= 1 << id;
            t.engines = fifo
                .engines()
                .iter()
                .filter(|e| e.runlist_id == id)
                .copied()
                .collect();
        }
        RecoveryScope::Channel(_) | RecoveryScope::Pbdma(_) => (),
    }

    for tsg in &t.tsgs {
        if let Some(id) = tsg.runlist_id() {
            t.runlist_mask |= 1 << id;
        }
        t.channels.extend(tsg.channels());
    }

    t
}

fn reset_engine(gpu: &Gpu, engine: &EngineInfo) -> Result {
    let bar = &gpu.bar;

    warn!(
        "{}: resetting engine {} ({:?})",
        gpu.chipset(),
        engine.engine_id,
        engine.engine_type
    );

    match engine.engine_type {
        EngineType::Gr => gpu.gr.reset(gpu),
        EngineType::Ce => {
            mc::reset(bar, engine.reset_mask, mc::CE_RESET_SETTLE);
            Ok(())
        }
        EngineType::Nvdec => {
            mc::reset(bar, engine.reset_mask, mc::RESET_SETTLE);
            if gpu.acr.is_bootstrapped(FalconId::Nvdec) {
                gpu.acr.rebootstrap(gpu, &[FalconId::Nvdec])
            } else {
                Ok(())
            }
        }
    }
}

/// Stops the device: every channel is notified and scheduling is disabled for good.
fn quiesce(gpu: &Gpu, channels: &[Arc<Channel>], notifier: ErrorNotifier) {
    let fifo = &gpu.fifo;
    let bar = &gpu.bar;

    error!("{}: fault recovery disabled, stopping the device", gpu.chipset());
    fifo.set_quiesced();

    let mask = fifo.runlists().iter().fold(0, |m, rl| m | (1 << rl.id));
    fifo.sched_disable(bar, mask);

    for ch in channels {
        fifo.disable_channel(bar, ch.chid());
        ch.abort(notifier);
    }

    gpu.sema_sea.wake_all();
}

/// Recovers from a fault affecting `scope`, reporting `notifier` to the channels in it.
pub(crate) fn recover(gpu: &Gpu, scope: RecoveryScope, notifier: ErrorNotifier) -> Result {
    let fifo = &gpu.fifo;
    let bar = &gpu.bar;

    if !gpu.config.fault_recovery {
        let channels = fifo.channels();
        let _guard = error::lock(&fifo.recovery_lock);
        if !fifo.is_quiesced() {
            quiesce(gpu, &channels, notifier);
        }
        return Ok(());
    }

    let targets = resolve(gpu, scope);
    let _guard = error::lock(&fifo.recovery_lock);

    if fifo.is_quiesced() {
        return Ok(());
    }

    warn!(
        "{}: recovering {:?} ({:?}), {} channels",
        gpu.chipset(),
        scope,
        notifier,
        targets.channels.len()
    );

    fifo.sched_disable(bar, targets.runlist_mask);

    for ch in &targets.channels {
        fifo.disable_channel(bar, ch.chid());
    }

    let mut engines = targets.engines.clone();
    for tsg in &targets.tsgs {
        for engine in fifo.engines_running_tsg(bar, tsg.tsgid()) {
            if !engines.contains(&engine) {
                engines.push(engine);
            }
        }
        if fifo.preempt_tsg_raw(gpu, tsg.tsgid()).is_err() {
            warn!("{}: TSG {} did not preempt", gpu.chipset(), tsg.tsgid());
        }
    }

    if targets.pbdma_mask != 0 {
        warn!("{}: resetting pbdmas {:#x}", gpu.chipset(), targets.pbdma_mask);
        mc::reset_pbdmas(bar, targets.pbdma_mask);
    }

    let mut res = engines
        .iter()
        .try_for_each(|engine| reset_engine(gpu, engine));

    for ch in &targets.channels {
        fifo.clear_channel_faulted(bar, ch.chid());
        ch.abort(notifier);
    }

    for tsg in &targets.tsgs {
        tsg.mark_unserviceable();
        if let Some(rl) = tsg.runlist_id().and_then(|id| fifo.runlist(id)) {
            rl.set_active(tsg.tsgid(), false);
        }
    }

    for rl in fifo
        .runlists()
        .iter()
        .filter(|rl| targets.runlist_mask & (1 << rl.id) != 0)
    {
        let reload = fifo.runlist_reload(gpu, rl.id, false, true);
        res = res.and(reload);
    }

    fifo.sched_enable(bar, targets.runlist_mask);
    gpu.sema_sea.wake_all();

    match &res {
        Ok(()) => info!("{}: recovery of {:?} done", gpu.chipset(), scope),
        Err(e) => error!("{}: recovery of {:?} failed: {:?}", gpu.chipset(), scope, e),
    }

    res
}
