// SPDX-License-Identifier: GPL-2.0

//! Copy engine interrupts.

use log::{debug, error};

use crate::ecc::EccCounter;
use crate::error::Result;
use crate::fifo::engines::{EngineInfo, EngineType};
use crate::fifo::recovery::{self, RecoveryScope};
use crate::fifo::ErrorNotifier;
use crate::gpu::Gpu;
use crate::intr::NonstallOps;
use crate::regs;

/// Services the stall interrupt of copy engine `engine`. Launch and configuration errors
/// recover the engine's runlist.
pub(crate) fn isr_stall(gpu: &Gpu, engine: &EngineInfo) -> Result {
    let bar = &gpu.bar;
    let idx = engine.inst_id as usize;
    let status = regs::NV_PCE_INTR_STATUS::try_read(bar, idx)?;

    if status.blockpipe() {
        debug!("ce{}: blocking pipe interrupt", idx);
        gpu.sema_sea.wake_all();
    }

    let mut errors = 0;
    if status.launcherr() {
        error!("ce{}: launch error", idx);
        errors += 1;
    }
    if status.invalid_config() {
        error!("ce{}: invalid config", idx);
        errors += 1;
    }
    if status.mthd_buffer_fault() {
        error!("ce{}: method buffer fault", idx);
        errors += 1;
    }

    // The non-blocking pipe belongs to the non-stall tree.
    regs::NV_PCE_INTR_STATUS::from(status.raw())
        .set_nonblockpipe(false)
        .write(bar, idx);

    if errors == 0 {
        return Ok(());
    }

    gpu.ecc.add(EccCounter::CeError, errors);
    recovery::recover(
        gpu,
        RecoveryScope::Runlist(engine.runlist_id),
        ErrorNotifier::ResetChannelVerif,
    )
}

/// Services the non-stall interrupt of every copy engine.
pub(crate) fn isr_nonstall(gpu: &Gpu) -> NonstallOps {
    let bar = &gpu.bar;
    let mut ops = NonstallOps::empty();

    for engine in gpu
        .fifo
        .engines()
        .iter()
        .filter(|e| e.engine_type == EngineType::Ce)
    {
        let idx = engine.inst_id as usize;
        let Ok(status) = regs::NV_PCE_INTR_STATUS::try_read(bar, idx) else {
            continue;
        };

        if status.nonblockpipe() {
            regs::NV_PCE_INTR_STATUS::default()
                .set_nonblockpipe(true)
                .write(bar, idx);
            ops |= NonstallOps::WAKEUP_SEMAPHORE | NonstallOps::POST_EVENTS;
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Chipset;
    use crate::sim;
    use pretty_assertions::assert_eq;

    fn ce(gpu: &Gpu) -> EngineInfo {
        gpu.fifo.engine_of_type(EngineType::Ce).unwrap()
    }

    #[test]
    fn launch_error_is_counted_and_recovered() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let engine = ce(&gpu);
        let status = regs::NV_PCE_INTR_STATUS::default()
            .set_launcherr(true)
            .set_nonblockpipe(true);
        sim.inject_ce_intr(engine.inst_id, status.raw());

        gpu.isr_stall().unwrap();

        assert_eq!(gpu.ecc.get(EccCounter::CeError), 1);
        // Only the non-blocking pipe is left for the non-stall handler.
        let left = regs::NV_PCE_INTR_STATUS::read(&gpu.bar, engine.inst_id as usize);
        assert_eq!(left.raw(), status.set_launcherr(false).raw());

        assert_eq!(
            isr_nonstall(&gpu),
            NonstallOps::WAKEUP_SEMAPHORE | NonstallOps::POST_EVENTS
        );
        assert_eq!(isr_nonstall(&gpu), NonstallOps::empty());
    }

    #[test]
    fn blocking_pipe_is_not_an_error() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let engine = ce(&gpu);
        sim.inject_ce_intr(
            engine.inst_id,
            regs::NV_PCE_INTR_STATUS::default()
                .set_blockpipe(true)
                .raw(),
        );

        gpu.isr_stall().unwrap();
        assert_eq!(gpu.ecc.get(EccCounter::CeError), 0);
        assert_eq!(
            regs::NV_PCE_INTR_STATUS::read(&gpu.bar, engine.inst_id as usize).raw(),
            0
        );
    }
}
