// SPDX-License-Identifier: GPL-2.0

//! Top-level interrupt dispatch.
//!
//! The stall tree carries faults and engine errors and is serviced in the interrupt handler.
//! The non-stall tree carries completion notifications; its handler only acknowledges them and
//! returns the work to do, which runs later in [`handle_nonstall_ops`].

use bitflags::bitflags;
use log::{debug, warn};

use crate::ce;
use crate::error::Result;
use crate::fifo::engines::EngineType;
use crate::fifo::recovery;
use crate::gpu::Gpu;
use crate::mc;
use crate::regs;

bitflags! {
    /// Deferred work requested by the non-stall interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NonstallOps: u32 {
        /// Wake semaphore waiters and retire completed jobs.
        const WAKEUP_SEMAPHORE = 1 << 0;
        /// Post events to the channels of the engines that interrupted.
        const POST_EVENTS = 1 << 1;
    }
}

fn ce_mask(gpu: &Gpu) -> u32 {
    gpu.fifo.engine_intr_mask(EngineType::Ce)
}

fn stall_units(gpu: &Gpu) -> u32 {
    mc::INTR_UNIT_PFIFO
        | mc::INTR_UNIT_HUB
        | mc::INTR_UNIT_GR
        | mc::INTR_UNIT_PMU
        | mc::INTR_UNIT_LTC
        | mc::INTR_UNIT_PRIV_RING
        | ce_mask(gpu)
}

fn nonstall_units(gpu: &Gpu) -> u32 {
    mc::INTR_UNIT_PFIFO | mc::INTR_UNIT_GR | ce_mask(gpu)
}

/// Unmasks the units the core services on both trees.
pub(crate) fn enable(gpu: &Gpu) {
    let bar = &gpu.bar;

    disable(gpu);
    mc::intr_enable(bar, mc::INTR_STALL, stall_units(gpu));
    mc::intr_enable(bar, mc::INTR_NONSTALL, nonstall_units(gpu));
}

/// Masks every interrupt of both trees.
pub(crate) fn disable(gpu: &Gpu) {
    let bar = &gpu.bar;

    mc::intr_disable(bar, mc::INTR_STALL, u32::MAX);
    mc::intr_disable(bar, mc::INTR_NONSTALL, u32::MAX);
}

/// Services every unit pending on the stall tree. All units are serviced even if one fails;
/// the first error is returned.
pub(crate) fn isr_stall(gpu: &Gpu) -> Result {
    let bar = &gpu.bar;
    let pending = mc::intr_pending(bar, mc::INTR_STALL);
    if pending == 0 {
        return Ok(());
    }
    debug!("intr: stall {:#x}", pending);

    let mut res = Ok(());
    let mut keep = |r: Result| {
        if res.is_ok() {
            res = r;
        }
    };

    if pending & mc::INTR_UNIT_PFIFO != 0 {
        keep(gpu.fifo.isr_stall(gpu));
    }

    if pending & mc::INTR_UNIT_HUB != 0 {
        if let Some(fault) = gpu.fb.hub_isr(bar) {
            if let Some((scope, notifier)) = gpu.fifo.handle_mmu_fault(gpu, fault) {
                keep(recovery::recover(gpu, scope, notifier));
            }
        }
    }

    if pending & mc::INTR_UNIT_GR != 0 {
        keep(gpu.gr.isr(gpu));
    }

    for engine in gpu
        .fifo
        .engines()
        .iter()
        .filter(|e| e.engine_type == EngineType::Ce && pending & e.intr_mask != 0)
    {
        keep(ce::isr_stall(gpu, engine));
    }

    if pending & mc::INTR_UNIT_PMU != 0 {
        gpu.pmu.isr(bar);
    }

    if pending & mc::INTR_UNIT_LTC != 0 {
        gpu.ltc.isr(bar, &gpu.ecc);
    }

    if pending & mc::INTR_UNIT_PRIV_RING != 0 {
        let status = regs::NV_PPRIV_MASTER_RING_INTERRUPT_STATUS0::read(bar).value();
        warn!("intr: priv ring status {:#x}", status);
        regs::NV_PPRIV_MASTER_RING_COMMAND::default()
            .set_cmd(regs::PRIV_RING_CMD_ACK_INTERRUPT)
            .write(bar);
    }

    res
}

/// Acknowledges the pending non-stall interrupts and returns the work they call for.
pub(crate) fn isr_nonstall(gpu: &Gpu) -> NonstallOps {
    let bar = &gpu.bar;
    let pending = mc::intr_pending(bar, mc::INTR_NONSTALL);
    let mut ops = NonstallOps::empty();

    if pending & mc::INTR_UNIT_PFIFO != 0 {
        ops |= gpu.fifo.isr_nonstall(bar);
    }
    if pending & mc::INTR_UNIT_GR != 0 {
        ops |= gpu.gr.isr_nonstall(bar);
    }
    if pending & ce_mask(gpu) != 0 {
        ops |= ce::isr_nonstall(gpu);
    }

    ops
}

/// Runs the work returned by [`isr_nonstall`].
pub(crate) fn handle_nonstall_ops(gpu: &Gpu, ops: NonstallOps) {
    if ops.contains(NonstallOps::WAKEUP_SEMAPHORE) {
        gpu.sema_sea.wake_all();
        for ch in gpu.fifo.channels() {
            ch.update_jobs();
        }
    }

    if ops.contains(NonstallOps::POST_EVENTS) {
        for ch in gpu.fifo.channels() {
            ch.post_blocking_event();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelEvent, ChannelParams};
    use crate::error::code::ETIMEDOUT;
    use crate::gpu::Chipset;
    use crate::sim;
    use crate::tsg::Tsg;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn nonstall_with_nothing_pending_is_a_noop() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let writes = sim.write_count();

        assert_eq!(gpu.isr_nonstall(), NonstallOps::empty());
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn nonstall_channel_intr_wakes_semaphores() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let channel_intr = regs::NV_PFIFO_INTR_0::default().set_channel_intr(true);
        let other = regs::NV_PFIFO_INTR_0::default().set_bind_error(true);
        sim.poke(
            regs::NV_PFIFO_INTR_0::OFFSET,
            channel_intr.raw() | other.raw(),
        );

        assert_eq!(gpu.isr_nonstall(), NonstallOps::WAKEUP_SEMAPHORE);
        // Only the channel interrupt was acknowledged.
        assert_eq!(
            sim.peek(regs::NV_PFIFO_INTR_0::OFFSET),
            other.raw()
        );
        assert_eq!(gpu.isr_nonstall(), NonstallOps::empty());
    }

    #[test]
    fn stall_tree_is_masked_while_suspended() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GP10B);
        let bar = &gpu.bar;

        let enabled = regs::NV_PMC_INTR_EN_SET::read(bar, mc::INTR_STALL).value();
        assert_eq!(enabled, stall_units(&gpu));

        gpu.suspend().unwrap();
        assert_eq!(regs::NV_PMC_INTR_EN_SET::read(bar, mc::INTR_STALL).value(), 0);
        assert_eq!(regs::NV_PMC_INTR_EN_SET::read(bar, mc::INTR_NONSTALL).value(), 0);

        gpu.resume().unwrap();
        assert_eq!(
            regs::NV_PMC_INTR_EN_SET::read(bar, mc::INTR_NONSTALL).value(),
            nonstall_units(&gpu)
        );
    }

    #[test]
    fn deferred_ops_post_events() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "events").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();

        // Nothing in flight: no event.
        gpu.handle_nonstall_ops(NonstallOps::all());
        assert_eq!(ch.wait_event(Duration::from_millis(1)), Err(ETIMEDOUT));

        ch.submit(&[], Default::default()).unwrap();
        gpu.handle_nonstall_ops(NonstallOps::POST_EVENTS);
        assert_eq!(
            ch.wait_event(Duration::from_millis(10)),
            Ok(ChannelEvent::Blocking)
        );
    }
}
