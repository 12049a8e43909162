// SPDX-License-Identifier: GPL-2.0

//! PBDMA interrupt classification.

use log::{debug, error};

use crate::ecc::EccCounter;
use crate::fifo::recovery::RecoveryScope;
use crate::fifo::ErrorNotifier;
use crate::gpu::Gpu;
use crate::regs;

/// How bad a PBDMA interrupt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PbdmaClass {
    /// Clearing the interrupt lets the PBDMA continue.
    Restartable,
    /// The channel on the PBDMA cannot continue.
    ChannelFatal,
    /// The PBDMA itself is wedged.
    DeviceFatal,
}

/// Outcome of servicing one PBDMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PbdmaReport {
    pub(crate) class: PbdmaClass,
    pub(crate) recover: bool,
    pub(crate) scope: Option<RecoveryScope>,
    pub(crate) notifier: ErrorNotifier,
}

fn device_fatal_mask() -> u32 {
    regs::NV_PPBDMA_INTR_0::default()
        .set_memreq(true)
        .set_memack_timeout(true)
        .set_memack_extra(true)
        .set_memdat_timeout(true)
        .set_memdat_extra(true)
        .set_memflush(true)
        .set_memop(true)
        .set_lbconnect(true)
        .set_lbreq(true)
        .set_lback_timeout(true)
        .set_lback_extra(true)
        .set_lbdat_timeout(true)
        .set_lbdat_extra(true)
        .set_xbarconnect(true)
        .raw()
}

fn channel_fatal_mask() -> u32 {
    regs::NV_PPBDMA_INTR_0::default()
        .set_gpfifo(true)
        .set_gpptr(true)
        .set_gpentry(true)
        .set_gpcrc(true)
        .set_pbptr(true)
        .set_pbentry(true)
        .set_pbcrc(true)
        .set_method(true)
        .set_methodcrc(true)
        .set_semaphore(true)
        .set_pri(true)
        .set_no_ctxsw_seg(true)
        .set_pbseg(true)
        .set_signature(true)
        .raw()
}

/// Classifies the pending bits of `NV_PPBDMA_INTR_0` and `NV_PPBDMA_INTR_1`.
pub(crate) fn classify(intr_0: u32, intr_1: u32) -> PbdmaClass {
    if intr_0 & device_fatal_mask() != 0 {
        PbdmaClass::DeviceFatal
    } else if intr_0 & channel_fatal_mask() != 0 || intr_1 != 0 {
        PbdmaClass::ChannelFatal
    } else {
        PbdmaClass::Restartable
    }
}

/// Services PBDMA `id`.
pub(crate) fn isr(gpu: &Gpu, id: u32) -> PbdmaReport {
    let bar = &gpu.bar;
    let idx = id as usize;

    let intr_0 = regs::NV_PPBDMA_INTR_0::read(bar, idx);
    let intr_1 = regs::NV_PPBDMA_INTR_1::read(bar, idx).value();
    let class = classify(intr_0.raw(), intr_1);
    let notifier = if intr_0.pbcrc() {
        ErrorNotifier::PbdmaCrc
    } else {
        ErrorNotifier::PbdmaError
    };

    let status = regs::NV_PFIFO_PBDMA_STATUS::read(bar, idx);
    let owner = (status.chan_status() != regs::PBDMA_CHAN_STATUS_INVALID).then(|| {
        if status.id_type() {
            RecoveryScope::Tsg(status.id())
        } else {
            RecoveryScope::Channel(status.id())
        }
    });

    let scope = match class {
        PbdmaClass::Restartable => None,
        PbdmaClass::ChannelFatal => owner,
        PbdmaClass::DeviceFatal => Some(RecoveryScope::Pbdma(id)),
    };

    if class == PbdmaClass::Restartable {
        debug!("pbdma {}: intr {:#x}", id, intr_0.raw());
    } else {
        error!(
            "pbdma {}: intr {:#x}/{:#x} ({:?}), method {:#x} data {:#x}, owner {:?}",
            id,
            intr_0.raw(),
            intr_1,
            class,
            regs::NV_PPBDMA_METHOD0::read(bar, idx).value(),
            regs::NV_PPBDMA_DATA0::read(bar, idx).value(),
            owner
        );
        gpu.ecc.add(EccCounter::PbdmaError, 1);
    }

    intr_0.write(bar, idx);
    if intr_1 != 0 {
        regs::NV_PPBDMA_INTR_1::default()
            .set_value(intr_1)
            .write(bar, idx);
    }

    PbdmaReport {
        class,
        recover: class != PbdmaClass::Restartable,
        scope,
        notifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Chipset;
    use crate::sim;
    use pretty_assertions::assert_eq;

    fn bits(f: impl FnOnce(regs::NV_PPBDMA_INTR_0) -> regs::NV_PPBDMA_INTR_0) -> u32 {
        f(regs::NV_PPBDMA_INTR_0::default()).raw()
    }

    #[test]
    fn classification() {
        assert_eq!(classify(bits(|r| r.set_acquire(true)), 0), PbdmaClass::Restartable);
        assert_eq!(classify(bits(|r| r.set_device(true)), 0), PbdmaClass::Restartable);
        assert_eq!(classify(bits(|r| r.set_gpentry(true)), 0), PbdmaClass::ChannelFatal);
        assert_eq!(classify(bits(|r| r.set_method(true)), 0), PbdmaClass::ChannelFatal);
        assert_eq!(classify(0, 1), PbdmaClass::ChannelFatal);
        assert_eq!(
            classify(bits(|r| r.set_memack_timeout(true).set_gpentry(true)), 0),
            PbdmaClass::DeviceFatal
        );
        assert_eq!(classify(bits(|r| r.set_xbarconnect(true)), 0), PbdmaClass::DeviceFatal);
    }

    #[test]
    fn restartable_interrupt_is_cleared() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let acquire = bits(|r| r.set_acquire(true));
        sim.inject_pbdma_intr(1, acquire, None);

        let report = isr(&gpu, 1);
        assert_eq!(report.class, PbdmaClass::Restartable);
        assert!(!report.recover);
        assert_eq!(sim.peek(regs::NV_PPBDMA_INTR_0::offset(1)), 0);
        assert_eq!(gpu.ecc.get(EccCounter::PbdmaError), 0);
    }

    #[test]
    fn channel_fatal_targets_the_loaded_tsg() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        sim.inject_pbdma_intr(0, bits(|r| r.set_pbcrc(true)), Some(3));

        let report = isr(&gpu, 0);
        assert_eq!(report.class, PbdmaClass::ChannelFatal);
        assert_eq!(report.scope, Some(RecoveryScope::Tsg(3)));
        assert_eq!(report.notifier, ErrorNotifier::PbdmaCrc);
        assert_eq!(gpu.ecc.get(EccCounter::PbdmaError), 1);
    }

    #[test]
    fn device_fatal_targets_the_pbdma() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        sim.inject_pbdma_intr(2, bits(|r| r.set_lbreq(true)), None);

        let report = isr(&gpu, 2);
        assert_eq!(report.class, PbdmaClass::DeviceFatal);
        assert_eq!(report.scope, Some(RecoveryScope::Pbdma(2)));
        assert_eq!(report.notifier, ErrorNotifier::PbdmaError);
    }

    #[test]
    fn device_fatal_recovery_resets_the_pbdma() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        sim.inject_pbdma_intr(2, bits(|r| r.set_lbreq(true)), None);

        gpu.fifo.isr_stall(&gpu).unwrap();
        assert_eq!(sim.pbdma_resets(), vec![2]);
        assert_eq!(sim.peek(regs::NV_PMC_ENABLE_PB::OFFSET) & (1 << 2), 1 << 2);
    }
}
