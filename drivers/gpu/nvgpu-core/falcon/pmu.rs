// SPDX-License-Identifier: GPL-2.0

use crate::error::Result;
use crate::falcon::queue::RtosEngine;
use crate::falcon::{FalconEngine, FalconId, PFalconBase};
use crate::io::Bar0;
use crate::mc;
use crate::regs;
use crate::regs::macros::RegisterBase;

/// Type specifying the `Pmu` falcon engine. Cannot be instantiated.
pub(crate) struct Pmu(());

impl RegisterBase<PFalconBase> for Pmu {
    const BASE: usize = 0x0010a000;
}

impl FalconEngine for Pmu {
    const ID: Self = Pmu(());
    const FALCON_ID: FalconId = FalconId::Pmu;

    fn engine_reset(bar: &Bar0) -> Option<Result> {
        mc::reset(bar, mc::ENABLE_PMU, mc::RESET_SETTLE);
        Some(Ok(()))
    }
}

impl RtosEngine for Pmu {
    const CMDQ_HEAD: usize = regs::NV_PPWR_PMU_QUEUE_HEAD::offset(0);
    const CMDQ_TAIL: usize = regs::NV_PPWR_PMU_QUEUE_TAIL::offset(0);
    const MSGQ_HEAD: usize = regs::NV_PPWR_PMU_MSGQ_HEAD::OFFSET;
    const MSGQ_TAIL: usize = regs::NV_PPWR_PMU_MSGQ_TAIL::OFFSET;
}
