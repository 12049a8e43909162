// SPDX-License-Identifier: GPL-2.0

use std::time::Duration;

use crate::error::Result;
use crate::falcon::queue::RtosEngine;
use crate::falcon::{FalconEngine, FalconId, PFalconBase};
use crate::io::Bar0;
use crate::regs;
use crate::regs::macros::RegisterBase;
use crate::util;

/// Type specifying the `Sec2` falcon engine. Cannot be instantiated.
pub(crate) struct Sec2(());

impl RegisterBase<PFalconBase> for Sec2 {
    const BASE: usize = 0x00087000;
}

impl FalconEngine for Sec2 {
    const ID: Self = Sec2(());
    const FALCON_ID: FalconId = FalconId::Sec2;

    fn engine_reset(bar: &Bar0) -> Option<Result> {
        regs::NV_PFALCON_FALCON_ENGINE::update(bar, &Self::ID, |r| r.set_reset(true));
        // TIMEOUT: the engine reset takes less than 10us.
        util::udelay(Duration::from_micros(10));
        regs::NV_PFALCON_FALCON_ENGINE::update(bar, &Self::ID, |r| r.set_reset(false));

        Some(Ok(()))
    }
}

impl RtosEngine for Sec2 {
    const CMDQ_HEAD: usize = regs::NV_PSEC_QUEUE_HEAD::offset(0);
    const CMDQ_TAIL: usize = regs::NV_PSEC_QUEUE_TAIL::offset(0);
    const MSGQ_HEAD: usize = regs::NV_PSEC_MSGQ_HEAD::OFFSET;
    const MSGQ_TAIL: usize = regs::NV_PSEC_MSGQ_TAIL::OFFSET;
}
