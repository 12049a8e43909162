// SPDX-License-Identifier: GPL-2.0

use crate::falcon::{FalconEngine, FalconId, PFalconBase};
use crate::regs::macros::RegisterBase;

/// Type specifying the GPC context switch falcon. Cannot be instantiated.
pub(crate) struct Gpccs(());

impl RegisterBase<PFalconBase> for Gpccs {
    const BASE: usize = 0x0041a000;
}

impl FalconEngine for Gpccs {
    const ID: Self = Gpccs(());
    const FALCON_ID: FalconId = FalconId::Gpccs;
}
