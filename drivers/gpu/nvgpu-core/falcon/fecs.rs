// SPDX-License-Identifier: GPL-2.0

use crate::falcon::{FalconEngine, FalconId, PFalconBase};
use crate::regs::macros::RegisterBase;

/// Type specifying the front-end context switch falcon. Cannot be instantiated.
pub(crate) struct Fecs(());

impl RegisterBase<PFalconBase> for Fecs {
    const BASE: usize = 0x00409000;
}

impl FalconEngine for Fecs {
    const ID: Self = Fecs(());
    const FALCON_ID: FalconId = FalconId::Fecs;
}
