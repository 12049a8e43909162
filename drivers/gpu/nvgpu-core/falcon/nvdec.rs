// SPDX-License-Identifier: GPL-2.0

use crate::falcon::{FalconEngine, FalconId, PFalconBase};
use crate::regs::macros::RegisterBase;

/// Type specifying the video decoder falcon. Cannot be instantiated.
pub(crate) struct Nvdec(());

impl RegisterBase<PFalconBase> for Nvdec {
    const BASE: usize = 0x00084000;
}

impl FalconEngine for Nvdec {
    const ID: Self = Nvdec(());
    const FALCON_ID: FalconId = FalconId::Nvdec;
}
