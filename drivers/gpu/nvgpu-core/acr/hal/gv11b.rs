// SPDX-License-Identifier: GPL-2.0

use crate::{
    acr::{
        hal::{bootstrap_falcon_cmd, AcrHal, BootstrapCmd},
        ManagedFalcon,
    },
    falcon::FalconId,
};

struct Gv11b;

const SEC2_ACR_CMD_BOOTSTRAP_FALCON: u8 = 0;

const MANAGED: &[ManagedFalcon] = &[
    ManagedFalcon {
        id: FalconId::Sec2,
        lazy: false,
        dgpu_only: false,
    },
    ManagedFalcon {
        id: FalconId::Fecs,
        lazy: false,
        dgpu_only: false,
    },
    ManagedFalcon {
        id: FalconId::Gpccs,
        lazy: false,
        dgpu_only: false,
    },
    ManagedFalcon {
        id: FalconId::Nvdec,
        lazy: true,
        dgpu_only: true,
    },
];

impl AcrHal for Gv11b {
    fn owner(&self) -> FalconId {
        FalconId::Sec2
    }

    fn managed_falcons(&self) -> &'static [ManagedFalcon] {
        MANAGED
    }

    fn bootstrap_cmds(&self, ids: &[FalconId], _wpr_base: u64) -> Vec<BootstrapCmd> {
        ids.iter()
            .map(|id| bootstrap_falcon_cmd(SEC2_ACR_CMD_BOOTSTRAP_FALCON, *id))
            .collect()
    }
}

const GV11B: Gv11b = Gv11b;
pub(super) const GV11B_HAL: &dyn AcrHal = &GV11B;
