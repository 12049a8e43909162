// SPDX-License-Identifier: GPL-2.0

use crate::{
    acr::{
        hal::{bootstrap_falcon_cmd, AcrHal, BootstrapCmd, BOOTSTRAP_FLAGS_RESET_YES},
        ManagedFalcon,
    },
    falcon::FalconId,
    util,
};

struct Gp10b;

const PMU_ACR_CMD_BOOTSTRAP_FALCON: u8 = 1;
const PMU_ACR_CMD_BOOTSTRAP_MULTIPLE_FALCONS: u8 = 3;

const MANAGED: &[ManagedFalcon] = &[
    ManagedFalcon {
        id: FalconId::Pmu,
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
];

fn bootstrap_multiple_cmd(ids: &[FalconId], wpr_base: u64) -> BootstrapCmd {
    let mask = ids.iter().fold(0u32, |m, id| m | (1 << u32::from(*id)));

    let mut payload = vec![PMU_ACR_CMD_BOOTSTRAP_MULTIPLE_FALCONS, 0, 0, 0];
    payload.extend_from_slice(&BOOTSTRAP_FLAGS_RESET_YES.to_le_bytes());
    payload.extend_from_slice(&mask.to_le_bytes());
    // Falcons load from physical addresses.
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&util::lo32(wpr_base).to_le_bytes());
    payload.extend_from_slice(&util::hi32(wpr_base).to_le_bytes());

    BootstrapCmd {
        payload,
        expected: mask,
    }
}

impl AcrHal for Gp10b {
    fn owner(&self) -> FalconId {
        FalconId::Pmu
    }

    fn managed_falcons(&self) -> &'static [ManagedFalcon] {
        MANAGED
    }

    fn bootstrap_cmds(&self, ids: &[FalconId], wpr_base: u64) -> Vec<BootstrapCmd> {
        match ids {
            [] => Vec::new(),
            [id] => vec![bootstrap_falcon_cmd(PMU_ACR_CMD_BOOTSTRAP_FALCON, *id)],
            _ => vec![bootstrap_multiple_cmd(ids, wpr_base)],
        }
    }
}

const GP10B: Gp10b = Gp10b;
pub(super) const GP10B_HAL: &dyn AcrHal = &GP10B;
