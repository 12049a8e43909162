// SPDX-License-Identifier: GPL-2.0

use crate::acr::ManagedFalcon;
use crate::falcon::FalconId;
use crate::gpu::{Architecture, Chipset};

mod gp10b;
mod gv11b;

/// `flags` of a bootstrap command: reset the falcon before loading it.
pub(super) const BOOTSTRAP_FLAGS_RESET_YES: u32 = 0;

/// A command for the ACR unit of the owner RTOS, and the id or mask its reply must carry.
pub(super) struct BootstrapCmd {
    pub(super) payload: Vec<u8>,
    pub(super) expected: u32,
}

pub(super) trait AcrHal: Sync {
    /// Falcon that runs the HS ucode and owns the WPR afterwards.
    fn owner(&self) -> FalconId;

    /// Falcons whose LS images go into the blob, the owner included.
    fn managed_falcons(&self) -> &'static [ManagedFalcon];

    /// Encodes the commands asking the owner RTOS to bootstrap `ids`.
    fn bootstrap_cmds(&self, ids: &[FalconId], wpr_base: u64) -> Vec<BootstrapCmd>;
}

/// Encodes a single `BOOTSTRAP_FALCON` command, which has the same layout on both owners.
pub(super) fn bootstrap_falcon_cmd(cmd_type: u8, id: FalconId) -> BootstrapCmd {
    let mut payload = vec![cmd_type, 0, 0, 0];
    payload.extend_from_slice(&BOOTSTRAP_FLAGS_RESET_YES.to_le_bytes());
    payload.extend_from_slice(&u32::from(id).to_le_bytes());

    BootstrapCmd {
        payload,
        expected: u32::from(id),
    }
}

/// Returns the HAL corresponding to `chipset`.
pub(super) fn acr_hal(chipset: Chipset) -> &'static dyn AcrHal {
    match chipset.arch() {
        Architecture::Pascal => gp10b::GP10B_HAL,
        Architecture::Volta | Architecture::Turing => gv11b::GV11B_HAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pascal_batches_bootstrap() {
        let cmds = acr_hal(Chipset::GP10B)
            .bootstrap_cmds(&[FalconId::Fecs, FalconId::Gpccs], 0x1_2345_6000);

        assert_eq!(cmds.len(), 1);
        let p = &cmds[0].payload;
        assert_eq!(p[0], 3);
        assert_eq!(&p[8..12], &((1u32 << 2) | (1 << 3)).to_le_bytes());
        assert_eq!(&p[16..20], &0x2345_6000u32.to_le_bytes());
        assert_eq!(&p[20..24], &1u32.to_le_bytes());
        assert_eq!(cmds[0].expected, 0xc);

        // A single falcon uses the plain command.
        let cmds = acr_hal(Chipset::GP10B).bootstrap_cmds(&[FalconId::Fecs], 0);
        assert_eq!(cmds[0].payload[0], 1);
        assert_eq!(cmds[0].expected, 2);
    }

    #[test]
    fn sec2_sends_one_command_per_falcon() {
        let cmds = acr_hal(Chipset::TU104)
            .bootstrap_cmds(&[FalconId::Fecs, FalconId::Gpccs, FalconId::Nvdec], 0);

        assert_eq!(cmds.len(), 3);
        assert!(cmds.iter().all(|c| c.payload.len() == 12 && c.payload[0] == 0));
        assert_eq!(
            cmds.iter().map(|c| c.expected).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }
}
