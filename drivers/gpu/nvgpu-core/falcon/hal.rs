// SPDX-License-Identifier: GPL-2.0

use log::warn;

use crate::{
    error::{code::*, Result},
    falcon::{FalconEngine, FalconMem, FALCON_BLOCK_SIZE},
    gpu::{Architecture, Chipset},
    io::Bar0,
    regs,
};

mod gp10b;
mod tu104;

/// Hardware Abstraction Layer for Falcon cores.
///
/// Implements chipset-specific low-level operations. The trait is generic against [`FalconEngine`]
/// so its `BASE` parameter can be used in order to avoid runtime bound checks when accessing
/// registers.
///
/// Operations a chip does not provide keep their default implementation, which warns and
/// returns `EINVAL`.
pub(crate) trait FalconHal<E: FalconEngine>: Send + Sync {
    /// Reset the falcon core through `CPUCTL`.
    fn reset_cpu(&self, bar: &Bar0) -> Result {
        regs::NV_PFALCON_FALCON_CPUCTL::default()
            .set_hreset(true)
            .write(bar, &E::ID);

        Ok(())
    }

    /// Returns `true` once IMEM and DMEM scrubbing are both done.
    fn scrubbing_done(&self, bar: &Bar0) -> bool {
        let r = regs::NV_PFALCON_FALCON_DMACTL::read(bar, &E::ID);
        !r.imem_scrubbing() && !r.dmem_scrubbing()
    }

    /// Size in bytes of the given memory.
    fn mem_size(&self, bar: &Bar0, mem: FalconMem) -> u32 {
        let hwcfg = regs::NV_PFALCON_FALCON_HWCFG::read(bar, &E::ID);
        let blocks = match mem {
            FalconMem::Imem => hwcfg.imem_size(),
            FalconMem::Dmem => hwcfg.dmem_size(),
        };

        blocks * FALCON_BLOCK_SIZE
    }

    /// Copy `src` into EMEM at `dst`.
    fn copy_to_emem(&self, _bar: &Bar0, _dst: u32, _src: &[u8], _port: usize) -> Result {
        warn!("falcon {:?}: copy_to_emem is not supported", E::FALCON_ID);
        Err(EINVAL)
    }
}

/// Returns a boxed falcon HAL adequate for `chipset`.
///
/// We use a heap-allocated trait object instead of a statically defined one because the
/// generic `FalconEngine` argument makes it difficult to define all the combinations
/// statically.
pub(super) fn falcon_hal<E: FalconEngine>(chipset: Chipset) -> Result<Box<dyn FalconHal<E>>> {
    let hal = match chipset.arch() {
        Architecture::Pascal | Architecture::Volta => {
            Box::new(gp10b::Gp10b::<E>::new()) as Box<dyn FalconHal<E>>
        }
        Architecture::Turing => Box::new(tu104::Tu104::<E>::new()) as Box<dyn FalconHal<E>>,
    };

    Ok(hal)
}
