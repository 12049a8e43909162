// SPDX-License-Identifier: GPL-2.0

//! Access-controlled region.
//!
//! The LS falcon images are packed into a WPR blob, then the HS ACR ucode is run on the
//! bootstrap owner falcon. Once it has authenticated the blob, the RTOS of the owner starts the
//! other falcons on request.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::dma::{Aperture, DmaObject};
use crate::error::{self, code::*, Result};
use crate::falcon::queue::{RtosEngine, Rtos, UNIT_ACR};
use crate::falcon::sec2::Sec2;
use crate::falcon::{Falcon, FalconFlags, FalconId, FALCON_BLOCK_SIZE};
use crate::firmware::{self, AcrUcode, LsFirmware};
use crate::gpu::{Architecture, Chipset, Gpu};
use crate::io::Bar0;
use crate::transmute::AsBytes;
use crate::util;

pub(crate) mod blob;
mod hal;

use blob::{BlobLayout, LsbFlags, LsfImage};

/// Value MAILBOX0 holds until the HS ucode reports its status.
pub(crate) const ACR_MAILBOX_POISON: u32 = 0xdeada5a5;

/// Arguments handed to the HS ucode, at the first block boundary following its data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AcrBootArgs {
    pub(crate) wpr_base_lo: u32,
    pub(crate) wpr_base_hi: u32,
    pub(crate) wpr_size: u32,
    pub(crate) wpr_region_id: u32,
    pub(crate) owner: u32,
    pub(crate) is_dgpu: u32,
}

// SAFETY: `u32` fields only, no padding.
unsafe impl AsBytes for AcrBootArgs {}

/// Falcon managed by the ACR on a given chip.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ManagedFalcon {
    pub(crate) id: FalconId,
    /// Left for on-demand bootstrap.
    pub(crate) lazy: bool,
    pub(crate) dgpu_only: bool,
}

pub(crate) struct Acr {
    hal: &'static dyn hal::AcrHal,
    chipset: Chipset,
    pub(crate) sec2: Option<Falcon<Sec2>>,
    pub(crate) sec2_rtos: Rtos<Sec2>,
    blob: Mutex<Option<Arc<DmaObject>>>,
    bootstrapped: Mutex<BTreeSet<FalconId>>,
    lazy: Mutex<BTreeSet<FalconId>>,
}

fn pad4(data: &[u8]) -> Vec<u8> {
    let mut v = data.to_vec();
    v.resize(data.len().next_multiple_of(4), 0);
    v
}

impl Acr {
    pub(crate) fn new(chipset: Chipset) -> Result<Self> {
        let sec2 = match chipset.arch() {
            Architecture::Pascal => None,
            Architecture::Volta | Architecture::Turing => Some(Falcon::new(
                chipset,
                FalconFlags::SUPPORTED | FalconFlags::INTERRUPT_ENABLED,
            )?),
        };

        Ok(Self {
            hal: hal::acr_hal(chipset),
            chipset,
            sec2,
            sec2_rtos: Rtos::new(),
            blob: Mutex::new(None),
            bootstrapped: Mutex::new(BTreeSet::new()),
            lazy: Mutex::new(BTreeSet::new()),
        })
    }

    /// Falcon running the HS ucode and then the RTOS that bootstraps the others.
    pub(crate) fn owner(&self) -> FalconId {
        self.hal.owner()
    }

    pub(crate) fn is_bootstrapped(&self, id: FalconId) -> bool {
        error::lock(&self.bootstrapped).contains(&id)
    }

    /// Loads the LS images of the falcons managed on this chip.
    fn load_images(&self, gpu: &Gpu) -> Result<Vec<LsfImage>> {
        let loader = &gpu.platform.firmware;
        let mut images = Vec::new();

        for falcon in self.hal.managed_falcons() {
            if falcon.dgpu_only && !gpu.is_dgpu() {
                continue;
            }

            let (fw_path, sig_path) = firmware::ls_paths(self.chipset, falcon.id);
            let fw = loader.request(&fw_path)?;
            let sig = loader.request(&sig_path)?;
            let fw = LsFirmware::parse(falcon.id, &fw, &sig)?;

            let mut flags = LsbFlags::DMACTL_REQ_CTX;
            if falcon.id == self.owner() {
                flags |= LsbFlags::LOAD_CODE_AT_0;
            }
            if matches!(falcon.id, FalconId::Fecs | FalconId::Gpccs) {
                flags |= LsbFlags::FORCE_PRIV_LOAD;
            }

            images.push(LsfImage {
                id: falcon.id,
                lazy: falcon.lazy,
                flags,
                fw,
            });
        }

        Ok(images)
    }

    /// Builds the WPR blob in memory the GPU can reach.
    fn build_blob(&self, gpu: &Gpu, images: &[LsfImage]) -> Result<Arc<DmaObject>> {
        let layout = BlobLayout::compute(images, gpu.is_dgpu())?;
        let aperture = if gpu.is_dgpu() {
            Aperture::Vidmem
        } else {
            Aperture::Sysmem
        };

        let blob = gpu
            .dma
            .alloc(layout.size as usize, aperture)
            .inspect_err(|_| warn!("acr: cannot allocate {:#x} byte blob", layout.size))?;
        let bytes = layout.emit(images, self.owner(), blob.addr())?;
        blob.wr_n(0, &bytes)?;

        debug!(
            "acr: {} byte blob at {:#x} for {:?}",
            bytes.len(),
            blob.addr(),
            images.iter().map(|i| i.id).collect::<Vec<_>>()
        );

        Ok(blob)
    }

    /// Loads and starts the HS ucode on `falcon`, then waits for it to authenticate the blob
    /// and for the RTOS of the owner to come up.
    fn boot_hs<E: RtosEngine>(
        &self,
        gpu: &Gpu,
        falcon: &Falcon<E>,
        rtos: &Rtos<E>,
        blob: &DmaObject,
    ) -> Result {
        let bar = &gpu.bar;
        let ucode = AcrUcode::parse(
            &gpu.platform
                .firmware
                .request(&firmware::acr_ucode_path(self.chipset))?,
        )?;

        falcon.reset(bar)?;
        rtos.reset();

        let non_secure = pad4(&ucode.non_secure);
        let secure = pad4(&ucode.secure);
        falcon.copy_to_imem(bar, 0, &non_secure, 0, false, 0)?;
        let secure_off =
            util::align_up(non_secure.len() as u64, u64::from(FALCON_BLOCK_SIZE)) as u32;
        falcon.copy_to_imem(
            bar,
            secure_off,
            &secure,
            0,
            true,
            secure_off / FALCON_BLOCK_SIZE,
        )?;
        falcon.copy_to_dmem(bar, 0, &ucode.data, 0)?;

        let args = AcrBootArgs {
            wpr_base_lo: util::lo32(blob.addr()),
            wpr_base_hi: util::hi32(blob.addr()),
            wpr_size: blob.size() as u32,
            wpr_region_id: 1,
            owner: u32::from(self.owner()),
            is_dgpu: u32::from(gpu.is_dgpu()),
        };
        let args_off =
            util::align_up(ucode.data.len() as u64, u64::from(FALCON_BLOCK_SIZE)) as u32;
        falcon.copy_to_dmem(bar, args_off, args.as_bytes(), 0)?;

        falcon.mailbox_write(bar, 0, ACR_MAILBOX_POISON);
        falcon.bootstrap(bar, 0)?;

        let status = util::read_poll_timeout(
            || Ok(falcon.mailbox_read(bar, 0)),
            |v| *v != ACR_MAILBOX_POISON,
            Duration::from_micros(100),
            gpu.config.acr_timeout,
        )
        .map_err(|_| {
            error!("acr: HS ucode did not report within {:?}", gpu.config.acr_timeout);
            EFATAL
        })?;
        falcon
            .wait_for_halt(bar, gpu.config.acr_timeout)
            .inspect_err(|_| error!("acr: {:?} did not halt after the HS ucode", self.owner()))
            .map_err(|_| EFATAL)?;
        if status != 0 {
            error!("acr: HS ucode failed, status {:#x}", status);
            return Err(EFATAL);
        }

        rtos.wait_init(falcon, bar, gpu.config.acr_timeout)
            .inspect_err(|e| error!("acr: {:?} RTOS did not start: {:?}", self.owner(), e))
            .map_err(|_| EFATAL)
    }

    /// Asks the RTOS of the owner to start the falcons in `ids`.
    fn bootstrap_ls<E: RtosEngine>(
        &self,
        bar: &Bar0,
        falcon: &Falcon<E>,
        rtos: &Rtos<E>,
        ids: &[FalconId],
        timeout: Duration,
    ) -> Result {
        if ids.is_empty() {
            return Ok(());
        }

        let wpr = error::lock(&self.blob)
            .as_ref()
            .map(|b| b.addr())
            .ok_or(EINVAL)?;

        for cmd in self.hal.bootstrap_cmds(ids, wpr) {
            let reply = rtos
                .send(falcon, bar, UNIT_ACR, &cmd.payload, timeout)
                .inspect_err(|e| warn!("acr: bootstrap of {:?} failed: {:?}", ids, e))?;
            let acked = reply
                .get(4..8)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));

            if acked != Some(cmd.expected) {
                error!("acr: unexpected bootstrap reply {:x?}", reply);
                return Err(EFATAL);
            }
        }

        error::lock(&self.bootstrapped).extend(ids.iter().copied());
        Ok(())
    }

    fn with_owner<R>(
        &self,
        gpu: &Gpu,
        f: impl FnOnce(&dyn OwnerOps) -> Result<R>,
    ) -> Result<R> {
        match self.owner() {
            FalconId::Pmu => f(&Owner {
                falcon: &gpu.pmu.falcon,
                rtos: &gpu.pmu.rtos,
            }),
            FalconId::Sec2 => {
                let falcon = self.sec2.as_ref().ok_or(ENOTSUPP)?;
                f(&Owner {
                    falcon,
                    rtos: &self.sec2_rtos,
                })
            }
            _ => Err(EINVAL),
        }
    }

    /// Builds the blob, runs the HS ucode and starts every non-lazy LS falcon.
    ///
    /// Any failure past the blob construction is fatal.
    pub(crate) fn bootstrap(&self, gpu: &Gpu) -> Result {
        let images = self.load_images(gpu)?;
        let blob = self.build_blob(gpu, &images)?;
        *error::lock(&self.blob) = Some(blob.clone());

        let owner = self.owner();
        let (lazy, eager): (Vec<_>, Vec<_>) = images
            .iter()
            .filter(|i| i.id != owner)
            .map(|i| (i.id, i.lazy))
            .partition(|(_, lazy)| *lazy);
        let eager: Vec<FalconId> = eager.into_iter().map(|(id, _)| id).collect();
        *error::lock(&self.lazy) = lazy.into_iter().map(|(id, _)| id).collect();

        self.with_owner(gpu, |owner_ops| {
            owner_ops.boot_hs(self, gpu, &blob)?;
            error::lock(&self.bootstrapped).insert(owner);
            owner_ops
                .bootstrap_ls(self, &gpu.bar, &eager, gpu.config.acr_timeout)
                .map_err(|_| EFATAL)
        })?;

        info!("acr: {:?} authenticated, {:?} started", owner, eager);
        Ok(())
    }

    /// Starts a falcon that was left for on-demand bootstrap.
    pub(crate) fn bootstrap_lazy(&self, gpu: &Gpu, id: FalconId) -> Result {
        if !error::lock(&self.lazy).contains(&id) || self.is_bootstrapped(id) {
            return Err(EINVAL);
        }

        self.with_owner(gpu, |owner_ops| {
            owner_ops.bootstrap_ls(self, &gpu.bar, &[id], gpu.config.acr_timeout)
        })
    }

    /// Restarts falcons that went through an engine reset. The HS ucode is not rerun.
    pub(crate) fn rebootstrap(&self, gpu: &Gpu, ids: &[FalconId]) -> Result {
        error::lock(&self.bootstrapped).retain(|id| !ids.contains(id));

        self.with_owner(gpu, |owner_ops| {
            owner_ops.bootstrap_ls(self, &gpu.bar, ids, gpu.config.acr_timeout)
        })
    }
}

/// Operations run on the bootstrap owner, whichever falcon it is.
trait OwnerOps {
    fn boot_hs(&self, acr: &Acr, gpu: &Gpu, blob: &DmaObject) -> Result;
    fn bootstrap_ls(&self, acr: &Acr, bar: &Bar0, ids: &[FalconId], timeout: Duration) -> Result;
}

struct Owner<'a, E: RtosEngine> {
    falcon: &'a Falcon<E>,
    rtos: &'a Rtos<E>,
}

impl<E: RtosEngine> OwnerOps for Owner<'_, E> {
    fn boot_hs(&self, acr: &Acr, gpu: &Gpu, blob: &DmaObject) -> Result {
        acr.boot_hs(gpu, self.falcon, self.rtos, blob)
    }

    fn bootstrap_ls(&self, acr: &Acr, bar: &Bar0, ids: &[FalconId], timeout: Duration) -> Result {
        acr.bootstrap_ls(bar, self.falcon, self.rtos, ids, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuConfig;
    use crate::falcon::PFalconBase;
    use crate::gpu::GpuState;
    use crate::regs::macros::RegisterBase;
    use crate::sim;

    #[test]
    fn volta_boots_through_sec2() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);

        assert_eq!(gpu.acr.owner(), FalconId::Sec2);
        assert!(gpu.acr.is_bootstrapped(FalconId::Sec2));
        assert!(gpu.acr.is_bootstrapped(FalconId::Fecs));
        assert!(gpu.acr.is_bootstrapped(FalconId::Gpccs));
        assert_eq!(sim.acr_bootstrapped(), vec![FalconId::Fecs, FalconId::Gpccs]);
        // The HS ucode was given the blob.
        assert!(sim.falcon_started(<Sec2 as RegisterBase<PFalconBase>>::BASE));
    }

    #[test]
    fn pascal_boots_through_pmu_with_one_command() {
        let (sim, gpu) = sim::test_gpu(Chipset::GP10B);

        assert_eq!(gpu.acr.owner(), FalconId::Pmu);
        assert_eq!(sim.acr_commands(), 1);
        assert_eq!(sim.acr_bootstrapped(), vec![FalconId::Fecs, FalconId::Gpccs]);
    }

    #[test]
    fn nvdec_is_lazy_on_dgpu() {
        let (sim, gpu) = sim::test_gpu(Chipset::TU104);

        assert!(!gpu.acr.is_bootstrapped(FalconId::Nvdec));
        gpu.bootstrap_lazy_falcon(FalconId::Nvdec).unwrap();
        assert!(gpu.acr.is_bootstrapped(FalconId::Nvdec));
        assert!(sim.acr_bootstrapped().contains(&FalconId::Nvdec));

        // Only once, and only for lazy falcons.
        assert_eq!(gpu.bootstrap_lazy_falcon(FalconId::Nvdec), Err(EINVAL));
        assert_eq!(gpu.bootstrap_lazy_falcon(FalconId::Fecs), Err(EINVAL));
    }

    #[test]
    fn mailbox_timeout_is_fatal() {
        let config = GpuConfig {
            acr_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (sim, gpu) = sim::probe(Chipset::GV11B, config, sim::platform());
        sim.set_acr_hang(true);

        assert_eq!(gpu.init(), Err(EFATAL));
        assert!(sim.acr_bootstrapped().is_empty());
        assert!(!gpu.acr.is_bootstrapped(FalconId::Fecs));
        assert_eq!(gpu.state(), GpuState::Failed);

        // Even once the falcon would answer.
        sim.set_acr_hang(false);
        assert_eq!(gpu.init(), Err(EFATAL));
    }

    #[test]
    fn hs_falcon_must_halt() {
        let config = GpuConfig {
            acr_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (sim, gpu) = sim::probe(Chipset::GV11B, config, sim::platform());
        sim.set_acr_halts(false);

        assert_eq!(gpu.init(), Err(EFATAL));
        assert!(sim.acr_bootstrapped().is_empty());
        assert_eq!(gpu.state(), GpuState::Failed);
    }

    #[test]
    fn hs_error_status_is_fatal() {
        let (sim, gpu) = sim::probe(Chipset::GP10B, GpuConfig::default(), sim::platform());
        sim.set_acr_status(0x14);

        assert_eq!(gpu.init(), Err(EFATAL));
    }

    #[test]
    fn missing_firmware_fails_init() {
        let mut platform = sim::platform();
        platform.firmware = Arc::new(sim::TestFirmware::without("gpccs_sig.bin"));
        let (_sim, gpu) = sim::probe(Chipset::GV11B, GpuConfig::default(), platform);

        assert_eq!(gpu.init(), Err(EINVAL));
        assert_eq!(gpu.state(), GpuState::Failed);
    }
}
