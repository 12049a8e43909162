// SPDX-License-Identifier: GPL-2.0

use std::sync::{mpsc, Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::acr::Acr;
use crate::config::GpuConfig;
use crate::dma::DmaAllocator;
use crate::ecc::EccStats;
use crate::error::{self, code::*, Result};
use crate::falcon::nvdec::Nvdec;
use crate::falcon::{Falcon, FalconFlags, FalconId};
use crate::fb::Fb;
use crate::fence::SyncFileOps;
use crate::fifo::Fifo;
use crate::firmware::FirmwareLoader;
use crate::gr::Gr;
use crate::intr::{self, NonstallOps};
use crate::io::Bar0;
use crate::ltc::Ltc;
use crate::mc;
use crate::mm::vm::Vm;
use crate::mm::Mm;
use crate::pmu::{Pmu, PowerGating};
use crate::regs;
use crate::semaphore::SemaphoreSea;
use crate::syncpt::Host1x;
use crate::util;

macro_rules! define_chipset {
    ({ $($variant:ident = $value:expr),* $(,)* }) =>
    {
        /// Enum representation of the GPU chipset.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Chipset {
            $($variant = $value),*,
        }

        impl Chipset {
            pub const ALL: &'static [Chipset] = &[
                $( Chipset::$variant, )*
            ];

            pub(crate) const NAMES: [&'static str; Self::ALL.len()] = [
                $( util::const_bytes_to_str(
                        util::to_lowercase_bytes::<{ stringify!($variant).len() }>(
                            stringify!($variant)
                        ).as_slice()
                ), )*
            ];
        }

        impl TryFrom<u32> for Chipset {
            type Error = error::Error;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Chipset::$variant), )*
                    _ => Err(ENOTSUPP),
                }
            }
        }
    }
}

define_chipset!({
    // Pascal
    GP10B = 0x13b,
    GP104 = 0x134,
    // Volta
    GV11B = 0x15b,
    GV100 = 0x140,
    // Turing
    TU104 = 0x164,
    TU106 = 0x166,
});

impl Chipset {
    pub const fn arch(&self) -> Architecture {
        match self {
            Self::GP10B | Self::GP104 => Architecture::Pascal,
            Self::GV11B | Self::GV100 => Architecture::Volta,
            Self::TU104 | Self::TU106 => Architecture::Turing,
        }
    }

    /// Whether the chip is integrated in a SoC, sharing system memory with the CPU.
    pub fn is_igpu(&self) -> bool {
        matches!(self, Self::GP10B | Self::GV11B)
    }

    /// Lowercase name, used to build firmware paths.
    pub fn name(&self) -> &'static str {
        let idx = Self::ALL.iter().position(|c| c == self).unwrap_or(0);
        Self::NAMES[idx]
    }
}

impl core::fmt::Display for Chipset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Enum representation of the GPU generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Architecture {
    Pascal,
    Volta,
    Turing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
}

impl Revision {
    fn from_boot0(boot0: regs::NV_PMC_BOOT_0) -> Self {
        Self {
            major: boot0.major_revision(),
            minor: boot0.minor_revision(),
        }
    }
}

impl core::fmt::Display for Revision {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:x}.{:x}", self.major, self.minor)
    }
}

/// Structure holding the identity of the GPU.
#[derive(Debug, Clone, Copy)]
pub struct Spec {
    pub chipset: Chipset,
    pub implementation: u8,
    /// The revision of the chipset.
    pub revision: Revision,
}

impl Spec {
    fn new(bar: &Bar0) -> Result<Spec> {
        let boot0 = regs::NV_PMC_BOOT_0::read(bar);

        Ok(Self {
            chipset: boot0.chipset().try_into().inspect_err(|_| {
                warn!("unsupported chipset {:#x}", boot0.chipset());
            })?,
            implementation: boot0.implementation(),
            revision: Revision::from_boot0(boot0),
        })
    }
}

/// Services the core relies on but does not implement.
#[derive(Clone)]
pub struct Platform {
    pub firmware: Arc<dyn FirmwareLoader>,
    /// Syncpoint driver. Syncpoint-backed fences are only available with it.
    pub host1x: Option<Arc<dyn Host1x>>,
    /// OS fence export and import.
    pub sync_file: Option<Arc<dyn SyncFileOps>>,
    /// ELPG governor.
    pub power_gating: Option<Arc<dyn PowerGating>>,
    /// System memory is reached through an IOMMU.
    pub iommu: bool,
}

bitflags! {
    /// Capabilities advertised in [`Characteristics`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GpuFlags: u32 {
        const SUPPORT_SYNCPOINTS = 1 << 0;
        const SUPPORT_TSG = 1 << 1;
        const SUPPORT_GFXP = 1 << 2;
        const SUPPORT_CILP = 1 << 3;
        const SUPPORT_SUBCONTEXTS = 1 << 4;
        const SUPPORT_SPARSE = 1 << 5;
        const IS_DGPU = 1 << 6;
    }
}

/// Capability record handed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristics {
    pub arch: Architecture,
    pub implementation: u8,
    pub revision: Revision,
    pub num_gpc: u32,
    pub num_tpc_per_gpc: u32,
    pub num_sm: u32,
    pub num_ltc: u32,
    pub l2_size: u64,
    /// Bitmask of the supported big page sizes.
    pub big_page_sizes: u32,
    pub default_big_page_size: u32,
    pub max_subctx: u32,
    pub compute_class: u32,
    pub graphics_class: u32,
    pub copy_class: u32,
    pub gpfifo_class: u32,
    pub num_channels: u32,
    pub flags: GpuFlags,
}

/// Lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuState {
    /// Probed, hardware not initialized.
    Off,
    Ready,
    Suspended,
    /// Bring-up failed. Every later init attempt fails early.
    Failed,
}

/// Structure holding the resources required to operate the GPU.
pub struct Gpu {
    pub(crate) spec: Spec,
    /// MMIO mapping of BAR 0.
    pub(crate) bar: Bar0,
    pub(crate) config: GpuConfig,
    pub(crate) platform: Platform,
    pub(crate) dma: DmaAllocator,
    pub(crate) mm: Arc<Mm>,
    pub(crate) fb: Fb,
    pub(crate) ltc: Ltc,
    pub(crate) ecc: EccStats,
    pub(crate) pmu: Pmu,
    pub(crate) acr: Acr,
    pub(crate) nvdec: Option<Falcon<Nvdec>>,
    pub(crate) fifo: Fifo,
    pub(crate) gr: Gr,
    pub(crate) sema_sea: Arc<SemaphoreSea>,
    characteristics: OnceLock<Characteristics>,
    state: Mutex<GpuState>,
    nonstall_tx: Mutex<Option<mpsc::Sender<NonstallOps>>>,
}

impl Gpu {
    /// Identifies the chip behind `bar` and sets up the software state of every unit. The
    /// hardware is left untouched until [`Gpu::init`].
    pub fn probe(bar: Bar0, platform: Platform, config: GpuConfig) -> Result<Arc<Gpu>> {
        let spec = Spec::new(&bar)?;
        let chipset = spec.chipset;
        let is_dgpu = !chipset.is_igpu();

        let dma = DmaAllocator::new(platform.iommu, config.pramin_enabled && is_dgpu);
        let mm = Arc::new(Mm::new(bar.clone(), dma.clone(), &config, is_dgpu));

        let nvdec = if is_dgpu {
            Some(Falcon::new(chipset, FalconFlags::SUPPORTED)?)
        } else {
            None
        };

        let gpu = Gpu {
            fb: Fb::new(chipset),
            ltc: Ltc::new(chipset),
            ecc: EccStats::new(),
            pmu: Pmu::new(chipset, platform.power_gating.clone())?,
            acr: Acr::new(chipset)?,
            nvdec,
            fifo: Fifo::new(chipset, &config),
            gr: Gr::new(chipset)?,
            sema_sea: Arc::new(SemaphoreSea::new(dma.clone(), mm.inst_aperture())),
            spec,
            bar,
            config,
            platform,
            dma,
            mm,
            characteristics: OnceLock::new(),
            state: Mutex::new(GpuState::Off),
            nonstall_tx: Mutex::new(None),
        };

        info!(
            "NVIDIA (Chipset: {}, Architecture: {:?}, Revision: {})",
            chipset,
            chipset.arch(),
            spec.revision
        );

        Ok(Arc::new(gpu))
    }

    pub fn chipset(&self) -> Chipset {
        self.spec.chipset
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn is_dgpu(&self) -> bool {
        !self.spec.chipset.is_igpu()
    }

    pub fn state(&self) -> GpuState {
        *error::lock(&self.state)
    }

    /// Bring up the hardware. Timeouts during bring-up are reported as `EFATAL`.
    pub fn init(&self) -> Result {
        let mut state = error::lock(&self.state);
        match *state {
            GpuState::Ready => return Ok(()),
            GpuState::Failed => return Err(EFATAL),
            GpuState::Off | GpuState::Suspended => (),
        }

        match self.init_hw() {
            Ok(()) => {
                *state = GpuState::Ready;
                debug!("{}: ready", self.chipset());
                Ok(())
            }
            Err(e) => {
                error!("{}: init failed: {:?}", self.chipset(), e);
                *state = GpuState::Failed;
                Err(match e {
                    EBUSY | ETIMEDOUT => EFATAL,
                    e => e,
                })
            }
        }
    }

    fn init_hw(&self) -> Result {
        let bar = &self.bar;

        self.fifo.init_engines(bar)?;

        let mut units = mc::ENABLE_PFIFO
            | mc::ENABLE_GR
            | mc::ENABLE_PERFMON
            | mc::ENABLE_PMU
            | self.fifo.engine_reset_mask();
        if self.acr.sec2.is_some() {
            units |= mc::ENABLE_SEC2;
        }
        if self.nvdec.is_some() {
            units |= mc::ENABLE_NVDEC;
        }
        mc::enable(bar, units);

        self.fb.init_hw(bar, &self.dma)?;
        self.ltc.init_hw(bar);
        self.fifo.init_hw(bar, &self.dma, self.mm.inst_aperture())?;
        self.acr.bootstrap(self)?;
        self.gr.init_hw(self)?;
        intr::enable(self);

        let _ = self.characteristics.set(self.compute_characteristics());

        Ok(())
    }

    fn compute_characteristics(&self) -> Characteristics {
        let chipset = self.chipset();
        let gr = self.gr.config();
        let classes = self.gr.hal().classes();
        let mut flags = GpuFlags::SUPPORT_TSG | GpuFlags::SUPPORT_SPARSE;

        if self.platform.host1x.is_some() {
            flags |= GpuFlags::SUPPORT_SYNCPOINTS;
        }
        if self.gr.hal().supports_gfxp() {
            flags |= GpuFlags::SUPPORT_GFXP;
        }
        if self.gr.hal().supports_cilp() {
            flags |= GpuFlags::SUPPORT_CILP;
        }
        if self.gr.hal().max_subctx() > 1 {
            flags |= GpuFlags::SUPPORT_SUBCONTEXTS;
        }
        if self.is_dgpu() {
            flags |= GpuFlags::IS_DGPU;
        }

        Characteristics {
            arch: chipset.arch(),
            implementation: self.spec.implementation,
            revision: self.spec.revision,
            num_gpc: gr.num_gpc,
            num_tpc_per_gpc: gr.max_tpc_per_gpc,
            num_sm: gr.num_sm,
            num_ltc: self.ltc.count(),
            l2_size: self.ltc.l2_size(),
            big_page_sizes: (64 << 10) | (128 << 10),
            default_big_page_size: self.mm.default_big_page_size,
            max_subctx: self.gr.hal().max_subctx(),
            compute_class: classes.compute,
            graphics_class: classes.graphics,
            copy_class: classes.copy,
            gpfifo_class: classes.gpfifo,
            num_channels: self.fifo.num_channels(),
            flags,
        }
    }

    /// Capability record, available once the device is initialized.
    pub fn characteristics(&self) -> Option<&Characteristics> {
        self.characteristics.get()
    }

    /// Creates a GPU address space.
    pub fn create_vm(&self, big_page_size: u32, name: &str) -> Result<Arc<Vm>> {
        Vm::new(&self.mm, big_page_size, name)
    }

    /// Wait until every engine and the graphics pipe are idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result {
        let bar = &self.bar;

        util::read_poll_timeout(
            || Ok(self.fifo.engines_busy(bar) || regs::NV_PGRAPH_STATUS::read(bar).busy()),
            |busy| !*busy,
            Duration::from_micros(10),
            timeout,
        )
        .map(|_| ())
        .inspect_err(|_| warn!("{}: engines still busy", self.chipset()))
    }

    /// Quiesce the device before power is removed: channels are stopped, their TSGs preempted
    /// and interrupts masked.
    pub fn suspend(&self) -> Result {
        let mut state = error::lock(&self.state);
        if *state != GpuState::Ready {
            return Err(EINVAL);
        }

        self.fifo.suspend(self)?;
        intr::disable(self);
        *state = GpuState::Suspended;
        debug!("{}: suspended", self.chipset());

        Ok(())
    }

    /// Undo [`Gpu::suspend`].
    pub fn resume(&self) -> Result {
        let mut state = error::lock(&self.state);
        if *state != GpuState::Suspended {
            return Err(EINVAL);
        }

        intr::enable(self);
        self.fifo.resume(self)?;
        *state = GpuState::Ready;
        debug!("{}: resumed", self.chipset());

        Ok(())
    }

    /// Services the stall interrupt tree.
    pub fn isr_stall(&self) -> Result {
        intr::isr_stall(self)
    }

    /// Services the non-stall interrupt tree. The resulting operations are handed to the
    /// non-stall worker if one runs, and returned.
    pub fn isr_nonstall(&self) -> NonstallOps {
        let ops = intr::isr_nonstall(self);

        if !ops.is_empty() {
            if let Some(tx) = error::lock(&self.nonstall_tx).as_ref() {
                let _ = tx.send(ops);
            }
        }

        ops
    }

    /// Runs the deferred part of non-stall handling.
    pub fn handle_nonstall_ops(&self, ops: NonstallOps) {
        intr::handle_nonstall_ops(self, ops)
    }

    /// Spawns the thread running deferred non-stall work.
    pub fn start_nonstall_worker(self: &Arc<Self>) -> Result {
        let mut slot = error::lock(&self.nonstall_tx);
        if slot.is_some() {
            return Err(EBUSY);
        }

        let (tx, rx) = mpsc::channel::<NonstallOps>();
        let gpu: Weak<Gpu> = Arc::downgrade(self);

        thread::Builder::new()
            .name(format!("{}-nonstall", self.chipset().name()))
            .spawn(move || {
                while let Ok(ops) = rx.recv() {
                    let Some(gpu) = gpu.upgrade() else { break };
                    gpu.handle_nonstall_ops(ops);
                }
            })
            .map_err(|_| ENOMEM)?;

        *slot = Some(tx);

        Ok(())
    }

    /// Boots a falcon the ACR left for on-demand bootstrap.
    pub fn bootstrap_lazy_falcon(&self, id: FalconId) -> Result {
        if self.state() != GpuState::Ready {
            return Err(EINVAL);
        }
        if id == FalconId::Nvdec && self.nvdec.is_none() {
            return Err(ENOTSUPP);
        }

        self.acr.bootstrap_lazy(self, id)
    }

    /// Whether new submissions are refused after an unrecovered fault.
    pub fn is_quiesced(&self) -> bool {
        self.fifo.is_quiesced()
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        // Stops the worker.
        error::lock(&self.nonstall_tx).take();
        self.fb.fini_hw(&self.bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, Sim};

    #[test]
    fn chipset_names_and_arch() {
        assert_eq!(Chipset::GV11B.name(), "gv11b");
        assert_eq!(Chipset::TU106.name(), "tu106");
        assert_eq!(Chipset::try_from(0x13b), Ok(Chipset::GP10B));
        assert_eq!(Chipset::try_from(0x172), Err(ENOTSUPP));
        assert_eq!(Chipset::GP104.arch(), Architecture::Pascal);
        assert!(Chipset::GV11B.is_igpu());
        assert!(!Chipset::TU104.is_igpu());
    }

    #[test]
    fn probe_rejects_unknown_chip() {
        let sim = Sim::new(Chipset::GV11B);
        sim.poke(regs::NV_PMC_BOOT_0::OFFSET, 0x1720_00a1);

        assert_eq!(
            Gpu::probe(sim.bar(), sim::platform(), GpuConfig::default()).err(),
            Some(ENOTSUPP)
        );
    }

    #[test]
    fn characteristics_after_init() {
        for chipset in [Chipset::GP10B, Chipset::GV11B, Chipset::TU104] {
            let (_sim, gpu) = sim::test_gpu(chipset);
            let c = gpu.characteristics().unwrap();

            assert_eq!(c.arch, chipset.arch());
            assert_eq!(c.num_gpc, sim::NUM_GPCS);
            assert_eq!(c.num_sm, sim::NUM_GPCS * sim::NUM_TPC_PER_GPC * gpu.gr.hal().sm_per_tpc());
            assert_eq!(c.flags.contains(GpuFlags::IS_DGPU), !chipset.is_igpu());
            assert_eq!(
                c.flags.contains(GpuFlags::SUPPORT_SUBCONTEXTS),
                chipset.arch() >= Architecture::Volta
            );
            assert_eq!(gpu.state(), GpuState::Ready);
        }
    }

    #[test]
    fn suspend_resume() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);

        assert_eq!(gpu.resume(), Err(EINVAL));
        gpu.suspend().unwrap();
        assert_eq!(gpu.state(), GpuState::Suspended);
        assert_eq!(sim.peek(regs::NV_PMC_INTR_EN_CLEAR::offset(mc::INTR_STALL)), u32::MAX);

        gpu.resume().unwrap();
        assert_eq!(gpu.state(), GpuState::Ready);
        assert_ne!(sim.peek(regs::NV_PMC_INTR_EN_SET::offset(mc::INTR_STALL)), 0);
    }

    #[test]
    fn wait_for_idle_reports_busy() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);

        gpu.wait_for_idle(Duration::from_millis(10)).unwrap();
        sim.poke(regs::NV_PGRAPH_STATUS::OFFSET, 1);
        assert_eq!(gpu.wait_for_idle(Duration::from_millis(5)), Err(EBUSY));
    }
}
