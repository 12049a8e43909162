// SPDX-License-Identifier: GPL-2.0

//! Register-level model of a GPU for the unit tests.
//!
//! Registers are plain storage unless listed here. Interrupt registers are write-1-to-clear, the
//! top-level interrupt trees are derived from the unit registers, and the falcons model their
//! memory ports. The ACR RTOS answers bootstrap commands on its queues and the FECS answers the
//! methods the core issues. Channels only run when a test asks for it with [`Sim::run_channel`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::Channel;
use crate::config::GpuConfig;
use crate::error::{self, code::*, Result};
use crate::falcon::fecs::Fecs;
use crate::falcon::gpccs::Gpccs;
use crate::falcon::nvdec::Nvdec;
use crate::falcon::pmu::Pmu;
use crate::falcon::queue::{
    InitMsg, InitMsgQueue, QueueHeader, RtosEngine, CMDQ_ID, MSGQ_ID, QUEUE_HEADER_SIZE,
    UNIT_ACR, UNIT_INIT, UNIT_REWIND,
};
use crate::falcon::sec2::Sec2;
use crate::falcon::{FalconId, PFalconBase};
use crate::fence::{Fence, OsFence, SyncFileOps};
use crate::fifo;
use crate::firmware::{self, test_images, FirmwareLoader};
use crate::gpu::{Architecture, Chipset, Gpu, Platform};
use crate::gr::fecs;
use crate::io::{Bar0, MmioBackend};
use crate::mc;
use crate::mm::vm::Vm;
use crate::regs;
use crate::regs::macros::RegisterBase;
use crate::syncpt::Host1x;
use crate::transmute::{frombytes_at, AsBytes};
use crate::util::{self, hi32, lo32};

pub(crate) const NUM_GPCS: u32 = 2;
pub(crate) const NUM_TPC_PER_GPC: u32 = 2;
pub(crate) const NUM_LTC: u32 = 2;
pub(crate) const SLICES_PER_LTC: u32 = 2;
const NUM_FBPS: u32 = 1;

pub(crate) const GOLDEN_SIZE: usize = 0x8000;
pub(crate) const ZCULL_SIZE: usize = 0x1000;
pub(crate) const PM_SIZE: usize = 0x2000;
const PREEMPT_SIZE: u32 = 0x1000;

const FALCON_MEM_SIZE: usize = 0x10000;
const FALCON_BLOCKS: u32 = (FALCON_MEM_SIZE / 256) as u32;

/// DMEM placement of the RTOS queues.
const RTOS_MSGQ_OFFSET: u32 = 0x1000;
const RTOS_CMDQ_OFFSET: u32 = 0x1100;
const RTOS_QUEUE_SIZE: u32 = 0x100;

// ACR command types.
const ACR_CMD_BOOTSTRAP_FALCON: u8 = 1;
const ACR_CMD_BOOTSTRAP_MULTIPLE: u8 = 3;

const FALCON_BASES: [usize; 5] = [
    <Fecs as RegisterBase<PFalconBase>>::BASE,
    <Gpccs as RegisterBase<PFalconBase>>::BASE,
    <Pmu as RegisterBase<PFalconBase>>::BASE,
    <Sec2 as RegisterBase<PFalconBase>>::BASE,
    <Nvdec as RegisterBase<PFalconBase>>::BASE,
];

const LS_FALCONS: [FalconId; 5] = [
    FalconId::Pmu,
    FalconId::Fecs,
    FalconId::Gpccs,
    FalconId::Nvdec,
    FalconId::Sec2,
];

/// An engine of the device info table.
struct SimEngine {
    ty: u32,
    engine_id: u32,
    runlist_id: u32,
    intr_id: u32,
    reset_id: u32,
    pri_base: u32,
    inst_id: u32,
}

const GR_ENGINE: SimEngine = SimEngine {
    ty: regs::DEVICE_INFO_TYPE_GR,
    engine_id: 0,
    runlist_id: 0,
    intr_id: 12,
    reset_id: 12,
    pri_base: 0x40_0000,
    inst_id: 0,
};

const CE_ENGINES: [SimEngine; 2] = [
    SimEngine {
        ty: regs::DEVICE_INFO_TYPE_LCE,
        engine_id: 1,
        runlist_id: 1,
        intr_id: 13,
        reset_id: 6,
        pri_base: 0x10_4000,
        inst_id: 0,
    },
    SimEngine {
        ty: regs::DEVICE_INFO_TYPE_LCE,
        engine_id: 2,
        runlist_id: 2,
        intr_id: 14,
        reset_id: 7,
        pri_base: 0x10_5000,
        inst_id: 1,
    },
];

const NVDEC_ENGINE: SimEngine = SimEngine {
    ty: regs::DEVICE_INFO_TYPE_NVDEC,
    engine_id: 3,
    runlist_id: 3,
    intr_id: 15,
    reset_id: 15,
    pri_base: 0x8_4000,
    inst_id: 0,
};

impl SimEngine {
    fn device_info(&self) -> [u32; 3] {
        let chain = 1 << 31;
        let enum_entry = u32::from(regs::DEVICE_INFO_ENTRY_ENUM)
            | (0xf << 2)
            | (self.reset_id << 9)
            | (self.intr_id << 15)
            | (self.runlist_id << 21)
            | (self.engine_id << 26)
            | chain;
        let type_entry = u32::from(regs::DEVICE_INFO_ENTRY_ENGINE_TYPE) | (self.ty << 2) | chain;
        let data_entry = u32::from(regs::DEVICE_INFO_ENTRY_DATA)
            | ((self.pri_base >> 12) << 12)
            | (self.inst_id << 26);

        [enum_entry, type_entry, data_entry]
    }
}

/// Returns the index of `off` in the register array at `base`.
fn index_of(off: usize, base: usize, size: usize, stride: usize) -> Option<usize> {
    let rel = off.checked_sub(base)?;
    (rel % stride == 0 && rel / stride < size).then_some(rel / stride)
}

macro_rules! array_index {
    ($off:expr, $reg:ident) => {
        index_of(
            $off,
            regs::$reg::OFFSET,
            regs::$reg::SIZE,
            regs::$reg::STRIDE,
        )
    };
}

/// Offset of port `idx` of a falcon array register, relative to the falcon base.
macro_rules! rel_offset {
    ($reg:ident, $idx:expr) => {
        regs::$reg::OFFSET + $idx * regs::$reg::STRIDE
    };
}

/// Byte address selected by an IMEMC or DMEMC write.
fn mem_ptr(blk: u32, offs: u32) -> usize {
    ((blk % FALCON_BLOCKS) * 256 + offs * 4) as usize
}

fn align4(v: u32) -> u32 {
    (v + 3) & !3
}

struct FalconSim {
    imem: Vec<u32>,
    dmem: Vec<u8>,
    imem_ptr: [usize; 4],
    dmem_ptr: [usize; 8],
    tags: Vec<u32>,
    started: bool,
}

impl FalconSim {
    fn new() -> Self {
        Self {
            imem: vec![0; FALCON_MEM_SIZE / 4],
            dmem: vec![0; FALCON_MEM_SIZE],
            imem_ptr: [0; 4],
            dmem_ptr: [0; 8],
            tags: Vec::new(),
            started: false,
        }
    }

    fn dmem_word(&self, ptr: usize) -> u32 {
        match self.dmem.get(ptr..ptr + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    fn set_dmem_word(&mut self, ptr: usize, value: u32) {
        if let Some(b) = self.dmem.get_mut(ptr..ptr + 4) {
            b.copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Queue registers of the falcon running the ACR RTOS.
#[derive(Clone, Copy)]
struct RtosRegs {
    base: usize,
    cmdq_head: usize,
    cmdq_tail: usize,
    msgq_head: usize,
    msgq_tail: usize,
}

impl RtosRegs {
    fn of<E: RtosEngine>() -> Self {
        Self {
            base: <E as RegisterBase<PFalconBase>>::BASE,
            cmdq_head: E::CMDQ_HEAD,
            cmdq_tail: E::CMDQ_TAIL,
            msgq_head: E::MSGQ_HEAD,
            msgq_tail: E::MSGQ_TAIL,
        }
    }

    fn for_chipset(chipset: Chipset) -> Self {
        match chipset.arch() {
            Architecture::Pascal => Self::of::<Pmu>(),
            _ => Self::of::<Sec2>(),
        }
    }
}

struct SimInner {
    chipset: Chipset,
    rtos: RtosRegs,
    num_pbdma: usize,
    regs: HashMap<usize, u32>,
    writes: usize,
    intr_enabled: [u32; 2],
    falcons: HashMap<usize, FalconSim>,
    rtos_ready: bool,
    acr_hang: bool,
    acr_halts: bool,
    preempt_hang: bool,
    acr_status: u32,
    acr_commands: usize,
    bootstrapped: Vec<FalconId>,
    fecs_hang: bool,
    fecs_sizes: HashMap<u32, u32>,
    fecs_methods: Vec<u32>,
    pbdma_resets: Vec<u32>,
    preempted: Vec<u32>,
    doorbells: Vec<u32>,
}

impl SimInner {
    fn new(chipset: Chipset) -> Self {
        let mut s = Self {
            chipset,
            rtos: RtosRegs::for_chipset(chipset),
            num_pbdma: 0,
            regs: HashMap::new(),
            writes: 0,
            intr_enabled: [0; 2],
            falcons: HashMap::new(),
            rtos_ready: false,
            acr_hang: false,
            acr_halts: true,
            preempt_hang: false,
            acr_status: 0,
            acr_commands: 0,
            bootstrapped: Vec::new(),
            fecs_hang: false,
            fecs_sizes: HashMap::new(),
            fecs_methods: Vec::new(),
            pbdma_resets: Vec::new(),
            preempted: Vec::new(),
            doorbells: Vec::new(),
        };
        s.seed();
        s
    }

    fn seed(&mut self) {
        self.set(regs::NV_PMC_BOOT_0::OFFSET, ((self.chipset as u32) << 20) | 0xa1);

        self.set(regs::NV_PTOP_SCAL_NUM_GPCS::OFFSET, NUM_GPCS);
        self.set(regs::NV_PTOP_SCAL_NUM_TPC_PER_GPC::OFFSET, NUM_TPC_PER_GPC);
        self.set(regs::NV_PTOP_SCAL_NUM_FBPS::OFFSET, NUM_FBPS);
        for gpc in 0..NUM_GPCS as usize {
            self.set(regs::NV_PGRAPH_PRI_GPC_FS::offset(gpc), NUM_TPC_PER_GPC);
        }
        self.set(regs::NV_PRI_RINGMASTER_ENUM_LTC::OFFSET, NUM_LTC);
        self.set(
            regs::NV_PLTCG_LTCS_LTSS_CBC_PARAM::OFFSET,
            (SLICES_PER_LTC << 28) | (1 << 24),
        );
        self.set(regs::NV_PFB_PRI_MMU_CTRL::OFFSET, (0x10 << 16) | (1 << 15));

        for base in FALCON_BASES {
            self.set(
                base + regs::NV_PFALCON_FALCON_HWCFG::OFFSET,
                FALCON_BLOCKS | (FALCON_BLOCKS << 9),
            );
        }

        let mut engines = vec![&GR_ENGINE, &CE_ENGINES[0], &CE_ENGINES[1]];
        if !self.chipset.is_igpu() {
            engines.push(&NVDEC_ENGINE);
        }
        self.num_pbdma = engines.len();

        let entries = engines.iter().flat_map(|e| e.device_info());
        for (i, entry) in entries.enumerate() {
            self.set(regs::NV_PTOP_DEVICE_INFO::offset(i), entry);
        }

        self.set(regs::NV_PFIFO_HOST_NUM_PBDMA::OFFSET, self.num_pbdma as u32);
        self.set(regs::NV_PMC_ENABLE_PB::OFFSET, (1 << self.num_pbdma) - 1);
        for p in 0..self.num_pbdma {
            self.set(regs::NV_PFIFO_PBDMA_MAP::offset(p), 1 << p);
        }
    }

    fn reg(&self, off: usize) -> u32 {
        self.regs.get(&off).copied().unwrap_or(0)
    }

    fn set(&mut self, off: usize, value: u32) {
        self.regs.insert(off, value);
    }

    fn or(&mut self, off: usize, bits: u32) {
        let v = self.reg(off);
        self.set(off, v | bits);
    }

    fn falcon(&mut self, base: usize) -> &mut FalconSim {
        self.falcons.entry(base).or_insert_with(FalconSim::new)
    }

    fn ce_engines(&self) -> impl Iterator<Item = &'static SimEngine> {
        CE_ENGINES.iter()
    }

    fn ltc_pending(&self) -> u32 {
        (0..regs::NV_PLTCG_LTC_LTS_INTR::SIZE)
            .filter(|&i| self.reg(regs::NV_PLTCG_LTC_LTS_INTR::offset(i)) != 0)
            .fold(0, |bits, i| bits | (1 << (i / regs::LTS_PER_LTC_STRIDE)))
    }

    fn pbdma_pending(&self) -> u32 {
        (0..self.num_pbdma)
            .filter(|&p| {
                self.reg(regs::NV_PPBDMA_INTR_0::offset(p)) != 0
                    || self.reg(regs::NV_PPBDMA_INTR_1::offset(p)) != 0
            })
            .fold(0, |bits, p| bits | (1 << p))
    }

    /// Units pending on interrupt tree `tree`, before masking.
    fn units_pending(&self, tree: usize) -> u32 {
        let fifo = self.reg(regs::NV_PFIFO_INTR_0::OFFSET);
        let nonblockpipe = regs::NV_PCE_INTR_STATUS::default()
            .set_nonblockpipe(true)
            .raw();
        let mut units = 0;

        if tree == mc::INTR_STALL {
            if fifo & self.reg(regs::NV_PFIFO_INTR_EN_0::OFFSET) != 0 {
                units |= mc::INTR_UNIT_PFIFO;
            }
            if self.reg(regs::NV_PFB_NISO_INTR::OFFSET) != 0 {
                units |= mc::INTR_UNIT_HUB;
            }
            if self.reg(regs::NV_PGRAPH_INTR::OFFSET) != 0 {
                units |= mc::INTR_UNIT_GR;
            }
            let pmu = <Pmu as RegisterBase<PFalconBase>>::BASE;
            if self.reg(pmu + regs::NV_PFALCON_FALCON_IRQSTAT::OFFSET) != 0 {
                units |= mc::INTR_UNIT_PMU;
            }
            if self.ltc_pending() != 0 {
                units |= mc::INTR_UNIT_LTC;
            }
            if self.reg(regs::NV_PPRIV_MASTER_RING_INTERRUPT_STATUS0::OFFSET) != 0 {
                units |= mc::INTR_UNIT_PRIV_RING;
            }
            for ce in self.ce_engines() {
                let status = self.reg(regs::NV_PCE_INTR_STATUS::offset(ce.inst_id as usize));
                if status & !nonblockpipe != 0 {
                    units |= 1 << ce.intr_id;
                }
            }
        } else {
            if fifo & self.reg(regs::NV_PFIFO_INTR_EN_1::OFFSET) != 0 {
                units |= mc::INTR_UNIT_PFIFO;
            }
            if self.reg(regs::NV_PGRAPH_NONSTALL_INTR::OFFSET) != 0 {
                units |= mc::INTR_UNIT_GR;
            }
            for ce in self.ce_engines() {
                let status = self.reg(regs::NV_PCE_INTR_STATUS::offset(ce.inst_id as usize));
                if status & nonblockpipe != 0 {
                    units |= 1 << ce.intr_id;
                }
            }
        }

        units
    }

    fn is_w1c(off: usize) -> bool {
        [
            regs::NV_PFIFO_INTR_0::OFFSET,
            regs::NV_PFIFO_INTR_MMU_FAULT_ID::OFFSET,
            regs::NV_PFIFO_INTR_RUNLIST::OFFSET,
            regs::NV_PFIFO_INTR_CHSW_ERROR::OFFSET,
            regs::NV_PGRAPH_INTR::OFFSET,
            regs::NV_PGRAPH_NONSTALL_INTR::OFFSET,
            regs::NV_PFB_NISO_INTR::OFFSET,
        ]
        .contains(&off)
            || array_index!(off, NV_PPBDMA_INTR_0).is_some()
            || array_index!(off, NV_PPBDMA_INTR_1).is_some()
            || array_index!(off, NV_PCE_INTR_STATUS).is_some()
            || array_index!(off, NV_PLTCG_LTC_LTS_INTR).is_some()
    }

    fn falcon_at(off: usize) -> Option<(usize, usize)> {
        FALCON_BASES
            .iter()
            .find(|&&base| off >= base && off - base < 0x1000)
            .map(|&base| (base, off - base))
    }

    fn read(&mut self, off: usize) -> u32 {
        if let Some(t) = array_index!(off, NV_PMC_INTR) {
            return self.units_pending(t) & self.intr_enabled[t];
        }
        if let Some(t) = array_index!(off, NV_PMC_INTR_EN_SET) {
            return self.intr_enabled[t];
        }
        if off == regs::NV_PMC_INTR_LTC::OFFSET {
            return self.ltc_pending();
        }
        if off == regs::NV_PFIFO_INTR_PBDMA_ID::OFFSET {
            return self.pbdma_pending();
        }
        if let Some((base, rel)) = Self::falcon_at(off) {
            if let Some(v) = self.falcon_read(base, rel) {
                return v;
            }
        }

        self.reg(off)
    }

    fn falcon_read(&mut self, base: usize, rel: usize) -> Option<u32> {
        if rel == regs::NV_PFALCON_FALCON_DMACTL::OFFSET
            || rel == regs::NV_PFALCON_FALCON_IDLESTATE::OFFSET
        {
            return Some(0);
        }
        if let Some(p) = array_index!(rel, NV_PFALCON_FALCON_IMEMD) {
            let ctl = regs::NV_PFALCON_FALCON_IMEMC::from(
                self.reg(base + rel_offset!(NV_PFALCON_FALCON_IMEMC, p)),
            );
            let f = self.falcon(base);
            let ptr = f.imem_ptr[p];
            let v = f.imem.get(ptr / 4).copied().unwrap_or(0);
            if ctl.aincr() {
                f.imem_ptr[p] = (ptr + 4) % FALCON_MEM_SIZE;
            }
            return Some(v);
        }
        if let Some(p) = array_index!(rel, NV_PFALCON_FALCON_DMEMD) {
            let ctl = regs::NV_PFALCON_FALCON_DMEMC::from(
                self.reg(base + rel_offset!(NV_PFALCON_FALCON_DMEMC, p)),
            );
            let f = self.falcon(base);
            let ptr = f.dmem_ptr[p];
            let v = f.dmem_word(ptr);
            if ctl.aincr() {
                f.dmem_ptr[p] = (ptr + 4) % FALCON_MEM_SIZE;
            }
            return Some(v);
        }

        None
    }

    fn write(&mut self, off: usize, value: u32) {
        self.writes += 1;

        if let Some(t) = array_index!(off, NV_PMC_INTR_EN_SET) {
            self.intr_enabled[t] |= value;
            return;
        }
        if let Some(t) = array_index!(off, NV_PMC_INTR_EN_CLEAR) {
            self.intr_enabled[t] &= !value;
            self.set(off, value);
            return;
        }
        if off == regs::NV_PMC_ENABLE::OFFSET {
            self.write_pmc_enable(value);
            return;
        }
        if off == regs::NV_PMC_ENABLE_PB::OFFSET {
            let held = self.reg(off) & !value;
            self.pbdma_resets
                .extend((0..32u32).filter(|p| held & (1 << p) != 0));
            self.set(off, value);
            return;
        }
        if Self::is_w1c(off) {
            let v = self.reg(off);
            self.set(off, v & !value);
            return;
        }

        match off {
            o if o == regs::NV_PFB_MMU_FAULT_STATUS::OFFSET => {
                if regs::NV_PFB_MMU_FAULT_STATUS::from(value).valid() {
                    let info = regs::NV_PFB_MMU_FAULT_INFO::from(
                        self.reg(regs::NV_PFB_MMU_FAULT_INFO::OFFSET),
                    );
                    self.set(
                        regs::NV_PFB_MMU_FAULT_INFO::OFFSET,
                        info.set_valid(false).raw(),
                    );
                }
                self.set(off, 0);
            }
            o if o == regs::NV_PPRIV_MASTER_RING_COMMAND::OFFSET => {
                if regs::NV_PPRIV_MASTER_RING_COMMAND::from(value).cmd()
                    == regs::PRIV_RING_CMD_ACK_INTERRUPT
                {
                    self.set(regs::NV_PPRIV_MASTER_RING_INTERRUPT_STATUS0::OFFSET, 0);
                }
                self.set(off, 0);
            }
            o if o == regs::NV_PFIFO_PREEMPT::OFFSET => self.write_preempt(value),
            o if o == regs::NV_PFIFO_RUNLIST_PREEMPT::OFFSET => self.set(off, 0),
            o if o == regs::NV_USERMODE_NOTIFY_CHANNEL_PENDING::OFFSET => {
                self.doorbells.push(value);
                self.set(off, value);
            }
            o if o == regs::NV_UFLUSH_FB_FLUSH::OFFSET
                || o == regs::NV_UFLUSH_L2_SYSMEM_INVALIDATE::OFFSET
                || o == regs::NV_UFLUSH_L2_FLUSH_DIRTY::OFFSET =>
            {
                self.set(off, 0);
            }
            o if o == regs::NV_PGRAPH_PRI_FECS_METHOD_PUSH::OFFSET => {
                self.set(off, value);
                self.fecs_method(regs::NV_PGRAPH_PRI_FECS_METHOD_PUSH::from(value).addr());
            }
            o if o == self.rtos.cmdq_head => {
                self.set(off, value);
                if self.rtos_ready {
                    self.process_cmdq(value);
                }
            }
            _ => self.write_indexed(off, value),
        }
    }

    fn write_indexed(&mut self, off: usize, value: u32) {
        if array_index!(off, NV_PFIFO_ENG_RUNLIST).is_some() {
            // The runlist update completes at once.
            self.set(off, value & !(1 << 20));
            return;
        }
        if array_index!(off, NV_PFIFO_RUNLIST_SUBMIT_INFO_TU104).is_some() {
            self.set(off, value & !(1 << 15));
            return;
        }
        if array_index!(off, NV_PCCSR_CHANNEL).is_some() {
            let req = regs::NV_PCCSR_CHANNEL::from(value);
            let cur = regs::NV_PCCSR_CHANNEL::from(self.reg(off));
            let enable = (cur.enable() || req.enable_set()) && !req.enable_clr();
            let stored = req
                .set_enable(enable)
                .set_enable_set(false)
                .set_enable_clr(false)
                .set_pbdma_faulted_reset(false)
                .set_eng_faulted_reset(false);
            self.set(off, stored.raw());
            return;
        }
        if let Some(i) = array_index!(off, NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX_CLEAR) {
            let mailbox = regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::offset(i);
            let v = self.reg(mailbox);
            self.set(mailbox, v & !value);
            self.set(off, value);
            return;
        }
        if let Some((base, rel)) = Self::falcon_at(off) {
            if self.falcon_write(base, rel, value) {
                return;
            }
        }

        self.set(off, value);
    }

    fn write_pmc_enable(&mut self, value: u32) {
        let old = self.reg(regs::NV_PMC_ENABLE::OFFSET);
        self.set(regs::NV_PMC_ENABLE::OFFSET, value);

        if old & mc::ENABLE_GR != 0 && value & mc::ENABLE_GR == 0 {
            for i in 0..regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::SIZE {
                self.set(regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::offset(i), 0);
            }
            self.set(regs::NV_PGRAPH_PRI_FECS_CURRENT_CTX::OFFSET, 0);
        }
        let pmu_reset = old & mc::ENABLE_PMU != 0 && value & mc::ENABLE_PMU == 0;
        if pmu_reset && self.rtos.base == <Pmu as RegisterBase<PFalconBase>>::BASE {
            self.reset_rtos();
        }
    }

    fn write_preempt(&mut self, value: u32) {
        let req = regs::NV_PFIFO_PREEMPT::from(value);
        if self.preempt_hang {
            self.set(regs::NV_PFIFO_PREEMPT::OFFSET, req.set_pending(true).raw());
            return;
        }

        if req.id_type() == regs::PREEMPT_TYPE_TSG {
            let id = req.id();
            self.preempted.push(id);
            for e in 0..regs::NV_PFIFO_ENGINE_STATUS::SIZE {
                let off = regs::NV_PFIFO_ENGINE_STATUS::offset(e);
                let status = regs::NV_PFIFO_ENGINE_STATUS::from(self.reg(off));
                if status.id_type() && status.id() == id {
                    self.set(off, 0);
                }
            }
        }

        self.set(regs::NV_PFIFO_PREEMPT::OFFSET, req.set_pending(false).raw());
    }

    /// Handles falcon register `rel` of the falcon at `base`. Returns `true` if the value must
    /// not be stored as is.
    fn falcon_write(&mut self, base: usize, rel: usize, value: u32) -> bool {
        if rel == regs::NV_PFALCON_FALCON_IRQSCLR::OFFSET {
            let stat = base + regs::NV_PFALCON_FALCON_IRQSTAT::OFFSET;
            let v = self.reg(stat);
            self.set(stat, v & !value);
            return true;
        }
        if rel == regs::NV_PFALCON_FALCON_CPUCTL::OFFSET {
            let ctl = regs::NV_PFALCON_FALCON_CPUCTL::from(value);
            self.set(base + rel, ctl.set_startcpu(false).raw());
            if ctl.startcpu() {
                self.start_falcon(base);
            }
            return true;
        }
        if rel == regs::NV_PFALCON_FALCON_ENGINE::OFFSET {
            if regs::NV_PFALCON_FALCON_ENGINE::from(value).reset() && base == self.rtos.base {
                self.reset_rtos();
            }
            return false;
        }
        if let Some(p) = array_index!(rel, NV_PFALCON_FALCON_IMEMC) {
            let ctl = regs::NV_PFALCON_FALCON_IMEMC::from(value);
            self.falcon(base).imem_ptr[p] = mem_ptr(ctl.blk(), ctl.offs());
            return false;
        }
        if let Some(p) = array_index!(rel, NV_PFALCON_FALCON_IMEMD) {
            let ctl = regs::NV_PFALCON_FALCON_IMEMC::from(
                self.reg(base + rel_offset!(NV_PFALCON_FALCON_IMEMC, p)),
            );
            let f = self.falcon(base);
            let ptr = f.imem_ptr[p];
            if let Some(w) = f.imem.get_mut(ptr / 4) {
                *w = value;
            }
            if ctl.aincw() {
                f.imem_ptr[p] = (ptr + 4) % FALCON_MEM_SIZE;
            }
            return true;
        }
        if array_index!(rel, NV_PFALCON_FALCON_IMEMT).is_some() {
            let tag = regs::NV_PFALCON_FALCON_IMEMT::from(value).tag();
            self.falcon(base).tags.push(tag);
            return false;
        }
        if let Some(p) = array_index!(rel, NV_PFALCON_FALCON_DMEMC) {
            let ctl = regs::NV_PFALCON_FALCON_DMEMC::from(value);
            self.falcon(base).dmem_ptr[p] = mem_ptr(ctl.blk(), ctl.offs());
            return false;
        }
        if let Some(p) = array_index!(rel, NV_PFALCON_FALCON_DMEMD) {
            let ctl = regs::NV_PFALCON_FALCON_DMEMC::from(
                self.reg(base + rel_offset!(NV_PFALCON_FALCON_DMEMC, p)),
            );
            let f = self.falcon(base);
            let ptr = f.dmem_ptr[p];
            f.set_dmem_word(ptr, value);
            if ctl.aincw() {
                f.dmem_ptr[p] = (ptr + 4) % FALCON_MEM_SIZE;
            }
            return true;
        }

        false
    }

    fn dmem_read(&mut self, base: usize, off: u32, len: usize) -> Vec<u8> {
        let off = off as usize;
        match self.falcon(base).dmem.get(off..off + len) {
            Some(b) => b.to_vec(),
            None => vec![0; len],
        }
    }

    fn dmem_write(&mut self, base: usize, off: u32, bytes: &[u8]) {
        let off = off as usize;
        if let Some(dst) = self.falcon(base).dmem.get_mut(off..off + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }

    fn start_falcon(&mut self, base: usize) {
        self.falcon(base).started = true;

        if base != self.rtos.base || self.acr_hang {
            return;
        }

        let status = self.acr_status;
        self.set(base + regs::NV_PFALCON_FALCON_MAILBOX0::OFFSET, status);
        if !self.acr_halts {
            return;
        }

        // The HS ucode halts once it has reported.
        let halted = regs::NV_PFALCON_FALCON_CPUCTL::default().set_halted(true);
        self.or(base + regs::NV_PFALCON_FALCON_CPUCTL::OFFSET, halted.raw());
        if status == 0 {
            self.post_init_msg();
        }
    }

    fn reset_rtos(&mut self) {
        let r = self.rtos;

        self.rtos_ready = false;
        for off in [r.cmdq_head, r.cmdq_tail, r.msgq_head, r.msgq_tail] {
            self.set(off, 0);
        }
    }

    fn post_init_msg(&mut self) {
        let r = self.rtos;
        let size = size_of::<InitMsg>() as u32;
        let msg = InitMsg {
            hdr: QueueHeader {
                unit_id: UNIT_INIT,
                size: size as u8,
                ctrl_flags: 0,
                seq_id: 0,
            },
            msg_type: 0,
            num_queues: 2,
            pad: 0,
            queues: [
                InitMsgQueue {
                    offset: RTOS_CMDQ_OFFSET,
                    size: RTOS_QUEUE_SIZE as u16,
                    index: 0,
                    id: CMDQ_ID,
                },
                InitMsgQueue {
                    offset: RTOS_MSGQ_OFFSET,
                    size: RTOS_QUEUE_SIZE as u16,
                    index: 0,
                    id: MSGQ_ID,
                },
            ],
        };

        self.dmem_write(r.base, RTOS_MSGQ_OFFSET, msg.as_bytes());
        self.set(r.msgq_tail, RTOS_MSGQ_OFFSET);
        self.set(r.msgq_head, RTOS_MSGQ_OFFSET + align4(size));
        self.set(r.cmdq_head, RTOS_CMDQ_OFFSET);
        self.set(r.cmdq_tail, RTOS_CMDQ_OFFSET);
        self.rtos_ready = true;
    }

    /// Consumes the commands between the command queue tail and `head`.
    fn process_cmdq(&mut self, head: u32) {
        let r = self.rtos;
        let end = RTOS_CMDQ_OFFSET + RTOS_QUEUE_SIZE;
        let mut tail = self.reg(r.cmdq_tail);

        for _ in 0..RTOS_QUEUE_SIZE / QUEUE_HEADER_SIZE {
            if tail == head {
                break;
            }
            if tail + QUEUE_HEADER_SIZE > end {
                tail = RTOS_CMDQ_OFFSET;
                continue;
            }

            let raw = self.dmem_read(r.base, tail, QUEUE_HEADER_SIZE as usize);
            let Ok(hdr) = frombytes_at::<QueueHeader>(&raw, 0) else {
                break;
            };
            if hdr.unit_id == UNIT_REWIND {
                tail = RTOS_CMDQ_OFFSET;
                continue;
            }
            let size = u32::from(hdr.size);
            if size < QUEUE_HEADER_SIZE {
                break;
            }

            let payload = self.dmem_read(
                r.base,
                tail + QUEUE_HEADER_SIZE,
                (size - QUEUE_HEADER_SIZE) as usize,
            );
            tail += align4(size);

            if hdr.unit_id == UNIT_ACR {
                self.acr_command(hdr.seq_id, &payload);
            }
        }

        self.set(r.cmdq_tail, head);
    }

    fn acr_command(&mut self, seq_id: u8, payload: &[u8]) {
        self.acr_commands += 1;

        let Some(&cmd_type) = payload.first() else {
            return;
        };
        let Some(arg) = payload
            .get(8..12)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        else {
            return;
        };

        let pascal = self.chipset.arch() == Architecture::Pascal;
        let ids: Vec<FalconId> = match cmd_type {
            ACR_CMD_BOOTSTRAP_MULTIPLE if pascal => (0..32u32)
                .filter(|bit| arg & (1 << bit) != 0)
                .filter_map(|bit| FalconId::try_from(bit).ok())
                .collect(),
            ACR_CMD_BOOTSTRAP_FALCON if pascal => FalconId::try_from(arg).into_iter().collect(),
            0 if !pascal => FalconId::try_from(arg).into_iter().collect(),
            _ => Vec::new(),
        };

        for id in ids {
            if id == FalconId::Fecs {
                self.set(
                    regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::offset(0),
                    fecs::MAILBOX0_READY,
                );
            }
            self.bootstrapped.push(id);
        }

        let hdr = QueueHeader {
            unit_id: UNIT_ACR,
            size: 12,
            ctrl_flags: 0,
            seq_id,
        };
        let mut reply = hdr.as_bytes().to_vec();
        reply.extend_from_slice(&[cmd_type, 0, 0, 0]);
        reply.extend_from_slice(&arg.to_le_bytes());
        self.post_msg(&reply);
    }

    fn post_msg(&mut self, msg: &[u8]) {
        let r = self.rtos;
        let size = align4(msg.len() as u32);
        let end = RTOS_MSGQ_OFFSET + RTOS_QUEUE_SIZE;
        let mut head = self.reg(r.msgq_head);

        if head + size > end {
            if end - head >= QUEUE_HEADER_SIZE {
                let rewind = QueueHeader {
                    unit_id: UNIT_REWIND,
                    size: QUEUE_HEADER_SIZE as u8,
                    ..Default::default()
                };
                self.dmem_write(r.base, head, rewind.as_bytes());
            }
            head = RTOS_MSGQ_OFFSET;
        }

        self.dmem_write(r.base, head, msg);
        self.set(r.msgq_head, head + size);
    }

    fn fecs_method(&mut self, addr: u32) {
        self.fecs_methods.push(addr);
        if self.fecs_hang {
            return;
        }

        let data = self.reg(regs::NV_PGRAPH_PRI_FECS_METHOD_DATA::OFFSET);
        let reply = match addr {
            fecs::METHOD_DISCOVER_IMAGE_SIZE => self.fecs_size(addr, GOLDEN_SIZE as u32),
            fecs::METHOD_DISCOVER_ZCULL_IMAGE_SIZE => self.fecs_size(addr, ZCULL_SIZE as u32),
            fecs::METHOD_DISCOVER_PM_IMAGE_SIZE => self.fecs_size(addr, PM_SIZE as u32),
            fecs::METHOD_DISCOVER_PREEMPTION_IMAGE_SIZE => self.fecs_size(addr, PREEMPT_SIZE),
            fecs::METHOD_BIND_POINTER => {
                self.set(regs::NV_PGRAPH_PRI_FECS_CURRENT_CTX::OFFSET, data);
                // Bind done.
                0x10
            }
            fecs::METHOD_WFI_GOLDEN_SAVE | fecs::METHOD_SET_WATCHDOG_TIMEOUT => 1,
            _ => return,
        };

        self.set(regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::offset(0), reply);
    }

    fn fecs_size(&self, addr: u32, default: u32) -> u32 {
        self.fecs_sizes.get(&addr).copied().unwrap_or(default)
    }
}

struct SimState {
    inner: Mutex<SimInner>,
}

impl MmioBackend for SimState {
    fn read32(&self, offset: usize) -> u32 {
        error::lock(&self.inner).read(offset)
    }

    fn write32(&self, value: u32, offset: usize) {
        error::lock(&self.inner).write(offset, value);
    }
}

/// Tracks the semaphore methods of a pushbuffer.
#[derive(Default)]
struct SemaMethods {
    addr_lo: u32,
    addr_hi: u32,
    payload: u32,
}

pub(crate) struct Sim {
    state: Arc<SimState>,
}

impl Sim {
    pub(crate) fn new(chipset: Chipset) -> Self {
        Self {
            state: Arc::new(SimState {
                inner: Mutex::new(SimInner::new(chipset)),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        error::lock(&self.state.inner)
    }

    pub(crate) fn bar(&self) -> Bar0 {
        Bar0::new(self.state.clone())
    }

    /// Sets a register without side effects.
    pub(crate) fn poke(&self, off: usize, value: u32) {
        self.lock().set(off, value);
    }

    /// Reads a register as the CPU would, without counting as an access.
    pub(crate) fn peek(&self, off: usize) -> u32 {
        self.lock().read(off)
    }

    /// Number of register writes so far.
    pub(crate) fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub(crate) fn acr_bootstrapped(&self) -> Vec<FalconId> {
        self.lock().bootstrapped.clone()
    }

    pub(crate) fn acr_commands(&self) -> usize {
        self.lock().acr_commands
    }

    /// Makes the HS ACR never report completion.
    pub(crate) fn set_acr_hang(&self, hang: bool) {
        self.lock().acr_hang = hang;
    }

    /// Whether the HS ACR falcon halts after reporting.
    pub(crate) fn set_acr_halts(&self, halts: bool) {
        self.lock().acr_halts = halts;
    }

    /// Makes preempt requests never complete.
    pub(crate) fn set_preempt_hang(&self, hang: bool) {
        self.lock().preempt_hang = hang;
    }

    /// Status the HS ACR leaves in MAILBOX0.
    pub(crate) fn set_acr_status(&self, status: u32) {
        self.lock().acr_status = status;
    }

    pub(crate) fn falcon_imem(&self, base: usize) -> Vec<u32> {
        self.lock().falcon(base).imem.clone()
    }

    pub(crate) fn falcon_imem_tags(&self, base: usize) -> Vec<u32> {
        self.lock().falcon(base).tags.clone()
    }

    pub(crate) fn falcon_started(&self, base: usize) -> bool {
        self.lock().falcons.get(&base).is_some_and(|f| f.started)
    }

    pub(crate) fn set_fecs_hang(&self, hang: bool) {
        self.lock().fecs_hang = hang;
    }

    /// Overrides the value the FECS answers to `method` with.
    pub(crate) fn set_fecs_size(&self, method: u32, value: u32) {
        self.lock().fecs_sizes.insert(method, value);
    }

    pub(crate) fn inject_gr_intr(&self, bits: u32, ch: Option<&Arc<Channel>>) {
        let mut s = self.lock();
        s.or(regs::NV_PGRAPH_INTR::OFFSET, bits);

        if let Some(ch) = ch {
            let ctx = regs::NV_PGRAPH_PRI_FECS_CURRENT_CTX::default()
                .set_ptr((ch.inst().addr() >> 12) as u32)
                .set_valid(true);
            s.set(regs::NV_PGRAPH_PRI_FECS_CURRENT_CTX::OFFSET, ctx.raw());
        }
    }

    /// Raises `bits` on PBDMA `pbdma`, optionally loaded with TSG `tsg`.
    pub(crate) fn inject_pbdma_intr(&self, pbdma: usize, bits: u32, tsg: Option<u32>) {
        let mut s = self.lock();
        s.or(regs::NV_PPBDMA_INTR_0::offset(pbdma), bits);
        s.or(
            regs::NV_PFIFO_INTR_0::OFFSET,
            regs::NV_PFIFO_INTR_0::default().set_pbdma_intr(true).raw(),
        );

        let status = tsg.map_or(0, |id| {
            regs::NV_PFIFO_PBDMA_STATUS::default()
                .set_id(id)
                .set_id_type(true)
                .set_chan_status(1)
                .raw()
        });
        s.set(regs::NV_PFIFO_PBDMA_STATUS::offset(pbdma), status);
    }

    pub(crate) fn inject_ce_intr(&self, inst_id: u32, bits: u32) {
        self.lock()
            .or(regs::NV_PCE_INTR_STATUS::offset(inst_id as usize), bits);
    }

    /// Latches an MMU fault in the hub snapshot registers. Pascal reports faults through FIFO.
    pub(crate) fn inject_hub_fault(&self, addr: u64, inst: u64, engine_id: u32, replayable: bool) {
        let mut s = self.lock();
        if s.chipset.arch() == Architecture::Pascal {
            return;
        }

        s.set(regs::NV_PFB_MMU_FAULT_ADDR_LO::OFFSET, lo32(addr) & !0xfff);
        s.set(regs::NV_PFB_MMU_FAULT_ADDR_HI::OFFSET, hi32(addr));
        s.set(
            regs::NV_PFB_MMU_FAULT_INST_LO::OFFSET,
            (lo32(inst) & !0xfff) | (engine_id & 0x1ff),
        );
        s.set(regs::NV_PFB_MMU_FAULT_INST_HI::OFFSET, hi32(inst));
        s.set(
            regs::NV_PFB_MMU_FAULT_INFO::OFFSET,
            regs::NV_PFB_MMU_FAULT_INFO::default()
                .set_valid(true)
                .set_replayable(replayable)
                .raw(),
        );

        let niso = regs::NV_PFB_NISO_INTR::default();
        let niso = if replayable {
            niso.set_mmu_replayable_fault(true)
        } else {
            niso.set_mmu_nonreplayable_fault(true)
        };
        s.or(regs::NV_PFB_NISO_INTR::OFFSET, niso.raw());
    }

    /// FECS methods submitted so far, oldest first.
    pub(crate) fn fecs_methods(&self) -> Vec<u32> {
        self.lock().fecs_methods.clone()
    }

    /// PBDMAs held in reset so far, oldest first.
    pub(crate) fn pbdma_resets(&self) -> Vec<u32> {
        self.lock().pbdma_resets.clone()
    }

    /// TSGs preempted so far, oldest first.
    pub(crate) fn preempted_tsgs(&self) -> Vec<u32> {
        self.lock().preempted.clone()
    }

    /// Work submit tokens rung so far, oldest first.
    pub(crate) fn doorbells(&self) -> Vec<u32> {
        self.lock().doorbells.clone()
    }

    /// Shows TSG `tsgid` as loaded and busy on engine `engine_id`.
    pub(crate) fn set_engine_running(&self, engine_id: u32, tsgid: u32) {
        let status = regs::NV_PFIFO_ENGINE_STATUS::default()
            .set_id(tsgid)
            .set_id_type(true)
            .set_ctx_status(1)
            .set_busy(true);
        self.lock().set(
            regs::NV_PFIFO_ENGINE_STATUS::offset(engine_id as usize),
            status.raw(),
        );
    }

    /// Executes the GPFIFO entries of `ch` between GET and PUT.
    ///
    /// Only semaphore releases have an effect; every other method is ignored.
    pub(crate) fn run_channel(&self, ch: &Channel) {
        let (gpfifo, _, num) = ch.gpfifo();
        let (userd, off) = ch.userd();
        let vm = ch.vm();
        let put = userd.rd32(off + fifo::USERD_GP_PUT);
        let mut get = userd.rd32(off + fifo::USERD_GP_GET);
        let pascal = self.lock().chipset.arch() == Architecture::Pascal;
        let mut sema = SemaMethods::default();

        for _ in 0..num {
            if get == put {
                break;
            }

            let entry = get as usize * 8;
            let w0 = gpfifo.rd32(entry);
            let w1 = gpfifo.rd32(entry + 4);
            let va = u64::from(w0 & !3) | (u64::from(w1 & 0xff) << 32);
            let words = (w1 >> 10) as usize;

            if let Some((pb, pb_off)) = vm.lookup(va) {
                let avail = pb.size().saturating_sub(pb_off) / 4;
                let data: Vec<u32> = (0..words.min(avail))
                    .map(|i| pb.rd32(pb_off + i * 4))
                    .collect();
                exec_pushbuffer(vm, &data, pascal, &mut sema);
            }

            get = (get + 1) % num;
        }

        userd.wr32(off + fifo::USERD_GP_GET, get);
        ch.gpu().sema_sea.wake_all();
    }
}

fn exec_pushbuffer(vm: &Vm, words: &[u32], pascal: bool, sema: &mut SemaMethods) {
    let mut i = 0;

    while i < words.len() {
        let hdr = words[i];
        i += 1;

        let count = ((hdr >> 16) & 0x1fff) as usize;
        let method = hdr & 0xfff;
        let incr = match hdr >> 29 {
            1 => true,
            3 => false,
            _ => continue,
        };

        for (k, &data) in words[i..].iter().take(count).enumerate() {
            let m = if incr { method + k as u32 } else { method };
            host_method(vm, m, data, pascal, sema);
        }
        i += count;
    }
}

fn host_method(vm: &Vm, method: u32, data: u32, pascal: bool, sema: &mut SemaMethods) {
    let release = match (pascal, method) {
        (true, 0x4) => {
            sema.addr_hi = data & 0xff;
            false
        }
        (true, 0x5) => {
            sema.addr_lo = data;
            false
        }
        (true, 0x6) => {
            sema.payload = data;
            false
        }
        (true, 0x7) => data & 7 == 2,
        (false, 0x17) => {
            sema.addr_lo = data;
            false
        }
        (false, 0x18) => {
            sema.addr_hi = data;
            false
        }
        (false, 0x19) => {
            sema.payload = data;
            false
        }
        (false, 0x1b) => data & 7 == 1,
        _ => false,
    };

    if release {
        let addr = (u64::from(sema.addr_hi) << 32) | u64::from(sema.addr_lo);
        if let Some((mem, off)) = vm.lookup(addr) {
            mem.wr32(off, sema.payload);
        }
    }
}

/// Serves the test firmware images, optionally missing one file.
#[derive(Default)]
pub(crate) struct TestFirmware {
    missing: Option<String>,
}

impl TestFirmware {
    pub(crate) fn without(file: &str) -> Self {
        Self {
            missing: Some(file.to_string()),
        }
    }
}

impl FirmwareLoader for TestFirmware {
    fn request(&self, path: &str) -> Result<Vec<u8>> {
        let file = path.rsplit('/').next().unwrap_or(path);
        if self.missing.as_deref() == Some(file) {
            return Err(EINVAL);
        }
        if file == "ucode_load.bin" {
            return Ok(test_images::acr_ucode());
        }

        let ls_id = |name: &str| {
            LS_FALCONS
                .iter()
                .copied()
                .find(|&id| firmware::ls_name(id) == name)
        };
        if let Some(id) = file.strip_suffix("_sig.bin").and_then(ls_id) {
            return Ok(test_images::ls_sig(id));
        }
        if file.strip_suffix(".bin").and_then(ls_id).is_some() {
            return Ok(test_images::ls_image(1));
        }

        Err(EINVAL)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SyncptSim {
    min: u32,
    max: u32,
    hw: u32,
}

/// Host1x syncpoints whose hardware value only moves when a test says so.
#[derive(Default)]
pub(crate) struct TestHost1x {
    syncpts: Mutex<HashMap<u32, SyncptSim>>,
    next_id: AtomicU32,
}

impl TestHost1x {
    pub(crate) fn set_hw_value(&self, id: u32, value: u32) {
        error::lock(&self.syncpts).entry(id).or_default().hw = value;
    }

    fn with<T>(&self, id: u32, f: impl FnOnce(&mut SyncptSim) -> T) -> T {
        f(error::lock(&self.syncpts).entry(id).or_default())
    }
}

impl Host1x for TestHost1x {
    fn alloc_syncpt(&self, _name: &str) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        error::lock(&self.syncpts).insert(id, SyncptSim::default());
        Ok(id)
    }

    fn free_syncpt(&self, id: u32) {
        error::lock(&self.syncpts).remove(&id);
    }

    fn read_max(&self, id: u32) -> u32 {
        self.with(id, |s| s.max)
    }

    fn incr_max(&self, id: u32, n: u32) -> u32 {
        self.with(id, |s| {
            s.max = s.max.wrapping_add(n);
            s.max
        })
    }

    fn read_min(&self, id: u32) -> u32 {
        self.with(id, |s| s.min)
    }

    fn update_min(&self, id: u32) -> u32 {
        self.with(id, |s| {
            s.min = s.hw;
            s.min
        })
    }

    fn wait(&self, id: u32, thresh: u32, timeout: Duration) -> Result {
        util::read_poll_timeout(
            || Ok(self.with(id, |s| s.hw)),
            |hw| *hw >= thresh,
            Duration::from_micros(10),
            timeout,
        )
        .map(|_| ())
        .map_err(|_| ETIMEDOUT)
    }

    fn set_min_eq_max(&self, id: u32) {
        self.with(id, |s| {
            s.hw = s.max;
            s.min = s.max;
        })
    }

    fn aperture(&self) -> (u64, usize) {
        (0x6000_0000, 0x1000)
    }
}

/// An OS fence that records the descriptors it was installed at.
#[derive(Default)]
pub(crate) struct TestOsFence {
    installed: Mutex<Vec<i32>>,
}

impl TestOsFence {
    pub(crate) fn installed(&self) -> Vec<i32> {
        error::lock(&self.installed).clone()
    }
}

impl OsFence for TestOsFence {
    fn install(&self, fd: i32) -> Result {
        error::lock(&self.installed).push(fd);
        Ok(())
    }
}

/// Sync files backed by a descriptor table the test fills in.
#[derive(Default)]
pub(crate) struct TestSyncFile {
    files: Mutex<HashMap<i32, Vec<Arc<Fence>>>>,
}

impl TestSyncFile {
    pub(crate) fn insert(&self, fd: i32, fences: Vec<Arc<Fence>>) {
        error::lock(&self.files).insert(fd, fences);
    }
}

impl SyncFileOps for TestSyncFile {
    fn lookup(&self, fd: i32) -> Result<Vec<Arc<Fence>>> {
        error::lock(&self.files).get(&fd).cloned().ok_or(EINVAL)
    }

    fn create(&self, _fence: &Arc<Fence>) -> Result<Arc<dyn OsFence>> {
        Ok(Arc::new(TestOsFence::default()))
    }
}

pub(crate) fn platform() -> Platform {
    Platform {
        firmware: Arc::new(TestFirmware::default()),
        host1x: Some(Arc::new(TestHost1x::default())),
        sync_file: None,
        power_gating: None,
        iommu: false,
    }
}

pub(crate) fn probe(chipset: Chipset, config: GpuConfig, platform: Platform) -> (Sim, Arc<Gpu>) {
    let sim = Sim::new(chipset);
    let gpu = Gpu::probe(sim.bar(), platform, config).unwrap();
    (sim, gpu)
}

/// A probed and initialized GPU on a fresh model.
pub(crate) fn test_gpu(chipset: Chipset) -> (Sim, Arc<Gpu>) {
    let (sim, gpu) = probe(chipset, GpuConfig::default(), platform());
    gpu.init().unwrap();
    (sim, gpu)
}
