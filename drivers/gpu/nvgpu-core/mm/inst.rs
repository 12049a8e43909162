// SPDX-License-Identifier: GPL-2.0

//! Channel instance blocks.
//!
//! An instance block is the page the scheduler loads when it switches to a channel. Its first
//! bytes are the RAMFC, the saved PBDMA state; the rest points at the address space and at the
//! engine contexts.

use std::sync::Arc;

use crate::dma::{aperture_mask_raw, Aperture, DmaAllocator, DmaObject, PAGE_SIZE};
use crate::error::Result;
use crate::mm::gmmu::BIG_PAGE_SIZE_64K;
use crate::mm::vm::Vm;
use crate::util::{hi32, lo32};

// RAMFC.
pub(crate) const RAMFC_USERD: usize = 0x08;
pub(crate) const RAMFC_USERD_HI: usize = 0x0c;
pub(crate) const RAMFC_SIGNATURE: usize = 0x10;
pub(crate) const RAMFC_ACQUIRE: usize = 0x30;
pub(crate) const RAMFC_GP_BASE: usize = 0x48;
pub(crate) const RAMFC_GP_BASE_HI: usize = 0x4c;
pub(crate) const RAMFC_PB_HEADER: usize = 0x84;
pub(crate) const RAMFC_SUBDEVICE: usize = 0x94;
pub(crate) const RAMFC_CHID: usize = 0xe8;
pub(crate) const RAMFC_SET_CHANNEL_INFO: usize = 0xec;

pub(crate) const RAMFC_SIGNATURE_VALUE: u32 = 0x0000_face;
const GP_BASE_HI_LIMIT2_SHIFT: u32 = 16;

// Address space.
pub(crate) const PAGE_DIR_BASE_LO: usize = 0x200;
pub(crate) const PAGE_DIR_BASE_HI: usize = 0x204;
const PDB_VOL: u32 = 1 << 2;
const PDB_USE_VER2_PT_FORMAT: u32 = 1 << 10;
const PDB_BIG_PAGE_SIZE_64K: u32 = 1 << 11;
const PDB_REPLAYABLE_FAULT_TEX: u32 = 1 << 4;
const PDB_REPLAYABLE_FAULT_GCC: u32 = 1 << 5;

// Engine context.
pub(crate) const ENGINE_WFI_LO: usize = 0x210;
pub(crate) const ENGINE_WFI_HI: usize = 0x214;
const ENGINE_WFI_MODE_VIRTUAL: u32 = 1 << 2;

// Subcontexts.
pub(crate) const SC_PDB_VALID: usize = 0x298;
pub(crate) const SC_PAGE_DIR_BASE: usize = 0x2a0;
pub(crate) const SC_PAGE_DIR_BASE_STRIDE: usize = 16;
/// Number of subcontext page directory slots.
pub(crate) const SC_PAGE_DIR_BASE_COUNT: usize = 64;

pub(crate) const INST_BLOCK_SIZE: usize = PAGE_SIZE;

/// Instance block of a channel.
#[derive(Debug, Clone)]
pub(crate) struct InstBlock {
    mem: Arc<DmaObject>,
}

fn pdb_words(vm: &Vm, honors_aperture: bool, extra: u32) -> (u32, u32) {
    let addr = vm.pdb_addr();
    let target = aperture_mask_raw(honors_aperture, vm.pdb_aperture(), 3, 2, 0);
    let vol = if vm.pdb_aperture().is_sysmem() { PDB_VOL } else { 0 };
    let big = if u64::from(vm.big_page_size()) == BIG_PAGE_SIZE_64K {
        PDB_BIG_PAGE_SIZE_64K
    } else {
        0
    };

    (
        (lo32(addr) & !0xfff) | target | vol | PDB_USE_VER2_PT_FORMAT | big | extra,
        hi32(addr),
    )
}

impl InstBlock {
    pub(crate) fn alloc(dma: &DmaAllocator, aperture: Aperture) -> Result<Self> {
        Ok(Self {
            mem: dma.alloc(INST_BLOCK_SIZE, aperture)?,
        })
    }

    pub(crate) fn mem(&self) -> &Arc<DmaObject> {
        &self.mem
    }

    pub(crate) fn addr(&self) -> u64 {
        self.mem.addr()
    }

    pub(crate) fn aperture(&self) -> Aperture {
        self.mem.aperture()
    }

    pub(crate) fn rd32(&self, offset: usize) -> u32 {
        self.mem.rd32(offset)
    }

    pub(crate) fn wr32(&self, offset: usize, value: u32) {
        self.mem.wr32(offset, value)
    }

    /// Points the instance block at the page directory of `vm`.
    pub(crate) fn init_pdb(&self, vm: &Vm, honors_aperture: bool) {
        let (lo, hi) = pdb_words(vm, honors_aperture, 0);
        self.wr32(PAGE_DIR_BASE_LO, lo);
        self.wr32(PAGE_DIR_BASE_HI, hi);
    }

    pub(crate) fn pdb_addr(&self) -> u64 {
        (u64::from(self.rd32(PAGE_DIR_BASE_HI)) << 32)
            | u64::from(self.rd32(PAGE_DIR_BASE_LO) & !0xfff)
    }

    /// Writes `vm`'s page directory into every subcontext slot and marks them all valid.
    pub(crate) fn init_subctx_pdbs(&self, vm: &Vm, honors_aperture: bool, replayable: bool) {
        let extra = if replayable {
            PDB_REPLAYABLE_FAULT_TEX | PDB_REPLAYABLE_FAULT_GCC
        } else {
            0
        };
        let (lo, hi) = pdb_words(vm, honors_aperture, extra);

        for slot in 0..SC_PAGE_DIR_BASE_COUNT {
            let off = SC_PAGE_DIR_BASE + slot * SC_PAGE_DIR_BASE_STRIDE;
            self.wr32(off, lo);
            self.wr32(off + 4, hi);
        }
        for word in 0..SC_PAGE_DIR_BASE_COUNT / 32 {
            self.wr32(SC_PDB_VALID + word * 4, u32::MAX);
        }
    }

    /// Points the engine context of the channel at `gpu_va`.
    pub(crate) fn set_engine_ctx(&self, gpu_va: u64) {
        self.wr32(ENGINE_WFI_LO, (lo32(gpu_va) & !0xfff) | ENGINE_WFI_MODE_VIRTUAL);
        self.wr32(ENGINE_WFI_HI, hi32(gpu_va));
    }

    pub(crate) fn engine_ctx(&self) -> u64 {
        (u64::from(self.rd32(ENGINE_WFI_HI)) << 32) | u64::from(self.rd32(ENGINE_WFI_LO) & !0xfff)
    }

    /// Fills the RAMFC so that the PBDMA fetches from the GPFIFO ring at `gpfifo_va`.
    pub(crate) fn setup_ramfc(
        &self,
        chid: u32,
        gpfifo_va: u64,
        gpfifo_entries: u32,
        userd: (u64, u32),
        acquire_timeout: u32,
    ) -> Result {
        let (userd_addr, userd_target) = userd;

        self.mem.memset(0, 0, 0x200)?;
        self.wr32(RAMFC_GP_BASE, lo32(gpfifo_va));
        self.wr32(
            RAMFC_GP_BASE_HI,
            (hi32(gpfifo_va) & 0xff)
                | (gpfifo_entries.max(1).trailing_zeros() << GP_BASE_HI_LIMIT2_SHIFT),
        );
        self.wr32(RAMFC_SIGNATURE, RAMFC_SIGNATURE_VALUE);
        self.wr32(RAMFC_PB_HEADER, 0x2040_0000);
        self.wr32(RAMFC_SUBDEVICE, 0x3000_0fff);
        self.wr32(RAMFC_ACQUIRE, acquire_timeout);
        self.wr32(RAMFC_USERD, (lo32(userd_addr) & !0x1ff) | userd_target);
        self.wr32(RAMFC_USERD_HI, hi32(userd_addr));
        self.wr32(RAMFC_CHID, chid & 0xfff);

        Ok(())
    }

    /// Records the subcontext the channel runs in.
    pub(crate) fn set_channel_info(&self, veid: u32) {
        self.wr32(RAMFC_SET_CHANNEL_INFO, (veid & 0x3f) << 8);
    }

    /// GPFIFO ring address and number of entries recorded in the RAMFC.
    pub(crate) fn gpfifo(&self) -> (u64, u32) {
        let hi = self.rd32(RAMFC_GP_BASE_HI);
        let va = (u64::from(hi & 0xff) << 32) | u64::from(self.rd32(RAMFC_GP_BASE));
        (va, 1 << ((hi >> GP_BASE_HI_LIMIT2_SHIFT) & 0x1f))
    }
}
