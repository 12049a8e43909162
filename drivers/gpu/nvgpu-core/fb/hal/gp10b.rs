// SPDX-License-Identifier: GPL-2.0

use crate::{
    error::{code::EINVAL, Result},
    fb::{hal::FbHal, MmuFaultInfo},
    io::Bar0,
    regs,
};

struct Gp10b;

/// Shift applied to the sysmem address before it is written into `NV_PFB_NISO_FLUSH_SYSMEM_ADDR`.
pub(super) const FLUSH_SYSMEM_ADDR_SHIFT: u32 = 8;

pub(super) fn read_sysmem_flush_page_gp10b(bar: &Bar0) -> u64 {
    u64::from(regs::NV_PFB_NISO_FLUSH_SYSMEM_ADDR::read(bar).adr_39_08()) << FLUSH_SYSMEM_ADDR_SHIFT
}

pub(super) fn write_sysmem_flush_page_gp10b(bar: &Bar0, addr: u64) -> Result {
    // Check that the address doesn't overflow the receiving 32-bit register.
    if addr >> (u32::BITS + FLUSH_SYSMEM_ADDR_SHIFT) != 0 {
        return Err(EINVAL);
    }

    regs::NV_PFB_NISO_FLUSH_SYSMEM_ADDR::default()
        // CAST: the upper bits were checked to be zero above.
        .set_adr_39_08((addr >> FLUSH_SYSMEM_ADDR_SHIFT) as u32)
        .write(bar);

    Ok(())
}

impl FbHal for Gp10b {
    fn read_sysmem_flush_page(&self, bar: &Bar0) -> u64 {
        read_sysmem_flush_page_gp10b(bar)
    }

    fn write_sysmem_flush_page(&self, bar: &Bar0, addr: u64) -> Result {
        write_sysmem_flush_page_gp10b(bar, addr)
    }

    /// MMU faults are reported through the FIFO on Pascal.
    fn take_mmu_fault(&self, _bar: &Bar0) -> Option<MmuFaultInfo> {
        None
    }
}

const GP10B: Gp10b = Gp10b;
pub(super) const GP10B_HAL: &dyn FbHal = &GP10B;
