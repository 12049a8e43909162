// SPDX-License-Identifier: GPL-2.0

use crate::{
    error::Result,
    fb::{hal::FbHal, MmuFaultInfo},
    io::Bar0,
    regs,
};

use super::gp10b::{read_sysmem_flush_page_gp10b, write_sysmem_flush_page_gp10b};

struct Gv11b;

fn read_mmu_fault_gv11b(bar: &Bar0) -> Option<MmuFaultInfo> {
    let info = regs::NV_PFB_MMU_FAULT_INFO::read(bar);
    if !info.valid() {
        return None;
    }

    let addr_lo = regs::NV_PFB_MMU_FAULT_ADDR_LO::read(bar);
    let addr_hi = regs::NV_PFB_MMU_FAULT_ADDR_HI::read(bar);
    let inst_lo = regs::NV_PFB_MMU_FAULT_INST_LO::read(bar);
    let inst_hi = regs::NV_PFB_MMU_FAULT_INST_HI::read(bar);

    Some(MmuFaultInfo {
        fault_type: info.fault_type(),
        access_type: info.access_type(),
        client: info.client(),
        client_type: info.client_type(),
        gpc_id: info.gpc_id(),
        addr: (u64::from(addr_hi.addr_hi()) << 32) | (u64::from(addr_lo.addr_lo()) << 12),
        inst_addr: (u64::from(inst_hi.addr_hi()) << 32) | (u64::from(inst_lo.addr_lo()) << 12),
        inst_aperture: inst_lo.aperture(),
        engine_id: inst_lo.engine_id(),
        replayable: info.replayable(),
        chid: None,
        tsgid: None,
    })
}

impl FbHal for Gv11b {
    fn read_sysmem_flush_page(&self, bar: &Bar0) -> u64 {
        read_sysmem_flush_page_gp10b(bar)
    }

    fn write_sysmem_flush_page(&self, bar: &Bar0, addr: u64) -> Result {
        write_sysmem_flush_page_gp10b(bar, addr)
    }

    fn take_mmu_fault(&self, bar: &Bar0) -> Option<MmuFaultInfo> {
        let intr = regs::NV_PFB_NISO_INTR::read(bar);
        if !(intr.mmu_nonreplayable_fault() || intr.mmu_replayable_fault() || intr.mmu_other_fault())
        {
            return None;
        }

        let fault = read_mmu_fault_gv11b(bar);

        regs::NV_PFB_MMU_FAULT_STATUS::default()
            .set_valid(true)
            .write(bar);
        // Write-1-to-clear.
        intr.write(bar);

        fault
    }
}

const GV11B: Gv11b = Gv11b;
pub(super) const GV11B_HAL: &dyn FbHal = &GV11B;
