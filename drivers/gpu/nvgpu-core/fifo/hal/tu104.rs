// SPDX-License-Identifier: GPL-2.0

use std::time::Duration;

use crate::{
    error::Result,
    fb::MmuFaultInfo,
    fifo::{hal::FifoHal, runlist::RunlistFormat},
    io::Bar0,
    regs,
    util::{self, hi32, lo32},
};

use super::gp10b::intr_0_error_mask_gp10b;
use super::gv11b::{ring_doorbell_gv11b, GV11B_RUNLIST};

struct Tu104;

impl FifoHal for Tu104 {
    fn runlist_format(&self) -> &'static dyn RunlistFormat {
        &GV11B_RUNLIST
    }

    /// Each runlist has its own submit registers.
    fn runlist_submit(&self, bar: &Bar0, runlist_id: u32, addr: u64, target: u32, count: u32) {
        let idx = runlist_id as usize;

        regs::NV_PFIFO_RUNLIST_BASE_LO_TU104::default()
            .set_ptr_lo(lo32(addr) >> 12)
            .set_target(target as u8)
            .write(bar, idx);
        regs::NV_PFIFO_RUNLIST_BASE_HI_TU104::default()
            .set_ptr_hi(hi32(addr))
            .write(bar, idx);
        regs::NV_PFIFO_RUNLIST_SUBMIT_TU104::default()
            .set_length(count)
            .write(bar, idx);
    }

    fn runlist_wait_pending(&self, bar: &Bar0, runlist_id: u32, timeout: Duration) -> Result {
        util::read_poll_timeout(
            || regs::NV_PFIFO_RUNLIST_SUBMIT_INFO_TU104::try_read(bar, runlist_id as usize),
            |r| !r.pending(),
            Duration::from_micros(2),
            timeout,
        )
        .map(|_| ())
    }

    fn ring_doorbell(&self, bar: &Bar0, chid: u32) {
        ring_doorbell_gv11b(bar, chid)
    }

    fn take_mmu_fault(&self, _bar: &Bar0) -> Option<MmuFaultInfo> {
        None
    }

    fn intr_0_error_mask(&self) -> u32 {
        intr_0_error_mask_gp10b()
    }
}

const TU104: Tu104 = Tu104;
pub(super) const TU104_HAL: &dyn FifoHal = &TU104;
