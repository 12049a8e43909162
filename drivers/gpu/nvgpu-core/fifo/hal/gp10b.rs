// SPDX-License-Identifier: GPL-2.0

use std::time::Duration;

use crate::{
    error::Result,
    fb::MmuFaultInfo,
    fifo::{
        hal::FifoHal,
        runlist::{encode_timeslice, RunlistChannel, RunlistEntry, RunlistFormat},
    },
    io::Bar0,
    regs, util,
};

struct Gp10b;

/// Runlist entries of 8 bytes. Channel entries only carry the channel id, the instance block is
/// taken from the channel's PCCSR.
struct Gp10bRunlist;

const RL_ENTRY_ID_MASK: u32 = 0xfff;
const RL_ENTRY_TYPE_TSG: u32 = 1 << 13;
const RL_ENTRY_TIMESLICE_SCALE_SHIFT: u32 = 14;
const RL_ENTRY_TIMESLICE_TIMEOUT_SHIFT: u32 = 18;
const RL_ENTRY_TSG_LENGTH_SHIFT: u32 = 26;
const RL_ENTRY_TSG_LENGTH_MAX: usize = 63;

impl RunlistFormat for Gp10bRunlist {
    fn entry_words(&self) -> usize {
        2
    }

    fn max_tsg_length(&self) -> usize {
        RL_ENTRY_TSG_LENGTH_MAX
    }

    fn encode_tsg(&self, tsgid: u32, timeslice: u32, length: u32, out: &mut [u32]) {
        let (timeout, scale) = encode_timeslice(timeslice);

        out[0] = (tsgid & RL_ENTRY_ID_MASK)
            | RL_ENTRY_TYPE_TSG
            | (scale << RL_ENTRY_TIMESLICE_SCALE_SHIFT)
            | (timeout << RL_ENTRY_TIMESLICE_TIMEOUT_SHIFT)
            | (length << RL_ENTRY_TSG_LENGTH_SHIFT);
        out[1] = 0;
    }

    fn encode_channel(&self, ch: &RunlistChannel, out: &mut [u32]) {
        out[0] = ch.chid & RL_ENTRY_ID_MASK;
        out[1] = 0;
    }

    fn decode(&self, entry: &[u32]) -> RunlistEntry {
        let w = entry[0];

        if w & RL_ENTRY_TYPE_TSG != 0 {
            RunlistEntry::Tsg {
                tsgid: w & RL_ENTRY_ID_MASK,
                length: w >> RL_ENTRY_TSG_LENGTH_SHIFT,
                timeout: (w >> RL_ENTRY_TIMESLICE_TIMEOUT_SHIFT) & 0xff,
                scale: (w >> RL_ENTRY_TIMESLICE_SCALE_SHIFT) & 0xf,
            }
        } else {
            RunlistEntry::Channel {
                chid: w & RL_ENTRY_ID_MASK,
                inst_addr: None,
            }
        }
    }
}

const GP10B_RUNLIST: Gp10bRunlist = Gp10bRunlist;

pub(super) fn runlist_submit_gp10b(bar: &Bar0, runlist_id: u32, addr: u64, target: u32, count: u32) {
    regs::NV_PFIFO_RUNLIST_BASE::default()
        // CAST: runlist buffers are below 1 TiB.
        .set_ptr((addr >> 12) as u32)
        .set_target(target as u8)
        .write(bar);
    regs::NV_PFIFO_RUNLIST::default()
        .set_length(count)
        .set_runlist_id(runlist_id as u8)
        .write(bar);
}

pub(super) fn runlist_wait_pending_gp10b(bar: &Bar0, runlist_id: u32, timeout: Duration) -> Result {
    util::read_poll_timeout(
        || regs::NV_PFIFO_ENG_RUNLIST::try_read(bar, runlist_id as usize),
        |r| !r.pending(),
        Duration::from_micros(2),
        timeout,
    )
    .map(|_| ())
}

pub(super) fn intr_0_error_mask_gp10b() -> u32 {
    regs::NV_PFIFO_INTR_0::default()
        .set_bind_error(true)
        .set_sched_error(true)
        .set_chsw_error(true)
        .set_fb_flush_timeout(true)
        .set_lb_error(true)
        .set_pio_error(true)
        .set_dropped_mmu_fault(true)
        .raw()
}

impl FifoHal for Gp10b {
    fn runlist_format(&self) -> &'static dyn RunlistFormat {
        &GP10B_RUNLIST
    }

    fn runlist_submit(&self, bar: &Bar0, runlist_id: u32, addr: u64, target: u32, count: u32) {
        runlist_submit_gp10b(bar, runlist_id, addr, target, count)
    }

    fn runlist_wait_pending(&self, bar: &Bar0, runlist_id: u32, timeout: Duration) -> Result {
        runlist_wait_pending_gp10b(bar, runlist_id, timeout)
    }

    fn take_mmu_fault(&self, bar: &Bar0) -> Option<MmuFaultInfo> {
        let pending = regs::NV_PFIFO_INTR_MMU_FAULT_ID::read(bar).value();
        if pending == 0 {
            return None;
        }

        let engine_id = pending.trailing_zeros();
        let idx = engine_id as usize;
        let inst = regs::NV_PFIFO_MMU_FAULT_INST::try_read(bar, idx).ok()?;
        let lo = regs::NV_PFIFO_MMU_FAULT_LO::try_read(bar, idx).ok()?;
        let hi = regs::NV_PFIFO_MMU_FAULT_HI::try_read(bar, idx).ok()?;
        let info = regs::NV_PFIFO_MMU_FAULT_INFO::try_read(bar, idx).ok()?;

        // Write-1-to-clear.
        regs::NV_PFIFO_INTR_MMU_FAULT_ID::default()
            .set_value(1 << engine_id)
            .write(bar);

        Some(MmuFaultInfo {
            fault_type: info.fault_type(),
            access_type: info.access_type(),
            client: info.client(),
            client_type: info.client_type(),
            gpc_id: info.gpc_id(),
            addr: (u64::from(hi.value()) << 32) | u64::from(lo.value()),
            inst_addr: u64::from(inst.ptr()) << 12,
            inst_aperture: inst.target(),
            engine_id,
            replayable: false,
            chid: None,
            tsgid: None,
        })
    }

    fn intr_0_error_mask(&self) -> u32 {
        intr_0_error_mask_gp10b() | regs::NV_PFIFO_INTR_0::default().set_mmu_fault(true).raw()
    }
}

const GP10B: Gp10b = Gp10b;
pub(super) const GP10B_HAL: &dyn FifoHal = &GP10B;
