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
    regs,
    util::{hi32, lo32},
};

use super::gp10b::{intr_0_error_mask_gp10b, runlist_submit_gp10b, runlist_wait_pending_gp10b};

struct Gv11b;

/// Runlist entries of 16 bytes, shared with Turing.
pub(super) struct Gv11bRunlist;

const RL_ENTRY_TYPE_TSG: u32 = 1 << 0;
const RL_ENTRY_INST_TARGET_SHIFT: u32 = 4;
const RL_ENTRY_USERD_TARGET_SHIFT: u32 = 6;
const RL_ENTRY_TIMESLICE_SCALE_SHIFT: u32 = 16;
const RL_ENTRY_TIMESLICE_TIMEOUT_SHIFT: u32 = 24;
const RL_ENTRY_ID_MASK: u32 = 0xfff;
const RL_ENTRY_TSG_LENGTH_MAX: usize = 128;

impl RunlistFormat for Gv11bRunlist {
    fn entry_words(&self) -> usize {
        4
    }

    fn max_tsg_length(&self) -> usize {
        RL_ENTRY_TSG_LENGTH_MAX
    }

    fn encode_tsg(&self, tsgid: u32, timeslice: u32, length: u32, out: &mut [u32]) {
        let (timeout, scale) = encode_timeslice(timeslice);

        out[0] = RL_ENTRY_TYPE_TSG
            | (scale << RL_ENTRY_TIMESLICE_SCALE_SHIFT)
            | (timeout << RL_ENTRY_TIMESLICE_TIMEOUT_SHIFT);
        out[1] = length & 0xff;
        out[2] = tsgid & RL_ENTRY_ID_MASK;
        out[3] = 0;
    }

    fn encode_channel(&self, ch: &RunlistChannel, out: &mut [u32]) {
        out[0] = (lo32(ch.userd_addr) & !0xff)
            | (ch.userd_target << RL_ENTRY_USERD_TARGET_SHIFT)
            | (ch.inst_target << RL_ENTRY_INST_TARGET_SHIFT);
        out[1] = hi32(ch.userd_addr);
        out[2] = (lo32(ch.inst_addr) & !0xfff) | (ch.chid & RL_ENTRY_ID_MASK);
        out[3] = hi32(ch.inst_addr);
    }

    fn decode(&self, entry: &[u32]) -> RunlistEntry {
        if entry[0] & RL_ENTRY_TYPE_TSG != 0 {
            RunlistEntry::Tsg {
                tsgid: entry[2] & RL_ENTRY_ID_MASK,
                length: entry[1] & 0xff,
                timeout: entry[0] >> RL_ENTRY_TIMESLICE_TIMEOUT_SHIFT,
                scale: (entry[0] >> RL_ENTRY_TIMESLICE_SCALE_SHIFT) & 0xf,
            }
        } else {
            RunlistEntry::Channel {
                chid: entry[2] & RL_ENTRY_ID_MASK,
                inst_addr: Some((u64::from(entry[3]) << 32) | u64::from(entry[2] & !0xfff)),
            }
        }
    }
}

pub(super) const GV11B_RUNLIST: Gv11bRunlist = Gv11bRunlist;

pub(super) fn ring_doorbell_gv11b(bar: &Bar0, chid: u32) {
    regs::NV_USERMODE_NOTIFY_CHANNEL_PENDING::default()
        .set_token(chid)
        .write(bar);
}

impl FifoHal for Gv11b {
    fn runlist_format(&self) -> &'static dyn RunlistFormat {
        &GV11B_RUNLIST
    }

    fn runlist_submit(&self, bar: &Bar0, runlist_id: u32, addr: u64, target: u32, count: u32) {
        runlist_submit_gp10b(bar, runlist_id, addr, target, count)
    }

    fn runlist_wait_pending(&self, bar: &Bar0, runlist_id: u32, timeout: Duration) -> Result {
        runlist_wait_pending_gp10b(bar, runlist_id, timeout)
    }

    fn ring_doorbell(&self, bar: &Bar0, chid: u32) {
        ring_doorbell_gv11b(bar, chid)
    }

    /// MMU faults are reported by the hub on Volta.
    fn take_mmu_fault(&self, _bar: &Bar0) -> Option<MmuFaultInfo> {
        None
    }

    fn intr_0_error_mask(&self) -> u32 {
        intr_0_error_mask_gp10b()
    }
}

const GV11B: Gv11b = Gv11b;
pub(super) const GV11B_HAL: &dyn FifoHal = &GV11B;
