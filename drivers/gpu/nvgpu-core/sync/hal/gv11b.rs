// SPDX-License-Identifier: GPL-2.0

use crate::sync::hal::{incr_header, SyncCmdHal};
use crate::util::{hi32, lo32};

struct Gv11b;

const SEM_ADDR_LO: u32 = 0x0017;
const SEM_ADDR_HI: u32 = 0x0018;
const SEM_PAYLOAD_LO: u32 = 0x0019;
const SEM_PAYLOAD_HI: u32 = 0x001a;
const SEM_EXECUTE: u32 = 0x001b;

const SEM_EXECUTE_OPERATION_RELEASE: u32 = 0x1;
const SEM_EXECUTE_OPERATION_ACQ_STRICT_GEQ: u32 = 0x2;
const SEM_EXECUTE_ACQUIRE_SWITCH_TSG_EN: u32 = 1 << 12;
const SEM_EXECUTE_RELEASE_WFI_EN: u32 = 1 << 20;

/// Syncpoints are plain semaphores in the syncpoint window. A release of any value increments.
fn sem_cmd(va: u64, payload: u32, exec: u32, out: &mut Vec<u32>) {
    out.extend_from_slice(&[
        incr_header(SEM_ADDR_LO, 1),
        lo32(va),
        incr_header(SEM_ADDR_HI, 1),
        hi32(va),
        incr_header(SEM_PAYLOAD_LO, 1),
        payload,
        incr_header(SEM_PAYLOAD_HI, 1),
        0,
        incr_header(SEM_EXECUTE, 1),
        exec,
    ]);
}

fn release_exec(wfi: bool) -> u32 {
    SEM_EXECUTE_OPERATION_RELEASE | if wfi { SEM_EXECUTE_RELEASE_WFI_EN } else { 0 }
}

impl SyncCmdHal for Gv11b {
    fn wait_cmd_words(&self) -> usize {
        10
    }

    fn sema_acquire(&self, va: u64, thresh: u32, out: &mut Vec<u32>) {
        sem_cmd(
            va,
            thresh,
            SEM_EXECUTE_OPERATION_ACQ_STRICT_GEQ | SEM_EXECUTE_ACQUIRE_SWITCH_TSG_EN,
            out,
        );
    }

    fn sema_release(&self, va: u64, value: u32, wfi: bool, out: &mut Vec<u32>) {
        sem_cmd(va, value, release_exec(wfi), out);
    }

    fn syncpt_wait(&self, id: u32, thresh: u32, window: u64, out: &mut Vec<u32>) {
        self.sema_acquire(window + u64::from(id) * crate::syncpt::SYNCPT_STRIDE, thresh, out);
    }

    fn syncpt_incr(&self, id: u32, wfi: bool, window: u64, out: &mut Vec<u32>) {
        sem_cmd(
            window + u64::from(id) * crate::syncpt::SYNCPT_STRIDE,
            0,
            release_exec(wfi),
            out,
        );
    }

    fn syncpt_uses_window(&self) -> bool {
        true
    }
}

const GV11B: Gv11b = Gv11b;
pub(super) const GV11B_SYNC: &dyn SyncCmdHal = &GV11B;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn syncpt_wait_is_ten_words() {
        let window = 0x1f_0000_0000u64;
        let va = window + 42 * 4;
        let mut out = Vec::new();

        GV11B.syncpt_wait(42, 7, window, &mut out);
        assert_eq!(
            out,
            [
                0x20010017,
                lo32(va),
                0x20010018,
                hi32(va),
                0x20010019,
                7,
                0x2001001a,
                0,
                0x2001001b,
                0x2 | (1 << 12),
            ]
        );
        assert_eq!(out.len(), GV11B.wait_cmd_words());
    }

    #[test]
    fn release_wfi_bit() {
        let mut with = Vec::new();
        let mut without = Vec::new();
        GV11B.sema_release(0x1000, 1, true, &mut with);
        GV11B.sema_release(0x1000, 1, false, &mut without);

        assert_eq!(with[9], 0x1 | (1 << 20));
        assert_eq!(without[9], 0x1);
    }
}
