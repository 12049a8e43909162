// SPDX-License-Identifier: GPL-2.0

use crate::sync::hal::{incr_header, SyncCmdHal};
use crate::util::{hi32, lo32};

struct Gp10b;

const SEMAPHOREA: u32 = 0x0004;
const SYNCPOINTA: u32 = 0x001c;
const WFI: u32 = 0x001e;

const SEMA_OPERATION_ACQ_GEQ: u32 = 0x4;
const SEMA_OPERATION_RELEASE: u32 = 0x2;
const SEMA_ACQUIRE_SWITCH_EN: u32 = 1 << 12;
const SEMA_RELEASE_WFI_DIS: u32 = 1 << 20;
const SEMA_RELEASE_SIZE_4BYTE: u32 = 1 << 24;

const SYNCPT_OPERATION_WAIT: u32 = 0x0;
const SYNCPT_OPERATION_INCR: u32 = 0x1;
const SYNCPT_WAIT_SWITCH_EN: u32 = 1 << 4;
const SYNCPT_INDEX_SHIFT: u32 = 8;

fn sema_cmd(va: u64, payload: u32, exec: u32, out: &mut Vec<u32>) {
    out.extend_from_slice(&[
        incr_header(SEMAPHOREA, 1),
        hi32(va) & 0xff,
        incr_header(SEMAPHOREA + 1, 1),
        lo32(va),
        incr_header(SEMAPHOREA + 2, 1),
        payload,
        incr_header(SEMAPHOREA + 3, 1),
        exec,
    ]);
}

impl SyncCmdHal for Gp10b {
    fn wait_cmd_words(&self) -> usize {
        8
    }

    fn sema_acquire(&self, va: u64, thresh: u32, out: &mut Vec<u32>) {
        sema_cmd(
            va,
            thresh,
            SEMA_OPERATION_ACQ_GEQ | SEMA_ACQUIRE_SWITCH_EN,
            out,
        );
    }

    fn sema_release(&self, va: u64, value: u32, wfi: bool, out: &mut Vec<u32>) {
        let mut exec = SEMA_OPERATION_RELEASE | SEMA_RELEASE_SIZE_4BYTE;
        if !wfi {
            exec |= SEMA_RELEASE_WFI_DIS;
        }

        sema_cmd(va, value, exec, out);
    }

    fn syncpt_wait(&self, id: u32, thresh: u32, _window: u64, out: &mut Vec<u32>) {
        out.extend_from_slice(&[
            incr_header(SYNCPOINTA, 1),
            thresh,
            incr_header(SYNCPOINTA + 1, 1),
            (id << SYNCPT_INDEX_SHIFT) | SYNCPT_WAIT_SWITCH_EN | SYNCPT_OPERATION_WAIT,
        ]);
    }

    fn syncpt_incr(&self, id: u32, wfi: bool, _window: u64, out: &mut Vec<u32>) {
        if wfi {
            out.extend_from_slice(&[incr_header(WFI, 1), 0]);
        }
        out.extend_from_slice(&[
            incr_header(SYNCPOINTA, 1),
            0,
            incr_header(SYNCPOINTA + 1, 1),
            (id << SYNCPT_INDEX_SHIFT) | SYNCPT_OPERATION_INCR,
        ]);
    }

    fn syncpt_uses_window(&self) -> bool {
        false
    }
}

const GP10B: Gp10b = Gp10b;
pub(super) const GP10B_SYNC: &dyn SyncCmdHal = &GP10B;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn syncpt_wait_and_incr() {
        let mut out = Vec::new();
        GP10B.syncpt_wait(42, 7, 0, &mut out);
        assert_eq!(out, [0x2001001c, 7, 0x2001001d, (42 << 8) | 0x10]);

        out.clear();
        GP10B.syncpt_incr(42, true, 0, &mut out);
        assert_eq!(
            out,
            [0x2001001e, 0, 0x2001001c, 0, 0x2001001d, (42 << 8) | 1]
        );
    }

    #[test]
    fn semaphore_release_without_wfi() {
        let mut out = Vec::new();
        GP10B.sema_release(0x1_2345_6000, 5, false, &mut out);

        assert_eq!(
            out,
            [
                0x20010004,
                0x1,
                0x20010005,
                0x2345_6000,
                0x20010006,
                5,
                0x20010007,
                0x2 | (1 << 24) | (1 << 20),
            ]
        );
    }
}
