// SPDX-License-Identifier: GPL-2.0

use crate::gpu::{Architecture, Chipset};

mod gp10b;
mod gv11b;

/// Encodes a method header writing `count` consecutive methods starting at `method`.
pub(super) const fn incr_header(method: u32, count: u32) -> u32 {
    (1 << 29) | (count << 16) | method
}

/// Push buffer encodings of the synchronization commands.
pub(crate) trait SyncCmdHal: Sync {
    /// Words of one semaphore or syncpoint wait.
    fn wait_cmd_words(&self) -> usize;

    /// Waits until the 32-bit semaphore at `va` reaches `thresh`.
    fn sema_acquire(&self, va: u64, thresh: u32, out: &mut Vec<u32>);

    /// Writes `value` to the semaphore at `va`, after the engine idles if `wfi`.
    fn sema_release(&self, va: u64, value: u32, wfi: bool, out: &mut Vec<u32>);

    /// Waits until syncpoint `id` reaches `thresh`. `window` is the read-only syncpoint window.
    fn syncpt_wait(&self, id: u32, thresh: u32, window: u64, out: &mut Vec<u32>);

    /// Increments syncpoint `id`. `window` is the read-write syncpoint window.
    fn syncpt_incr(&self, id: u32, wfi: bool, window: u64, out: &mut Vec<u32>);

    /// Whether syncpoints are reached through the syncpoint windows.
    fn syncpt_uses_window(&self) -> bool;
}

pub(crate) fn sync_hal(chipset: Chipset) -> &'static dyn SyncCmdHal {
    match chipset.arch() {
        Architecture::Pascal => gp10b::GP10B_SYNC,
        Architecture::Volta | Architecture::Turing => gv11b::GV11B_SYNC,
    }
}
