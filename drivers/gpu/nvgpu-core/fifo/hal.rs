// SPDX-License-Identifier: GPL-2.0

use std::time::Duration;

use crate::error::Result;
use crate::fb::MmuFaultInfo;
use crate::fifo::runlist::RunlistFormat;
use crate::gpu::{Architecture, Chipset};
use crate::io::Bar0;

mod gp10b;
mod gv11b;
mod tu104;

pub(super) trait FifoHal: Sync {
    /// Encoding of runlist entries.
    fn runlist_format(&self) -> &'static dyn RunlistFormat;

    /// Points the scheduler of `runlist_id` at `count` entries at `addr`.
    fn runlist_submit(&self, bar: &Bar0, runlist_id: u32, addr: u64, target: u32, count: u32);

    /// Waits until the scheduler has accepted the last submitted runlist.
    fn runlist_wait_pending(&self, bar: &Bar0, runlist_id: u32, timeout: Duration) -> Result;

    /// Tells the host that `chid` has new work.
    ///
    /// Without a doorbell the host notices the GP_PUT update on its own.
    fn ring_doorbell(&self, _bar: &Bar0, _chid: u32) {}

    /// Captures and acknowledges an MMU fault reported through the FIFO interrupt.
    fn take_mmu_fault(&self, bar: &Bar0) -> Option<MmuFaultInfo>;

    /// Error interrupts enabled in `NV_PFIFO_INTR_EN_0`, on top of the PBDMA and runlist ones.
    fn intr_0_error_mask(&self) -> u32;
}

/// Returns the HAL corresponding to `chipset`.
pub(super) fn fifo_hal(chipset: Chipset) -> &'static dyn FifoHal {
    match chipset.arch() {
        Architecture::Pascal => gp10b::GP10B_HAL,
        Architecture::Volta => gv11b::GV11B_HAL,
        Architecture::Turing => tu104::TU104_HAL,
    }
}
