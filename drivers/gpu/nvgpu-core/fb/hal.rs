// SPDX-License-Identifier: GPL-2.0

use crate::error::Result;
use crate::fb::MmuFaultInfo;
use crate::gpu::{Architecture, Chipset};
use crate::io::Bar0;

mod gp10b;
mod gv11b;

pub(super) trait FbHal: Sync {
    /// Returns the address of the currently-registered sysmem flush page.
    fn read_sysmem_flush_page(&self, bar: &Bar0) -> u64;

    /// Register `addr` as the address of the sysmem flush page.
    ///
    /// This might fail if the address is too large for the receiving register.
    fn write_sysmem_flush_page(&self, bar: &Bar0, addr: u64) -> Result;

    /// Captures and releases the pending MMU fault snapshot of the hub, acknowledging its
    /// interrupt.
    fn take_mmu_fault(&self, bar: &Bar0) -> Option<MmuFaultInfo>;
}

/// Returns the HAL corresponding to `chipset`.
pub(super) fn fb_hal(chipset: Chipset) -> &'static dyn FbHal {
    match chipset.arch() {
        Architecture::Pascal => gp10b::GP10B_HAL,
        Architecture::Volta | Architecture::Turing => gv11b::GV11B_HAL,
    }
}
