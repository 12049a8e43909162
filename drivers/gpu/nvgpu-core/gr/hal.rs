// SPDX-License-Identifier: GPL-2.0

use crate::error::Result;
use crate::gpu::{Architecture, Chipset};

mod gp10b;
mod gv11b;
mod tu104;

/// `FERMI_TWOD_A`, accepted on every chip.
pub(crate) const FERMI_TWOD_A: u32 = 0x902d;
/// `KEPLER_INLINE_TO_MEMORY_B`, accepted on every chip.
pub(crate) const KEPLER_INLINE_TO_MEMORY_B: u32 = 0xa140;

/// Class numbers of a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GrClasses {
    pub(crate) compute: u32,
    pub(crate) graphics: u32,
    pub(crate) copy: u32,
    pub(crate) gpfifo: u32,
}

/// Sizes of the buffers shared by every GR context of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GlobalSizes {
    pub(crate) circular: usize,
    pub(crate) pagepool: usize,
    pub(crate) attribute: usize,
    /// Zero on chips without an RTV circular buffer.
    pub(crate) rtv: usize,
}

/// Sizes of the preemption buffers not reported by FECS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PreemptSizes {
    pub(crate) spill: usize,
    pub(crate) betacb: usize,
    pub(crate) pagepool: usize,
}

pub(crate) trait GrHal: Sync {
    fn classes(&self) -> GrClasses;

    fn supports_gfxp(&self) -> bool;

    fn supports_cilp(&self) -> bool;

    /// Subcontexts per TSG.
    fn max_subctx(&self) -> u32;

    fn sm_per_tpc(&self) -> u32;

    fn global_sizes(&self, num_tpc: u32) -> GlobalSizes;

    fn preempt_sizes(&self, num_sm: u32) -> PreemptSizes;

    /// Whether the subcontext header replaces the context pointer in the instance block.
    fn uses_subctx_header(&self) -> bool {
        self.max_subctx() > 1
    }

    fn is_valid_class(&self, class: u32) -> bool {
        let c = self.classes();
        [c.compute, c.graphics, c.copy, FERMI_TWOD_A, KEPLER_INLINE_TO_MEMORY_B].contains(&class)
    }

    /// Emulates a method the hardware trapped as illegal. Unknown methods fail with `EINVAL`.
    fn handle_sw_method(&self, class: u32, offset: u32, data: u32) -> Result;
}

/// Returns the HAL corresponding to `chipset`.
pub(crate) fn gr_hal(chipset: Chipset) -> &'static dyn GrHal {
    match chipset.arch() {
        Architecture::Pascal => gp10b::GP10B_HAL,
        Architecture::Volta => gv11b::GV11B_HAL,
        Architecture::Turing => tu104::TU104_HAL,
    }
}
