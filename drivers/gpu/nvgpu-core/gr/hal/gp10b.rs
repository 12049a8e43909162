// SPDX-License-Identifier: GPL-2.0

use log::debug;

use crate::error::{code::*, Result};
use crate::gr::hal::{GlobalSizes, GrClasses, GrHal, PreemptSizes};

struct Gp10b;

const PASCAL_A: u32 = 0xc097;
const PASCAL_COMPUTE_A: u32 = 0xc0c0;
const PASCAL_DMA_COPY_A: u32 = 0xc0b5;
const PASCAL_CHANNEL_GPFIFO_A: u32 = 0xc06f;

const BUNDLE_CB_SIZE: usize = 0x1800 * 256;
const PAGEPOOL_SIZE: usize = 0x200 * 256;
/// Attribute circular buffer bytes per TPC.
const ATTRIB_CB_PER_TPC: usize = 0x1000 * 32;

/// Software methods of the compute class.
pub(super) const SET_SHADER_EXCEPTIONS: u32 = 0x1528;
pub(super) const SET_BES_CRD_CS: u32 = 0x10ec;
pub(super) const SET_CIRCULAR_BUFFER_SIZE: u32 = 0x1280;

/// Common software method handling for Pascal and later.
pub(super) fn handle_sw_method_gp10b(
    compute: u32,
    graphics: u32,
    class: u32,
    offset: u32,
    data: u32,
) -> Result {
    let known = match class {
        c if c == compute => matches!(offset, SET_SHADER_EXCEPTIONS | SET_BES_CRD_CS),
        c if c == graphics => matches!(offset, SET_SHADER_EXCEPTIONS | SET_CIRCULAR_BUFFER_SIZE),
        _ => false,
    };

    if known {
        debug!("gr: sw method {:#x} of {:#x}, data {:#x}", offset, class, data);
        Ok(())
    } else {
        Err(EINVAL)
    }
}

pub(super) fn global_sizes_gp10b(num_tpc: u32) -> GlobalSizes {
    GlobalSizes {
        circular: BUNDLE_CB_SIZE,
        pagepool: PAGEPOOL_SIZE,
        attribute: ATTRIB_CB_PER_TPC * num_tpc.max(1) as usize,
        rtv: 0,
    }
}

pub(super) fn preempt_sizes_gp10b(num_sm: u32) -> PreemptSizes {
    PreemptSizes {
        // Register file and shared memory of every SM.
        spill: 0x1_0000 * num_sm.max(1) as usize,
        betacb: 0x800 * 0x40,
        pagepool: PAGEPOOL_SIZE,
    }
}

impl GrHal for Gp10b {
    fn classes(&self) -> GrClasses {
        GrClasses {
            compute: PASCAL_COMPUTE_A,
            graphics: PASCAL_A,
            copy: PASCAL_DMA_COPY_A,
            gpfifo: PASCAL_CHANNEL_GPFIFO_A,
        }
    }

    fn supports_gfxp(&self) -> bool {
        true
    }

    fn supports_cilp(&self) -> bool {
        true
    }

    fn max_subctx(&self) -> u32 {
        1
    }

    fn sm_per_tpc(&self) -> u32 {
        1
    }

    fn global_sizes(&self, num_tpc: u32) -> GlobalSizes {
        global_sizes_gp10b(num_tpc)
    }

    fn preempt_sizes(&self, num_sm: u32) -> PreemptSizes {
        preempt_sizes_gp10b(num_sm)
    }

    fn handle_sw_method(&self, class: u32, offset: u32, data: u32) -> Result {
        handle_sw_method_gp10b(PASCAL_COMPUTE_A, PASCAL_A, class, offset, data)
    }
}

const GP10B: Gp10b = Gp10b;
pub(super) const GP10B_HAL: &dyn GrHal = &GP10B;
