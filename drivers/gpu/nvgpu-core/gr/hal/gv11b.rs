// SPDX-License-Identifier: GPL-2.0

use crate::error::Result;
use crate::gr::hal::{GlobalSizes, GrClasses, GrHal, PreemptSizes};

use super::gp10b::{global_sizes_gp10b, handle_sw_method_gp10b, preempt_sizes_gp10b};

struct Gv11b;

const VOLTA_A: u32 = 0xc397;
const VOLTA_COMPUTE_A: u32 = 0xc3c0;
const VOLTA_DMA_COPY_A: u32 = 0xc3b5;
const VOLTA_CHANNEL_GPFIFO_A: u32 = 0xc36f;

impl GrHal for Gv11b {
    fn classes(&self) -> GrClasses {
        GrClasses {
            compute: VOLTA_COMPUTE_A,
            graphics: VOLTA_A,
            copy: VOLTA_DMA_COPY_A,
            gpfifo: VOLTA_CHANNEL_GPFIFO_A,
        }
    }

    fn supports_gfxp(&self) -> bool {
        true
    }

    fn supports_cilp(&self) -> bool {
        true
    }

    fn max_subctx(&self) -> u32 {
        64
    }

    fn sm_per_tpc(&self) -> u32 {
        2
    }

    fn global_sizes(&self, num_tpc: u32) -> GlobalSizes {
        global_sizes_gp10b(num_tpc)
    }

    fn preempt_sizes(&self, num_sm: u32) -> PreemptSizes {
        preempt_sizes_gp10b(num_sm)
    }

    fn handle_sw_method(&self, class: u32, offset: u32, data: u32) -> Result {
        handle_sw_method_gp10b(VOLTA_COMPUTE_A, VOLTA_A, class, offset, data)
    }
}

const GV11B: Gv11b = Gv11b;
pub(super) const GV11B_HAL: &dyn GrHal = &GV11B;
