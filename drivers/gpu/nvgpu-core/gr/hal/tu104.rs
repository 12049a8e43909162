// SPDX-License-Identifier: GPL-2.0

use crate::error::Result;
use crate::gr::hal::{GlobalSizes, GrClasses, GrHal, PreemptSizes};

use super::gp10b::{global_sizes_gp10b, handle_sw_method_gp10b, preempt_sizes_gp10b};

struct Tu104;

const TURING_A: u32 = 0xc597;
const TURING_COMPUTE_A: u32 = 0xc5c0;
const TURING_DMA_COPY_A: u32 = 0xc5b5;
const TURING_CHANNEL_GPFIFO_A: u32 = 0xc46f;

const RTV_CB_SIZE: usize = 0x800 * 256;

impl GrHal for Tu104 {
    fn classes(&self) -> GrClasses {
        GrClasses {
            compute: TURING_COMPUTE_A,
            graphics: TURING_A,
            copy: TURING_DMA_COPY_A,
            gpfifo: TURING_CHANNEL_GPFIFO_A,
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
        GlobalSizes {
            rtv: RTV_CB_SIZE,
            ..global_sizes_gp10b(num_tpc)
        }
    }

    fn preempt_sizes(&self, num_sm: u32) -> PreemptSizes {
        preempt_sizes_gp10b(num_sm)
    }

    fn handle_sw_method(&self, class: u32, offset: u32, data: u32) -> Result {
        handle_sw_method_gp10b(TURING_COMPUTE_A, TURING_A, class, offset, data)
    }
}

const TU104: Tu104 = Tu104;
pub(super) const TU104_HAL: &dyn GrHal = &TU104;
