// SPDX-License-Identifier: GPL-2.0

//! NVGPU Core
//!
//! Command submission and engine orchestration for Pascal, Volta and Turing GPUs.

#[macro_use]
mod bitfield;
#[macro_use]
mod regs;

mod acr;
mod ce;
mod channel;
mod config;
mod dma;
mod ecc;
mod error;
mod falcon;
mod fb;
mod fence;
mod fifo;
mod firmware;
mod gpu;
mod gr;
mod id_pool;
mod intr;
mod io;
mod ltc;
mod mc;
mod mm;
mod pmu;
mod semaphore;
mod sync;
mod syncpt;
mod transmute;
mod tsg;
mod util;

#[cfg(test)]
mod sim;

pub use channel::{
    Channel, ChannelEvent, ChannelParams, FenceWait, GpfifoEntry, SubmitArgs,
};
pub use config::GpuConfig;
pub use dma::{Aperture, DmaAllocator, DmaFlags, DmaObject, SgChunk, SgTable};
pub use ecc::{EccCounter, EccStats};
pub use error::{Error, Result};
pub use falcon::FalconId;
pub use fb::MmuFaultInfo;
pub use fence::{Fence, OsFence, SyncFileOps};
pub use fifo::engines::EngineType;
pub use fifo::runlist::InterleaveLevel;
pub use fifo::ErrorNotifier;
pub use firmware::FirmwareLoader;
pub use gpu::{
    Architecture, Characteristics, Chipset, Gpu, GpuFlags, GpuState, Platform, Revision, Spec,
};
pub use gr::{ComputePreemption, GraphicsPreemption};
pub use intr::NonstallOps;
pub use io::{Bar0, MmioBackend};
pub use mm::vm::{MapFlags, Vm};
pub use pmu::PowerGating;
pub use semaphore::SemaphoreSea;
pub use syncpt::Host1x;
pub use tsg::{SmErrorState, Tsg};
