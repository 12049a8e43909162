// SPDX-License-Identifier: GPL-2.0

//! Tunables read by the core.

use std::time::Duration;

use crate::fifo::runlist::InterleaveLevel;

/// Per-device configuration, fixed at probe.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// Default bound for register polls.
    pub poll_timeout: Duration,
    /// Bound for the HS ACR ucode to report through mailbox 0.
    pub acr_timeout: Duration,
    /// Bound for a FECS method to be acknowledged.
    pub fecs_timeout: Duration,
    /// Bound for a TSG or runlist preempt to complete.
    pub preempt_timeout: Duration,
    /// Bound for a runlist submit to be accepted.
    pub runlist_timeout: Duration,
    /// Bound for in-flight jobs to retire when a channel is closed.
    pub channel_close_timeout: Duration,

    /// Recover from faults. When disabled the first fatal fault quiesces the device instead.
    pub fault_recovery: bool,
    /// Honor TSG interleave levels when building runlists.
    pub runlist_interleave: bool,
    /// Running on silicon. Pre-silicon platforms get unbounded fence waits.
    pub is_silicon: bool,
    /// Access video memory through the PRAMIN window.
    pub pramin_enabled: bool,
    /// Sysmem is reached without IOMMU translation.
    pub iommu_bypass: bool,
    /// One VA allocator covers both page sizes.
    pub unified_va: bool,

    pub default_timeslice_us: u32,
    pub min_timeslice_us: u32,
    pub max_timeslice_us: u32,
    pub default_interleave: InterleaveLevel,

    /// Number of hardware channels exposed. Clamped to what the chip supports.
    pub num_channels: u32,
    /// GPFIFO ring entries per channel.
    pub gpfifo_entries: u32,
    /// Size of the per-channel private command buffer, in 32-bit words.
    pub priv_cmd_words: u32,
    /// Big page size for new address spaces. Zero selects the chip default.
    pub big_page_size: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            acr_timeout: Duration::from_secs(10),
            fecs_timeout: Duration::from_millis(2000),
            preempt_timeout: Duration::from_millis(100),
            runlist_timeout: Duration::from_millis(100),
            channel_close_timeout: Duration::from_millis(3000),
            fault_recovery: true,
            runlist_interleave: true,
            is_silicon: true,
            pramin_enabled: true,
            iommu_bypass: false,
            unified_va: false,
            default_timeslice_us: 5000,
            min_timeslice_us: 1000,
            max_timeslice_us: 50000,
            default_interleave: InterleaveLevel::Medium,
            num_channels: 512,
            gpfifo_entries: 128,
            priv_cmd_words: 4096,
            big_page_size: 0,
        }
    }
}
