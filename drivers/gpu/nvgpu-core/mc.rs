// SPDX-License-Identifier: GPL-2.0

//! Master control: unit enables, engine resets and the top-level interrupt trees.

use std::time::Duration;

use log::debug;

use crate::io::Bar0;
use crate::regs;
use crate::util;

/// Top-level interrupt trees.
pub(crate) const INTR_STALL: usize = 0;
pub(crate) const INTR_NONSTALL: usize = 1;

/// Unit bits of `NV_PMC_INTR`. Copy engine bits come from the device info table.
pub(crate) const INTR_UNIT_PFIFO: u32 = 1 << 8;
pub(crate) const INTR_UNIT_HUB: u32 = 1 << 9;
pub(crate) const INTR_UNIT_GR: u32 = 1 << 12;
pub(crate) const INTR_UNIT_PMU: u32 = 1 << 24;
pub(crate) const INTR_UNIT_LTC: u32 = 1 << 25;
pub(crate) const INTR_UNIT_PRIV_RING: u32 = 1 << 30;

/// Unit bits of `NV_PMC_ENABLE`. Copy engine bits come from the device info table.
pub(crate) const ENABLE_PFIFO: u32 = 1 << 8;
pub(crate) const ENABLE_GR: u32 = 1 << 12;
pub(crate) const ENABLE_PMU: u32 = 1 << 13;
pub(crate) const ENABLE_NVDEC: u32 = 1 << 15;
pub(crate) const ENABLE_SEC2: u32 = 1 << 22;
pub(crate) const ENABLE_PERFMON: u32 = 1 << 28;

/// Settle time after resetting a copy engine.
pub(crate) const CE_RESET_SETTLE: Duration = Duration::from_micros(500);
/// Settle time after resetting any other unit.
pub(crate) const RESET_SETTLE: Duration = Duration::from_micros(20);

/// Take the units in `mask` out of reset.
pub(crate) fn enable(bar: &Bar0, mask: u32) {
    regs::NV_PMC_ENABLE::update(bar, |r| r.set_value(r.value() | mask));
    // Flush the write before the units are touched.
    let _ = regs::NV_PMC_ENABLE::read(bar);
}

/// Pulse the reset of the units in `mask`, waiting `settle` with the units held in reset.
pub(crate) fn reset(bar: &Bar0, mask: u32, settle: Duration) {
    debug!("mc: reset units {:#x}", mask);

    regs::NV_PMC_ENABLE::update(bar, |r| r.set_value(r.value() & !mask));
    util::udelay(settle);
    enable(bar, mask);
}

/// Pulse the reset of the PBDMAs in `mask`.
pub(crate) fn reset_pbdmas(bar: &Bar0, mask: u32) {
    debug!("mc: reset pbdmas {:#x}", mask);

    regs::NV_PMC_ENABLE_PB::update(bar, |r| r.set_value(r.value() & !mask));
    util::udelay(RESET_SETTLE);
    regs::NV_PMC_ENABLE_PB::update(bar, |r| r.set_value(r.value() | mask));
    let _ = regs::NV_PMC_ENABLE_PB::read(bar);
}

/// Enable the interrupts in `mask` on `tree`.
pub(crate) fn intr_enable(bar: &Bar0, tree: usize, mask: u32) {
    regs::NV_PMC_INTR_EN_SET::default()
        .set_value(mask)
        .write(bar, tree);
}

/// Disable the interrupts in `mask` on `tree`.
pub(crate) fn intr_disable(bar: &Bar0, tree: usize, mask: u32) {
    regs::NV_PMC_INTR_EN_CLEAR::default()
        .set_value(mask)
        .write(bar, tree);
}

/// Pending interrupts of `tree`.
pub(crate) fn intr_pending(bar: &Bar0, tree: usize) -> u32 {
    regs::NV_PMC_INTR::read(bar, tree).value()
}
