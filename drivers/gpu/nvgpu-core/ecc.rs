// SPDX-License-Identifier: GPL-2.0

//! Error counters.
//!
//! Corrected and uncorrected ECC errors are accumulated per L2 slice. Faults handled by the
//! interrupt paths are counted per kind, so that they remain visible after recovery.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error;

/// One error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EccCounter {
    /// Single-bit errors corrected in an L2 slice.
    LtcCorrected { ltc: u8, slice: u8 },
    /// Double-bit errors detected in an L2 slice.
    LtcUncorrected { ltc: u8, slice: u8 },
    PbdmaError,
    MmuFault,
    GrException,
    CeError,
}

/// Error counters of a device.
#[derive(Debug, Default)]
pub struct EccStats {
    counts: Mutex<BTreeMap<EccCounter, u64>>,
}

impl EccStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, counter: EccCounter, count: u64) {
        let mut counts = error::lock(&self.counts);
        let value = counts.entry(counter).or_insert(0);
        *value = value.saturating_add(count);
    }

    pub fn get(&self, counter: EccCounter) -> u64 {
        error::lock(&self.counts).get(&counter).copied().unwrap_or(0)
    }

    /// Sum of the corrected (`corrected == true`) or uncorrected L2 errors of every slice.
    pub fn ltc_total(&self, corrected: bool) -> u64 {
        error::lock(&self.counts)
            .iter()
            .filter(|(c, _)| match c {
                EccCounter::LtcCorrected { .. } => corrected,
                EccCounter::LtcUncorrected { .. } => !corrected,
                _ => false,
            })
            .map(|(_, v)| *v)
            .sum()
    }

    /// All non-zero counters, in counter order.
    pub fn snapshot(&self) -> Vec<(EccCounter, u64)> {
        error::lock(&self.counts)
            .iter()
            .map(|(c, v)| (*c, *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let ecc = EccStats::new();

        ecc.add(EccCounter::LtcCorrected { ltc: 0, slice: 1 }, 2);
        ecc.add(EccCounter::LtcCorrected { ltc: 1, slice: 0 }, 1);
        ecc.add(EccCounter::LtcUncorrected { ltc: 0, slice: 0 }, 1);
        ecc.add(EccCounter::PbdmaError, 1);
        ecc.add(EccCounter::PbdmaError, 1);

        assert_eq!(ecc.ltc_total(true), 3);
        assert_eq!(ecc.ltc_total(false), 1);
        assert_eq!(ecc.get(EccCounter::PbdmaError), 2);
        assert_eq!(ecc.get(EccCounter::MmuFault), 0);
        assert_eq!(ecc.snapshot().len(), 4);
    }
}
