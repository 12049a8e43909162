// SPDX-License-Identifier: GPL-2.0

//! L2 cache (LTC) configuration and interrupts.

use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::ecc::{EccCounter, EccStats};
use crate::gpu::{Architecture, Chipset};
use crate::io::Bar0;
use crate::regs;

/// Maximum number of LTCs the interrupt registers describe.
const MAX_LTC: u32 = 8;

/// L2 cache controllers of a device.
pub(crate) struct Ltc {
    /// Bytes of L2 per slice.
    slice_size: u64,
    count: AtomicU32,
    slices_per_ltc: AtomicU32,
}

impl Ltc {
    pub(crate) fn new(chipset: Chipset) -> Self {
        let slice_size = match chipset.arch() {
            Architecture::Pascal => 128 << 10,
            Architecture::Volta | Architecture::Turing => 256 << 10,
        };

        Self {
            slice_size,
            count: AtomicU32::new(0),
            slices_per_ltc: AtomicU32::new(0),
        }
    }

    pub(crate) fn init_hw(&self, bar: &Bar0) {
        let count = regs::NV_PRI_RINGMASTER_ENUM_LTC::read(bar).count().min(MAX_LTC);
        let cbc = regs::NV_PLTCG_LTCS_LTSS_CBC_PARAM::read(bar);
        let slices = u32::from(cbc.slices_per_ltc());

        self.count.store(count, Ordering::Relaxed);
        self.slices_per_ltc.store(slices, Ordering::Relaxed);

        debug!(
            "ltc: {} LTCs, {} slices each, cache line {} bytes",
            count,
            slices,
            512u32 << cbc.cache_line_size()
        );
    }

    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn slices_per_ltc(&self) -> u32 {
        self.slices_per_ltc.load(Ordering::Relaxed)
    }

    pub(crate) fn l2_size(&self) -> u64 {
        u64::from(self.count()) * u64::from(self.slices_per_ltc()) * self.slice_size
    }

    /// Services the interrupts of every LTC flagged in `NV_PMC_INTR_LTC`, feeding the ECC
    /// counters.
    pub(crate) fn isr(&self, bar: &Bar0, ecc: &EccStats) {
        let pending = regs::NV_PMC_INTR_LTC::read(bar).value();

        for ltc in 0..self.count() {
            if pending & (1 << ltc) == 0 {
                continue;
            }

            for slice in 0..self.slices_per_ltc() {
                let idx = ltc as usize * regs::LTS_PER_LTC_STRIDE + slice as usize;
                let Ok(intr) = regs::NV_PLTCG_LTC_LTS_INTR::try_read(bar, idx) else {
                    continue;
                };

                if intr.ecc_sec_error() {
                    ecc.add(
                        EccCounter::LtcCorrected {
                            ltc: ltc as u8,
                            slice: slice as u8,
                        },
                        1,
                    );
                }
                if intr.ecc_ded_error() {
                    warn!("ltc{} lts{}: uncorrected ECC error", ltc, slice);
                    ecc.add(
                        EccCounter::LtcUncorrected {
                            ltc: ltc as u8,
                            slice: slice as u8,
                        },
                        1,
                    );
                }

                // Write-1-to-clear.
                intr.write(bar, idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, Sim};

    #[test]
    fn geometry() {
        let sim = Sim::new(Chipset::GV11B);
        let ltc = Ltc::new(Chipset::GV11B);

        ltc.init_hw(&sim.bar());

        assert_eq!(ltc.count(), sim::NUM_LTC);
        assert_eq!(ltc.slices_per_ltc(), sim::SLICES_PER_LTC);
        assert_eq!(
            ltc.l2_size(),
            u64::from(sim::NUM_LTC * sim::SLICES_PER_LTC) * (256 << 10)
        );
    }

    #[test]
    fn ecc_errors_are_counted_and_cleared() {
        let sim = Sim::new(Chipset::GP10B);
        let bar = sim.bar();
        let ltc = Ltc::new(Chipset::GP10B);
        let ecc = EccStats::new();
        ltc.init_hw(&bar);

        let sec = regs::NV_PLTCG_LTC_LTS_INTR::default().set_ecc_sec_error(true);
        let ded = sec.set_ecc_ded_error(true);
        sim.poke(regs::NV_PLTCG_LTC_LTS_INTR::offset(1), sec.raw());
        sim.poke(regs::NV_PLTCG_LTC_LTS_INTR::offset(16), ded.raw());

        ltc.isr(&bar, &ecc);

        assert_eq!(ecc.get(EccCounter::LtcCorrected { ltc: 0, slice: 1 }), 1);
        assert_eq!(ecc.get(EccCounter::LtcCorrected { ltc: 1, slice: 0 }), 1);
        assert_eq!(ecc.get(EccCounter::LtcUncorrected { ltc: 1, slice: 0 }), 1);
        assert_eq!(sim.peek(regs::NV_PLTCG_LTC_LTS_INTR::offset(16)), 0);
        assert_eq!(sim.peek(regs::NV_PMC_INTR_LTC::OFFSET), 0);
    }
}
