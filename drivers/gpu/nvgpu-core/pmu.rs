// SPDX-License-Identifier: GPL-2.0

//! PMU unit: its falcon, its RTOS queues and the ELPG hooks of the power-gating governor.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::{self, Result};
use crate::falcon::pmu::Pmu as PmuEngine;
use crate::falcon::queue::Rtos;
use crate::falcon::{Falcon, FalconFlags};
use crate::gpu::Chipset;
use crate::io::Bar0;

/// Hooks of the engine-level power gating (ELPG) governor.
pub trait PowerGating: Send + Sync {
    /// Wakes GR up and keeps it powered until [`PowerGating::elpg_enable`].
    fn elpg_disable(&self) -> Result;
    /// Allows GR to be power gated again.
    fn elpg_enable(&self) -> Result;
}

pub(crate) struct Pmu {
    pub(crate) falcon: Falcon<PmuEngine>,
    pub(crate) rtos: Rtos<PmuEngine>,
    pg: Option<Arc<dyn PowerGating>>,
    /// Number of sections currently running with ELPG disabled.
    elpg_refcnt: Mutex<u32>,
}

impl Pmu {
    pub(crate) fn new(chipset: Chipset, pg: Option<Arc<dyn PowerGating>>) -> Result<Self> {
        Ok(Self {
            falcon: Falcon::new(
                chipset,
                FalconFlags::SUPPORTED | FalconFlags::INTERRUPT_ENABLED,
            )?,
            rtos: Rtos::new(),
            pg,
            elpg_refcnt: Mutex::new(0),
        })
    }

    /// Runs `f` with engine-level power gating inhibited.
    ///
    /// GR registers must not be accessed while GR may be power gated. Calls nest.
    pub(crate) fn elpg_protected<R>(&self, f: impl FnOnce() -> R) -> R {
        let Some(pg) = self.pg.as_ref() else {
            return f();
        };

        {
            let mut cnt = error::lock(&self.elpg_refcnt);
            if *cnt == 0 {
                let _ = pg
                    .elpg_disable()
                    .inspect_err(|e| warn!("pmu: failed to disable ELPG: {:?}", e));
            }
            *cnt += 1;
        }

        let ret = f();

        let mut cnt = error::lock(&self.elpg_refcnt);
        *cnt -= 1;
        if *cnt == 0 {
            let _ = pg
                .elpg_enable()
                .inspect_err(|e| warn!("pmu: failed to re-enable ELPG: {:?}", e));
        }

        ret
    }

    /// Services the PMU falcon interrupt.
    pub(crate) fn isr(&self, bar: &Bar0) {
        let stat = self.falcon.isr(bar);
        if stat != 0 {
            debug!("pmu: irqstat {:#x}", stat);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    #[derive(Default)]
    struct Governor {
        depth: AtomicI32,
        transitions: AtomicU32,
    }

    impl PowerGating for Governor {
        fn elpg_disable(&self) -> Result {
            self.depth.fetch_add(1, Ordering::SeqCst);
            self.transitions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn elpg_enable(&self) -> Result {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            self.transitions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn elpg_protected_nests() {
        let gov = Arc::new(Governor::default());
        let pmu = Pmu::new(Chipset::GV11B, Some(gov.clone())).unwrap();

        let v = pmu.elpg_protected(|| {
            assert_eq!(gov.depth.load(Ordering::SeqCst), 1);
            pmu.elpg_protected(|| gov.depth.load(Ordering::SeqCst))
        });

        assert_eq!(v, 1);
        assert_eq!(gov.depth.load(Ordering::SeqCst), 0);
        assert_eq!(gov.transitions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn without_governor() {
        let pmu = Pmu::new(Chipset::GP10B, None).unwrap();
        assert_eq!(pmu.elpg_protected(|| 7), 7);
    }
}
