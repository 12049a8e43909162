// SPDX-License-Identifier: GPL-2.0

//! Frame buffer interface: sysmem flush page, FB and L2 flushes, and MMU fault capture.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::dma::{Aperture, DmaAllocator, DmaObject, PAGE_SIZE};
use crate::error::{self, Result};
use crate::gpu::Chipset;
use crate::io::Bar0;
use crate::regs;
use crate::util;

mod hal;

/// Snapshot of an MMU fault, as captured by the fault interrupt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuFaultInfo {
    pub fault_type: u8,
    pub access_type: u8,
    pub client: u8,
    /// Set for hub clients, clear for GPC clients.
    pub client_type: bool,
    pub gpc_id: u8,
    /// Faulting virtual address.
    pub addr: u64,
    /// Instance block of the faulting context.
    pub inst_addr: u64,
    pub inst_aperture: u8,
    /// Engine the fault was raised by, as listed in the device info table.
    pub engine_id: u32,
    pub replayable: bool,
    /// Channel and TSG owning `inst_addr`, once resolved.
    pub chid: Option<u32>,
    pub tsgid: Option<u32>,
}

/// Kind of MMU fault, one capture slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultSlot {
    NonReplayable = 0,
    Replayable = 1,
}

/// FB unit of a device.
pub(crate) struct Fb {
    hal: &'static dyn hal::FbHal,
    /// Page the GPU writes to on `sysmembar`.
    flush_page: Mutex<Option<Arc<DmaObject>>>,
    /// Last fault captured per slot.
    faults: Mutex<[Option<MmuFaultInfo>; 2]>,
}

impl Fb {
    pub(crate) fn new(chipset: Chipset) -> Self {
        Self {
            hal: hal::fb_hal(chipset),
            flush_page: Mutex::new(None),
            faults: Mutex::new([None; 2]),
        }
    }

    /// Allocates and registers the sysmem flush page.
    pub(crate) fn init_hw(&self, bar: &Bar0, dma: &DmaAllocator) -> Result {
        let mut page = error::lock(&self.flush_page);
        if page.is_none() {
            *page = Some(dma.alloc(PAGE_SIZE, Aperture::Sysmem)?);
        }
        if let Some(page) = page.as_ref() {
            self.hal.write_sysmem_flush_page(bar, page.addr())?;
        }

        Ok(())
    }

    /// Unregisters the sysmem flush page, if it is still the registered one.
    pub(crate) fn fini_hw(&self, bar: &Bar0) {
        let page = error::lock(&self.flush_page);

        if let Some(page) = page.as_ref() {
            if self.hal.read_sysmem_flush_page(bar) == page.addr() {
                let _ = self
                    .hal
                    .write_sysmem_flush_page(bar, 0)
                    .inspect_err(|e| warn!("fb: failed to unregister sysmem flush page: {:?}", e));
            }
        }
    }

    /// Flushes the pending writes of the FB hub to memory.
    pub(crate) fn flush(&self, bar: &Bar0, timeout: Duration) -> Result {
        regs::NV_UFLUSH_FB_FLUSH::default()
            .set_pending(true)
            .write(bar);

        util::read_poll_timeout(
            || Ok(regs::NV_UFLUSH_FB_FLUSH::read(bar)),
            |r| !r.pending() && !r.outstanding(),
            Duration::from_micros(2),
            timeout,
        )
        .map(|_| ())
        .inspect_err(|_| warn!("fb: flush timed out"))
    }

    /// Writes dirty L2 lines back, then optionally invalidates the L2 copies of system memory.
    pub(crate) fn l2_flush(&self, bar: &Bar0, invalidate: bool, timeout: Duration) -> Result {
        regs::NV_UFLUSH_L2_FLUSH_DIRTY::default()
            .set_pending(true)
            .write(bar);
        util::read_poll_timeout(
            || Ok(regs::NV_UFLUSH_L2_FLUSH_DIRTY::read(bar)),
            |r| !r.pending() && !r.outstanding(),
            Duration::from_micros(2),
            timeout,
        )
        .inspect_err(|_| warn!("fb: L2 flush timed out"))?;

        if invalidate {
            regs::NV_UFLUSH_L2_SYSMEM_INVALIDATE::default()
                .set_pending(true)
                .write(bar);
            util::read_poll_timeout(
                || Ok(regs::NV_UFLUSH_L2_SYSMEM_INVALIDATE::read(bar)),
                |r| !r.pending() && !r.outstanding(),
                Duration::from_micros(2),
                timeout,
            )
            .inspect_err(|_| warn!("fb: L2 invalidate timed out"))?;
        }

        Ok(())
    }

    /// Services the hub interrupt. Returns the MMU fault it captured, if any.
    pub(crate) fn hub_isr(&self, bar: &Bar0) -> Option<MmuFaultInfo> {
        let fault = self.hal.take_mmu_fault(bar)?;
        self.record_fault(fault);

        Some(fault)
    }

    /// Stores `fault` in the slot of its kind. Also used for faults reported through the FIFO.
    pub(crate) fn record_fault(&self, fault: MmuFaultInfo) {
        let slot = if fault.replayable {
            FaultSlot::Replayable
        } else {
            FaultSlot::NonReplayable
        };

        debug!("fb: {:?} fault {:x?}", slot, fault);
        error::lock(&self.faults)[slot as usize] = Some(fault);
    }

    /// Last fault captured in `slot`.
    pub(crate) fn last_fault(&self, slot: FaultSlot) -> Option<MmuFaultInfo> {
        error::lock(&self.faults)[slot as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Sim;

    #[test]
    fn flush_page_registration() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let dma = DmaAllocator::new(false, false);
        let fb = Fb::new(Chipset::GV11B);

        fb.init_hw(&bar, &dma).unwrap();
        let addr = u64::from(regs::NV_PFB_NISO_FLUSH_SYSMEM_ADDR::read(&bar).adr_39_08()) << 8;
        assert_ne!(addr, 0);
        assert_eq!(addr % PAGE_SIZE as u64, 0);

        fb.fini_hw(&bar);
        assert_eq!(regs::NV_PFB_NISO_FLUSH_SYSMEM_ADDR::read(&bar).adr_39_08(), 0);
    }

    #[test]
    fn flushes_complete() {
        let sim = Sim::new(Chipset::GP10B);
        let bar = sim.bar();
        let fb = Fb::new(Chipset::GP10B);

        fb.flush(&bar, Duration::from_millis(10)).unwrap();
        fb.l2_flush(&bar, true, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn hub_fault_capture() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let fb = Fb::new(Chipset::GV11B);

        assert_eq!(fb.hub_isr(&bar), None);

        sim.inject_hub_fault(0x1_2345_6000, 0x4_0000, 5, false);
        let fault = fb.hub_isr(&bar).unwrap();

        assert_eq!(fault.addr, 0x1_2345_6000);
        assert_eq!(fault.inst_addr, 0x4_0000);
        assert_eq!(fault.engine_id, 5);
        assert_eq!(fb.last_fault(FaultSlot::NonReplayable), Some(fault));
        assert_eq!(fb.last_fault(FaultSlot::Replayable), None);
        // The snapshot is released and the interrupt acknowledged.
        assert!(!regs::NV_PFB_MMU_FAULT_INFO::read(&bar).valid());
        assert_eq!(sim.peek(regs::NV_PFB_NISO_INTR::OFFSET), 0);
    }

    #[test]
    fn pascal_hub_reports_no_faults() {
        let sim = Sim::new(Chipset::GP10B);
        let fb = Fb::new(Chipset::GP10B);

        sim.inject_hub_fault(0x1000, 0x2000, 0, false);
        assert_eq!(fb.hub_isr(&sim.bar()), None);
    }
}
