// SPDX-License-Identifier: GPL-2.0

//! Engine registry, read from the device info table.

use log::{debug, warn};

use crate::error::{code::*, Result};
use crate::io::Bar0;
use crate::regs;

/// Kind of engine served by a runlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    Gr,
    /// Logical copy engine.
    Ce,
    Nvdec,
}

impl EngineType {
    fn from_device_info(ty: u32) -> Option<Self> {
        match ty {
            regs::DEVICE_INFO_TYPE_GR => Some(Self::Gr),
            regs::DEVICE_INFO_TYPE_LCE => Some(Self::Ce),
            regs::DEVICE_INFO_TYPE_NVDEC => Some(Self::Nvdec),
            _ => None,
        }
    }
}

/// Description of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EngineInfo {
    pub(crate) engine_id: u32,
    pub(crate) engine_type: EngineType,
    pub(crate) runlist_id: u32,
    /// Bit of the engine in `NV_PMC_INTR`.
    pub(crate) intr_mask: u32,
    /// Bit of the engine in `NV_PMC_ENABLE`.
    pub(crate) reset_mask: u32,
    pub(crate) pri_base: u32,
    /// Instance of the engine among those of its type.
    pub(crate) inst_id: u32,
    /// PBDMA serving the engine's runlist.
    pub(crate) pbdma_id: Option<u32>,
}

#[derive(Default)]
struct Partial {
    engine_id: Option<u32>,
    runlist_id: Option<u32>,
    intr_id: Option<u32>,
    reset_id: Option<u32>,
    engine_type: Option<u32>,
    pri_base: u32,
    inst_id: u32,
}

impl Partial {
    fn finish(self) -> Option<EngineInfo> {
        let engine_type = EngineType::from_device_info(self.engine_type?)?;

        Some(EngineInfo {
            engine_id: self.engine_id?,
            engine_type,
            runlist_id: self.runlist_id?,
            intr_mask: 1 << self.intr_id?,
            reset_mask: self.reset_id.map_or(0, |id| 1 << id),
            pri_base: self.pri_base,
            inst_id: self.inst_id,
            pbdma_id: None,
        })
    }
}

/// Walks the device info table. Every chain of entries describes one engine; engines of a kind
/// the core does not drive are skipped.
pub(crate) fn read_device_info(bar: &Bar0, num_pbdma: u32) -> Result<Vec<EngineInfo>> {
    let mut engines = Vec::new();
    let mut cur = Partial::default();

    for i in 0..regs::NV_PTOP_DEVICE_INFO::SIZE {
        let entry = regs::NV_PTOP_DEVICE_INFO::read(bar, i);
        let raw = entry.raw();

        match entry.entry() {
            regs::DEVICE_INFO_ENTRY_NOT_VALID => continue,
            regs::DEVICE_INFO_ENTRY_ENUM => {
                let e = regs::DeviceInfoEnum::from(raw);
                cur.engine_id = e.engine_valid().then(|| u32::from(e.engine_id()));
                cur.runlist_id = e.runlist_valid().then(|| u32::from(e.runlist_id()));
                cur.intr_id = e.intr_valid().then(|| u32::from(e.intr_id()));
                cur.reset_id = e.reset_valid().then(|| u32::from(e.reset_id()));
            }
            regs::DEVICE_INFO_ENTRY_ENGINE_TYPE => {
                cur.engine_type = Some(regs::DeviceInfoEngineType::from(raw).engine_type());
            }
            regs::DEVICE_INFO_ENTRY_DATA => {
                let d = regs::DeviceInfoData::from(raw);
                cur.pri_base = d.pri_base() << 12;
                cur.inst_id = u32::from(d.inst_id());
            }
            _ => {
                warn!("device info: unknown entry {:#x} at {}", raw, i);
                continue;
            }
        }

        if !entry.chain() {
            if let Some(mut info) = core::mem::take(&mut cur).finish() {
                info.pbdma_id = find_pbdma(bar, num_pbdma, info.runlist_id);
                debug!("device info: {:x?}", info);
                engines.push(info);
            }
        }
    }

    if !engines.iter().any(|e| e.engine_type == EngineType::Gr) {
        warn!("device info: no GR engine");
        return Err(EINVAL);
    }

    Ok(engines)
}

fn find_pbdma(bar: &Bar0, num_pbdma: u32, runlist_id: u32) -> Option<u32> {
    (0..num_pbdma).find(|&id| {
        regs::NV_PFIFO_PBDMA_MAP::try_read(bar, id as usize)
            .map(|m| m.runlists() & (1 << runlist_id) != 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Chipset;
    use crate::sim::Sim;

    #[test]
    fn parses_simulated_table() {
        let sim = Sim::new(Chipset::TU104);
        let bar = sim.bar();
        let num_pbdma = regs::NV_PFIFO_HOST_NUM_PBDMA::read(&bar).value();
        let engines = read_device_info(&bar, num_pbdma).unwrap();

        let gr = engines[0];
        assert_eq!(gr.engine_type, EngineType::Gr);
        assert_eq!(gr.runlist_id, 0);
        assert_eq!(gr.intr_mask, 1 << 12);
        assert_eq!(gr.pri_base, 0x400000);
        assert_eq!(gr.pbdma_id, Some(0));

        let ces = engines
            .iter()
            .filter(|e| e.engine_type == EngineType::Ce)
            .collect::<Vec<_>>();
        assert_eq!(ces.len(), 2);
        assert_eq!(ces[1].runlist_id, 2);
        assert_eq!(ces[1].pbdma_id, Some(2));
        assert_eq!(ces[1].inst_id, 1);

        assert!(engines.iter().any(|e| e.engine_type == EngineType::Nvdec));
    }

    #[test]
    fn missing_gr_is_an_error() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        for i in 0..regs::NV_PTOP_DEVICE_INFO::SIZE {
            sim.poke(regs::NV_PTOP_DEVICE_INFO::offset(i), 0);
        }

        assert_eq!(read_device_info(&bar, 3), Err(EINVAL));
    }
}
