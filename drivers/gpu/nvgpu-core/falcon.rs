// SPDX-License-Identifier: GPL-2.0

//! Falcon microprocessor base support.
//!
//! Every falcon (PMU, SEC2, FECS, GPCCS, NVDEC) exposes the same register block at its own base.
//! [`Falcon`] drives that block; the engine type parameter selects the base at compile time and
//! the HAL covers what differs between chips.

use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, warn};

use hal::FalconHal;

use crate::error::{self, code::*, Result};
use crate::gpu::Chipset;
use crate::io::Bar0;
use crate::regs;
use crate::regs::macros::RegisterBase;
use crate::util;

pub(crate) mod fecs;
pub(crate) mod gpccs;
mod hal;
pub(crate) mod nvdec;
pub(crate) mod pmu;
pub(crate) mod queue;
pub(crate) mod sec2;

/// Size of an IMEM/DMEM block. IMEM tags are per block.
pub(crate) const FALCON_BLOCK_SIZE: u32 = 256;

/// Falcon identifiers, as used by the ACR blob and the bootstrap commands.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FalconId {
    Pmu = 0,
    Fecs = 2,
    Gpccs = 3,
    Nvdec = 4,
    Sec2 = 7,
}

/// One past the largest falcon id the ACR understands.
pub(crate) const FALCON_ID_END: usize = 11;
/// Falcon id marking the end of the WPR header array.
pub(crate) const FALCON_ID_INVALID: u32 = 0xffff_ffff;

impl From<FalconId> for u32 {
    fn from(value: FalconId) -> Self {
        value as u32
    }
}

impl TryFrom<u32> for FalconId {
    type Error = error::Error;

    fn try_from(value: u32) -> Result<Self> {
        use FalconId::*;

        let id = match value {
            0 => Pmu,
            2 => Fecs,
            3 => Gpccs,
            4 => Nvdec,
            7 => Sec2,
            _ => return Err(EINVAL),
        };

        Ok(id)
    }
}

/// Different types of memory present in a falcon core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FalconMem {
    /// Instruction Memory.
    Imem,
    /// Data Memory.
    Dmem,
}

bitflags! {
    /// Static properties of a falcon instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FalconFlags: u32 {
        /// The falcon exists on this chip.
        const SUPPORTED = 1 << 0;
        /// The falcon's interrupts are routed to the host.
        const INTERRUPT_ENABLED = 1 << 1;
    }
}

/// Type used to represent the `PFALCON` registers address base for a given falcon engine.
pub(crate) struct PFalconBase(());

/// Trait defining the parameters of a given Falcon engine.
pub(crate) trait FalconEngine: Send + Sync + RegisterBase<PFalconBase> + Sized + 'static {
    /// Singleton of the engine, used to identify it with register I/O methods.
    const ID: Self;

    /// Identifier of the falcon in ACR structures.
    const FALCON_ID: FalconId;

    /// Engine-level reset. Engines without one return `None` and get a falcon core reset.
    fn engine_reset(_bar: &Bar0) -> Option<Result> {
        None
    }
}

/// Contains the base parameters common to all Falcon instances.
pub(crate) struct Falcon<E: FalconEngine> {
    hal: Box<dyn FalconHal<E>>,
    flags: FalconFlags,
    /// Serializes accesses to the IMEM/DMEM ports.
    copy_lock: Mutex<()>,
}

impl<E: FalconEngine> Falcon<E> {
    /// Create a new falcon instance for `chipset`.
    pub(crate) fn new(chipset: Chipset, flags: FalconFlags) -> Result<Self> {
        Ok(Self {
            hal: hal::falcon_hal::<E>(chipset)?,
            flags,
            copy_lock: Mutex::new(()),
        })
    }

    pub(crate) fn id(&self) -> FalconId {
        E::FALCON_ID
    }

    /// Size in bytes of `mem`, as reported by the hardware configuration register.
    pub(crate) fn mem_size(&self, bar: &Bar0, mem: FalconMem) -> u32 {
        self.hal.mem_size(bar, mem)
    }

    /// Reset the falcon, through its engine reset when it has one.
    pub(crate) fn reset(&self, bar: &Bar0) -> Result {
        match E::engine_reset(bar) {
            Some(res) => res?,
            None => self.hal.reset_cpu(bar)?,
        }

        // TIMEOUT: scrubbing of the falcon memories takes less than 10ms.
        util::read_poll_timeout(
            || Ok(self.scrubbing_done(bar)),
            |done| *done,
            Duration::from_micros(10),
            Duration::from_millis(10),
        )
        .map(|_| ())
        .inspect_err(|_| warn!("falcon {:?}: memory scrubbing did not complete", E::FALCON_ID))
    }

    /// Returns `true` once both IMEM and DMEM scrubbing are done.
    pub(crate) fn scrubbing_done(&self, bar: &Bar0) -> bool {
        self.hal.scrubbing_done(bar)
    }

    /// Wait for the falcon and its external units to become idle.
    pub(crate) fn wait_for_idle(&self, bar: &Bar0, timeout: Duration) -> Result {
        util::read_poll_timeout(
            || Ok(regs::NV_PFALCON_FALCON_IDLESTATE::read(bar, &E::ID)),
            |r| !r.falcon_busy() && r.ext_busy() == 0,
            Duration::from_micros(10),
            timeout,
        )
        .map(|_| ())
    }

    /// Wait for the falcon CPU to halt.
    pub(crate) fn wait_for_halt(&self, bar: &Bar0, timeout: Duration) -> Result {
        util::read_poll_timeout(
            || Ok(regs::NV_PFALCON_FALCON_CPUCTL::read(bar, &E::ID)),
            |r| r.halted(),
            Duration::from_micros(10),
            timeout,
        )
        .map(|_| ())
        .map_err(|_| ETIMEDOUT)
    }

    fn check_copy(&self, bar: &Bar0, mem: FalconMem, dst: u32, len: usize) -> Result {
        let size = self.mem_size(bar, mem);
        let len = u32::try_from(len).map_err(|_| EINVAL)?;

        match dst.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => {
                warn!(
                    "falcon {:?}: copy of {:#x} bytes at {:#x} overflows {:?} ({:#x} bytes)",
                    E::FALCON_ID,
                    len,
                    dst,
                    mem,
                    size
                );
                Err(EINVAL)
            }
        }
    }

    /// Copy `src` into IMEM at `dst` through `port`.
    ///
    /// `tag` is the virtual tag of the first block and is incremented for every following block.
    /// The last block is zero-padded.
    pub(crate) fn copy_to_imem(
        &self,
        bar: &Bar0,
        dst: u32,
        src: &[u8],
        port: usize,
        secure: bool,
        tag: u32,
    ) -> Result {
        if (dst as usize | src.len()) % 4 != 0 {
            warn!("falcon {:?}: unaligned IMEM copy", E::FALCON_ID);
            return Err(EINVAL);
        }
        self.check_copy(bar, FalconMem::Imem, dst, src.len())?;

        let _guard = error::lock(&self.copy_lock);

        regs::NV_PFALCON_FALCON_IMEMC::default()
            .set_offs((dst >> 2) & 0x3f)
            .set_blk(dst >> 8)
            .set_aincw(true)
            .set_secure(secure)
            .try_write(bar, &E::ID, port)?;

        let words = src.len() / 4;
        // Pad to the end of the block containing the last byte.
        let padded = (util::align_up(u64::from(dst) + src.len() as u64, 256) - u64::from(dst)) / 4;
        let mut tag = tag;

        for i in 0..padded as usize {
            if i % 64 == 0 {
                regs::NV_PFALCON_FALCON_IMEMT::default()
                    .set_tag(tag)
                    .write(bar, &E::ID, port);
                tag += 1;
            }

            let word = if i < words {
                u32::from_le_bytes([src[i * 4], src[i * 4 + 1], src[i * 4 + 2], src[i * 4 + 3]])
            } else {
                0
            };
            regs::NV_PFALCON_FALCON_IMEMD::default()
                .set_data(word)
                .write(bar, &E::ID, port);
        }

        Ok(())
    }

    /// Copy `src` into DMEM at `dst` through `port`.
    pub(crate) fn copy_to_dmem(&self, bar: &Bar0, dst: u32, src: &[u8], port: usize) -> Result {
        if dst % 4 != 0 {
            warn!("falcon {:?}: unaligned DMEM copy to {:#x}", E::FALCON_ID, dst);
            return Err(EINVAL);
        }
        self.check_copy(bar, FalconMem::Dmem, dst, src.len())?;

        let _guard = error::lock(&self.copy_lock);

        regs::NV_PFALCON_FALCON_DMEMC::default()
            .set_offs((dst >> 2) & 0x3f)
            .set_blk(dst >> 8)
            .set_aincw(true)
            .try_write(bar, &E::ID, port)?;

        for chunk in src.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            regs::NV_PFALCON_FALCON_DMEMD::default()
                .set_data(u32::from_le_bytes(word))
                .write(bar, &E::ID, port);
        }

        Ok(())
    }

    /// Copy `dst.len()` bytes from DMEM at `src` through `port`.
    pub(crate) fn copy_from_dmem(
        &self,
        bar: &Bar0,
        src: u32,
        dst: &mut [u8],
        port: usize,
    ) -> Result {
        if src % 4 != 0 {
            warn!("falcon {:?}: unaligned DMEM read from {:#x}", E::FALCON_ID, src);
            return Err(EINVAL);
        }
        self.check_copy(bar, FalconMem::Dmem, src, dst.len())?;

        let _guard = error::lock(&self.copy_lock);

        regs::NV_PFALCON_FALCON_DMEMC::default()
            .set_offs((src >> 2) & 0x3f)
            .set_blk(src >> 8)
            .set_aincr(true)
            .try_write(bar, &E::ID, port)?;

        for chunk in dst.chunks_mut(4) {
            let word = regs::NV_PFALCON_FALCON_DMEMD::read(bar, &E::ID, port)
                .data()
                .to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }

        Ok(())
    }

    /// Copy `src` into EMEM, the queue memory some falcons expose next to DMEM.
    pub(crate) fn copy_to_emem(&self, bar: &Bar0, dst: u32, src: &[u8], port: usize) -> Result {
        let _guard = error::lock(&self.copy_lock);

        self.hal.copy_to_emem(bar, dst, src, port)
    }

    /// Start the falcon CPU at `boot_vector`.
    pub(crate) fn bootstrap(&self, bar: &Bar0, boot_vector: u32) -> Result {
        debug!("falcon {:?}: bootstrap at {:#x}", E::FALCON_ID, boot_vector);

        regs::NV_PFALCON_FALCON_DMACTL::read(bar, &E::ID)
            .set_require_ctx(false)
            .write(bar, &E::ID);
        regs::NV_PFALCON_FALCON_BOOTVEC::default()
            .set_value(boot_vector)
            .write(bar, &E::ID);
        regs::NV_PFALCON_FALCON_CPUCTL::default()
            .set_startcpu(true)
            .write(bar, &E::ID);

        Ok(())
    }

    /// Unmask (`enable`) or mask every interrupt of the falcon.
    ///
    /// Falcons whose interrupts are not routed to the host always end up masked.
    pub(crate) fn set_irq(&self, bar: &Bar0, enable: bool, mask: u32, dest: u32) {
        let enable = enable && self.flags.contains(FalconFlags::INTERRUPT_ENABLED);

        if enable {
            regs::NV_PFALCON_FALCON_IRQMSET::default()
                .set_value(mask)
                .write(bar, &E::ID);
            regs::NV_PFALCON_FALCON_IRQDEST::default()
                .set_value(dest)
                .write(bar, &E::ID);
        } else {
            regs::NV_PFALCON_FALCON_IRQMCLR::default()
                .set_value(u32::MAX)
                .write(bar, &E::ID);
        }
    }

    pub(crate) fn mailbox_read(&self, bar: &Bar0, idx: usize) -> u32 {
        match idx {
            0 => regs::NV_PFALCON_FALCON_MAILBOX0::read(bar, &E::ID).value(),
            _ => regs::NV_PFALCON_FALCON_MAILBOX1::read(bar, &E::ID).value(),
        }
    }

    pub(crate) fn mailbox_write(&self, bar: &Bar0, idx: usize, value: u32) {
        match idx {
            0 => regs::NV_PFALCON_FALCON_MAILBOX0::default()
                .set_value(value)
                .write(bar, &E::ID),
            _ => regs::NV_PFALCON_FALCON_MAILBOX1::default()
                .set_value(value)
                .write(bar, &E::ID),
        }
    }

    /// Acknowledge the pending interrupts of the falcon and return them.
    pub(crate) fn isr(&self, bar: &Bar0) -> u32 {
        let stat = regs::NV_PFALCON_FALCON_IRQSTAT::read(bar, &E::ID);
        if stat.halt() {
            warn!("falcon {:?}: halted", E::FALCON_ID);
        }
        if stat.exterr() {
            warn!("falcon {:?}: external error", E::FALCON_ID);
        }
        regs::NV_PFALCON_FALCON_IRQSCLR::default()
            .set_value(stat.raw())
            .write(bar, &E::ID);

        stat.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::falcon::fecs::Fecs;
    use crate::falcon::sec2::Sec2;
    use crate::sim::Sim;

    const IMEM_SIZE: u32 = 0x10000;

    #[test]
    fn imem_copy_tags_and_pads() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let falcon = Falcon::<Fecs>::new(Chipset::GV11B, FalconFlags::SUPPORTED).unwrap();

        let code: Vec<u8> = (0..0x104u32).flat_map(|w| (w + 1).to_le_bytes()).collect();
        falcon.copy_to_imem(&bar, 0x200, &code, 0, false, 2).unwrap();

        let imem = sim.falcon_imem(Fecs::BASE);
        assert_eq!(imem[0x200 / 4], 1);
        assert_eq!(imem[0x200 / 4 + 0x103], 0x104);
        // The tail of the last 256 byte block is zero-filled.
        assert!(imem[0x200 / 4 + 0x104..0x700 / 4].iter().all(|w| *w == 0));
        assert_eq!(sim.falcon_imem_tags(Fecs::BASE), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn imem_copy_bounds() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let falcon = Falcon::<Fecs>::new(Chipset::GV11B, FalconFlags::SUPPORTED).unwrap();
        let before = sim.write_count();

        assert_eq!(falcon.copy_to_imem(&bar, 2, &[0; 8], 0, false, 0), Err(EINVAL));
        assert_eq!(falcon.copy_to_imem(&bar, 0, &[0; 6], 0, false, 0), Err(EINVAL));
        assert_eq!(
            falcon.copy_to_imem(&bar, IMEM_SIZE - 4, &[0; 8], 0, false, 0),
            Err(EINVAL)
        );
        assert_eq!(sim.write_count(), before);

        assert_eq!(falcon.copy_to_imem(&bar, IMEM_SIZE - 8, &[0xff; 8], 0, false, 0), Ok(()));
    }

    #[test]
    fn dmem_round_trip_with_tail() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let falcon = Falcon::<Sec2>::new(Chipset::GV11B, FalconFlags::SUPPORTED).unwrap();

        let data = [1u8, 2, 3, 4, 5, 6];
        falcon.copy_to_dmem(&bar, 0x40, &data, 0).unwrap();
        let mut out = [0u8; 6];
        falcon.copy_from_dmem(&bar, 0x40, &mut out, 0).unwrap();

        assert_eq!(out, data);
        assert_eq!(falcon.copy_to_dmem(&bar, 0x41, &data, 0), Err(EINVAL));
    }

    #[test]
    fn missing_emem_op_is_invalid() {
        let sim = Sim::new(Chipset::GP10B);
        let bar = sim.bar();
        let falcon = Falcon::<Fecs>::new(Chipset::GP10B, FalconFlags::SUPPORTED).unwrap();

        assert_eq!(falcon.copy_to_emem(&bar, 0, &[0; 4], 0), Err(EINVAL));
    }

    #[test]
    fn irq_forced_off_without_routing() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let falcon = Falcon::<Fecs>::new(Chipset::GV11B, FalconFlags::SUPPORTED).unwrap();

        falcon.set_irq(&bar, true, 0xf0, 0x10);
        assert_eq!(
            bar.read32(regs::NV_PFALCON_FALCON_IRQMCLR::offset(&Fecs::ID)),
            u32::MAX
        );
        assert_eq!(bar.read32(regs::NV_PFALCON_FALCON_IRQMSET::offset(&Fecs::ID)), 0);
    }

    #[test]
    fn bootstrap_starts_cpu() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let falcon = Falcon::<Fecs>::new(Chipset::GV11B, FalconFlags::SUPPORTED).unwrap();

        falcon.bootstrap(&bar, 0x100).unwrap();
        assert_eq!(regs::NV_PFALCON_FALCON_BOOTVEC::read(&bar, &Fecs::ID).value(), 0x100);
        assert!(sim.falcon_started(Fecs::BASE));
    }

    #[test]
    fn wait_for_halt() {
        let sim = Sim::new(Chipset::GV11B);
        let bar = sim.bar();
        let falcon = Falcon::<Fecs>::new(Chipset::GV11B, FalconFlags::SUPPORTED).unwrap();

        assert_eq!(falcon.wait_for_halt(&bar, Duration::from_millis(1)), Err(ETIMEDOUT));

        let halted = regs::NV_PFALCON_FALCON_CPUCTL::default().set_halted(true);
        sim.poke(Fecs::BASE + regs::NV_PFALCON_FALCON_CPUCTL::OFFSET, halted.raw());
        falcon.wait_for_halt(&bar, Duration::from_millis(1)).unwrap();
    }
}
