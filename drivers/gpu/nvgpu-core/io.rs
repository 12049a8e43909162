// SPDX-License-Identifier: GPL-2.0

//! BAR0 register access.
//!
//! The core never touches the MMIO mapping directly: the platform hands over an
//! [`MmioBackend`] and everything goes through [`Bar0`].

use std::sync::Arc;

use log::warn;

/// A 32-bit MMIO region.
///
/// Implemented by the platform glue for real hardware, and by the register simulator in tests.
pub trait MmioBackend: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, value: u32, offset: usize);
}

/// Handle to the GPU's BAR0 register space.
#[derive(Clone)]
pub struct Bar0 {
    backend: Arc<dyn MmioBackend>,
}

impl Bar0 {
    pub fn new(backend: Arc<dyn MmioBackend>) -> Self {
        Self { backend }
    }

    #[inline]
    pub fn read32(&self, offset: usize) -> u32 {
        self.backend.read32(offset)
    }

    #[inline]
    pub fn write32(&self, value: u32, offset: usize) {
        self.backend.write32(value, offset)
    }

    /// Writes `value` and reads it back, warning if the register did not latch it.
    pub fn write32_check(&self, value: u32, offset: usize) {
        self.write32(value, offset);
        let readback = self.read32(offset);
        if readback != value {
            warn!(
                "write32_check: {:#010x} wrote {:#010x}, read back {:#010x}",
                offset, value, readback
            );
        }
    }
}
