// SPDX-License-Identifier: GPL-2.0

//! Syncpoints.
//!
//! Syncpoints belong to the host1x driver. The core allocates them, tracks the increments it
//! queues and lets the GPU reach them through an aperture mapped into each address space.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::Result;

/// Byte stride of one syncpoint in the syncpoint aperture.
pub(crate) const SYNCPT_STRIDE: u64 = 4;

/// Syncpoint driver.
pub trait Host1x: Send + Sync {
    fn alloc_syncpt(&self, name: &str) -> Result<u32>;
    fn free_syncpt(&self, id: u32);
    /// Highest value increments were queued for.
    fn read_max(&self, id: u32) -> u32;
    /// Queues `n` increments and returns the new maximum.
    fn incr_max(&self, id: u32, n: u32) -> u32;
    /// Cached value.
    fn read_min(&self, id: u32) -> u32;
    /// Rereads the hardware value and returns it.
    fn update_min(&self, id: u32) -> u32;
    /// Waits until the syncpoint reaches `thresh`.
    fn wait(&self, id: u32, thresh: u32, timeout: Duration) -> Result;
    /// Moves the hardware value to the maximum.
    fn set_min_eq_max(&self, id: u32);
    /// Physical base and size of the syncpoint aperture.
    fn aperture(&self) -> (u64, usize);

    /// Whether `thresh` was reached, per the cached value.
    fn is_expired(&self, id: u32, thresh: u32) -> bool {
        self.read_min(id) >= thresh
    }
}

/// A syncpoint owned by a channel.
pub(crate) struct Syncpt {
    host1x: Arc<dyn Host1x>,
    id: u32,
}

impl Syncpt {
    pub(crate) fn alloc(host1x: &Arc<dyn Host1x>, name: &str) -> Result<Arc<Self>> {
        let id = host1x.alloc_syncpt(name)?;
        debug!("syncpt: {} allocated for {}", id, name);

        Ok(Arc::new(Self {
            host1x: host1x.clone(),
            id,
        }))
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn host1x(&self) -> &Arc<dyn Host1x> {
        &self.host1x
    }

    /// Byte offset of the syncpoint in the syncpoint aperture.
    pub(crate) fn offset(&self) -> u64 {
        u64::from(self.id) * SYNCPT_STRIDE
    }

    pub(crate) fn incr_max(&self, n: u32) -> u32 {
        self.host1x.incr_max(self.id, n)
    }

    /// Whether `thresh` was reached. A cached miss is confirmed against the hardware.
    pub(crate) fn is_expired(&self, thresh: u32) -> bool {
        self.host1x.is_expired(self.id, thresh)
            || self.host1x.update_min(self.id) >= thresh
    }

    pub(crate) fn wait(&self, thresh: u32, timeout: Duration) -> Result {
        self.host1x.wait(self.id, thresh, timeout)
    }

    pub(crate) fn set_min_eq_max(&self) {
        self.host1x.set_min_eq_max(self.id)
    }
}

impl Drop for Syncpt {
    fn drop(&mut self) {
        self.host1x.free_syncpt(self.id);
    }
}
