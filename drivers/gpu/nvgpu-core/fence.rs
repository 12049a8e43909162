// SPDX-License-Identifier: GPL-2.0

//! Fences.
//!
//! A fence completes when its semaphore or syncpoint reaches a threshold. Fences handed to
//! user space can carry an OS fence, which is what gets installed on a file descriptor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;

use crate::error::{self, code::*, Result};
use crate::id_pool::IdPool;
use crate::semaphore::{Semaphore, SemaphoreSea};
use crate::syncpt::Syncpt;

/// OS representation of a fence.
pub trait OsFence: Send + Sync {
    /// Installs the fence on file descriptor `fd`.
    fn install(&self, fd: i32) -> Result;
}

/// OS fence import and export.
pub trait SyncFileOps: Send + Sync {
    /// Fences backing the OS fence behind `fd`.
    fn lookup(&self, fd: i32) -> Result<Vec<Arc<Fence>>>;
    /// Wraps `fence` into an OS fence.
    fn create(&self, fence: &Arc<Fence>) -> Result<Arc<dyn OsFence>>;
}

pub(crate) enum FenceKind {
    Semaphore {
        sema: Semaphore,
        sea: Arc<SemaphoreSea>,
    },
    Syncpt {
        syncpt: Arc<Syncpt>,
        threshold: u32,
    },
}

/// Fixed set of fences reserved for the in-flight jobs of a channel.
pub(crate) struct FencePool {
    slots: Mutex<IdPool>,
}

impl FencePool {
    pub(crate) fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(IdPool::with_capacity(count)),
        })
    }

    /// Reserves a fence.
    pub(crate) fn acquire(self: &Arc<Self>) -> Result<FenceSlot> {
        let slot = error::lock(&self.slots).acquire_next_id(0).ok_or_else(|| {
            warn!("fence: pool exhausted");
            ENOMEM
        })?;

        Ok(FenceSlot {
            pool: self.clone(),
            slot,
        })
    }

    pub(crate) fn in_use(&self) -> usize {
        error::lock(&self.slots).used()
    }
}

pub(crate) struct FenceSlot {
    pool: Arc<FencePool>,
    slot: usize,
}

impl Drop for FenceSlot {
    fn drop(&mut self) {
        error::lock(&self.pool.slots).release_id(self.slot);
    }
}

/// Completion of a submission.
pub struct Fence {
    kind: FenceKind,
    os_fence: Mutex<Option<Arc<dyn OsFence>>>,
    /// Waits ignore their timeout, for slow simulated platforms.
    unbounded_waits: bool,
    _slot: Option<FenceSlot>,
}

impl Fence {
    /// Creates a fence occupying `slot` of a fence pool, if given.
    pub(crate) fn new(kind: FenceKind, slot: Option<FenceSlot>, is_silicon: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            os_fence: Mutex::new(None),
            unbounded_waits: !is_silicon,
            _slot: slot,
        })
    }

    pub(crate) fn kind(&self) -> &FenceKind {
        &self.kind
    }

    /// Semaphore and threshold of a semaphore fence.
    pub(crate) fn semaphore(&self) -> Option<&Semaphore> {
        match &self.kind {
            FenceKind::Semaphore { sema, .. } => Some(sema),
            FenceKind::Syncpt { .. } => None,
        }
    }

    /// Syncpoint id and threshold of a syncpoint fence.
    pub(crate) fn syncpt(&self) -> Option<(u32, u32)> {
        match &self.kind {
            FenceKind::Syncpt { syncpt, threshold } => Some((syncpt.id(), *threshold)),
            FenceKind::Semaphore { .. } => None,
        }
    }

    pub(crate) fn set_os_fence(&self, os_fence: Arc<dyn OsFence>) {
        *error::lock(&self.os_fence) = Some(os_fence);
    }

    /// Whether the fence completed. Does not block.
    pub fn is_expired(&self) -> bool {
        match &self.kind {
            FenceKind::Semaphore { sema, .. } => sema.is_released(),
            FenceKind::Syncpt { syncpt, threshold } => syncpt.is_expired(*threshold),
        }
    }

    /// Blocks until the fence completes, failing with `ETIMEDOUT` after `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result {
        let timeout = if self.unbounded_waits {
            Duration::MAX
        } else {
            timeout
        };

        match &self.kind {
            FenceKind::Semaphore { sema, sea } => sea.wait_until(|| sema.is_released(), timeout),
            FenceKind::Syncpt { syncpt, threshold } => {
                if syncpt.is_expired(*threshold) {
                    Ok(())
                } else {
                    syncpt.wait(*threshold, timeout)
                }
            }
        }
    }

    /// Installs the OS fence of this fence on `fd`.
    pub fn install_fd(&self, fd: i32) -> Result {
        let os_fence = error::lock(&self.os_fence).clone().ok_or(EINVAL)?;
        os_fence.install(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{Aperture, DmaAllocator};
    use crate::sim::{TestHost1x, TestOsFence};
    use std::thread;

    fn sea() -> Arc<SemaphoreSea> {
        Arc::new(SemaphoreSea::new(
            DmaAllocator::new(false, false),
            Aperture::Sysmem,
        ))
    }

    fn sema_fence(sea: &Arc<SemaphoreSea>, threshold: u32) -> (Arc<Fence>, Semaphore) {
        let sema = Semaphore::new(sea.alloc().unwrap(), threshold);
        let kind = FenceKind::Semaphore {
            sema: sema.clone(),
            sea: sea.clone(),
        };

        (Fence::new(kind, None, true), sema)
    }

    #[test]
    fn semaphore_fence_expiry() {
        let sea = sea();
        let (fence, sema) = sema_fence(&sea, 4);

        for value in 0..8 {
            sema.hw().release(value);
            assert_eq!(fence.is_expired(), value >= 4);
        }
    }

    #[test]
    fn unbounded_wait_returns_on_cpu_release() {
        let sea = sea();
        let (fence, sema) = sema_fence(&sea, 1);

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            sema.hw().release(1);
        });

        fence.wait(Duration::MAX).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn wait_times_out_on_silicon() {
        let sea = sea();
        let (fence, _sema) = sema_fence(&sea, 1);

        assert_eq!(fence.wait(Duration::from_millis(2)), Err(ETIMEDOUT));
    }

    #[test]
    fn syncpt_fence_rereads_hardware() {
        let host1x = Arc::new(TestHost1x::default());
        let dyn_host1x: Arc<dyn crate::syncpt::Host1x> = host1x.clone();
        let syncpt = Syncpt::alloc(&dyn_host1x, "test").unwrap();
        let threshold = syncpt.incr_max(1);
        let fence = Fence::new(
            FenceKind::Syncpt {
                syncpt: syncpt.clone(),
                threshold,
            },
            None,
            true,
        );

        assert!(!fence.is_expired());
        // Only the hardware value moves; the cache is stale.
        host1x.set_hw_value(syncpt.id(), threshold);
        assert!(fence.is_expired());
        fence.wait(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn syncpt_expiry_is_an_unsigned_compare() {
        let host1x = Arc::new(TestHost1x::default());
        let dyn_host1x: Arc<dyn crate::syncpt::Host1x> = host1x.clone();
        let syncpt = Syncpt::alloc(&dyn_host1x, "high").unwrap();

        host1x.set_hw_value(syncpt.id(), 0x8000_0001);
        assert!(syncpt.is_expired(1));
        assert!(!syncpt.is_expired(0x8000_0002));
    }

    #[test]
    fn pool_is_bounded() {
        let sea = sea();
        let pool = FencePool::new(1);
        let kind = || FenceKind::Semaphore {
            sema: Semaphore::new(sea.alloc().unwrap(), 1),
            sea: sea.clone(),
        };

        let first = Fence::new(kind(), Some(pool.acquire().unwrap()), true);
        assert!(matches!(pool.acquire(), Err(ENOMEM)));

        drop(first);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn install_fd_needs_an_os_fence() {
        let sea = sea();
        let (fence, _sema) = sema_fence(&sea, 1);
        assert_eq!(fence.install_fd(3), Err(EINVAL));

        let os_fence = Arc::new(TestOsFence::default());
        fence.set_os_fence(os_fence.clone());
        fence.install_fd(3).unwrap();
        assert_eq!(os_fence.installed(), vec![3]);
    }
}
