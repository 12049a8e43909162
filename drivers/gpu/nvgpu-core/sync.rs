// SPDX-License-Identifier: GPL-2.0

//! Channel synchronization.
//!
//! Generates the push buffer snippets a channel runs to wait for fences and to signal its own
//! progress. A channel signals through a semaphore of the device's semaphore sea or, when the
//! platform has a syncpoint driver and the channel asks for it, through a syncpoint.

use std::sync::Arc;

use log::debug;

use crate::dma::{Aperture, DmaAllocator};
use crate::error::{code::*, Result};
use crate::fence::{Fence, FenceKind, FenceSlot, SyncFileOps};
use crate::gpu::Gpu;
use crate::mm::vm::{SyncMap, Vm};
use crate::semaphore::{HwSemaphore, Semaphore, SemaphoreSea};
use crate::syncpt::{Host1x, Syncpt};

pub(crate) mod hal;

use hal::SyncCmdHal;

/// Synchronization backend of a channel.
pub(crate) trait ChannelSync: Send + Sync {
    /// Appends a wait for `fence` to `out`. Expired fences produce no command.
    fn wait_fence(&self, fence: &Fence, out: &mut Vec<u32>) -> Result;

    /// Appends waits for every fence behind the OS fence `fd`.
    fn wait_fence_fd(&self, fd: i32, out: &mut Vec<u32>) -> Result;

    /// Appends an increment to `out` and returns the fence that completes with it.
    fn incr(&self, wfi: bool, slot: Option<FenceSlot>, out: &mut Vec<u32>) -> Result<Arc<Fence>>;

    /// Completes every increment handed out, for a channel that will not run them.
    fn set_min_eq_max(&self);
}

/// State shared by both backends.
struct SyncCtx {
    hal: &'static dyn SyncCmdHal,
    vm: Arc<Vm>,
    dma: DmaAllocator,
    sea: Arc<SemaphoreSea>,
    host1x: Option<Arc<dyn Host1x>>,
    sync_file: Option<Arc<dyn SyncFileOps>>,
    is_silicon: bool,
}

impl SyncCtx {
    fn new(gpu: &Gpu, vm: &Arc<Vm>) -> Self {
        Self {
            hal: hal::sync_hal(gpu.chipset()),
            vm: vm.clone(),
            dma: gpu.dma.clone(),
            sea: gpu.sema_sea.clone(),
            host1x: gpu.platform.host1x.clone(),
            sync_file: gpu.platform.sync_file.clone(),
            is_silicon: gpu.config.is_silicon,
        }
    }

    fn sema_window(&self, which: SyncMap) -> Result<u64> {
        self.vm.sync_map(which, &self.sea.mem()?)
    }

    /// VA of the syncpoint window `which`, or zero on chips that do not use it.
    fn syncpt_window(&self, which: SyncMap) -> Result<u64> {
        if !self.hal.syncpt_uses_window() {
            return Ok(0);
        }

        let host1x = self.host1x.as_ref().ok_or(ENOTSUPP)?;
        let (base, size) = host1x.aperture();
        let window = self.dma.wrap_phys(base, size, Aperture::Sysmem);

        self.vm.sync_map(which, &window)
    }

    fn wait(&self, fence: &Fence, out: &mut Vec<u32>) -> Result {
        if fence.is_expired() {
            return Ok(());
        }

        match fence.kind() {
            FenceKind::Semaphore { sema, sea } => {
                if !Arc::ptr_eq(sea, &self.sea) {
                    return Err(EINVAL);
                }
                let va = self.sema_window(SyncMap::SemaphoreRo)? + sema.hw().offset();
                self.hal.sema_acquire(va, sema.threshold(), out);
            }
            FenceKind::Syncpt { syncpt, threshold } => {
                let window = self.syncpt_window(SyncMap::SyncptRo)?;
                self.hal.syncpt_wait(syncpt.id(), *threshold, window, out);
            }
        }

        Ok(())
    }

    fn wait_fd(&self, fd: i32, out: &mut Vec<u32>) -> Result {
        let sync_file = self.sync_file.as_ref().ok_or(ENOTSUPP)?;
        let fences = sync_file.lookup(fd)?;

        out.reserve(fences.len() * self.hal.wait_cmd_words());
        fences.iter().try_for_each(|f| self.wait(f, out))
    }
}

/// Signals through a semaphore of the sea.
struct SemaphoreSync {
    ctx: SyncCtx,
    hw: Arc<HwSemaphore>,
}

impl ChannelSync for SemaphoreSync {
    fn wait_fence(&self, fence: &Fence, out: &mut Vec<u32>) -> Result {
        self.ctx.wait(fence, out)
    }

    fn wait_fence_fd(&self, fd: i32, out: &mut Vec<u32>) -> Result {
        self.ctx.wait_fd(fd, out)
    }

    fn incr(&self, wfi: bool, slot: Option<FenceSlot>, out: &mut Vec<u32>) -> Result<Arc<Fence>> {
        let va = self.ctx.sema_window(SyncMap::SemaphoreRw)? + self.hw.offset();
        let value = self.hw.incr_max();
        self.ctx.hal.sema_release(va, value, wfi, out);

        let kind = FenceKind::Semaphore {
            sema: Semaphore::new(self.hw.clone(), value),
            sea: self.ctx.sea.clone(),
        };

        Ok(Fence::new(kind, slot, self.ctx.is_silicon))
    }

    fn set_min_eq_max(&self) {
        self.hw.set_min_eq_max();
    }
}

/// Signals through a syncpoint.
struct SyncptSync {
    ctx: SyncCtx,
    syncpt: Arc<Syncpt>,
}

impl ChannelSync for SyncptSync {
    fn wait_fence(&self, fence: &Fence, out: &mut Vec<u32>) -> Result {
        self.ctx.wait(fence, out)
    }

    fn wait_fence_fd(&self, fd: i32, out: &mut Vec<u32>) -> Result {
        self.ctx.wait_fd(fd, out)
    }

    fn incr(&self, wfi: bool, slot: Option<FenceSlot>, out: &mut Vec<u32>) -> Result<Arc<Fence>> {
        let window = self.ctx.syncpt_window(SyncMap::SyncptRw)?;
        self.ctx.hal.syncpt_incr(self.syncpt.id(), wfi, window, out);
        let threshold = self.syncpt.incr_max(1);

        let kind = FenceKind::Syncpt {
            syncpt: self.syncpt.clone(),
            threshold,
        };

        Ok(Fence::new(kind, slot, self.ctx.is_silicon))
    }

    fn set_min_eq_max(&self) {
        self.syncpt.set_min_eq_max();
    }
}

/// Creates the synchronization backend of channel `chid`.
pub(crate) fn create(
    gpu: &Gpu,
    vm: &Arc<Vm>,
    chid: u32,
    use_syncpoint: bool,
) -> Result<Box<dyn ChannelSync>> {
    let ctx = SyncCtx::new(gpu, vm);

    if use_syncpoint {
        let host1x = gpu.platform.host1x.as_ref().ok_or(ENOTSUPP)?;
        let syncpt = Syncpt::alloc(host1x, &format!("{}_{}", gpu.chipset().name(), chid))?;
        debug!("channel {}: syncpoint {}", chid, syncpt.id());

        return Ok(Box::new(SyncptSync { ctx, syncpt }));
    }

    let hw = gpu.sema_sea.alloc()?;
    debug!("channel {}: semaphore at {:#x}", chid, hw.offset());

    Ok(Box::new(SemaphoreSync { ctx, hw }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Chipset;
    use crate::sim::{self, TestSyncFile};
    use crate::util::{hi32, lo32};
    use pretty_assertions::assert_eq;

    #[test]
    fn syncpt_wait_targets_the_window() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "sync").unwrap();
        let host1x = gpu.platform.host1x.clone().unwrap();
        let other = create(&gpu, &vm, 0, true).unwrap();

        let target = Syncpt::alloc(&host1x, "target").unwrap();
        let fence = Fence::new(
            FenceKind::Syncpt {
                syncpt: target.clone(),
                threshold: 7,
            },
            None,
            true,
        );

        let mut out = Vec::new();
        other.wait_fence(&fence, &mut out).unwrap();

        let window = vm.sync_va(SyncMap::SyncptRo).unwrap();
        let va = window + u64::from(target.id()) * 4;
        assert_eq!(
            out,
            vec![
                0x20010017,
                lo32(va),
                0x20010018,
                hi32(va),
                0x20010019,
                7,
                0x2001001a,
                0,
                0x2001001b,
                0x2 | (1 << 12),
            ]
        );
    }

    #[test]
    fn semaphore_incr_then_wait() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "sync").unwrap();
        let sync = create(&gpu, &vm, 3, false).unwrap();

        let mut out = Vec::new();
        let fence = sync.incr(true, None, &mut out).unwrap();
        assert_eq!(out.len(), 10);
        assert!(!fence.is_expired());

        let rw = vm.sync_va(SyncMap::SemaphoreRw).unwrap();
        let sema = fence.semaphore().unwrap();
        assert_eq!(out[1], lo32(rw + sema.hw().offset()));
        assert_eq!(out[5], 1);

        // A second channel waits on it through the read-only window.
        let waiter = create(&gpu, &vm, 4, false).unwrap();
        let mut wait = Vec::new();
        waiter.wait_fence(&fence, &mut wait).unwrap();
        let ro = vm.sync_va(SyncMap::SemaphoreRo).unwrap();
        assert_eq!(wait[1], lo32(ro + sema.hw().offset()));
        assert_eq!(wait[9], 0x2 | (1 << 12));

        sync.set_min_eq_max();
        assert!(fence.is_expired());
        wait.clear();
        waiter.wait_fence(&fence, &mut wait).unwrap();
        assert!(wait.is_empty());
    }

    #[test]
    fn wait_fence_fd_expands_every_fence() {
        let sync_file = Arc::new(TestSyncFile::default());
        let mut platform = sim::platform();
        platform.sync_file = Some(sync_file.clone());
        let (_sim, gpu) = sim::probe(Chipset::GP10B, Default::default(), platform);
        gpu.init().unwrap();

        let vm = gpu.create_vm(0, "sync").unwrap();
        let sync = create(&gpu, &vm, 0, false).unwrap();
        let mut scratch = Vec::new();
        let fences = (0..3)
            .map(|_| sync.incr(false, None, &mut scratch).unwrap())
            .collect::<Vec<_>>();
        sync_file.insert(5, fences);

        let mut out = Vec::new();
        sync.wait_fence_fd(5, &mut out).unwrap();
        assert_eq!(out.len(), 3 * 8);

        assert_eq!(sync.wait_fence_fd(6, &mut out), Err(EINVAL));
    }

    #[test]
    fn syncpoints_need_host1x() {
        let mut platform = sim::platform();
        platform.host1x = None;
        let (_sim, gpu) = sim::probe(Chipset::GV11B, Default::default(), platform);
        gpu.init().unwrap();
        let vm = gpu.create_vm(0, "sync").unwrap();

        assert!(matches!(create(&gpu, &vm, 0, true), Err(ENOTSUPP)));
    }
}
