// SPDX-License-Identifier: GPL-2.0

//! Hardware semaphores.
//!
//! Every semaphore of a device lives in one buffer, the sea, which is mapped read-only and
//! read-write into each address space that uses semaphores. A semaphore is a 32-bit counter the
//! GPU writes on release; a [`Semaphore`] pairs it with the value a waiter expects.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::dma::{Aperture, DmaAllocator, DmaObject};
use crate::error::{self, code::*, Result};
use crate::id_pool::IdPool;

/// Bytes per semaphore slot.
pub(crate) const SEMAPHORE_SIZE: usize = 16;
pub(crate) const SEA_SLOTS: usize = 1024;

/// Longest time a waiter sleeps before rechecking its condition.
const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Pool of the semaphores of one device.
pub struct SemaphoreSea {
    dma: DmaAllocator,
    aperture: Aperture,
    mem: Mutex<Option<Arc<DmaObject>>>,
    slots: Mutex<IdPool>,
    /// Bumped on every wake-up.
    generation: Mutex<u64>,
    cond: Condvar,
}

impl SemaphoreSea {
    pub(crate) fn new(dma: DmaAllocator, aperture: Aperture) -> Self {
        Self {
            dma,
            aperture,
            mem: Mutex::new(None),
            slots: Mutex::new(IdPool::with_capacity(SEA_SLOTS)),
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Backing buffer, allocated on first use.
    pub(crate) fn mem(&self) -> Result<Arc<DmaObject>> {
        let mut mem = error::lock(&self.mem);
        if let Some(mem) = mem.as_ref() {
            return Ok(mem.clone());
        }

        let sea = self.dma.alloc(SEA_SLOTS * SEMAPHORE_SIZE, self.aperture)?;
        debug!("semaphore sea: {:#x} bytes at {:#x}", sea.size(), sea.addr());
        *mem = Some(sea.clone());

        Ok(sea)
    }

    /// Allocates a semaphore, initialized to zero.
    pub(crate) fn alloc(self: &Arc<Self>) -> Result<Arc<HwSemaphore>> {
        let mem = self.mem()?;
        let slot = error::lock(&self.slots).acquire_next_id(0).ok_or(ENOMEM)?;
        mem.wr32(slot * SEMAPHORE_SIZE, 0);

        Ok(Arc::new(HwSemaphore {
            sea: self.clone(),
            slot,
            mem,
            max: Mutex::new(0),
        }))
    }

    pub(crate) fn slots_in_use(&self) -> usize {
        error::lock(&self.slots).used()
    }

    /// Wakes every thread blocked in [`SemaphoreSea::wait_until`].
    pub(crate) fn wake_all(&self) {
        *error::lock(&self.generation) += 1;
        self.cond.notify_all();
    }

    /// Blocks until `cond` holds or `timeout` expires. `cond` is rechecked on every wake-up and
    /// at least once per millisecond, since a GPU write does not always raise an interrupt.
    pub(crate) fn wait_until(&self, mut cond: impl FnMut() -> bool, timeout: Duration) -> Result {
        let start = Instant::now();
        let mut generation = error::lock(&self.generation);

        loop {
            if cond() {
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ETIMEDOUT);
            }

            let slice = WAIT_SLICE.min(timeout - elapsed);
            generation = match self.cond.wait_timeout(generation, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// One semaphore of the sea.
pub(crate) struct HwSemaphore {
    sea: Arc<SemaphoreSea>,
    slot: usize,
    mem: Arc<DmaObject>,
    /// Value of the last release handed out.
    max: Mutex<u32>,
}

impl HwSemaphore {
    /// Offset in the sea, and so in its mappings.
    pub(crate) fn offset(&self) -> u64 {
        (self.slot * SEMAPHORE_SIZE) as u64
    }

    /// Current value.
    pub(crate) fn read(&self) -> u32 {
        self.mem.rd32(self.slot * SEMAPHORE_SIZE)
    }

    /// Reserves the next release value.
    pub(crate) fn incr_max(&self) -> u32 {
        let mut max = error::lock(&self.max);
        *max = max.wrapping_add(1);
        *max
    }

    pub(crate) fn max(&self) -> u32 {
        *error::lock(&self.max)
    }

    /// Writes the highest value handed out, releasing every pending waiter.
    pub(crate) fn set_min_eq_max(&self) {
        let max = error::lock(&self.max);
        self.mem.wr32(self.slot * SEMAPHORE_SIZE, *max);
        drop(max);
        self.sea.wake_all();
    }

    /// Writes `value` from the CPU.
    pub(crate) fn release(&self, value: u32) {
        self.mem.wr32(self.slot * SEMAPHORE_SIZE, value);
        self.sea.wake_all();
    }

    pub(crate) fn sea(&self) -> &Arc<SemaphoreSea> {
        &self.sea
    }
}

impl Drop for HwSemaphore {
    fn drop(&mut self) {
        error::lock(&self.sea.slots).release_id(self.slot);
    }
}

/// A semaphore and the value it has to reach.
#[derive(Clone)]
pub(crate) struct Semaphore {
    hw: Arc<HwSemaphore>,
    threshold: u32,
}

impl Semaphore {
    pub(crate) fn new(hw: Arc<HwSemaphore>, threshold: u32) -> Self {
        Self { hw, threshold }
    }

    pub(crate) fn hw(&self) -> &Arc<HwSemaphore> {
        &self.hw
    }

    pub(crate) fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether the semaphore reached the threshold. Matches the unsigned `>=` of the acquire
    /// the GPU executes.
    pub(crate) fn is_released(&self) -> bool {
        self.hw.read() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sea() -> Arc<SemaphoreSea> {
        Arc::new(SemaphoreSea::new(
            DmaAllocator::new(false, false),
            Aperture::Sysmem,
        ))
    }

    #[test]
    fn released_iff_value_reaches_threshold() {
        let sea = sea();
        let hw = sea.alloc().unwrap();
        let s = Semaphore::new(hw.clone(), 3);

        for (value, released) in [(0, false), (2, false), (3, true), (9, true)] {
            hw.release(value);
            assert_eq!(s.is_released(), released, "value {}", value);
        }

        // The top bit set is still greater than the threshold.
        let s = Semaphore::new(hw.clone(), 1);
        hw.release(0x8000_0001);
        assert!(s.is_released());
        hw.release(0);
        assert!(!s.is_released());
    }

    #[test]
    fn slots_are_recycled() {
        let sea = sea();
        let a = sea.alloc().unwrap();
        let b = sea.alloc().unwrap();
        assert_eq!(b.offset(), SEMAPHORE_SIZE as u64);
        assert_eq!(sea.slots_in_use(), 2);

        drop(a);
        assert_eq!(sea.slots_in_use(), 1);
        assert_eq!(sea.alloc().unwrap().offset(), 0);
    }

    #[test]
    fn set_min_eq_max_releases_waiters() {
        let sea = sea();
        let hw = sea.alloc().unwrap();
        let t1 = hw.incr_max();
        let t2 = hw.incr_max();
        assert_eq!((t1, t2), (1, 2));

        hw.set_min_eq_max();
        assert!(Semaphore::new(hw.clone(), t2).is_released());
    }

    #[test]
    fn wait_returns_once_released() {
        let sea = sea();
        let hw = sea.alloc().unwrap();
        let s = Semaphore::new(hw.clone(), 1);

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            hw.release(1);
        });

        sea.wait_until(|| s.is_released(), Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let sea = sea();
        let s = Semaphore::new(sea.alloc().unwrap(), 1);

        assert_eq!(
            sea.wait_until(|| s.is_released(), Duration::from_millis(3)),
            Err(ETIMEDOUT)
        );
    }
}
