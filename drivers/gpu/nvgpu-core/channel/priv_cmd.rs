// SPDX-License-Identifier: GPL-2.0

//! Private command buffer.
//!
//! Wait and increment snippets generated for a submission are written here and referenced from
//! the GPFIFO like any user push buffer. Allocations are retired in order with their job.

use std::sync::Arc;

use crate::dma::{Aperture, DmaAllocator, DmaObject};
use crate::error::{code::*, Result};
use crate::mm::vm::{MapFlags, Vm};

/// One snippet in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrivCmdEntry {
    /// Offset in words.
    pub(crate) offset: u32,
    pub(crate) words: u32,
    pub(crate) va: u64,
}

/// Ring of private command space.
pub(crate) struct PrivCmdQueue {
    mem: Arc<DmaObject>,
    va: u64,
    size: u32,
    put: u32,
    get: u32,
    outstanding: usize,
}

impl PrivCmdQueue {
    pub(crate) fn new(dma: &DmaAllocator, vm: &Vm, words: u32) -> Result<Self> {
        let words = words.max(2).next_power_of_two();
        let mem = dma.alloc(words as usize * 4, Aperture::Sysmem)?;
        let va = vm.map(&mem, MapFlags::KERNEL | MapFlags::READ_ONLY, 0)?;

        Ok(Self {
            mem,
            va,
            size: words,
            put: 0,
            get: 0,
            outstanding: 0,
        })
    }

    pub(crate) fn va(&self) -> u64 {
        self.va
    }

    /// Reserves `n` contiguous words and fills them with `cmd`.
    pub(crate) fn push(&mut self, cmd: &[u32]) -> Result<PrivCmdEntry> {
        let n = u32::try_from(cmd.len()).map_err(|_| EINVAL)?;
        if n == 0 || n > self.size / 2 {
            return Err(EINVAL);
        }

        // `put == get` only when empty; the wrapped region never fills completely.
        let offset = if self.put >= self.get {
            if self.put + n <= self.size {
                self.put
            } else if n < self.get {
                0
            } else {
                return Err(EBUSY);
            }
        } else if self.put + n < self.get {
            self.put
        } else {
            return Err(EBUSY);
        };

        let bytes = cmd.iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<_>>();
        self.mem.wr_n(offset as usize * 4, &bytes)?;
        self.put = offset + n;
        self.outstanding += 1;

        Ok(PrivCmdEntry {
            offset,
            words: n,
            va: self.va + u64::from(offset) * 4,
        })
    }

    /// Releases `entry`, which must be the oldest outstanding one.
    pub(crate) fn free(&mut self, entry: &PrivCmdEntry) {
        self.get = entry.offset + entry.words;
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.put = 0;
            self.get = 0;
        }
    }

    /// Takes back `entry`, which must be the newest one, after the submission it was built for
    /// failed.
    pub(crate) fn rollback(&mut self, entry: &PrivCmdEntry) {
        self.put = entry.offset;
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.put = 0;
            self.get = 0;
        }
    }

    /// Unmaps the buffer from `vm`.
    pub(crate) fn unmap(&self, vm: &Vm) {
        let _ = vm.unmap(self.va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Chipset;
    use crate::sim;
    use pretty_assertions::assert_eq;

    #[test]
    fn wraps_and_retires_in_order() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "priv").unwrap();
        let mut q = PrivCmdQueue::new(&gpu.dma, &vm, 16).unwrap();

        let a = q.push(&[1; 6]).unwrap();
        let b = q.push(&[2; 6]).unwrap();
        assert_eq!((a.offset, b.offset), (0, 6));
        assert_eq!(b.va, q.va() + 24);

        // Four words left at the end, and `a` still holds the start.
        assert_eq!(q.push(&[3; 6]), Err(EBUSY));

        q.free(&a);
        let c = q.push(&[3; 5]).unwrap();
        assert_eq!(c.offset, 0);
        assert_eq!(q.push(&[4; 2]), Err(EBUSY));

        q.free(&b);
        q.free(&c);
        assert_eq!(q.push(&[5; 8]).unwrap().offset, 0);
        assert_eq!(q.push(&[0; 9]), Err(EINVAL));
    }
}
