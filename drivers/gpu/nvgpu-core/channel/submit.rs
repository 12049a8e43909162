// SPDX-License-Identifier: GPL-2.0

//! Job submission.
//!
//! A job is a run of GPFIFO entries, framed by an optional wait snippet and by the increment
//! that signals its fence. Jobs retire in order once their fence expired, which releases their
//! GPFIFO entries and private command space.

use std::sync::Arc;

use log::{debug, warn};

use crate::channel::priv_cmd::PrivCmdEntry;
use crate::channel::{Channel, ChannelEvent, Ring, GPFIFO_ENTRY_SIZE};
use crate::error::{self, code::*, Result};
use crate::fence::Fence;
use crate::fifo;
use crate::util::{hi32, lo32};

/// Largest push buffer segment one GPFIFO entry can reference, in words.
const GPFIFO_ENTRY_MAX_WORDS: u32 = (1 << 21) - 1;
const GPFIFO_ENTRY1_LENGTH_SHIFT: u32 = 10;

/// A push buffer segment to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpfifoEntry {
    pub va: u64,
    /// Length in 32-bit words.
    pub words: u32,
}

impl GpfifoEntry {
    fn encode(&self) -> (u32, u32) {
        (
            lo32(self.va) & !0x3,
            (hi32(self.va) & 0xff) | (self.words << GPFIFO_ENTRY1_LENGTH_SHIFT),
        )
    }
}

/// What a job waits for before it runs.
#[derive(Clone)]
pub enum FenceWait {
    Fence(Arc<Fence>),
    /// OS fence behind a file descriptor.
    Fd(i32),
}

#[derive(Clone, Default)]
pub struct SubmitArgs {
    pub wait: Option<FenceWait>,
    /// Return the fence of the job.
    pub get_fence: bool,
    /// Signal without waiting for the engine to idle.
    pub suppress_wfi: bool,
}

pub(crate) struct Job {
    /// GPFIFO put pointer after the job.
    pub(crate) gp_end: u32,
    pub(crate) fence: Arc<Fence>,
    priv_cmds: Vec<PrivCmdEntry>,
}

impl Channel {
    fn free_entries(&self, ring: &Ring) -> u32 {
        // One entry stays empty so that a full ring is told apart from an empty one.
        ring.get.wrapping_sub(ring.put).wrapping_sub(1) & (self.num_entries - 1)
    }

    fn push_entry(&self, ring: &mut Ring, entry: GpfifoEntry) {
        let (w0, w1) = entry.encode();
        let off = ring.put as usize * GPFIFO_ENTRY_SIZE;

        self.gpfifo.wr32(off, w0);
        self.gpfifo.wr32(off + 4, w1);
        ring.put = (ring.put + 1) & (self.num_entries - 1);
    }

    /// Retires the completed jobs, oldest first.
    fn retire(&self, ring: &mut Ring) -> usize {
        let mut retired = 0;

        while ring.jobs.front().is_some_and(|job| job.fence.is_expired()) {
            let Some(job) = ring.jobs.pop_front() else {
                break;
            };
            ring.get = job.gp_end;
            for entry in &job.priv_cmds {
                ring.priv_cmd.free(entry);
            }
            retired += 1;
        }

        retired
    }

    /// Retires the jobs whose fence expired. Returns how many were retired.
    pub fn update_jobs(&self) -> usize {
        let mut ring = error::lock(&self.ring);
        self.retire(&mut ring)
    }

    /// Number of submitted jobs not yet retired.
    pub fn jobs_in_flight(&self) -> usize {
        error::lock(&self.ring).jobs.len()
    }

    /// Queues `entries` on the channel as one job.
    ///
    /// The job first waits for `args.wait` if given, and signals its fence when done. The fence
    /// is returned when `args.get_fence` is set.
    pub fn submit(&self, entries: &[GpfifoEntry], args: SubmitArgs) -> Result<Option<Arc<Fence>>> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(EINVAL);
        }
        if self.gpu.fifo.is_quiesced() || self.is_unserviceable() {
            return Err(EFATAL);
        }
        if self.tsg().is_none() {
            return Err(EINVAL);
        }
        if entries
            .iter()
            .any(|e| e.words == 0 || e.words > GPFIFO_ENTRY_MAX_WORDS)
        {
            return Err(EINVAL);
        }

        let mut wait_cmd = Vec::new();
        match &args.wait {
            Some(FenceWait::Fence(fence)) => self.sync.wait_fence(fence, &mut wait_cmd)?,
            Some(FenceWait::Fd(fd)) => self.sync.wait_fence_fd(*fd, &mut wait_cmd)?,
            None => (),
        }

        let mut ring = error::lock(&self.ring);
        self.retire(&mut ring);

        let needed = entries.len() + usize::from(!wait_cmd.is_empty()) + 1;
        if needed > self.free_entries(&ring) as usize {
            debug!("channel {}: GPFIFO full", self.chid);
            return Err(EBUSY);
        }

        let slot = match &self.fence_pool {
            Some(pool) => Some(pool.acquire().map_err(|_| EBUSY)?),
            None => None,
        };

        let mut incr_cmd = Vec::new();
        let fence = self.sync.incr(!args.suppress_wfi, slot, &mut incr_cmd)?;

        let mut priv_cmds = Vec::with_capacity(2);
        if !wait_cmd.is_empty() {
            priv_cmds.push(ring.priv_cmd.push(&wait_cmd)?);
        }
        match ring.priv_cmd.push(&incr_cmd) {
            Ok(entry) => priv_cmds.push(entry),
            Err(e) => {
                if let Some(wait) = priv_cmds.pop() {
                    ring.priv_cmd.rollback(&wait);
                }
                return Err(e);
            }
        }

        let (wait, incr) = match priv_cmds.as_slice() {
            [wait, incr] => (Some(*wait), *incr),
            [incr] => (None, *incr),
            _ => return Err(EINVAL),
        };

        if let Some(wait) = wait {
            self.push_entry(&mut ring, GpfifoEntry { va: wait.va, words: wait.words });
        }
        for entry in entries {
            self.push_entry(&mut ring, *entry);
        }
        self.push_entry(&mut ring, GpfifoEntry { va: incr.va, words: incr.words });

        let put = ring.put;
        ring.jobs.push_back(Job {
            gp_end: put,
            fence: fence.clone(),
            priv_cmds,
        });
        drop(ring);

        self.userd.wr32(self.userd_offset + fifo::USERD_GP_PUT, put);
        self.gpu.fifo.ring_doorbell(&self.gpu.bar, self.chid);

        debug!(
            "channel {}: submitted {} entries, put {}",
            self.chid,
            entries.len(),
            put
        );

        if !args.get_fence {
            return Ok(None);
        }

        if let Some(sync_file) = &self.gpu.platform.sync_file {
            match sync_file.create(&fence) {
                Ok(os_fence) => fence.set_os_fence(os_fence),
                Err(e) => warn!("channel {}: no OS fence: {:?}", self.chid, e),
            }
        }

        Ok(Some(fence))
    }

    /// Posts [`ChannelEvent::Blocking`] if the channel has jobs waiting.
    pub(crate) fn post_blocking_event(&self) {
        if self.jobs_in_flight() > 0 {
            self.post_event(ChannelEvent::Blocking);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelParams;
    use crate::gpu::Chipset;
    use crate::sim;
    use crate::tsg::Tsg;
    use pretty_assertions::assert_eq;

    const NOP: GpfifoEntry = GpfifoEntry {
        va: 0x1_0000_1000,
        words: 4,
    };

    #[test]
    fn entry_encoding() {
        let entry = GpfifoEntry {
            va: 0x12_3456_7890,
            words: 6,
        };
        assert_eq!(entry.encode(), (0x3456_7890, 0x12 | (6 << 10)));
    }

    #[test]
    fn submit_needs_a_tsg() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "submit").unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();

        assert!(matches!(ch.submit(&[NOP], SubmitArgs::default()), Err(EINVAL)));
    }

    #[test]
    fn submit_writes_ring_and_rings_doorbell() {
        let (sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "submit").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();

        let fence = ch
            .submit(
                &[NOP],
                SubmitArgs {
                    get_fence: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        // The user entry, then the increment.
        let (gpfifo, _, _) = ch.gpfifo();
        assert_eq!(gpfifo.rd32(0), 0x1000);
        assert_eq!(gpfifo.rd32(4), 0x1 | (4 << 10));
        assert_eq!(gpfifo.rd32(12) >> 10, 10);

        let (userd, offset) = ch.userd();
        assert_eq!(userd.rd32(offset + fifo::USERD_GP_PUT), 2);
        assert_eq!(sim.doorbells(), vec![ch.chid()]);

        assert!(!fence.is_expired());
        assert_eq!(ch.jobs_in_flight(), 1);
        fence.semaphore().unwrap().hw().release(1);
        assert_eq!(ch.update_jobs(), 1);
        assert_eq!(ch.jobs_in_flight(), 0);
    }

    #[test]
    fn full_ring_is_busy() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "submit").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let params = ChannelParams {
            gpfifo_entries: 8,
            ..Default::default()
        };
        let ch = Channel::open(&gpu, &vm, params).unwrap();
        tsg.bind_channel(&ch).unwrap();

        // Seven usable entries: three jobs of two, then no room for a fourth.
        for _ in 0..3 {
            ch.submit(&[NOP], SubmitArgs::default()).unwrap();
        }
        assert!(matches!(ch.submit(&[NOP], SubmitArgs::default()), Err(EBUSY)));

        ch.sync.set_min_eq_max();
        ch.submit(&[NOP], SubmitArgs::default()).unwrap();
        assert_eq!(ch.jobs_in_flight(), 1);
    }

    #[test]
    fn fence_pool_bounds_jobs_in_flight() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "submit").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let params = ChannelParams {
            num_inflight_jobs: 2,
            ..Default::default()
        };
        let ch = Channel::open(&gpu, &vm, params).unwrap();
        tsg.bind_channel(&ch).unwrap();

        ch.submit(&[NOP], SubmitArgs::default()).unwrap();
        ch.submit(&[NOP], SubmitArgs::default()).unwrap();
        assert!(matches!(ch.submit(&[NOP], SubmitArgs::default()), Err(EBUSY)));
    }

    #[test]
    fn waits_are_framed_before_the_job() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "submit").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let a = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        let b = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&a).unwrap();
        tsg.bind_channel(&b).unwrap();

        let args = SubmitArgs {
            get_fence: true,
            ..Default::default()
        };
        let fence = a.submit(&[NOP], args).unwrap().unwrap();

        let args = SubmitArgs {
            wait: Some(FenceWait::Fence(fence)),
            ..Default::default()
        };
        b.submit(&[NOP], args).unwrap();

        // Wait snippet, user entry, increment.
        let (userd, offset) = b.userd();
        assert_eq!(userd.rd32(offset + fifo::USERD_GP_PUT), 3);
        let (gpfifo, _, _) = b.gpfifo();
        assert_eq!(gpfifo.rd32(4) >> 10, 10);
        assert_eq!(gpfifo.rd32(8), 0x1000);
    }

    #[test]
    fn unserviceable_channel_refuses_work() {
        let (_sim, gpu) = sim::test_gpu(Chipset::GV11B);
        let vm = gpu.create_vm(0, "submit").unwrap();
        let tsg = Tsg::open(&gpu).unwrap();
        let ch = Channel::open(&gpu, &vm, ChannelParams::default()).unwrap();
        tsg.bind_channel(&ch).unwrap();

        ch.abort(fifo::ErrorNotifier::PbdmaError);
        assert!(matches!(ch.submit(&[NOP], SubmitArgs::default()), Err(EFATAL)));
    }
}
