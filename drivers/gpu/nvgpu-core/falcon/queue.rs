// SPDX-License-Identifier: GPL-2.0

//! Command and message queues of the falcon RTOS.
//!
//! Once the PMU or SEC2 runs its RTOS, it announces a command queue and a message queue placed
//! in its DMEM. The host writes commands at the command queue head and reads replies at the
//! message queue tail; the RTOS owns the other two pointers.

use core::marker::PhantomData;
use core::mem::size_of;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{self, code::*, Result};
use crate::falcon::{Falcon, FalconEngine};
use crate::io::Bar0;
use crate::transmute::{frombytes_at, AsBytes, FromBytes};
use crate::util;

/// Falcon engine that runs an RTOS with host queues.
pub(crate) trait RtosEngine: FalconEngine {
    const CMDQ_HEAD: usize;
    const CMDQ_TAIL: usize;
    const MSGQ_HEAD: usize;
    const MSGQ_TAIL: usize;
}

/// Header leading every command and message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueHeader {
    pub(crate) unit_id: u8,
    /// Size of the whole record, header included.
    pub(crate) size: u8,
    pub(crate) ctrl_flags: u8,
    pub(crate) seq_id: u8,
}

// SAFETY: all fields are `u8`, no padding.
unsafe impl FromBytes for QueueHeader {}
// SAFETY: as above.
unsafe impl AsBytes for QueueHeader {}

pub(crate) const QUEUE_HEADER_SIZE: u32 = size_of::<QueueHeader>() as u32;

/// Record telling the reader to continue at the start of the queue.
pub(crate) const UNIT_REWIND: u8 = 0x00;
pub(crate) const UNIT_INIT: u8 = 0x01;
pub(crate) const UNIT_ACR: u8 = 0x0a;

pub(crate) const CMDQ_ID: u8 = 0;
pub(crate) const MSGQ_ID: u8 = 1;

/// Placement of one queue, as announced by the init message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InitMsgQueue {
    pub(crate) offset: u32,
    pub(crate) size: u16,
    pub(crate) index: u8,
    pub(crate) id: u8,
}

/// First message posted by the RTOS.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InitMsg {
    pub(crate) hdr: QueueHeader,
    pub(crate) msg_type: u8,
    pub(crate) num_queues: u8,
    pub(crate) pad: u16,
    pub(crate) queues: [InitMsgQueue; 2],
}

// SAFETY: integer fields only, laid out without padding.
unsafe impl FromBytes for InitMsgQueue {}
// SAFETY: as above.
unsafe impl AsBytes for InitMsgQueue {}
// SAFETY: as above.
unsafe impl FromBytes for InitMsg {}
// SAFETY: as above.
unsafe impl AsBytes for InitMsg {}

#[derive(Debug, Clone, Copy)]
struct QueueInfo {
    offset: u32,
    size: u32,
}

impl QueueInfo {
    fn end(&self) -> u32 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct RtosQueues {
    cmdq: QueueInfo,
    msgq: QueueInfo,
}

/// Host side of the RTOS queues of falcon `E`.
pub(crate) struct Rtos<E: RtosEngine> {
    queues: Mutex<Option<RtosQueues>>,
    seq: AtomicU8,
    _engine: PhantomData<E>,
}

impl<E: RtosEngine> Rtos<E> {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(None),
            seq: AtomicU8::new(0),
            _engine: PhantomData,
        }
    }

    /// Forget the queues, e.g. after the falcon has been reset.
    pub(crate) fn reset(&self) {
        *error::lock(&self.queues) = None;
    }

    /// Wait for the init message and record the queue placement it announces.
    pub(crate) fn wait_init(&self, falcon: &Falcon<E>, bar: &Bar0, timeout: Duration) -> Result {
        util::read_poll_timeout(
            || Ok(bar.read32(E::MSGQ_HEAD) != bar.read32(E::MSGQ_TAIL)),
            |pending| *pending,
            Duration::from_micros(10),
            timeout,
        )
        .map_err(|_| {
            warn!("rtos {:?}: no init message", E::FALCON_ID);
            ETIMEDOUT
        })?;

        let tail = bar.read32(E::MSGQ_TAIL);
        let mut raw = [0u8; size_of::<InitMsg>()];
        falcon.copy_from_dmem(bar, tail, &mut raw, 0)?;
        let msg: InitMsg = frombytes_at(&raw, 0)?;

        if msg.hdr.unit_id != UNIT_INIT || msg.num_queues != 2 {
            warn!("rtos {:?}: unexpected init message {:?}", E::FALCON_ID, msg.hdr);
            return Err(EINVAL);
        }

        let info = |id| {
            msg.queues
                .iter()
                .find(|q| q.id == id)
                .map(|q| QueueInfo {
                    offset: q.offset,
                    size: u32::from(q.size),
                })
                .ok_or(EINVAL)
        };
        let queues = RtosQueues {
            cmdq: info(CMDQ_ID)?,
            msgq: info(MSGQ_ID)?,
        };

        bar.write32(tail + align4(u32::from(msg.hdr.size)), E::MSGQ_TAIL);
        debug!("rtos {:?}: ready, {:?}", E::FALCON_ID, queues);
        *error::lock(&self.queues) = Some(queues);

        Ok(())
    }

    /// Post a command for `unit_id` and wait for its reply. Returns the reply payload.
    pub(crate) fn send(
        &self,
        falcon: &Falcon<E>,
        bar: &Bar0,
        unit_id: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let queues = error::lock(&self.queues);
        let q = queues.as_ref().ok_or(EINVAL)?;

        let size = u8::try_from(payload.len() + QUEUE_HEADER_SIZE as usize).map_err(|_| EINVAL)?;
        let seq_id = self.seq.fetch_add(1, Ordering::Relaxed);
        let hdr = QueueHeader {
            unit_id,
            size,
            ctrl_flags: 0,
            seq_id,
        };
        let mut msg = hdr.as_bytes().to_vec();
        msg.extend_from_slice(payload);

        self.push(falcon, bar, &q.cmdq, &msg)?;

        let reply = util::read_poll_timeout(
            || {
                while let Some((hdr, body)) = self.pop(falcon, bar, &q.msgq)? {
                    if hdr.unit_id == unit_id && hdr.seq_id == seq_id {
                        return Ok(Some(body));
                    }
                    debug!("rtos {:?}: dropping unsolicited {:?}", E::FALCON_ID, hdr);
                }
                Ok(None)
            },
            Option::is_some,
            Duration::from_micros(10),
            timeout,
        )
        .map_err(|e| match e {
            EBUSY => {
                warn!("rtos {:?}: no reply to command {}", E::FALCON_ID, seq_id);
                ETIMEDOUT
            }
            e => e,
        })?;

        reply.ok_or(ETIMEDOUT)
    }

    fn push(&self, falcon: &Falcon<E>, bar: &Bar0, q: &QueueInfo, msg: &[u8]) -> Result {
        let size = align4(msg.len() as u32);
        let tail = bar.read32(E::CMDQ_TAIL);
        let mut head = bar.read32(E::CMDQ_HEAD);

        if head >= tail && head + size > q.end() {
            if tail == q.offset {
                return Err(EBUSY);
            }
            if q.end() - head >= QUEUE_HEADER_SIZE {
                let rewind = QueueHeader {
                    unit_id: UNIT_REWIND,
                    size: QUEUE_HEADER_SIZE as u8,
                    ..Default::default()
                };
                falcon.copy_to_dmem(bar, head, rewind.as_bytes(), 0)?;
            }
            head = q.offset;
        }
        if head < tail && head + size >= tail {
            return Err(EBUSY);
        }

        falcon.copy_to_dmem(bar, head, msg, 0)?;
        bar.write32(head + size, E::CMDQ_HEAD);

        Ok(())
    }

    fn pop(
        &self,
        falcon: &Falcon<E>,
        bar: &Bar0,
        q: &QueueInfo,
    ) -> Result<Option<(QueueHeader, Vec<u8>)>> {
        loop {
            let head = bar.read32(E::MSGQ_HEAD);
            let mut tail = bar.read32(E::MSGQ_TAIL);
            if head == tail {
                return Ok(None);
            }

            let mut raw = [0u8; size_of::<QueueHeader>()];
            falcon.copy_from_dmem(bar, tail, &mut raw, 0)?;
            let hdr: QueueHeader = frombytes_at(&raw, 0)?;

            if hdr.unit_id == UNIT_REWIND {
                bar.write32(q.offset, E::MSGQ_TAIL);
                continue;
            }
            if u32::from(hdr.size) < QUEUE_HEADER_SIZE {
                warn!("rtos {:?}: corrupted message queue", E::FALCON_ID);
                return Err(EINVAL);
            }

            let mut body = vec![0u8; usize::from(hdr.size) - size_of::<QueueHeader>()];
            falcon.copy_from_dmem(bar, tail + QUEUE_HEADER_SIZE, &mut body, 0)?;
            tail += align4(u32::from(hdr.size));
            bar.write32(tail, E::MSGQ_TAIL);

            return Ok(Some((hdr, body)));
        }
    }
}

fn align4(v: u32) -> u32 {
    (v + 3) & !3
}
