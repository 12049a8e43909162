// SPDX-License-Identifier: GPL-2.0

//! Method interface of the FECS context switch firmware.
//!
//! A method is a write of its data and address to the method registers. The firmware reports
//! completion, or the requested value, through a context switch mailbox.

use std::time::Duration;

use log::{debug, warn};

use crate::dma::{aperture_mask_raw, Aperture};
use crate::error::{code::*, Result};
use crate::io::Bar0;
use crate::regs;
use crate::util;

pub(crate) const METHOD_BIND_POINTER: u32 = 0x03;
pub(crate) const METHOD_WFI_GOLDEN_SAVE: u32 = 0x09;
pub(crate) const METHOD_DISCOVER_IMAGE_SIZE: u32 = 0x10;
pub(crate) const METHOD_DISCOVER_ZCULL_IMAGE_SIZE: u32 = 0x16;
pub(crate) const METHOD_DISCOVER_PREEMPTION_IMAGE_SIZE: u32 = 0x1a;
pub(crate) const METHOD_SET_WATCHDOG_TIMEOUT: u32 = 0x21;
pub(crate) const METHOD_DISCOVER_PM_IMAGE_SIZE: u32 = 0x25;

/// Mailbox value of a firmware that finished booting.
pub(crate) const MAILBOX0_READY: u32 = 1;
const BIND_POINTER_DONE: u32 = 0x10;
const BIND_POINTER_FAIL: u32 = 0x20;
const GOLDEN_SAVE_DONE: u32 = 1;
const WATCHDOG_DONE: u32 = 1;

pub(crate) const WATCHDOG_TIMEOUT: u32 = 0x7fff_ffff;

/// Condition on the mailbox that completes a method.
#[derive(Debug, Clone, Copy)]
enum Done {
    Eq(u32),
    /// Any value but the one given, which is then the method's result.
    Ne(u32),
}

/// A method and how its completion is reported.
#[derive(Debug, Clone, Copy)]
struct Method {
    addr: u32,
    data: u32,
    done: Done,
    fail: Option<u32>,
}

/// Issues `m` and returns the mailbox value that completed it.
///
/// Times out with `ETIMEDOUT`. A failure reported by the firmware is `EFATAL`.
fn submit(bar: &Bar0, m: Method, timeout: Duration) -> Result<u32> {
    regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX_CLEAR::from(u32::MAX).write(bar, 0);
    regs::NV_PGRAPH_PRI_FECS_METHOD_DATA::default()
        .set_value(m.data)
        .write(bar);
    regs::NV_PGRAPH_PRI_FECS_METHOD_PUSH::default()
        .set_addr(m.addr)
        .write(bar);

    let fail = m.fail;
    let value = util::read_poll_timeout(
        || Ok(regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::read(bar, 0).value()),
        |v| {
            Some(*v) == fail
                || match m.done {
                    Done::Eq(ok) => *v == ok,
                    Done::Ne(pending) => *v != pending,
                }
        },
        Duration::from_micros(2),
        timeout,
    )
    .map_err(|_| {
        warn!("fecs: method {:#x} timed out", m.addr);
        ETIMEDOUT
    })?;

    if Some(value) == fail {
        warn!("fecs: method {:#x} failed, mailbox {:#x}", m.addr, value);
        return Err(EFATAL);
    }

    debug!("fecs: method {:#x} ({:#x}) -> {:#x}", m.addr, m.data, value);
    Ok(value)
}

fn discover(bar: &Bar0, addr: u32, timeout: Duration) -> Result<u32> {
    submit(
        bar,
        Method {
            addr,
            data: 0,
            done: Done::Ne(0),
            fail: None,
        },
        timeout,
    )
}

/// Waits for the firmware to signal that it booted.
pub(crate) fn wait_ready(bar: &Bar0, timeout: Duration) -> Result {
    util::read_poll_timeout(
        || Ok(regs::NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX::read(bar, 0).value()),
        |v| *v == MAILBOX0_READY,
        Duration::from_micros(10),
        timeout,
    )
    .map(|_| ())
    .map_err(|_| {
        warn!("fecs: firmware not ready");
        ETIMEDOUT
    })
}

/// Context image sizes reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageSizes {
    pub(crate) golden: usize,
    pub(crate) zcull: usize,
    pub(crate) pm: usize,
}

pub(crate) fn discover_image_sizes(bar: &Bar0, timeout: Duration) -> Result<ImageSizes> {
    Ok(ImageSizes {
        golden: discover(bar, METHOD_DISCOVER_IMAGE_SIZE, timeout)? as usize,
        zcull: discover(bar, METHOD_DISCOVER_ZCULL_IMAGE_SIZE, timeout)? as usize,
        pm: discover(bar, METHOD_DISCOVER_PM_IMAGE_SIZE, timeout)? as usize,
    })
}

pub(crate) fn discover_preemption_size(bar: &Bar0, timeout: Duration) -> Result<usize> {
    discover(bar, METHOD_DISCOVER_PREEMPTION_IMAGE_SIZE, timeout).map(|v| v as usize)
}

pub(crate) fn set_watchdog(bar: &Bar0, value: u32, timeout: Duration) -> Result {
    submit(
        bar,
        Method {
            addr: METHOD_SET_WATCHDOG_TIMEOUT,
            data: value,
            done: Done::Eq(WATCHDOG_DONE),
            fail: None,
        },
        timeout,
    )
    .map(|_| ())
}

/// Makes the instance block at `inst_addr` the current context of the firmware.
pub(crate) fn bind_pointer(
    bar: &Bar0,
    inst_addr: u64,
    aperture: Aperture,
    honors_aperture: bool,
    timeout: Duration,
) -> Result {
    let target = aperture_mask_raw(honors_aperture, aperture, 3, 2, 0);
    let data = regs::NV_PGRAPH_PRI_FECS_CURRENT_CTX::default()
        .set_ptr((inst_addr >> 12) as u32)
        .set_target(target as u8)
        .set_valid(true)
        .raw();

    submit(
        bar,
        Method {
            addr: METHOD_BIND_POINTER,
            data,
            done: Done::Eq(BIND_POINTER_DONE),
            fail: Some(BIND_POINTER_FAIL),
        },
        timeout,
    )
    .map(|_| ())
}

/// Waits for GR to idle and saves the bound context.
pub(crate) fn golden_save(bar: &Bar0, timeout: Duration) -> Result {
    submit(
        bar,
        Method {
            addr: METHOD_WFI_GOLDEN_SAVE,
            data: 0,
            done: Done::Eq(GOLDEN_SAVE_DONE),
            fail: None,
        },
        timeout,
    )
    .map(|_| ())
}

/// Instance block address of the context loaded in GR, if any.
pub(crate) fn current_ctx(bar: &Bar0) -> Option<u64> {
    let cur = regs::NV_PGRAPH_PRI_FECS_CURRENT_CTX::read(bar);
    cur.valid().then(|| u64::from(cur.ptr()) << 12)
}

