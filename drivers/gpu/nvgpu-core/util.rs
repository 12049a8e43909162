// SPDX-License-Identifier: GPL-2.0

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{code::*, Result};

pub(crate) const fn to_lowercase_bytes<const N: usize>(s: &str) -> [u8; N] {
    let src = s.as_bytes();
    let mut dst = [0; N];
    let mut i = 0;

    while i < src.len() && i < N {
        dst[i] = (src[i] as char).to_ascii_lowercase() as u8;
        i += 1;
    }

    dst
}

pub(crate) const fn const_bytes_to_str(bytes: &[u8]) -> &str {
    match core::str::from_utf8(bytes) {
        Ok(string) => string,
        Err(_) => panic!("Bytes are not valid UTF-8."),
    }
}

/// Polls `op` every `sleep` until `cond` accepts its value, `op` fails, or `timeout` expires.
///
/// Expiry returns `Err(EBUSY)`: this is meant for hardware polls (idle, halt, scrub, preempt).
/// Blocking waits exposed to users report `ETIMEDOUT` on their own.
#[track_caller]
pub(crate) fn read_poll_timeout<Op, Cond, T>(
    mut op: Op,
    mut cond: Cond,
    sleep: Duration,
    timeout: Duration,
) -> Result<T>
where
    Op: FnMut() -> Result<T>,
    Cond: FnMut(&T) -> bool,
{
    let start = Instant::now();

    loop {
        let val = op()?;
        if cond(&val) {
            return Ok(val);
        }

        if start.elapsed() > timeout {
            return Err(EBUSY);
        }

        if sleep.is_zero() {
            std::hint::spin_loop();
        } else {
            thread::sleep(sleep);
        }
    }
}

/// Busy-waits for `delay`. Used for reset settle times.
pub(crate) fn udelay(delay: Duration) {
    let start = Instant::now();
    while start.elapsed() < delay {
        std::hint::spin_loop();
    }
}

#[inline]
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub(crate) const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub(crate) const fn lo32(value: u64) -> u32 {
    value as u32
}

#[inline]
pub(crate) const fn hi32(value: u64) -> u32 {
    (value >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_times_out_busy() {
        let res = read_poll_timeout(
            || Ok(0u32),
            |v| *v == 1,
            Duration::ZERO,
            Duration::from_millis(2),
        );
        assert_eq!(res, Err(EBUSY));
    }

    #[test]
    fn poll_returns_value() {
        let mut n = 0;
        let res = read_poll_timeout(
            || {
                n += 1;
                Ok(n)
            },
            |v| *v == 3,
            Duration::ZERO,
            Duration::from_secs(1),
        );
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0x101, 0x100), 0x200);
        assert_eq!(align_up(0x100, 0x100), 0x100);
        assert_eq!(align_down(0x1ff, 0x100), 0x100);
    }
}
