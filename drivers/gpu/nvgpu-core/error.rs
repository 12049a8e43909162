// SPDX-License-Identifier: GPL-2.0

//! Error codes returned by the core.
//!
//! Callers match on [`Error`], while the core itself mostly uses the constants in [`code`] so
//! that error paths read like `return Err(EINVAL)`.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Failure classes surfaced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Bad argument: unaligned copy, out-of-range id, missing HAL operation.
    #[error("invalid argument")]
    Invalid,
    /// A DMA buffer, page directory, blob or context allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// A bounded hardware poll expired (idle, halt, scrub, preempt).
    #[error("hardware busy")]
    Busy,
    /// A user-facing bounded wait expired (fence, context-switch acknowledgement).
    #[error("timed out")]
    TimedOut,
    /// The running chip lacks the requested capability.
    #[error("not supported")]
    NotSupported,
    /// Unrecoverable bring-up failure.
    #[error("fatal hardware error")]
    Fatal,
}

/// Short names for [`Error`] variants.
pub mod code {
    use super::Error;

    pub const EINVAL: Error = Error::Invalid;
    pub const ENOMEM: Error = Error::OutOfMemory;
    pub const EBUSY: Error = Error::Busy;
    pub const ETIMEDOUT: Error = Error::TimedOut;
    pub const ENOTSUPP: Error = Error::NotSupported;
    pub const EFATAL: Error = Error::Fatal;
}

/// Result type used throughout the core. `Result` alone means `Result<(), Error>`.
pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Acquires `lock`, ignoring poisoning.
pub(crate) fn lock<T: ?Sized>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T: ?Sized>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T: ?Sized>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
