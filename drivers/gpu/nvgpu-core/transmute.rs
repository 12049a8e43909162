// SPDX-License-Identifier: GPL-2.0

//! Traits for transmuting firmware headers and blob records to and from bytes.

use core::mem::size_of;

use crate::error::{code::*, Result};

/// Types for which any bit pattern is valid.
///
/// # Safety
///
/// All bit-patterns must be valid for this type. This type must not have interior mutability.
pub(crate) unsafe trait FromBytes: Sized {
    /// Returns a copy of `Self` read from the start of `bytes`, or `None` if `bytes` is too
    /// short. No alignment requirement is placed on `bytes`.
    fn from_bytes_copy(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }

        // SAFETY: `bytes` holds at least `size_of::<Self>()` readable bytes, any bit pattern is a
        // valid `Self`, and `read_unaligned` has no alignment requirement.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<Self>()) })
    }
}

macro_rules! impl_frombytes {
    ($($({$($generics:tt)*})? $t:ty, )*) => {
        // SAFETY: Safety comments written in the macro invocation.
        $(unsafe impl$($($generics)*)? FromBytes for $t {})*
    };
}

impl_frombytes! {
    // SAFETY: All bit patterns are acceptable values of the types below.
    u8, u16, u32, u64,

    // SAFETY: If all bit patterns are acceptable for individual values in an array, then all bit
    // patterns are also acceptable for arrays of that type.
    {<T: FromBytes, const N: usize>} [T; N],
}

/// Types that can be viewed as an immutable slice of initialized bytes.
///
/// # Safety
///
/// Values of this type may not contain any uninitialized bytes (no padding). This type must not
/// have interior mutability.
pub(crate) unsafe trait AsBytes: Sized {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `self` is a valid reference to `size_of::<Self>()` initialized bytes.
        unsafe {
            core::slice::from_raw_parts((self as *const Self).cast::<u8>(), size_of::<Self>())
        }
    }
}

macro_rules! impl_asbytes {
    ($($({$($generics:tt)*})? $t:ty, )*) => {
        // SAFETY: Safety comments written in the macro invocation.
        $(unsafe impl$($($generics)*)? AsBytes for $t {})*
    };
}

impl_asbytes! {
    // SAFETY: Instances of the following types have no uninitialized portions.
    u8, u16, u32, u64,

    // SAFETY: If individual values in an array have no uninitialized portions, then the array
    // itself does not have any uninitialized portions either.
    {<T: AsBytes, const N: usize>} [T; N],
}

/// Returns a copy of `S` by reinterpreting the bytes starting at `offset` in `slice`.
pub(crate) fn frombytes_at<S: FromBytes>(slice: &[u8], offset: usize) -> Result<S> {
    offset
        .checked_add(size_of::<S>())
        .and_then(|end| slice.get(offset..end))
        .and_then(S::from_bytes_copy)
        .ok_or(EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, PartialEq)]
    struct Pair {
        a: u32,
        b: u32,
    }

    // SAFETY: two `u32`s, no padding, any bit pattern valid.
    unsafe impl FromBytes for Pair {}
    // SAFETY: as above.
    unsafe impl AsBytes for Pair {}

    #[test]
    fn unaligned_read() {
        let p = Pair { a: 0x11223344, b: 0x55667788 };
        let mut buf = vec![0u8; 1];
        buf.extend_from_slice(p.as_bytes());

        assert_eq!(frombytes_at::<Pair>(&buf, 1), Ok(p));
        assert_eq!(frombytes_at::<Pair>(&buf, 2), Err(EINVAL));
        assert_eq!(frombytes_at::<Pair>(&buf, usize::MAX), Err(EINVAL));
    }
}
