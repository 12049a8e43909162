// SPDX-License-Identifier: GPL-2.0

//! `register!` macro to define register layout and accessors.
//!
//! A single register typically includes several fields, which are accessed through a combination
//! of bit-shift and mask operations that introduce a class of potential mistakes, notably because
//! not all possible field values are necessarily valid.
//!
//! The `register!` macro in this module provides an intuitive and readable syntax for defining a
//! dedicated type for each register. Each such type comes with its own field accessors that can
//! return an error if a field's value is invalid. Please look at the [`bitfield`] macro for the
//! complete syntax of fields definitions.

/// Trait providing a base address to be added to the offset of a relative register to obtain
/// its actual offset.
///
/// The `T` generic argument is used to distinguish which base to use, in case a type provides
/// several bases. It is given to the `register!` macro to restrict the use of the register to
/// implementors of this particular variant.
pub(crate) trait RegisterBase<T> {
    const BASE: usize;
}

/// Defines a dedicated type for a register, including getter and setter methods for its fields
/// and methods to read and write it through a [`crate::io::Bar0`].
///
/// ```ignore
/// register!(NV_PMC_BOOT_0 @ 0x00000000, "Basic revision information about the GPU" {
///     3:0     minor_revision as u8, "Minor revision of the chip";
///     7:4     major_revision as u8, "Major revision of the chip";
///     28:20   chipset as u32 ?=> Chipset, "Chipset model";
/// });
///
/// let boot0 = NV_PMC_BOOT_0::read(bar);
/// let chipset = boot0.chipset()?;
/// ```
///
/// Variants:
///
/// - `NAME @ 0x100` is a register at a fixed offset.
/// - `NAME => OTHER` shares the offset of `OTHER` but gives it different fields.
/// - `NAME @ Base[0x100]` is relative to the base provided by a [`RegisterBase<Base>`]
///   implementor, e.g. one falcon instance.
/// - `NAME @ 0x100[16; 8]` is an array of 16 registers with a stride of 8 bytes.
/// - `NAME @ Base[0x100[16; 8]]` is a relative array.
macro_rules! register {
    // Creates a register at a fixed offset of the MMIO space.
    ($name:ident @ $offset:literal $(, $comment:literal)? { $($fields:tt)* } ) => {
        bitfield!(pub(crate) struct $name $(, $comment)? { $($fields)* } );
        register!(@io_fixed $name @ $offset);
    };

    // Creates an alias register of fixed offset register `alias` with its own fields.
    ($name:ident => $alias:ident $(, $comment:literal)? { $($fields:tt)* } ) => {
        bitfield!(pub(crate) struct $name $(, $comment)? { $($fields)* } );
        register!(@io_fixed $name @ $alias::OFFSET);
    };

    // Creates a register at a relative offset from a base address provider.
    ($name:ident @ $base:ty [ $offset:literal ] $(, $comment:literal)? { $($fields:tt)* } ) => {
        bitfield!(pub(crate) struct $name $(, $comment)? { $($fields)* } );
        register!(@io_relative $name @ $base [ $offset ]);
    };

    // Creates an array of registers at a fixed offset of the MMIO space.
    (
        $name:ident @ $offset:literal [ $size:expr ; $stride:expr ] $(, $comment:literal)? {
            $($fields:tt)*
        }
    ) => {
        const _: () = assert!(::core::mem::size_of::<u32>() <= $stride);
        bitfield!(pub(crate) struct $name $(, $comment)? { $($fields)* } );
        register!(@io_array $name @ $offset [ $size ; $stride ]);
    };

    // Creates an array of registers at a relative offset from a base address provider.
    (
        $name:ident @ $base:ty [ $offset:literal [ $size:expr ; $stride:expr ] ]
            $(, $comment:literal)? { $($fields:tt)* }
    ) => {
        const _: () = assert!(::core::mem::size_of::<u32>() <= $stride);
        bitfield!(pub(crate) struct $name $(, $comment)? { $($fields)* } );
        register!(@io_relative_array $name @ $base [ $offset [ $size ; $stride ] ]);
    };

    // Generates the IO accessors for a fixed offset register.
    (@io_fixed $name:ident @ $offset:expr) => {
        #[allow(dead_code)]
        impl $name {
            pub(crate) const OFFSET: usize = $offset;

            /// Read the register from its address in `bar`.
            #[inline(always)]
            pub(crate) fn read(bar: &crate::io::Bar0) -> Self {
                Self(bar.read32(Self::OFFSET))
            }

            /// Write the value contained in `self` to the register address in `bar`.
            #[inline(always)]
            pub(crate) fn write(self, bar: &crate::io::Bar0) {
                bar.write32(self.0, Self::OFFSET)
            }

            /// Read the register from its address in `bar` and run `f` on its value to obtain a
            /// new value to write back.
            #[inline(always)]
            pub(crate) fn update<F>(bar: &crate::io::Bar0, f: F)
            where
                F: ::core::ops::FnOnce(Self) -> Self,
            {
                let reg = f(Self::read(bar));
                reg.write(bar);
            }
        }
    };

    // Generates the IO accessors for a relative offset register.
    (@io_relative $name:ident @ $base:ty [ $offset:expr ]) => {
        #[allow(dead_code)]
        impl $name {
            pub(crate) const OFFSET: usize = $offset;

            /// Absolute offset of the register for the base provided by `B`.
            #[inline(always)]
            pub(crate) fn offset<B: crate::regs::macros::RegisterBase<$base>>(
                #[allow(unused_variables)] base: &B,
            ) -> usize {
                <B as crate::regs::macros::RegisterBase<$base>>::BASE + Self::OFFSET
            }

            /// Read the register from `bar`, using the base address provided by `base` and adding
            /// the register's offset to it.
            #[inline(always)]
            pub(crate) fn read<B: crate::regs::macros::RegisterBase<$base>>(
                bar: &crate::io::Bar0,
                base: &B,
            ) -> Self {
                Self(bar.read32(Self::offset(base)))
            }

            /// Write the value contained in `self` to `bar`, using the base address provided by
            /// `base` and adding the register's offset to it.
            #[inline(always)]
            pub(crate) fn write<B: crate::regs::macros::RegisterBase<$base>>(
                self,
                bar: &crate::io::Bar0,
                base: &B,
            ) {
                bar.write32(self.0, Self::offset(base))
            }

            /// Read the register relative to `base`, run `f` on its value and write the result
            /// back.
            #[inline(always)]
            pub(crate) fn update<B, F>(bar: &crate::io::Bar0, base: &B, f: F)
            where
                B: crate::regs::macros::RegisterBase<$base>,
                F: ::core::ops::FnOnce(Self) -> Self,
            {
                let reg = f(Self::read(bar, base));
                reg.write(bar, base);
            }
        }
    };

    // Generates the IO accessors for an array of registers.
    (@io_array $name:ident @ $offset:literal [ $size:expr ; $stride:expr ]) => {
        #[allow(dead_code)]
        impl $name {
            pub(crate) const OFFSET: usize = $offset;
            pub(crate) const SIZE: usize = $size;
            pub(crate) const STRIDE: usize = $stride;

            /// Absolute offset of the register at index `idx`.
            #[inline(always)]
            pub(crate) const fn offset(idx: usize) -> usize {
                Self::OFFSET + idx * Self::STRIDE
            }

            /// Read the array register at index `idx` from its address in `bar`.
            ///
            /// `idx` must be below [`Self::SIZE`]; use [`Self::try_read`] for indices coming from
            /// hardware or callers.
            #[inline(always)]
            pub(crate) fn read(bar: &crate::io::Bar0, idx: usize) -> Self {
                debug_assert!(idx < Self::SIZE);
                Self(bar.read32(Self::offset(idx)))
            }

            /// Write the value contained in `self` to the array register with index `idx`.
            #[inline(always)]
            pub(crate) fn write(self, bar: &crate::io::Bar0, idx: usize) {
                debug_assert!(idx < Self::SIZE);
                bar.write32(self.0, Self::offset(idx))
            }

            /// Read the array register at index `idx`, run `f` on its value and write the result
            /// back.
            #[inline(always)]
            pub(crate) fn update<F>(bar: &crate::io::Bar0, idx: usize, f: F)
            where
                F: ::core::ops::FnOnce(Self) -> Self,
            {
                let reg = f(Self::read(bar, idx));
                reg.write(bar, idx);
            }

            /// Read the array register at index `idx` from its address in `bar`.
            ///
            /// The validity of `idx` is checked at run-time, and `EINVAL` is returned if the
            /// access was out-of-bounds.
            #[inline(always)]
            pub(crate) fn try_read(
                bar: &crate::io::Bar0,
                idx: usize,
            ) -> crate::error::Result<Self> {
                if idx < Self::SIZE {
                    Ok(Self::read(bar, idx))
                } else {
                    Err(crate::error::code::EINVAL)
                }
            }

            /// Write the value contained in `self` to the array register with index `idx`.
            ///
            /// The validity of `idx` is checked at run-time, and `EINVAL` is returned if the
            /// access was out-of-bounds.
            #[inline(always)]
            pub(crate) fn try_write(
                self,
                bar: &crate::io::Bar0,
                idx: usize,
            ) -> crate::error::Result {
                if idx < Self::SIZE {
                    self.write(bar, idx);
                    Ok(())
                } else {
                    Err(crate::error::code::EINVAL)
                }
            }
        }
    };

    // Generates the IO accessors for an array of relative registers.
    (
        @io_relative_array $name:ident @ $base:ty
            [ $offset:literal [ $size:expr ; $stride:expr ] ]
    ) => {
        #[allow(dead_code)]
        impl $name {
            pub(crate) const OFFSET: usize = $offset;
            pub(crate) const SIZE: usize = $size;
            pub(crate) const STRIDE: usize = $stride;

            /// Absolute offset of array register `idx` for the base provided by `B`.
            #[inline(always)]
            pub(crate) fn offset<B: crate::regs::macros::RegisterBase<$base>>(
                #[allow(unused_variables)] base: &B,
                idx: usize,
            ) -> usize {
                <B as crate::regs::macros::RegisterBase<$base>>::BASE
                    + Self::OFFSET
                    + idx * Self::STRIDE
            }

            /// Read the array register at index `idx` from `bar`, using the base address provided
            /// by `base`.
            #[inline(always)]
            pub(crate) fn read<B: crate::regs::macros::RegisterBase<$base>>(
                bar: &crate::io::Bar0,
                base: &B,
                idx: usize,
            ) -> Self {
                debug_assert!(idx < Self::SIZE);
                Self(bar.read32(Self::offset(base, idx)))
            }

            /// Write the value contained in `self` to array register `idx` relative to `base`.
            #[inline(always)]
            pub(crate) fn write<B: crate::regs::macros::RegisterBase<$base>>(
                self,
                bar: &crate::io::Bar0,
                base: &B,
                idx: usize,
            ) {
                debug_assert!(idx < Self::SIZE);
                bar.write32(self.0, Self::offset(base, idx))
            }

            /// Read the array register at index `idx` relative to `base`.
            ///
            /// The validity of `idx` is checked at run-time, and `EINVAL` is returned if the
            /// access was out-of-bounds.
            #[inline(always)]
            pub(crate) fn try_read<B: crate::regs::macros::RegisterBase<$base>>(
                bar: &crate::io::Bar0,
                base: &B,
                idx: usize,
            ) -> crate::error::Result<Self> {
                if idx < Self::SIZE {
                    Ok(Self::read(bar, base, idx))
                } else {
                    Err(crate::error::code::EINVAL)
                }
            }

            /// Write the value contained in `self` to array register `idx` relative to `base`.
            ///
            /// The validity of `idx` is checked at run-time, and `EINVAL` is returned if the
            /// access was out-of-bounds.
            #[inline(always)]
            pub(crate) fn try_write<B: crate::regs::macros::RegisterBase<$base>>(
                self,
                bar: &crate::io::Bar0,
                base: &B,
                idx: usize,
            ) -> crate::error::Result {
                if idx < Self::SIZE {
                    self.write(bar, base, idx);
                    Ok(())
                } else {
                    Err(crate::error::code::EINVAL)
                }
            }
        }
    };
}
