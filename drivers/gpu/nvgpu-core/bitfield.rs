// SPDX-License-Identifier: GPL-2.0

//! Bitfield library for 32-bit hardware words.
//!
//! Used by the [`register!`] macro for MMIO registers, and directly for words that live in
//! memory rather than behind BAR0: runlist entries, instance-block words, GMMU entries.

/// Defines a struct with accessors to access bits within an inner `u32`.
///
/// # Syntax
///
/// ```ignore
/// bitfield! {
///     pub(crate) struct RunlistTsgWord0, "First word of a TSG header" {
///         0:0     tsg as bool;
///         19:16   timeslice_scale as u8;
///         31:24   timeslice_timeout as u8;
///     }
/// }
/// ```
///
/// This generates a struct with:
/// - Field accessors: `tsg()`, `timeslice_scale()`, etc.
/// - Field setters: `set_tsg()`, `set_timeslice_scale()`, etc. (chainable).
/// - Debug and Default implementations.
///
/// Fields are defined as follows:
///
/// - `as <type>` simply returns the field value casted to <type>, typically `u32`, `u16`, `u8` or
///   `bool`. Note that `bool` fields must have a range of 1 bit.
/// - `as <type> => <into_type>` calls `<into_type>`'s `From::<<type>>` implementation and returns
///   the result.
/// - `as <type> ?=> <try_into_type>` calls `<try_into_type>`'s `TryFrom::<<type>>` implementation
///   and returns the result. This is useful with fields for which not all values are valid.
macro_rules! bitfield {
    // Main entry point - defines the bitfield struct with fields
    ($vis:vis struct $name:ident $(, $comment:literal)? { $($fields:tt)* }) => {
        bitfield!(@core $vis $name $(, $comment)? { $($fields)* });
    };

    // All rules below are helpers.

    // Defines the wrapper `$name` type, as well as its relevant implementations (`Debug`,
    // `Default`, `BitOr`, and conversion to and from the value type) and field accessor methods.
    (@core $vis:vis $name:ident $(, $comment:literal)? { $($fields:tt)* }) => {
        $(
        #[doc=$comment]
        )?
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq)]
        $vis struct $name(u32);

        impl ::core::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl ::core::convert::From<$name> for u32 {
            fn from(val: $name) -> u32 {
                val.0
            }
        }

        impl ::core::convert::From<u32> for $name {
            fn from(val: u32) -> Self {
                Self(val)
            }
        }

        bitfield!(@fields_dispatcher $name { $($fields)* });
    };

    // Captures the fields and passes them to all the implementers that require field information.
    (@fields_dispatcher $name:ident {
        $($hi:tt:$lo:tt $field:ident as $type:tt
            $(?=> $try_into_type:ty)?
            $(=> $into_type:ty)?
            $(, $comment:literal)?
        ;
        )*
    }
    ) => {
        bitfield!(@field_accessors $name {
            $(
                $hi:$lo $field as $type
                $(?=> $try_into_type)?
                $(=> $into_type)?
                $(, $comment)?
            ;
            )*
        });
        bitfield!(@debug $name { $($field;)* });
        bitfield!(@default $name { $($field;)* });
    };

    // Defines all the field getter/setter methods for `$name`.
    (
        @field_accessors $name:ident {
        $($hi:tt:$lo:tt $field:ident as $type:tt
            $(?=> $try_into_type:ty)?
            $(=> $into_type:ty)?
            $(, $comment:literal)?
        ;
        )*
        }
    ) => {
        $(
            bitfield!(@check_field_bounds $hi:$lo $field as $type);
        )*

        #[allow(dead_code)]
        impl $name {
            /// Returns the raw value of the word.
            #[inline(always)]
            pub(crate) const fn raw(self) -> u32 {
                self.0
            }

            $(
            bitfield!(@field_accessor $name $hi:$lo $field as $type
                $(?=> $try_into_type)?
                $(=> $into_type)?
                $(, $comment)?
                ;
            );
            )*
        }
    };

    // Boolean fields must have `$hi == $lo`.
    (@check_field_bounds $hi:tt:$lo:tt $field:ident as bool) => {
        #[allow(clippy::eq_op)]
        const _: () = assert!(
            $hi == $lo,
            concat!("boolean field `", stringify!($field), "` covers more than one bit")
        );
    };

    // Non-boolean fields must have `$hi >= $lo`.
    (@check_field_bounds $hi:tt:$lo:tt $field:ident as $type:tt) => {
        #[allow(clippy::eq_op)]
        const _: () = assert!(
            $hi >= $lo,
            concat!("field `", stringify!($field), "`'s MSB is smaller than its LSB")
        );
    };

    // Catches fields defined as `bool` and convert them into a boolean value.
    (
        @field_accessor $name:ident $hi:tt:$lo:tt $field:ident as bool => $into_type:ty
            $(, $comment:literal)?;
    ) => {
        bitfield!(
            @leaf_accessor $name $hi:$lo $field
            { |f| <$into_type>::from(f != 0) }
            bool $into_type => $into_type $(, $comment)?;
        );
    };

    // Shortcut for fields defined as `bool` without the `=>` syntax.
    (
        @field_accessor $name:ident $hi:tt:$lo:tt $field:ident as bool $(, $comment:literal)?;
    ) => {
        bitfield!(@field_accessor $name $hi:$lo $field as bool => bool $(, $comment)?;);
    };

    // Catches the `?=>` syntax for non-boolean fields.
    (
        @field_accessor $name:ident $hi:tt:$lo:tt $field:ident as $type:tt ?=> $try_into_type:ty
            $(, $comment:literal)?;
    ) => {
        bitfield!(@leaf_accessor $name $hi:$lo $field
            { |f| <$try_into_type>::try_from(f as $type) } $type $try_into_type =>
            ::core::result::Result<
                $try_into_type,
                <$try_into_type as ::core::convert::TryFrom<$type>>::Error
            >
            $(, $comment)?;);
    };

    // Catches the `=>` syntax for non-boolean fields.
    (
        @field_accessor $name:ident $hi:tt:$lo:tt $field:ident as $type:tt => $into_type:ty
            $(, $comment:literal)?;
    ) => {
        bitfield!(@leaf_accessor $name $hi:$lo $field
            { |f| <$into_type>::from(f as $type) } $type $into_type => $into_type $(, $comment)?;);
    };

    // Shortcut for non-boolean fields defined without the `=>` or `?=>` syntax.
    (
        @field_accessor $name:ident $hi:tt:$lo:tt $field:ident as $type:tt
            $(, $comment:literal)?;
    ) => {
        bitfield!(@field_accessor $name $hi:$lo $field as $type => $type $(, $comment)?;);
    };

    // Generates the accessor methods for a single field.
    (
        @leaf_accessor $name:ident $hi:tt:$lo:tt $field:ident
            { $process:expr } $prim_type:tt $to_type:ty => $res_type:ty $(, $comment:literal)?;
    ) => {
        ::paste::paste!(
        const [<$field:upper _RANGE>]: ::core::ops::RangeInclusive<u8> = $lo..=$hi;
        const [<$field:upper _MASK>]: u32 = ((((1 << $hi) - 1) << 1) + 1) - ((1 << $lo) - 1);
        const [<$field:upper _SHIFT>]: u32 = Self::[<$field:upper _MASK>].trailing_zeros();
        );

        $(
        #[doc="Returns the value of this field:"]
        #[doc=$comment]
        )?
        #[inline(always)]
        pub(crate) fn $field(self) -> $res_type {
            ::paste::paste!(
            const MASK: u32 = $name::[<$field:upper _MASK>];
            const SHIFT: u32 = $name::[<$field:upper _SHIFT>];
            );
            let field = ((self.0 & MASK) >> SHIFT);

            $process(field)
        }

        ::paste::paste!(
        $(
        #[doc="Sets the value of this field:"]
        #[doc=$comment]
        )?
        #[inline(always)]
        pub(crate) fn [<set_ $field>](mut self, value: $to_type) -> Self {
            const MASK: u32 = $name::[<$field:upper _MASK>];
            const SHIFT: u32 = $name::[<$field:upper _SHIFT>];
            let value = (u32::from($prim_type::from(value)) << SHIFT) & MASK;
            self.0 = (self.0 & !MASK) | value;

            self
        }
        );
    };

    // Generates the `Debug` implementation for `$name`.
    (@debug $name:ident { $($field:ident;)* }) => {
        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("<raw>", &format_args!("{:#x}", &self.0))
                $(
                    .field(stringify!($field), &self.$field())
                )*
                    .finish()
            }
        }
    };

    // Generates the `Default` implementation for `$name`.
    (@default $name:ident { $($field:ident;)* }) => {
        /// Returns a value for the bitfield where all fields are set to their default value.
        impl ::core::default::Default for $name {
            fn default() -> Self {
                #[allow(unused_mut)]
                let mut value = Self(Default::default());

                ::paste::paste!(
                $(
                value = value.[<set_ $field>](Default::default());
                )*
                );

                value
            }
        }
    };
}

#[cfg(test)]
mod tests {
    bitfield! {
        struct TestWord, "Word used by the tests" {
            0:0     valid as bool;
            7:4     kind as u8;
            31:12   addr as u32;
        }
    }

    #[test]
    fn set_and_get() {
        let w = TestWord::default().set_valid(true).set_kind(0xa).set_addr(0xfffff);

        assert!(w.valid());
        assert_eq!(w.kind(), 0xa);
        assert_eq!(w.addr(), 0xfffff);
        assert_eq!(u32::from(w), 0xffff_f0a1);
    }

    #[test]
    fn setter_masks_overflow() {
        let w = TestWord::default().set_kind(0xff);

        assert_eq!(w.kind(), 0xf);
        assert!(!w.valid());
    }
}
