// SPDX-License-Identifier: GPL-2.0

use core::marker::PhantomData;

use crate::falcon::FalconEngine;

use super::FalconHal;

/// Falcon HAL for Pascal and Volta. Everything these cores do is covered by the common register
/// block.
pub(super) struct Gp10b<E: FalconEngine>(PhantomData<E>);

impl<E: FalconEngine> Gp10b<E> {
    pub(super) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E: FalconEngine> FalconHal<E> for Gp10b<E> {}
