// SPDX-License-Identifier: GPL-2.0

use core::marker::PhantomData;

use log::warn;

use crate::{
    error::{code::*, Result},
    falcon::FalconEngine,
    io::Bar0,
    regs,
};

use super::FalconHal;

/// Size of the EMEM aperture on Turing falcons.
const EMEM_SIZE: u32 = 0x2000;

pub(super) struct Tu104<E: FalconEngine>(PhantomData<E>);

impl<E: FalconEngine> Tu104<E> {
    pub(super) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E: FalconEngine> FalconHal<E> for Tu104<E> {
    fn copy_to_emem(&self, bar: &Bar0, dst: u32, src: &[u8], port: usize) -> Result {
        if dst % 4 != 0 {
            return Err(EINVAL);
        }
        let end = u32::try_from(src.len())
            .ok()
            .and_then(|len| dst.checked_add(len));
        if !matches!(end, Some(end) if end <= EMEM_SIZE) {
            warn!("falcon {:?}: EMEM copy at {:#x} out of range", E::FALCON_ID, dst);
            return Err(EINVAL);
        }

        regs::NV_PFALCON_FALCON_EMEMC::default()
            .set_offs((dst >> 2) & 0x3f)
            .set_blk(dst >> 8)
            .set_aincw(true)
            .try_write(bar, &E::ID, port)?;

        for chunk in src.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            regs::NV_PFALCON_FALCON_EMEMD::default()
                .set_data(u32::from_le_bytes(word))
                .write(bar, &E::ID, port);
        }

        Ok(())
    }
}
