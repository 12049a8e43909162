// SPDX-License-Identifier: GPL-2.0

//! Layout of the WPR blob handed to the HS ACR ucode.
//!
//! The blob starts with one [`WprHeader`] per managed falcon, terminated by an entry whose
//! falcon id is [`FALCON_ID_INVALID`]. Discrete GPUs follow with the sub-WPR headers describing
//! the shared regions placed at the end of the blob. Then, for every managed falcon, come its
//! [`LsbHeader`], its ucode (data first, then bootloader and application code) and the
//! descriptor its bootloader reads from DMEM.
//!
//! Every offset recorded in the blob is a multiple of [`LSF_ALIGN`], as is every section size.

use core::mem::size_of;

use bitflags::bitflags;

use crate::error::{code::*, Result};
use crate::falcon::{FalconId, FALCON_ID_END, FALCON_ID_INVALID};
use crate::firmware::{LsFirmware, LsfSignature};
use crate::transmute::{AsBytes, FromBytes};
use crate::util::{align_up, hi32, lo32};

pub(crate) const LSF_ALIGN: u64 = 256;
/// Alignment and size unit of the shared sub-WPR regions.
pub(crate) const SUB_WPR_ALIGN: u64 = 4096;

/// The HS ucode copies the image of entries in this state.
pub(crate) const WPR_STATUS_COPY: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WprHeader {
    pub(crate) falcon_id: u32,
    pub(crate) lsb_offset: u32,
    pub(crate) bootstrap_owner: u32,
    pub(crate) lazy_bootstrap: u32,
    pub(crate) bin_version: u32,
    pub(crate) status: u32,
}

bitflags! {
    /// Load flags of a LS falcon.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct LsbFlags: u32 {
        const LOAD_CODE_AT_0 = 1 << 0;
        const DMACTL_REQ_CTX = 1 << 2;
        const FORCE_PRIV_LOAD = 1 << 3;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LsbHeader {
    pub(crate) signature: LsfSignature,
    /// Blob offset of the ucode.
    pub(crate) ucode_off: u32,
    pub(crate) ucode_size: u32,
    pub(crate) data_size: u32,
    pub(crate) bl_code_size: u32,
    pub(crate) bl_imem_off: u32,
    /// Blob offset of the bootloader DMEM descriptor.
    pub(crate) bl_data_off: u32,
    pub(crate) bl_data_size: u32,
    /// Offset of the application code within the ucode.
    pub(crate) app_code_off: u32,
    pub(crate) app_code_size: u32,
    /// Offset of the application data within the ucode.
    pub(crate) app_data_off: u32,
    pub(crate) app_data_size: u32,
    pub(crate) flags: u32,
}

/// Descriptor the LS bootloader reads from DMEM to DMA the application in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlDmemDesc {
    pub(crate) code_dma_base_lo: u32,
    pub(crate) code_dma_base_hi: u32,
    pub(crate) non_sec_code_off: u32,
    pub(crate) non_sec_code_size: u32,
    pub(crate) sec_code_off: u32,
    pub(crate) sec_code_size: u32,
    pub(crate) code_entry_point: u32,
    pub(crate) data_dma_base_lo: u32,
    pub(crate) data_dma_base_hi: u32,
    pub(crate) data_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SubWprHeader {
    pub(crate) use_case_id: u32,
    /// Start address in 4 KiB units.
    pub(crate) start_addr: u32,
    /// Size in 4 KiB units.
    pub(crate) size_4k: u32,
}

// SAFETY: the types below only hold `u32`s (and a `LsfSignature` of bytes and `u32`s), so they
// have no padding and every bit pattern is valid.
unsafe impl AsBytes for WprHeader {}
// SAFETY: as above.
unsafe impl FromBytes for WprHeader {}
// SAFETY: as above.
unsafe impl AsBytes for LsbHeader {}
// SAFETY: as above.
unsafe impl FromBytes for LsbHeader {}
// SAFETY: as above.
unsafe impl AsBytes for BlDmemDesc {}
// SAFETY: as above.
unsafe impl FromBytes for BlDmemDesc {}
// SAFETY: as above.
unsafe impl AsBytes for SubWprHeader {}
// SAFETY: as above.
unsafe impl FromBytes for SubWprHeader {}

pub(crate) const SUB_WPR_USE_CASE_FRTS_VBIOS_TABLES: u32 = 1;
pub(crate) const SUB_WPR_USE_CASE_PLAYREADY_SHARED_DATA: u32 = 2;
const SUB_WPR_USE_CASE_INVALID: u32 = 0xffff_ffff;

/// Shared regions reserved at the end of the blob on discrete GPUs, with their sizes in 4 KiB
/// units.
const SHARED_SUB_WPRS: [(u32, u32); 2] = [
    (SUB_WPR_USE_CASE_FRTS_VBIOS_TABLES, 0x100),
    (SUB_WPR_USE_CASE_PLAYREADY_SHARED_DATA, 0x1),
];

/// A LS falcon to place in the blob.
#[derive(Debug, Clone)]
pub(crate) struct LsfImage {
    pub(crate) id: FalconId,
    pub(crate) lazy: bool,
    pub(crate) flags: LsbFlags,
    pub(crate) fw: LsFirmware,
}

/// Offsets of the pieces of one falcon in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LsfPlacement {
    pub(crate) lsb_off: u64,
    pub(crate) ucode_off: u64,
    pub(crate) data_size: u64,
    pub(crate) bl_code_size: u64,
    pub(crate) app_code_size: u64,
    pub(crate) bl_data_off: u64,
}

impl LsfPlacement {
    fn code_off(&self) -> u64 {
        self.ucode_off + self.data_size
    }

    fn ucode_size(&self) -> u64 {
        self.data_size + self.bl_code_size + self.app_code_size
    }
}

/// Placement of every piece of the blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlobLayout {
    pub(crate) sub_wpr_off: Option<u64>,
    pub(crate) falcons: Vec<LsfPlacement>,
    pub(crate) shared_off: Option<u64>,
    pub(crate) size: u64,
}

fn pad(size: usize) -> u64 {
    align_up(size as u64, LSF_ALIGN)
}

impl BlobLayout {
    pub(crate) fn compute(images: &[LsfImage], is_dgpu: bool) -> Result<Self> {
        if images.len() >= FALCON_ID_END {
            return Err(EINVAL);
        }

        let mut off = pad(size_of::<WprHeader>() * FALCON_ID_END);

        let sub_wpr_off = is_dgpu.then(|| {
            let start = off;
            off += pad(size_of::<SubWprHeader>() * (SHARED_SUB_WPRS.len() + 1));
            start
        });

        let mut falcons = Vec::with_capacity(images.len());
        for img in images {
            let lsb_off = off;
            off += pad(size_of::<LsbHeader>());

            let placement = LsfPlacement {
                lsb_off,
                ucode_off: off,
                data_size: pad(img.fw.data.len()),
                bl_code_size: pad(img.fw.desc.bootloader_size as usize),
                app_code_size: pad(img.fw.desc.app_code_size as usize),
                bl_data_off: 0,
            };
            off += placement.ucode_size();

            let placement = LsfPlacement {
                bl_data_off: off,
                ..placement
            };
            off += pad(size_of::<BlDmemDesc>());

            falcons.push(placement);
        }

        let shared_off = is_dgpu.then(|| {
            off = align_up(off, SUB_WPR_ALIGN);
            let start = off;
            off += SHARED_SUB_WPRS
                .iter()
                .map(|(_, size)| u64::from(*size) * SUB_WPR_ALIGN)
                .sum::<u64>();
            start
        });

        Ok(Self {
            sub_wpr_off,
            falcons,
            shared_off,
            size: off,
        })
    }

    /// Serializes the blob for images `images`, to be placed at GPU address `base` and
    /// bootstrapped by the falcon `owner`.
    pub(crate) fn emit(&self, images: &[LsfImage], owner: FalconId, base: u64) -> Result<Vec<u8>> {
        let size = usize::try_from(self.size).map_err(|_| ENOMEM)?;
        let mut blob = vec![0u8; size];

        let put = |blob: &mut Vec<u8>, off: u64, bytes: &[u8]| -> Result {
            let off = off as usize;
            blob.get_mut(off..off + bytes.len())
                .ok_or(EINVAL)?
                .copy_from_slice(bytes);
            Ok(())
        };

        // WPR headers, terminated by an invalid entry.
        for (i, (img, p)) in images.iter().zip(&self.falcons).enumerate() {
            let hdr = WprHeader {
                falcon_id: u32::from(img.id),
                lsb_offset: p.lsb_off as u32,
                bootstrap_owner: u32::from(owner),
                lazy_bootstrap: u32::from(img.lazy),
                bin_version: img.fw.desc.bin_version,
                status: WPR_STATUS_COPY,
            };
            put(&mut blob, (i * size_of::<WprHeader>()) as u64, hdr.as_bytes())?;
        }
        let term = WprHeader {
            falcon_id: FALCON_ID_INVALID,
            ..Default::default()
        };
        put(
            &mut blob,
            (images.len() * size_of::<WprHeader>()) as u64,
            term.as_bytes(),
        )?;

        if let (Some(sub_off), Some(shared_off)) = (self.sub_wpr_off, self.shared_off) {
            let mut start = base + shared_off;
            let mut entry_off = sub_off;

            for (use_case_id, size_4k) in SHARED_SUB_WPRS {
                let hdr = SubWprHeader {
                    use_case_id,
                    start_addr: (start / SUB_WPR_ALIGN) as u32,
                    size_4k,
                };
                put(&mut blob, entry_off, hdr.as_bytes())?;
                entry_off += size_of::<SubWprHeader>() as u64;
                start += u64::from(size_4k) * SUB_WPR_ALIGN;
            }

            let term = SubWprHeader {
                use_case_id: SUB_WPR_USE_CASE_INVALID,
                ..Default::default()
            };
            put(&mut blob, entry_off, term.as_bytes())?;
        }

        for (img, p) in images.iter().zip(&self.falcons) {
            let desc = &img.fw.desc;
            let (bl, app) = img
                .fw
                .code
                .split_at_checked(desc.bootloader_size as usize)
                .ok_or(EINVAL)?;

            let lsb = LsbHeader {
                signature: img.fw.sig,
                ucode_off: p.ucode_off as u32,
                ucode_size: p.ucode_size() as u32,
                data_size: p.data_size as u32,
                bl_code_size: p.bl_code_size as u32,
                bl_imem_off: desc.bootloader_imem_offset,
                bl_data_off: p.bl_data_off as u32,
                bl_data_size: LSF_ALIGN as u32,
                app_code_off: (p.data_size + p.bl_code_size) as u32,
                app_code_size: p.app_code_size as u32,
                app_data_off: 0,
                app_data_size: p.data_size as u32,
                flags: img.flags.bits(),
            };
            put(&mut blob, p.lsb_off, lsb.as_bytes())?;

            put(&mut blob, p.ucode_off, &img.fw.data)?;
            put(&mut blob, p.code_off(), bl)?;
            put(&mut blob, p.code_off() + p.bl_code_size, app)?;

            let code_base = base + p.code_off();
            let data_base = base + p.ucode_off;
            let bl_desc = BlDmemDesc {
                code_dma_base_lo: lo32(code_base),
                code_dma_base_hi: hi32(code_base),
                non_sec_code_off: 0,
                non_sec_code_size: p.bl_code_size as u32,
                sec_code_off: p.bl_code_size as u32,
                sec_code_size: p.app_code_size as u32,
                code_entry_point: desc.bootloader_entry,
                data_dma_base_lo: lo32(data_base),
                data_dma_base_hi: hi32(data_base),
                data_size: p.data_size as u32,
            };
            put(&mut blob, p.bl_data_off, bl_desc.as_bytes())?;
        }

        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::test_images::*;
    use crate::transmute::frombytes_at;

    fn images() -> Vec<LsfImage> {
        [
            (FalconId::Sec2, false, LsbFlags::LOAD_CODE_AT_0 | LsbFlags::DMACTL_REQ_CTX),
            (FalconId::Fecs, false, LsbFlags::LOAD_CODE_AT_0 | LsbFlags::DMACTL_REQ_CTX),
            (FalconId::Gpccs, false, LsbFlags::LOAD_CODE_AT_0 | LsbFlags::FORCE_PRIV_LOAD),
            (FalconId::Nvdec, true, LsbFlags::LOAD_CODE_AT_0),
        ]
        .into_iter()
        .map(|(id, lazy, flags)| LsfImage {
            id,
            lazy,
            flags,
            fw: LsFirmware::parse(id, &ls_image(u32::from(id)), &ls_sig(id)).unwrap(),
        })
        .collect()
    }

    #[test]
    fn every_offset_and_size_is_aligned() {
        for is_dgpu in [false, true] {
            let images = images();
            let layout = BlobLayout::compute(&images, is_dgpu).unwrap();
            let blob = layout.emit(&images, FalconId::Sec2, 0x2000_0000).unwrap();

            assert_eq!(blob.len() as u64, layout.size);

            for i in 0..images.len() {
                let wpr: WprHeader = frombytes_at(&blob, i * size_of::<WprHeader>()).unwrap();
                assert_eq!(wpr.lsb_offset % 256, 0);
                assert_eq!(wpr.status, WPR_STATUS_COPY);
                assert_eq!(wpr.bootstrap_owner, u32::from(FalconId::Sec2));

                let lsb: LsbHeader = frombytes_at(&blob, wpr.lsb_offset as usize).unwrap();
                for v in [
                    lsb.ucode_off,
                    lsb.ucode_size,
                    lsb.data_size,
                    lsb.bl_code_size,
                    lsb.bl_data_off,
                    lsb.bl_data_size,
                    lsb.app_code_off,
                    lsb.app_code_size,
                    lsb.app_data_off,
                    lsb.app_data_size,
                ] {
                    assert_eq!(v % 256, 0, "{:?}", lsb);
                }
                assert_eq!(lsb.signature.falcon_id, wpr.falcon_id);
            }

            let term: WprHeader =
                frombytes_at(&blob, images.len() * size_of::<WprHeader>()).unwrap();
            assert_eq!(term.falcon_id, FALCON_ID_INVALID);
        }
    }

    #[test]
    fn lazy_flag_and_ucode_order() {
        let images = images();
        let layout = BlobLayout::compute(&images, false).unwrap();
        let blob = layout.emit(&images, FalconId::Sec2, 0).unwrap();

        let nvdec: WprHeader = frombytes_at(&blob, 3 * size_of::<WprHeader>()).unwrap();
        assert_eq!(nvdec.falcon_id, u32::from(FalconId::Nvdec));
        assert_eq!(nvdec.lazy_bootstrap, 1);

        // Data comes first in the ucode, then the bootloader padded to 256 bytes.
        let p = &layout.falcons[0];
        assert_eq!(p.data_size, 0x100);
        assert_eq!(p.bl_code_size, 0x200);
        assert_eq!(blob[p.ucode_off as usize], 0xa5);
        assert_eq!(blob[(p.ucode_off + 0x84) as usize], 0);
        assert_eq!(blob[(p.ucode_off + 0x100 + 0x104) as usize], 0);
        assert_eq!(blob[(p.ucode_off + 0x300) as usize], 0xa5);
    }

    #[test]
    fn sub_wpr_on_dgpu_only() {
        let images = images();
        let igpu = BlobLayout::compute(&images, false).unwrap();
        let dgpu = BlobLayout::compute(&images, true).unwrap();
        assert_eq!(igpu.sub_wpr_off, None);
        assert_eq!(dgpu.sub_wpr_off, Some(512));

        let base = 0x8000_0000;
        let blob = dgpu.emit(&images, FalconId::Sec2, base).unwrap();
        let shared = dgpu.shared_off.unwrap();
        assert_eq!(shared % SUB_WPR_ALIGN, 0);

        let first: SubWprHeader = frombytes_at(&blob, 512).unwrap();
        assert_eq!(first.use_case_id, SUB_WPR_USE_CASE_FRTS_VBIOS_TABLES);
        assert_eq!(u64::from(first.start_addr), (base + shared) / SUB_WPR_ALIGN);
    }
}
