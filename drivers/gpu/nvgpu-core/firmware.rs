// SPDX-License-Identifier: GPL-2.0

//! Firmware image containers.
//!
//! The core never reads files itself: images are requested by path through the platform's
//! [`FirmwareLoader`]. Both the HS ACR ucode and the LS falcon images start with a [`BinHdr`]
//! pointing at an image-specific header and at the payload.

use core::mem::size_of;

use log::warn;

use crate::error::{code::*, Result};
use crate::falcon::FalconId;
use crate::gpu::Chipset;
use crate::transmute::{frombytes_at, FromBytes};

/// Source of firmware images, provided by the platform.
pub trait FirmwareLoader: Send + Sync {
    /// Returns the contents of the firmware file at `path`.
    fn request(&self, path: &str) -> Result<Vec<u8>>;
}

/// Magic number of [`BinHdr`].
pub(crate) const BIN_MAGIC: u32 = 0x10de;

/// Structure used to describe some firmwares, notably the ACR ones.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BinHdr {
    /// Magic number, must be `0x10de`.
    pub(crate) bin_magic: u32,
    /// Version of the header.
    pub(crate) bin_ver: u32,
    /// Size in bytes of the binary (to be ignored).
    pub(crate) bin_size: u32,
    /// Offset of the start of the application-specific header.
    pub(crate) header_offset: u32,
    /// Offset of the start of the data payload.
    pub(crate) data_offset: u32,
    /// Size in bytes of the data payload.
    pub(crate) data_size: u32,
}

// SAFETY: all bit patterns are valid for this type, and it doesn't use interior mutability.
unsafe impl FromBytes for BinHdr {}

/// A firmware blob starting with a [`BinHdr`].
pub(crate) struct BinFirmware<'a> {
    pub(crate) hdr: BinHdr,
    pub(crate) fw: &'a [u8],
}

impl<'a> BinFirmware<'a> {
    /// Interpret `fw` as a firmware image starting with a [`BinHdr`], and returns the
    /// corresponding [`BinFirmware`] that can be used to extract its payload.
    pub(crate) fn new(fw: &'a [u8]) -> Result<Self> {
        let hdr: BinHdr = frombytes_at(fw, 0)?;
        if hdr.bin_magic != BIN_MAGIC {
            warn!("firmware: bad magic {:#x}", hdr.bin_magic);
            return Err(EINVAL);
        }

        Ok(Self { hdr, fw })
    }

    /// Returns the data payload of the firmware, or `EINVAL` if it lies outside the image.
    pub(crate) fn data(&self) -> Result<&'a [u8]> {
        let start = self.hdr.data_offset as usize;
        start
            .checked_add(self.hdr.data_size as usize)
            .and_then(|end| self.fw.get(start..end))
            .ok_or(EINVAL)
    }

    /// Returns a copy of the application-specific header.
    pub(crate) fn header<S: FromBytes>(&self) -> Result<S> {
        frombytes_at(self.fw, self.hdr.header_offset as usize)
    }
}

/// Header of the HS ACR ucode, describing its non-secure loader and its secure application.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HsLoadHeader {
    pub(crate) non_sec_code_off: u32,
    pub(crate) non_sec_code_size: u32,
    pub(crate) data_dma_base: u32,
    pub(crate) data_size: u32,
    pub(crate) num_apps: u32,
    pub(crate) app_start_offset: u32,
    pub(crate) app_size: u32,
}

// SAFETY: all bit patterns are valid for this type, and it doesn't use interior mutability.
unsafe impl FromBytes for HsLoadHeader {}

/// The HS ACR ucode, split into the pieces loaded into the HS falcon.
#[derive(Debug, Clone)]
pub(crate) struct AcrUcode {
    /// Loaded at IMEM 0, not secure.
    pub(crate) non_secure: Vec<u8>,
    /// Loaded after the non-secure code, secure.
    pub(crate) secure: Vec<u8>,
    /// Loaded at DMEM 0.
    pub(crate) data: Vec<u8>,
}

impl AcrUcode {
    pub(crate) fn parse(fw: &[u8]) -> Result<Self> {
        let bin = BinFirmware::new(fw)?;
        let hdr: HsLoadHeader = bin.header()?;
        let img = bin.data()?;

        if hdr.num_apps != 1 {
            warn!("acr: ucode carries {} applications", hdr.num_apps);
            return Err(EINVAL);
        }

        let slice = |off: u32, size: u32| -> Result<Vec<u8>> {
            let off = off as usize;
            off.checked_add(size as usize)
                .and_then(|end| img.get(off..end))
                .map(<[u8]>::to_vec)
                .ok_or(EINVAL)
        };

        Ok(Self {
            non_secure: slice(hdr.non_sec_code_off, hdr.non_sec_code_size)?,
            secure: slice(hdr.app_start_offset, hdr.app_size)?,
            data: slice(hdr.data_dma_base, hdr.data_size)?,
        })
    }
}

/// Descriptor of a LS falcon image. The image is the bootloader followed by the application code
/// and the application data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LsUcodeDesc {
    pub(crate) bin_version: u32,
    pub(crate) bootloader_size: u32,
    pub(crate) bootloader_imem_offset: u32,
    pub(crate) bootloader_entry: u32,
    pub(crate) app_code_size: u32,
    pub(crate) app_data_size: u32,
}

// SAFETY: all bit patterns are valid for this type, and it doesn't use interior mutability.
unsafe impl FromBytes for LsUcodeDesc {}

/// Signature of a LS falcon image, checked by the HS ucode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LsfSignature {
    pub(crate) prd_keys: [u8; 16],
    pub(crate) dbg_keys: [u8; 16],
    pub(crate) b_prd_present: u32,
    pub(crate) b_dbg_present: u32,
    pub(crate) falcon_id: u32,
}

// SAFETY: all bit patterns are valid for this type, and it doesn't use interior mutability.
unsafe impl FromBytes for LsfSignature {}
// SAFETY: byte arrays followed by `u32`s at 4-byte aligned offsets, no padding.
unsafe impl crate::transmute::AsBytes for LsfSignature {}

/// A LS falcon image and its signature.
#[derive(Debug, Clone)]
pub(crate) struct LsFirmware {
    pub(crate) desc: LsUcodeDesc,
    /// Bootloader and application code.
    pub(crate) code: Vec<u8>,
    pub(crate) data: Vec<u8>,
    pub(crate) sig: LsfSignature,
}

impl LsFirmware {
    pub(crate) fn parse(id: FalconId, fw: &[u8], sig: &[u8]) -> Result<Self> {
        let bin = BinFirmware::new(fw)?;
        let desc: LsUcodeDesc = bin.header()?;
        let img = bin.data()?;

        let code_size = desc
            .bootloader_size
            .checked_add(desc.app_code_size)
            .ok_or(EINVAL)? as usize;
        let data_end = code_size
            .checked_add(desc.app_data_size as usize)
            .ok_or(EINVAL)?;
        if img.len() < data_end {
            warn!("acr: {:?} image is truncated", id);
            return Err(EINVAL);
        }

        if sig.len() != size_of::<LsfSignature>() {
            warn!("acr: {:?} signature has bad size {:#x}", id, sig.len());
            return Err(EINVAL);
        }
        let sig: LsfSignature = frombytes_at(sig, 0)?;
        if sig.falcon_id != u32::from(id) {
            warn!("acr: {:?} signature is for falcon {}", id, sig.falcon_id);
            return Err(EINVAL);
        }

        Ok(Self {
            desc,
            code: img[..code_size].to_vec(),
            data: img[code_size..data_end].to_vec(),
            sig,
        })
    }
}

/// File name stem of the LS image of `id`.
pub(crate) fn ls_name(id: FalconId) -> &'static str {
    match id {
        FalconId::Pmu => "pmu",
        FalconId::Fecs => "fecs",
        FalconId::Gpccs => "gpccs",
        FalconId::Nvdec => "nvdec",
        FalconId::Sec2 => "sec2",
    }
}

/// Path of the HS ACR ucode.
pub(crate) fn acr_ucode_path(chipset: Chipset) -> String {
    format!("nvidia/{}/acr/ucode_load.bin", chipset.name())
}

/// Paths of the image and signature of LS falcon `id`.
pub(crate) fn ls_paths(chipset: Chipset, id: FalconId) -> (String, String) {
    let dir = chipset.name();
    let name = ls_name(id);

    (
        format!("nvidia/{dir}/acr/{name}.bin"),
        format!("nvidia/{dir}/acr/{name}_sig.bin"),
    )
}

#[cfg(test)]
pub(crate) mod test_images {
    //! Builders for well-formed images, shared by the tests of the firmware consumers.

    use super::*;
    use crate::transmute::AsBytes;

    #[repr(C)]
    struct Words<const N: usize>([u32; N]);
    // SAFETY: array of `u32`.
    unsafe impl<const N: usize> AsBytes for Words<N> {}

    fn bin(header: &[u8], payload: &[u8]) -> Vec<u8> {
        let header_offset = 24u32;
        let data_offset = header_offset + header.len() as u32;
        let hdr = Words([
            BIN_MAGIC,
            1,
            data_offset + payload.len() as u32,
            header_offset,
            data_offset,
            payload.len() as u32,
        ]);

        let mut out = hdr.as_bytes().to_vec();
        out.extend_from_slice(header);
        out.extend_from_slice(payload);
        out
    }

    /// HS ucode with a 0x100 byte loader, 0x300 bytes of application and 0x100 bytes of data.
    pub(crate) fn acr_ucode() -> Vec<u8> {
        let hdr = Words([0, 0x100, 0x400, 0x100, 1, 0x100, 0x300]);
        let payload: Vec<u8> = (0..0x500u32).map(|i| i as u8).collect();
        bin(hdr.as_bytes(), &payload)
    }

    /// LS image with odd section sizes, so that the blob has to pad every one of them.
    pub(crate) fn ls_image(version: u32) -> Vec<u8> {
        let hdr = Words([version, 0x104, 0, 0x10, 0x1f0, 0x84]);
        let payload = vec![0xa5u8; 0x104 + 0x1f0 + 0x84];
        bin(hdr.as_bytes(), &payload)
    }

    pub(crate) fn ls_sig(id: FalconId) -> Vec<u8> {
        LsfSignature {
            prd_keys: [0x11; 16],
            dbg_keys: [0x22; 16],
            b_prd_present: 1,
            b_dbg_present: 0,
            falcon_id: u32::from(id),
        }
        .as_bytes()
        .to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::test_images::*;
    use super::*;

    #[test]
    fn acr_ucode_split() {
        let ucode = AcrUcode::parse(&acr_ucode()).unwrap();

        assert_eq!(ucode.non_secure.len(), 0x100);
        assert_eq!(ucode.secure.len(), 0x300);
        assert_eq!(ucode.secure[0], 0x00);
        assert_eq!(ucode.data.len(), 0x100);
        assert_eq!(ucode.data[1], 0x01);
    }

    #[test]
    fn bad_magic() {
        let mut fw = acr_ucode();
        fw[0] = 0;
        assert_eq!(AcrUcode::parse(&fw).err(), Some(EINVAL));
    }

    #[test]
    fn ls_signature_must_match() {
        let fw = ls_image(3);
        assert!(LsFirmware::parse(FalconId::Fecs, &fw, &ls_sig(FalconId::Fecs)).is_ok());
        assert_eq!(
            LsFirmware::parse(FalconId::Fecs, &fw, &ls_sig(FalconId::Gpccs)).err(),
            Some(EINVAL)
        );
        assert_eq!(
            LsFirmware::parse(FalconId::Fecs, &fw[..fw.len() - 4], &ls_sig(FalconId::Fecs)).err(),
            Some(EINVAL)
        );
    }

    #[test]
    fn paths() {
        assert_eq!(acr_ucode_path(Chipset::GV11B), "nvidia/gv11b/acr/ucode_load.bin");
        assert_eq!(
            ls_paths(Chipset::TU104, FalconId::Gpccs).1,
            "nvidia/tu104/acr/gpccs_sig.bin"
        );
    }
}
