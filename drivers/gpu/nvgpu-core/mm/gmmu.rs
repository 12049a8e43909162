// SPDX-License-Identifier: GPL-2.0

//! GMMU page table format.
//!
//! Pascal, Volta and Turing share the five level format: four directory levels (PD3 to PD0)
//! followed by a page table. PD0 entries are dual, pointing at both a big page table and a small
//! page table for the same 2 MiB of VA.

use crate::dma::{aperture_mask_raw, Aperture};

pub(crate) const SMALL_PAGE_SIZE: u64 = 4096;
pub(crate) const BIG_PAGE_SIZE_64K: u64 = 64 << 10;

/// Size of the pages mapped by a page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageSize {
    Small,
    Big,
}

impl PageSize {
    pub(crate) fn bytes(self, big_page_size: u64) -> u64 {
        match self {
            PageSize::Small => SMALL_PAGE_SIZE,
            PageSize::Big => big_page_size,
        }
    }
}

/// One level of the page table tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Level {
    /// VA bits indexing this level.
    pub(crate) hi: u32,
    pub(crate) lo: u32,
    pub(crate) entry_size: usize,
}

impl Level {
    pub(crate) const fn new(hi: u32, lo: u32, entry_size: usize) -> Self {
        Self { hi, lo, entry_size }
    }

    pub(crate) fn index(&self, va: u64) -> usize {
        ((va >> self.lo) & ((1 << (self.hi - self.lo + 1)) - 1)) as usize
    }

    pub(crate) fn entries(&self) -> usize {
        1 << (self.hi - self.lo + 1)
    }

    /// Size in bytes of a directory or table of this level.
    pub(crate) fn size(&self) -> usize {
        self.entries() * self.entry_size
    }
}

/// Directory levels, root first.
pub(crate) const PD_LEVELS: [Level; 4] = [
    Level::new(48, 47, 8),
    Level::new(46, 38, 8),
    Level::new(37, 29, 8),
    Level::new(28, 21, 16),
];

/// Page table of the given page size.
pub(crate) const fn pt_level(pgsz: PageSize) -> Level {
    match pgsz {
        PageSize::Small => Level::new(20, 12, 8),
        PageSize::Big => Level::new(20, 16, 8),
    }
}

/// Offset of the big and small halves inside a dual PD0 entry.
pub(crate) const PDE0_BIG_OFFSET: usize = 0;
pub(crate) const PDE0_SMALL_OFFSET: usize = 8;

const PDE_APERTURE_SHIFT: u32 = 1;
const PDE_APERTURE_VIDMEM: u32 = 1;
const PDE_APERTURE_SYS_COH: u32 = 2;
const PDE_APERTURE_SYS_NONCOH: u32 = 3;
const PDE_VOL: u64 = 1 << 3;
const ADDR_SHIFT: u32 = 12;
const ADDR_FIELD_SHIFT: u32 = 8;

const PTE_VALID: u64 = 1 << 0;
const PTE_APERTURE_SHIFT: u32 = 1;
const PTE_APERTURE_VIDMEM: u32 = 0;
const PTE_APERTURE_SYS_COH: u32 = 2;
const PTE_APERTURE_SYS_NONCOH: u32 = 3;
const PTE_VOL: u64 = 1 << 3;
const PTE_PRIV: u64 = 1 << 5;
const PTE_READ_ONLY: u64 = 1 << 6;
const PTE_KIND_SHIFT: u32 = 56;

/// Bit set in sysmem addresses going through the IOMMU.
pub(crate) const IOMMU_BIT: u64 = 1 << 34;

/// Encodes a directory entry pointing at a directory or table at `addr`.
pub(crate) fn pde(honors_aperture: bool, aperture: Aperture, addr: u64) -> u64 {
    let ap = aperture_mask_raw(
        honors_aperture,
        aperture,
        PDE_APERTURE_SYS_NONCOH,
        PDE_APERTURE_SYS_COH,
        PDE_APERTURE_VIDMEM,
    );
    let vol = if aperture.is_sysmem() { PDE_VOL } else { 0 };

    (u64::from(ap) << PDE_APERTURE_SHIFT) | vol | ((addr >> ADDR_SHIFT) << ADDR_FIELD_SHIFT)
}

/// Attributes of a mapping that end up in its PTEs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PteAttrs {
    pub(crate) kind: u8,
    pub(crate) cacheable: bool,
    pub(crate) read_only: bool,
    pub(crate) privileged: bool,
}

/// Encodes a valid PTE for the page at `addr`.
pub(crate) fn pte(honors_aperture: bool, aperture: Aperture, addr: u64, attrs: PteAttrs) -> u64 {
    let ap = aperture_mask_raw(
        honors_aperture,
        aperture,
        PTE_APERTURE_SYS_NONCOH,
        PTE_APERTURE_SYS_COH,
        PTE_APERTURE_VIDMEM,
    );

    let mut pte = PTE_VALID
        | (u64::from(ap) << PTE_APERTURE_SHIFT)
        | ((addr >> ADDR_SHIFT) << ADDR_FIELD_SHIFT)
        | (u64::from(attrs.kind) << PTE_KIND_SHIFT);
    if !attrs.cacheable {
        pte |= PTE_VOL;
    }
    if attrs.read_only {
        pte |= PTE_READ_ONLY;
    }
    if attrs.privileged {
        pte |= PTE_PRIV;
    }

    pte
}

/// PTE of a sparse page: not valid, but accesses do not fault.
pub(crate) const PTE_SPARSE: u64 = PTE_VOL;

pub(crate) fn pte_is_valid(pte: u64) -> bool {
    pte & PTE_VALID != 0
}

/// Page address encoded in a PTE or PDE.
pub(crate) fn entry_addr(entry: u64) -> u64 {
    ((entry >> ADDR_FIELD_SHIFT) & ((1 << (PTE_KIND_SHIFT - ADDR_FIELD_SHIFT)) - 1)) << ADDR_SHIFT
}

pub(crate) fn pte_kind(pte: u64) -> u8 {
    (pte >> PTE_KIND_SHIFT) as u8
}

pub(crate) fn pte_read_only(pte: u64) -> bool {
    pte & PTE_READ_ONLY != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sizes() {
        assert_eq!(PD_LEVELS[0].size(), 32);
        assert_eq!(PD_LEVELS[1].size(), 4096);
        assert_eq!(PD_LEVELS[3].size(), 4096);
        assert_eq!(pt_level(PageSize::Small).size(), 4096);
        assert_eq!(pt_level(PageSize::Big).size(), 256);
    }

    #[test]
    fn indices() {
        let va = (3 << 38) | (5 << 29) | (7 << 21) | (9 << 12);
        assert_eq!(PD_LEVELS[1].index(va), 3);
        assert_eq!(PD_LEVELS[2].index(va), 5);
        assert_eq!(PD_LEVELS[3].index(va), 7);
        assert_eq!(pt_level(PageSize::Small).index(va), 9);
        assert_eq!(pt_level(PageSize::Big).index(va), 0);
    }

    #[test]
    fn pte_encoding() {
        let attrs = PteAttrs {
            kind: 0xfe,
            cacheable: true,
            read_only: true,
            privileged: false,
        };
        let e = pte(true, Aperture::Sysmem, 0x1_2345_6000, attrs);

        assert!(pte_is_valid(e));
        assert_eq!(entry_addr(e), 0x1_2345_6000);
        assert_eq!(pte_kind(e), 0xfe);
        assert!(pte_read_only(e));
        assert_eq!((e >> 1) & 3, 3);

        // Integrated GPUs describe sysmem as vidmem.
        let e = pte(false, Aperture::Sysmem, 0x1000, PteAttrs::default());
        assert_eq!((e >> 1) & 3, 0);
        assert!(!pte_is_valid(PTE_SPARSE));
    }

    #[test]
    fn pde_encoding() {
        let e = pde(true, Aperture::Vidmem, 0x20_0000);
        assert_eq!((e >> 1) & 3, 1);
        assert_eq!(e & (1 << 3), 0);
        assert_eq!(entry_addr(e), 0x20_0000);
    }
}
