//! # Paging-structure entries
//!
//! [`PageEntryBits`] is the common superset view of a PML4E, PDPTE, PDE or PTE.
//! Bit-level predicates used by promotion and protection changes work on the
//! raw masks in [`bits`]; everything else goes through the bitfield accessors.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Raw bit masks, for comparisons across many entries at once.
pub mod bits {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const WRITE_THROUGH: u64 = 1 << 3;
    pub const CACHE_DISABLE: u64 = 1 << 4;
    pub const ACCESSED: u64 = 1 << 5;
    pub const DIRTY: u64 = 1 << 6;
    /// PS in a page-directory entry.
    pub const PAGE_SIZE: u64 = 1 << 7;
    /// PAT in a 4 KiB entry (same position as PS).
    pub const PTE_PAT: u64 = 1 << 7;
    pub const GLOBAL: u64 = 1 << 8;
    pub const WIRED: u64 = 1 << 9;
    pub const MANAGED: u64 = 1 << 10;
    pub const PROMOTED: u64 = 1 << 11;
    /// PAT in a 2 MiB entry.
    pub const PDE_PAT: u64 = 1 << 12;
    pub const NO_EXECUTE: u64 = 1 << 63;

    /// Frame bits of a 4 KiB entry or a table pointer.
    pub const FRAME: u64 = 0x000F_FFFF_FFFF_F000;
    /// Frame bits of a 2 MiB entry.
    pub const LARGE_FRAME: u64 = 0x000F_FFFF_FFE0_0000;

    /// Bits that must agree across all 512 entries before they may be
    /// replaced by one 2 MiB entry.
    pub const PROMOTE_MASK: u64 = NO_EXECUTE
        | MANAGED
        | WIRED
        | GLOBAL
        | PTE_PAT
        | DIRTY
        | ACCESSED
        | CACHE_DISABLE
        | WRITE_THROUGH
        | USER
        | WRITABLE
        | PRESENT;
}

/// A single 64-bit x86-64 paging-structure entry.
///
/// ### Bit layout
///
/// | Bits  | Name        | Meaning |
/// |-------|-------------|---------|
/// | 0     | `P`         | Valid entry if set |
/// | 1     | `RW`        | Writable if set |
/// | 2     | `US`        | User-mode accessible if set |
/// | 3     | `PWT`       | Write-through caching |
/// | 4     | `PCD`       | Disable caching |
/// | 5     | `A`         | Accessed |
/// | 6     | `D`         | Dirty (leaf only) |
/// | 7     | `PS` / `PAT`| Large page in a PDE, PAT in a PTE |
/// | 8     | `G`         | Global (leaf only) |
/// | 9     | wired       | Software: mapping may not be reclaimed |
/// | 10    | managed     | Software: mapping is tracked by a PV entry |
/// | 11    | promoted    | Software: 2 MiB entry created by promotion |
/// | 12–51 | `addr`      | Physical frame bits (bit 12 is PAT in a 2 MiB entry) |
/// | 63    | `NX`        | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_pmap::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalAddress;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_frame(PhysicalAddress::new(0x12_3000));
/// assert!(e.present());
/// assert_eq!(e.frame().as_u64(), 0x12_3000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2).
    pub user_access: bool,
    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,
    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5). Set by the MMU.
    pub accessed: bool,
    /// Dirty (D, bit 6). Set by the MMU on the first write through a leaf.
    pub dirty: bool,
    /// PS (bit 7) in a PDE; the PAT bit in a 4 KiB PTE.
    pub large_page: bool,
    /// Global (G, bit 8); leaf only.
    pub global_translation: bool,
    /// Software bit 9: wired mapping.
    pub wired: bool,
    /// Software bit 10: mapping of a managed page, with a PV entry.
    pub managed: bool,
    /// Software bit 11: 2 MiB entry produced by promotion.
    pub promoted: bool,
    /// Physical address bits [51:12]. Prefer [`PageEntryBits::frame`].
    #[bits(40)]
    pub phys_addr_bits_51_12: u64,
    /// Bits 52–62: available to software and protection keys, unused.
    #[bits(11)]
    __: u16,
    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    /// The all-zero (not present) entry.
    pub const EMPTY: Self = Self::new();

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self::from_bits(raw)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }

    /// Whether every bit in `mask` is set.
    #[inline]
    #[must_use]
    pub const fn has_all(self, mask: u64) -> bool {
        self.into_bits() & mask == mask
    }

    /// 4 KiB frame (or next-level table) this entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & bits::FRAME)
    }

    #[inline]
    #[must_use]
    pub const fn frame_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.frame())
    }

    /// 2 MiB frame of a PS entry; ignores the PDE PAT bit.
    #[inline]
    #[must_use]
    pub const fn large_frame(self) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & bits::LARGE_FRAME)
    }

    /// Replaces the frame bits; `pa` must be 4 KiB aligned.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, pa: PhysicalAddress) -> Self {
        Self::from_bits((self.into_bits() & !bits::FRAME) | (pa.as_u64() & bits::FRAME))
    }

    /// A present PS entry at the page-directory level.
    #[inline]
    #[must_use]
    pub const fn is_superpage(self) -> bool {
        self.has_all(bits::PRESENT | bits::PAGE_SIZE)
    }

    /// Writable and already dirtied; the mapping's page must be treated as
    /// modified when this entry goes away.
    #[inline]
    #[must_use]
    pub const fn is_dirty_writable(self) -> bool {
        self.has_all(bits::WRITABLE | bits::DIRTY)
    }

    /// Pointer to a next-level table. Intermediate entries are maximally
    /// permissive; the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_accessed(true)
            .with_dirty(true)
            .with_user_access(user)
            .with_frame(table.base())
    }

    /// Converts a 4 KiB leaf into the matching 2 MiB leaf bits (PAT moves
    /// from bit 7 to bit 12, PS is set).
    #[inline]
    #[must_use]
    pub const fn small_to_large(self) -> Self {
        let mut raw = self.into_bits();
        if raw & bits::PTE_PAT != 0 {
            raw ^= bits::PTE_PAT | bits::PDE_PAT;
        }
        Self::from_bits(raw | bits::PAGE_SIZE)
    }

    /// Converts a 2 MiB leaf into the 4 KiB leaf bits for its first page
    /// (PS cleared, PAT moves from bit 12 to bit 7).
    #[inline]
    #[must_use]
    pub const fn large_to_small(self) -> Self {
        let mut raw = self.into_bits() & !bits::PAGE_SIZE;
        if raw & bits::PDE_PAT != 0 {
            raw ^= bits::PTE_PAT | bits::PDE_PAT;
        }
        Self::from_bits(raw)
    }
}

/// Cache attribute of a physical page, expressed through the PAT index.
///
/// The PAT MSR is assumed to be programmed as
/// `WB, WT, UC-, UC, WB, WP, WC, UC` so that every mode below has a fixed
/// index.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemAttr {
    #[default]
    WriteBack = 0,
    WriteThrough = 1,
    UncacheableMinus = 2,
    Uncacheable = 3,
    WriteProtected = 5,
    WriteCombining = 6,
}

impl MemAttr {
    #[must_use]
    pub const fn pat_index(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_pat_index(index: u8) -> Option<Self> {
        Some(match index {
            0 | 4 => Self::WriteBack,
            1 => Self::WriteThrough,
            2 => Self::UncacheableMinus,
            3 | 7 => Self::Uncacheable,
            5 => Self::WriteProtected,
            6 => Self::WriteCombining,
            _ => return None,
        })
    }

    /// PWT/PCD/PAT bits selecting this mode in a 4 KiB (`large == false`) or
    /// 2 MiB entry.
    #[must_use]
    pub const fn cache_bits(self, large: bool) -> u64 {
        let index = self.pat_index();
        let pat = if large { bits::PDE_PAT } else { bits::PTE_PAT };
        let mut out = 0;
        if index & 1 != 0 {
            out |= bits::WRITE_THROUGH;
        }
        if index & 2 != 0 {
            out |= bits::CACHE_DISABLE;
        }
        if index & 4 != 0 {
            out |= pat;
        }
        out
    }

    /// Decodes the cache mode of a leaf entry.
    #[must_use]
    pub const fn of_entry(entry: PageEntryBits, large: bool) -> Self {
        let raw = entry.raw();
        let pat = if large { bits::PDE_PAT } else { bits::PTE_PAT };
        let mut index = 0;
        if raw & bits::WRITE_THROUGH != 0 {
            index |= 1;
        }
        if raw & bits::CACHE_DISABLE != 0 {
            index |= 2;
        }
        if raw & pat != 0 {
            index |= 4;
        }
        match Self::from_pat_index(index) {
            Some(m) => m,
            None => Self::Uncacheable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_bits_positions() {
        let e = PageEntryBits::new()
            .with_wired(true)
            .with_managed(true)
            .with_promoted(true);
        assert_eq!(e.raw(), bits::WIRED | bits::MANAGED | bits::PROMOTED);
    }

    #[test]
    fn frame_accessors_mask_flags() {
        let e = PageEntryBits::from_raw(0x8000_0000_0060_1067 | bits::PDE_PAT);
        assert_eq!(e.frame().as_u64(), 0x60_1000 | bits::PDE_PAT);
        assert_eq!(e.large_frame().as_u64(), 0x60_0000);
        assert!(e.no_execute());
    }

    #[test]
    fn pat_moves_between_levels() {
        let small = PageEntryBits::from_raw(0x40_0000 | bits::PRESENT)
            .with_frame(PhysicalAddress::new(0x40_0000))
            .with_large_page(true); // PAT in a PTE
        let large = small.small_to_large();
        assert!(large.is_superpage());
        assert_eq!(large.raw() & bits::PDE_PAT, bits::PDE_PAT);
        assert_eq!(large.large_frame().as_u64(), 0x40_0000);
        let back = large.large_to_small();
        assert_eq!(back, small);
    }

    #[test]
    fn cache_bits_roundtrip_for_every_mode() {
        for attr in [
            MemAttr::WriteBack,
            MemAttr::WriteThrough,
            MemAttr::UncacheableMinus,
            MemAttr::Uncacheable,
            MemAttr::WriteProtected,
            MemAttr::WriteCombining,
        ] {
            for large in [false, true] {
                let e = PageEntryBits::from_raw(bits::PRESENT | attr.cache_bits(large));
                assert_eq!(MemAttr::of_entry(e, large), attr);
            }
        }
        assert_eq!(MemAttr::WriteCombining.cache_bits(true), bits::CACHE_DISABLE | bits::PDE_PAT);
    }

    #[test]
    fn table_link_is_permissive() {
        let e = PageEntryBits::table_link(PhysicalPage::from_pfn(0x1234), true);
        assert!(e.present() && e.writable() && e.user_access());
        assert!(!e.no_execute());
        assert_eq!(e.frame().pfn(), 0x1234);
    }
}
