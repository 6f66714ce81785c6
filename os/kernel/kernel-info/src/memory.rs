//! # Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │  PML4 0..=255
//! USER_END              ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │    (non-canonical hole)         │
//! PAGE_TABLE_WINDOW     ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  Recursive self-map (PML4 256)  │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_VA_START       ├─────────────────────────────────┤ 0xffff_ff80_0000_0000
//!                       │  Kernel mappings (PML4 511)     │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

use kernel_memory_addresses::VirtualAddress;

/// First address past the user range. User mappings live strictly below.
pub const USER_END: u64 = 0x0000_8000_0000_0000;

/// PML4 slot that points back at the PML4 itself.
pub const SELF_MAP_PML4_INDEX: usize = 256;

/// Base of the recursive window: the PTE for `va` is visible at
/// `PAGE_TABLE_WINDOW + (va >> 12) * 8`.
pub const PAGE_TABLE_WINDOW: u64 = 0xffff_8000_0000_0000;

/// Page directories as seen through the recursive window.
pub const PAGE_DIRECTORY_WINDOW: u64 = PAGE_TABLE_WINDOW + ((SELF_MAP_PML4_INDEX as u64) << 30);

/// Page-directory-pointer tables as seen through the recursive window.
pub const PAGE_DIRECTORY_POINTER_WINDOW: u64 =
    PAGE_DIRECTORY_WINDOW + ((SELF_MAP_PML4_INDEX as u64) << 21);

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// PML4 slot holding every kernel mapping the physical map manages. The
/// page-directory-pointer table below it is shared by all address spaces.
pub const KERNEL_PML4_INDEX: usize = 511;

/// Lowest kernel virtual address managed by the physical map.
pub const KERNEL_VA_START: u64 = 0xffff_ff80_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

const VA_BITS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Whether `va` belongs to the user half.
#[inline]
#[must_use]
pub const fn is_user_address(va: VirtualAddress) -> bool {
    va.as_u64() < USER_END
}

/// Address at which the 4 KiB entry mapping `va` is visible through the
/// recursive window. Also the address at which the page table covering `va`
/// is visible one level up.
#[inline]
#[must_use]
pub const fn self_map_pte(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(PAGE_TABLE_WINDOW + (((va.as_u64() & VA_BITS_MASK) >> 12) << 3))
}

/// Address at which the page-directory entry covering `va` is visible.
#[inline]
#[must_use]
pub const fn self_map_pde(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(PAGE_DIRECTORY_WINDOW + (((va.as_u64() & VA_BITS_MASK) >> 21) << 3))
}

/// Virtual address of the page table with global index `pde_index`
/// (`va >> 21`) inside the recursive window.
#[inline]
#[must_use]
pub const fn self_map_page_table(pde_index: u64) -> VirtualAddress {
    VirtualAddress::new(PAGE_TABLE_WINDOW + (pde_index << 12))
}

/// Virtual address of the page directory with global index `pdpe_index`
/// (`va >> 30`) inside the recursive window.
#[inline]
#[must_use]
pub const fn self_map_page_directory(pdpe_index: u64) -> VirtualAddress {
    VirtualAddress::new(PAGE_DIRECTORY_WINDOW + (pdpe_index << 12))
}

/// Virtual address of the page-directory-pointer table for PML4 slot
/// `pml4_index` inside the recursive window.
#[inline]
#[must_use]
pub const fn self_map_page_directory_pointer(pml4_index: u64) -> VirtualAddress {
    VirtualAddress::new(PAGE_DIRECTORY_POINTER_WINDOW + (pml4_index << 12))
}

const _: () = {
    assert!(PAGE_TABLE_WINDOW == 0xffff_0000_0000_0000 | ((SELF_MAP_PML4_INDEX as u64) << 39));
    assert!(HHDM_BASE > PAGE_TABLE_WINDOW);
    assert!(KERNEL_VA_START == 0xffff_0000_0000_0000 | ((KERNEL_PML4_INDEX as u64) << 39));
    assert!(KERNEL_BASE > KERNEL_VA_START);
    assert!(USER_END <= PAGE_TABLE_WINDOW);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_window_addresses() {
        let va = VirtualAddress::new(0x0000_0000_0040_3000);
        // PTE index 0x403 -> byte offset 0x2018
        assert_eq!(self_map_pte(va).as_u64(), PAGE_TABLE_WINDOW + 0x403 * 8);
        assert_eq!(self_map_pde(va).as_u64(), PAGE_DIRECTORY_WINDOW + 2 * 8);
        assert_eq!(self_map_page_table(2).as_u64(), PAGE_TABLE_WINDOW + 0x2000);
        assert_eq!(self_map_pte(va).pml4_index(), SELF_MAP_PML4_INDEX);
        assert_eq!(self_map_pde(va).pdpt_index(), SELF_MAP_PML4_INDEX);
    }

    #[test]
    fn halves() {
        assert!(is_user_address(VirtualAddress::new(USER_END - 1)));
        assert!(!is_user_address(VirtualAddress::new(KERNEL_VA_START)));
    }
}
