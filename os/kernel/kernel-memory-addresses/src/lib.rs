//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used in
//! paging and memory management code.
//!
//! ## Overview
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical frames. |
//!
//! ## Page Sizes
//!
//! Marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (base granularity)
//! - [`Size2M`]: 2 MiB superpages
//! - [`Size1G`]: 1 GiB, the reach of one page-directory-pointer entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0040_1234);
//! let frame = pa.page::<Size4K>();
//! assert_eq!(frame.pfn(), 0x401);
//! assert_eq!(pa.page::<Size2M>().base().as_u64(), 0x0040_0000);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys.
//! - The phantom marker `S` enforces the page size at the type level instead of
//!   using constants, so all conversions are explicit.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::{ENTRIES_PER_TABLE, VirtualAddress};
pub use virtual_page::VirtualPage;
