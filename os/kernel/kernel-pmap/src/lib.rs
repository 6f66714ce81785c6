//! # Physical Map
//!
//! Machine-dependent virtual memory for x86-64: maps virtual pages of an
//! address space to physical frames, remembers every mapping of each physical
//! page, merges uniform runs of 512 small mappings into 2 MiB mappings, and
//! keeps the TLBs of all CPUs sharing an address space coherent.
//!
//! ## What you get
//! - A [`PmapContext`] owning all shared state: page descriptors, the
//!   physical-page lock table, the PV entry allocator and the kernel
//!   [`AddressSpace`].
//! - The address-space operations: [`enter`](PmapContext::enter),
//!   [`remove`](PmapContext::remove), [`protect`](PmapContext::protect),
//!   [`extract`](PmapContext::extract) and friends.
//! - The per-page operations the page-replacement code needs:
//!   [`ts_referenced`](PmapContext::ts_referenced),
//!   [`clear_modify`](PmapContext::clear_modify),
//!   [`remove_all`](PmapContext::remove_all) and friends.
//! - Three collaborator traits: [`FrameAlloc`], [`PhysMapper`] and
//!   [`TlbHardware`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB
//!   │        │        └────────────► PDE   → PS=1 → maps 2 MiB
//!   │        └─────────────────────► PDPTE (never a leaf here)
//!   └──────────────────────────────► PML4E
//! ```
//!
//! Every table page below the root has a wire count equal to its number of
//! present entries and is freed when that drops to zero (user address spaces
//! only). PML4 slot 256 maps the PML4 onto itself, so every table page is
//! also visible through the [recursive window](info::PAGE_TABLE_WINDOW);
//! freeing a table page therefore invalidates its window address too.
//!
//! ## Reverse mappings
//!
//! Each managed mapping has one PV entry on the list of the page it maps (or
//! of the 2 MiB region, for 2 MiB mappings). See [`pv`].
//!
//! ## Locking
//!
//! Physical-page locks (hashed per 2 MiB region) are taken before the lock
//! of an address space. An operation that discovers it needs another
//! physical-page lock while holding an address-space lock backs off and
//! rescans; an operation that must wait for memory first drops everything.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod config;
mod context;
pub mod entry;
mod enter;
mod error;
mod extract;
pub mod page;
mod page_ops;
mod promote;
mod protect;
mod protection;
pub mod pv;
mod pv_lock;
mod radix;
mod remove;
pub mod shootdown;
mod stats;
mod table;
mod verify;

#[cfg(test)]
mod sim;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

pub use crate::address_space::{AddressSpace, AddressSpaceStats, PmapId};
pub use crate::config::PmapConfig;
pub use crate::context::PmapContext;
pub use crate::entry::{MemAttr, PageEntryBits};
pub use crate::error::{PmapError, PvAllocError};
pub use crate::extract::PageHold;
pub use crate::page::{PageDescriptor, PageFlags, PageTableKind, PhysicalMemory};
pub use crate::protection::{EnterFlags, Protection};
pub use crate::pv::{AllocPolicy, PV_PER_CHUNK};
pub use crate::pv_lock::{PV_LOCK_COUNT, pv_lock_slot};
pub use crate::shootdown::{CpuId, CpuSet, TlbHardware, TlbRequest};
pub use crate::stats::PmapStatsSnapshot;
pub use crate::verify::Mapping;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of physical 4 KiB frames for page-table pages and PV chunks.
///
/// Allocation never blocks. When it fails, callers that may wait release
/// every lock first and then call [`wait_for_free`](Self::wait_for_free).
pub trait FrameAlloc: Sync {
    /// One free frame, or `None` right now.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;

    /// Returns a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, page: PhysicalPage<Size4K>);

    /// Blocks until frames were freed. Never called with a lock held.
    fn wait_for_free(&self);
}

/// Converts physical addresses to references in the current virtual address
/// space (a direct map in the kernel, plain memory in tests).
pub trait PhysMapper: Sync {
    /// # Safety
    /// - `pa` must be mapped for the whole of `'a` and hold a valid `T`.
    /// - `T` may only use interior mutability; the frame is shared with other
    ///   CPUs and with the MMU.
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T;
}
