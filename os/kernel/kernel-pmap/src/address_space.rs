//! # Address spaces
//!
//! An [`AddressSpace`] is one root page table plus the bookkeeping guarded by
//! its lock. All operations on it go through
//! [`PmapContext`](crate::PmapContext).

use alloc::collections::{BTreeMap, VecDeque};
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::{SpinLock, SpinLockGuard};

use crate::shootdown::{AtomicCpuSet, CpuSet};

/// Identifier of an address space; PV chunks record their owner by id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(u32);

impl PmapId {
    /// The kernel address space.
    pub const KERNEL: Self = Self(0);

    #[must_use]
    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pmap#{}", self.0)
    }
}

/// State protected by the address-space lock.
#[derive(Debug, Default)]
pub(crate) struct PmapState {
    /// Mapped 4 KiB pages (a 2 MiB mapping counts 512) plus page-table pages
    /// below the root.
    pub resident: u64,
    /// Wired mappings, in 4 KiB pages.
    pub wired: u64,
    /// Page tables kept behind 2 MiB mappings, keyed by `va >> 21`.
    pub idle_ptps: BTreeMap<u64, PhysicalPage<Size4K>>,
    /// PV chunks owned by this address space; chunks with free slots first.
    pub pv_chunks: VecDeque<PhysicalPage<Size4K>>,
}

impl PmapState {
    /// # Panics
    /// If a page table is already parked for `index`.
    pub fn park_ptp(&mut self, index: u64, page: PhysicalPage<Size4K>) {
        let prev = self.idle_ptps.insert(index, page);
        assert!(prev.is_none(), "idle page table for index {index:#x} already present");
    }

    pub fn unpark_ptp(&mut self, index: u64) -> Option<PhysicalPage<Size4K>> {
        self.idle_ptps.remove(&index)
    }
}

pub(crate) type PmapGuard<'a> = SpinLockGuard<'a, PmapState>;

/// Counters of one address space.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AddressSpaceStats {
    pub resident: u64,
    pub wired: u64,
    pub idle_page_tables: usize,
    pub pv_chunks: usize,
}

pub struct AddressSpace {
    id: PmapId,
    root: PhysicalPage<Size4K>,
    active: AtomicCpuSet,
    pub(crate) state: SpinLock<PmapState>,
}

impl AddressSpace {
    pub(crate) fn new(id: PmapId, root: PhysicalPage<Size4K>, active: CpuSet) -> Self {
        let space = Self {
            id,
            root,
            active: AtomicCpuSet::default(),
            state: SpinLock::new(PmapState::default()),
        };
        space.active.store(active);
        space
    }

    #[must_use]
    pub const fn id(&self) -> PmapId {
        self.id
    }

    /// Physical frame of the PML4.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.id == PmapId::KERNEL
    }

    /// CPUs that currently have this address space loaded.
    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        self.active.load()
    }

    pub(crate) const fn active(&self) -> &AtomicCpuSet {
        &self.active
    }

    #[must_use]
    pub fn stats(&self) -> AddressSpaceStats {
        let st = self.state.lock();
        AddressSpaceStats {
            resident: st.resident,
            wired: st.wired,
            idle_page_tables: st.idle_ptps.len(),
            pv_chunks: st.pv_chunks.len(),
        }
    }

    #[must_use]
    pub fn resident_count(&self) -> u64 {
        self.state.lock().resident
    }

    #[must_use]
    pub fn wired_count(&self) -> u64 {
        self.state.lock().wired
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("active", &self.active.load())
            .finish_non_exhaustive()
    }
}
