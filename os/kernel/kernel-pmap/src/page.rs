//! # Physical page descriptors
//!
//! Every 4 KiB frame under management has a [`PageDescriptor`] holding its PV
//! list head, cache attribute, flags and, for page-table pages, the wire count
//! and [`PageTableKind`]. Every 2 MiB region additionally has a superpage PV
//! list head.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K};

use crate::entry::MemAttr;
use crate::pv::PvRef;

/// The span of physical memory described by page descriptors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysicalMemory {
    pub base: PhysicalPage<Size4K>,
    pub frames: u64,
}

impl PhysicalMemory {
    #[must_use]
    pub const fn new(base: PhysicalPage<Size4K>, frames: u64) -> Self {
        Self { base, frames }
    }

    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        let pfn = pa.pfn();
        pfn >= self.base.pfn() && pfn < self.base.pfn() + self.frames
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Mappings of this page are tracked by PV entries.
        const MANAGED = 1 << 0;
        /// Some mapping of this page may be writable.
        const WRITEABLE = 1 << 1;
        /// A dirty mapping was torn down or write-protected.
        const DIRTY = 1 << 2;
        /// An accessed mapping was torn down.
        const REFERENCED = 1 << 3;
    }
}

/// Which level a page-table page serves and which slice of the address space
/// it covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PageTableKind {
    /// Page table (4 KiB leaves) for the 2 MiB region `va >> 21`.
    Table(u64),
    /// Page directory for the 1 GiB region `va >> 30`.
    Directory(u64),
    /// Page-directory-pointer table for PML4 slot `va >> 39`.
    DirectoryPointer(u64),
}

impl PageTableKind {
    const TAG_SHIFT: u32 = 60;
    const INDEX_MASK: u64 = (1 << Self::TAG_SHIFT) - 1;

    const fn encode(self) -> u64 {
        match self {
            Self::Table(i) => (1 << Self::TAG_SHIFT) | i,
            Self::Directory(i) => (2 << Self::TAG_SHIFT) | i,
            Self::DirectoryPointer(i) => (3 << Self::TAG_SHIFT) | i,
        }
    }

    const fn decode(raw: u64) -> Option<Self> {
        let index = raw & Self::INDEX_MASK;
        match raw >> Self::TAG_SHIFT {
            1 => Some(Self::Table(index)),
            2 => Some(Self::Directory(index)),
            3 => Some(Self::DirectoryPointer(index)),
            _ => None,
        }
    }
}

/// Head of a doubly linked PV list.
///
/// Mutated only under the physical-page lock of the page (or 2 MiB region) it
/// belongs to; the atomics provide interior mutability, not lock freedom.
#[derive(Debug, Default)]
pub struct PvHead {
    head: AtomicU64,
    tail: AtomicU64,
    len: AtomicU32,
}

impl PvHead {
    #[must_use]
    pub fn first(&self) -> Option<PvRef> {
        PvRef::from_raw(self.head.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn last(&self) -> Option<PvRef> {
        PvRef::from_raw(self.tail.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    pub(crate) fn set_first(&self, r: Option<PvRef>) {
        self.head.store(PvRef::into_raw(r), Ordering::Relaxed);
    }

    pub(crate) fn set_last(&self, r: Option<PvRef>) {
        self.tail.store(PvRef::into_raw(r), Ordering::Relaxed);
    }

    pub(crate) fn changed(&self, delta: i32) {
        self.len.fetch_add(delta.cast_unsigned(), Ordering::Relaxed);
    }
}

/// Per-frame bookkeeping.
#[derive(Debug)]
pub struct PageDescriptor {
    pub(crate) pv: PvHead,
    flags: AtomicU8,
    memattr: AtomicU8,
    hold_count: AtomicU32,
    wire_count: AtomicU32,
    ptp: AtomicU64,
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self {
            pv: PvHead::default(),
            flags: AtomicU8::new(PageFlags::MANAGED.bits()),
            memattr: AtomicU8::new(MemAttr::WriteBack.pat_index()),
            hold_count: AtomicU32::new(0),
            wire_count: AtomicU32::new(0),
            ptp: AtomicU64::new(0),
        }
    }
}

impl PageDescriptor {
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, f: PageFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, f: PageFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.flags().contains(PageFlags::MANAGED)
    }

    #[must_use]
    pub fn memattr(&self) -> MemAttr {
        MemAttr::from_pat_index(self.memattr.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub(crate) fn set_memattr(&self, attr: MemAttr) {
        self.memattr.store(attr.pat_index(), Ordering::Relaxed);
    }

    /// Number of outstanding [`PageHold`](crate::PageHold)s.
    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.hold_count.load(Ordering::Acquire)
    }

    pub(crate) fn hold(&self) {
        self.hold_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unhold(&self) {
        let prev = self.hold_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "page hold count underflow");
    }

    /// For page-table pages: number of present entries.
    #[must_use]
    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wire_count(&self, n: u32) {
        self.wire_count.store(n, Ordering::Relaxed);
    }

    pub(crate) fn wire(&self) {
        self.wire_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference and returns the remaining count.
    pub(crate) fn unwire(&self) -> u32 {
        let prev = self.wire_count.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "page-table page wire count underflow");
        prev - 1
    }

    #[must_use]
    pub fn table_kind(&self) -> Option<PageTableKind> {
        PageTableKind::decode(self.ptp.load(Ordering::Relaxed))
    }

    pub(crate) fn set_table_kind(&self, kind: Option<PageTableKind>) {
        self.ptp
            .store(kind.map_or(0, PageTableKind::encode), Ordering::Relaxed);
    }
}

/// Descriptors for all managed frames plus the per-2 MiB superpage PV heads.
pub(crate) struct PageArray {
    memory: PhysicalMemory,
    first_region: u64,
    pages: Box<[PageDescriptor]>,
    superpages: Box<[PvHead]>,
}

impl PageArray {
    pub fn new(memory: PhysicalMemory) -> Self {
        let start = memory.base.base().as_u64();
        let end = start + memory.frames * Size4K::SIZE;
        let first_region = start >> Size2M::SHIFT;
        let regions = end.div_ceil(Size2M::SIZE) - first_region;
        #[allow(clippy::cast_possible_truncation)]
        let pages = (0..memory.frames as usize)
            .map(|_| PageDescriptor::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        #[allow(clippy::cast_possible_truncation)]
        let superpages = (0..regions as usize)
            .map(|_| PvHead::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            memory,
            first_region,
            pages,
            superpages,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn get(&self, pa: PhysicalAddress) -> Option<&PageDescriptor> {
        if !self.memory.contains(pa) {
            return None;
        }
        self.pages.get((pa.pfn() - self.memory.base.pfn()) as usize)
    }

    /// Descriptor of a frame that must be managed (page-table pages,
    /// mapped pages).
    pub fn descriptor(&self, pa: PhysicalAddress) -> &PageDescriptor {
        match self.get(pa) {
            Some(d) => d,
            None => panic!("physical address {pa} has no page descriptor"),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn superpage(&self, pa: PhysicalAddress) -> &PvHead {
        let region = (pa.as_u64() >> Size2M::SHIFT).wrapping_sub(self.first_region);
        match self.superpages.get(region as usize) {
            Some(h) => h,
            None => panic!("physical address {pa} has no superpage head"),
        }
    }

    /// Frames of `pa`'s 2 MiB region that have descriptors.
    pub fn region_pages(&self, pa: PhysicalAddress) -> impl Iterator<Item = (PhysicalAddress, &PageDescriptor)> {
        let base = pa.page::<Size2M>().base();
        (0..Size2M::FRAMES).filter_map(move |i| {
            let p = base + i * Size4K::SIZE;
            self.get(p).map(|d| (p, d))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_kind_roundtrip() {
        let d = PageDescriptor::default();
        assert_eq!(d.table_kind(), None);
        for kind in [
            PageTableKind::Table(0x7_FFFF_FFF),
            PageTableKind::Directory(3),
            PageTableKind::DirectoryPointer(511),
        ] {
            d.set_table_kind(Some(kind));
            assert_eq!(d.table_kind(), Some(kind));
        }
        d.set_table_kind(None);
        assert_eq!(d.table_kind(), None);
    }

    #[test]
    fn array_covers_partial_regions() {
        // 1 MiB into a region, spanning into the next one
        let mem = PhysicalMemory::new(PhysicalPage::from_pfn(0x100), 0x300);
        let pages = PageArray::new(mem);
        assert!(pages.get(PhysicalAddress::new(0xFF000)).is_none());
        assert!(pages.get(PhysicalAddress::new(0x10_0000)).is_some());
        assert!(pages.get(PhysicalAddress::new(0x3F_F000)).is_some());
        assert!(pages.get(PhysicalAddress::new(0x40_0000)).is_none());
        let a = pages.superpage(PhysicalAddress::new(0x10_0000)) as *const PvHead;
        let b = pages.superpage(PhysicalAddress::new(0x1F_F000)) as *const PvHead;
        let c = pages.superpage(PhysicalAddress::new(0x20_0000)) as *const PvHead;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pages.region_pages(PhysicalAddress::new(0x10_0000)).count(), 256);
    }

    #[test]
    fn fresh_pages_are_managed_write_back() {
        let d = PageDescriptor::default();
        assert!(d.is_managed());
        assert_eq!(d.memattr(), MemAttr::WriteBack);
        d.set_flags(PageFlags::WRITEABLE);
        d.clear_flags(PageFlags::MANAGED);
        assert_eq!(d.flags(), PageFlags::WRITEABLE);
    }
}
