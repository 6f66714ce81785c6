//! # Page-table radix
//!
//! Lookups return the [`EntrySlot`] of the requested level, or `None` as soon
//! as a parent entry is absent. Callers sample an entry once with
//! [`EntrySlot::load`] and work on the copy.
//!
//! A page directory entry with PS set is returned by [`PmapContext::pte`] as
//! the leaf itself.

use alloc::vec::Vec;
use kernel_info::memory::{
    self_map_page_directory, self_map_page_directory_pointer, self_map_page_table,
};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress};

use crate::address_space::{AddressSpace, PmapState};
use crate::context::PmapContext;
use crate::entry::PageEntryBits;
use crate::page::PageTableKind;
use crate::shootdown::TlbHardware;
use crate::table::EntrySlot;
use crate::{FrameAlloc, PhysMapper};

const PML4_SHIFT: u32 = 39;
const VA_BITS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Page-table pages unlinked by one operation. They may still be cached in
/// some TLB as a paging-structure entry, so they go back to the allocator
/// only after the operation's invalidations completed.
#[must_use]
#[derive(Debug, Default)]
pub(crate) struct DeferredFree(Vec<PhysicalPage<Size4K>>);

impl DeferredFree {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, page: PhysicalPage<Size4K>) {
        self.0.push(page);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// First address of the next 512 GiB slot, saturating at the top.
pub(crate) fn next_pml4_boundary(va: VirtualAddress) -> VirtualAddress {
    let next = VirtualAddress::canonical((((va.as_u64() & VA_BITS_MASK) >> PML4_SHIFT) + 1) << PML4_SHIFT);
    if next <= va {
        VirtualAddress::new(u64::MAX)
    } else {
        next
    }
}

impl PageTableKind {
    pub(crate) const fn for_table(va: VirtualAddress) -> Self {
        Self::Table((va.as_u64() & VA_BITS_MASK) >> Size2M::SHIFT)
    }

    pub(crate) const fn for_directory(va: VirtualAddress) -> Self {
        Self::Directory((va.as_u64() & VA_BITS_MASK) >> Size1G::SHIFT)
    }

    pub(crate) const fn for_directory_pointer(va: VirtualAddress) -> Self {
        Self::DirectoryPointer(va.pml4_index() as u64)
    }

    /// Lowest address the page serves.
    pub(crate) const fn base(self) -> VirtualAddress {
        match self {
            Self::Table(i) => VirtualAddress::canonical(i << Size2M::SHIFT),
            Self::Directory(i) => VirtualAddress::canonical(i << Size1G::SHIFT),
            Self::DirectoryPointer(i) => VirtualAddress::canonical(i << PML4_SHIFT),
        }
    }
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    pub(crate) fn pml4e(&self, pmap: &AddressSpace, va: VirtualAddress) -> EntrySlot<'_> {
        self.table(pmap.root()).slot(va.pml4_index())
    }

    pub(crate) fn pdpe(&self, pmap: &AddressSpace, va: VirtualAddress) -> Option<EntrySlot<'_>> {
        let pml4e = self.pml4e(pmap, va).load();
        if !pml4e.present() {
            return None;
        }
        Some(self.table(pml4e.frame_page()).slot(va.pdpt_index()))
    }

    pub(crate) fn pde(&self, pmap: &AddressSpace, va: VirtualAddress) -> Option<EntrySlot<'_>> {
        let pdpe = self.pdpe(pmap, va)?.load();
        if !pdpe.present() {
            return None;
        }
        debug_assert!(!pdpe.large_page(), "1 GiB mapping at {va}");
        Some(self.table(pdpe.frame_page()).slot(va.pd_index()))
    }

    /// The 4 KiB entry for `va` in the page table `pde` points at.
    pub(crate) fn pde_to_pte(&self, pde: PageEntryBits, va: VirtualAddress) -> EntrySlot<'_> {
        debug_assert!(pde.present() && !pde.large_page());
        self.table(pde.frame_page()).slot(va.pt_index())
    }

    /// The leaf entry for `va`: a 4 KiB entry, or the page directory entry of
    /// a 2 MiB mapping.
    pub(crate) fn pte(&self, pmap: &AddressSpace, va: VirtualAddress) -> Option<EntrySlot<'_>> {
        let slot = self.pde(pmap, va)?;
        let pde = slot.load();
        if !pde.present() {
            None
        } else if pde.large_page() {
            Some(slot)
        } else {
            Some(self.pde_to_pte(pde, va))
        }
    }

    fn link_for(pmap: &AddressSpace, page: PhysicalPage<Size4K>) -> PageEntryBits {
        PageEntryBits::table_link(page, !pmap.is_kernel())
    }

    /// Allocates and links a page-table page of `kind`, creating missing
    /// parents. The new page starts with one reference, the entry the caller
    /// is about to create. Nothing changes when any allocation fails.
    fn alloc_ptp(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        kind: PageTableKind,
    ) -> Option<PhysicalPage<Size4K>> {
        let page = self.frames.alloc_4k()?;
        self.table(page).zero();
        let desc = self.pages.descriptor(page.base());
        desc.set_table_kind(Some(kind));
        desc.set_wire_count(1);

        let va = kind.base();
        let link = Self::link_for(pmap, page);
        let parent = match kind {
            PageTableKind::DirectoryPointer(_) => None,
            PageTableKind::Directory(_) => Some((
                self.pml4e(pmap, va).load(),
                PageTableKind::for_directory_pointer(va),
            )),
            PageTableKind::Table(_) => {
                let pdpe = self.pdpe(pmap, va).map_or(PageEntryBits::EMPTY, EntrySlot::load);
                Some((pdpe, PageTableKind::for_directory(va)))
            }
        };
        let parent_table = match parent {
            None => self.table(pmap.root()),
            Some((entry, _)) if entry.present() => {
                self.pages.descriptor(entry.frame()).wire();
                self.table(entry.frame_page())
            }
            Some((_, parent_kind)) => {
                if let Some(p) = self.alloc_ptp(pmap, st, parent_kind) {
                    self.table(p)
                } else {
                    desc.set_table_kind(None);
                    desc.set_wire_count(0);
                    self.frames.free_4k(page);
                    return None;
                }
            }
        };
        let index = match kind {
            PageTableKind::DirectoryPointer(_) => va.pml4_index(),
            PageTableKind::Directory(_) => va.pdpt_index(),
            PageTableKind::Table(_) => va.pd_index(),
        };
        parent_table.slot(index).store(link);
        st.resident += 1;
        Some(page)
    }

    /// The page table that will hold `va`'s 4 KiB entry, with one more
    /// reference taken. `None` when a needed page could not be allocated.
    /// `va` must not be covered by a 2 MiB mapping.
    pub(crate) fn alloc_pte(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
    ) -> Option<PhysicalPage<Size4K>> {
        let pde = self.pde(pmap, va).map_or(PageEntryBits::EMPTY, EntrySlot::load);
        if pde.present() {
            assert!(!pde.large_page(), "{}: {va} is inside a 2 MiB mapping", pmap.id());
            self.pages.descriptor(pde.frame()).wire();
            return Some(pde.frame_page());
        }
        self.alloc_ptp(pmap, st, PageTableKind::for_table(va))
    }

    /// The page directory that will hold `va`'s 2 MiB entry, with one more
    /// reference taken.
    pub(crate) fn alloc_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
    ) -> Option<PhysicalPage<Size4K>> {
        let pdpe = self.pdpe(pmap, va).map_or(PageEntryBits::EMPTY, EntrySlot::load);
        if pdpe.present() {
            self.pages.descriptor(pdpe.frame()).wire();
            return Some(pdpe.frame_page());
        }
        self.alloc_ptp(pmap, st, PageTableKind::for_directory(va))
    }

    /// Drops one reference to `page`. A user page table page whose last
    /// entry went away is unlinked, its parent released in turn, and the page
    /// queued on `free`. Returns whether `page` was unlinked.
    pub(crate) fn unwire_ptp(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        page: PhysicalPage<Size4K>,
        free: &mut DeferredFree,
    ) -> bool {
        if self.pages.descriptor(page.base()).unwire() > 0 || pmap.is_kernel() {
            return false;
        }
        let Some(kind) = self.pages.descriptor(page.base()).table_kind() else {
            panic!("{}: page {page} is not a page-table page", pmap.id());
        };
        let (parent, self_map) = match kind {
            PageTableKind::Table(i) => {
                let Some(pde) = self.pde(pmap, va) else {
                    panic!("{}: page table {page} for {va} is not linked", pmap.id());
                };
                pde.take();
                let parent = self.pdpe(pmap, va).map(|e| e.load().frame_page());
                (parent, self_map_page_table(i))
            }
            PageTableKind::Directory(i) => {
                let Some(pdpe) = self.pdpe(pmap, va) else {
                    panic!("{}: page directory {page} for {va} is not linked", pmap.id());
                };
                pdpe.take();
                (Some(self.pml4e(pmap, va).load().frame_page()), self_map_page_directory(i))
            }
            PageTableKind::DirectoryPointer(i) => {
                self.pml4e(pmap, va).take();
                (None, self_map_page_directory_pointer(i))
            }
        };
        st.resident -= 1;
        if let Some(parent) = parent {
            self.unwire_ptp(pmap, st, va, parent, free);
        }
        self.invalidate_page(pmap, self_map);
        free.push(page);
        true
    }

    /// Releases the reference a removed entry held on its table, given the
    /// parent entry that pointed at that table.
    pub(crate) fn unuse_pt(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        parent: PageEntryBits,
        free: &mut DeferredFree,
    ) -> bool {
        self.unwire_ptp(pmap, st, va, parent.frame_page(), free)
    }

    /// Returns unlinked page-table pages to the page allocator. Only after
    /// the invalidations of the operation that unlinked them.
    pub(crate) fn free_deferred(&self, free: DeferredFree) {
        for page in free.0 {
            let desc = self.pages.descriptor(page.base());
            desc.set_table_kind(None);
            desc.set_wire_count(0);
            self.frames.free_4k(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Sim;

    #[test]
    fn table_kinds_cover_their_base() {
        let va = VirtualAddress::new(0x7f12_3456_7000);
        assert_eq!(PageTableKind::for_table(va).base(), va.align_down::<Size2M>());
        assert_eq!(PageTableKind::for_directory(va).base(), va.align_down::<Size1G>());
        assert_eq!(PageTableKind::for_directory_pointer(va).base().as_u64(), 0x7f00_0000_0000);
        let kva = VirtualAddress::new(0xffff_ff80_0020_0000);
        assert_eq!(PageTableKind::for_table(kva).base(), kva);
    }

    #[test]
    fn pml4_boundary_saturates() {
        assert_eq!(
            next_pml4_boundary(VirtualAddress::new(0x1000)).as_u64(),
            0x80_0000_0000
        );
        assert_eq!(
            next_pml4_boundary(VirtualAddress::new(0xffff_ff80_0000_0000)).as_u64(),
            u64::MAX
        );
    }

    #[test]
    fn alloc_pte_builds_and_unwire_tears_down_the_chain() {
        let sim = Sim::new(1);
        let pmap = sim.ctx.create_address_space();
        let va = VirtualAddress::new(0x4000_1000);
        let free_before = sim.free_frames();

        let mut free = DeferredFree::new();
        {
            let mut st = pmap.state.lock();
            let pt = sim.ctx.alloc_pte(&pmap, &mut st, va).expect("frames available");
            assert_eq!(st.resident, 3);
            assert_eq!(sim.ctx.pages.descriptor(pt.base()).wire_count(), 1);
            assert_eq!(
                sim.ctx.pages.descriptor(pt.base()).table_kind(),
                Some(PageTableKind::for_table(va))
            );
            assert!(sim.ctx.pte(&pmap, va).is_some_and(|s| s.load().is_empty()));
            assert!(sim.ctx.pte(&pmap, va + Size1G::SIZE).is_none());

            assert!(sim.ctx.unwire_ptp(&pmap, &mut st, va, pt, &mut free));
            assert_eq!(st.resident, 0);
        }
        assert_eq!(free.len(), 3);
        assert!(!sim.ctx.pml4e(&pmap, va).load().present());
        sim.ctx.free_deferred(free);
        assert_eq!(sim.free_frames(), free_before);
    }

    #[test]
    fn failed_allocation_leaves_nothing_behind() {
        let sim = Sim::new(1);
        let pmap = sim.ctx.create_address_space();
        let free_before = sim.free_frames();
        sim.frames().limit(2);
        let mut st = pmap.state.lock();
        assert!(sim.ctx.alloc_pte(&pmap, &mut st, VirtualAddress::new(0x1000)).is_none());
        assert_eq!(st.resident, 0);
        assert!(!sim.ctx.pml4e(&pmap, VirtualAddress::new(0x1000)).load().present());
        drop(st);
        sim.frames().unlimit();
        assert_eq!(sim.free_frames(), free_before);
    }

    #[test]
    fn kernel_tables_are_never_freed() {
        let sim = Sim::new(1);
        let kernel = sim.ctx.kernel_pmap().clone();
        let va = VirtualAddress::new(0xffff_ff80_4000_0000);
        let mut free = DeferredFree::new();
        let mut st = kernel.state.lock();
        let pt = sim.ctx.alloc_pte(&kernel, &mut st, va).expect("frames available");
        assert!(!sim.ctx.unwire_ptp(&kernel, &mut st, va, pt, &mut free));
        assert_eq!(free.len(), 0);
        assert!(sim.ctx.pde(&kernel, va).is_some_and(|s| s.load().present()));
    }
}
