//! # Removing mappings
//!
//! Range removal walks the radix top-down and skips absent subtrees a level
//! at a time. Page-table pages that become empty are unlinked on the way and
//! handed back to the page allocator only after the last invalidation of the
//! call, since another CPU may still hold a paging-structure cache entry for
//! them until then.

use alloc::vec::Vec;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};

use crate::address_space::{AddressSpace, PmapGuard, PmapState};
use crate::context::PmapContext;
use crate::entry::PageEntryBits;
use crate::error::PmapError;
use crate::page::PageFlags;
use crate::pv::PvRef;
use crate::pv_lock::{PvLocks, lock_pv_for, pv_lock_slot, switch_pv_to};
use crate::radix::{DeferredFree, next_pml4_boundary};
use crate::shootdown::{PendingInvalidation, TlbHardware};
use crate::table::EntrySlot;
use crate::{FrameAlloc, PhysMapper};

const NPTEPG: u64 = Size2M::FRAMES;

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// Clears one 4 KiB entry and releases what it held. Returns whether the
    /// page table went away with it. No invalidation.
    pub(crate) fn remove_pte(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        slot: EntrySlot<'_>,
        va: VirtualAddress,
        pde: PageEntryBits,
        free: &mut DeferredFree,
    ) -> bool {
        let old = slot.take();
        if old.wired() {
            st.wired -= 1;
        }
        st.resident -= 1;
        if old.managed() {
            let pa = old.frame();
            let desc = self.pages.descriptor(pa);
            if old.is_dirty_writable() {
                desc.set_flags(PageFlags::DIRTY);
            }
            if old.accessed() {
                desc.set_flags(PageFlags::REFERENCED);
            }
            self.pvh_free(st, &desc.pv, pmap.id(), va);
            self.clear_writeable_if_unmapped(pa);
        }
        self.unuse_pt(pmap, st, va, pde, free)
    }

    /// Removes the 4 KiB mapping at `va`, if any, and invalidates it. The
    /// caller holds the physical-page lock of the mapped frame, and `va` is
    /// not covered by a 2 MiB mapping.
    pub(crate) fn remove_page(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        free: &mut DeferredFree,
    ) {
        let Some(pde_slot) = self.pde(pmap, va) else {
            return;
        };
        let pde = pde_slot.load();
        if !pde.present() {
            return;
        }
        debug_assert!(!pde.large_page(), "{}: {va} is inside a 2 MiB mapping", pmap.id());
        let slot = self.pde_to_pte(pde, va);
        if !slot.load().present() {
            return;
        }
        self.remove_pte(pmap, st, slot, va, pde, free);
        self.invalidate_page(pmap, va);
    }

    /// Single-page removal. Returns false when `va` turned out to be covered
    /// by a 2 MiB mapping and the range path has to handle it.
    fn remove_single(
        &self,
        locks: &mut PvLocks<'_>,
        st: &mut PmapGuard<'_>,
        pmap: &AddressSpace,
        va: VirtualAddress,
        free: &mut DeferredFree,
    ) -> bool {
        loop {
            let Some(pde_slot) = self.pde(pmap, va) else {
                return true;
            };
            let pde = pde_slot.load();
            if !pde.present() {
                return true;
            }
            if pde.large_page() {
                return false;
            }
            let pte = self.pde_to_pte(pde, va).load();
            if !pte.present() {
                return true;
            }
            if pte.managed() && lock_pv_for(locks, st, &[pte.frame()]).is_err() {
                continue;
            }
            self.remove_page(pmap, st, va, free);
            return true;
        }
    }

    /// Removes every mapping in `[start, end)`. Removing nothing is not an
    /// error.
    ///
    /// # Errors
    /// [`PmapError::Unaligned`] / [`PmapError::OutOfRange`] for a bad range.
    pub fn remove(
        &self,
        pmap: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), PmapError> {
        self.check_range(pmap, start, end)?;
        if start == end {
            return Ok(());
        }
        let mut locks = self.pv_locks.stack();
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();
        if st.resident > 0 {
            let single = end - start == Size4K::SIZE
                && self.remove_single(&mut locks, &mut st, pmap, start, &mut free);
            if !single {
                self.remove_range(&mut locks, &mut st, pmap, start, end, &mut free);
            }
        }
        drop(st);
        drop(locks);
        self.free_deferred(free);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn remove_range(
        &self,
        locks: &mut PvLocks<'_>,
        st: &mut PmapGuard<'_>,
        pmap: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
        free: &mut DeferredFree,
    ) {
        let mut pending = PendingInvalidation::default();
        let mut sva = start;
        'scan: while sva < end {
            if st.resident == 0 {
                break;
            }
            if !self.pml4e(pmap, sva).load().present() {
                sva = next_pml4_boundary(sva);
                continue;
            }
            if !self.pdpe(pmap, sva).is_some_and(|s| s.load().present()) {
                sva = sva.next_boundary::<Size1G>();
                continue;
            }
            let va_next = sva.next_boundary::<Size2M>().min(end);
            let Some(pde_slot) = self.pde(pmap, sva) else {
                sva = va_next;
                continue;
            };
            let pde = pde_slot.load();
            if !pde.present() {
                sva = va_next;
                continue;
            }

            if pde.large_page() {
                let flush = || pending.flush(self, pmap);
                if pde.managed() && switch_pv_to(locks, st, pde.large_frame(), flush).is_err() {
                    continue;
                }
                if sva.is_aligned::<Size2M>() && va_next - sva == Size2M::SIZE {
                    if !pde.global_translation() {
                        pending.mark_all();
                    }
                    self.remove_pde(pmap, st, pde_slot, sva, free);
                    sva = va_next;
                } else if !self.demote_pde(pmap, st, pde_slot, sva, free) {
                    sva = va_next;
                }
                // a successful demotion rescans the same range as 4 KiB entries
                continue;
            }

            let table = self.table(pde.frame_page());
            let mut va = sva;
            while va < va_next {
                let slot = table.slot(va.pt_index());
                let pte = slot.load();
                if pte.present() {
                    let flush = || pending.flush(self, pmap);
                    if pte.managed() && switch_pv_to(locks, st, pte.frame(), flush).is_err() {
                        sva = va;
                        continue 'scan;
                    }
                    pending.page(va, pte.global_translation());
                    if self.remove_pte(pmap, st, slot, va, pde, free) {
                        break;
                    }
                }
                va += Size4K::SIZE;
            }
            sva = va_next;
        }
        pending.flush(self, pmap);
    }

    /// Removes every mapping of the frame `pa` from every address space.
    /// 2 MiB mappings covering it are demoted first.
    ///
    /// # Errors
    /// [`PmapError::UnknownPage`] if `pa` has no descriptor.
    pub fn remove_all(&self, pa: PhysicalAddress) -> Result<(), PmapError> {
        let desc = self.pages.get(pa).ok_or(PmapError::UnknownPage(pa))?;
        if !desc.is_managed() {
            return Ok(());
        }
        let pa = pa.page::<Size4K>().base();
        let mut locks = self.pv_locks.stack();
        locks.acquire_all(&[pv_lock_slot(pa)]);
        let mut free = DeferredFree::new();

        for pv in self.pv_list(self.pages.superpage(pa)) {
            let va = self.pv_va(pv);
            let pmap = self.owner(pv);
            let mut st = pmap.state.lock();
            let Some(pde_slot) = self.pde(&pmap, va) else {
                panic!("{}: PV entry at {va} without a page directory", pmap.id());
            };
            self.demote_pde(&pmap, &mut st, pde_slot, va, &mut free);
        }

        for pv in self.pv_list(&desc.pv) {
            let va = self.pv_va(pv);
            let pmap = self.owner(pv);
            let mut st = pmap.state.lock();
            let Some(pde_slot) = self.pde(&pmap, va) else {
                panic!("{}: PV entry at {va} without a page directory", pmap.id());
            };
            let pde = pde_slot.load();
            assert!(!pde.large_page(), "{}: 2 MiB mapping of {pa} left at {va}", pmap.id());
            let old = self.pde_to_pte(pde, va).take();
            st.resident -= 1;
            if old.wired() {
                st.wired -= 1;
            }
            if old.accessed() {
                desc.set_flags(PageFlags::REFERENCED);
            }
            if old.is_dirty_writable() {
                desc.set_flags(PageFlags::DIRTY);
            }
            self.invalidate_page(&pmap, va);
            self.pv_unlink(&desc.pv, pv);
            self.free_pv_entry(&mut st, pv);
            self.unuse_pt(&pmap, &mut st, va, pde, &mut free);
        }
        desc.clear_flags(PageFlags::WRITEABLE);
        drop(locks);
        self.free_deferred(free);
        Ok(())
    }

    /// Tears down every non-wired managed mapping of `pmap`, typically right
    /// before the process exits. Works from the address space's PV entries
    /// instead of its page tables and flushes the TLB once at the end, so it
    /// is only allowed on the address space loaded on the calling CPU.
    pub fn remove_pages(&self, pmap: &AddressSpace) {
        if !self.is_current(pmap) {
            log::warn!("{}: remove_pages on an address space that is not current", pmap.id());
            return;
        }
        let mut locks = self.pv_locks.stack();
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();

        'restart: loop {
            let chunks: Vec<_> = st.pv_chunks.iter().copied().collect();
            for chunk in chunks {
                let slots: Vec<usize> = self.pv_chunk(chunk).allocated().collect();
                for slot in slots {
                    let pv = PvRef::new(chunk, slot);
                    let va = self.pv_va(pv);
                    let Some(pde_slot) = self.pde(pmap, va) else {
                        panic!("{}: PV entry at {va} without a page directory", pmap.id());
                    };
                    let pde = pde_slot.load();
                    let large = pde.large_page();
                    let leaf = if large { pde_slot } else { self.pde_to_pte(pde, va) };
                    let e = leaf.load();
                    assert!(e.present(), "{}: PV entry at {va} for an absent mapping", pmap.id());
                    if e.wired() {
                        continue;
                    }
                    let pa = if large { e.large_frame() } else { e.frame() };
                    if switch_pv_to(&mut locks, &mut st, pa, || self.invalidate_all(pmap)).is_err() {
                        continue 'restart;
                    }
                    let old = leaf.take();
                    if large {
                        self.remove_pages_pde(pmap, &mut st, pv, va, old, &mut free);
                    } else {
                        st.resident -= 1;
                        let desc = self.pages.descriptor(pa);
                        if old.is_dirty_writable() {
                            desc.set_flags(PageFlags::DIRTY);
                        }
                        self.pv_unlink(&desc.pv, pv);
                        self.clear_writeable_if_unmapped(pa);
                        self.unuse_pt(pmap, &mut st, va, pde, &mut free);
                    }
                    self.free_pv_entry(&mut st, pv);
                }
            }
            break;
        }
        self.invalidate_all(pmap);
        drop(st);
        drop(locks);
        self.free_deferred(free);
    }

    fn remove_pages_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        pv: PvRef,
        va: VirtualAddress,
        old: PageEntryBits,
        free: &mut DeferredFree,
    ) {
        let pa = old.large_frame();
        st.resident -= NPTEPG;
        let head = self.pages.superpage(pa);
        self.pv_unlink(head, pv);
        for (_, desc) in self.pages.region_pages(pa) {
            if old.is_dirty_writable() {
                desc.set_flags(PageFlags::DIRTY);
            }
            if desc.pv.is_empty() && head.is_empty() {
                desc.clear_flags(PageFlags::WRITEABLE);
            }
        }
        if let Some(ptp) = st.unpark_ptp(va.page::<Size2M>().number()) {
            st.resident -= 1;
            self.pages.descriptor(ptp.base()).set_wire_count(0);
            free.push(ptp);
        }
        let Some(pdpe) = self.pdpe(pmap, va) else {
            panic!("{}: 2 MiB mapping at {va} without a page directory", pmap.id());
        };
        self.unuse_pt(pmap, st, va, pdpe.load(), free);
    }
}
