//! PV list manipulation.
//!
//! Every function here requires the physical-page lock of the list it touches
//! (and, for allocation and release, the owning address space's lock).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K, VirtualAddress};

use super::chunk::PvSlot;
use super::{AllocPolicy, PvBatch, PvRef};
use crate::address_space::{AddressSpace, PmapId, PmapState};
use crate::context::PmapContext;
use crate::page::{PageFlags, PvHead};
use crate::shootdown::TlbHardware;
use crate::{FrameAlloc, PhysMapper};

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    fn pv_slot(&self, pv: PvRef) -> &PvSlot {
        &self.pv_chunk(pv.chunk()).slots[pv.slot()]
    }

    pub(crate) fn pv_va(&self, pv: PvRef) -> VirtualAddress {
        VirtualAddress::new(self.pv_slot(pv).va.load(Ordering::Relaxed))
    }

    fn set_pv_va(&self, pv: PvRef, va: VirtualAddress) {
        self.pv_slot(pv).va.store(va.as_u64(), Ordering::Relaxed);
    }

    pub(crate) fn pv_owner(&self, pv: PvRef) -> PmapId {
        self.pv_chunk(pv.chunk()).owner()
    }

    /// The address space holding `pv`.
    ///
    /// # Panics
    /// If the owner is no longer registered.
    pub(crate) fn owner(&self, pv: PvRef) -> Arc<AddressSpace> {
        let id = self.pv_owner(pv);
        let Some(pmap) = self.lookup(id) else {
            panic!("PV entry {pv:?} belongs to {id}, which no longer exists");
        };
        pmap
    }

    fn pv_next(&self, pv: PvRef) -> Option<PvRef> {
        PvRef::from_raw(self.pv_slot(pv).next.load(Ordering::Relaxed))
    }

    fn pv_prev(&self, pv: PvRef) -> Option<PvRef> {
        PvRef::from_raw(self.pv_slot(pv).prev.load(Ordering::Relaxed))
    }

    fn pv_link_tail(&self, head: &PvHead, pv: PvRef) {
        let slot = self.pv_slot(pv);
        let last = head.last();
        slot.prev.store(PvRef::into_raw(last), Ordering::Relaxed);
        slot.next.store(0, Ordering::Relaxed);
        match last {
            Some(l) => self.pv_slot(l).next.store(PvRef::into_raw(Some(pv)), Ordering::Relaxed),
            None => head.set_first(Some(pv)),
        }
        head.set_last(Some(pv));
        head.changed(1);
    }

    pub(crate) fn pv_unlink(&self, head: &PvHead, pv: PvRef) {
        let (prev, next) = (self.pv_prev(pv), self.pv_next(pv));
        match prev {
            Some(p) => self.pv_slot(p).next.store(PvRef::into_raw(next), Ordering::Relaxed),
            None => head.set_first(next),
        }
        match next {
            Some(n) => self.pv_slot(n).prev.store(PvRef::into_raw(prev), Ordering::Relaxed),
            None => head.set_last(prev),
        }
        let slot = self.pv_slot(pv);
        slot.next.store(0, Ordering::Relaxed);
        slot.prev.store(0, Ordering::Relaxed);
        head.changed(-1);
    }

    /// Moves `pv` to the end of its list so that the next scan starts with
    /// somebody else.
    pub(crate) fn pv_rotate_to_tail(&self, head: &PvHead, pv: PvRef) {
        if head.last() != Some(pv) {
            self.pv_unlink(head, pv);
            self.pv_link_tail(head, pv);
        }
    }

    /// Snapshot of the list in order.
    pub(crate) fn pv_list(&self, head: &PvHead) -> Vec<PvRef> {
        let mut out = Vec::with_capacity(head.len());
        let mut cur = head.first();
        while let Some(pv) = cur {
            out.push(pv);
            cur = self.pv_next(pv);
        }
        out
    }

    pub(crate) fn pv_find(&self, head: &PvHead, pmap: PmapId, va: VirtualAddress) -> Option<PvRef> {
        let mut cur = head.first();
        while let Some(pv) = cur {
            if self.pv_va(pv) == va && self.pv_owner(pv) == pmap {
                return Some(pv);
            }
            cur = self.pv_next(pv);
        }
        None
    }

    /// Unlinks the entry for `(pmap, va)` and returns it.
    ///
    /// # Panics
    /// If the list has no such entry.
    pub(crate) fn pvh_remove(&self, head: &PvHead, pmap: PmapId, va: VirtualAddress) -> PvRef {
        let Some(pv) = self.pv_find(head, pmap, va) else {
            panic!("pv entry for {pmap} at {va} not found");
        };
        self.pv_unlink(head, pv);
        pv
    }

    /// Unlinks and frees the entry for `(pmap, va)`.
    pub(crate) fn pvh_free(&self, st: &mut PmapState, head: &PvHead, pmap: PmapId, va: VirtualAddress) {
        let pv = self.pvh_remove(head, pmap, va);
        self.free_pv_entry(st, pv);
    }

    /// Records a new 4 KiB mapping of `pa` at `va`.
    pub(crate) fn insert_pv_entry(&self, pv: PvRef, va: VirtualAddress, pa: PhysicalAddress) {
        self.set_pv_va(pv, va);
        self.pv_link_tail(&self.pages.descriptor(pa).pv, pv);
    }

    /// Like [`Self::insert_pv_entry`] but allocates the entry opportunistically;
    /// returns false when none was available.
    pub(crate) fn try_insert_pv_entry(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) -> bool {
        match self.get_pv_entry(pmap, st, AllocPolicy::Try) {
            Ok(pv) => {
                self.insert_pv_entry(pv, va, pa);
                true
            }
            Err(_) => false,
        }
    }

    /// Records a new 2 MiB mapping of the region starting at `pa`; returns
    /// false when no entry was available.
    pub(crate) fn pv_insert_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) -> bool {
        assert!(pa.is_aligned::<Size2M>(), "superpage frame {pa} is not 2 MiB aligned");
        match self.get_pv_entry(pmap, st, AllocPolicy::Try) {
            Ok(pv) => {
                self.set_pv_va(pv, va);
                self.pv_link_tail(self.pages.superpage(pa), pv);
                true
            }
            Err(_) => false,
        }
    }

    /// Replaces the 512 entries of a region about to be promoted by one
    /// superpage entry: the first page's entry moves over, the rest are
    /// freed.
    pub(crate) fn pv_promote_pde(
        &self,
        pmap: PmapId,
        st: &mut PmapState,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) {
        let va = va.align_down::<Size2M>();
        let pv = self.pvh_remove(&self.pages.descriptor(pa).pv, pmap, va);
        self.pv_link_tail(self.pages.superpage(pa), pv);
        for i in 1..Size2M::FRAMES {
            let off = i * Size4K::SIZE;
            self.pvh_free(st, &self.pages.descriptor(pa + off).pv, pmap, va + off);
        }
    }

    /// Splits the superpage entry of a region being demoted into 512 entries,
    /// the 511 new ones taken from `batch`.
    pub(crate) fn pv_demote_pde(
        &self,
        pmap: PmapId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        batch: &mut PvBatch,
    ) {
        let va = va.align_down::<Size2M>();
        let pv = self.pvh_remove(self.pages.superpage(pa), pmap, va);
        self.pv_link_tail(&self.pages.descriptor(pa).pv, pv);
        for i in 1..Size2M::FRAMES {
            let off = i * Size4K::SIZE;
            let Some(pv) = batch.take() else {
                panic!("PV batch for demotion of {va} ran dry");
            };
            self.insert_pv_entry(pv, va + off, pa + off);
        }
    }

    /// Whether any small or superpage mapping of `pa` remains.
    pub(crate) fn page_is_mapped(&self, pa: PhysicalAddress) -> bool {
        !self.pages.descriptor(pa).pv.is_empty() || !self.pages.superpage(pa).is_empty()
    }

    /// Drops `WRITEABLE` once the last mapping of `pa` went away.
    pub(crate) fn clear_writeable_if_unmapped(&self, pa: PhysicalAddress) {
        if !self.page_is_mapped(pa) {
            self.pages.descriptor(pa).clear_flags(PageFlags::WRITEABLE);
        }
    }
}
