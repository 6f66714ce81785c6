//! # Superpage promotion and demotion
//!
//! A page table whose 512 entries map one 2 MiB-aligned, physically
//! contiguous run with identical attributes is replaced by a single 2 MiB
//! page directory entry. The page table itself is parked in the address
//! space's idle index so that a later demotion can reuse it without
//! allocating.
//!
//! Promotion is opportunistic and fails silently. Demotion fails only for
//! lack of memory; the 2 MiB mapping is then removed outright, which is
//! always a legal outcome for the callers that tolerate failure.
//!
//! All functions here run with the address-space lock held and, for managed
//! mappings, the physical-page lock of the 2 MiB region.

use kernel_info::memory::self_map_page_table;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, Size2M, Size4K, ENTRIES_PER_TABLE, VirtualAddress,
};

use crate::address_space::{AddressSpace, PmapState};
use crate::context::PmapContext;
use crate::entry::{PageEntryBits, bits};
use crate::page::{PageFlags, PageTableKind};
use crate::protection::Protection;
use crate::pv::AllocPolicy;
use crate::radix::DeferredFree;
use crate::shootdown::TlbHardware;
use crate::stats::bump;
use crate::table::{EntrySlot, PageTable};
use crate::{FrameAlloc, PhysMapper};

/// Small pages per superpage.
const NPTEPG: u64 = Size2M::FRAMES;

fn fill_ptp(table: &PageTable, first: PageEntryBits) {
    for i in 0..ENTRIES_PER_TABLE {
        let off = i as u64 * Size4K::SIZE;
        table
            .slot(i)
            .store(first.with_frame(first.frame() + off));
    }
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    fn promotion_failed(&self, pmap: &AddressSpace, va: VirtualAddress) -> bool {
        bump(&self.stats.promotion_failures);
        log::debug!("{}: promotion of {va} failed", pmap.id());
        false
    }

    /// Clears RW on a writable entry that was never written, so that a
    /// later dirty bit proves the write happened through a writable mapping.
    /// Returns the entry as it is after the update, or `None` if it changed
    /// under us.
    fn write_protect_clean(slot: EntrySlot<'_>, e: PageEntryBits) -> Option<PageEntryBits> {
        if !e.writable() || e.dirty() {
            return Some(e);
        }
        let cleared = e.with_writable(false);
        slot.compare_exchange(e, cleared).ok().map(|_| cleared)
    }

    /// Tries to replace the page table mapping `va`'s 2 MiB region with one
    /// 2 MiB entry.
    pub(crate) fn promote_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
    ) -> bool {
        let sva = va.align_down::<Size2M>();
        let Some(pde_slot) = self.pde(pmap, sva) else {
            return false;
        };
        let pde = pde_slot.load();
        if !pde.present() || pde.large_page() {
            return false;
        }
        let table = self.table(pde.frame_page());

        let first = loop {
            let slot = table.slot(0);
            let e = slot.load();
            if !e.has_all(bits::ACCESSED | bits::PRESENT) || !e.frame().is_aligned::<Size2M>() {
                return self.promotion_failed(pmap, sva);
            }
            if let Some(e) = Self::write_protect_clean(slot, e) {
                break e;
            }
        };

        let attrs = first.raw() & bits::PROMOTE_MASK;
        for i in (1..ENTRIES_PER_TABLE).rev() {
            let slot = table.slot(i);
            let expect = (first.frame() + i as u64 * Size4K::SIZE).as_u64() | bits::ACCESSED | bits::PRESENT;
            loop {
                let e = slot.load();
                if e.raw() & (bits::FRAME | bits::ACCESSED | bits::PRESENT) != expect {
                    return self.promotion_failed(pmap, sva);
                }
                let Some(e) = Self::write_protect_clean(slot, e) else {
                    continue;
                };
                if e.raw() & bits::PROMOTE_MASK != attrs {
                    return self.promotion_failed(pmap, sva);
                }
                break;
            }
        }

        let index = sva.page::<Size2M>().number();
        st.park_ptp(index, pde.frame_page());
        if first.managed() {
            debug_assert!(self.pv_locks.is_locked(first.frame()));
            self.pv_promote_pde(pmap.id(), st, sva, first.frame());
        }
        let new = first.small_to_large().with_promoted(true);
        self.update_pde(pmap, sva, pde_slot, new);
        if pmap.is_kernel() {
            self.invalidate_page(pmap, self_map_page_table(index));
        }
        bump(&self.stats.promotions);
        log::trace!("{}: promoted {sva} to {}", pmap.id(), first.frame());
        true
    }

    fn demotion_failed(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        pde_slot: EntrySlot<'_>,
        sva: VirtualAddress,
        old: PageEntryBits,
        free: &mut DeferredFree,
    ) -> bool {
        self.remove_pde(pmap, st, pde_slot, sva, free);
        if !old.global_translation() {
            self.invalidate_page(pmap, sva);
        }
        bump(&self.stats.demotion_failures);
        log::debug!("{}: demotion of {sva} failed, mapping removed", pmap.id());
        false
    }

    /// Splits the 2 MiB mapping covering `va` into 512 small mappings. On
    /// failure the 2 MiB mapping is gone and false is returned.
    pub(crate) fn demote_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        pde_slot: EntrySlot<'_>,
        va: VirtualAddress,
        free: &mut DeferredFree,
    ) -> bool {
        let old = pde_slot.load();
        assert!(old.is_superpage(), "{}: no 2 MiB mapping at {va}", pmap.id());
        let sva = va.align_down::<Size2M>();
        let index = sva.page::<Size2M>().number();

        let (ptp, fresh) = if let Some(ptp) = st.unpark_ptp(index) {
            (ptp, false)
        } else if !old.accessed() {
            return self.demotion_failed(pmap, st, pde_slot, sva, old, free);
        } else if let Some(ptp) = self.frames.alloc_4k() {
            (ptp, true)
        } else {
            return self.demotion_failed(pmap, st, pde_slot, sva, old, free);
        };

        let batch = if old.managed() {
            debug_assert!(self.pv_locks.is_locked(old.large_frame()));
            match self.reserve_pv_entries(pmap, st, NPTEPG as usize - 1, AllocPolicy::NoWait) {
                Ok(batch) => Some(batch),
                Err(_) => {
                    if fresh {
                        self.frames.free_4k(ptp);
                    } else {
                        st.park_ptp(index, ptp);
                    }
                    return self.demotion_failed(pmap, st, pde_slot, sva, old, free);
                }
            }
        } else {
            None
        };

        let table = self.table(ptp);
        let first = old.large_to_small().with_promoted(false);
        if fresh {
            let desc = self.pages.descriptor(ptp.base());
            desc.set_table_kind(Some(PageTableKind::Table(index)));
            desc.set_wire_count(NPTEPG as u32);
            st.resident += 1;
            fill_ptp(table, first);
        } else if table.slot(0).load().raw() & bits::PROMOTE_MASK != first.raw() & bits::PROMOTE_MASK {
            fill_ptp(table, first);
        }

        self.update_pde(pmap, sva, pde_slot, PageEntryBits::table_link(ptp, old.user_access()));
        if pmap.is_kernel() {
            self.invalidate_page(pmap, self_map_page_table(index));
        }
        if let Some(mut batch) = batch {
            self.pv_demote_pde(pmap.id(), sva, old.large_frame(), &mut batch);
            self.release_pv_batch(st, batch);
        }
        bump(&self.stats.demotions);
        log::trace!("{}: demoted {sva}", pmap.id());
        true
    }

    /// Removes the 2 MiB mapping at `sva`. Returns whether the page directory
    /// page was freed.
    pub(crate) fn remove_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        pde_slot: EntrySlot<'_>,
        sva: VirtualAddress,
        free: &mut DeferredFree,
    ) -> bool {
        let old = pde_slot.take();
        assert!(old.is_superpage(), "{}: no 2 MiB mapping at {sva}", pmap.id());
        if old.wired() {
            st.wired -= NPTEPG;
        }
        if old.global_translation() {
            if old.promoted() {
                self.invalidate_range(pmap, sva, sva + Size2M::SIZE);
            } else {
                self.invalidate_page(pmap, sva);
            }
        }
        st.resident -= NPTEPG;
        if old.managed() {
            let pa = old.large_frame();
            let head = self.pages.superpage(pa);
            self.pvh_free(st, head, pmap.id(), sva);
            for (_, desc) in self.pages.region_pages(pa) {
                if old.is_dirty_writable() {
                    desc.set_flags(PageFlags::DIRTY);
                }
                if old.accessed() {
                    desc.set_flags(PageFlags::REFERENCED);
                }
                if desc.pv.is_empty() && head.is_empty() {
                    desc.clear_flags(PageFlags::WRITEABLE);
                }
            }
        }

        let index = sva.page::<Size2M>().number();
        if pmap.is_kernel() {
            let Some(ptp) = st.unpark_ptp(index) else {
                panic!("kernel 2 MiB mapping at {sva} has no page table");
            };
            self.table(ptp).zero();
            self.pages.descriptor(ptp.base()).set_wire_count(0);
            self.update_pde(pmap, sva, pde_slot, PageEntryBits::table_link(ptp, false));
            self.invalidate_page(pmap, self_map_page_table(index));
            return false;
        }
        if let Some(ptp) = st.unpark_ptp(index) {
            st.resident -= 1;
            self.pages.descriptor(ptp.base()).set_wire_count(0);
            free.push(ptp);
        }
        let Some(pdpe) = self.pdpe(pmap, sva) else {
            panic!("{}: 2 MiB mapping at {sva} without a page directory", pmap.id());
        };
        self.unuse_pt(pmap, st, sva, pdpe.load(), free)
    }

    /// Narrows the protection of the 2 MiB mapping at `sva`. Returns whether
    /// a non-global entry changed and still needs invalidation.
    pub(crate) fn protect_pde(
        &self,
        pmap: &AddressSpace,
        pde_slot: EntrySlot<'_>,
        sva: VirtualAddress,
        prot: Protection,
    ) -> bool {
        loop {
            let old = pde_slot.load();
            let mut new = old;
            if !prot.contains(Protection::WRITE) {
                if old.managed() && old.is_dirty_writable() {
                    for (_, desc) in self.pages.region_pages(old.large_frame()) {
                        desc.set_flags(PageFlags::DIRTY);
                    }
                }
                new = new.with_writable(false).with_dirty(false);
            }
            if self.config.no_execute && !prot.contains(Protection::EXECUTE) {
                new = new.with_no_execute(true);
            }
            if new == old {
                return false;
            }
            if pde_slot.compare_exchange(old, new).is_err() {
                continue;
            }
            if old.global_translation() {
                if old.promoted() {
                    self.invalidate_range(pmap, sva, sva + Size2M::SIZE);
                } else {
                    self.invalidate_page(pmap, sva);
                }
                return false;
            }
            return true;
        }
    }

    /// Installs a read-only 2 MiB mapping of the region at `pa` directly.
    /// Fails when anything is mapped there already or memory is short.
    pub(crate) fn enter_pde(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        free: &mut DeferredFree,
    ) -> bool {
        if pmap.is_kernel() {
            return false;
        }
        let Some(pd) = self.alloc_pde(pmap, st, va) else {
            return false;
        };
        let slot = self.table(pd).slot(va.pd_index());
        if !slot.load().is_empty() {
            self.unwire_ptp(pmap, st, va, pd, free);
            return false;
        }

        let desc = self.pages.descriptor(pa);
        let mut new = PageEntryBits::from_raw(
            pa.as_u64() | desc.memattr().cache_bits(true) | bits::PAGE_SIZE | bits::PRESENT,
        )
        .with_user_access(true);
        if desc.is_managed() {
            debug_assert!(self.pv_locks.is_locked(pa));
            if !self.pv_insert_pde(pmap, st, va, pa) {
                self.unwire_ptp(pmap, st, va, pd, free);
                return false;
            }
            new = new.with_managed(true);
        }
        if self.config.no_execute && !prot.contains(Protection::EXECUTE) {
            new = new.with_no_execute(true);
        }
        st.resident += NPTEPG;
        slot.store(new);
        bump(&self.stats.pde_mappings);
        log::trace!("{}: 2 MiB mapping {va} -> {pa}", pmap.id());
        true
    }
}
