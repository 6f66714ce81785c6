//! # Per-page queries and clears
//!
//! These operations start from a physical page and visit every mapping of it
//! through its PV lists, whichever address spaces they belong to. The
//! physical-page lock is taken first and held throughout; each owner's lock
//! is then taken in turn, which is the regular lock order.
//!
//! A 2 MiB mapping covering the page cannot be cleared for just that page,
//! so it is demoted first and the resulting 4 KiB entry handled like any
//! other.

use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

use crate::address_space::{AddressSpace, PmapState};
use crate::context::PmapContext;
use crate::entry::{PageEntryBits, bits};
use crate::page::{PageDescriptor, PageFlags};
use crate::pv_lock::{PvLocks, pv_lock_slot};
use crate::radix::DeferredFree;
use crate::shootdown::TlbHardware;
use crate::table::EntrySlot;
use crate::{FrameAlloc, PhysMapper};

/// `ts_referenced` stops sampling after this many hits.
const TS_REFERENCED_MAX: usize = 5;

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// The descriptor of `pa` if its mappings are tracked, with the
    /// physical-page lock taken.
    fn lock_managed(&self, pa: PhysicalAddress) -> Option<(PhysicalAddress, &PageDescriptor, PvLocks<'_>)> {
        let desc = self.pages.get(pa)?;
        if !desc.is_managed() {
            return None;
        }
        let pa = pa.page::<Size4K>().base();
        let mut locks = self.pv_locks.stack();
        locks.acquire_all(&[pv_lock_slot(pa)]);
        Some((pa, desc, locks))
    }

    /// The 4 KiB entry a PV entry of `pmap` at `va` describes.
    ///
    /// # Panics
    /// If no page table covers `va`.
    fn pv_pte(&self, pmap: &AddressSpace, va: VirtualAddress) -> EntrySlot<'_> {
        let Some(pde_slot) = self.pde(pmap, va) else {
            panic!("{}: PV entry at {va} without a page directory", pmap.id());
        };
        let pde = pde_slot.load();
        assert!(
            pde.present() && !pde.large_page(),
            "{}: PV entry at {va} without a page table",
            pmap.id()
        );
        self.pde_to_pte(pde, va)
    }

    fn pv_pde(&self, pmap: &AddressSpace, va: VirtualAddress) -> EntrySlot<'_> {
        match self.pde(pmap, va) {
            Some(slot) if slot.load().is_superpage() => slot,
            _ => panic!("{}: superpage PV entry at {va} without a 2 MiB mapping", pmap.id()),
        }
    }

    /// Demotes each 2 MiB mapping of `pa`'s region whose entry satisfies
    /// `select`. For every successful demotion `then` receives the address of
    /// `pa` inside it and the former 2 MiB entry.
    fn demote_superpages_of(
        &self,
        pa: PhysicalAddress,
        free: &mut DeferredFree,
        select: impl Fn(PageEntryBits) -> bool,
        mut then: impl FnMut(&AddressSpace, &mut PmapState, VirtualAddress, PageEntryBits, &mut DeferredFree),
    ) {
        for pv in self.pv_list(self.pages.superpage(pa)) {
            let sva = self.pv_va(pv);
            let pmap = self.owner(pv);
            let mut st = pmap.state.lock();
            let pde_slot = self.pv_pde(&pmap, sva);
            let old = pde_slot.load();
            if !select(old) {
                continue;
            }
            if self.demote_pde(&pmap, &mut st, pde_slot, sva, free) {
                let va = sva + (pa - old.large_frame());
                then(&pmap, &mut *st, va, old, free);
            }
        }
    }

    /// Samples and clears the accessed bits of `pa`'s mappings. Returns how
    /// many were set, stopping early once more than four were found. The
    /// list is rotated so that the next call starts with other mappings.
    #[must_use]
    pub fn ts_referenced(&self, pa: PhysicalAddress) -> usize {
        let Some((pa, desc, locks)) = self.lock_managed(pa) else {
            return 0;
        };
        let mut free = DeferredFree::new();
        // an accessed superpage is split and the page itself unmapped, so a
        // later access shows up as a fault instead of going unnoticed
        self.demote_superpages_of(
            pa,
            &mut free,
            |e| e.accessed(),
            |pmap, st, va, old, free| {
                if !old.wired() {
                    self.remove_page(pmap, st, va, free);
                }
            },
        );

        let mut count = 0;
        for pv in self.pv_list(&desc.pv) {
            let va = self.pv_va(pv);
            let pmap = self.owner(pv);
            let _st = pmap.state.lock();
            self.pv_rotate_to_tail(&desc.pv, pv);
            let slot = self.pv_pte(&pmap, va);
            if slot.clear_bits(bits::ACCESSED).accessed() {
                self.invalidate_page(&pmap, va);
                count += 1;
                if count >= TS_REFERENCED_MAX {
                    break;
                }
            }
        }
        drop(locks);
        self.free_deferred(free);
        count
    }

    /// Clears the dirty state of `pa`: every mapping's dirty bit and the
    /// page's [`PageFlags::DIRTY`].
    pub fn clear_modify(&self, pa: PhysicalAddress) {
        let Some((pa, desc, locks)) = self.lock_managed(pa) else {
            return;
        };
        let mut free = DeferredFree::new();
        if desc.flags().contains(PageFlags::WRITEABLE) {
            self.demote_superpages_of(
                pa,
                &mut free,
                |e| e.writable(),
                |pmap, _st, va, old, _free| {
                    if old.wired() {
                        return;
                    }
                    // write-protect the page so the next write marks it dirty again
                    let slot = self.pv_pte(pmap, va);
                    if slot.clear_bits(bits::WRITABLE | bits::DIRTY).present() {
                        self.invalidate_page(pmap, va);
                    }
                },
            );
            for pv in self.pv_list(&desc.pv) {
                let va = self.pv_va(pv);
                let pmap = self.owner(pv);
                let _st = pmap.state.lock();
                let slot = self.pv_pte(&pmap, va);
                if slot.load().is_dirty_writable() {
                    slot.clear_bits(bits::DIRTY);
                    self.invalidate_page(&pmap, va);
                }
            }
        }
        desc.clear_flags(PageFlags::DIRTY);
        drop(locks);
        self.free_deferred(free);
    }

    /// Clears the accessed bits of `pa`'s mappings and the page's
    /// [`PageFlags::REFERENCED`].
    pub fn clear_reference(&self, pa: PhysicalAddress) {
        let Some((pa, desc, locks)) = self.lock_managed(pa) else {
            return;
        };
        let mut free = DeferredFree::new();
        self.demote_superpages_of(
            pa,
            &mut free,
            |e| e.accessed(),
            |pmap, st, va, old, free| {
                if !old.wired() {
                    self.remove_page(pmap, st, va, free);
                }
            },
        );
        for pv in self.pv_list(&desc.pv) {
            let va = self.pv_va(pv);
            let pmap = self.owner(pv);
            let _st = pmap.state.lock();
            if self.pv_pte(&pmap, va).clear_bits(bits::ACCESSED).accessed() {
                self.invalidate_page(&pmap, va);
            }
        }
        desc.clear_flags(PageFlags::REFERENCED);
        drop(locks);
        self.free_deferred(free);
    }

    /// Whether any current mapping of `pa` is both writable and dirty.
    #[must_use]
    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        let Some(desc) = self.pages.get(pa) else {
            return false;
        };
        // no writable mapping ever, nothing can be dirty
        if !desc.flags().contains(PageFlags::WRITEABLE) {
            return false;
        }
        self.any_mapping(pa, PageEntryBits::is_dirty_writable)
    }

    /// Whether any current mapping of `pa` has its accessed bit set.
    #[must_use]
    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.any_mapping(pa, |e| e.accessed())
    }

    fn any_mapping(&self, pa: PhysicalAddress, test: impl Fn(PageEntryBits) -> bool) -> bool {
        let Some((pa, desc, _locks)) = self.lock_managed(pa) else {
            return false;
        };
        let small = self.pv_list(&desc.pv).into_iter().any(|pv| {
            let pmap = self.owner(pv);
            let _st = pmap.state.lock();
            test(self.pv_pte(&pmap, self.pv_va(pv)).load())
        });
        small
            || self.pv_list(self.pages.superpage(pa)).into_iter().any(|pv| {
                let pmap = self.owner(pv);
                let _st = pmap.state.lock();
                test(self.pv_pde(&pmap, self.pv_va(pv)).load())
            })
    }

    /// Makes every mapping of `pa` read-only. Dirty bits found on the way
    /// are folded into [`PageFlags::DIRTY`].
    pub fn remove_write(&self, pa: PhysicalAddress) {
        let Some((pa, desc, locks)) = self.lock_managed(pa) else {
            return;
        };
        if !desc.flags().contains(PageFlags::WRITEABLE) {
            return;
        }
        let mut free = DeferredFree::new();
        self.demote_superpages_of(pa, &mut free, |e| e.writable(), |_, _, _, _, _| {});
        for pv in self.pv_list(&desc.pv) {
            let va = self.pv_va(pv);
            let pmap = self.owner(pv);
            let _st = pmap.state.lock();
            let slot = self.pv_pte(&pmap, va);
            let old = slot.clear_bits(bits::WRITABLE | bits::DIRTY);
            if old.dirty() {
                desc.set_flags(PageFlags::DIRTY);
            }
            if old.writable() {
                self.invalidate_page(&pmap, va);
            }
        }
        desc.clear_flags(PageFlags::WRITEABLE);
        drop(locks);
        self.free_deferred(free);
    }

    /// Number of wired mappings of `pa`, counting a wired 2 MiB mapping of
    /// its region once.
    #[must_use]
    pub fn page_wired_mappings(&self, pa: PhysicalAddress) -> usize {
        let Some((pa, desc, _locks)) = self.lock_managed(pa) else {
            return 0;
        };
        let small = self
            .pv_list(&desc.pv)
            .into_iter()
            .filter(|&pv| {
                let pmap = self.owner(pv);
                let _st = pmap.state.lock();
                self.pv_pte(&pmap, self.pv_va(pv)).load().wired()
            })
            .count();
        let large = self
            .pv_list(self.pages.superpage(pa))
            .into_iter()
            .filter(|&pv| {
                let pmap = self.owner(pv);
                let _st = pmap.state.lock();
                self.pv_pde(&pmap, self.pv_va(pv)).load().wired()
            })
            .count();
        small + large
    }
}
