//! # Installing mappings
//!
//! [`PmapContext::enter`] is the general path: it may replace an existing
//! mapping, demote a covering 2 MiB mapping and wait for memory.
//! [`PmapContext::enter_quick`] and [`PmapContext::enter_object`] only ever
//! add read-only mappings where nothing is mapped yet, and give up instead of
//! waiting.

use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K, VirtualAddress};

use crate::address_space::{AddressSpace, PmapGuard, PmapState};
use crate::context::PmapContext;
use crate::entry::{PageEntryBits, bits};
use crate::error::{PmapError, Restart};
use crate::page::{PageDescriptor, PageFlags};
use crate::protection::{EnterFlags, Protection};
use crate::pv::AllocPolicy;
use crate::pv_lock::{PvLocks, lock_pv_for, pv_lock_slot, switch_pv_to};
use crate::radix::DeferredFree;
use crate::shootdown::TlbHardware;
use crate::{FrameAlloc, PhysMapper};

const NPTEPG: u32 = Size2M::FRAMES as u32;

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// The leaf entry `enter` installs for `desc`'s frame.
    fn new_pte(
        &self,
        pmap: &AddressSpace,
        desc: &PageDescriptor,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> PageEntryBits {
        let writable = prot.contains(Protection::WRITE);
        let mut e = PageEntryBits::from_raw(
            pa.page::<Size4K>().base().as_u64() | desc.memattr().cache_bits(false),
        )
        .with_present(true)
        .with_writable(writable)
        .with_no_execute(self.config.no_execute && !prot.contains(Protection::EXECUTE))
        .with_wired(flags.contains(EnterFlags::WIRED))
        .with_managed(desc.is_managed());
        if pmap.is_kernel() {
            e = e.with_global_translation(true);
        } else {
            e = e.with_user_access(true);
        }
        if flags.intersects(EnterFlags::ACCESS_ANY) {
            e = e.with_accessed(true);
        }
        if flags.contains(EnterFlags::ACCESS_WRITE) && writable {
            e = e.with_dirty(true);
        }
        e
    }

    /// Maps the 4 KiB page at `va` to the frame `pa`, replacing whatever was
    /// mapped there.
    ///
    /// A 2 MiB mapping covering `va` is demoted first. Missing page tables and
    /// PV entries are allocated; unless [`EnterFlags::NOSLEEP`] is given the
    /// call waits for free memory instead of failing. Once the page table
    /// holding `va` is full, promotion to a 2 MiB mapping is attempted.
    ///
    /// # Errors
    /// - [`PmapError::Unaligned`] / [`PmapError::OutOfRange`] for a bad `va`.
    /// - [`PmapError::UnknownPage`] if `pa` has no descriptor.
    /// - [`PmapError::ResourceShortage`] with `NOSLEEP` when memory ran out.
    pub fn enter(
        &self,
        pmap: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<(), PmapError> {
        self.check_page(pmap, va)?;
        let desc = self.pages.get(pa).ok_or(PmapError::UnknownPage(pa))?;
        let newpte = self.new_pte(pmap, desc, pa, prot, flags);
        let policy = if flags.contains(EnterFlags::NOSLEEP) {
            AllocPolicy::NoWait
        } else {
            AllocPolicy::Wait
        };
        loop {
            match self.try_enter(pmap, va, newpte, policy) {
                Ok(()) => return Ok(()),
                Err(Restart::WaitForMemory) if policy == AllocPolicy::NoWait => {
                    log::debug!("{}: enter {va} -> {pa} failed, no memory", pmap.id());
                    return Err(PmapError::ResourceShortage);
                }
                Err(Restart::WaitForMemory) => self.frames.wait_for_free(),
                Err(Restart::Relocked) => {}
            }
        }
    }

    fn try_enter(
        &self,
        pmap: &AddressSpace,
        va: VirtualAddress,
        newpte: PageEntryBits,
        policy: AllocPolicy,
    ) -> Result<(), Restart> {
        let mut locks = self.pv_locks.stack();
        if newpte.managed() {
            locks.acquire_all(&[pv_lock_slot(newpte.frame())]);
        }
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();
        let result = self.enter_locked(&mut locks, &mut st, pmap, va, newpte, policy, &mut free);
        drop(st);
        drop(locks);
        self.free_deferred(free);
        result
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn enter_locked(
        &self,
        locks: &mut PvLocks<'_>,
        st: &mut PmapGuard<'_>,
        pmap: &AddressSpace,
        va: VirtualAddress,
        newpte: PageEntryBits,
        policy: AllocPolicy,
        free: &mut DeferredFree,
    ) -> Result<(), Restart> {
        let pa = newpte.frame();
        let own_slot = newpte.managed().then(|| pv_lock_slot(pa));

        // Take the lock of whatever currently backs `va`, demoting on the way.
        loop {
            let pde_slot = self.pde(pmap, va);
            let pde = pde_slot.map_or(PageEntryBits::EMPTY, |s| s.load());
            let need = if pde.is_superpage() {
                pde.managed().then(|| pde.large_frame())
            } else if pde.present() {
                let old = self.pde_to_pte(pde, va).load();
                (old.present() && old.managed() && old.frame() != pa).then(|| old.frame())
            } else {
                None
            };
            let need_slot = need.map(pv_lock_slot);
            locks.retain(|s| Some(s) == own_slot || Some(s) == need_slot);
            if let Some(need) = need {
                if lock_pv_for(locks, st, &[need]).is_err() {
                    continue;
                }
            }
            match pde_slot {
                Some(slot) if pde.is_superpage() => {
                    // on failure the 2 MiB mapping is gone, which is fine too
                    self.demote_pde(pmap, st, slot, va, free);
                }
                _ => break,
            }
        }

        let Some(ptp) = self.alloc_pte(pmap, st, va) else {
            return Err(Restart::WaitForMemory);
        };
        let slot = self.table(ptp).slot(va.pt_index());
        let orig = slot.load();
        let same_frame = orig.present() && orig.frame() == pa;
        let reuse = orig.present() && orig.managed() && !same_frame;
        let fresh_pv = if newpte.managed() && !same_frame && !reuse {
            match self.get_pv_entry(pmap, st, policy) {
                Ok(pv) => Some(pv),
                Err(e) => {
                    self.unwire_ptp(pmap, st, va, ptp, free);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        if orig.present() {
            // the existing entry already holds a reference on the table
            self.pages.descriptor(ptp.base()).unwire();
            match (orig.wired(), newpte.wired()) {
                (true, false) => st.wired -= 1,
                (false, true) => st.wired += 1,
                _ => {}
            }
            if reuse {
                let old_pv = self.pvh_remove(&self.pages.descriptor(orig.frame()).pv, pmap.id(), va);
                if newpte.managed() {
                    self.insert_pv_entry(old_pv, va, pa);
                } else {
                    self.free_pv_entry(st, old_pv);
                }
            }
        } else {
            st.resident += 1;
            if newpte.wired() {
                st.wired += 1;
            }
        }
        if let Some(pv) = fresh_pv {
            self.insert_pv_entry(pv, va, pa);
        }
        let desc = self.pages.descriptor(pa);
        if newpte.managed() && newpte.writable() {
            desc.set_flags(PageFlags::WRITEABLE);
        }

        let hw_bits = bits::ACCESSED | bits::DIRTY;
        if !orig.present() {
            slot.store(newpte);
        } else if orig.raw() | hw_bits != newpte.raw() | hw_bits {
            let orig = slot.swap(newpte);
            let mut invalidate = false;
            let old_desc = orig.managed().then(|| self.pages.descriptor(orig.frame()));
            if orig.accessed() {
                if let Some(d) = old_desc {
                    d.set_flags(PageFlags::REFERENCED);
                }
                if orig.frame() != pa || (!orig.no_execute() && newpte.no_execute()) {
                    invalidate = true;
                }
            }
            if orig.is_dirty_writable() {
                if let Some(d) = old_desc {
                    d.set_flags(PageFlags::DIRTY);
                }
                if !newpte.writable() {
                    invalidate = true;
                }
            }
            if orig.managed() && orig.frame() != pa {
                self.clear_writeable_if_unmapped(orig.frame());
            }
            if invalidate {
                self.invalidate_page(pmap, va);
            }
        }
        log::trace!("{}: mapped {va} -> {pa}", pmap.id());

        if self.config.superpages && self.pages.descriptor(ptp.base()).wire_count() == NPTEPG {
            self.promote_pde(pmap, st, va);
        }
        Ok(())
    }

    /// Adds a read-only mapping of `pa` at `va` if nothing is mapped there.
    /// Never waits: any shortage just skips the page. Returns whether a
    /// mapping was added.
    pub fn enter_quick(
        &self,
        pmap: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
    ) -> bool {
        if self.check_page(pmap, va).is_err() {
            log::debug!("{}: enter_quick at invalid address {va}", pmap.id());
            return false;
        }
        let Some(desc) = self.pages.get(pa) else {
            return false;
        };
        let mut locks = self.pv_locks.stack();
        if desc.is_managed() {
            locks.acquire_all(&[pv_lock_slot(pa)]);
        }
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();
        let done = self.enter_quick_locked(pmap, &mut st, va, pa, prot, &mut free);
        drop(st);
        drop(locks);
        self.free_deferred(free);
        done
    }

    fn enter_quick_locked(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        free: &mut DeferredFree,
    ) -> bool {
        let pde = self.pde(pmap, va).map_or(PageEntryBits::EMPTY, |s| s.load());
        if pde.is_superpage() {
            return false;
        }
        let Some(ptp) = self.alloc_pte(pmap, st, va) else {
            return false;
        };
        let slot = self.table(ptp).slot(va.pt_index());
        if slot.load().present() {
            self.unwire_ptp(pmap, st, va, ptp, free);
            return false;
        }

        let desc = self.pages.descriptor(pa);
        let mut e = PageEntryBits::from_raw(
            pa.page::<Size4K>().base().as_u64() | desc.memattr().cache_bits(false),
        )
        .with_present(true)
        .with_user_access(!pmap.is_kernel())
        .with_no_execute(self.config.no_execute && !prot.contains(Protection::EXECUTE));
        if desc.is_managed() {
            if !self.try_insert_pv_entry(pmap, st, va, pa) {
                self.unwire_ptp(pmap, st, va, ptp, free);
                return false;
            }
            e = e.with_managed(true);
        }
        st.resident += 1;
        slot.store(e);
        true
    }

    /// Whether `pages` is one physically contiguous, 2 MiB-aligned run with
    /// uniform attributes.
    fn is_superpage_run(&self, pages: &[PhysicalAddress]) -> bool {
        let Some(&first) = pages.first() else {
            return false;
        };
        let Some(d0) = self.pages.get(first) else {
            return false;
        };
        pages.len() == Size2M::FRAMES as usize
            && first.is_aligned::<Size2M>()
            && pages.iter().enumerate().all(|(i, &pa)| {
                pa == first + i as u64 * Size4K::SIZE
                    && self
                        .pages
                        .get(pa)
                        .is_some_and(|d| d.memattr() == d0.memattr() && d.is_managed() == d0.is_managed())
            })
    }

    /// Maps `pages[i]` at `start + i * 4 KiB` read-only wherever nothing is
    /// mapped yet. Runs of 512 pages that line up on 2 MiB in both address
    /// spaces are mapped with one 2 MiB entry.
    ///
    /// # Errors
    /// [`PmapError::Unaligned`] / [`PmapError::OutOfRange`] for a bad range.
    pub fn enter_object(
        &self,
        pmap: &AddressSpace,
        start: VirtualAddress,
        pages: &[PhysicalAddress],
        prot: Protection,
    ) -> Result<(), PmapError> {
        let end = start + pages.len() as u64 * Size4K::SIZE;
        self.check_range(pmap, start, end)?;
        let mut locks = self.pv_locks.stack();
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();

        let mut i = 0;
        while i < pages.len() {
            let va = start + i as u64 * Size4K::SIZE;
            let pa = pages[i];
            let Some(desc) = self.pages.get(pa) else {
                i += 1;
                continue;
            };
            if desc.is_managed() && switch_pv_to(&mut locks, &mut st, pa, || {}).is_err() {
                continue;
            }
            let run = pages.get(i..i + Size2M::FRAMES as usize).unwrap_or_default();
            if self.config.superpages
                && va.is_aligned::<Size2M>()
                && self.is_superpage_run(run)
                && self.enter_pde(pmap, &mut st, va, pa, prot, &mut free)
            {
                i += Size2M::FRAMES as usize;
            } else {
                self.enter_quick_locked(pmap, &mut st, va, pa, prot, &mut free);
                i += 1;
            }
        }
        drop(st);
        drop(locks);
        self.free_deferred(free);
        Ok(())
    }
}
