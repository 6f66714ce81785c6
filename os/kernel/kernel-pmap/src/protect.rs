//! Narrowing access rights and changing the wired attribute.

use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K, VirtualAddress};

use crate::address_space::AddressSpace;
use crate::context::PmapContext;
use crate::entry::{PageEntryBits, bits};
use crate::error::PmapError;
use crate::page::PageFlags;
use crate::protection::Protection;
use crate::pv_lock::{lock_pv_for, switch_pv_to};
use crate::radix::{DeferredFree, next_pml4_boundary};
use crate::shootdown::{PendingInvalidation, TlbHardware};
use crate::table::EntrySlot;
use crate::{FrameAlloc, PhysMapper};

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// Applies `prot` to one 4 KiB entry. Returns the previous value if the
    /// entry changed.
    fn protect_pte(&self, slot: EntrySlot<'_>, prot: Protection) -> Option<PageEntryBits> {
        loop {
            let old = slot.load();
            if !old.present() {
                return None;
            }
            let mut new = old;
            if !prot.contains(Protection::WRITE) {
                new = new.with_writable(false).with_dirty(false);
            }
            if self.config.no_execute && !prot.contains(Protection::EXECUTE) {
                new = new.with_no_execute(true);
            }
            if new == old {
                return None;
            }
            if slot.compare_exchange(old, new).is_ok() {
                if old.managed() && old.is_dirty_writable() && !new.writable() {
                    self.pages.descriptor(old.frame()).set_flags(PageFlags::DIRTY);
                }
                return Some(old);
            }
        }
    }

    /// Restricts the mappings in `[start, end)` to `prot`. Rights are only
    /// ever taken away; without [`Protection::READ`] the range is removed.
    /// Every CPU sees the narrowed rights once this returns.
    ///
    /// # Errors
    /// [`PmapError::Unaligned`] / [`PmapError::OutOfRange`] for a bad range.
    pub fn protect(
        &self,
        pmap: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: Protection,
    ) -> Result<(), PmapError> {
        if !prot.contains(Protection::READ) {
            return self.remove(pmap, start, end);
        }
        self.check_range(pmap, start, end)?;
        if prot.contains(Protection::WRITE | Protection::EXECUTE) {
            return Ok(());
        }

        let mut locks = self.pv_locks.stack();
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();
        let mut pending = PendingInvalidation::default();
        let mut sva = start;
        while sva < end {
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
                if sva.is_aligned::<Size2M>() && va_next - sva == Size2M::SIZE {
                    if self.protect_pde(pmap, pde_slot, sva, prot) {
                        pending.mark_all();
                    }
                    sva = va_next;
                    continue;
                }
                let flush = || pending.flush(self, pmap);
                if pde.managed() && switch_pv_to(&mut locks, &mut st, pde.large_frame(), flush).is_err() {
                    continue;
                }
                if !self.demote_pde(pmap, &mut st, pde_slot, sva, &mut free) {
                    // the mapping is gone, nothing left to protect
                    sva = va_next;
                }
                continue;
            }

            let table = self.table(pde.frame_page());
            let mut va = sva;
            while va < va_next {
                if let Some(old) = self.protect_pte(table.slot(va.pt_index()), prot) {
                    if old.global_translation() {
                        self.invalidate_page(pmap, va);
                    } else {
                        pending.mark_all();
                    }
                }
                va += Size4K::SIZE;
            }
            sva = va_next;
        }
        pending.flush(self, pmap);
        drop(st);
        drop(locks);
        self.free_deferred(free);
        Ok(())
    }

    /// Sets or clears the wired attribute of the mapping at `va`. A 2 MiB
    /// mapping with a different wiring is demoted first.
    ///
    /// # Errors
    /// [`PmapError::NotMapped`] if nothing is mapped at `va`.
    ///
    /// # Panics
    /// If the demotion fails.
    pub fn change_wiring(
        &self,
        pmap: &AddressSpace,
        va: VirtualAddress,
        wired: bool,
    ) -> Result<(), PmapError> {
        let mut locks = self.pv_locks.stack();
        let mut st = pmap.state.lock();
        let mut free = DeferredFree::new();
        let result = loop {
            let Some(pde_slot) = self.pde(pmap, va) else {
                break Err(PmapError::NotMapped(va));
            };
            let pde = pde_slot.load();
            if !pde.present() {
                break Err(PmapError::NotMapped(va));
            }
            if pde.large_page() {
                if pde.wired() == wired {
                    break Ok(());
                }
                if pde.managed() && lock_pv_for(&mut locks, &mut st, &[pde.large_frame()]).is_err() {
                    continue;
                }
                if !self.demote_pde(pmap, &mut st, pde_slot, va, &mut free) {
                    panic!("{}: demotion failed at {va} while changing its wiring", pmap.id());
                }
                continue;
            }
            let slot = self.pde_to_pte(pde, va);
            let e = slot.load();
            if !e.present() {
                break Err(PmapError::NotMapped(va));
            }
            if wired && !e.wired() {
                slot.set_bits(bits::WIRED);
                st.wired += 1;
            } else if !wired && e.wired() {
                slot.clear_bits(bits::WIRED);
                st.wired -= 1;
            }
            break Ok(());
        };
        drop(st);
        drop(locks);
        self.free_deferred(free);
        result
    }
}
