//! Translating virtual addresses.

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, Size2M, Size4K, VirtualAddress};

use crate::address_space::AddressSpace;
use crate::context::PmapContext;
use crate::page::PageDescriptor;
use crate::protection::Protection;
use crate::pv_lock::switch_pv_to;
use crate::shootdown::TlbHardware;
use crate::{FrameAlloc, PhysMapper};

/// A transient hold on a physical page, released on drop.
///
/// A held page may lose its mappings but is not handed back to the page
/// allocator by its owner while the hold lasts.
#[must_use]
pub struct PageHold<'a> {
    desc: &'a PageDescriptor,
    pa: PhysicalAddress,
}

impl PageHold<'_> {
    /// Base address of the held frame.
    #[must_use]
    pub const fn pa(&self) -> PhysicalAddress {
        self.pa
    }

    #[must_use]
    pub const fn descriptor(&self) -> &PageDescriptor {
        self.desc
    }
}

impl Drop for PageHold<'_> {
    fn drop(&mut self) {
        self.desc.unhold();
    }
}

impl fmt::Debug for PageHold<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PageHold").field(&self.pa).finish()
    }
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// The physical address `va` translates to in `pmap`.
    #[must_use]
    pub fn extract(&self, pmap: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _st = pmap.state.lock();
        let pde = self.pde(pmap, va)?.load();
        if !pde.present() {
            return None;
        }
        if pde.large_page() {
            return Some(pde.large_frame() + va.offset::<Size2M>());
        }
        let pte = self.pde_to_pte(pde, va).load();
        pte.present().then(|| pte.frame() + va.offset::<Size4K>())
    }

    /// Looks up the frame mapped at `va` and holds it, but only if the
    /// mapping grants `prot` (write access is the only right checked).
    pub fn extract_and_hold(
        &self,
        pmap: &AddressSpace,
        va: VirtualAddress,
        prot: Protection,
    ) -> Option<PageHold<'_>> {
        let mut locks = self.pv_locks.stack();
        let mut st = pmap.state.lock();
        loop {
            let pde = self.pde(pmap, va)?.load();
            if !pde.present() {
                return None;
            }
            let (leaf, pa) = if pde.large_page() {
                (pde, pde.large_frame() + (va.offset::<Size2M>() - va.offset::<Size4K>()))
            } else {
                let pte = self.pde_to_pte(pde, va).load();
                (pte, pte.frame())
            };
            if !leaf.present() || (prot.contains(Protection::WRITE) && !leaf.writable()) {
                return None;
            }
            let desc = self.pages.get(pa)?;
            // the frame must not be unmapped and reused while we take the hold
            if switch_pv_to(&mut locks, &mut st, pa, || {}).is_err() {
                continue;
            }
            desc.hold();
            return Some(PageHold { desc, pa });
        }
    }
}
