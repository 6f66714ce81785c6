//! Enumeration and consistency checking of an address space.

use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::memory::{KERNEL_PML4_INDEX, SELF_MAP_PML4_INDEX};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress};

use crate::address_space::{AddressSpace, PmapState};
use crate::context::PmapContext;
use crate::entry::PageEntryBits;
use crate::pv::PvRef;
use crate::shootdown::TlbHardware;
use crate::{FrameAlloc, PhysMapper};

const PML4_SHIFT: u32 = 39;

/// One leaf translation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub va: VirtualAddress,
    pub pa: PhysicalAddress,
    /// 4 KiB or 2 MiB.
    pub size: u64,
    pub entry: PageEntryBits,
}

/// Result of one full walk.
#[derive(Default)]
struct Walk {
    /// Page-table pages below the root with their present entry count.
    tables: Vec<(PhysicalPage<Size4K>, u32)>,
    leaves: Vec<Mapping>,
}

fn pml4_slots(pmap: &AddressSpace) -> Range<usize> {
    if pmap.is_kernel() {
        KERNEL_PML4_INDEX..KERNEL_PML4_INDEX + 1
    } else {
        0..SELF_MAP_PML4_INDEX
    }
}

#[allow(clippy::cast_possible_truncation)]
fn present(entries: impl Iterator<Item = (usize, PageEntryBits)>) -> (Vec<(usize, PageEntryBits)>, u32) {
    let list: Vec<_> = entries.filter(|(_, e)| e.present()).collect();
    let n = list.len() as u32;
    (list, n)
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    fn walk(&self, pmap: &AddressSpace) -> Walk {
        let mut out = Walk::default();
        let root = self.table(pmap.root());
        for i4 in pml4_slots(pmap) {
            let pml4e = root.slot(i4).load();
            if !pml4e.present() {
                continue;
            }
            let base4 = (i4 as u64) << PML4_SHIFT;
            let (pdpes, n) = present(self.table(pml4e.frame_page()).entries());
            out.tables.push((pml4e.frame_page(), n));
            for (i3, pdpe) in pdpes {
                let base3 = base4 + i3 as u64 * Size1G::SIZE;
                let (pdes, n) = present(self.table(pdpe.frame_page()).entries());
                out.tables.push((pdpe.frame_page(), n));
                for (i2, pde) in pdes {
                    let base2 = base3 + i2 as u64 * Size2M::SIZE;
                    if pde.large_page() {
                        out.leaves.push(Mapping {
                            va: VirtualAddress::canonical(base2),
                            pa: pde.large_frame(),
                            size: Size2M::SIZE,
                            entry: pde,
                        });
                        continue;
                    }
                    let (ptes, n) = present(self.table(pde.frame_page()).entries());
                    out.tables.push((pde.frame_page(), n));
                    out.leaves.extend(ptes.into_iter().map(|(i1, pte)| Mapping {
                        va: VirtualAddress::canonical(base2 + i1 as u64 * Size4K::SIZE),
                        pa: pte.frame(),
                        size: Size4K::SIZE,
                        entry: pte,
                    }));
                }
            }
        }
        out
    }

    /// Every leaf mapping of `pmap`, in address order. The kernel address
    /// space reports only the slot it manages.
    #[must_use]
    pub fn mappings(&self, pmap: &AddressSpace) -> Vec<Mapping> {
        let _st = pmap.state.lock();
        self.walk(pmap).leaves
    }

    /// Checks the bookkeeping of `pmap` against its page tables: wire counts
    /// of page-table pages, the resident and wired counts, idle page tables
    /// and PV entries. Meant for quiescent address spaces.
    ///
    /// # Panics
    /// On the first inconsistency found.
    pub fn verify(&self, pmap: &AddressSpace) {
        let st = pmap.state.lock();
        let walk = self.walk(pmap);
        let id = pmap.id();

        for &(page, present) in &walk.tables {
            let wire = self.pages.descriptor(page.base()).wire_count();
            assert_eq!(wire, present, "{id}: page table {page} has wire count {wire}, {present} entries");
        }

        let mut small = 0;
        let mut large = 0;
        let mut wired = 0;
        let mut managed = 0;
        for m in &walk.leaves {
            let pages = m.size / Size4K::SIZE;
            if m.size == Size2M::SIZE {
                large += 1;
            } else {
                small += 1;
            }
            if m.entry.wired() {
                wired += pages;
            }
            if !m.entry.managed() {
                continue;
            }
            managed += 1;
            let head = if m.size == Size2M::SIZE {
                self.pages.superpage(m.pa)
            } else {
                &self.pages.descriptor(m.pa).pv
            };
            assert!(
                self.pv_find(head, id, m.va).is_some(),
                "{id}: managed mapping {} -> {} has no PV entry",
                m.va,
                m.pa
            );
        }

        self.verify_idle_ptps(pmap, &st);

        let tables = walk.tables.len() as u64 + st.idle_ptps.len() as u64;
        let resident = small + large * Size2M::FRAMES + tables;
        assert_eq!(st.resident, resident, "{id}: resident count {} but {resident} pages found", st.resident);
        assert_eq!(st.wired, wired, "{id}: wired count {} but {wired} wired pages found", st.wired);

        let mut entries = 0;
        for &chunk in &st.pv_chunks {
            let c = self.pv_chunk(chunk);
            assert_eq!(c.owner(), id, "{id}: owns PV chunk {chunk} of {}", c.owner());
            for slot in c.allocated() {
                let va = self.pv_va(PvRef::new(chunk, slot));
                assert!(
                    walk.leaves.iter().any(|m| m.va == va && m.entry.managed()),
                    "{id}: PV entry at {va} without a managed mapping"
                );
                entries += 1;
            }
        }
        assert_eq!(entries, managed, "{id}: {entries} PV entries for {managed} managed mappings");
    }

    #[allow(clippy::cast_possible_truncation)]
    fn verify_idle_ptps(&self, pmap: &AddressSpace, st: &PmapState) {
        let id = pmap.id();
        for (&index, &ptp) in &st.idle_ptps {
            let va = VirtualAddress::canonical(index << Size2M::SHIFT);
            let pde = self.pde(pmap, va).map(|s| s.load());
            assert!(
                pde.is_some_and(|e| e.is_superpage()),
                "{id}: idle page table {ptp} for {va} behind no 2 MiB mapping"
            );
            let wire = self.pages.descriptor(ptp.base()).wire_count();
            assert_eq!(
                wire,
                Size2M::FRAMES as u32,
                "{id}: idle page table {ptp} has wire count {wire}"
            );
        }
    }
}
