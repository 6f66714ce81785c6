//! PV entry allocation out of per-address-space chunk pages.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::SpinLock;

use super::PvRef;
use super::chunk::PvChunk;
use crate::address_space::{AddressSpace, PmapState};
use crate::context::PmapContext;
use crate::error::PvAllocError;
use crate::shootdown::TlbHardware;
use crate::stats::bump;
use crate::{FrameAlloc, PhysMapper};

/// How hard an allocation may try.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Opportunistic: fails once live entries exceed the high-water mark or
    /// when no page is free.
    Try,
    /// Fails only when no page is free.
    NoWait,
    /// Like `NoWait`, but asks the caller to drop its locks, wait for free
    /// memory and restart.
    Wait,
}

/// Global PV bookkeeping.
pub(crate) struct PvAllocator {
    live: AtomicUsize,
    chunks: SpinLock<BTreeSet<u64>>,
    max: usize,
    high_water: usize,
    warned: AtomicBool,
}

impl PvAllocator {
    pub fn new(max: usize, high_water: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            chunks: SpinLock::new(BTreeSet::new()),
            max,
            high_water,
            warned: AtomicBool::new(false),
        }
    }

    /// Live entries across all address spaces.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Chunk pages currently allocated.
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

/// Entries reserved ahead of a structural change so that it cannot fail
/// halfway through.
#[derive(Debug)]
pub(crate) struct PvBatch(Vec<PvRef>);

impl PvBatch {
    pub fn take(&mut self) -> Option<PvRef> {
        self.0.pop()
    }
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    pub(crate) fn pv_chunk(&self, page: PhysicalPage<Size4K>) -> &PvChunk {
        // Safety: chunk pages are only reachable through handles this
        // allocator handed out, and stay mapped while any slot is live.
        unsafe { self.mapper.phys_to_ref(page.base()) }
    }

    /// Hands out one PV entry owned by `pmap`. The entry's address is
    /// unset and it is on no list.
    pub(crate) fn get_pv_entry(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        policy: AllocPolicy,
    ) -> Result<PvRef, PvAllocError> {
        let live = self.pv.live.fetch_add(1, Ordering::Relaxed) + 1;
        if policy == AllocPolicy::Try && live > self.pv.high_water {
            self.pv.live.fetch_sub(1, Ordering::Relaxed);
            return Err(PvAllocError::Exhausted);
        }
        if live > self.pv.max && !self.pv.warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "{live} PV entries in use exceed the limit of {}; consider raising pv_entry_max",
                self.pv.max
            );
        }

        if let Some(&front) = st.pv_chunks.front() {
            let chunk = self.pv_chunk(front);
            if let Some(slot) = chunk.take_free() {
                if chunk.is_full() {
                    st.pv_chunks.pop_front();
                    st.pv_chunks.push_back(front);
                }
                return Ok(PvRef::new(front, slot));
            }
        }

        let Some(page) = self.frames.alloc_4k() else {
            self.pv.live.fetch_sub(1, Ordering::Relaxed);
            log::debug!("{}: no page for a PV chunk ({policy:?})", pmap.id());
            return Err(match policy {
                AllocPolicy::Wait => PvAllocError::WaitForMemory,
                AllocPolicy::Try | AllocPolicy::NoWait => PvAllocError::Exhausted,
            });
        };
        let chunk = self.pv_chunk(page);
        chunk.init(pmap.id());
        let Some(slot) = chunk.take_free() else {
            panic!("fresh PV chunk {page} has no free slot");
        };
        self.pv.chunks.lock().insert(page.pfn());
        bump(&self.stats.pv_chunk_allocs);
        st.pv_chunks.push_front(page);
        Ok(PvRef::new(page, slot))
    }

    /// Returns an entry that is on no list. Its chunk moves to the front of
    /// the owner's list, or back to the page allocator once entirely free.
    pub(crate) fn free_pv_entry(&self, st: &mut PmapState, pv: PvRef) {
        self.pv.live.fetch_sub(1, Ordering::Relaxed);
        let page = pv.chunk();
        let chunk = self.pv_chunk(page);
        chunk.release(pv.slot());

        let Some(pos) = st.pv_chunks.iter().position(|&c| c == page) else {
            panic!("PV chunk {page} is not owned by {}", chunk.owner());
        };
        if chunk.is_empty() {
            st.pv_chunks.remove(pos);
            self.pv.chunks.lock().remove(&page.pfn());
            bump(&self.stats.pv_chunk_frees);
            self.frames.free_4k(page);
        } else if pos != 0 {
            st.pv_chunks.remove(pos);
            st.pv_chunks.push_front(page);
        }
    }

    /// Reserves `count` entries at once; on failure nothing stays allocated.
    pub(crate) fn reserve_pv_entries(
        &self,
        pmap: &AddressSpace,
        st: &mut PmapState,
        count: usize,
        policy: AllocPolicy,
    ) -> Result<PvBatch, PvAllocError> {
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match self.get_pv_entry(pmap, st, policy) {
                Ok(pv) => batch.push(pv),
                Err(e) => {
                    for pv in batch {
                        self.free_pv_entry(st, pv);
                    }
                    return Err(e);
                }
            }
        }
        Ok(PvBatch(batch))
    }

    /// Gives back what is left of a batch.
    pub(crate) fn release_pv_batch(&self, st: &mut PmapState, mut batch: PvBatch) {
        while let Some(pv) = batch.take() {
            self.free_pv_entry(st, pv);
        }
    }
}
