use core::sync::atomic::{AtomicU64, Ordering};

/// Event counters. Relaxed; they only feed diagnostics.
#[derive(Debug, Default)]
pub(crate) struct PmapStats {
    pub pde_mappings: AtomicU64,
    pub promotions: AtomicU64,
    pub promotion_failures: AtomicU64,
    pub demotions: AtomicU64,
    pub demotion_failures: AtomicU64,
    pub pv_chunk_allocs: AtomicU64,
    pub pv_chunk_frees: AtomicU64,
    pub local_invalidations: AtomicU64,
    pub remote_invalidations: AtomicU64,
    pub rendezvous: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Copy of the counters at one point in time.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PmapStatsSnapshot {
    /// 2 MiB mappings created directly.
    pub pde_mappings: u64,
    pub promotions: u64,
    pub promotion_failures: u64,
    pub demotions: u64,
    pub demotion_failures: u64,
    /// Live PV entries.
    pub pv_entries: u64,
    /// Live PV chunks.
    pub pv_chunks: u64,
    pub pv_chunk_allocs: u64,
    pub pv_chunk_frees: u64,
    /// Invalidations executed on the initiating CPU.
    pub local_invalidations: u64,
    /// Target CPUs reached by invalidation IPIs.
    pub remote_invalidations: u64,
    pub rendezvous: u64,
}

impl PmapStats {
    pub(crate) fn snapshot(&self, pv_entries: u64, pv_chunks: u64) -> PmapStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PmapStatsSnapshot {
            pde_mappings: get(&self.pde_mappings),
            promotions: get(&self.promotions),
            promotion_failures: get(&self.promotion_failures),
            demotions: get(&self.demotions),
            demotion_failures: get(&self.demotion_failures),
            pv_entries,
            pv_chunks,
            pv_chunk_allocs: get(&self.pv_chunk_allocs),
            pv_chunk_frees: get(&self.pv_chunk_frees),
            local_invalidations: get(&self.local_invalidations),
            remote_invalidations: get(&self.remote_invalidations),
            rendezvous: get(&self.rendezvous),
        }
    }
}
