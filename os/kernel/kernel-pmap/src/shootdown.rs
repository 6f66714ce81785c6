//! # TLB shootdown
//!
//! Every address space tracks the CPUs that have it loaded. After a store that
//! changes or removes a live translation the initiating CPU invalidates its own
//! TLB when it is one of them and interrupts the others; the call returns only
//! after every target acknowledged. The kernel address space is loaded
//! everywhere, and a single-CPU configuration never leaves the local CPU.
//!
//! Page-size-changing stores go through [`PmapContext::update_pde`]. With the
//! AMD erratum 383 workaround enabled the store itself runs inside a
//! rendezvous: one CPU stores while every affected CPU is parked, then each of
//! them invalidates, so no CPU ever holds a 4 KiB and a 2 MiB translation for
//! the same address at once.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering, fence};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress};

use crate::address_space::AddressSpace;
use crate::config::MAX_CPUS;
use crate::context::PmapContext;
use crate::entry::PageEntryBits;
use crate::stats::bump;
use crate::table::EntrySlot;
use crate::{FrameAlloc, PhysMapper};

/// Index of a CPU, below [`MAX_CPUS`].
pub type CpuId = usize;

/// A set of CPUs.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    /// CPUs `0..count`.
    #[must_use]
    pub const fn all(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu) != 0
    }

    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1 << cpu))
    }

    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu))
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let cpu = rest.trailing_zeros() as usize;
            rest &= rest - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A [`CpuSet`] updated concurrently by context switches.
#[derive(Debug, Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, set: CpuSet) {
        self.0.store(set.0, Ordering::Release);
    }

    pub fn insert(&self, cpu: CpuId) {
        self.0.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    pub fn remove(&self, cpu: CpuId) {
        self.0.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }
}

/// What to drop from a TLB.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlbRequest {
    /// The translation covering one address, of whatever size.
    Page(VirtualAddress),
    /// Every translation in `[start, end)`.
    Range {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    /// All non-global translations.
    All,
    /// Everything, global translations included.
    Global,
}

/// The processor-side primitives the shootdown protocol is built from.
///
/// Implemented by the architecture layer on real hardware and by the
/// simulated machine in tests.
pub trait TlbHardware: Sync {
    /// CPUs present; every [`CpuId`] handed out is below this.
    fn cpu_count(&self) -> usize;

    /// The CPU executing the caller. Only stable while pinned.
    fn current_cpu(&self) -> CpuId;

    /// Keeps the caller on its current CPU until the matching [`unpin`](Self::unpin).
    fn pin(&self);

    fn unpin(&self);

    /// Executes `request` on the current CPU.
    fn invalidate_local(&self, request: TlbRequest);

    /// Interrupts every CPU in `targets` (never the caller's own) to execute
    /// `request` and returns once all of them have done so.
    fn send_invalidate(&self, targets: CpuSet, request: TlbRequest);

    /// Runs `action` on every CPU in `targets`, including the caller's own,
    /// with all of them stopped in the rendezvous, then `teardown` on each of
    /// them. Returns after every target finished `teardown`.
    fn rendezvous(
        &self,
        targets: CpuSet,
        action: &(dyn Fn(CpuId) + Sync),
        teardown: &(dyn Fn(CpuId) + Sync),
    );

    /// Switches the current CPU to the address space rooted at `root`.
    fn load_root(&self, root: PhysicalPage<Size4K>);
}

/// Holds the caller on its CPU for the guard's lifetime.
pub(crate) struct Pinned<'a, H: TlbHardware> {
    hw: &'a H,
    pub cpu: CpuId,
}

impl<'a, H: TlbHardware> Pinned<'a, H> {
    pub fn new(hw: &'a H) -> Self {
        hw.pin();
        Self {
            hw,
            cpu: hw.current_cpu(),
        }
    }
}

impl<H: TlbHardware> Drop for Pinned<'_, H> {
    fn drop(&mut self) {
        self.hw.unpin();
    }
}

/// Invalidations a scan has batched up instead of issuing them per entry.
#[derive(Debug, Default)]
pub(crate) struct PendingInvalidation {
    /// A non-global translation changed; flush the whole address space.
    all: bool,
    /// Global translations changed within `[start, end)`.
    global: Option<(VirtualAddress, VirtualAddress)>,
}

impl PendingInvalidation {
    pub fn page(&mut self, va: VirtualAddress, global: bool) {
        if !global {
            self.all = true;
            return;
        }
        let end = va + Size4K::SIZE;
        self.global = Some(match self.global {
            Some((s, e)) => (s.min(va), e.max(end)),
            None => (va, end),
        });
    }

    pub fn mark_all(&mut self) {
        self.all = true;
    }

    /// Issues what was collected and starts over.
    pub fn flush<M: PhysMapper, F: FrameAlloc, H: TlbHardware>(
        &mut self,
        ctx: &PmapContext<M, F, H>,
        pmap: &AddressSpace,
    ) {
        // a full flush of the kernel drops global entries too
        if core::mem::take(&mut self.all) {
            self.global = None;
            ctx.invalidate_all(pmap);
        } else if let Some((start, end)) = self.global.take() {
            ctx.invalidate_range(pmap, start, end);
        }
    }
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// CPUs that may cache translations of `pmap`.
    fn tlb_targets(&self, pmap: &AddressSpace) -> CpuSet {
        if pmap.is_kernel() {
            CpuSet::all(self.config.cpus)
        } else {
            pmap.active_cpus()
        }
    }

    fn shootdown(&self, pmap: &AddressSpace, request: TlbRequest) {
        let pin = Pinned::new(&self.hw);
        // entry stores must be visible before any remote CPU looks
        fence(Ordering::SeqCst);
        if self.config.cpus == 1 {
            self.hw.invalidate_local(request);
            bump(&self.stats.local_invalidations);
            return;
        }
        let targets = self.tlb_targets(pmap);
        if targets.contains(pin.cpu) {
            self.hw.invalidate_local(request);
            bump(&self.stats.local_invalidations);
        }
        let others = targets.without(pin.cpu);
        if !others.is_empty() {
            log::trace!("{}: shootdown {request:?} to {others:?}", pmap.id());
            self.hw.send_invalidate(others, request);
            self.stats
                .remote_invalidations
                .fetch_add(others.len() as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn invalidate_page(&self, pmap: &AddressSpace, va: VirtualAddress) {
        self.shootdown(pmap, TlbRequest::Page(va));
    }

    pub(crate) fn invalidate_range(
        &self,
        pmap: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        if start >= end {
            return;
        }
        self.shootdown(pmap, TlbRequest::Range { start, end });
    }

    pub(crate) fn invalidate_all(&self, pmap: &AddressSpace) {
        let request = if pmap.is_kernel() {
            TlbRequest::Global
        } else {
            TlbRequest::All
        };
        self.shootdown(pmap, request);
    }

    /// Replaces a page-directory entry whose page-size bit may change and
    /// invalidates what the old entry could have left behind.
    pub(crate) fn update_pde(
        &self,
        pmap: &AddressSpace,
        va: VirtualAddress,
        slot: EntrySlot<'_>,
        new: PageEntryBits,
    ) {
        let request = if !new.large_page() {
            // demotion: one 2 MiB translation
            TlbRequest::Page(va)
        } else if new.global_translation() {
            TlbRequest::Global
        } else {
            TlbRequest::All
        };

        if !self.config.erratum_383 {
            slot.store(new);
            if new.large_page() {
                self.invalidate_all(pmap);
            } else {
                self.invalidate_page(pmap, va);
            }
            return;
        }

        let pin = Pinned::new(&self.hw);
        let me = pin.cpu;
        let active = if self.config.cpus == 1 {
            CpuSet::single(me)
        } else {
            self.tlb_targets(pmap)
        };
        if active.without(me).is_empty() {
            slot.store(new);
            if active.contains(me) {
                self.hw.invalidate_local(request);
                bump(&self.stats.local_invalidations);
            }
            return;
        }

        fence(Ordering::SeqCst);
        bump(&self.stats.rendezvous);
        let store = |cpu: CpuId| {
            if cpu == me {
                slot.store(new);
            }
        };
        let invalidate = |cpu: CpuId| {
            if active.contains(cpu) {
                self.hw.invalidate_local(request);
            }
        };
        self.hw.rendezvous(active.with(me), &store, &invalidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_set_operations() {
        let s = CpuSet::all(4);
        assert_eq!(s.len(), 4);
        assert!(s.contains(3) && !s.contains(4));
        let t = s.without(1).with(9);
        assert_eq!(t.iter().collect::<Vec<_>>(), [0, 2, 3, 9]);
        assert_eq!(CpuSet::all(MAX_CPUS).len(), MAX_CPUS);
        assert!(CpuSet::EMPTY.is_empty());
        assert_eq!(format!("{:?}", CpuSet::single(5)), "{5}");
    }

    #[test]
    fn atomic_set_updates() {
        let a = AtomicCpuSet::default();
        a.insert(2);
        a.insert(7);
        a.remove(2);
        assert_eq!(a.load(), CpuSet::single(7));
        a.store(CpuSet::all(2));
        assert_eq!(a.load().len(), 2);
    }
}
