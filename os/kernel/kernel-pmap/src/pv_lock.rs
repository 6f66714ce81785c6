//! # Physical-page locks
//!
//! PV lists are protected by a fixed table of hashed spin locks. The hash is
//! taken over the 2 MiB region, so a superpage PV head and the heads of all
//! 512 frames below it share one lock.
//!
//! Lock order: physical-page locks (ascending slot) before the address-space
//! lock. Code that holds an address-space lock and discovers it needs a
//! physical-page lock goes through [`lock_pv_for`]: it tries first and
//! otherwise backs off, re-acquires in order and reports [`Restart::Relocked`].

use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M};
use kernel_sync::{LOCK_STACK_DEPTH, LockStack, SpinLock, SpinLockGuard};

use crate::address_space::PmapState;
use crate::error::Restart;

/// Number of hashed physical-page locks.
pub const PV_LOCK_COUNT: usize = 64;

/// Slot of the lock protecting `pa`'s PV lists.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn pv_lock_slot(pa: PhysicalAddress) -> usize {
    ((pa.as_u64() >> Size2M::SHIFT) % PV_LOCK_COUNT as u64) as usize
}

pub(crate) struct PvLockTable([SpinLock<()>; PV_LOCK_COUNT]);

/// The physical-page locks held by one operation.
pub(crate) type PvLocks<'a> = LockStack<'a, (), LOCK_STACK_DEPTH>;

impl PvLockTable {
    pub fn new() -> Self {
        Self(core::array::from_fn(|_| SpinLock::new(())))
    }

    pub fn stack(&self) -> PvLocks<'_> {
        LockStack::new(&self.0)
    }

    /// Whether somebody holds the lock for `pa`. For assertions only.
    pub fn is_locked(&self, pa: PhysicalAddress) -> bool {
        self.0[pv_lock_slot(pa)].is_locked()
    }
}

/// Ensures the locks for every address in `pas` are held while `guard` is
/// held. Any lock that cannot be taken without blocking is acquired after
/// dropping `guard`; in that case `guard` is re-taken and `Relocked` returned.
pub(crate) fn lock_pv_for(
    locks: &mut PvLocks<'_>,
    guard: &mut SpinLockGuard<'_, PmapState>,
    pas: &[PhysicalAddress],
) -> Result<(), Restart> {
    let mut slots = [0usize; LOCK_STACK_DEPTH];
    let mut n = 0;
    for &pa in pas {
        let slot = pv_lock_slot(pa);
        if !slots[..n].contains(&slot) {
            slots[n] = slot;
            n += 1;
        }
    }
    if locks.try_acquire_all(&slots[..n]) {
        return Ok(());
    }
    SpinLockGuard::unlocked(guard, || locks.acquire_all(&slots[..n]));
    Err(Restart::Relocked)
}

/// Moves a page-by-page scan to `pa`: every physical-page lock not needed for
/// `pa` is released first. `before_back_off` runs, with `guard` still held,
/// only when the address-space lock is about to be dropped; scans use it to
/// flush invalidations they have batched up.
pub(crate) fn switch_pv_to(
    locks: &mut PvLocks<'_>,
    guard: &mut SpinLockGuard<'_, PmapState>,
    pa: PhysicalAddress,
    before_back_off: impl FnOnce(),
) -> Result<(), Restart> {
    let slot = pv_lock_slot(pa);
    if locks.contains(slot) && locks.len() == 1 {
        return Ok(());
    }
    locks.release_all();
    if locks.try_acquire(slot) {
        return Ok(());
    }
    before_back_off();
    SpinLockGuard::unlocked(guard, || locks.acquire_all(&[slot]));
    Err(Restart::Relocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superpage_region_shares_one_slot() {
        let base = PhysicalAddress::new(0x4020_0000);
        let slot = pv_lock_slot(base);
        for off in (0..Size2M::SIZE).step_by(0x1000) {
            assert_eq!(pv_lock_slot(base + off), slot);
        }
        assert_ne!(pv_lock_slot(base + Size2M::SIZE), slot);
        assert_eq!(pv_lock_slot(base + 64 * Size2M::SIZE), slot);
    }

    #[test]
    fn contended_lock_backs_off_and_reports_relock() {
        let table = PvLockTable::new();
        let pmap = SpinLock::new(PmapState::default());
        let pa = PhysicalAddress::new(0x60_0000);

        let mut holder = table.stack();
        holder.acquire_all(&[pv_lock_slot(pa)]);
        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                drop(holder);
            });
            let mut locks = table.stack();
            let mut guard = pmap.lock();
            assert_eq!(
                lock_pv_for(&mut locks, &mut guard, &[pa]),
                Err(Restart::Relocked)
            );
            assert!(locks.contains(pv_lock_slot(pa)));
            assert!(pmap.is_locked());
            // now held: no second back-off
            assert_eq!(lock_pv_for(&mut locks, &mut guard, &[pa]), Ok(()));
        });
        assert!(!table.is_locked(pa));
    }

    #[test]
    fn switching_releases_the_previous_page() {
        let table = PvLockTable::new();
        let pmap = SpinLock::new(PmapState::default());
        let a = PhysicalAddress::new(0x20_0000);
        let b = PhysicalAddress::new(0x40_0000);

        let mut locks = table.stack();
        let mut guard = pmap.lock();
        let mut flushed = false;
        assert_eq!(switch_pv_to(&mut locks, &mut guard, a, || flushed = true), Ok(()));
        assert_eq!(switch_pv_to(&mut locks, &mut guard, b, || flushed = true), Ok(()));
        assert!(!flushed);
        assert!(!table.is_locked(a));
        assert!(table.is_locked(b));
        drop(guard);
        drop(locks);
        assert!(!table.is_locked(b));
    }
}
