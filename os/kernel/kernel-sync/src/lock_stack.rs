//! # Ordered multi-lock guard
//!
//! A [`LockStack`] holds up to `N` locks out of one lock table (for example the
//! hashed physical-page locks) and only ever *blocks* on them in ascending
//! index order. Non-blocking acquisition is allowed in any order; when it
//! fails, [`LockStack::acquire_all`] drops everything and re-takes the merged
//! set in order.
//!
//! ```
//! use kernel_sync::{LockStack, SpinLock};
//!
//! let table: [SpinLock<()>; 8] = core::array::from_fn(|_| SpinLock::new(()));
//! let mut stack = LockStack::<(), 4>::new(&table);
//! stack.acquire_all(&[5, 2]);
//! assert!(stack.contains(2) && stack.contains(5));
//! assert!(stack.try_acquire(1));
//! stack.release_all();
//! assert!(stack.is_empty());
//! ```

use crate::{SpinLock, SpinLockGuard};

/// Deepest nesting any caller needs.
pub const LOCK_STACK_DEPTH: usize = 4;

struct Held<'a, T> {
    index: usize,
    _guard: SpinLockGuard<'a, T>,
}

pub struct LockStack<'a, T, const N: usize = LOCK_STACK_DEPTH> {
    table: &'a [SpinLock<T>],
    held: [Option<Held<'a, T>>; N],
}

impl<'a, T, const N: usize> LockStack<'a, T, N> {
    #[must_use]
    pub const fn new(table: &'a [SpinLock<T>]) -> Self {
        Self {
            table,
            held: [const { None }; N],
        }
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.held.iter().flatten().any(|h| h.index == index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.held.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.iter().all(Option::is_none)
    }

    /// Indices currently held, in no particular order.
    pub fn held(&self) -> impl Iterator<Item = usize> + '_ {
        self.held.iter().flatten().map(|h| h.index)
    }

    /// Takes `index` without blocking. Already-held indices succeed trivially.
    ///
    /// # Panics
    /// If the stack is full.
    pub fn try_acquire(&mut self, index: usize) -> bool {
        if self.contains(index) {
            return true;
        }
        match self.table[index].try_lock() {
            Some(guard) => {
                self.push(index, guard);
                true
            }
            None => false,
        }
    }

    /// All-or-nothing non-blocking acquisition. On failure every lock taken by
    /// this call is released again and the previously held set is unchanged.
    ///
    /// # Panics
    /// If the merged set does not fit the stack.
    pub fn try_acquire_all(&mut self, indices: &[usize]) -> bool {
        let mut taken = [usize::MAX; N];
        let mut count = 0;
        for &index in indices {
            if self.contains(index) {
                continue;
            }
            if !self.try_acquire(index) {
                for &undo in &taken[..count] {
                    self.release(undo);
                }
                return false;
            }
            taken[count] = index;
            count += 1;
        }
        true
    }

    /// Blocking acquisition of `indices` together with everything already
    /// held. All held locks are dropped first and the merged set is then taken
    /// in ascending order.
    ///
    /// # Panics
    /// If the merged set does not fit the stack.
    pub fn acquire_all(&mut self, indices: &[usize]) {
        let (set, len) = self.merged(indices);
        if set[..len].iter().all(|&i| self.contains(i)) {
            return;
        }
        self.release_all();
        for &index in &set[..len] {
            let guard = self.table[index].lock();
            self.push(index, guard);
        }
    }

    /// Drops `index` if held; returns whether it was.
    pub fn release(&mut self, index: usize) -> bool {
        for slot in &mut self.held {
            if slot.as_ref().is_some_and(|h| h.index == index) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Drops every held lock for which `keep` returns false.
    pub fn retain(&mut self, keep: impl Fn(usize) -> bool) {
        for slot in &mut self.held {
            if slot.as_ref().is_some_and(|h| !keep(h.index)) {
                *slot = None;
            }
        }
    }

    pub fn release_all(&mut self) {
        for slot in &mut self.held {
            *slot = None;
        }
    }

    fn push(&mut self, index: usize, guard: SpinLockGuard<'a, T>) {
        let Some(slot) = self.held.iter_mut().find(|s| s.is_none()) else {
            panic!("lock stack overflow: more than {N} locks requested");
        };
        *slot = Some(Held {
            index,
            _guard: guard,
        });
    }

    /// Sorted, de-duplicated union of the held set and `extra`.
    fn merged(&self, extra: &[usize]) -> ([usize; N], usize) {
        let mut set = [usize::MAX; N];
        let mut len = 0;
        for index in self.held().chain(extra.iter().copied()) {
            if set[..len].contains(&index) {
                continue;
            }
            assert!(len < N, "lock stack overflow: more than {N} locks requested");
            set[len] = index;
            len += 1;
        }
        set[..len].sort_unstable();
        (set, len)
    }
}

impl<T, const N: usize> Drop for LockStack<'_, T, N> {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        for slot in self.held.iter_mut().rev() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> [SpinLock<()>; 8] {
        core::array::from_fn(|_| SpinLock::new(()))
    }

    #[test]
    fn acquire_all_merges_and_sorts() {
        let t = table();
        let mut s = LockStack::<(), 4>::new(&t);
        s.acquire_all(&[6]);
        s.acquire_all(&[1, 6, 3]);
        let mut held: Vec<_> = s.held().collect();
        held.sort_unstable();
        assert_eq!(held, [1, 3, 6]);
        assert!(t[1].is_locked() && t[3].is_locked() && t[6].is_locked());
        assert!(!t[2].is_locked());
    }

    #[test]
    fn try_acquire_all_rolls_back() {
        let t = table();
        let _other = t[4].lock();
        let mut s = LockStack::<(), 4>::new(&t);
        assert!(s.try_acquire(0));
        assert!(!s.try_acquire_all(&[2, 4]));
        assert!(s.contains(0));
        assert!(!s.contains(2));
        assert!(!t[2].is_locked());
    }

    #[test]
    fn drop_releases_everything() {
        let t = table();
        {
            let mut s = LockStack::<(), 4>::new(&t);
            s.acquire_all(&[0, 7]);
        }
        assert!(t.iter().all(|l| !l.is_locked()));
    }

    #[test]
    #[should_panic(expected = "lock stack overflow")]
    fn overflow_panics() {
        let t = table();
        let mut s = LockStack::<(), 2>::new(&t);
        s.acquire_all(&[0, 1, 2]);
    }
}
