use crate::RawSpin;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

/// A test-and-test-and-set spin lock owning its data.
///
/// Page-table locks and the hashed physical-page locks are all of this type;
/// callers that must respect a lock order use [`SpinLock::try_lock`] and
/// [`SpinLockGuard::unlocked`] to back off instead of spinning into a
/// deadlock.
pub struct SpinLock<T> {
    raw: RawSpin,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            raw: RawSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Spin until acquired, then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Snapshot of the lock word. Only meaningful for assertions.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_held()
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the lock for the duration of `f` and takes it again afterwards.
    ///
    /// Anything read through the guard before the call may be stale after it;
    /// callers are expected to revalidate.
    pub fn unlocked<R>(guard: &mut Self, f: impl FnOnce() -> R) -> R {
        // Safety: the guard owns the lock; it is re-taken before returning.
        unsafe { guard.lock.raw.unlock() };
        let out = f();
        guard.lock.raw.lock();
        out
    }

    /// The lock this guard holds.
    #[must_use]
    pub const fn lock_ref(guard: &Self) -> &'a SpinLock<T> {
        guard.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        unsafe { self.lock.raw.unlock() };
    }
}
