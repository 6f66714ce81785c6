//! # Kernel synchronization primitives
//!
//! Spin locks and the ordered multi-lock guard used by the physical map.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod lock_stack;
mod raw_spin;
mod spin_lock;

pub use lock_stack::{LOCK_STACK_DEPTH, LockStack};
pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
