use kernel_sync::{LockStack, SpinLock, SpinLockGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const SLOTS: usize = 16;

struct Shared {
    slots: [SpinLock<()>; SLOTS],
    owner: SpinLock<usize>,
    counters: [AtomicUsize; SLOTS],
}

/// Threads hold a "owner" lock and need two slot locks acquired in arbitrary
/// order. They try first and back off through `unlocked` when contended, the
/// way the physical map resolves its lock-order inversion.
#[test]
fn try_then_relock_never_deadlocks() {
    let threads = 6;
    let iters = 2_000;
    let shared = Arc::new(Shared {
        slots: core::array::from_fn(|_| SpinLock::new(())),
        owner: SpinLock::new(0),
        counters: core::array::from_fn(|_| AtomicUsize::new(0)),
    });
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let shared = Arc::clone(&shared);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..iters {
                    let a = (t * 7 + i * 3) % SLOTS;
                    let b = (t * 5 + i * 11 + 1) % SLOTS;
                    let mut stack = LockStack::<(), 4>::new(&shared.slots);
                    let mut owner = shared.owner.lock();
                    loop {
                        if stack.try_acquire_all(&[b, a]) {
                            break;
                        }
                        SpinLockGuard::unlocked(&mut owner, || stack.acquire_all(&[a, b]));
                    }
                    *owner += 1;
                    shared.counters[a].fetch_add(1, Ordering::Relaxed);
                    shared.counters[b].fetch_add(1, Ordering::Relaxed);
                    drop(owner);
                    drop(stack);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*shared.owner.lock(), threads * iters);
    let total: usize = shared.counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, 2 * threads * iters);
    assert!(shared.slots.iter().all(|s| !s.is_locked()));
}

#[test]
fn release_single_index() {
    let table: [SpinLock<()>; 4] = core::array::from_fn(|_| SpinLock::new(()));
    let mut stack = LockStack::<(), 4>::new(&table);
    stack.acquire_all(&[3, 0, 2]);
    assert_eq!(stack.len(), 3);
    assert!(stack.release(0));
    assert!(!stack.release(0));
    assert!(!table[0].is_locked());
    assert!(table[2].is_locked() && table[3].is_locked());
}
