use kernel_sync::{SpinLock, SpinLockGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
    }

    // previous drop must have unlocked
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
    assert!(!l.is_locked());
}

#[test]
fn try_lock_semantics() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    // while held, try_lock must fail
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn unlocked_releases_for_the_closure_only() {
    let l = SpinLock::new(7u32);
    let mut g = l.lock();
    *g = 8;
    let seen = SpinLockGuard::unlocked(&mut g, || {
        // somebody else gets in while we are backed off
        let mut other = l.try_lock().expect("lock must be free inside unlocked()");
        *other += 1;
        *other
    });
    assert_eq!(seen, 9);
    assert!(l.is_locked());
    assert_eq!(*g, 9);
    assert!(l.try_lock().is_none());
}

#[test]
fn unlocked_lets_a_blocked_thread_through() {
    let l = Arc::new(SpinLock::new(Vec::<u32>::new()));
    let mut g = l.lock();
    g.push(1);

    let l2 = Arc::clone(&l);
    let waiter = thread::spawn(move || l2.with_lock(|v| v.push(2)));

    SpinLockGuard::unlocked(&mut g, || waiter.join().unwrap());
    g.push(3);
    assert_eq!(g.as_slice(), &[1, 2, 3]);
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = SpinLock::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(l.with_lock(|s| s.clone()), "ab");
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}
