use kernel_sync::SpinLock;
use std::sync::Arc;
use std::thread;

#[test]
fn uncontended_lock_round_trip() {
    let lock = SpinLock::new(7u64);
    {
        let mut g = lock.lock();
        *g += 1;
    }
    assert_eq!(*lock.lock(), 8);
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(());
    let g = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(g);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_value() {
    let lock = SpinLock::new(41u32);
    let v = lock.with_lock(|n| {
        *n += 1;
        *n
    });
    assert_eq!(v, 42);
}

#[test]
fn contended_increments_are_not_lost() {
    const THREADS: usize = 8;
    const ITERS: usize = 10_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for _ in 0..ITERS {
                    lock.with_lock(|n| *n += 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.lock(), THREADS * ITERS);
}
