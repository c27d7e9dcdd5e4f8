// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use synch::{ObjectManager, SynchError, WaitResult, last_error};

#[test]
fn bounded_semaphore_release() {
    let manager = ObjectManager::new();
    let sem = manager.create_semaphore(None, 2, 5).unwrap();

    let res = last_error::record(manager.release_semaphore(sem, 4));
    assert_eq!(res, Err(SynchError::TooManyPosts));
    assert_eq!(last_error::get(), SynchError::TooManyPosts.code());
    assert_eq!(manager.signal_count(sem), Ok(2));

    assert_eq!(manager.release_semaphore(sem, 3), Ok(2));
    assert_eq!(manager.signal_count(sem), Ok(5));
}

#[test]
fn named_mutex_creation_fails() {
    let manager = ObjectManager::new();
    for initial_owner in [false, true] {
        let res = last_error::record(manager.create_mutex(Some("Foo"), initial_owner));
        assert_eq!(res, Err(SynchError::NotSupported));
        assert_eq!(last_error::get(), 50);
    }
}

#[test]
fn mutex_guards_counter() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 500;

    let manager = Arc::new(ObjectManager::new());
    let mutex = manager.create_mutex(None, false).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = manager.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    assert_eq!(manager.wait(mutex), Ok(WaitResult::Signaled));
                    let val = counter.load(Ordering::Relaxed);
                    counter.store(val + 1, Ordering::Relaxed);
                    manager.release_mutex(mutex).unwrap();
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERATIONS);
    assert_eq!(manager.signal_count(mutex), Ok(1));
    manager.close_handle(mutex).unwrap();
    assert_eq!(manager.open_handles(), 0);
}
