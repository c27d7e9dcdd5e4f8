// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::num::NonZeroUsize;
use core::ptr::NonNull;

use crate::CriticalSection;

/// A data-owning mutex backed by an internal [`CriticalSection`].
pub type Mutex<T> = lock_api::Mutex<RawCriticalSection, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawCriticalSection, T>;

/// A mutex backed by an internal [`CriticalSection`] that the owning thread may lock again.
///
/// Only shared access is handed out, so the protected data usually lives in a `RefCell`.
pub type ReentrantMutex<T> = lock_api::ReentrantMutex<RawCriticalSection, CurrentThread, T>;
pub type ReentrantMutexGuard<'a, T> =
    lock_api::ReentrantMutexGuard<'a, RawCriticalSection, CurrentThread, T>;

/// Adapts an internal, non-spinning [`CriticalSection`] to [`lock_api::RawMutex`].
///
/// Holding the lock places the owning thread in an unsafe region. Unlike the critical section
/// itself the adapter is not reentrant, since handing out two `&mut T` to the same thread would
/// be unsound.
pub struct RawCriticalSection {
    cs: CriticalSection,
}

// Safety: `lock` and `try_lock` only succeed once the critical section grants exclusive
// ownership to the calling thread, and `unlock` is only called by that thread because the guard
// is `!Send`
unsafe impl lock_api::RawMutex for RawCriticalSection {
    type GuardMarker = lock_api::GuardNoSend;

    const INIT: Self = Self {
        cs: CriticalSection::new_internal(0),
    };

    fn lock(&self) {
        assert!(
            !self.cs.is_owned_by_current_thread(),
            "recursive lock of a non-reentrant critical section mutex"
        );
        self.cs.enter();
    }

    fn try_lock(&self) -> bool {
        !self.cs.is_owned_by_current_thread() && self.cs.try_enter()
    }

    unsafe fn unlock(&self) {
        self.cs.leave();
    }

    fn is_locked(&self) -> bool {
        self.cs.is_locked()
    }
}

/// Identifies the calling thread for [`ReentrantMutex`].
pub struct CurrentThread;

std::thread_local! {
    static THREAD_KEY: u8 = const { 0 };
}

// Safety: the address of a thread-local is non-zero and no two live threads share it
unsafe impl lock_api::GetThreadId for CurrentThread {
    const INIT: Self = CurrentThread;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        THREAD_KEY.with(|key| NonNull::from(key).addr())
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn guards_data() {
        let mutex = Arc::new(Mutex::new(Vec::new()));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        mutex.lock().push(i * 100 + j);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut data = Arc::into_inner(mutex).unwrap().into_inner();
        data.sort_unstable();
        assert_eq!(data, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn holding_marks_unsafe_region() {
        let mutex = Mutex::new(());
        assert!(!crate::thread::in_unsafe_region());
        let guard = mutex.lock();
        assert!(crate::thread::in_unsafe_region());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!crate::thread::in_unsafe_region());
    }

    #[test]
    #[should_panic = "recursive lock"]
    fn recursive_lock_panics() {
        let mutex = Mutex::new(());
        let _a = mutex.lock();
        let _b = mutex.lock();
    }

    #[test]
    fn reentrant_relock() {
        let mutex = ReentrantMutex::new(RefCell::new(0));

        let outer = mutex.lock();
        *outer.borrow_mut() += 1;
        {
            let inner = mutex.lock();
            *inner.borrow_mut() += 1;
            assert!(crate::thread::in_unsafe_region());
        }
        assert_eq!(*outer.borrow(), 2);
        assert!(mutex.is_owned_by_current_thread());

        let other = std::thread::scope(|s| s.spawn(|| mutex.try_lock().is_none()).join().unwrap());
        assert!(other);

        drop(outer);
        assert!(!crate::thread::in_unsafe_region());
        assert!(std::thread::scope(|s| s.spawn(|| mutex.try_lock().is_some()).join().unwrap()));
    }
}
