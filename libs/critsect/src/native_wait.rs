// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The kernel-assisted blocking primitive behind a contended critical section.
//!
//! A [`NativeWait`] is a binary event: [`NativeWait::wake`] sets a predicate and wakes at most
//! one sleeper, [`NativeWait::wait`] blocks until the predicate is set and consumes it. A wake
//! that arrives before the matching wait is not lost.

use std::io;

#[cfg(test)]
static INJECTED_FAILURES: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// Makes the next `n` constructions of the host primitive fail with `EAGAIN`.
#[cfg(test)]
pub(crate) fn fail_next_constructions(n: usize) {
    INJECTED_FAILURES.store(n, std::sync::atomic::Ordering::Release);
}

#[cfg(test)]
pub(crate) fn pending_injected_failures() -> usize {
    INJECTED_FAILURES.load(std::sync::atomic::Ordering::Acquire)
}

#[cfg(all(test, not(loom)))]
fn injected_failure() -> Option<io::Error> {
    use std::sync::atomic::Ordering;

    INJECTED_FAILURES
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .ok()
        .map(|_| io::Error::from_raw_os_error(libc::EAGAIN))
}

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        use crate::loom::sync::{Condvar, Mutex, PoisonError};

        pub(crate) struct NativeWait {
            predicate: Mutex<bool>,
            cond: Condvar,
        }

        impl NativeWait {
            #[expect(clippy::unnecessary_wraps, reason = "mirrors the fallible host constructor")]
            pub(crate) fn new() -> io::Result<Self> {
                Ok(Self {
                    predicate: Mutex::new(false),
                    cond: Condvar::new(),
                })
            }

            pub(crate) fn wait(&self) {
                let mut signaled = self.predicate.lock().unwrap_or_else(PoisonError::into_inner);
                while !*signaled {
                    signaled = self.cond.wait(signaled).unwrap_or_else(PoisonError::into_inner);
                }
                *signaled = false;
            }

            pub(crate) fn wake(&self) {
                let mut signaled = self.predicate.lock().unwrap_or_else(PoisonError::into_inner);
                *signaled = true;
                self.cond.notify_one();
            }
        }
    } else {
        use core::cell::UnsafeCell;
        use core::ptr;

        /// The raw pthread objects. This type has no `Drop` impl, the objects are only destroyed
        /// through [`NativeWait`] once both were successfully initialized.
        struct Raw {
            mutex: UnsafeCell<libc::pthread_mutex_t>,
            cond: UnsafeCell<libc::pthread_cond_t>,
            /// Guarded by `mutex`.
            signaled: UnsafeCell<bool>,
        }

        pub(crate) struct NativeWait {
            // pthread objects must not move after initialization, so they live on the heap.
            raw: Box<Raw>,
        }

        // Safety: the pthread objects are designed to be shared between threads and `signaled`
        // is only ever accessed while holding `mutex`.
        unsafe impl Send for NativeWait {}
        // Safety: see above
        unsafe impl Sync for NativeWait {}

        impl NativeWait {
            /// Constructs the pthread mutex and condition variable.
            ///
            /// # Errors
            ///
            /// Returns the error reported by `pthread_mutex_init` or `pthread_cond_init`,
            /// typically `EAGAIN` or `ENOMEM` when the host is out of resources.
            pub(crate) fn new() -> io::Result<Self> {
                #[cfg(test)]
                if let Some(err) = injected_failure() {
                    return Err(err);
                }

                let raw = Box::new(Raw {
                    mutex: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
                    cond: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
                    signaled: UnsafeCell::new(false),
                });

                // Safety: `raw.mutex` points to valid, heap pinned storage
                let ret = unsafe { libc::pthread_mutex_init(raw.mutex.get(), ptr::null()) };
                if ret != 0 {
                    return Err(io::Error::from_raw_os_error(ret));
                }

                // Safety: `raw.cond` points to valid, heap pinned storage
                let ret = unsafe { libc::pthread_cond_init(raw.cond.get(), ptr::null()) };
                if ret != 0 {
                    // Safety: the mutex was successfully initialized above and nobody else
                    // has seen it yet
                    unsafe {
                        libc::pthread_mutex_destroy(raw.mutex.get());
                    }
                    return Err(io::Error::from_raw_os_error(ret));
                }

                Ok(Self { raw })
            }

            pub(crate) fn wait(&self) {
                let raw = &*self.raw;

                // Safety: both objects were initialized in `new` and `signaled` is only touched
                // while holding the mutex
                unsafe {
                    check("pthread_mutex_lock", libc::pthread_mutex_lock(raw.mutex.get()));
                    while !*raw.signaled.get() {
                        check(
                            "pthread_cond_wait",
                            libc::pthread_cond_wait(raw.cond.get(), raw.mutex.get()),
                        );
                    }
                    *raw.signaled.get() = false;
                    check("pthread_mutex_unlock", libc::pthread_mutex_unlock(raw.mutex.get()));
                }
            }

            pub(crate) fn wake(&self) {
                let raw = &*self.raw;

                // Safety: both objects were initialized in `new` and `signaled` is only touched
                // while holding the mutex
                unsafe {
                    check("pthread_mutex_lock", libc::pthread_mutex_lock(raw.mutex.get()));
                    *raw.signaled.get() = true;
                    check("pthread_cond_signal", libc::pthread_cond_signal(raw.cond.get()));
                    check("pthread_mutex_unlock", libc::pthread_mutex_unlock(raw.mutex.get()));
                }
            }
        }

        impl Drop for NativeWait {
            fn drop(&mut self) {
                // Safety: we have exclusive access and both objects were initialized in `new`
                unsafe {
                    libc::pthread_cond_destroy(self.raw.cond.get());
                    libc::pthread_mutex_destroy(self.raw.mutex.get());
                }
            }
        }

        /// Operations on an initialized pthread mutex or condition variable only fail when the
        /// object is corrupted. There is no way to recover from that.
        fn check(op: &'static str, ret: libc::c_int) {
            if ret != 0 {
                let err = io::Error::from_raw_os_error(ret);
                tracing::error!(%err, "{op} failed on an initialized native wait primitive");
                std::process::abort();
            }
        }
    }
}

impl core::fmt::Debug for NativeWait {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeWait").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::{AtomicBool, Ordering};
    use crate::loom::{self, thread};

    #[test]
    fn wake_before_wait_is_not_lost() {
        loom::model(|| {
            let native = NativeWait::new().unwrap();
            native.wake();
            native.wait();
        });
    }

    #[test]
    fn wake_releases_sleeper() {
        loom::model(|| {
            let native = Arc::new(NativeWait::new().unwrap());
            let woken = Arc::new(AtomicBool::new(false));

            let sleeper = thread::spawn({
                let native = native.clone();
                let woken = woken.clone();
                move || {
                    native.wait();
                    woken.store(true, Ordering::Release);
                }
            });

            native.wake();
            sleeper.join().unwrap();
            assert!(woken.load(Ordering::Acquire));
        });
    }
}
