// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Critical sections for the platform abstraction layer.
//!
//! A [`CriticalSection`] is a recursive lock whose uncontended path is a single atomic
//! compare-and-swap on a packed lock word. The host's blocking primitive (a pthread mutex and
//! condition variable pair) is only constructed once a thread actually has to sleep.
//!
//! Runtime-internal state is protected through [`Mutex`], a `lock_api` mutex backed by an
//! internal critical section.

mod critical_section;
mod lock_word;
mod loom;
mod native_wait;
#[cfg(not(loom))]
mod raw;
pub mod thread;

#[cfg(feature = "counters")]
pub use critical_section::CounterSnapshot;
pub use critical_section::{
    CriticalSection, CriticalSectionGuard, CriticalSectionOptions, CsKind, Fairness,
};
#[cfg(not(loom))]
pub use raw::{
    CurrentThread, Mutex, MutexGuard, RawCriticalSection, ReentrantMutex, ReentrantMutexGuard,
};
pub use thread::ThreadId;
