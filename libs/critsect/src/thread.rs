// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread identity and bookkeeping used by critical sections and synchronization objects.

use core::cell::Cell;
use core::fmt;
use core::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A process-unique, never reused identifier of a thread.
///
/// Zero is never a valid id, so it serves as the "no owner" sentinel in atomic owner fields.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

// Not a loom atomic: ids only have to be unique, they never synchronize anything.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

crate::loom::thread_local! {
    static CURRENT: ThreadId = ThreadId::allocate();
    static UNSAFE_REGION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

impl ThreadId {
    /// Returns the id of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|id| *id)
    }

    fn allocate() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).expect("thread id counter overflowed"))
    }

    /// Returns the raw, non-zero representation of this id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Reconstructs an id from its raw representation, returning `None` for zero.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadId").field(&self.0).finish()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Returns `true` while the calling thread holds at least one internal critical section.
///
/// Code that must not be interrupted (e.g. by thread suspension) while holding runtime locks
/// checks this before proceeding.
#[must_use]
pub fn in_unsafe_region() -> bool {
    UNSAFE_REGION_DEPTH.with(|depth| depth.get() > 0)
}

pub(crate) fn enter_unsafe_region() {
    UNSAFE_REGION_DEPTH.with(|depth| {
        let next = depth
            .get()
            .checked_add(1)
            .expect("unsafe region depth overflow");
        depth.set(next);
    });
}

pub(crate) fn leave_unsafe_region() {
    UNSAFE_REGION_DEPTH.with(|depth| {
        debug_assert!(depth.get() > 0, "unbalanced unsafe region");
        depth.set(depth.get().saturating_sub(1));
    });
}
