// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use core::fmt;

use util::{CachePadded, loom_const_fn};

use crate::loom::sync::atomic::{AtomicU32, Ordering};

/// The atomic lock word of a critical section. It has the following layout:
///
/// ```text
/// | 31       2 | 1               1 | 0      0 |
/// |  waiters   | awakened waiter   |  locked  |
/// ```
///
/// All transitions happen through a single compare-and-swap of the whole word, so the three
/// fields are always observed consistently.
pub(crate) struct AtomicLockWord {
    val: CachePadded<AtomicU32>,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a critical section's lock word.
    #[derive(PartialEq, Eq)]
    pub(crate) struct LockWord<u32> {
        /// If set, some thread owns the critical section.
        pub(crate) const LOCKED: bool;
        /// If set, a waiter has been woken by the previous owner and has not yet either
        /// acquired the lock or gone back to sleep.
        pub(crate) const AWAKENED_WAITER: bool;
        /// The number of threads registered as blocked on the native wait primitive.
        pub(crate) const WAITERS = ..;
    }
}

/// The amount one waiter adds to the raw lock word.
pub(crate) const WAITER_ONE: u32 = LockWord::WAITERS.first_bit();
const WAITERS_MAX: u32 = LockWord::WAITERS.raw_mask() / WAITER_ONE;

impl AtomicLockWord {
    loom_const_fn! {
        pub(crate) const fn new() -> AtomicLockWord {
            AtomicLockWord {
                val: CachePadded::new(AtomicU32::new(0)),
            }
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> LockWord {
        LockWord(self.val.load(ordering))
    }

    /// Runs `transition` against the current word until the resulting word is successfully
    /// published. The closure may leave the word untouched, in which case no store happens.
    ///
    /// Returns whatever the closure returned for the snapshot that was published.
    pub(crate) fn transition<T>(
        &self,
        success: Ordering,
        mut transition: impl FnMut(&mut LockWord) -> T,
    ) -> T {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                success,
                Ordering::Relaxed,
            ) {
                Ok(_) => return res,
                Err(actual) => current = LockWord(actual),
            }
        }
    }
}

impl fmt::Debug for AtomicLockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl LockWord {
    pub(crate) fn is_locked(self) -> bool {
        self.get(Self::LOCKED)
    }

    pub(crate) fn has_awakened_waiter(self) -> bool {
        self.get(Self::AWAKENED_WAITER)
    }

    pub(crate) fn waiters(self) -> u32 {
        Self::WAITERS.unpack(self.0)
    }

    /// Registers one more blocked waiter.
    ///
    /// # Panics
    ///
    /// Panics if the waiter count would overflow its field.
    pub(crate) fn add_waiter(&mut self) -> &mut Self {
        assert!(self.waiters() < WAITERS_MAX, "critical section waiter count overflow");
        self.0 += WAITER_ONE;
        self
    }

    /// Removes one registered waiter.
    pub(crate) fn remove_waiter(&mut self) -> &mut Self {
        debug_assert!(self.waiters() > 0, "removing a waiter from an empty lock word");
        self.0 -= WAITER_ONE;
        self
    }

    /// Returns `true` when the word is in its quiescent state: unlocked, nobody waiting and
    /// nobody awakened.
    pub(crate) fn is_idle(self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub(crate) fn into_bits(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    #[test]
    fn layout() {
        assert_eq!(LockWord::LOCKED.raw_mask(), 0b01);
        assert_eq!(LockWord::AWAKENED_WAITER.raw_mask(), 0b10);
        assert_eq!(WAITER_ONE, 4);
    }

    #[test]
    fn waiters_saturate_loudly() {
        let mut word = LockWord::new();
        word.set(LockWord::WAITERS, WAITERS_MAX);
        let res = std::panic::catch_unwind(move || {
            let mut word = word;
            word.add_waiter();
        });
        assert!(res.is_err());
    }

    proptest! {
        #[test]
        fn fields_are_independent(locked: bool, awakened: bool, waiters in 0..WAITERS_MAX) {
            let mut word = LockWord::new();
            word.set(LockWord::LOCKED, locked)
                .set(LockWord::AWAKENED_WAITER, awakened)
                .set(LockWord::WAITERS, waiters);

            prop_assert_eq!(word.is_locked(), locked);
            prop_assert_eq!(word.has_awakened_waiter(), awakened);
            prop_assert_eq!(word.waiters(), waiters);
            prop_assert_eq!(
                word.into_bits(),
                u32::from(locked) | (u32::from(awakened) << 1) | (waiters << 2)
            );

            let before = word;
            word.add_waiter();
            prop_assert_eq!(word.waiters(), waiters + 1);
            prop_assert_eq!(word.is_locked(), locked);
            prop_assert_eq!(word.has_awakened_waiter(), awakened);
            word.remove_waiter();
            prop_assert_eq!(word, before);
            prop_assert!(word.is_idle() == (!locked && !awakened && waiters == 0));
        }
    }
}
