// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomData;

use util::loom_const_fn;

use crate::lock_word::{AtomicLockWord, LockWord};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use crate::native_wait::NativeWait;
use crate::thread::{self, ThreadId};

/// How ownership is handed to a blocked waiter when the owner leaves.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Fairness {
    /// The owner clears the lock bit before waking a waiter. The woken thread has to compete
    /// for the lock again and may lose to a thread that never slept.
    #[default]
    Unfair,
    /// The owner keeps the lock bit set and hands the critical section directly to the woken
    /// waiter. Waiters are woken in the order the host's condition variable picks them, which
    /// is FIFO on most hosts but not guaranteed.
    TransferOwnership,
}

/// Distinguishes critical sections protecting runtime-internal state from user ones.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum CsKind {
    #[default]
    User,
    /// While held, the owning thread is in an "unsafe region", see
    /// [`in_unsafe_region`](crate::thread::in_unsafe_region).
    Internal,
}

/// Construction parameters for a [`CriticalSection`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CriticalSectionOptions {
    /// How many times a contended `enter` re-checks the lock word before blocking.
    pub spin_count: u32,
    pub fairness: Fairness,
    pub kind: CsKind,
}

/// Lifecycle of the native wait primitive. The primitive is only constructed once the
/// critical section actually becomes contended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum NativeState {
    /// The critical section was deleted (or never initialized).
    Uninitialized = 0,
    /// Initialized for use, the native wait primitive has not been constructed yet.
    UserInitialized = 1,
    /// Some thread is currently constructing the native wait primitive.
    Initializing = 2,
    /// The native wait primitive is ready for use.
    Initialized = 3,
}

impl NativeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::UserInitialized,
            2 => Self::Initializing,
            3 => Self::Initialized,
            _ => unreachable!("invalid native wait state {raw}"),
        }
    }
}

/// A recursive mutual exclusion lock.
///
/// Uncontended `enter`/`leave` pairs are a single compare-and-swap each and never touch the
/// host's blocking primitives. Only when a thread exhausts its spin budget does the critical
/// section construct its native wait primitive, exactly once, and block on it.
///
/// The owning thread may `enter` again any number of times, each `enter` must be matched by a
/// `leave`. A critical section must be left by the thread that entered it.
pub struct CriticalSection {
    word: AtomicLockWord,
    /// The raw [`ThreadId`] of the owner, or `0`.
    owner: AtomicU64,
    /// Only accessed by the owning thread.
    recursion: UnsafeCell<u32>,
    spin_count: u32,
    fairness: Fairness,
    kind: CsKind,
    native_state: AtomicU8,
    /// Written once while `native_state` is `Initializing`, read-only after it turned
    /// `Initialized`.
    native: UnsafeCell<Option<NativeWait>>,
    #[cfg(feature = "counters")]
    counters: counters::Counters,
}

// Safety: `recursion` is only accessed by the owning thread and `native` is published through
// the release/acquire handshake on `native_state`
unsafe impl Send for CriticalSection {}
// Safety: see above
unsafe impl Sync for CriticalSection {}

/// An RAII guard returned by [`CriticalSection::lock`], leaves the critical section when
/// dropped.
///
/// The guard cannot be sent to another thread since the critical section must be left by the
/// thread that entered it.
#[clippy::has_significant_drop]
#[must_use = "if unused the CriticalSection will immediately be left"]
pub struct CriticalSectionGuard<'a> {
    cs: &'a CriticalSection,
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    loom_const_fn! {
        /// Creates an unfair user critical section that spins `spin_count` times before
        /// blocking.
        #[must_use]
        pub const fn new(spin_count: u32) -> CriticalSection {
            CriticalSection::raw(spin_count, Fairness::Unfair, CsKind::User)
        }
    }

    loom_const_fn! {
        /// Creates an unfair critical section protecting runtime-internal state.
        #[must_use]
        pub const fn new_internal(spin_count: u32) -> CriticalSection {
            CriticalSection::raw(spin_count, Fairness::Unfair, CsKind::Internal)
        }
    }

    loom_const_fn! {
        const fn raw(spin_count: u32, fairness: Fairness, kind: CsKind) -> CriticalSection {
            CriticalSection {
                word: AtomicLockWord::new(),
                owner: AtomicU64::new(0),
                recursion: UnsafeCell::new(0),
                spin_count,
                fairness,
                kind,
                native_state: AtomicU8::new(NativeState::UserInitialized as u8),
                native: UnsafeCell::new(None),
                #[cfg(feature = "counters")]
                counters: counters::Counters::new(),
            }
        }
    }

    /// Creates a critical section from explicit options.
    ///
    /// Ownership-transferring critical sections try to construct their native wait primitive
    /// up front. If that fails the section silently falls back to constructing it on first
    /// contention.
    #[must_use]
    pub fn with_options(options: CriticalSectionOptions) -> Self {
        let cs = Self::raw(options.spin_count, options.fairness, options.kind);
        if options.fairness == Fairness::TransferOwnership {
            cs.try_init_native();
        }
        cs
    }

    /// Makes a deleted critical section usable again.
    ///
    /// # Panics
    ///
    /// Panics if the critical section is still owned or has waiters.
    pub fn init(&mut self, options: CriticalSectionOptions) {
        self.delete();
        *self = Self::with_options(options);
    }

    /// Releases the native wait primitive. Entering a deleted critical section is a bug.
    ///
    /// Deleting is idempotent and also happens on drop.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the critical section is still owned or has waiters. Release
    /// builds only log the misuse.
    pub fn delete(&mut self) {
        let word = self.word.load(Ordering::Acquire);
        if !word.is_idle() {
            tracing::error!(?word, "deleting a critical section that is still in use");
            debug_assert!(false, "deleting a critical section that is still in use: {word:?}");
        }
        self.release_native();
    }

    fn release_native(&mut self) {
        // Safety: we have exclusive access
        let native = self.native.with_mut(|slot| unsafe { (*slot).take() });
        drop(native);
        self.native_state
            .store(NativeState::Uninitialized as u8, Ordering::Release);
    }

    /// Enters the critical section, blocking the calling thread until it is available.
    ///
    /// If the calling thread already owns the critical section the recursion count is
    /// incremented instead.
    ///
    /// # Panics
    ///
    /// Panics if the critical section was deleted or the recursion count overflows.
    pub fn enter(&self) {
        let me = ThreadId::current();

        #[cfg(feature = "counters")]
        self.counters.record_enter();

        if !self.try_enter_recursive(me) {
            self.acquire(me);
        }

        if self.kind == CsKind::Internal {
            thread::enter_unsafe_region();
        }
    }

    /// Enters the critical section if it can be done without blocking.
    ///
    /// Returns `true` if the calling thread now owns the critical section (possibly
    /// recursively).
    ///
    /// # Panics
    ///
    /// Panics if the recursion count overflows.
    pub fn try_enter(&self) -> bool {
        let me = ThreadId::current();

        let acquired = if self.try_enter_recursive(me) {
            true
        } else {
            let acquired = self.word.transition(Ordering::Acquire, |word| {
                if word.is_locked() {
                    return false;
                }
                word.set(LockWord::LOCKED, true);
                true
            });
            if acquired {
                self.take_ownership(me, false);
            }
            acquired
        };

        if acquired && self.kind == CsKind::Internal {
            thread::enter_unsafe_region();
        }

        acquired
    }

    /// Enters the critical section and returns a guard that leaves it when dropped.
    ///
    /// # Panics
    ///
    /// See [`Self::enter`].
    pub fn lock(&self) -> CriticalSectionGuard<'_> {
        self.enter();
        CriticalSectionGuard {
            cs: self,
            _not_send: PhantomData,
        }
    }

    /// Leaves the critical section once. When the recursion count drops to zero the critical
    /// section is released and, if there are blocked waiters, one of them is woken.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not own the critical section.
    pub fn leave(&self) {
        let me = ThreadId::current();
        assert!(
            self.owner.load(Ordering::Relaxed) == me.as_u64(),
            "thread {me} tried to leave a critical section it does not own"
        );

        if self.kind == CsKind::Internal {
            thread::leave_unsafe_region();
        }

        // Safety: we are the owner
        let remaining = self.recursion.with_mut(|recursion| unsafe {
            *recursion -= 1;
            *recursion
        });
        if remaining > 0 {
            return;
        }

        self.owner.store(0, Ordering::Relaxed);

        let fairness = self.fairness;
        let wake = self.word.transition(Ordering::AcqRel, |word| {
            debug_assert!(word.is_locked(), "leaving an unlocked critical section");

            if word.waiters() == 0 {
                word.set(LockWord::LOCKED, false);
                return false;
            }

            match fairness {
                // A previously woken waiter is still on its way, it will either take the lock
                // or go back to sleep, so there is no need to wake another one.
                Fairness::Unfair if word.has_awakened_waiter() => {
                    word.set(LockWord::LOCKED, false);
                    false
                }
                Fairness::Unfair => {
                    word.remove_waiter()
                        .set(LockWord::LOCKED, false)
                        .set(LockWord::AWAKENED_WAITER, true);
                    true
                }
                // The lock bit stays set, the woken waiter inherits it.
                Fairness::TransferOwnership => {
                    word.remove_waiter();
                    true
                }
            }
        });

        if wake {
            tracing::trace!(fairness = ?self.fairness, "waking critical section waiter");
            self.native().wake();
        }
    }

    /// Returns `true` if the calling thread owns the critical section.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == ThreadId::current().as_u64()
    }

    /// Returns `true` if any thread owns the critical section.
    ///
    /// This is a snapshot and may be stale by the time it is inspected.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed).is_locked()
    }

    /// Returns the number of threads currently registered as blocked.
    ///
    /// This is a snapshot and may be stale by the time it is inspected.
    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.word.load(Ordering::Relaxed).waiters()
    }

    /// Returns how many times the calling thread has entered the critical section, `0` if it
    /// doesn't own it.
    #[must_use]
    pub fn recursion_count(&self) -> u32 {
        if self.is_owned_by_current_thread() {
            // Safety: we are the owner
            self.recursion.with(|recursion| unsafe { *recursion })
        } else {
            0
        }
    }

    #[must_use]
    pub fn spin_count(&self) -> u32 {
        self.spin_count
    }

    #[must_use]
    pub fn fairness(&self) -> Fairness {
        self.fairness
    }

    #[must_use]
    pub fn kind(&self) -> CsKind {
        self.kind
    }

    /// Returns a snapshot of the contention counters.
    #[cfg(feature = "counters")]
    #[must_use]
    pub fn counters(&self) -> counters::CounterSnapshot {
        self.counters.snapshot()
    }

    pub(crate) fn has_native_wait(&self) -> bool {
        NativeState::from_u8(self.native_state.load(Ordering::Acquire)) == NativeState::Initialized
    }

    fn try_enter_recursive(&self, me: ThreadId) -> bool {
        // Only the owner itself ever stores its own id, so this can't be a false positive.
        if self.owner.load(Ordering::Relaxed) != me.as_u64() {
            return false;
        }

        // Safety: we are the owner
        self.recursion.with_mut(|recursion| unsafe {
            *recursion = (*recursion)
                .checked_add(1)
                .expect("critical section recursion count overflow");
        });
        true
    }

    fn take_ownership(&self, me: ThreadId, transferred: bool) {
        debug_assert_eq!(
            self.owner.load(Ordering::Relaxed),
            0,
            "critical section acquired while it still has an owner"
        );
        debug_assert!(transferred || self.word.load(Ordering::Relaxed).is_locked());

        self.owner.store(me.as_u64(), Ordering::Relaxed);
        // Safety: we are the owner now
        self.recursion.with_mut(|recursion| unsafe { *recursion = 1 });
    }

    #[cold]
    fn acquire(&self, me: ThreadId) {
        let mut spins_left = self.spin_count;
        // Set once we returned from the native wait in unfair mode. We are then responsible for
        // clearing the awakened flag in the lock word, either when taking the lock or when
        // registering as a waiter again.
        let mut awakened = false;
        #[cfg(feature = "counters")]
        let mut contended = false;

        loop {
            let acquired = self.word.transition(Ordering::Acquire, |word| {
                if word.is_locked() {
                    return false;
                }
                word.set(LockWord::LOCKED, true);
                if awakened {
                    debug_assert!(word.has_awakened_waiter());
                    word.set(LockWord::AWAKENED_WAITER, false);
                }
                true
            });

            if acquired {
                self.take_ownership(me, false);
                return;
            }

            #[cfg(feature = "counters")]
            if !contended {
                contended = true;
                self.counters.record_contention();
            }

            if spins_left > 0 {
                spins_left -= 1;
                spin_pause();
                continue;
            }

            // Spinning didn't pay off, we have to block. The primitive must exist before we
            // register, the owner is allowed to wake us the moment the count is published.
            self.ensure_native();

            let registered = self.word.transition(Ordering::AcqRel, |word| {
                // The owner left in the meantime, race for the lock again.
                if !word.is_locked() {
                    return false;
                }
                word.add_waiter();
                if awakened {
                    debug_assert!(word.has_awakened_waiter());
                    word.set(LockWord::AWAKENED_WAITER, false);
                }
                true
            });

            if !registered {
                continue;
            }

            #[cfg(feature = "counters")]
            self.counters.record_block();

            self.native().wait();

            match self.fairness {
                Fairness::TransferOwnership => {
                    self.take_ownership(me, true);
                    return;
                }
                Fairness::Unfair => awakened = true,
            }
        }
    }

    /// Makes sure the native wait primitive exists, constructing it if this thread is the
    /// first to need it.
    fn ensure_native(&self) {
        loop {
            match NativeState::from_u8(self.native_state.load(Ordering::Acquire)) {
                NativeState::Initialized => return,
                NativeState::UserInitialized => {
                    if self.try_init_native() {
                        return;
                    }
                    crate::loom::thread::yield_now();
                }
                NativeState::Initializing => crate::loom::thread::yield_now(),
                NativeState::Uninitialized => {
                    panic!("entered a critical section after it was deleted")
                }
            }
        }
    }

    /// Attempts to construct the native wait primitive once.
    ///
    /// Returns `true` if the primitive is ready after this call.
    fn try_init_native(&self) -> bool {
        if let Err(actual) = self.native_state.compare_exchange(
            NativeState::UserInitialized as u8,
            NativeState::Initializing as u8,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            return NativeState::from_u8(actual) == NativeState::Initialized;
        }

        match NativeWait::new() {
            Ok(native) => {
                // Safety: the `Initializing` state grants us exclusive access to the slot, no
                // reader looks at it before observing `Initialized`
                self.native.with_mut(|slot| unsafe { *slot = Some(native) });
                self.native_state
                    .store(NativeState::Initialized as u8, Ordering::Release);
                tracing::trace!("constructed native wait primitive");
                true
            }
            Err(err) => {
                tracing::warn!(%err, "failed to construct native wait primitive, will retry");
                self.native_state
                    .store(NativeState::UserInitialized as u8, Ordering::Release);
                false
            }
        }
    }

    fn native(&self) -> &NativeWait {
        debug_assert!(self.has_native_wait());
        // Safety: the slot is never written again once `Initialized` was published, and it
        // stays alive until `delete` which requires `&mut self`
        let native = self.native.with(|slot| unsafe { (*slot).as_ref() });
        native.expect("native wait primitive must exist once waiters are registered")
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let word = self.word.load(Ordering::Acquire);
        if !word.is_idle() {
            tracing::error!(?word, "dropping a critical section that is still owned");
        }
        self.release_native();
    }
}

impl fmt::Debug for CriticalSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection")
            .field("word", &self.word)
            .field("owner", &ThreadId::from_u64(self.owner.load(Ordering::Relaxed)))
            .field("spin_count", &self.spin_count)
            .field("fairness", &self.fairness)
            .field("kind", &self.kind)
            .field(
                "native_state",
                &NativeState::from_u8(self.native_state.load(Ordering::Relaxed)),
            )
            .finish_non_exhaustive()
    }
}

impl CriticalSectionGuard<'_> {
    /// Returns the critical section this guard holds.
    #[must_use]
    pub fn critical_section(&self) -> &CriticalSection {
        self.cs
    }
}

impl Drop for CriticalSectionGuard<'_> {
    fn drop(&mut self) {
        self.cs.leave();
    }
}

impl fmt::Debug for CriticalSectionGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSectionGuard")
            .field("cs", self.cs)
            .finish()
    }
}

#[inline]
fn spin_pause() {
    cfg_if::cfg_if! {
        if #[cfg(loom)] {
            crate::loom::thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

#[cfg(feature = "counters")]
mod counters {
    use crate::loom::sync::atomic::{AtomicU64, Ordering};
    use util::loom_const_fn;

    #[derive(Debug)]
    pub(super) struct Counters {
        enters: AtomicU64,
        contentions: AtomicU64,
        blocks: AtomicU64,
    }

    /// Contention statistics of a single critical section.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct CounterSnapshot {
        /// Calls to `enter`, recursive ones included.
        pub enters: u64,
        /// `enter` calls that found the critical section owned by another thread.
        pub contentions: u64,
        /// Times a thread blocked on the native wait primitive.
        pub blocks: u64,
    }

    impl Counters {
        loom_const_fn! {
            pub(super) const fn new() -> Counters {
                Counters {
                    enters: AtomicU64::new(0),
                    contentions: AtomicU64::new(0),
                    blocks: AtomicU64::new(0),
                }
            }
        }

        pub(super) fn record_enter(&self) {
            self.enters.fetch_add(1, Ordering::Relaxed);
        }

        pub(super) fn record_contention(&self) {
            self.contentions.fetch_add(1, Ordering::Relaxed);
        }

        pub(super) fn record_block(&self) {
            self.blocks.fetch_add(1, Ordering::Relaxed);
        }

        pub(super) fn snapshot(&self) -> CounterSnapshot {
            CounterSnapshot {
                enters: self.enters.load(Ordering::Relaxed),
                contentions: self.contentions.load(Ordering::Relaxed),
                blocks: self.blocks.load(Ordering::Relaxed),
            }
        }
    }
}

#[cfg(feature = "counters")]
pub use counters::CounterSnapshot;

#[cfg(test)]
mod tests {
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicUsize;
    use crate::loom::{self, thread};

    fn options(spin_count: u32, fairness: Fairness) -> CriticalSectionOptions {
        CriticalSectionOptions {
            spin_count,
            fairness,
            kind: CsKind::User,
        }
    }

    fn assert_quiescent(cs: &CriticalSection) {
        let word = cs.word.load(Ordering::Acquire);
        assert!(word.is_idle(), "critical section not quiescent: {word:?}");
        assert!(!cs.is_owned_by_current_thread());
    }

    #[test]
    fn uncontended_enter_leave() {
        loom::model(|| {
            let cs = CriticalSection::new(0);
            cs.enter();
            assert!(cs.is_owned_by_current_thread());
            assert!(cs.is_locked());
            assert_eq!(cs.recursion_count(), 1);
            cs.leave();
            assert_quiescent(&cs);
            // no contention, no native primitive
            assert!(!cs.has_native_wait());
        });
    }

    #[test]
    fn recursion() {
        loom::model(|| {
            let cs = CriticalSection::new(0);
            cs.enter();
            cs.enter();
            assert!(cs.try_enter());
            assert_eq!(cs.recursion_count(), 3);

            cs.leave();
            cs.leave();
            assert!(cs.is_locked());
            assert!(cs.is_owned_by_current_thread());

            cs.leave();
            assert_quiescent(&cs);
        });
    }

    #[test]
    fn leave_by_non_owner_panics() {
        let cs = CriticalSection::new(0);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cs.leave()));
        assert!(res.is_err());
    }

    #[test]
    fn try_enter_fails_while_owned_elsewhere() {
        loom::model(|| {
            let cs = Arc::new(CriticalSection::new(0));
            cs.enter();

            let cs2 = cs.clone();
            let acquired = thread::spawn(move || {
                let acquired = cs2.try_enter();
                if acquired {
                    cs2.leave();
                }
                acquired
            })
            .join()
            .unwrap();

            assert!(!acquired);
            cs.leave();
            assert_quiescent(&cs);
        });
    }

    fn mutual_exclusion(fairness: Fairness, spin_count: u32) {
        const THREADS: usize = if cfg!(loom) { 1 } else { 3 };

        loom::model(move || {
            let cs = Arc::new(CriticalSection::with_options(options(spin_count, fairness)));
            let inside = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..THREADS)
                .map(|_| {
                    let cs = cs.clone();
                    let inside = inside.clone();
                    thread::spawn(move || {
                        cs.enter();
                        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                        inside.fetch_sub(1, Ordering::Relaxed);
                        cs.leave();
                    })
                })
                .collect();

            cs.enter();
            assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
            inside.fetch_sub(1, Ordering::Relaxed);
            cs.leave();

            for thread in threads {
                thread.join().unwrap();
            }

            assert_quiescent(&cs);
        });
    }

    #[test]
    fn mutual_exclusion_unfair() {
        mutual_exclusion(Fairness::Unfair, 0);
    }

    #[test]
    fn mutual_exclusion_unfair_spinning() {
        mutual_exclusion(Fairness::Unfair, 1);
    }

    #[test]
    fn mutual_exclusion_transfer_ownership() {
        mutual_exclusion(Fairness::TransferOwnership, 0);
    }

    // T1 owns the section, T2 blocks in enter, T1 leaves and T2 returns owning it.
    fn handoff(fairness: Fairness) {
        loom::model(move || {
            let cs = Arc::new(CriticalSection::with_options(options(0, fairness)));
            cs.enter();

            let t2 = thread::spawn({
                let cs = cs.clone();
                move || {
                    cs.enter();
                    assert!(cs.is_owned_by_current_thread());
                    assert_eq!(cs.recursion_count(), 1);
                    cs.leave();
                }
            });

            cs.leave();
            t2.join().unwrap();

            assert_quiescent(&cs);
        });
    }

    #[test]
    fn handoff_unfair() {
        handoff(Fairness::Unfair);
    }

    #[test]
    fn handoff_transfer_ownership() {
        handoff(Fairness::TransferOwnership);
    }

    #[test]
    fn transfer_ownership_constructs_native_eagerly() {
        loom::model(|| {
            let cs = CriticalSection::with_options(options(0, Fairness::TransferOwnership));
            assert!(cs.has_native_wait());
        });
    }

    #[test]
    #[cfg_attr(loom, ignore = "too many threads for loom")]
    fn contended_counter() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 2000;

        let _guard = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        for fairness in [Fairness::Unfair, Fairness::TransferOwnership] {
            let cs = Arc::new(CriticalSection::with_options(options(16, fairness)));
            let counter = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..THREADS)
                .map(|_| {
                    let cs = cs.clone();
                    let counter = counter.clone();
                    thread::spawn(move || {
                        for _ in 0..ITERATIONS {
                            let _guard = cs.lock();
                            // deliberately non-atomic read-modify-write
                            let val = counter.load(Ordering::Relaxed);
                            counter.store(val + 1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();

            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERATIONS);
            assert_quiescent(&cs);
        }
    }

    #[test]
    #[cfg_attr(loom, ignore = "relies on real sleeps")]
    fn blocked_waiter_is_registered() {
        let cs = Arc::new(CriticalSection::new(0));
        cs.enter();

        let t2 = std::thread::spawn({
            let cs = cs.clone();
            move || {
                let _guard = cs.lock();
            }
        });

        while cs.waiter_count() == 0 {
            std::thread::yield_now();
        }
        assert!(cs.has_native_wait());
        assert_eq!(cs.waiter_count(), 1);

        cs.leave();
        t2.join().unwrap();
        assert_quiescent(&cs);
    }

    #[test]
    #[cfg_attr(loom, ignore = "relies on real threads")]
    fn native_construction_failure_is_retried() {
        let cs = Arc::new(CriticalSection::new(0));
        cs.enter();
        crate::native_wait::fail_next_constructions(3);

        let t2 = std::thread::spawn({
            let cs = cs.clone();
            move || {
                let _guard = cs.lock();
            }
        });

        while cs.waiter_count() == 0 {
            std::thread::yield_now();
        }
        assert!(cs.has_native_wait());
        assert_eq!(crate::native_wait::pending_injected_failures(), 0);

        cs.leave();
        t2.join().unwrap();
        assert_quiescent(&cs);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[cfg_attr(loom, ignore = "runs outside of a loom model")]
    #[should_panic = "still in use"]
    fn delete_while_owned_panics_in_debug() {
        let mut cs = CriticalSection::new(0);
        cs.enter();
        cs.delete();
    }

    #[test]
    fn internal_sections_mark_unsafe_region() {
        loom::model(|| {
            let cs = CriticalSection::new_internal(0);
            assert!(!crate::thread::in_unsafe_region());
            {
                let _guard = cs.lock();
                assert!(crate::thread::in_unsafe_region());
                assert!(cs.try_enter());
                cs.leave();
                assert!(crate::thread::in_unsafe_region());
            }
            assert!(!crate::thread::in_unsafe_region());
        });
    }

    #[test]
    fn delete_and_reinit() {
        loom::model(|| {
            let mut cs = CriticalSection::new(0);
            cs.enter();
            cs.leave();
            cs.delete();
            cs.delete();

            cs.init(options(4, Fairness::TransferOwnership));
            assert_eq!(cs.spin_count(), 4);
            assert_eq!(cs.fairness(), Fairness::TransferOwnership);
            cs.enter();
            cs.leave();
        });
    }

    #[test]
    fn enter_after_delete_panics() {
        let mut cs = CriticalSection::new(0);
        cs.delete();
        // Uncontended entry never looks at the native state, force the slow path by holding
        // the lock bit on behalf of a fictional owner.
        cs.word.transition(Ordering::Relaxed, |word| {
            word.set(LockWord::LOCKED, true);
        });
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cs.enter()));
        assert!(res.is_err());
        cs.word.transition(Ordering::Relaxed, |word| {
            word.set(LockWord::LOCKED, false);
        });
    }

    #[cfg(feature = "counters")]
    #[test]
    #[cfg_attr(loom, ignore = "relies on real sleeps")]
    fn counters_track_contention() {
        let cs = Arc::new(CriticalSection::new(0));
        cs.enter();
        cs.enter();
        cs.leave();

        let t2 = std::thread::spawn({
            let cs = cs.clone();
            move || drop(cs.lock())
        });
        while cs.waiter_count() == 0 {
            std::thread::yield_now();
        }
        cs.leave();
        t2.join().unwrap();

        let counters = cs.counters();
        assert_eq!(counters.enters, 3);
        assert_eq!(counters.contentions, 1);
        assert_eq!(counters.blocks, 1);
    }
}
