// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use critsect::ThreadId;

use crate::SynchError;
use crate::object::{Object, ObjectKind, SynchData};
use crate::wait::{WaitNode, WaitResult};

/// Exclusive access to the signal state of one synchronization object.
///
/// Every operation runs while the object's internal lock is held; the lock is released when the
/// controller is dropped. Operations that make the object signaled hand the signal to queued
/// waiters, oldest first, before returning.
pub struct StateController<'a> {
    object: &'a Arc<Object>,
    data: critsect::MutexGuard<'a, SynchData>,
}

impl<'a> StateController<'a> {
    pub(crate) fn new(object: &'a Arc<Object>, data: critsect::MutexGuard<'a, SynchData>) -> Self {
        Self { object, data }
    }

    #[must_use]
    pub fn signal_count(&self) -> i32 {
        self.data.signal_count
    }

    /// The recursion count of the mutex owner, `0` for unowned mutexes and semaphores.
    #[must_use]
    pub fn ownership_count(&self) -> u32 {
        self.data.ownership_count
    }

    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.data.owner
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.data.waiters.len()
    }

    /// Overwrites the signal count.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidParameter`] if `count` is negative, exceeds a semaphore's
    /// maximum count, or contradicts a mutex's ownership state (a mutex is signaled exactly
    /// when it is unowned).
    pub fn set_signal_count(&mut self, count: i32) -> Result<(), SynchError> {
        let valid = match self.object.kind() {
            ObjectKind::Semaphore { maximum_count } => (0..=maximum_count).contains(&count),
            ObjectKind::Mutex => count == i32::from(self.data.owner.is_none()),
        };
        if !valid {
            return Err(SynchError::InvalidParameter);
        }

        self.data.signal_count = count;
        self.wake_waiters();
        Ok(())
    }

    /// Adds `count` to a semaphore's signal count and returns the previous count.
    ///
    /// # Errors
    ///
    /// - [`SynchError::InvalidParameter`] if `count` is not positive or the object is a mutex.
    /// - [`SynchError::TooManyPosts`] if the new count would exceed the maximum count. The
    ///   signal count is left unchanged.
    pub fn increment_signal_count(&mut self, count: i32) -> Result<i32, SynchError> {
        let ObjectKind::Semaphore { maximum_count } = self.object.kind() else {
            return Err(SynchError::InvalidParameter);
        };
        if count <= 0 {
            return Err(SynchError::InvalidParameter);
        }

        let previous = self.data.signal_count;
        // `previous` never exceeds `maximum_count`, so this can't underflow
        if count > maximum_count - previous {
            return Err(SynchError::TooManyPosts);
        }

        self.data.signal_count = previous + count;
        self.wake_waiters();
        Ok(previous)
    }

    /// Makes `tid` the owner of an unowned mutex.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidParameter`] if the object is not a mutex or is already
    /// owned.
    pub fn set_owner(&mut self, tid: ThreadId) -> Result<(), SynchError> {
        if self.object.kind() != ObjectKind::Mutex || self.data.ownership_count != 0 {
            return Err(SynchError::InvalidParameter);
        }

        self.grant_ownership(tid);
        Ok(())
    }

    /// Drops one level of `tid`'s ownership of a mutex. When the count reaches zero the mutex
    /// becomes signaled and the oldest waiter, if any, takes ownership.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::NotOwner`] if `tid` does not own the mutex, leaving the ownership
    /// count untouched.
    pub fn decrement_ownership_count(&mut self, tid: ThreadId) -> Result<(), SynchError> {
        if self.data.ownership_count < 1 || self.data.owner != Some(tid) {
            return Err(SynchError::NotOwner);
        }

        self.data.ownership_count -= 1;
        if self.data.ownership_count == 0 {
            self.data.owner = None;
            self.object.registry().remove(tid, self.object);
            self.data.signal_count = 1;
            self.wake_waiters();
        }
        Ok(())
    }

    /// Releases a mutex on behalf of `tid`, which exited while owning it. The next acquirer
    /// observes [`WaitResult::Abandoned`].
    ///
    /// Returns `false` if `tid` no longer owns the object.
    pub(crate) fn abandon(&mut self, tid: ThreadId) -> bool {
        if self.data.owner != Some(tid) {
            return false;
        }

        self.data.ownership_count = 0;
        self.data.owner = None;
        self.data.abandoned = true;
        self.data.signal_count = 1;
        self.wake_waiters();
        true
    }

    /// Consumes one unit of signal for `tid` if the object is signaled, or recurses if `tid`
    /// already owns the mutex.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::OutOfMemory`] if a mutex's recursion count would overflow.
    pub(crate) fn try_acquire(&mut self, tid: ThreadId) -> Result<Option<WaitResult>, SynchError> {
        match self.object.kind() {
            ObjectKind::Mutex if self.data.owner == Some(tid) => {
                self.data.ownership_count = self
                    .data
                    .ownership_count
                    .checked_add(1)
                    .ok_or(SynchError::OutOfMemory)?;
                Ok(Some(WaitResult::Signaled))
            }
            ObjectKind::Mutex if self.data.signal_count > 0 => Ok(Some(self.grant_ownership(tid))),
            ObjectKind::Semaphore { .. } if self.data.signal_count > 0 => {
                self.data.signal_count -= 1;
                Ok(Some(WaitResult::Signaled))
            }
            _ => Ok(None),
        }
    }

    /// Queues `node` to be signaled once the object can satisfy it.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::OutOfMemory`] if the wait queue cannot grow.
    pub(crate) fn enqueue(&mut self, node: Arc<WaitNode>) -> Result<(), SynchError> {
        debug_assert!(self.data.signal_count == 0 || !self.data.waiters.is_empty());
        self.data.waiters.try_reserve(1)?;
        self.data.waiters.push_back(node);
        Ok(())
    }

    fn grant_ownership(&mut self, tid: ThreadId) -> WaitResult {
        debug_assert_eq!(self.object.kind(), ObjectKind::Mutex);
        debug_assert!(self.data.owner.is_none());

        self.data.signal_count = 0;
        self.data.owner = Some(tid);
        self.data.ownership_count = 1;
        self.object.registry().add(tid, self.object);

        if core::mem::take(&mut self.data.abandoned) {
            WaitResult::Abandoned
        } else {
            WaitResult::Signaled
        }
    }

    /// Hands available signal to queued waiters in FIFO order.
    fn wake_waiters(&mut self) {
        while self.data.signal_count > 0 {
            let Some(node) = self.data.waiters.pop_front() else {
                break;
            };

            let result = match self.object.kind() {
                ObjectKind::Mutex => self.grant_ownership(node.tid()),
                ObjectKind::Semaphore { .. } => {
                    self.data.signal_count -= 1;
                    WaitResult::Signaled
                }
            };

            tracing::trace!(
                kind = self.object.kind().name(),
                tid = %node.tid(),
                ?result,
                "handing signal to waiter"
            );
            node.signal(result);
        }
    }
}

impl core::fmt::Debug for StateController<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateController")
            .field("kind", &self.object.kind())
            .field("data", &*self.data)
            .finish()
    }
}
