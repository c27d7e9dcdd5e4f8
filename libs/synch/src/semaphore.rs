// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::handle::Handle;
use crate::manager::{ObjectInit, ObjectManager};
use crate::object::ObjectKind;
use crate::{SynchError, reject_named};

impl ObjectManager {
    /// Creates an anonymous semaphore.
    ///
    /// # Errors
    ///
    /// - [`SynchError::NotSupported`] if `name` is non-empty, regardless of the other
    ///   arguments.
    /// - [`SynchError::InvalidParameter`] unless `maximum_count > 0` and
    ///   `0 <= initial_count <= maximum_count`.
    /// - [`SynchError::OutOfMemory`] if the handle table cannot grow.
    pub fn create_semaphore(
        &self,
        name: Option<&str>,
        initial_count: i32,
        maximum_count: i32,
    ) -> Result<Handle, SynchError> {
        reject_named(name)?;
        self.allocate(ObjectInit::Semaphore {
            initial_count,
            maximum_count,
        })
    }

    /// Opening named semaphores is not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`SynchError::NotSupported`].
    pub fn open_semaphore(&self, name: &str) -> Result<Handle, SynchError> {
        tracing::debug!(name, "refusing to open named semaphore");
        Err(SynchError::NotSupported)
    }

    /// Adds `release_count` to the semaphore's count, waking up to that many waiters, and
    /// returns the previous count.
    ///
    /// # Errors
    ///
    /// - [`SynchError::InvalidHandle`] if `handle` is not an open semaphore handle.
    /// - [`SynchError::InvalidParameter`] if `release_count <= 0`.
    /// - [`SynchError::TooManyPosts`] if the count would exceed the maximum. The count is left
    ///   unchanged.
    pub fn release_semaphore(&self, handle: Handle, release_count: i32) -> Result<i32, SynchError> {
        let object = self.lookup_kind(handle, ObjectKind::Semaphore { maximum_count: 0 })?;
        let mut controller = object.controller();
        controller.increment_signal_count(release_count)
    }
}
