// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use critsect::ThreadId;

use crate::SynchError;
use crate::handle::{Handle, HandleTable};
use crate::object::{Object, ObjectKind, OwnershipRegistry};
use crate::wait::{WaitNode, WaitResult};

/// Construction parameters of a synchronization object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectInit {
    Mutex {
        /// If set, the creating thread owns the new mutex.
        initial_owner: bool,
    },
    Semaphore {
        initial_count: i32,
        maximum_count: i32,
    },
}

/// The process-wide registry of synchronization objects.
///
/// Objects are addressed through [`Handle`]s. The manager owns one reference per open handle,
/// waiters and owners keep the objects they use alive on their own.
#[derive(Debug)]
pub struct ObjectManager {
    handles: critsect::Mutex<HandleTable>,
    registry: Arc<OwnershipRegistry>,
}

static_assertions::assert_impl_all!(ObjectManager: Send, Sync);

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: critsect::Mutex::new(HandleTable::new()),
            registry: Arc::new(OwnershipRegistry::new()),
        }
    }

    /// Creates a new object and returns a handle to it.
    ///
    /// # Errors
    ///
    /// - [`SynchError::InvalidParameter`] if a semaphore's counts are out of range
    ///   (`maximum_count > 0` and `0 <= initial_count <= maximum_count` must hold).
    /// - [`SynchError::OutOfMemory`] if the handle table cannot grow.
    #[tracing::instrument(level = "debug", skip(self), err(level = "debug"))]
    pub fn allocate(&self, init: ObjectInit) -> Result<Handle, SynchError> {
        let kind = match init {
            ObjectInit::Mutex { .. } => ObjectKind::Mutex,
            ObjectInit::Semaphore {
                initial_count,
                maximum_count,
            } => {
                if maximum_count <= 0 || !(0..=maximum_count).contains(&initial_count) {
                    return Err(SynchError::InvalidParameter);
                }
                ObjectKind::Semaphore { maximum_count }
            }
        };

        let object = Object::new(kind, self.registry.clone());
        {
            let mut controller = object.controller();
            match init {
                ObjectInit::Mutex {
                    initial_owner: true,
                } => controller.set_owner(ThreadId::current())?,
                ObjectInit::Mutex {
                    initial_owner: false,
                } => {}
                ObjectInit::Semaphore { initial_count, .. } => {
                    controller.set_signal_count(initial_count)?;
                }
            }
        }

        let res = self.handles.lock().insert(object.clone());
        if res.is_err() {
            // Undo the initial ownership recorded above, nobody else can have seen the object.
            let mut controller = object.controller();
            if let Some(owner) = controller.owner() {
                let _ = controller.decrement_ownership_count(owner);
            }
        }
        res
    }

    /// Returns a new reference to the object behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidHandle`] if `handle` is not open.
    pub fn lookup(&self, handle: Handle) -> Result<Arc<Object>, SynchError> {
        self.handles.lock().get(handle)
    }

    /// Like [`Self::lookup`] but also checks the object's type.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidHandle`] if `handle` is not open or refers to an object
    /// of a different type than `expected`.
    pub fn lookup_kind(
        &self,
        handle: Handle,
        expected: ObjectKind,
    ) -> Result<Arc<Object>, SynchError> {
        let object = self.lookup(handle)?;
        if object.kind().same_type(expected) {
            Ok(object)
        } else {
            Err(SynchError::InvalidHandle)
        }
    }

    /// Closes `handle`, releasing the manager's reference to its object.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidHandle`] if `handle` is not open.
    pub fn close_handle(&self, handle: Handle) -> Result<(), SynchError> {
        let object = self.handles.lock().remove(handle)?;
        tracing::trace!(%handle, kind = object.kind().name(), "closed handle");
        drop(object);
        Ok(())
    }

    /// Returns the current signal count of the object behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidHandle`] if `handle` is not open.
    pub fn signal_count(&self, handle: Handle) -> Result<i32, SynchError> {
        Ok(self.lookup(handle)?.controller().signal_count())
    }

    /// Blocks the calling thread until the object behind `handle` is signaled.
    ///
    /// Waiting on a mutex the caller already owns recurses without blocking. There is no
    /// timeout and no way to cancel the wait.
    ///
    /// # Errors
    ///
    /// - [`SynchError::InvalidHandle`] if `handle` is not open.
    /// - [`SynchError::OutOfMemory`] if the wait could not be queued.
    pub fn wait(&self, handle: Handle) -> Result<WaitResult, SynchError> {
        let object = self.lookup(handle)?;
        let me = ThreadId::current();

        let node = {
            let mut controller = object.controller();
            if let Some(result) = controller.try_acquire(me)? {
                return Ok(result);
            }

            let node = Arc::new(WaitNode::for_current());
            controller.enqueue(node.clone())?;
            node
        };

        tracing::trace!(%handle, kind = object.kind().name(), "blocking on object");
        // `object` stays alive across the wait even if the handle is closed meanwhile
        let result = node.wait();
        drop(object);
        Ok(result)
    }

    /// Acquires the object behind `handle` if that is possible without blocking.
    ///
    /// # Errors
    ///
    /// - [`SynchError::InvalidHandle`] if `handle` is not open.
    /// - [`SynchError::OutOfMemory`] if a mutex's recursion count would overflow.
    pub fn try_wait(&self, handle: Handle) -> Result<Option<WaitResult>, SynchError> {
        let object = self.lookup(handle)?;
        let mut controller = object.controller();
        controller.try_acquire(ThreadId::current())
    }

    /// Abandons every mutex still owned by `tid`. Must be called once a thread has exited.
    ///
    /// Returns the number of mutexes that were abandoned.
    pub fn thread_exited(&self, tid: ThreadId) -> usize {
        let owned = self.registry.take(tid);

        let mut abandoned = 0;
        for object in owned.iter().filter_map(std::sync::Weak::upgrade) {
            if object.controller().abandon(tid) {
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            tracing::warn!(%tid, abandoned, "thread exited while owning mutexes");
        }
        abandoned
    }

    /// Returns the number of open handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.lock().open_handles()
    }

    /// Returns the number of mutexes currently owned by `tid`.
    #[must_use]
    pub fn owned_by(&self, tid: ThreadId) -> usize {
        self.registry.owned_by(tid)
    }

    /// Closes every open handle. Objects kept alive by owners or waiters survive until those
    /// let go.
    pub fn close_all(&self) {
        let objects = self.handles.lock().drain();
        tracing::debug!(closed = objects.len(), "closing all handles");
        drop(objects);
    }
}
