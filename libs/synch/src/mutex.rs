// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use critsect::ThreadId;

use crate::handle::Handle;
use crate::manager::{ObjectInit, ObjectManager};
use crate::object::ObjectKind;
use crate::{SynchError, reject_named};

impl ObjectManager {
    /// Creates an anonymous mutex, optionally owned by the calling thread.
    ///
    /// # Errors
    ///
    /// - [`SynchError::NotSupported`] if `name` is non-empty, regardless of the other
    ///   arguments.
    /// - [`SynchError::OutOfMemory`] if the handle table cannot grow.
    pub fn create_mutex(
        &self,
        name: Option<&str>,
        initial_owner: bool,
    ) -> Result<Handle, SynchError> {
        reject_named(name)?;
        self.allocate(ObjectInit::Mutex { initial_owner })
    }

    /// Opening named mutexes is not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`SynchError::NotSupported`].
    pub fn open_mutex(&self, name: &str) -> Result<Handle, SynchError> {
        tracing::debug!(name, "refusing to open named mutex");
        Err(SynchError::NotSupported)
    }

    /// Releases one level of the calling thread's ownership of the mutex behind `handle`.
    ///
    /// # Errors
    ///
    /// - [`SynchError::InvalidHandle`] if `handle` is not an open mutex handle.
    /// - [`SynchError::NotOwner`] if the calling thread does not own the mutex.
    pub fn release_mutex(&self, handle: Handle) -> Result<(), SynchError> {
        let object = self.lookup_kind(handle, ObjectKind::Mutex)?;
        let mut controller = object.controller();
        controller.decrement_ownership_count(ThreadId::current())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::WaitResult;

    #[test]
    fn named_mutexes_are_not_supported() {
        let manager = ObjectManager::new();
        assert_eq!(
            manager.create_mutex(Some("Foo"), false),
            Err(SynchError::NotSupported)
        );
        assert_eq!(
            manager.create_mutex(Some("Foo"), true),
            Err(SynchError::NotSupported)
        );
        assert_eq!(manager.open_mutex("Foo"), Err(SynchError::NotSupported));
        assert_eq!(manager.open_handles(), 0);

        // an empty name is the same as no name
        assert!(manager.create_mutex(Some(""), false).is_ok());
    }

    #[test]
    fn recursive_ownership() {
        let manager = ObjectManager::new();
        let mutex = manager.create_mutex(None, true).unwrap();
        let me = ThreadId::current();
        assert_eq!(manager.owned_by(me), 1);

        assert_eq!(manager.wait(mutex), Ok(WaitResult::Signaled));
        assert_eq!(manager.try_wait(mutex), Ok(Some(WaitResult::Signaled)));

        let object = manager.lookup(mutex).unwrap();
        assert_eq!(object.controller().ownership_count(), 3);
        assert_eq!(object.controller().signal_count(), 0);

        for _ in 0..3 {
            manager.release_mutex(mutex).unwrap();
        }
        assert_eq!(object.controller().owner(), None);
        assert_eq!(object.controller().signal_count(), 1);
        assert_eq!(manager.owned_by(me), 0);

        assert_eq!(manager.release_mutex(mutex), Err(SynchError::NotOwner));
    }

    #[test]
    fn release_by_non_owner_fails() {
        let manager = Arc::new(ObjectManager::new());
        let mutex = manager.create_mutex(None, true).unwrap();
        manager.wait(mutex).unwrap();

        let res = thread::spawn({
            let manager = manager.clone();
            move || manager.release_mutex(mutex)
        })
        .join()
        .unwrap();
        assert_eq!(res, Err(SynchError::NotOwner));

        let object = manager.lookup(mutex).unwrap();
        assert_eq!(object.controller().ownership_count(), 2);
        assert_eq!(object.controller().owner(), Some(ThreadId::current()));
    }

    #[test]
    fn wrong_handle_type() {
        let manager = ObjectManager::new();
        let sem = manager.create_semaphore(None, 1, 1).unwrap();
        assert_eq!(manager.release_mutex(sem), Err(SynchError::InvalidHandle));
    }

    #[test]
    fn ownership_passes_to_waiter() {
        let manager = Arc::new(ObjectManager::new());
        let mutex = manager.create_mutex(None, true).unwrap();
        let object = manager.lookup(mutex).unwrap();

        let (tx, rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let waiter = thread::spawn({
            let manager = manager.clone();
            move || {
                let res = manager.wait(mutex);
                tx.send(ThreadId::current()).unwrap();
                // hold on to ownership until the main thread had a look
                go_rx.recv().unwrap();
                manager.release_mutex(mutex).unwrap();
                res
            }
        });

        while object.controller().waiter_count() == 0 {
            thread::yield_now();
        }
        manager.release_mutex(mutex).unwrap();

        let waiter_tid = rx.recv().unwrap();
        assert_eq!(object.controller().owner(), Some(waiter_tid));
        assert_eq!(manager.owned_by(waiter_tid), 1);
        assert_eq!(manager.owned_by(ThreadId::current()), 0);

        go_tx.send(()).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(WaitResult::Signaled));
        assert_eq!(object.controller().owner(), None);
    }

    #[test]
    fn abandoned_mutex() {
        let manager = Arc::new(ObjectManager::new());
        let mutex = manager.create_mutex(None, false).unwrap();

        let tid = thread::spawn({
            let manager = manager.clone();
            move || {
                manager.wait(mutex).unwrap();
                manager.wait(mutex).unwrap();
                ThreadId::current()
            }
        })
        .join()
        .unwrap();

        assert_eq!(manager.owned_by(tid), 1);
        assert_eq!(manager.thread_exited(tid), 1);
        assert_eq!(manager.owned_by(tid), 0);
        assert_eq!(manager.thread_exited(tid), 0);

        assert_eq!(manager.wait(mutex), Ok(WaitResult::Abandoned));
        manager.release_mutex(mutex).unwrap();
        // the abandoned state is consumed by the first acquirer
        assert_eq!(manager.wait(mutex), Ok(WaitResult::Signaled));
        manager.release_mutex(mutex).unwrap();
    }

    #[test]
    fn abandoned_mutex_wakes_waiter() {
        let manager = Arc::new(ObjectManager::new());
        let mutex = manager.create_mutex(None, false).unwrap();
        let object = manager.lookup(mutex).unwrap();

        let (owned_tx, owned_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let owner = thread::spawn({
            let manager = manager.clone();
            move || {
                manager.wait(mutex).unwrap();
                owned_tx.send(()).unwrap();
                exit_rx.recv().unwrap();
                ThreadId::current()
            }
        });
        owned_rx.recv().unwrap();

        let waiter = thread::spawn({
            let manager = manager.clone();
            move || {
                let res = manager.wait(mutex);
                manager.release_mutex(mutex).unwrap();
                res
            }
        });
        while object.controller().waiter_count() == 0 {
            thread::yield_now();
        }

        exit_tx.send(()).unwrap();
        let owner_tid = owner.join().unwrap();
        assert_eq!(manager.thread_exited(owner_tid), 1);

        assert_eq!(waiter.join().unwrap(), Ok(WaitResult::Abandoned));
    }
}
