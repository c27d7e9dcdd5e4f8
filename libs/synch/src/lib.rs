// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-local synchronization objects.
//!
//! The [`ObjectManager`] hands out [`Handle`]s to reference-counted mutexes and semaphores.
//! Both share one generic lifecycle and one signal-count state machine, manipulated through a
//! [`StateController`] while the object's internal lock is held. Threads blocked in
//! [`ObjectManager::wait`] are queued on the object and parked, the thread releasing signal
//! hands it directly to the oldest waiter.
//!
//! Named (cross-process) objects are not supported: every creation call with a non-empty name
//! and every open call fails with [`SynchError::NotSupported`].

mod controller;
mod error;
mod handle;
mod manager;
mod mutex;
mod object;
mod semaphore;
mod wait;

pub mod last_error;

pub use controller::StateController;
pub use error::SynchError;
pub use handle::Handle;
pub use manager::{ObjectInit, ObjectManager};
pub use object::{Object, ObjectKind};
pub use wait::WaitResult;

fn reject_named(name: Option<&str>) -> Result<(), SynchError> {
    match name {
        Some(name) if !name.is_empty() => {
            tracing::debug!(name, "named synchronization objects are not supported");
            Err(SynchError::NotSupported)
        }
        _ => Ok(()),
    }
}
