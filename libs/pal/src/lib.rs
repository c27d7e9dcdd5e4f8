// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The synchronization surface of the platform abstraction layer.
//!
//! [`Pal`] owns the process-wide services (the synchronization object manager and the shared
//! memory manager) between [`Pal::initialize`] and [`Pal::shutdown`], and exposes entry points
//! shaped like the emulated platform's API: failures return a sentinel and leave a code in the
//! calling thread's last-error slot.

pub mod config;
pub mod logging;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use critsect::{CriticalSection, CriticalSectionOptions, CsKind, Fairness, ThreadId};
use shmem::SharedMemoryManager;
use synch::{Handle, ObjectManager, SynchError, WaitResult, last_error};

pub use config::PalConfig;

/// Wait forever.
pub const INFINITE: u32 = u32::MAX;
pub const WAIT_OBJECT_0: u32 = 0;
pub const WAIT_ABANDONED: u32 = 0x80;
pub const WAIT_TIMEOUT: u32 = 0x102;
pub const WAIT_FAILED: u32 = u32::MAX;

#[derive(Debug)]
pub struct Pal {
    config: PalConfig,
    objects: ObjectManager,
    shared_memory: SharedMemoryManager,
    closed: AtomicBool,
}

impl Pal {
    /// Brings up logging and the process-wide services.
    ///
    /// # Errors
    ///
    /// Returns an error if the log configuration is invalid or the shared memory manager can't
    /// be initialized.
    pub fn initialize(config: PalConfig) -> anyhow::Result<Self> {
        let installed = logging::init(&config.log)?;
        let shared_memory =
            SharedMemoryManager::static_initialize((&config.shared_memory).into())
                .context("failed to initialize shared memory manager")?;

        tracing::debug!(logging_installed = installed, ?config, "initialized PAL");
        Ok(Self {
            config,
            objects: ObjectManager::new(),
            shared_memory,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PalConfig {
        &self.config
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    #[must_use]
    pub fn shared_memory(&self) -> &SharedMemoryManager {
        &self.shared_memory
    }

    /// The options new user critical sections are created with.
    #[must_use]
    pub fn critical_section_options(&self) -> CriticalSectionOptions {
        let config = &self.config.critical_section;
        CriticalSectionOptions {
            spin_count: config.spin_count,
            fairness: if config.fair {
                Fairness::TransferOwnership
            } else {
                Fairness::Unfair
            },
            kind: CsKind::User,
        }
    }

    #[must_use]
    pub fn new_critical_section(&self) -> CriticalSection {
        CriticalSection::with_options(self.critical_section_options())
    }

    /// Creates an anonymous mutex. Returns `None` and records the error on failure.
    pub fn create_mutex(&self, name: Option<&str>, initial_owner: bool) -> Option<Handle> {
        last_error::record(self.objects.create_mutex(name, initial_owner)).ok()
    }

    /// Always fails with `ERROR_NOT_SUPPORTED`.
    pub fn open_mutex(&self, name: &str) -> Option<Handle> {
        last_error::record(self.objects.open_mutex(name)).ok()
    }

    pub fn release_mutex(&self, handle: Handle) -> bool {
        last_error::record(self.objects.release_mutex(handle)).is_ok()
    }

    /// Creates an anonymous semaphore. Returns `None` and records the error on failure.
    pub fn create_semaphore(
        &self,
        name: Option<&str>,
        initial_count: i32,
        maximum_count: i32,
    ) -> Option<Handle> {
        last_error::record(
            self.objects
                .create_semaphore(name, initial_count, maximum_count),
        )
        .ok()
    }

    /// Always fails with `ERROR_NOT_SUPPORTED`.
    pub fn open_semaphore(&self, name: &str) -> Option<Handle> {
        last_error::record(self.objects.open_semaphore(name)).ok()
    }

    /// Adds `release_count` to the semaphore, returning the previous count.
    pub fn release_semaphore(&self, handle: Handle, release_count: i32) -> Option<i32> {
        last_error::record(self.objects.release_semaphore(handle, release_count)).ok()
    }

    pub fn close_handle(&self, handle: Handle) -> bool {
        last_error::record(self.objects.close_handle(handle)).is_ok()
    }

    /// Waits until the object behind `handle` is signaled.
    ///
    /// Only a zero timeout (probe) and [`INFINITE`] are supported; any other value fails with
    /// `ERROR_INVALID_PARAMETER`.
    pub fn wait_for_single_object(&self, handle: Handle, timeout_ms: u32) -> u32 {
        let res = match timeout_ms {
            0 => self.objects.try_wait(handle),
            INFINITE => self.objects.wait(handle).map(Some),
            _ => Err(SynchError::InvalidParameter),
        };

        match last_error::record(res) {
            Ok(Some(WaitResult::Signaled)) => WAIT_OBJECT_0,
            Ok(Some(WaitResult::Abandoned)) => WAIT_ABANDONED,
            Ok(None) => WAIT_TIMEOUT,
            Err(_) => WAIT_FAILED,
        }
    }

    /// Abandons every mutex still owned by the exited thread `tid`.
    pub fn thread_exited(&self, tid: ThreadId) {
        self.objects.thread_exited(tid);
    }

    /// Tears the process-wide services down.
    ///
    /// Closes all handles and shuts the shared memory manager down. After an `abrupt` shutdown
    /// shared memory files of still referenced regions are left on disk.
    pub fn shutdown(&self, abrupt: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(abrupt, open_handles = self.objects.open_handles(), "shutting down PAL");
        if !abrupt {
            self.objects.close_all();
        }
        self.shared_memory.static_close(abrupt);
    }
}

impl Drop for Pal {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

/// The calling thread's last-error code.
#[must_use]
pub fn get_last_error() -> u32 {
    last_error::get()
}

pub fn set_last_error(code: u32) {
    last_error::set(code);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn pal() -> (Pal, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = PalConfig {
            shared_memory: config::SharedMemoryConfig {
                root: root.path().to_path_buf(),
                ..config::SharedMemoryConfig::default()
            },
            ..PalConfig::default()
        };
        (Pal::initialize(config).unwrap(), root)
    }

    #[test]
    fn semaphore_entry_points() {
        let (pal, _root) = pal();
        set_last_error(0);

        let sem = pal.create_semaphore(None, 0, 2).unwrap();
        assert_eq!(pal.wait_for_single_object(sem, 0), WAIT_TIMEOUT);
        assert_eq!(pal.release_semaphore(sem, 2), Some(0));
        assert_eq!(pal.release_semaphore(sem, 1), None);
        assert_eq!(get_last_error(), SynchError::TooManyPosts.code());

        assert_eq!(pal.wait_for_single_object(sem, INFINITE), WAIT_OBJECT_0);
        assert_eq!(pal.wait_for_single_object(sem, 0), WAIT_OBJECT_0);
        assert_eq!(pal.wait_for_single_object(sem, 0), WAIT_TIMEOUT);

        assert_eq!(pal.wait_for_single_object(sem, 10), WAIT_FAILED);
        assert_eq!(get_last_error(), SynchError::InvalidParameter.code());

        assert!(pal.close_handle(sem));
        assert!(!pal.close_handle(sem));
        assert_eq!(get_last_error(), SynchError::InvalidHandle.code());
    }

    #[test]
    fn named_objects_are_not_supported() {
        let (pal, _root) = pal();

        assert_eq!(pal.create_mutex(Some("Global\\m"), false), None);
        assert_eq!(get_last_error(), SynchError::NotSupported.code());
        assert_eq!(pal.create_semaphore(Some("s"), 0, 1), None);
        assert_eq!(get_last_error(), SynchError::NotSupported.code());
        assert_eq!(pal.open_mutex("m"), None);
        assert_eq!(pal.open_semaphore("s"), None);
        assert_eq!(pal.objects().open_handles(), 0);

        // an empty name is the same as no name
        assert!(pal.create_mutex(Some(""), false).is_some());
    }

    #[test]
    fn abandoned_mutex_through_entry_points() {
        let (pal, _root) = pal();
        let pal = Arc::new(pal);
        let mutex = pal.create_mutex(None, false).unwrap();

        let tid = thread::spawn({
            let pal = pal.clone();
            move || {
                assert_eq!(pal.wait_for_single_object(mutex, INFINITE), WAIT_OBJECT_0);
                ThreadId::current()
            }
        })
        .join()
        .unwrap();

        pal.thread_exited(tid);
        assert_eq!(pal.wait_for_single_object(mutex, INFINITE), WAIT_ABANDONED);
        assert!(pal.release_mutex(mutex));
        assert!(!pal.release_mutex(mutex));
        assert_eq!(get_last_error(), SynchError::NotOwner.code());
    }

    #[test]
    fn critical_sections_follow_config() {
        let root = tempfile::tempdir().unwrap();
        let config = PalConfig::from_toml_str(&format!(
            "[critical-section]\nspin-count = 12\nfair = true\n\n[shared-memory]\nroot = {:?}\n",
            root.path()
        ))
        .unwrap();
        let pal = Pal::initialize(config).unwrap();

        let cs = pal.new_critical_section();
        assert_eq!(cs.spin_count(), 12);
        assert_eq!(cs.fairness(), Fairness::TransferOwnership);
        assert_eq!(cs.kind(), CsKind::User);

        let _guard = cs.lock();
        assert!(cs.is_owned_by_current_thread());
    }

    #[test]
    fn shutdown_closes_handles() {
        let (pal, _root) = pal();
        let sem = pal.create_semaphore(None, 1, 1).unwrap();

        pal.shutdown(false);
        assert_eq!(pal.objects().open_handles(), 0);
        assert_eq!(pal.wait_for_single_object(sem, 0), WAIT_FAILED);
        // idempotent
        pal.shutdown(true);
    }

    #[test]
    fn shared_memory_under_configured_root() {
        let (pal, root) = pal();
        let region = pal
            .shared_memory()
            .create_or_open(
                "pal-region",
                shmem::SharedMemoryType::new(1, 0),
                16,
                shmem::OpenOptions::new().create(true),
            )
            .unwrap()
            .unwrap()
            .into_region();

        let path = pal.shared_memory().file_path(region.id()).unwrap();
        assert!(path.starts_with(root.path().join(".pal")));
        drop(region);
        assert!(!path.exists());
    }
}
