// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::RefCell;
use core::fmt;
use core::ptr::NonNull;
use std::ffi::{CStr, CString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::dir::{ScopeLock, fatal, file_mode};
use crate::error::SyscallTrace;
use crate::header::{HEADER_SIZE, SharedDataHeader};
use crate::region::{CreationLock, Opened, SharedMemoryRegion};
use crate::{SharedMemoryError, SharedMemoryId, SharedMemoryType, sys};

const SHARED_MEMORY_DIR: &str = "SharedMemory";

/// Where region files live on disk.
///
/// Files are laid out as
/// `<root>/<runtime_temp_dir>[-<uid>]/SharedMemory/{Global,Session<sid>}/<name>`, the uid
/// suffix is only present for user-scoped regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryConfig {
    pub root: PathBuf,
    pub runtime_temp_dir: String,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp"),
            runtime_temp_dir: String::from(".pal"),
        }
    }
}

/// How [`SharedMemoryManager::create_or_open`] treats a region.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    create: bool,
    user_scoped: bool,
    hold_creation_lock: bool,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the region if it doesn't exist yet.
    #[must_use]
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Restrict the region to the current effective user.
    #[must_use]
    pub fn user_scoped(mut self, user_scoped: bool) -> Self {
        self.user_scoped = user_scoped;
        self
    }

    /// Keep the creation locks held when this call creates the region, see [`CreationLock`].
    #[must_use]
    pub fn hold_creation_lock(mut self, hold: bool) -> Self {
        self.hold_creation_lock = hold;
        self
    }
}

/// This process's bookkeeping for one mapped region.
#[derive(Debug)]
pub(crate) struct ProcessData {
    id: SharedMemoryId,
    ty: SharedMemoryType,
    map: MmapMut,
    /// Holds a shared `flock` for as long as the region is mapped.
    fd: OwnedFd,
    ref_count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    regions: Vec<ProcessData>,
    /// Scope directories whose lock is held by a [`CreationLock`] of the thread that owns the
    /// registry lock.
    held_scopes: Vec<CString>,
}

impl Registry {
    fn find_mut(&mut self, id: &SharedMemoryId) -> Option<&mut ProcessData> {
        self.regions.iter_mut().find(|data| data.id == *id)
    }

    fn holds_scope(&self, scope: &CStr) -> bool {
        self.held_scopes.iter().any(|held| held.as_c_str() == scope)
    }
}

pub(crate) type RegistryGuard<'m> = critsect::ReentrantMutexGuard<'m, RefCell<Registry>>;

/// The scope lock kept by a [`CreationLock`] together with the registry lock.
///
/// The scope is listed in the registry while held, so the holding thread can open and release
/// other regions of the same scope without locking it a second time.
pub(crate) struct HeldScope<'m> {
    registry: RegistryGuard<'m>,
    scope: Option<(CString, ScopeLock)>,
}

impl<'m> HeldScope<'m> {
    fn new(registry: RegistryGuard<'m>, path: CString, scope: Option<ScopeLock>) -> Self {
        let scope = scope.map(|lock| {
            registry.borrow_mut().held_scopes.push(path.clone());
            (path, lock)
        });
        Self { registry, scope }
    }
}

impl Drop for HeldScope<'_> {
    fn drop(&mut self) {
        // The scope lock goes first, the registry guard is dropped after this.
        if let Some((path, lock)) = self.scope.take() {
            let mut registry = self.registry.borrow_mut();
            if let Some(pos) = registry.held_scopes.iter().position(|held| *held == path) {
                registry.held_scopes.swap_remove(pos);
            }
            drop(registry);
            drop(lock);
        }
    }
}

impl fmt::Debug for HeldScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldScope")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

struct RegionPaths {
    runtime: CString,
    shared_memory: CString,
    scope: CString,
    file: CString,
}

impl RegionPaths {
    fn dirs(&self) -> [&CStr; 3] {
        [&self.runtime, &self.shared_memory, &self.scope]
    }
}

#[derive(Debug)]
pub(crate) struct Inner {
    config: SharedMemoryConfig,
    euid: libc::uid_t,
    session_id: libc::pid_t,
    /// The in-process creation and deletion lock. Always taken before a scope lock, and
    /// reentrant so a thread holding a [`CreationLock`] can still clone and drop regions.
    registry: critsect::ReentrantMutex<RefCell<Registry>>,
    abrupt_shutdown: AtomicBool,
}

/// The process-wide registry of mapped shared memory regions.
///
/// Regions are identified by name and scope. Opening a region that is already mapped in this
/// process only adds a reference. The manager coordinates with other processes through `flock`
/// on the region files and their scope directories: every process mapping a region holds a
/// shared lock on its file, which lets a later opener detect that all previous users are gone.
#[derive(Debug)]
pub struct SharedMemoryManager {
    inner: Arc<Inner>,
}

static_assertions::assert_impl_all!(SharedMemoryManager: Send, Sync);

impl SharedMemoryManager {
    /// Sets up the manager for this process.
    ///
    /// # Errors
    ///
    /// Returns [`SharedMemoryError::Io`] if the session id of the process can't be determined.
    pub fn static_initialize(config: SharedMemoryConfig) -> Result<Self, SharedMemoryError> {
        let mut trace = SyscallTrace::new();
        let session_id = sys::getsid(&mut trace).map_err(|errno| trace.into_error(errno))?;

        tracing::debug!(root = %config.root.display(), session_id, "initialized shared memory manager");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                euid: sys::geteuid(),
                session_id,
                registry: critsect::ReentrantMutex::new(RefCell::new(Registry::default())),
                abrupt_shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Shuts the manager down.
    ///
    /// Regions still referenced stay mapped until their last reference is dropped. After an
    /// `abrupt` close those final releases leave the files on disk, a later opener will find them
    /// abandoned and reinitialize them.
    pub fn static_close(&self, abrupt: bool) {
        if abrupt {
            self.inner.abrupt_shutdown.store(true, Ordering::Release);
        }

        let open = self.inner.registry.lock().borrow().regions.len();
        if open > 0 {
            tracing::debug!(open, abrupt, "closing shared memory manager with mapped regions");
        }
    }

    /// The path of the file backing `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SharedMemoryError::NameInvalid`] if the configured root contains a NUL byte.
    pub fn file_path(&self, id: &SharedMemoryId) -> Result<PathBuf, SharedMemoryError> {
        let path = self.inner.scope_dir(id).join(id.name());
        c_path(&path)?;
        Ok(path)
    }

    /// The number of distinct regions this process has mapped.
    #[must_use]
    pub fn mapped_regions(&self) -> usize {
        self.inner.registry.lock().borrow().regions.len()
    }

    /// Creates or opens the region `name` holding a payload of at least `payload_size` bytes of
    /// type `ty`.
    ///
    /// Returns `Ok(None)` if the region doesn't exist and `options` don't ask for creation. A
    /// region whose file exists but which no process has mapped anymore is treated as newly
    /// created and starts out zeroed.
    ///
    /// # Errors
    ///
    /// - [`SharedMemoryError::NameEmpty`], [`SharedMemoryError::NameTooLong`] or
    ///   [`SharedMemoryError::NameInvalid`] if `name` is invalid.
    /// - [`SharedMemoryError::HeaderMismatch`] if an existing region was created with a different
    ///   type or is too small.
    /// - [`SharedMemoryError::OutOfMemory`] if the host ran out of memory or disk space.
    /// - [`SharedMemoryError::Io`] for any other system call failure.
    #[tracing::instrument(level = "debug", skip(self), err(level = "debug"))]
    pub fn create_or_open(
        &self,
        name: &str,
        ty: SharedMemoryType,
        payload_size: usize,
        options: OpenOptions,
    ) -> Result<Option<Opened<'_>>, SharedMemoryError> {
        let id = SharedMemoryId::new(name, options.user_scoped)?;
        let required = HEADER_SIZE
            .checked_add(payload_size)
            .and_then(|len| util::checked_align_up(len, util::page_size()))
            .ok_or(SharedMemoryError::OutOfMemory)?;

        let registry = self.inner.registry.lock();

        if let Some(data) = registry.borrow_mut().find_mut(&id) {
            if data.ty != ty || data.map.len() < required {
                return Err(SharedMemoryError::HeaderMismatch);
            }
            data.ref_count += 1;
            tracing::trace!(%id, ref_count = data.ref_count, "region already mapped");

            let region = self.region(id, data);
            return Ok(Some(Opened::Ready {
                region,
                created: false,
            }));
        }

        registry
            .borrow_mut()
            .regions
            .try_reserve(1)
            .map_err(|_| SharedMemoryError::OutOfMemory)?;

        let mut trace = SyscallTrace::new();
        let paths = self.inner.paths(&id)?;
        let scope = self
            .inner
            .lock_scope(&registry.borrow(), &mut trace, &paths, id.is_user_scoped())?;

        let mut cleanup = CreationCleanup {
            path: &paths.file,
            armed: false,
        };

        let (fd, mut created) = match sys::open(
            &mut trace,
            &paths.file,
            libc::O_RDWR | libc::O_CLOEXEC,
            0,
        ) {
            Ok(fd) => (fd, false),
            Err(libc::ENOENT) if !options.create => return Ok(None),
            Err(libc::ENOENT) => {
                let mode = file_mode(id.is_user_scoped());
                let fd = sys::open(
                    &mut trace,
                    &paths.file,
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                    mode,
                )
                .map_err(|errno| fatal(&mut trace, errno))?;
                cleanup.armed = true;

                // the umask may have stripped bits from `mode`
                sys::fchmod(&mut trace, &fd, &paths.file, mode)
                    .map_err(|errno| fatal(&mut trace, errno))?;
                (fd, true)
            }
            Err(errno) => return Err(fatal(&mut trace, errno)),
        };

        if !created
            && sys::flock(
                &mut trace,
                &fd,
                &paths.file,
                libc::LOCK_EX | libc::LOCK_NB,
            )
            .map_err(|errno| fatal(&mut trace, errno))?
        {
            // Every process that mapped the region holds a shared lock, so nobody is using it.
            tracing::warn!(%id, "reinitializing abandoned shared memory region");
            sys::ftruncate(&mut trace, &fd, &paths.file, 0)
                .map_err(|errno| fatal(&mut trace, errno))?;
            cleanup.armed = true;
            created = true;
        }

        if created {
            sys::ftruncate(&mut trace, &fd, &paths.file, required)
                .map_err(|errno| fatal(&mut trace, errno))?;
        } else {
            let st = sys::fstat(&mut trace, &fd, &paths.file)
                .map_err(|errno| fatal(&mut trace, errno))?;
            if !usize::try_from(st.st_size).is_ok_and(|size| size >= required) {
                return Err(SharedMemoryError::HeaderMismatch);
            }
        }

        sys::flock(&mut trace, &fd, &paths.file, libc::LOCK_SH)
            .map_err(|errno| fatal(&mut trace, errno))?;

        // Safety: the file is at least `required` bytes long. Other processes only truncate it
        // while holding the scope lock and after proving nobody has it mapped.
        let mut map = unsafe { MmapOptions::new().len(required).map_mut(&fd) }.map_err(|err| {
            let errno = err.raw_os_error().unwrap_or(0);
            trace.push(
                format_args!(
                    "mmap(NULL, {required}, PROT_READ | PROT_WRITE, MAP_SHARED, \"{}\", 0)",
                    paths.file.to_string_lossy()
                ),
                "MAP_FAILED",
                errno,
            );
            fatal(&mut trace, errno)
        })?;

        let base = NonNull::from(&mut map[..]).cast::<u8>();
        if created {
            // Safety: the mapping is at least one page, which is larger than the header
            unsafe { SharedDataHeader::new(ty).write(base) };
        } else {
            // Safety: see above
            let header = unsafe { SharedDataHeader::read(base) };
            if header.ty() != ty {
                tracing::debug!(%id, expected = ?ty, found = ?header.ty(), "header mismatch");
                return Err(SharedMemoryError::HeaderMismatch);
            }
        }

        cleanup.armed = false;
        drop(cleanup);

        tracing::debug!(%id, created, mapped_len = required, "mapped shared memory region");
        registry.borrow_mut().regions.push(ProcessData {
            id: id.clone(),
            ty,
            map,
            fd,
            ref_count: 1,
        });
        let region = SharedMemoryRegion {
            inner: self.inner.clone(),
            id,
            base,
            mapped_len: required,
        };

        if created && options.hold_creation_lock {
            let held = HeldScope::new(registry, paths.scope.clone(), scope);
            Ok(Some(Opened::Locked(CreationLock::new(held, region))))
        } else {
            Ok(Some(Opened::Ready { region, created }))
        }
    }

    fn region(&self, id: SharedMemoryId, data: &mut ProcessData) -> SharedMemoryRegion {
        SharedMemoryRegion {
            inner: self.inner.clone(),
            id,
            base: NonNull::from(&mut data.map[..]).cast::<u8>(),
            mapped_len: data.map.len(),
        }
    }
}

impl Inner {
    fn runtime_dir(&self, id: &SharedMemoryId) -> PathBuf {
        if id.is_user_scoped() {
            self.config
                .root
                .join(format!("{}-{}", self.config.runtime_temp_dir, self.euid))
        } else {
            self.config.root.join(&self.config.runtime_temp_dir)
        }
    }

    fn scope_dir(&self, id: &SharedMemoryId) -> PathBuf {
        self.runtime_dir(id)
            .join(SHARED_MEMORY_DIR)
            .join(id.scope_dir_name(self.session_id))
    }

    fn paths(&self, id: &SharedMemoryId) -> Result<RegionPaths, SharedMemoryError> {
        let runtime = self.runtime_dir(id);
        let shared_memory = runtime.join(SHARED_MEMORY_DIR);
        let scope = shared_memory.join(id.scope_dir_name(self.session_id));
        let file = scope.join(id.name());

        Ok(RegionPaths {
            runtime: c_path(&runtime)?,
            shared_memory: c_path(&shared_memory)?,
            scope: c_path(&scope)?,
            file: c_path(&file)?,
        })
    }

    /// Takes the lock of the scope directory in `paths`, unless the calling thread already holds
    /// it through a [`CreationLock`].
    fn lock_scope(
        &self,
        registry: &Registry,
        trace: &mut SyscallTrace,
        paths: &RegionPaths,
        user_scoped: bool,
    ) -> Result<Option<ScopeLock>, SharedMemoryError> {
        if registry.holds_scope(&paths.scope) {
            return Ok(None);
        }
        ScopeLock::acquire(trace, &paths.dirs(), user_scoped, self.euid).map(Some)
    }

    pub(crate) fn add_ref(&self, id: &SharedMemoryId) {
        let registry = self.registry.lock();
        let mut registry = registry.borrow_mut();
        let Some(data) = registry.find_mut(id) else {
            unreachable!("region {id} referenced but not mapped");
        };
        data.ref_count += 1;
    }

    pub(crate) fn release(&self, id: &SharedMemoryId) {
        let guard = self.registry.lock();
        let mut registry = guard.borrow_mut();
        let Some(pos) = registry.regions.iter().position(|data| data.id == *id) else {
            debug_assert!(false, "region {id} released but not mapped");
            return;
        };

        let data = &mut registry.regions[pos];
        data.ref_count -= 1;
        if data.ref_count > 0 {
            return;
        }

        let data = registry.regions.swap_remove(pos);
        drop(registry);
        if self.abrupt_shutdown.load(Ordering::Acquire) {
            tracing::debug!(%id, "leaving region on disk after abrupt shutdown");
            return;
        }

        // The registry lock stays held so no thread can reopen the region mid-teardown.
        if let Err(err) = self.teardown(&guard.borrow(), data) {
            tracing::warn!(%id, %err, "failed to clean up shared memory region");
        }
    }

    /// Removes the region's file if this process was its last user anywhere.
    fn teardown(&self, registry: &Registry, data: ProcessData) -> Result<(), SharedMemoryError> {
        let mut trace = SyscallTrace::new();
        let paths = self.paths(&data.id)?;
        let scope = self.lock_scope(registry, &mut trace, &paths, data.id.is_user_scoped())?;

        let ProcessData { id, map, fd, .. } = data;
        let last_user = sys::flock(&mut trace, &fd, &paths.file, libc::LOCK_EX | libc::LOCK_NB)
            .map_err(|errno| fatal(&mut trace, errno))?;
        drop(map);

        if !last_user {
            tracing::trace!(%id, "region still mapped by another process");
            return Ok(());
        }

        let unlinked = sys::unlink(&mut trace, &paths.file);
        drop(fd);
        unlinked.map_err(|errno| fatal(&mut trace, errno))?;

        // Fails if other regions live in the same scope, or a concurrent creator got here first.
        // A scope locked by the calling thread's creation lock still has a region in it.
        if scope.is_some() && sys::rmdir(&mut trace, &paths.scope).is_err() {
            tracing::trace!(%id, %trace, "scope directory not removed");
        }

        tracing::debug!(%id, "removed shared memory region");
        Ok(())
    }
}

/// Removes a region file this process created if creation fails halfway.
///
/// Must be dropped before the scope lock is released.
struct CreationCleanup<'a> {
    path: &'a CStr,
    armed: bool,
}

impl Drop for CreationCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut trace = SyscallTrace::new();
        if sys::unlink(&mut trace, self.path).is_err() {
            tracing::warn!(%trace, "failed to remove partially created shared memory file");
        }
    }
}

fn c_path(path: &Path) -> Result<CString, SharedMemoryError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| SharedMemoryError::NameInvalid)
}
