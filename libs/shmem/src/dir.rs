// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::{CStr, CString};
use std::os::fd::OwnedFd;

use libc::mode_t;

use crate::SharedMemoryError;
use crate::error::SyscallTrace;
use crate::sys;

pub(crate) const OWNER_ONLY_DIR_MODE: mode_t = 0o700;
pub(crate) const OWNER_ONLY_FILE_MODE: mode_t = 0o600;
pub(crate) const SHARED_DIR_MODE: mode_t = 0o777;
pub(crate) const SHARED_FILE_MODE: mode_t = 0o666;

const PERMISSION_BITS: mode_t = 0o777;

pub(crate) fn dir_mode(user_scoped: bool) -> mode_t {
    if user_scoped {
        OWNER_ONLY_DIR_MODE
    } else {
        SHARED_DIR_MODE
    }
}

pub(crate) fn file_mode(user_scoped: bool) -> mode_t {
    if user_scoped {
        OWNER_ONLY_FILE_MODE
    } else {
        SHARED_FILE_MODE
    }
}

/// Ends the operation with the trace collected so far.
pub(crate) fn fatal(trace: &mut SyscallTrace, errno: sys::Errno) -> SharedMemoryError {
    core::mem::take(trace).into_error(errno)
}

/// Makes sure `path` is a directory with the permissions required for its scope.
///
/// A missing directory is first created under a temporary name, given its final permissions
/// and then renamed into place, so no other process ever observes it with the permissions
/// `mkdtemp` hands out. Losing the rename race to another creator is fine, the winner's
/// directory is validated instead.
pub(crate) fn ensure_directory(
    trace: &mut SyscallTrace,
    path: &CStr,
    user_scoped: bool,
    euid: libc::uid_t,
) -> Result<(), SharedMemoryError> {
    match sys::lstat(trace, path) {
        Ok(st) => return validate_directory(trace, path, &st, user_scoped, euid),
        Err(libc::ENOENT) => {}
        Err(errno) => return Err(fatal(trace, errno)),
    }

    let mut template = path.to_bytes().to_vec();
    template.extend_from_slice(b".XXXXXX");
    let template = CString::new(template).map_err(|_| SharedMemoryError::NameInvalid)?;

    let temp = sys::mkdtemp(trace, template).map_err(|errno| fatal(trace, errno))?;
    if let Err(errno) = sys::chmod(trace, &temp, dir_mode(user_scoped)) {
        let _ = sys::rmdir(trace, &temp);
        return Err(fatal(trace, errno));
    }

    if sys::rename(trace, &temp, path).is_ok() {
        tracing::debug!(path = %path.to_string_lossy(), "created directory");
        return Ok(());
    }

    let _ = sys::rmdir(trace, &temp);
    let st = sys::lstat(trace, path).map_err(|errno| fatal(trace, errno))?;
    validate_directory(trace, path, &st, user_scoped, euid)
}

fn validate_directory(
    trace: &mut SyscallTrace,
    path: &CStr,
    st: &libc::stat,
    user_scoped: bool,
    euid: libc::uid_t,
) -> Result<(), SharedMemoryError> {
    if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
        trace.push_check(format_args!(
            "check_directory(\"{}\"): not a directory",
            path.to_string_lossy()
        ));
        return Err(SharedMemoryError::Io(core::mem::take(trace)));
    }

    let expected = dir_mode(user_scoped);
    let actual = st.st_mode & PERMISSION_BITS;
    let owned = st.st_uid == euid;

    if user_scoped && !owned {
        trace.push_check(format_args!(
            "check_directory(\"{}\"): owner {} expected {euid}",
            path.to_string_lossy(),
            st.st_uid
        ));
        return Err(SharedMemoryError::Io(core::mem::take(trace)));
    }

    if actual != expected {
        if owned {
            sys::chmod(trace, path, expected).map_err(|errno| fatal(trace, errno))?;
        } else {
            trace.push_check(format_args!(
                "check_directory(\"{}\"): mode 0{actual:o} expected 0{expected:o}",
                path.to_string_lossy()
            ));
            return Err(SharedMemoryError::Io(core::mem::take(trace)));
        }
    }

    Ok(())
}

/// An exclusive `flock` on a scope directory. Serializes creation, deletion and liveness checks
/// of every region in the scope across processes. Released when dropped.
#[derive(Debug)]
pub(crate) struct ScopeLock {
    _fd: OwnedFd,
}

impl ScopeLock {
    /// Creates the directory chain `dirs` as needed and locks the last one.
    pub(crate) fn acquire(
        trace: &mut SyscallTrace,
        dirs: &[&CStr],
        user_scoped: bool,
        euid: libc::uid_t,
    ) -> Result<Self, SharedMemoryError> {
        let Some(scope) = dirs.last() else {
            return Err(SharedMemoryError::NameInvalid);
        };

        loop {
            for dir in dirs {
                ensure_directory(trace, dir, user_scoped, euid)?;
            }

            let fd = match sys::open(
                trace,
                scope,
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                0,
            ) {
                Ok(fd) => fd,
                // removed by a concurrent teardown
                Err(libc::ENOENT) => continue,
                Err(errno) => return Err(fatal(trace, errno)),
            };
            sys::flock(trace, &fd, scope, libc::LOCK_EX).map_err(|errno| fatal(trace, errno))?;

            // A teardown may have removed the directory while we were waiting for the lock, in
            // which case we now hold a lock nobody else will ever look at.
            let held = sys::fstat(trace, &fd, scope).map_err(|errno| fatal(trace, errno))?;
            match sys::lstat(trace, scope) {
                Ok(st) if st.st_dev == held.st_dev && st.st_ino == held.st_ino => {
                    return Ok(Self { _fd: fd });
                }
                Ok(_) | Err(libc::ENOENT) => {
                    tracing::trace!(scope = %scope.to_string_lossy(), "scope directory replaced, retrying");
                }
                Err(errno) => return Err(fatal(trace, errno)),
            }
        }
    }
}
