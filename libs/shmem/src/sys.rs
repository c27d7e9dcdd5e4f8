// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin wrappers around the system calls used by the shared memory manager.
//!
//! Every wrapper records a failure into the caller's [`SyscallTrace`] and hands back the raw
//! errno, so the caller decides whether the failure is fatal.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use libc::{c_int, mode_t};

use crate::error::SyscallTrace;

pub(crate) type Errno = c_int;

fn last_errno() -> Errno {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn display(path: &CStr) -> std::borrow::Cow<'_, str> {
    path.to_string_lossy()
}

pub(crate) fn open_flags(flags: c_int) -> String {
    let mut out = String::from(match flags & libc::O_ACCMODE {
        libc::O_RDONLY => "O_RDONLY",
        libc::O_WRONLY => "O_WRONLY",
        _ => "O_RDWR",
    });
    for (flag, name) in [
        (libc::O_CREAT, "O_CREAT"),
        (libc::O_EXCL, "O_EXCL"),
        (libc::O_DIRECTORY, "O_DIRECTORY"),
        (libc::O_NOFOLLOW, "O_NOFOLLOW"),
        (libc::O_CLOEXEC, "O_CLOEXEC"),
    ] {
        if flags & flag != 0 {
            out.push_str(" | ");
            out.push_str(name);
        }
    }
    out
}

fn flock_op(op: c_int) -> &'static str {
    match op {
        libc::LOCK_SH => "LOCK_SH",
        libc::LOCK_EX => "LOCK_EX",
        libc::LOCK_UN => "LOCK_UN",
        op if op == libc::LOCK_SH | libc::LOCK_NB => "LOCK_SH | LOCK_NB",
        op if op == libc::LOCK_EX | libc::LOCK_NB => "LOCK_EX | LOCK_NB",
        _ => "?",
    }
}

pub(crate) fn open(
    trace: &mut SyscallTrace,
    path: &CStr,
    flags: c_int,
    mode: mode_t,
) -> Result<OwnedFd, Errno> {
    #[allow(
        clippy::useless_conversion,
        reason = "mode_t is narrower than the variadic c_uint on some platforms"
    )]
    let mode_arg = libc::c_uint::from(mode);

    loop {
        // Safety: `path` is a valid NUL terminated string
        let fd = unsafe { libc::open(path.as_ptr(), flags, mode_arg) };
        if fd >= 0 {
            // Safety: `open` returned a fresh descriptor that nothing else owns
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }

        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if flags & libc::O_CREAT != 0 {
            trace.push(
                format_args!("open(\"{}\", {}, 0{mode:o})", display(path), open_flags(flags)),
                "-1",
                errno,
            );
        } else {
            trace.push(
                format_args!("open(\"{}\", {})", display(path), open_flags(flags)),
                "-1",
                errno,
            );
        }
        return Err(errno);
    }
}

/// Applies `op` to the descriptor's file lock, blocking unless `op` contains `LOCK_NB`.
///
/// A non-blocking request that fails with `EWOULDBLOCK` returns `Ok(false)` and is not traced.
pub(crate) fn flock(
    trace: &mut SyscallTrace,
    fd: &OwnedFd,
    path: &CStr,
    op: c_int,
) -> Result<bool, Errno> {
    loop {
        // Safety: `fd` is an open descriptor
        if unsafe { libc::flock(fd.as_raw_fd(), op) } == 0 {
            return Ok(true);
        }

        let errno = last_errno();
        match errno {
            libc::EINTR => {}
            libc::EWOULDBLOCK if op & libc::LOCK_NB != 0 => return Ok(false),
            _ => {
                trace.push(
                    format_args!("flock(\"{}\", {})", display(path), flock_op(op)),
                    "-1",
                    errno,
                );
                return Err(errno);
            }
        }
    }
}

pub(crate) fn fchmod(
    trace: &mut SyscallTrace,
    fd: &OwnedFd,
    path: &CStr,
    mode: mode_t,
) -> Result<(), Errno> {
    // Safety: `fd` is an open descriptor
    if unsafe { libc::fchmod(fd.as_raw_fd(), mode) } == 0 {
        return Ok(());
    }
    let errno = last_errno();
    trace.push(
        format_args!("fchmod(\"{}\", 0{mode:o})", display(path)),
        "-1",
        errno,
    );
    Err(errno)
}

pub(crate) fn ftruncate(
    trace: &mut SyscallTrace,
    fd: &OwnedFd,
    path: &CStr,
    len: usize,
) -> Result<(), Errno> {
    let Ok(off) = libc::off_t::try_from(len) else {
        trace.push(
            format_args!("ftruncate(\"{}\", {len})", display(path)),
            "-1",
            libc::EFBIG,
        );
        return Err(libc::EFBIG);
    };

    loop {
        // Safety: `fd` is an open descriptor
        if unsafe { libc::ftruncate(fd.as_raw_fd(), off) } == 0 {
            return Ok(());
        }
        let errno = last_errno();
        if errno != libc::EINTR {
            trace.push(
                format_args!("ftruncate(\"{}\", {len})", display(path)),
                "-1",
                errno,
            );
            return Err(errno);
        }
    }
}

pub(crate) fn fstat(
    trace: &mut SyscallTrace,
    fd: &OwnedFd,
    path: &CStr,
) -> Result<libc::stat, Errno> {
    let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
    // Safety: `fd` is an open descriptor and `st` is valid for writes
    if unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) } == 0 {
        // Safety: `fstat` succeeded and initialized `st`
        return Ok(unsafe { st.assume_init() });
    }
    let errno = last_errno();
    trace.push(format_args!("fstat(\"{}\")", display(path)), "-1", errno);
    Err(errno)
}

/// `stat` without following a final symbolic link. `ENOENT` is returned but not traced.
pub(crate) fn lstat(trace: &mut SyscallTrace, path: &CStr) -> Result<libc::stat, Errno> {
    let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
    // Safety: `path` is a valid NUL terminated string and `st` is valid for writes
    if unsafe { libc::lstat(path.as_ptr(), st.as_mut_ptr()) } == 0 {
        // Safety: `lstat` succeeded and initialized `st`
        return Ok(unsafe { st.assume_init() });
    }
    let errno = last_errno();
    if errno != libc::ENOENT {
        trace.push(format_args!("lstat(\"{}\")", display(path)), "-1", errno);
    }
    Err(errno)
}

pub(crate) fn chmod(trace: &mut SyscallTrace, path: &CStr, mode: mode_t) -> Result<(), Errno> {
    // Safety: `path` is a valid NUL terminated string
    if unsafe { libc::chmod(path.as_ptr(), mode) } == 0 {
        return Ok(());
    }
    let errno = last_errno();
    trace.push(
        format_args!("chmod(\"{}\", 0{mode:o})", display(path)),
        "-1",
        errno,
    );
    Err(errno)
}

/// Creates a uniquely named directory from `template`, which must end in `XXXXXX`.
pub(crate) fn mkdtemp(trace: &mut SyscallTrace, template: CString) -> Result<CString, Errno> {
    let mut bytes = template.into_bytes_with_nul();
    // Safety: `bytes` is a NUL terminated, writable buffer
    let ret = unsafe { libc::mkdtemp(bytes.as_mut_ptr().cast()) };
    if ret.is_null() {
        let errno = last_errno();
        let template = String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned();
        trace.push(format_args!("mkdtemp(\"{template}\")"), "NULL", errno);
        return Err(errno);
    }

    bytes.pop();
    // `mkdtemp` only replaced the `X` characters, so there are still no interior NUL bytes
    CString::new(bytes).map_err(|_| libc::EINVAL)
}

pub(crate) fn rename(trace: &mut SyscallTrace, from: &CStr, to: &CStr) -> Result<(), Errno> {
    // Safety: both paths are valid NUL terminated strings
    if unsafe { libc::rename(from.as_ptr(), to.as_ptr()) } == 0 {
        return Ok(());
    }
    let errno = last_errno();
    trace.push(
        format_args!("rename(\"{}\", \"{}\")", display(from), display(to)),
        "-1",
        errno,
    );
    Err(errno)
}

pub(crate) fn rmdir(trace: &mut SyscallTrace, path: &CStr) -> Result<(), Errno> {
    // Safety: `path` is a valid NUL terminated string
    if unsafe { libc::rmdir(path.as_ptr()) } == 0 {
        return Ok(());
    }
    let errno = last_errno();
    trace.push(format_args!("rmdir(\"{}\")", display(path)), "-1", errno);
    Err(errno)
}

pub(crate) fn unlink(trace: &mut SyscallTrace, path: &CStr) -> Result<(), Errno> {
    // Safety: `path` is a valid NUL terminated string
    if unsafe { libc::unlink(path.as_ptr()) } == 0 {
        return Ok(());
    }
    let errno = last_errno();
    trace.push(format_args!("unlink(\"{}\")", display(path)), "-1", errno);
    Err(errno)
}

pub(crate) fn geteuid() -> libc::uid_t {
    // Safety: `geteuid` has no preconditions and cannot fail
    unsafe { libc::geteuid() }
}

/// The session id of the calling process.
pub(crate) fn getsid(trace: &mut SyscallTrace) -> Result<libc::pid_t, Errno> {
    // Safety: `getsid(0)` queries the calling process
    let sid = unsafe { libc::getsid(0) };
    if sid >= 0 {
        return Ok(sid);
    }
    let errno = last_errno();
    trace.push(format_args!("getsid(0)"), "-1", errno);
    Err(errno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_open_flags() {
        assert_eq!(
            open_flags(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL),
            "O_RDWR | O_CREAT | O_EXCL"
        );
        assert_eq!(
            open_flags(libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC),
            "O_RDONLY | O_DIRECTORY | O_CLOEXEC"
        );
    }

    #[test]
    fn failed_open_is_traced() {
        let dir = tempfile::tempdir().unwrap();
        let path = CString::new(dir.path().join("missing").into_os_string().into_encoded_bytes())
            .unwrap();

        let mut trace = SyscallTrace::new();
        let errno = open(&mut trace, &path, libc::O_RDWR, 0).unwrap_err();

        assert_eq!(errno, libc::ENOENT);
        assert_eq!(trace.entries().len(), 1);
        assert!(trace.entries()[0].ends_with(", O_RDWR) == -1; errno == ENOENT;"));
    }

    #[test]
    fn mkdtemp_fills_template() {
        let dir = tempfile::tempdir().unwrap();
        let template = CString::new(
            dir.path()
                .join("probe.XXXXXX")
                .into_os_string()
                .into_encoded_bytes(),
        )
        .unwrap();

        let mut trace = SyscallTrace::new();
        let path = mkdtemp(&mut trace, template).unwrap();
        assert!(!path.to_bytes().ends_with(b"XXXXXX"));
        assert!(lstat(&mut trace, &path).is_ok());
        assert!(trace.is_empty());
    }
}
