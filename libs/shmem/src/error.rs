// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq, onlyerror::Error)]
pub enum SharedMemoryError {
    /// The name is empty once its scope prefix is removed.
    #[error("shared memory name is empty")]
    NameEmpty,
    /// The name exceeds [`MAX_NAME_LEN`](crate::MAX_NAME_LEN) bytes.
    #[error("shared memory name is too long")]
    NameTooLong,
    /// The name contains a path separator or NUL byte, or is `.`/`..`.
    #[error("shared memory name contains invalid characters")]
    NameInvalid,
    /// The host ran out of memory or disk space.
    #[error("out of memory")]
    OutOfMemory,
    /// An unexpected system call failure. The trace lists every failed call in order.
    #[error("shared memory I/O failure: {0}")]
    Io(SyscallTrace),
    /// An existing region has a different type, version or is smaller than required.
    #[error("shared memory region has an incompatible header or size")]
    HeaderMismatch,
}

/// An append-only record of the system calls that failed during one shared memory operation.
///
/// Each entry has the form `open("<path>", O_RDWR | O_CREAT | O_EXCL, 0600) == -1; errno ==
/// EEXIST;`. Calls whose failure was tolerated are recorded as well, so the trace shows the full
/// path that led to the final error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyscallTrace {
    entries: Vec<String>,
}

impl SyscallTrace {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records that `call` returned `ret` and set `errno`.
    pub(crate) fn push(&mut self, call: fmt::Arguments<'_>, ret: &str, errno: i32) {
        let entry = format!("{call} == {ret}; errno == {};", ErrnoName(errno));
        tracing::debug!("{entry}");
        self.entries.push(entry);
    }

    /// Records a failed consistency check that has no errno of its own.
    pub(crate) fn push_check(&mut self, check: fmt::Arguments<'_>) {
        let entry = format!("{check};");
        tracing::debug!("{entry}");
        self.entries.push(entry);
    }

    /// Turns the trace into the error surfaced for a fatal failure with `errno`.
    ///
    /// Resource exhaustion is reported as [`SharedMemoryError::OutOfMemory`], everything else as
    /// [`SharedMemoryError::Io`].
    pub(crate) fn into_error(self, errno: i32) -> SharedMemoryError {
        match errno {
            libc::ENOMEM | libc::ENOSPC => SharedMemoryError::OutOfMemory,
            _ => SharedMemoryError::Io(self),
        }
    }
}

impl fmt::Display for SyscallTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(entry)?;
        }
        Ok(())
    }
}

/// Renders an errno value by its symbolic name.
pub(crate) struct ErrnoName(pub(crate) i32);

impl fmt::Display for ErrnoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            libc::EPERM => "EPERM",
            libc::ENOENT => "ENOENT",
            libc::EINTR => "EINTR",
            libc::EIO => "EIO",
            libc::EBADF => "EBADF",
            libc::EAGAIN => "EAGAIN",
            libc::ENOMEM => "ENOMEM",
            libc::EACCES => "EACCES",
            libc::EBUSY => "EBUSY",
            libc::EEXIST => "EEXIST",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EINVAL => "EINVAL",
            libc::ENFILE => "ENFILE",
            libc::EMFILE => "EMFILE",
            libc::EFBIG => "EFBIG",
            libc::ENOSPC => "ENOSPC",
            libc::EROFS => "EROFS",
            libc::ENAMETOOLONG => "ENAMETOOLONG",
            libc::ENOLCK => "ENOLCK",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::ELOOP => "ELOOP",
            libc::EDQUOT => "EDQUOT",
            errno => return write!(f, "{errno}"),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_format() {
        let mut trace = SyscallTrace::new();
        trace.push(
            format_args!("open(\"{}\", {}, 0{:o})", "/tmp/x", "O_RDWR | O_CREAT | O_EXCL", 0o600),
            "-1",
            libc::EEXIST,
        );
        trace.push(format_args!("flock(\"/tmp\", LOCK_EX)"), "-1", 4242);

        assert_eq!(
            trace.entries(),
            [
                "open(\"/tmp/x\", O_RDWR | O_CREAT | O_EXCL, 0600) == -1; errno == EEXIST;",
                "flock(\"/tmp\", LOCK_EX) == -1; errno == 4242;",
            ]
        );

        let err = trace.clone().into_error(libc::EACCES);
        assert_eq!(err, SharedMemoryError::Io(trace));
        assert!(err.to_string().contains("errno == EEXIST; flock"));
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        for errno in [libc::ENOMEM, libc::ENOSPC] {
            assert_eq!(
                SyscallTrace::new().into_error(errno),
                SharedMemoryError::OutOfMemory
            );
        }
    }
}
