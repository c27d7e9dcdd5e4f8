// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::SharedMemoryError;

/// The longest accepted name in bytes, after the scope prefix is removed.
pub const MAX_NAME_LEN: usize = 255;

const GLOBAL_PREFIX: &str = "Global\\";
const LOCAL_PREFIX: &str = "Local\\";

/// Identifies a named shared memory region.
///
/// A name may carry a `Global\` prefix, making it visible to every session, or a `Local\`
/// prefix, which is the same as no prefix and limits it to the caller's session. User-scoped
/// regions are additionally only visible to the effective user that created them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedMemoryId {
    name: String,
    session_scoped: bool,
    user_scoped: bool,
}

impl SharedMemoryId {
    /// Parses and validates `name`.
    ///
    /// # Errors
    ///
    /// - [`SharedMemoryError::NameEmpty`] if nothing is left after the prefix.
    /// - [`SharedMemoryError::NameTooLong`] if the name exceeds [`MAX_NAME_LEN`] bytes.
    /// - [`SharedMemoryError::NameInvalid`] if the name contains `/`, `\` or NUL, or is `.` or
    ///   `..`.
    pub fn new(name: &str, user_scoped: bool) -> Result<Self, SharedMemoryError> {
        let (name, session_scoped) = if let Some(rest) = name.strip_prefix(GLOBAL_PREFIX) {
            (rest, false)
        } else if let Some(rest) = name.strip_prefix(LOCAL_PREFIX) {
            (rest, true)
        } else {
            (name, true)
        };

        if name.is_empty() {
            return Err(SharedMemoryError::NameEmpty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(SharedMemoryError::NameTooLong);
        }
        if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(SharedMemoryError::NameInvalid);
        }

        Ok(Self {
            name: name.to_owned(),
            session_scoped,
            user_scoped,
        })
    }

    /// The name without its scope prefix. This is also the region's file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_session_scoped(&self) -> bool {
        self.session_scoped
    }

    #[must_use]
    pub fn is_user_scoped(&self) -> bool {
        self.user_scoped
    }

    /// The directory holding this region's file, relative to the shared memory directory.
    pub(crate) fn scope_dir_name(&self, session_id: libc::pid_t) -> String {
        if self.session_scoped {
            format!("Session{session_id}")
        } else {
            String::from("Global")
        }
    }
}

impl fmt::Display for SharedMemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.session_scoped {
            f.write_str(GLOBAL_PREFIX)?;
        }
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        let id = SharedMemoryId::new("Global\\foo", false).unwrap();
        assert_eq!(id.name(), "foo");
        assert!(!id.is_session_scoped());
        assert_eq!(id.to_string(), "Global\\foo");

        let id = SharedMemoryId::new("Local\\foo", true).unwrap();
        assert_eq!(id.name(), "foo");
        assert!(id.is_session_scoped());
        assert!(id.is_user_scoped());
        assert_eq!(id, SharedMemoryId::new("foo", true).unwrap());
        assert_eq!(id.scope_dir_name(42), "Session42");
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(
            SharedMemoryId::new("", false),
            Err(SharedMemoryError::NameEmpty)
        );
        assert_eq!(
            SharedMemoryId::new("Global\\", false),
            Err(SharedMemoryError::NameEmpty)
        );
        assert_eq!(
            SharedMemoryId::new(&"x".repeat(MAX_NAME_LEN + 1), false),
            Err(SharedMemoryError::NameTooLong)
        );
        assert!(SharedMemoryId::new(&"x".repeat(MAX_NAME_LEN), false).is_ok());

        for name in ["a/b", "a\\b", "Local\\a\\b", "nul\0", ".", "Global\\.."] {
            assert_eq!(
                SharedMemoryId::new(name, false),
                Err(SharedMemoryError::NameInvalid),
                "{name:?}"
            );
        }
    }
}
