// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[derive(Debug, Copy, Clone, PartialEq, Eq, onlyerror::Error)]
pub enum SynchError {
    /// An argument failed validation. No side effect took place.
    #[error("invalid parameter")]
    InvalidParameter,
    /// Memory for the object or its handle could not be allocated.
    #[error("not enough memory to complete the operation")]
    OutOfMemory,
    /// The handle is unknown, was closed, or refers to an object of another type.
    #[error("invalid handle")]
    InvalidHandle,
    /// Named (cross-process) synchronization objects are not supported.
    #[error("named synchronization objects are not supported")]
    NotSupported,
    /// Releasing the semaphore would exceed its maximum count.
    #[error("too many posts were made to a semaphore")]
    TooManyPosts,
    /// The calling thread does not own the mutex.
    #[error("attempt to release a mutex not owned by the caller")]
    NotOwner,
}

impl SynchError {
    /// Returns the numeric error code the emulated platform uses for this error, as reported
    /// through the thread's last-error slot.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            SynchError::InvalidParameter => 87,
            SynchError::OutOfMemory => 8,
            SynchError::InvalidHandle => 6,
            SynchError::NotSupported => 50,
            SynchError::TooManyPosts => 298,
            SynchError::NotOwner => 288,
        }
    }
}

// `SynchError` is `Copy`, so the allocation failure isn't kept as a source.
impl From<std::collections::TryReserveError> for SynchError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_and_codes() {
        assert_eq!(SynchError::InvalidHandle.to_string(), "invalid handle");
        assert_eq!(SynchError::TooManyPosts.code(), 298);

        let err: &dyn core::error::Error = &SynchError::NotOwner;
        assert!(err.source().is_none());

        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        assert_eq!(SynchError::from(err), SynchError::OutOfMemory);
    }
}
