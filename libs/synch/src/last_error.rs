// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread last-error slot of the emulated platform.

use core::cell::Cell;

use crate::SynchError;

/// The code stored when no error occurred.
pub const ERROR_SUCCESS: u32 = 0;

std::thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(ERROR_SUCCESS) };
}

/// Returns the code of the most recent failure recorded on the calling thread.
#[must_use]
pub fn get() -> u32 {
    LAST_ERROR.with(Cell::get)
}

/// Overwrites the calling thread's last-error code.
pub fn set(code: u32) {
    LAST_ERROR.with(|slot| slot.set(code));
}

/// Records the error of a failed operation in the last-error slot and passes the result
/// through unchanged. Successful results leave the slot untouched.
///
/// # Errors
///
/// Returns `result` unchanged.
pub fn record<T>(result: Result<T, SynchError>) -> Result<T, SynchError> {
    if let Err(err) = &result {
        set(err.code());
    }
    result
}
