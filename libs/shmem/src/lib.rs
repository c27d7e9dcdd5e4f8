// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Named, file-backed shared memory regions.
//!
//! Each region is a page-aligned file that starts with an 8-byte header tagging the payload's
//! type and version. Processes mapping a region hold a shared `flock` on its file, which lets
//! the next opener tell a region in use apart from one whose users all crashed.

mod dir;
mod error;
mod header;
mod id;
mod manager;
mod region;
mod sys;

pub use error::{SharedMemoryError, SyscallTrace};
pub use header::SharedMemoryType;
pub use id::{MAX_NAME_LEN, SharedMemoryId};
pub use manager::{OpenOptions, SharedMemoryConfig, SharedMemoryManager};
pub use region::{CreationLock, Opened, SharedMemoryRegion};
