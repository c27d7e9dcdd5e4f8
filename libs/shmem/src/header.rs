// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;

/// Tags the kind and layout version of the data stored in a shared memory region.
///
/// Opening a region with a different type than it was created with fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SharedMemoryType {
    pub tag: u8,
    pub version: u8,
}

impl SharedMemoryType {
    #[must_use]
    pub const fn new(tag: u8, version: u8) -> Self {
        Self { tag, version }
    }
}

/// The fixed header at the start of every region file, followed by the payload.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SharedDataHeader {
    tag: u8,
    version: u8,
    _reserved: [u8; 6],
}

pub(crate) const HEADER_SIZE: usize = size_of::<SharedDataHeader>();

static_assertions::const_assert_eq!(HEADER_SIZE, 8);

impl SharedDataHeader {
    pub(crate) fn new(ty: SharedMemoryType) -> Self {
        Self {
            tag: ty.tag,
            version: ty.version,
            _reserved: [0; 6],
        }
    }

    pub(crate) fn ty(self) -> SharedMemoryType {
        SharedMemoryType::new(self.tag, self.version)
    }

    /// # Safety
    ///
    /// `base` must point to at least [`HEADER_SIZE`] readable bytes.
    pub(crate) unsafe fn read(base: NonNull<u8>) -> Self {
        // Safety: ensured by caller, the header is `repr(C)` plain bytes so any content is valid
        unsafe { base.cast::<Self>().read_unaligned() }
    }

    /// # Safety
    ///
    /// `base` must point to at least [`HEADER_SIZE`] writable bytes.
    pub(crate) unsafe fn write(self, base: NonNull<u8>) {
        // Safety: ensured by caller
        unsafe { base.cast::<Self>().write_unaligned(self) }
    }
}
