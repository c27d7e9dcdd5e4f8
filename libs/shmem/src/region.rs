// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::SharedMemoryId;
use crate::header::HEADER_SIZE;
use crate::manager::{HeldScope, Inner};

/// One reference to a mapped shared memory region.
///
/// Cloning adds a reference. When the last reference in the process is dropped the region is
/// unmapped, and if no other process has it mapped either, its file is removed.
pub struct SharedMemoryRegion {
    pub(crate) inner: Arc<Inner>,
    pub(crate) id: SharedMemoryId,
    pub(crate) base: NonNull<u8>,
    pub(crate) mapped_len: usize,
}

// Safety: the region only hands out raw access to memory that other processes mutate
// concurrently anyway, callers synchronize through the payload's own protocol.
unsafe impl Send for SharedMemoryRegion {}
// Safety: see above
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    #[must_use]
    pub fn id(&self) -> &SharedMemoryId {
        &self.id
    }

    /// The number of mapped bytes, header included. Always a multiple of the page size.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.mapped_len - HEADER_SIZE
    }

    /// A pointer to the first payload byte, valid for [`Self::payload_len`] bytes while `self`
    /// is alive.
    #[must_use]
    pub fn payload_ptr(&self) -> NonNull<u8> {
        // Safety: the mapping is always larger than the header
        unsafe { self.base.add(HEADER_SIZE) }
    }

    /// Views the payload as a byte slice.
    ///
    /// # Safety
    ///
    /// No thread or process may write to the payload while the returned slice is alive.
    #[must_use]
    pub unsafe fn payload(&self) -> &[u8] {
        // Safety: the mapping is valid for `payload_len` bytes while `self` is alive, the
        // absence of writers is ensured by the caller
        unsafe { core::slice::from_raw_parts(self.payload_ptr().as_ptr(), self.payload_len()) }
    }

    /// Views the payload as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// No other thread or process may access the payload while the returned slice is alive,
    /// this includes other references to the same region in this process.
    #[must_use]
    pub unsafe fn payload_mut(&mut self) -> &mut [u8] {
        // Safety: see `payload`, exclusivity is ensured by the caller
        unsafe { core::slice::from_raw_parts_mut(self.payload_ptr().as_ptr(), self.payload_len()) }
    }
}

impl Clone for SharedMemoryRegion {
    fn clone(&self) -> Self {
        self.inner.add_ref(&self.id);
        Self {
            inner: self.inner.clone(),
            id: self.id.clone(),
            base: self.base,
            mapped_len: self.mapped_len,
        }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        self.inner.release(&self.id);
    }
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("mapped_len", &self.mapped_len)
            .finish_non_exhaustive()
    }
}

/// The result of a successful create-or-open.
#[derive(Debug)]
pub enum Opened<'m> {
    Ready {
        region: SharedMemoryRegion,
        /// `true` if the region was created or reinitialized by this call.
        created: bool,
    },
    /// A freshly created region whose creation locks are still held so the caller can populate
    /// it before anybody else gets to see it.
    Locked(CreationLock<'m>),
}

impl Opened<'_> {
    #[must_use]
    pub fn created(&self) -> bool {
        match self {
            Opened::Ready { created, .. } => *created,
            Opened::Locked(_) => true,
        }
    }

    /// Returns the region, releasing the creation locks if they are still held.
    #[must_use]
    pub fn into_region(self) -> SharedMemoryRegion {
        match self {
            Opened::Ready { region, .. } => region,
            Opened::Locked(lock) => lock.finish(),
        }
    }
}

/// Holds both the in-process and the interprocess creation lock over a freshly created region.
///
/// Other threads and processes opening the same name block until the lock is released through
/// [`CreationLock::finish`] or by dropping it.
///
/// The holding thread may keep using the manager meanwhile: cloning and dropping regions and
/// opening further ones works as usual.
pub struct CreationLock<'m> {
    // Field order is drop order: the locks go first, the region reference last.
    held: HeldScope<'m>,
    region: SharedMemoryRegion,
}

impl<'m> CreationLock<'m> {
    pub(crate) fn new(held: HeldScope<'m>, region: SharedMemoryRegion) -> Self {
        Self { held, region }
    }

    #[must_use]
    pub fn region(&self) -> &SharedMemoryRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut SharedMemoryRegion {
        &mut self.region
    }

    /// Releases the creation locks and returns the initialized region.
    #[must_use]
    pub fn finish(self) -> SharedMemoryRegion {
        let Self { held, region } = self;
        drop(held);
        tracing::trace!(id = %region.id, "released creation lock");
        region
    }
}

impl fmt::Debug for CreationLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationLock")
            .field("held", &self.held)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
