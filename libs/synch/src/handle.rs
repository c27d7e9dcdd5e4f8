// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::num::NonZeroUsize;
use std::sync::Arc;

use crate::SynchError;
use crate::object::Object;

/// Handle values are multiples of this, the low bits are always clear.
const HANDLE_GRANULARITY_SHIFT: u32 = 2;

/// An opaque reference to a synchronization object.
///
/// Handle values are non-zero multiples of 4. A closed handle's value may be handed out again by
/// a later allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Reconstructs a handle from its raw value.
    ///
    /// Returns `None` for values that can never be a handle (zero or not a multiple of 4). The
    /// returned handle is not necessarily open.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        if raw & ((1 << HANDLE_GRANULARITY_SHIFT) - 1) != 0 {
            return None;
        }
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0.get()
    }

    fn from_index(index: usize) -> Result<Self, SynchError> {
        index
            .checked_add(1)
            .and_then(|slot| slot.checked_mul(1 << HANDLE_GRANULARITY_SHIFT))
            .and_then(Self::from_raw)
            .ok_or(SynchError::OutOfMemory)
    }

    fn index(self) -> usize {
        (self.0.get() >> HANDLE_GRANULARITY_SHIFT) - 1
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Maps handles to the objects they reference. Each occupied slot holds one reference to its
/// object.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    slots: Vec<Option<Arc<Object>>>,
    free: Vec<usize>,
    open: usize,
}

impl HandleTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            open: 0,
        }
    }

    /// Stores `object` in a free slot and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::OutOfMemory`] if the table cannot grow.
    pub(crate) fn insert(&mut self, object: Arc<Object>) -> Result<Handle, SynchError> {
        let index = if let Some(index) = self.free.pop() {
            debug_assert!(self.slots[index].is_none());
            self.slots[index] = Some(object);
            index
        } else {
            // Reserve room in the free list too, so `remove` never has to allocate.
            self.slots.try_reserve(1)?;
            self.free.try_reserve(self.slots.len() + 1 - self.free.len())?;
            self.slots.push(Some(object));
            self.slots.len() - 1
        };

        match Handle::from_index(index) {
            Ok(handle) => {
                self.open += 1;
                Ok(handle)
            }
            Err(err) => {
                self.slots[index] = None;
                self.free.push(index);
                Err(err)
            }
        }
    }

    /// Returns a new reference to the object behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidHandle`] if `handle` is not open.
    pub(crate) fn get(&self, handle: Handle) -> Result<Arc<Object>, SynchError> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(SynchError::InvalidHandle)
    }

    /// Closes `handle`, returning the table's reference to the object.
    ///
    /// # Errors
    ///
    /// Returns [`SynchError::InvalidHandle`] if `handle` is not open.
    pub(crate) fn remove(&mut self, handle: Handle) -> Result<Arc<Object>, SynchError> {
        let index = handle.index();
        let object = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(SynchError::InvalidHandle)?;
        self.free.push(index);
        self.open -= 1;
        Ok(object)
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.open
    }

    /// Removes every open handle, returning the table's references.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Object>> {
        self.free.clear();
        self.open = 0;
        self.slots.drain(..).flatten().collect()
    }
}
