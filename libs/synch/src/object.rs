// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use critsect::ThreadId;

use crate::controller::StateController;
use crate::wait::WaitNode;

/// The kind of a synchronization object together with its immutable, kind-specific
/// parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// Single owner with recursive acquisition. The signal count is `1` while unowned and `0`
    /// while owned.
    Mutex,
    /// Bounded counter without ownership.
    Semaphore { maximum_count: i32 },
}

impl ObjectKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Mutex => "mutex",
            ObjectKind::Semaphore { .. } => "semaphore",
        }
    }

    pub(crate) fn same_type(self, other: ObjectKind) -> bool {
        core::mem::discriminant(&self) == core::mem::discriminant(&other)
    }
}

/// The mutable state of a synchronization object, guarded by the object's own lock.
#[derive(Debug, Default)]
pub(crate) struct SynchData {
    pub(crate) signal_count: i32,
    pub(crate) ownership_count: u32,
    pub(crate) owner: Option<ThreadId>,
    /// Set when the owner exited without releasing the mutex, consumed by the next acquirer.
    pub(crate) abandoned: bool,
    pub(crate) waiters: VecDeque<Arc<WaitNode>>,
}

/// A reference-counted synchronization object.
///
/// Objects are dropped once the last handle is closed and no thread is waiting on or owning
/// them anymore.
pub struct Object {
    kind: ObjectKind,
    data: critsect::Mutex<SynchData>,
    registry: Arc<OwnershipRegistry>,
}

impl Object {
    pub(crate) fn new(kind: ObjectKind, registry: Arc<OwnershipRegistry>) -> Arc<Self> {
        let data = SynchData {
            signal_count: match kind {
                ObjectKind::Mutex => 1,
                ObjectKind::Semaphore { .. } => 0,
            },
            ..SynchData::default()
        };

        Arc::new(Self {
            kind,
            data: critsect::Mutex::new(data),
            registry,
        })
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Locks the object's state and returns a controller for manipulating it. The lock is
    /// released when the controller is dropped.
    pub fn controller(self: &Arc<Self>) -> StateController<'_> {
        StateController::new(self, self.data.lock())
    }

    pub(crate) fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Object");
        s.field("kind", &self.kind);
        match self.data.try_lock() {
            Some(data) => s.field("data", &*data),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.finish_non_exhaustive()
    }
}

/// Tracks which mutexes each thread currently owns, so they can be abandoned when the thread
/// exits.
///
/// The registry lock is always acquired after an object's lock, never before.
#[derive(Debug, Default)]
pub(crate) struct OwnershipRegistry {
    owned: critsect::Mutex<HashMap<ThreadId, Vec<Weak<Object>>>>,
}

impl OwnershipRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, tid: ThreadId, object: &Arc<Object>) {
        self.owned
            .lock()
            .entry(tid)
            .or_default()
            .push(Arc::downgrade(object));
    }

    pub(crate) fn remove(&self, tid: ThreadId, object: &Arc<Object>) {
        let mut owned = self.owned.lock();
        let Some(objects) = owned.get_mut(&tid) else {
            debug_assert!(false, "thread {tid} has no owned objects");
            return;
        };

        if let Some(pos) = objects
            .iter()
            .position(|weak| core::ptr::eq(weak.as_ptr(), Arc::as_ptr(object)))
        {
            objects.swap_remove(pos);
        }
        if objects.is_empty() {
            owned.remove(&tid);
        }
    }

    /// Removes and returns every object recorded for `tid`.
    pub(crate) fn take(&self, tid: ThreadId) -> Vec<Weak<Object>> {
        self.owned.lock().remove(&tid).unwrap_or_default()
    }

    pub(crate) fn owned_by(&self, tid: ThreadId) -> usize {
        self.owned.lock().get(&tid).map_or(0, Vec::len)
    }
}
