// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, Thread};

use critsect::ThreadId;

/// How a wait on a synchronization object was satisfied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// The object was signaled. For a mutex the caller now owns it.
    Signaled,
    /// The caller now owns a mutex whose previous owner exited without releasing it. The data
    /// the mutex protects may be inconsistent.
    Abandoned,
}

const WAITING: u8 = 0;
const SIGNALED: u8 = 1;
const ABANDONED: u8 = 2;

/// A blocked thread queued on a synchronization object.
///
/// The signaling side decides the outcome under the object's lock and then unparks the
/// waiter, which never touches the object again before returning.
pub(crate) struct WaitNode {
    thread: Thread,
    tid: ThreadId,
    state: AtomicU8,
}

impl WaitNode {
    pub(crate) fn for_current() -> Self {
        Self {
            thread: thread::current(),
            tid: ThreadId::current(),
            state: AtomicU8::new(WAITING),
        }
    }

    pub(crate) fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Parks the calling thread until the node is signaled.
    pub(crate) fn wait(&self) -> WaitResult {
        debug_assert_eq!(self.tid, ThreadId::current());

        loop {
            match self.state.load(Ordering::Acquire) {
                WAITING => {
                    tracing::trace!(tid = %self.tid, "parking waiter");
                    thread::park();
                }
                SIGNALED => return WaitResult::Signaled,
                ABANDONED => return WaitResult::Abandoned,
                state => unreachable!("invalid wait node state {state}"),
            }
        }
    }

    pub(crate) fn signal(&self, result: WaitResult) {
        let state = match result {
            WaitResult::Signaled => SIGNALED,
            WaitResult::Abandoned => ABANDONED,
        };
        let prev = self.state.swap(state, Ordering::Release);
        debug_assert_eq!(prev, WAITING, "wait node signaled twice");

        tracing::trace!(tid = %self.tid, ?result, "unparking waiter");
        self.thread.unpark();
    }
}

impl fmt::Debug for WaitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitNode")
            .field("tid", &self.tid)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn signal_before_park() {
        let node = WaitNode::for_current();
        node.signal(WaitResult::Abandoned);
        assert_eq!(node.wait(), WaitResult::Abandoned);
    }

    #[test]
    fn signal_wakes_parked_thread() {
        let (tx, rx) = std::sync::mpsc::channel();

        let waiter = thread::spawn(move || {
            let node = Arc::new(WaitNode::for_current());
            tx.send(node.clone()).unwrap();
            node.wait()
        });

        let node = rx.recv().unwrap();
        node.signal(WaitResult::Signaled);
        assert_eq!(waiter.join().unwrap(), WaitResult::Signaled);
    }
}
