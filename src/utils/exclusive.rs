// src/utils/exclusive.rs

//! A cell for data whose access order is serialized by the job graph.
//!
//! Substreams and block results are mutated by exactly one job at a time, but
//! that job runs on whichever worker picks it up. The graph's dependency
//! edges provide both mutual exclusion and the happens-before ordering (each
//! edge is signaled through the queue mutex), so taking a lock here would be
//! pure overhead on the hottest path of the encoder. Debug builds still
//! detect a broken graph by flagging concurrent `with` entries.

use std::cell::UnsafeCell;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicBool, Ordering};

/// Interior mutability guarded by scheduling order instead of a lock.
///
/// Contract: at any instant at most one thread may be inside [`with`], and
/// [`peek`] may only run when no `with` can be live (all writers of the value
/// are completed predecessors of the reading job).
///
/// [`with`]: ExclusiveCell::with
/// [`peek`]: ExclusiveCell::peek
#[derive(Debug)]
pub struct ExclusiveCell<T> {
    value: UnsafeCell<T>,
    #[cfg(debug_assertions)]
    busy: AtomicBool,
}

// The graph serializes access; see the module docs.
unsafe impl<T: Send> Sync for ExclusiveCell<T> {}
unsafe impl<T: Send> Send for ExclusiveCell<T> {}

impl<T> ExclusiveCell<T> {
    pub fn new(value: T) -> Self {
        ExclusiveCell {
            value: UnsafeCell::new(value),
            #[cfg(debug_assertions)]
            busy: AtomicBool::new(false),
        }
    }

    /// Runs `f` with exclusive access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        #[cfg(debug_assertions)]
        assert!(
            !self.busy.swap(true, Ordering::Acquire),
            "two jobs entered the same cell; the graph is missing an edge"
        );

        // Safety: the job graph guarantees a single live accessor (checked
        // above in debug builds).
        let result = f(unsafe { &mut *self.value.get() });

        #[cfg(debug_assertions)]
        self.busy.store(false, Ordering::Release);
        result
    }

    /// Shared read for values whose writers have all completed.
    pub fn peek(&self) -> &T {
        #[cfg(debug_assertions)]
        assert!(
            !self.busy.load(Ordering::Acquire),
            "peek raced a live writer; the graph is missing an edge"
        );
        // Safety: no writer can be live per the cell contract.
        unsafe { &*self.value.get() }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}
