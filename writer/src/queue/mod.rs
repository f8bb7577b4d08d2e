//! FIFO queues of pending writes with byte reservation accounting.
//!
//! Every task offered to a [TaskQueue] is preceded by a reservation of its size
//! ([TaskQueue::reserve_space]) and the reservation is released as its bytes are
//! written. The reserved total therefore describes everything that has been
//! accepted but not yet flushed, including the current (partially written)
//! element and tasks that have reserved space but not yet been offered.
//!
//! Producers waiting for space register a [Monitor], which fires once the
//! reserved total satisfies its predicate.
//!
//! Two implementations are provided: [Concurrent], for many producers and one
//! consumer, and [Locked], for a single writer that wants to bracket several
//! operations under one lock.

mod concurrent;
pub use concurrent::Concurrent;
mod locked;
pub use locked::{Guard, Locked};
mod monitor;
pub use monitor::{Monitor, MonitorId};

use crate::config::ParseError;
use std::str::FromStr;

/// Queue implementation to use for a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Kind {
    /// [Concurrent]: lock-free queue and atomic counter.
    #[default]
    Concurrent,
    /// [Locked]: one mutex over the whole queue.
    Locked,
}

impl Kind {
    /// Create an empty queue of this kind.
    pub fn create<T: Send + 'static>(self) -> Box<dyn TaskQueue<T>> {
        match self {
            Self::Concurrent => Box::new(Concurrent::new()),
            Self::Locked => Box::new(Locked::new()),
        }
    }
}

impl FromStr for Kind {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "concurrent" => Ok(Self::Concurrent),
            "locked" => Ok(Self::Locked),
            _ => Err(ParseError::new(value, "`concurrent` or `locked`")),
        }
    }
}

/// A FIFO of tasks with reserved-bytes accounting and space monitors.
pub trait TaskQueue<T>: Send + Sync {
    /// Add `bytes` to the reserved total, returning the new total.
    fn reserve_space(&self, bytes: usize) -> usize;

    /// Subtract `bytes` from the reserved total, returning the new total.
    fn release_space(&self, bytes: usize) -> usize;

    /// Subtract `bytes` from the reserved total and fire every monitor whose
    /// predicate is now satisfied. Monitors fire after any internal lock is
    /// released, and are removed once fired.
    fn release_space_and_notify(&self, bytes: usize) -> usize;

    /// Current reserved total.
    fn space_in_bytes(&self) -> usize;

    /// Append `task`. Its space must already be reserved.
    fn offer(&self, task: T);

    /// Remove the oldest task.
    fn poll(&self) -> Option<T>;

    /// Number of queued tasks (excluding the current element).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park a partially processed task to be resumed before anything queued.
    fn set_current(&self, task: T);

    /// Take the parked task, if any.
    fn take_current(&self) -> Option<T>;

    fn has_current(&self) -> bool;

    /// Register `monitor`.
    ///
    /// If the monitor is already satisfied it fires immediately and `None` is
    /// returned.
    fn add_monitor(&self, monitor: Box<dyn Monitor>) -> Option<MonitorId>;

    /// Unregister a monitor that has not fired yet.
    fn remove_monitor(&self, id: MonitorId) -> bool;

    /// Unregister every monitor, returning them.
    fn take_monitors(&self) -> Vec<Box<dyn Monitor>>;
}
