// SPDX-License-Identifier: Apache-2.0

//! Priority dispatch queues for the build scheduler.
//!
//! One queue exists per [`DispatcherKind`]. Each queue orders items by
//! descending priority with FIFO ordering among equal priorities, and caps
//! the number of concurrently dispatched items at a live-adjustable maximum
//! parallel degree. A single drain loop owns iteration across the whole
//! [`DispatchQueueSet`]; everything here is optimized for that one consumer
//! with many producers.

use std::fmt;

pub mod adaptive;
pub mod dispatch;
pub mod error;
pub mod priority;
pub mod semaphore;

pub use adaptive::IoQueueMonitor;
pub use dispatch::{DispatchQueueSet, DrainOutcome, QueueStats};
pub use error::EnqueueError;
pub use priority::PriorityQueue;

/// The closed set of dispatch queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherKind {
    /// Not a queue: the step runs inline on the current thread.
    None,
    /// Cache replays and other disk-dominated steps.
    IO,
    /// Process and IPC execution.
    CPU,
    /// Meta pips and other trivial steps.
    Light,
    /// Input/output materialization.
    Materialize,
    /// Cache lookups.
    CacheLookup,
    /// Cache-lookup worker selection.
    ChooseWorkerCacheLookup,
    /// CPU worker selection.
    ChooseWorkerCpu,
    /// Short delay to batch cache lookups.
    DelayedCacheLookup,
    /// Directory seal bookkeeping.
    SealDirs,
}

impl DispatcherKind {
    /// Every dispatchable kind, in drain-scan order. Excludes `None`.
    pub const DISPATCHABLE: [DispatcherKind; 9] = [
        DispatcherKind::IO,
        DispatcherKind::CPU,
        DispatcherKind::Light,
        DispatcherKind::Materialize,
        DispatcherKind::CacheLookup,
        DispatcherKind::ChooseWorkerCacheLookup,
        DispatcherKind::ChooseWorkerCpu,
        DispatcherKind::DelayedCacheLookup,
        DispatcherKind::SealDirs,
    ];

    /// Dense index of this kind within [`DispatcherKind::DISPATCHABLE`].
    ///
    /// `None` has no queue and no index.
    #[must_use]
    pub const fn queue_index(self) -> Option<usize> {
        match self {
            DispatcherKind::None => None,
            DispatcherKind::IO => Some(0),
            DispatcherKind::CPU => Some(1),
            DispatcherKind::Light => Some(2),
            DispatcherKind::Materialize => Some(3),
            DispatcherKind::CacheLookup => Some(4),
            DispatcherKind::ChooseWorkerCacheLookup => Some(5),
            DispatcherKind::ChooseWorkerCpu => Some(6),
            DispatcherKind::DelayedCacheLookup => Some(7),
            DispatcherKind::SealDirs => Some(8),
        }
    }

    /// Whether this kind is one of the worker-selection queues.
    #[must_use]
    pub const fn is_choose_worker(self) -> bool {
        matches!(
            self,
            DispatcherKind::ChooseWorkerCacheLookup | DispatcherKind::ChooseWorkerCpu
        )
    }
}

impl fmt::Display for DispatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DispatcherKind::None => "None",
            DispatcherKind::IO => "IO",
            DispatcherKind::CPU => "CPU",
            DispatcherKind::Light => "Light",
            DispatcherKind::Materialize => "Materialize",
            DispatcherKind::CacheLookup => "CacheLookup",
            DispatcherKind::ChooseWorkerCacheLookup => "ChooseWorkerCacheLookup",
            DispatcherKind::ChooseWorkerCpu => "ChooseWorkerCpu",
            DispatcherKind::DelayedCacheLookup => "DelayedCacheLookup",
            DispatcherKind::SealDirs => "SealDirs",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_indexes_match_scan_order() {
        for (expected, kind) in DispatcherKind::DISPATCHABLE.iter().enumerate() {
            assert_eq!(kind.queue_index(), Some(expected));
        }
        assert_eq!(DispatcherKind::None.queue_index(), None);
    }

    #[test]
    fn choose_worker_kinds() {
        assert!(DispatcherKind::ChooseWorkerCpu.is_choose_worker());
        assert!(DispatcherKind::ChooseWorkerCacheLookup.is_choose_worker());
        assert!(!DispatcherKind::CPU.is_choose_worker());
    }
}
