// SPDX-License-Identifier: Apache-2.0

//! Dense atomic counter registry for scheduler-wide counts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduler-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCounter {
    /// Process pips whose cache lookup hit.
    ProcessPipCacheHits,
    /// Process pips whose cache lookup missed.
    ProcessPipCacheMisses,
    /// Process pips executed because the cache missed.
    ProcessPipsExecutedDueToCacheMiss,
    /// Pips skipped because an upstream dependency failed or was skipped.
    PipsSkippedDueToFailedDependencies,
    /// Pips satisfied by the incremental-scheduling state.
    PipsUpToDate,
    /// Pips replayed from the cache.
    PipsRunFromCache,
    /// Retries after a memory-pressure cancellation.
    RetriedDueToLowMemory,
    /// Reassignments after a remote worker detached.
    RetriedDueToStoppedWorker,
    /// Retries after sandbox-prep or VM provisioning failures.
    RetriedDueToRetryableFailure,
    /// Service pips started and completed.
    ServicePipsCompleted,
    /// Service shutdown pips completed at drain.
    ServiceShutdownPipsCompleted,
    /// Workers that were ever available to the build.
    EverAvailableWorkerCount,
    /// High-water mark of concurrently executing processes.
    MaxRunningProcesses,
    /// Background output materializations that failed.
    BackgroundMaterializationFailures,
    /// Pips canceled by build termination.
    PipsCanceled,
}

impl SchedulerCounter {
    /// Every counter, in dense index order.
    pub const ALL: [SchedulerCounter; 15] = [
        SchedulerCounter::ProcessPipCacheHits,
        SchedulerCounter::ProcessPipCacheMisses,
        SchedulerCounter::ProcessPipsExecutedDueToCacheMiss,
        SchedulerCounter::PipsSkippedDueToFailedDependencies,
        SchedulerCounter::PipsUpToDate,
        SchedulerCounter::PipsRunFromCache,
        SchedulerCounter::RetriedDueToLowMemory,
        SchedulerCounter::RetriedDueToStoppedWorker,
        SchedulerCounter::RetriedDueToRetryableFailure,
        SchedulerCounter::ServicePipsCompleted,
        SchedulerCounter::ServiceShutdownPipsCompleted,
        SchedulerCounter::EverAvailableWorkerCount,
        SchedulerCounter::MaxRunningProcesses,
        SchedulerCounter::BackgroundMaterializationFailures,
        SchedulerCounter::PipsCanceled,
    ];

    const fn index(self) -> usize {
        match self {
            SchedulerCounter::ProcessPipCacheHits => 0,
            SchedulerCounter::ProcessPipCacheMisses => 1,
            SchedulerCounter::ProcessPipsExecutedDueToCacheMiss => 2,
            SchedulerCounter::PipsSkippedDueToFailedDependencies => 3,
            SchedulerCounter::PipsUpToDate => 4,
            SchedulerCounter::PipsRunFromCache => 5,
            SchedulerCounter::RetriedDueToLowMemory => 6,
            SchedulerCounter::RetriedDueToStoppedWorker => 7,
            SchedulerCounter::RetriedDueToRetryableFailure => 8,
            SchedulerCounter::ServicePipsCompleted => 9,
            SchedulerCounter::ServiceShutdownPipsCompleted => 10,
            SchedulerCounter::EverAvailableWorkerCount => 11,
            SchedulerCounter::MaxRunningProcesses => 12,
            SchedulerCounter::BackgroundMaterializationFailures => 13,
            SchedulerCounter::PipsCanceled => 14,
        }
    }

    /// Stable name used in serialized stats.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SchedulerCounter::ProcessPipCacheHits => "ProcessPipCacheHits",
            SchedulerCounter::ProcessPipCacheMisses => "ProcessPipCacheMisses",
            SchedulerCounter::ProcessPipsExecutedDueToCacheMiss => {
                "ProcessPipsExecutedDueToCacheMiss"
            }
            SchedulerCounter::PipsSkippedDueToFailedDependencies => {
                "PipsSkippedDueToFailedDependencies"
            }
            SchedulerCounter::PipsUpToDate => "PipsUpToDate",
            SchedulerCounter::PipsRunFromCache => "PipsRunFromCache",
            SchedulerCounter::RetriedDueToLowMemory => "RetriedDueToLowMemory",
            SchedulerCounter::RetriedDueToStoppedWorker => "RetriedDueToStoppedWorker",
            SchedulerCounter::RetriedDueToRetryableFailure => "RetriedDueToRetryableFailure",
            SchedulerCounter::ServicePipsCompleted => "ServicePipsCompleted",
            SchedulerCounter::ServiceShutdownPipsCompleted => "ServiceShutdownPipsCompleted",
            SchedulerCounter::EverAvailableWorkerCount => "EverAvailableWorkerCount",
            SchedulerCounter::MaxRunningProcesses => "MaxRunningProcesses",
            SchedulerCounter::BackgroundMaterializationFailures => {
                "BackgroundMaterializationFailures"
            }
            SchedulerCounter::PipsCanceled => "PipsCanceled",
        }
    }
}

impl fmt::Display for SchedulerCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Atomic storage for every [`SchedulerCounter`].
pub struct CounterRegistry {
    counters: [AtomicU64; SchedulerCounter::ALL.len()],
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterRegistry {
    /// Creates a registry with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Adds one to `counter`.
    pub fn increment(&self, counter: SchedulerCounter) {
        let _ = self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `amount` to `counter`.
    pub fn add(&self, counter: SchedulerCounter, amount: u64) {
        let _ = self.counters[counter.index()].fetch_add(amount, Ordering::Relaxed);
    }

    /// Raises `counter` to `value` when `value` is larger.
    pub fn record_max(&self, counter: SchedulerCounter, value: u64) {
        let _ = self.counters[counter.index()].fetch_max(value, Ordering::Relaxed);
    }

    /// Current value of `counter`.
    #[must_use]
    pub fn get(&self, counter: SchedulerCounter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Snapshot of every counter by stable name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        SchedulerCounter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let registry = CounterRegistry::new();
        registry.increment(SchedulerCounter::ProcessPipCacheHits);
        registry.increment(SchedulerCounter::ProcessPipCacheHits);
        registry.add(SchedulerCounter::ProcessPipCacheMisses, 3);
        assert_eq!(registry.get(SchedulerCounter::ProcessPipCacheHits), 2);
        assert_eq!(registry.get(SchedulerCounter::ProcessPipCacheMisses), 3);
        assert_eq!(registry.get(SchedulerCounter::PipsUpToDate), 0);
    }

    #[test]
    fn record_max_keeps_the_high_water_mark() {
        let registry = CounterRegistry::new();
        registry.record_max(SchedulerCounter::MaxRunningProcesses, 4);
        registry.record_max(SchedulerCounter::MaxRunningProcesses, 2);
        assert_eq!(registry.get(SchedulerCounter::MaxRunningProcesses), 4);
    }

    #[test]
    fn indexes_are_dense_and_unique() {
        for (expected, counter) in SchedulerCounter::ALL.iter().enumerate() {
            assert_eq!(counter.index(), expected);
        }
    }
}
