// SPDX-License-Identifier: Apache-2.0

//! The mutable execution record of a pip in flight.
//!
//! A `RunnablePip` is created when a pip reaches Ready, owned by the driver
//! until its step becomes `Done`, and released together with the dependent
//! decrement. A second record may be created afterwards for background
//! output materialization only.

use crate::steps::PipExecutionStep;
use buildflow_api::{CacheHit, ExecutionResult, MemoryCounters, SourceHashes, StepError};
use buildflow_graph::{ModuleId, PipId, PipType, SemaphoreRequirement};
use buildflow_queue::DispatcherKind;
use buildflow_workers::{SlotKind, WorkerId};
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Priority assigned to background output materialization.
pub const BACKGROUND_PRIORITY: i32 = 0;

/// Per-step timing and placement, for the execution log.
#[derive(Debug)]
pub struct PerPipPerformance {
    /// When the runnable was created.
    pub created_at: Instant,
    /// Wall-clock duration of each executed step.
    pub step_durations: SmallVec<[(PipExecutionStep, Duration); 8]>,
    /// Worker that executed each placed step.
    pub worker_by_step: SmallVec<[(PipExecutionStep, WorkerId); 4]>,
    /// Time spent queued, per dispatcher.
    pub queue_wait: SmallVec<[(DispatcherKind, Duration); 8]>,
    enqueued_at: Option<(DispatcherKind, Instant)>,
}

impl Default for PerPipPerformance {
    fn default() -> Self {
        Self {
            created_at: Instant::now(),
            step_durations: SmallVec::new(),
            worker_by_step: SmallVec::new(),
            queue_wait: SmallVec::new(),
            enqueued_at: None,
        }
    }
}

impl PerPipPerformance {
    /// Records that the runnable entered the queue for `kind`.
    pub fn note_enqueued(&mut self, kind: DispatcherKind) {
        self.enqueued_at = Some((kind, Instant::now()));
    }

    /// Records that the runnable left its queue and starts executing.
    pub fn note_dequeued(&mut self) {
        if let Some((kind, at)) = self.enqueued_at.take() {
            self.queue_wait.push((kind, at.elapsed()));
        }
    }

    /// Records one executed step.
    pub fn record_step(
        &mut self,
        step: PipExecutionStep,
        elapsed: Duration,
        worker: Option<WorkerId>,
    ) {
        self.step_durations.push((step, elapsed));
        if let Some(worker) = worker {
            self.worker_by_step.push((step, worker));
        }
    }

    /// Total wall-clock time spent in `step` across attempts.
    #[must_use]
    pub fn step_duration(&self, step: PipExecutionStep) -> Duration {
        self.step_durations
            .iter()
            .filter(|(s, _)| *s == step)
            .map(|(_, d)| *d)
            .sum()
    }
}

/// Remaining retry budgets, decremented as retries happen.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudgets {
    /// Retries left after memory-pressure cancellations.
    pub low_memory: u32,
    /// Retries left after prep or VM failures.
    pub retryable: u32,
    /// Reassignments left after remote workers detached.
    pub stopped_worker: u32,
}

/// The mutable execution record of one pip.
pub struct RunnablePip {
    /// The pip being driven.
    pub pip_id: PipId,
    /// Kind of the pip.
    pub pip_type: PipType,
    /// Effective priority word.
    pub priority: i32,
    /// Current state-machine position.
    pub step: PipExecutionStep,
    /// Queue the runnable was last dispatched from.
    pub dispatcher_kind: DispatcherKind,
    /// Worker holding a slot for this pip, when one is acquired.
    pub worker: Option<WorkerId>,
    /// The slot kind held on `worker`, when one is acquired.
    pub held_slot: Option<SlotKind>,
    /// Worker preferred by module affinity.
    pub preferred_worker_id: Option<WorkerId>,
    /// Module of the pip, for affinity.
    pub module: Option<ModuleId>,
    /// Set when build termination reached the pip.
    pub is_cancelled: bool,
    /// Execution or replay result, set after execute or cache replay.
    pub execution_result: Option<ExecutionResult>,
    /// Cache hit carried from lookup to replay.
    pub cache_hit: Option<CacheHit>,
    /// Whether the cache was consulted and missed.
    pub had_cache_miss: bool,
    /// Hashed source dependencies, carried from `Start`.
    pub source_hashes: Option<SourceHashes>,
    /// Set when incremental state proved the pip clean and materialized.
    pub up_to_date: bool,
    /// Failure carried to `HandleResult`.
    pub failure: Option<StepError>,
    /// Expected memory of the next attempt; revised on retry.
    pub expected_memory: MemoryCounters,
    /// Expected wall-clock milliseconds, from the historical table.
    pub expected_duration_ms: u32,
    /// Remaining retry budgets.
    pub retries: RetryBudgets,
    /// Declared semaphore requirements, held from CPU dispatch to release.
    pub semaphores: Vec<SemaphoreRequirement>,
    /// Whether the semaphores are currently held.
    pub semaphores_held: bool,
    /// Whether this record replays a determinism probe after a cache hit.
    pub probe_active: bool,
    /// Whether this record is a background output materialization.
    pub is_background_materialization: bool,
    /// Per-step timings and placement.
    pub performance: PerPipPerformance,
}

impl RunnablePip {
    /// Creates the record for a pip entering the state machine.
    #[must_use]
    pub fn new(pip_id: PipId, pip_type: PipType, priority: i32, retries: RetryBudgets) -> Self {
        Self {
            pip_id,
            pip_type,
            priority,
            step: PipExecutionStep::Start,
            dispatcher_kind: DispatcherKind::None,
            worker: None,
            held_slot: None,
            preferred_worker_id: None,
            module: None,
            is_cancelled: false,
            execution_result: None,
            cache_hit: None,
            had_cache_miss: false,
            source_hashes: None,
            up_to_date: false,
            failure: None,
            expected_memory: MemoryCounters::default(),
            expected_duration_ms: 0,
            retries,
            semaphores: Vec::new(),
            semaphores_held: false,
            probe_active: false,
            is_background_materialization: false,
            performance: PerPipPerformance::default(),
        }
    }

    /// Creates a background materialization record for a completed pip.
    #[must_use]
    pub fn background_materialization(
        pip_id: PipId,
        pip_type: PipType,
        result: ExecutionResult,
        worker: Option<WorkerId>,
    ) -> Self {
        let mut runnable = Self::new(
            pip_id,
            pip_type,
            BACKGROUND_PRIORITY,
            RetryBudgets {
                low_memory: 0,
                retryable: 0,
                stopped_worker: 0,
            },
        );
        runnable.step = PipExecutionStep::MaterializeOutputs;
        runnable.execution_result = Some(result);
        runnable.worker = worker;
        runnable.is_background_materialization = true;
        runnable
    }

    /// The effective queue priority, honoring the IPC floor.
    ///
    /// IPC pips entering worker selection outrank every packed priority
    /// word within that queue; the stored priority word is untouched.
    #[must_use]
    pub fn queue_priority(&self) -> i64 {
        if self.pip_type == PipType::Ipc && self.step == PipExecutionStep::ChooseWorkerCpu {
            i64::from(i32::MAX)
        } else {
            i64::from(self.priority)
        }
    }

    /// Records a failure to be surfaced by `HandleResult`. The first
    /// failure wins.
    pub fn record_failure(&mut self, error: StepError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets() -> RetryBudgets {
        RetryBudgets {
            low_memory: 2,
            retryable: 3,
            stopped_worker: 1,
        }
    }

    #[test]
    fn ipc_priority_floor_applies_only_at_choose_worker() {
        let mut runnable = RunnablePip::new(PipId::from_index(1), PipType::Ipc, 42, budgets());
        assert_eq!(runnable.queue_priority(), 42);
        runnable.step = PipExecutionStep::ChooseWorkerCpu;
        assert_eq!(runnable.queue_priority(), i64::from(i32::MAX));

        let mut process = RunnablePip::new(PipId::from_index(2), PipType::Process, 42, budgets());
        process.step = PipExecutionStep::ChooseWorkerCpu;
        assert_eq!(process.queue_priority(), 42);
    }

    #[test]
    fn first_recorded_failure_wins() {
        let mut runnable = RunnablePip::new(PipId::from_index(1), PipType::Process, 0, budgets());
        runnable.record_failure(StepError::Canceled {
            pip: PipId::from_index(1),
        });
        runnable.record_failure(StepError::ExecutionFailed {
            pip: PipId::from_index(1),
            exit_code: Some(1),
        });
        assert!(matches!(runnable.failure, Some(StepError::Canceled { .. })));
    }

    #[test]
    fn background_record_starts_at_materialize_outputs() {
        let runnable = RunnablePip::background_materialization(
            PipId::from_index(3),
            PipType::Process,
            buildflow_api::ExecutionResult::empty_success(),
            Some(0),
        );
        assert_eq!(runnable.step, PipExecutionStep::MaterializeOutputs);
        assert_eq!(runnable.priority, BACKGROUND_PRIORITY);
        assert!(runnable.is_background_materialization);
    }

    #[test]
    fn queue_wait_is_attributed_to_the_dispatcher() {
        let mut perf = PerPipPerformance::default();
        perf.note_enqueued(DispatcherKind::CacheLookup);
        perf.note_dequeued();
        assert_eq!(perf.queue_wait.len(), 1);
        assert_eq!(perf.queue_wait[0].0, DispatcherKind::CacheLookup);
        // A dequeue without a pending enqueue records nothing.
        perf.note_dequeued();
        assert_eq!(perf.queue_wait.len(), 1);
    }
}
