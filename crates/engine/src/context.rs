// SPDX-License-Identifier: Apache-2.0

//! Shared scheduler state.
//!
//! `SchedulerCore` is the single bundle of state passed by reference to the
//! drain loop, step bodies, timers, and the resource manager. There are no
//! process-wide singletons; subcomponents hold a non-owning `Arc` to this
//! core and never a back-reference to the façade.

use crate::driver::DagDriver;
use crate::runnable::{RetryBudgets, RunnablePip};
use crate::services::ServicePipManager;
use crate::steps::PipExecutionStep;
use buildflow_api::{
    ExecutionLogMultiplexer, FileChangeTracker, ContentCache, FileContentManager,
    HistoricalPerfInfo, IncrementalSchedulingState, IpcProvider, PerformanceCollector,
    ProcessRunner, RunningProcessRegistry,
};
use buildflow_config::SchedulerConfig;
use buildflow_graph::{PipGraph, PipId};
use buildflow_queue::{DispatchQueueSet, DispatcherKind, EnqueueError, IoQueueMonitor};
use buildflow_telemetry::{
    CounterRegistry, CriticalPathStats, PipStateCounters, UnresponsivenessTracker,
};
use buildflow_workers::{CacheLookupWorkerSelector, CpuWorkerSelector, WorkerPool};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// The collaborator implementations injected at construction.
pub struct Collaborators {
    /// Content-addressed cache.
    pub cache: Arc<dyn ContentCache>,
    /// File content manager.
    pub files: Arc<dyn FileContentManager>,
    /// Sandboxed process runner.
    pub runner: Arc<dyn ProcessRunner>,
    /// Incremental scheduling state, when incremental builds are on.
    pub incremental: Option<Arc<dyn IncrementalSchedulingState>>,
    /// File-change tracker, when tracking is on.
    pub change_tracker: Option<Arc<dyn FileChangeTracker>>,
    /// Historical per-pip performance table.
    pub historic: Arc<dyn HistoricalPerfInfo>,
    /// Execution log sinks.
    pub execution_log: Arc<ExecutionLogMultiplexer>,
    /// IPC provider for inter-process call pips.
    pub ipc: Option<Arc<dyn IpcProvider>>,
    /// OS performance counter collector.
    pub collector: Arc<dyn PerformanceCollector>,
}

/// Signals build completion to `when_done`.
#[derive(Default)]
pub(crate) struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub(crate) fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.condvar.wait(&mut done);
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

/// State shared by the drain loop, step bodies, and timers.
pub(crate) struct SchedulerCore {
    pub(crate) graph: Arc<dyn PipGraph>,
    pub(crate) config: SchedulerConfig,
    pub(crate) infos: Arc<crate::runtime_info::RuntimeInfoTable>,
    pub(crate) queues: Arc<DispatchQueueSet<Box<RunnablePip>>>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) cpu_selector: CpuWorkerSelector,
    pub(crate) cache_selector: CacheLookupWorkerSelector,
    pub(crate) counters: CounterRegistry,
    pub(crate) state_counters: PipStateCounters,
    pub(crate) critical_path: CriticalPathStats,
    pub(crate) collaborators: Collaborators,
    pub(crate) running_processes: RunningProcessRegistry,
    pub(crate) services: ServicePipManager,
    pub(crate) driver: DagDriver,
    pub(crate) io_monitor: IoQueueMonitor,
    pub(crate) unresponsiveness: Mutex<UnresponsivenessTracker>,
    pub(crate) terminating: AtomicBool,
    pub(crate) has_failures: AtomicBool,
    /// Scheduled non-held-back pips not yet terminal.
    pub(crate) outstanding: AtomicUsize,
    pub(crate) completion: CompletionSignal,
    pub(crate) started_at: Instant,
    /// Wakes steps parked mid-step on an activity slot (materialize-input,
    /// post-process). `notify_one` stores a permit, so a release between a
    /// failed acquire and the wait is never lost.
    pub(crate) slot_released: tokio::sync::Notify,
    /// Choose-worker runnables waiting for a slot-released notification.
    blocked_choose_cpu: Mutex<Vec<Box<RunnablePip>>>,
    blocked_choose_cache_lookup: Mutex<Vec<Box<RunnablePip>>>,
}

impl SchedulerCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        graph: Arc<dyn PipGraph>,
        config: SchedulerConfig,
        infos: Arc<crate::runtime_info::RuntimeInfoTable>,
        queues: Arc<DispatchQueueSet<Box<RunnablePip>>>,
        pool: Arc<WorkerPool>,
        collaborators: Collaborators,
        driver: DagDriver,
        state_counters: PipStateCounters,
    ) -> Self {
        let cpu_selector =
            CpuWorkerSelector::new(Arc::clone(&pool), config.features.module_affinity_enabled);
        let cache_selector = CacheLookupWorkerSelector::new(Arc::clone(&pool));
        let io_monitor = IoQueueMonitor::new(1, config.queues.io.saturating_mul(4).max(1));
        let unresponsiveness =
            Mutex::new(UnresponsivenessTracker::new(config.resources.status_interval));
        Self {
            graph,
            config,
            infos,
            queues,
            pool,
            cpu_selector,
            cache_selector,
            counters: CounterRegistry::new(),
            state_counters,
            critical_path: CriticalPathStats::new(),
            collaborators,
            running_processes: RunningProcessRegistry::new(),
            services: ServicePipManager::new(),
            driver,
            io_monitor,
            unresponsiveness,
            terminating: AtomicBool::new(false),
            has_failures: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            completion: CompletionSignal::default(),
            started_at: Instant::now(),
            slot_released: tokio::sync::Notify::new(),
            blocked_choose_cpu: Mutex::new(Vec::new()),
            blocked_choose_cache_lookup: Mutex::new(Vec::new()),
        }
    }

    /// Whether the build is terminating.
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Flags the build as terminating; optionally cancels the queues.
    pub(crate) fn request_termination(&self, cancel_queue: bool) {
        if !self.terminating.swap(true, Ordering::SeqCst) {
            tracing::info!(name: "scheduler.terminating", cancel_queue = cancel_queue);
        }
        if cancel_queue {
            self.queues.cancel();
        }
    }

    /// Records a terminal failure; under stop-on-first-error the first one
    /// also flips the terminating flag.
    pub(crate) fn note_failure(&self, background: bool) {
        self.has_failures.store(true, Ordering::SeqCst);
        if !background && self.config.features.stop_on_first_error {
            self.request_termination(false);
        }
    }

    /// Whether any pip failed terminally.
    pub(crate) fn has_failures(&self) -> bool {
        self.has_failures.load(Ordering::SeqCst)
    }

    /// Builds the execution record for a pip that just became runnable.
    pub(crate) fn create_runnable(&self, pip: PipId) -> Box<RunnablePip> {
        let info = self.infos.get(pip);
        let pip_type = self.graph.pip_type(pip);
        let payload = self.graph.hydrate_pip(pip);
        let mut runnable = Box::new(RunnablePip::new(
            pip,
            pip_type,
            info.priority(),
            RetryBudgets {
                low_memory: self.config.retries.max_retries_due_to_low_memory,
                retryable: self.config.retries.max_retries_due_to_retryable_failures,
                stopped_worker: self.config.retries.num_retry_failed_pips_on_another_worker,
            },
        ));
        runnable.module = payload.module;
        runnable.semaphores = payload.semaphores.clone();
        runnable.expected_duration_ms = self
            .collaborators
            .historic
            .estimated_duration_ms(pip)
            .unwrap_or_else(|| info.critical_path_ms().max(0) as u32);
        runnable.expected_memory = self
            .collaborators
            .historic
            .expected_memory(pip)
            .unwrap_or_default();
        runnable
    }

    /// Enqueues a runnable into the queue its current step belongs to.
    ///
    /// Semaphore requirements are handed to the queue set the first time the
    /// pip enters CPU worker selection and held until completion.
    pub(crate) fn enqueue_runnable(&self, mut runnable: Box<RunnablePip>) {
        let kind = runnable.step.dispatcher_kind(runnable.pip_type);
        debug_assert!(kind != DispatcherKind::None, "inline steps are not enqueued");

        let requirements = if kind == DispatcherKind::ChooseWorkerCpu
            && !runnable.semaphores_held
            && !runnable.semaphores.is_empty()
        {
            runnable.semaphores_held = true;
            runnable.semaphores.clone()
        } else {
            Vec::new()
        };

        let priority = runnable.queue_priority();
        runnable.performance.note_enqueued(kind);
        if let Err(EnqueueError::Cancelled(_dropped)) =
            self.queues.enqueue(kind, priority, &requirements, runnable)
        {
            // The cancel sweep finalizes every non-terminal pip.
        }
    }

    /// Parks a choose-worker runnable until a slot-released notification.
    pub(crate) fn park_blocked(&self, runnable: Box<RunnablePip>) {
        debug_assert!(matches!(
            runnable.step,
            PipExecutionStep::ChooseWorkerCpu | PipExecutionStep::ChooseWorkerCacheLookup
        ));
        if runnable.step == PipExecutionStep::ChooseWorkerCpu {
            self.blocked_choose_cpu.lock().push(runnable);
        } else {
            self.blocked_choose_cache_lookup.lock().push(runnable);
        }
    }

    /// Re-admits parked choose-worker runnables after a slot release, a
    /// worker attach, or a memory-pressure change.
    pub(crate) fn notify_worker_available(&self) {
        let cpu: Vec<_> = std::mem::take(&mut *self.blocked_choose_cpu.lock());
        let cache: Vec<_> = std::mem::take(&mut *self.blocked_choose_cache_lookup.lock());
        for runnable in cpu.into_iter().chain(cache) {
            self.enqueue_runnable(runnable);
        }
    }

    /// Number of parked choose-worker runnables.
    pub(crate) fn blocked_count(&self) -> usize {
        self.blocked_choose_cpu.lock().len() + self.blocked_choose_cache_lookup.lock().len()
    }

    /// Records the terminal completion of a non-held-back scheduled pip.
    pub(crate) fn note_pip_finished(&self) {
        let remaining = self.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.completion.signal();
        }
    }

    /// Moves a pip whose refcount reached zero into the state machine.
    ///
    /// `skip` routes the pip straight to the Skip step instead of Start.
    pub(crate) fn schedule_pip(&self, pip: PipId, skip: bool) {
        use buildflow_api::PipState;
        let info = self.infos.get(pip);
        let pip_type = self.graph.pip_type(pip);
        if info.try_transition(PipState::Waiting, PipState::Ready) {
            self.state_counters
                .transition(pip_type, PipState::Waiting, PipState::Ready);
        }
        let mut runnable = self.create_runnable(pip);
        if skip {
            runnable.step = PipExecutionStep::Skip;
        }
        self.enqueue_runnable(runnable);
    }
}
