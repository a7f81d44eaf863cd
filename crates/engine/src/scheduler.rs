// SPDX-License-Identifier: Apache-2.0

//! The scheduler façade.
//!
//! Lifecycle: `new` → optional `enable_distribution` → `init_for_master` or
//! `init_for_worker` → `start` → `when_done` (blocking) → `log_stats` /
//! `save_file_change_tracker` → `dispose` (idempotent).
//!
//! `start` spawns the dedicated drain thread (a single-threaded runtime on
//! its own OS thread) and the status timer. Pip step execution runs on a
//! multi-threaded step runtime owned by the scheduler.

use crate::context::{Collaborators, SchedulerCore};
use crate::driver::{DagDriver, InitialSchedule};
use crate::error::Error;
use crate::resource::ResourceManager;
use crate::runner::PipRunner;
use crate::runtime_info::RuntimeInfoTable;
use buildflow_api::{ExecutionLogEvent, PipResultStatus, PipState, StatusEvent, WorkerTransport};
use buildflow_config::SchedulerConfig;
use buildflow_graph::{PipGraph, PipId};
use buildflow_queue::{DispatchQueueSet, DispatcherKind, DrainOutcome};
use buildflow_telemetry::{PipStateCounters, SchedulerCounter, SchedulerPerformanceInfo};
use buildflow_workers::{LocalWorker, SlotTotals, WorkerPool};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const IDLE_POLL: Duration = Duration::from_millis(10);

/// A cloneable handle that can terminate the build from any thread.
#[derive(Clone)]
pub struct TerminationHandle {
    core: Arc<SchedulerCore>,
}

impl TerminationHandle {
    /// Requests build termination with queue cancellation.
    pub fn request_termination(&self) {
        self.core.request_termination(true);
    }
}

/// The execution core of the build scheduler.
pub struct Scheduler {
    graph: Arc<dyn PipGraph>,
    config: SchedulerConfig,
    collaborators: Option<Collaborators>,
    transports: Vec<Arc<dyn WorkerTransport>>,
    core: Option<Arc<SchedulerCore>>,
    schedule: Option<InitialSchedule>,
    step_runtime: Option<tokio::runtime::Runtime>,
    drain_thread: Option<std::thread::JoinHandle<()>>,
    cancel: CancellationToken,
    started: bool,
    disposed: bool,
}

impl Scheduler {
    /// Creates a scheduler over `graph` with the given collaborators.
    pub fn new(
        graph: Arc<dyn PipGraph>,
        config: SchedulerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            graph,
            config,
            collaborators: Some(collaborators),
            transports: Vec::new(),
            core: None,
            schedule: None,
            step_runtime: None,
            drain_thread: None,
            cancel: CancellationToken::new(),
            started: false,
            disposed: false,
        })
    }

    /// Registers remote worker transports. Must precede initialization.
    pub fn enable_distribution(
        &mut self,
        transports: Vec<Arc<dyn WorkerTransport>>,
    ) -> Result<(), Error> {
        if self.core.is_some() {
            return Err(Error::LifecycleError {
                message: "enable_distribution must be called before init".to_owned(),
            });
        }
        self.transports = transports;
        Ok(())
    }

    /// Initializes the master-side scheduler: computes the scheduled set and
    /// priorities, and seeds the ready pips.
    pub fn init_for_master(&mut self, filter: &[PipId]) -> Result<(), Error> {
        let collaborators = self.take_collaborators()?;

        let infos = Arc::new(RuntimeInfoTable::new(self.graph.node_count()));
        let state_counters = PipStateCounters::new();
        let mut driver = DagDriver::new(Arc::clone(&self.graph), Arc::clone(&infos));
        let schedule = driver.initialize(filter, collaborators.historic.as_ref(), &state_counters);

        self.finish_init(collaborators, infos, driver, state_counters, schedule)
    }

    /// Initializes a worker-side scheduler: no filtering or priority pass;
    /// the master drives execution through the transport surface.
    pub fn init_for_worker(&mut self) -> Result<(), Error> {
        let collaborators = self.take_collaborators()?;

        let infos = Arc::new(RuntimeInfoTable::new(self.graph.node_count()));
        let state_counters = PipStateCounters::new();
        let driver = DagDriver::new(Arc::clone(&self.graph), Arc::clone(&infos));
        let schedule = InitialSchedule {
            ready: Vec::new(),
            held_back: Vec::new(),
            outstanding: 0,
        };

        self.finish_init(collaborators, infos, driver, state_counters, schedule)
    }

    fn take_collaborators(&mut self) -> Result<Collaborators, Error> {
        if self.core.is_some() {
            return Err(Error::LifecycleError {
                message: "scheduler already initialized".to_owned(),
            });
        }
        self.collaborators.take().ok_or_else(|| Error::LifecycleError {
            message: "collaborators already consumed".to_owned(),
        })
    }

    fn finish_init(
        &mut self,
        collaborators: Collaborators,
        infos: Arc<RuntimeInfoTable>,
        driver: DagDriver,
        state_counters: PipStateCounters,
        schedule: InitialSchedule,
    ) -> Result<(), Error> {
        let queues = Arc::new(DispatchQueueSet::new(|kind| self.queue_degree(kind)));

        let sample = collaborators.collector.sample();
        let local = LocalWorker::new(
            SlotTotals::balanced(self.config.queues.cpu),
            sample.ram_total_mb,
            sample.commit_total_mb,
        );
        let mut pool = WorkerPool::new(local);
        for transport in &self.transports {
            let _ = pool.add_remote(Arc::clone(transport));
        }

        let core = Arc::new(SchedulerCore::new(
            Arc::clone(&self.graph),
            self.config.clone(),
            infos,
            queues,
            Arc::new(pool),
            collaborators,
            driver,
            state_counters,
        ));
        core.outstanding.store(schedule.outstanding, Ordering::SeqCst);

        tracing::info!(
            name: "scheduler.initialized",
            scheduled = schedule.outstanding,
            ready = schedule.ready.len(),
            workers = core.pool.len(),
        );
        self.core = Some(core);
        self.schedule = Some(schedule);
        Ok(())
    }

    fn queue_degree(&self, kind: DispatcherKind) -> u32 {
        let queues = &self.config.queues;
        match kind {
            DispatcherKind::None => 1,
            DispatcherKind::IO => queues.io,
            DispatcherKind::CPU => queues.cpu,
            DispatcherKind::Light => queues.light,
            DispatcherKind::Materialize => queues.materialize,
            DispatcherKind::CacheLookup => queues.cache_lookup,
            DispatcherKind::ChooseWorkerCacheLookup => queues.choose_worker_cache_lookup,
            DispatcherKind::ChooseWorkerCpu => queues.choose_worker_cpu,
            DispatcherKind::DelayedCacheLookup => queues.delayed_cache_lookup,
            DispatcherKind::SealDirs => queues.seal_dirs,
        }
    }

    /// Starts the drain thread and the status timer.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::LifecycleError {
                message: "scheduler already started".to_owned(),
            });
        }
        let core = Arc::clone(self.core.as_ref().ok_or_else(|| Error::LifecycleError {
            message: "start requires init_for_master or init_for_worker".to_owned(),
        })?);
        let schedule = self.schedule.as_ref().ok_or_else(|| Error::LifecycleError {
            message: "start requires an initialized schedule".to_owned(),
        })?;

        let step_runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("bf-step")
            .build()
            .map_err(|source| Error::ThreadSpawnError {
                thread_name: "bf-step".to_owned(),
                source,
            })?;

        self.attach_workers(&step_runtime, &core)?;

        // Seed the ready set before the drain loop observes the queues.
        for pip in &schedule.ready {
            core.schedule_pip(*pip, false);
        }
        if core.outstanding.load(Ordering::SeqCst) == 0 {
            core.completion.signal();
        }

        self.spawn_status_timer(&step_runtime, &core);
        self.spawn_drain_thread(&step_runtime, &core)?;

        self.step_runtime = Some(step_runtime);
        self.started = true;
        tracing::info!(name: "scheduler.started", "");
        Ok(())
    }

    /// Attaches the local worker and all remote transports, enforcing the
    /// minimum-worker requirement within the attach timeout.
    fn attach_workers(
        &self,
        step_runtime: &tokio::runtime::Runtime,
        core: &Arc<SchedulerCore>,
    ) -> Result<(), Error> {
        if let buildflow_workers::Worker::Local(local) = core.pool.local().as_ref() {
            local.attach()?;
            core.pool.note_worker_available();
        }

        let timeout = self.config.distribution.attach_timeout;
        let oversubscription = self.config.distribution.remote_cache_lookup_oversubscription;
        let attach_results: Vec<bool> = step_runtime.block_on(async {
            let attaches = core.pool.iter().filter_map(|worker| {
                worker.as_remote().map(|remote| async move {
                    match tokio::time::timeout(timeout, remote.attach(oversubscription)).await {
                        Ok(Ok(())) => true,
                        Ok(Err(error)) => {
                            tracing::warn!(name: "worker.attach_failed", error = %error);
                            false
                        }
                        Err(_) => {
                            tracing::warn!(name: "worker.attach_timeout", "");
                            false
                        }
                    }
                })
            });
            futures::future::join_all(attaches).await
        });
        for _ in attach_results.iter().filter(|a| **a) {
            core.pool.note_worker_available();
        }

        let attached = core.pool.ever_available_count();
        core.counters
            .record_max(SchedulerCounter::EverAvailableWorkerCount, u64::from(attached));
        if attached < self.config.distribution.minimum_workers {
            return Err(Error::MinimumWorkersNotSatisfied {
                attached,
                required: self.config.distribution.minimum_workers,
                timeout_secs: timeout.as_secs(),
            });
        }
        Ok(())
    }

    /// The dedicated drain thread: a single-threaded runtime owning queue
    /// iteration, submitting each dequeued step to the step runtime.
    fn spawn_drain_thread(
        &mut self,
        step_runtime: &tokio::runtime::Runtime,
        core: &Arc<SchedulerCore>,
    ) -> Result<(), Error> {
        let core = Arc::clone(core);
        let steps = step_runtime.handle().clone();
        let cancel = self.cancel.clone();

        let handle = std::thread::Builder::new()
            .name("bf-drain".to_owned())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(error) => {
                        tracing::error!(name: "drain.runtime_failed", error = %error);
                        return;
                    }
                };
                rt.block_on(drain_loop(core, steps, cancel));
            })
            .map_err(|source| Error::ThreadSpawnError {
                thread_name: "bf-drain".to_owned(),
                source,
            })?;
        self.drain_thread = Some(handle);
        Ok(())
    }

    fn spawn_status_timer(&self, step_runtime: &tokio::runtime::Runtime, core: &Arc<SchedulerCore>) {
        let core = Arc::clone(core);
        let cancel = self.cancel.clone();
        let release_enabled = self.config.features.early_worker_release;
        let release_multiplier = self.config.features.early_worker_release_multiplier;
        let adaptive_io = self.config.queues.adaptive_io;
        let period = self.config.resources.status_interval;

        let _ = step_runtime.spawn(async move {
            let resource_manager = ResourceManager::new();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let factor = core.unresponsiveness.lock().tick(Instant::now());
                resource_manager.tick(&core);
                // Re-admit parked choose-worker runnables that lost the race
                // between a failed selection and the slot-released wakeup.
                if core.blocked_count() > 0 {
                    core.notify_worker_available();
                }
                if adaptive_io {
                    let _ = core.io_monitor.adjust(&core.queues);
                }
                if release_enabled {
                    release_idle_remote(&core, release_multiplier).await;
                }
                report_status(&core, factor);
            }
        });
    }

    /// Blocks until the build drains, then tears everything down.
    ///
    /// Returns true when no pip failed.
    pub fn when_done(&mut self) -> bool {
        let Some(core) = self.core.as_ref().map(Arc::clone) else {
            return true;
        };
        if !self.started {
            // Cancellation before start is a clean no-op shutdown.
            return !core.has_failures();
        }

        // Wait for all scheduled pips to reach a terminal state. When the
        // queues were cancelled, queued work was dropped: wait for in-flight
        // steps, then sweep the remainder to Canceled.
        loop {
            if core.completion.is_done() {
                break;
            }
            if core.queues.is_cancelled() && core.queues.stats().total_running() == 0 {
                sweep_cancelled(&core);
            }
            std::thread::sleep(IDLE_POLL);
        }
        core.completion.wait();

        if let Some(step_runtime) = self.step_runtime.as_ref() {
            step_runtime.block_on(async {
                // Background output materializations finish before teardown.
                while !(core.queues.is_idle() || core.queues.is_cancelled()) {
                    tokio::time::sleep(IDLE_POLL).await;
                }

                core.services.shutdown_all(&core).await;
                finalize_unstarted_services(&core, self.schedule.as_ref());

                for worker in core.pool.iter() {
                    if let Some(remote) = worker.as_remote() {
                        if worker.common().is_running() {
                            if let Err(error) = remote.finish().await {
                                tracing::warn!(name: "worker.finish_failed", error = %error);
                            }
                        }
                    }
                }

                core.collaborators.execution_log.flush_all();
                if let Err(error) = core.collaborators.cache.close().await {
                    tracing::warn!(name: "cache.close_failed", error = %error);
                }
                if let Some(ipc) = &core.collaborators.ipc {
                    ipc.stop();
                }
            });
        }

        self.cancel.cancel();
        core.queues.cancel();
        if let Some(handle) = self.drain_thread.take() {
            if handle.join().is_err() {
                tracing::error!(name: "drain.thread_panicked", "");
            }
        }

        let success = !core.has_failures();
        tracing::info!(name: "scheduler.done", success = success);
        success
    }

    /// Requests build termination: cooperative per-pip cancel plus queue
    /// cancellation.
    pub fn request_termination(&self) {
        if let Some(core) = &self.core {
            core.request_termination(true);
        }
    }

    /// A handle for requesting termination from another thread, e.g. a
    /// signal handler. Available once the scheduler is initialized.
    #[must_use]
    pub fn termination_handle(&self) -> Option<TerminationHandle> {
        self.core.as_ref().map(|core| TerminationHandle {
            core: Arc::clone(core),
        })
    }

    /// Persists the file-change tracker and incremental state under `dir`.
    pub fn save_file_change_tracker(&self, dir: &Path) -> Result<(), Error> {
        let core = self.core.as_ref().ok_or_else(|| Error::LifecycleError {
            message: "save requires an initialized scheduler".to_owned(),
        })?;
        if let Some(tracker) = &core.collaborators.change_tracker {
            tracker.save(&dir.join("file_change_tracker.json"))?;
        }
        if let Some(incremental) = &core.collaborators.incremental {
            incremental.save(&dir.join("incremental_state.json"))?;
        }
        Ok(())
    }

    /// Final stats surface.
    #[must_use]
    pub fn log_stats(&self) -> SchedulerPerformanceInfo {
        let Some(core) = &self.core else {
            return SchedulerPerformanceInfo {
                success: true,
                duration_ms: 0,
                counters: Vec::new(),
                critical_path_ms: 0,
                critical_path_tail: None,
                critical_path_estimate_hits: 0,
                critical_path_wild_guesses: 0,
            };
        };
        core.counters.record_max(
            SchedulerCounter::EverAvailableWorkerCount,
            u64::from(core.pool.ever_available_count()),
        );
        let info = SchedulerPerformanceInfo {
            success: !core.has_failures(),
            duration_ms: core.started_at.elapsed().as_millis() as u64,
            counters: core
                .counters
                .snapshot()
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value))
                .collect(),
            critical_path_ms: core.critical_path.longest_path_ms(),
            critical_path_tail: core.critical_path.tail_pip().map(|p| p.index() as u32),
            critical_path_estimate_hits: core.critical_path.num_hits(),
            critical_path_wild_guesses: core.critical_path.num_wild_guesses(),
        };
        tracing::info!(
            name: "scheduler.stats",
            success = info.success,
            duration_ms = info.duration_ms,
            critical_path_ms = info.critical_path_ms,
        );
        info
    }

    /// Tears down timers and runtimes. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.cancel.cancel();
        if let Some(core) = &self.core {
            core.queues.cancel();
        }
        if let Some(handle) = self.drain_thread.take() {
            let _ = handle.join();
        }
        if let Some(step_runtime) = self.step_runtime.take() {
            step_runtime.shutdown_background();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The drain loop: one dedicated consumer over all queues.
async fn drain_loop(
    core: Arc<SchedulerCore>,
    steps: tokio::runtime::Handle,
    cancel: CancellationToken,
) {
    let runner = Arc::new(PipRunner::new(Arc::clone(&core)));
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match core.queues.drain_next() {
            DrainOutcome::Item { kind, item } => {
                let runner = Arc::clone(&runner);
                let _ = steps.spawn(async move {
                    runner.process(item, kind).await;
                });
            }
            DrainOutcome::Empty => {
                tokio::select! {
                    () = core.queues.wait_for_change() => {}
                    () = cancel.cancelled() => break,
                }
            }
            DrainOutcome::Cancelled => break,
        }
    }
    tracing::debug!(name: "drain.exited", "");
}

/// Transitions every remaining non-terminal scheduled pip to Canceled after
/// the queues were cancelled and in-flight steps finished.
fn sweep_cancelled(core: &Arc<SchedulerCore>) {
    for (pip, info) in core.infos.iter() {
        if !core.driver.is_scheduled(pip) || core.driver.is_held_back(pip) {
            continue;
        }
        if info.is_terminal() {
            continue;
        }
        let previous = info.state();
        if info.transition_to_terminal(PipState::Canceled, PipResultStatus::Canceled) {
            core.state_counters
                .transition(core.graph.pip_type(pip), previous, PipState::Canceled);
            core.counters.increment(SchedulerCounter::PipsCanceled);
            core.note_pip_finished();
        }
    }
}

/// Completes service pips that were scheduled but never started.
fn finalize_unstarted_services(core: &Arc<SchedulerCore>, schedule: Option<&InitialSchedule>) {
    let Some(schedule) = schedule else { return };
    for pip in &schedule.held_back {
        let info = core.infos.get(*pip);
        if info.is_terminal() {
            continue;
        }
        let previous = info.state();
        if info.transition_to_terminal(PipState::Done, PipResultStatus::NotRun) {
            core.state_counters
                .transition(core.graph.pip_type(*pip), previous, PipState::Done);
        }
    }
}

/// Releases the least-loaded remote when queued work fits without it.
async fn release_idle_remote(core: &Arc<SchedulerCore>, multiplier: f64) {
    let stats = core.queues.stats();
    let queued_process_work = stats.queued(DispatcherKind::CPU)
        + stats.queued(DispatcherKind::ChooseWorkerCpu)
        + core.blocked_count();
    let Some(candidate) = core
        .pool
        .early_release_candidate(queued_process_work, multiplier)
    else {
        return;
    };
    let Some(remote) = core.pool.get(candidate).and_then(|w| w.as_remote()) else {
        return;
    };
    tracing::info!(name: "worker.early_release", worker = candidate, queued = queued_process_work);
    if let Err(error) = remote.finish().await {
        tracing::warn!(name: "worker.early_release_failed", worker = candidate, error = %error);
    }
}

fn report_status(core: &Arc<SchedulerCore>, unresponsiveness_factor: f64) {
    let sample = core.collaborators.collector.sample();
    let stats = core.queues.stats();
    let active_pips = core.state_counters.count_in_state(PipState::Ready)
        + core.state_counters.count_in_state(PipState::Running);
    let running_processes = core.running_processes.len();
    let queued = stats.total_queued() + core.blocked_count();
    let limiting = format!("{:?}", core.cpu_selector.counters().limiting_resource());

    tracing::info!(
        name: "scheduler.status",
        active_pips = active_pips,
        running_processes = running_processes,
        queued = queued,
        ram_percent = sample.ram_percent(),
        commit_percent = sample.commit_percent(),
        limiting_resource = limiting,
    );
    core.collaborators
        .execution_log
        .log_event(ExecutionLogEvent::StatusReported(StatusEvent {
            elapsed_ms: core.started_at.elapsed().as_millis() as u64,
            running_pips: active_pips as usize,
            running_processes,
            queued,
            ram_percent: sample.ram_percent(),
            commit_percent: sample.commit_percent(),
            unresponsiveness_factor,
        }));
}
