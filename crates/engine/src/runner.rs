// SPDX-License-Identifier: Apache-2.0

//! The per-pip runner: executes one state-machine step at a time.
//!
//! Each step body is an `async fn` returning the next step explicitly;
//! retries are transitions, never unwound control flow. After a step, the
//! runner either inlines the next step on the current thread or hands the
//! runnable back to the dispatch queues, per the inlining policy in
//! [`crate::steps::should_inline`]. No scheduler lock is ever held across a
//! collaborator await.

use crate::context::SchedulerCore;
use crate::runnable::RunnablePip;
use crate::steps::{should_inline, PipExecutionStep};
use buildflow_api::{
    CancelReason, CollaboratorError, ExecutionLogEvent, ExecutionResult, ExecutionStatus,
    OutputOrigin, PipHistoricPerf, PipResultStatus, PipState, ProcessExecutionScope, RetryReason,
    SkipReason, StepError,
};
use buildflow_graph::{Pip, PipSpec, PipType};
use buildflow_queue::DispatcherKind;
use buildflow_telemetry::SchedulerCounter;
use buildflow_workers::{RunnableFacts, SlotKind, Worker, LOCAL_WORKER_ID};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay used to batch cache lookups in the delayed-lookup queue.
const CACHE_LOOKUP_BATCH_DELAY: Duration = Duration::from_millis(10);

enum StepOutcome {
    /// Move to the given step.
    Proceed(PipExecutionStep),
    /// No worker fits; park until a slot-released notification.
    Park,
}

/// Drives runnables through their execution steps.
pub(crate) struct PipRunner {
    core: Arc<SchedulerCore>,
}

impl PipRunner {
    pub(crate) fn new(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    /// Runs the dequeued runnable until it parks, re-enqueues, or finishes.
    pub(crate) async fn process(
        &self,
        mut runnable: Box<RunnablePip>,
        dequeued_from: DispatcherKind,
    ) {
        runnable.dispatcher_kind = dequeued_from;
        runnable.performance.note_dequeued();
        let held_queue = dequeued_from;

        loop {
            if self.should_cancel_pip(&runnable) {
                runnable.step = PipExecutionStep::Cancel;
            }

            let step = runnable.step;
            let step_started = Instant::now();
            let outcome = self.execute_step(&mut runnable).await;
            runnable
                .performance
                .record_step(step, step_started.elapsed(), runnable.worker);

            match outcome {
                StepOutcome::Proceed(PipExecutionStep::Done) => {
                    self.core.queues.complete(held_queue);
                    return;
                }
                StepOutcome::Proceed(next) => {
                    let next_kind = next.dispatcher_kind(runnable.pip_type);
                    let cancelling = matches!(
                        next,
                        PipExecutionStep::Cancel | PipExecutionStep::HandleResult
                    ) && runnable.is_cancelled;
                    let remote_bound = runnable
                        .worker
                        .is_some_and(|worker| worker != LOCAL_WORKER_ID);
                    runnable.step = next;
                    if should_inline(next_kind, held_queue, remote_bound, cancelling) {
                        continue;
                    }
                    self.core.queues.complete(held_queue);
                    self.core.enqueue_runnable(runnable);
                    return;
                }
                StepOutcome::Park => {
                    self.core.queues.complete(held_queue);
                    self.core.park_blocked(runnable);
                    return;
                }
            }
        }
    }

    /// Cooperative cancellation check at step boundaries.
    fn should_cancel_pip(&self, runnable: &RunnablePip) -> bool {
        self.core.is_terminating()
            && !runnable.is_background_materialization
            && !runnable.is_cancelled
            && !matches!(
                runnable.step,
                PipExecutionStep::Cancel
                    | PipExecutionStep::Skip
                    | PipExecutionStep::HandleResult
                    | PipExecutionStep::Done
            )
    }

    async fn execute_step(&self, runnable: &mut RunnablePip) -> StepOutcome {
        match runnable.step {
            PipExecutionStep::Start => self.step_start(runnable).await,
            PipExecutionStep::CheckIncrementalSkip => self.step_check_incremental(runnable),
            PipExecutionStep::DelayedCacheLookup => {
                tokio::time::sleep(CACHE_LOOKUP_BATCH_DELAY).await;
                StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCacheLookup)
            }
            PipExecutionStep::ChooseWorkerCacheLookup => self.step_choose_worker_cache(runnable),
            PipExecutionStep::CacheLookup => self.step_cache_lookup(runnable).await,
            PipExecutionStep::RunFromCache => self.step_run_from_cache(runnable).await,
            PipExecutionStep::ChooseWorkerCpu => self.step_choose_worker_cpu(runnable).await,
            PipExecutionStep::MaterializeInputs => self.step_materialize_inputs(runnable).await,
            PipExecutionStep::ExecuteProcess => self.step_execute_process(runnable).await,
            PipExecutionStep::ExecuteNonProcessPip => self.step_execute_non_process(runnable).await,
            PipExecutionStep::PostProcess => self.step_post_process(runnable).await,
            PipExecutionStep::MaterializeOutputs => self.step_materialize_outputs(runnable).await,
            PipExecutionStep::HandleResult => self.step_handle_result(runnable),
            PipExecutionStep::Cancel => self.step_cancel(runnable),
            PipExecutionStep::Skip => self.step_skip(runnable),
            PipExecutionStep::None | PipExecutionStep::Done => {
                StepOutcome::Proceed(PipExecutionStep::Done)
            }
        }
    }

    async fn step_start(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let info = self.core.infos.get(runnable.pip_id);
        if info.try_transition(PipState::Ready, PipState::Running) {
            self.core.state_counters.transition(
                runnable.pip_type,
                PipState::Ready,
                PipState::Running,
            );
        }

        if runnable.pip_type.is_meta() {
            return StepOutcome::Proceed(PipExecutionStep::ExecuteNonProcessPip);
        }

        let payload = self.core.graph.hydrate_pip(runnable.pip_id);
        match self
            .core
            .collaborators
            .files
            .try_hash_source_dependencies(&payload)
            .await
        {
            Ok(hashes) => runnable.source_hashes = Some(hashes),
            Err(error) => {
                runnable.record_failure(StepError::SourceHashingFailed {
                    pip: runnable.pip_id,
                    error,
                });
                return StepOutcome::Proceed(PipExecutionStep::HandleResult);
            }
        }

        if runnable.pip_type == PipType::Ipc {
            StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCpu)
        } else {
            StepOutcome::Proceed(PipExecutionStep::CheckIncrementalSkip)
        }
    }

    fn step_check_incremental(&self, runnable: &mut RunnablePip) -> StepOutcome {
        if let Some(incremental) = &self.core.collaborators.incremental {
            if incremental.is_clean_and_materialized(runnable.pip_id.node()) {
                runnable.up_to_date = true;
                self.core.counters.increment(SchedulerCounter::PipsUpToDate);
                return StepOutcome::Proceed(PipExecutionStep::HandleResult);
            }
        }

        if runnable.pip_type == PipType::Process {
            if self.core.config.features.delayed_cache_lookup_enabled {
                StepOutcome::Proceed(PipExecutionStep::DelayedCacheLookup)
            } else {
                StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCacheLookup)
            }
        } else {
            StepOutcome::Proceed(PipExecutionStep::ExecuteNonProcessPip)
        }
    }

    fn step_choose_worker_cache(&self, runnable: &mut RunnablePip) -> StepOutcome {
        match self.core.cache_selector.choose() {
            Some(worker) => {
                runnable.worker = Some(worker);
                runnable.held_slot = Some(SlotKind::CacheLookup);
                StepOutcome::Proceed(PipExecutionStep::CacheLookup)
            }
            None => StepOutcome::Park,
        }
    }

    async fn step_cache_lookup(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let payload = self.core.graph.hydrate_pip(runnable.pip_id);
        let inputs = runnable.source_hashes.clone().unwrap_or_default();
        // The lookup runs on the worker whose slot was acquired; remote
        // workers consult their own cache view through the transport.
        let remote = runnable
            .worker
            .and_then(|id| self.core.pool.get(id))
            .and_then(|w| w.as_remote());
        let lookup = match remote {
            Some(remote) => remote.transport().cache_lookup(&payload, &inputs).await,
            None => {
                self.core
                    .collaborators
                    .cache
                    .lookup(&payload, &inputs)
                    .await
            }
        };
        self.release_worker_slot(runnable);

        match lookup {
            Ok(Some(hit)) => {
                self.core
                    .counters
                    .increment(SchedulerCounter::ProcessPipCacheHits);
                runnable.cache_hit = Some(hit);
                StepOutcome::Proceed(PipExecutionStep::RunFromCache)
            }
            Ok(None) => {
                self.core
                    .counters
                    .increment(SchedulerCounter::ProcessPipCacheMisses);
                runnable.had_cache_miss = true;
                if self.core.config.features.cache_only_mode {
                    runnable.record_failure(StepError::Skipped {
                        pip: runnable.pip_id,
                        reason: SkipReason::CacheMissInCacheOnlyMode,
                    });
                    StepOutcome::Proceed(PipExecutionStep::Skip)
                } else {
                    StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCpu)
                }
            }
            Err(error) => {
                runnable.record_failure(StepError::CacheOperationFailed {
                    pip: runnable.pip_id,
                    error,
                });
                StepOutcome::Proceed(PipExecutionStep::HandleResult)
            }
        }
    }

    async fn step_run_from_cache(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let Some(hit) = runnable.cache_hit.clone() else {
            runnable.record_failure(StepError::CacheOperationFailed {
                pip: runnable.pip_id,
                error: CollaboratorError::new("cache.replay", "missing replay descriptor"),
            });
            return StepOutcome::Proceed(PipExecutionStep::HandleResult);
        };

        for output in &hit.outputs {
            let replayed = self
                .core
                .collaborators
                .cache
                .materialize(output.hash, &output.path)
                .await;
            let reported = match replayed {
                Ok(()) => {
                    self.core
                        .collaborators
                        .files
                        .report_output(&output.path, output, OutputOrigin::FromCache)
                        .await
                }
                Err(error) => Err(error),
            };
            if let Err(error) = reported {
                runnable.record_failure(StepError::CacheOperationFailed {
                    pip: runnable.pip_id,
                    error,
                });
                return StepOutcome::Proceed(PipExecutionStep::HandleResult);
            }
        }

        self.core
            .counters
            .increment(SchedulerCounter::PipsRunFromCache);
        runnable.execution_result = Some(ExecutionResult {
            outputs: hit.outputs.clone(),
            ..ExecutionResult::empty_success()
        });

        if self.core.config.features.determinism_probe {
            // Diagnostic re-execution; results are compared in PostProcess.
            runnable.probe_active = true;
            StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCpu)
        } else {
            StepOutcome::Proceed(PipExecutionStep::HandleResult)
        }
    }

    async fn step_choose_worker_cpu(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let payload = self.core.graph.hydrate_pip(runnable.pip_id);

        let services = payload.service_dependencies();
        if !services.is_empty() {
            let ready = self
                .core
                .services
                .ensure_ready(
                    self.core.graph.as_ref(),
                    self.core.collaborators.runner.as_ref(),
                    services,
                )
                .await;
            if let Err(service) = ready {
                // A service that exits before its ready signal fails its
                // clients outright.
                tracing::error!(
                    name: "pip.service_unavailable",
                    pip = %runnable.pip_id,
                    service = %service,
                );
                runnable.record_failure(StepError::ExecutionFailed {
                    pip: runnable.pip_id,
                    exit_code: None,
                });
                return StepOutcome::Proceed(PipExecutionStep::HandleResult);
            }
        }

        let slot_kind = if runnable.pip_type == PipType::Ipc {
            SlotKind::Ipc
        } else {
            SlotKind::Process
        };
        let inputs: Vec<_> = runnable
            .source_hashes
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|s| (s.hash, s.size_bytes))
            .collect();
        let facts = RunnableFacts {
            pip: Some(runnable.pip_id),
            module: runnable.module,
            preferred_worker: runnable.preferred_worker_id,
            inputs: &inputs,
        };

        let Some(worker) = self.core.cpu_selector.choose(&facts, slot_kind) else {
            return StepOutcome::Park;
        };
        runnable.worker = Some(worker);
        runnable.held_slot = Some(slot_kind);
        runnable.preferred_worker_id = Some(worker);

        if runnable.pip_type == PipType::Ipc {
            StepOutcome::Proceed(PipExecutionStep::ExecuteNonProcessPip)
        } else if self.core.config.features.lazy_materialization
            && payload
                .as_process()
                .is_some_and(|p| !p.input_files.is_empty())
        {
            StepOutcome::Proceed(PipExecutionStep::MaterializeInputs)
        } else {
            StepOutcome::Proceed(PipExecutionStep::ExecuteProcess)
        }
    }

    async fn step_materialize_inputs(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let worker_id = runnable.worker.unwrap_or(LOCAL_WORKER_ID);
        let Some(worker) = self.core.pool.get(worker_id) else {
            return self.fail_materialization(runnable, "worker disappeared");
        };

        self.acquire_activity_slot(worker, SlotKind::MaterializeInput)
            .await;

        let outcome = if let Some(remote) = worker.as_remote() {
            let payload = self.core.graph.hydrate_pip(runnable.pip_id);
            remote.transport().materialize_inputs(&payload).await
        } else {
            // Source inputs are already present on the local machine.
            Ok(0)
        };
        self.release_activity_slot(worker, SlotKind::MaterializeInput);

        match outcome {
            Ok(_bytes) => {
                for source in runnable.source_hashes.as_deref().unwrap_or_default() {
                    worker.common().record_content(source.hash);
                }
                StepOutcome::Proceed(PipExecutionStep::ExecuteProcess)
            }
            Err(error) => {
                runnable.record_failure(StepError::DependencyMaterializationFailed {
                    pip: runnable.pip_id,
                    error,
                });
                self.release_worker_slot(runnable);
                StepOutcome::Proceed(PipExecutionStep::HandleResult)
            }
        }
    }

    fn fail_materialization(&self, runnable: &mut RunnablePip, message: &str) -> StepOutcome {
        runnable.record_failure(StepError::DependencyMaterializationFailed {
            pip: runnable.pip_id,
            error: CollaboratorError::new("worker.materialize_inputs", message.to_owned()),
        });
        StepOutcome::Proceed(PipExecutionStep::HandleResult)
    }

    async fn step_execute_process(&self, runnable: &mut RunnablePip) -> StepOutcome {
        if runnable.had_cache_miss {
            // Counted once per pip, not per retry attempt.
            runnable.had_cache_miss = false;
            self.core
                .counters
                .increment(SchedulerCounter::ProcessPipsExecutedDueToCacheMiss);
        }

        let payload = self.core.graph.hydrate_pip(runnable.pip_id);
        let worker_id = runnable.worker.unwrap_or(LOCAL_WORKER_ID);
        let scope = Arc::new(ProcessExecutionScope::new(
            runnable.pip_id,
            worker_id,
            runnable.expected_memory,
            runnable.expected_duration_ms,
        ));
        self.core.running_processes.register(Arc::clone(&scope));
        self.core.counters.record_max(
            SchedulerCounter::MaxRunningProcesses,
            self.core.running_processes.len() as u64,
        );

        let started = Instant::now();
        let executed = match self.core.pool.get(worker_id).and_then(|w| w.as_remote()) {
            Some(remote) => remote
                .transport()
                .execute_process(&payload)
                .await
                .map_err(|error| (RetryReason::StoppedWorker, error)),
            None => self
                .core
                .collaborators
                .runner
                .execute_process(&payload, Arc::clone(&scope))
                .await
                .map_err(|error| (RetryReason::PrepOrVmFailure, error)),
        };
        self.core.running_processes.unregister(runnable.pip_id);

        let result = match executed {
            Ok(result) => result,
            Err((reason, error)) => {
                return self.handle_retryable(runnable, reason, error.to_string());
            }
        };

        match result.status.clone() {
            ExecutionStatus::Succeeded => {
                let elapsed_ms =
                    i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);
                let wall_ms = i32::try_from(result.performance.wall_clock.as_millis())
                    .unwrap_or(i32::MAX);
                self.core
                    .infos
                    .get(runnable.pip_id)
                    .set_process_execute_time_ms(if wall_ms > 0 { wall_ms } else { elapsed_ms });
                runnable.execution_result = Some(result);
                self.release_worker_slot(runnable);
                StepOutcome::Proceed(PipExecutionStep::PostProcess)
            }
            ExecutionStatus::Failed { exit_code } => {
                runnable.record_failure(StepError::ExecutionFailed {
                    pip: runnable.pip_id,
                    exit_code,
                });
                self.release_worker_slot(runnable);
                StepOutcome::Proceed(PipExecutionStep::HandleResult)
            }
            ExecutionStatus::Canceled {
                reason: CancelReason::BuildTermination,
            } => {
                runnable.is_cancelled = true;
                self.release_worker_slot(runnable);
                StepOutcome::Proceed(PipExecutionStep::Cancel)
            }
            ExecutionStatus::Canceled {
                reason: CancelReason::ResourcePressure,
            } => {
                let observed = scope.observed_peak_mb();
                self.handle_low_memory_retry(runnable, observed)
            }
            ExecutionStatus::RetryableFailure { reason } => {
                self.handle_retryable(runnable, reason, "reported by runner".to_owned())
            }
        }
    }

    /// Low-memory retry: reinflate the expected memory and reselect a
    /// worker, up to the configured cap.
    fn handle_low_memory_retry(&self, runnable: &mut RunnablePip, observed_mb: u32) -> StepOutcome {
        self.release_worker_slot(runnable);
        if runnable.retries.low_memory == 0 {
            runnable.record_failure(StepError::ExecutionFailed {
                pip: runnable.pip_id,
                exit_code: None,
            });
            return StepOutcome::Proceed(PipExecutionStep::HandleResult);
        }
        runnable.retries.low_memory -= 1;
        runnable.worker = None;
        self.core
            .counters
            .increment(SchedulerCounter::RetriedDueToLowMemory);
        let multiplier = self
            .core
            .config
            .retries
            .effective_low_memory_multiplier();
        runnable.expected_memory = runnable.expected_memory.inflated(multiplier, observed_mb);
        tracing::info!(
            name: "pip.retry_low_memory",
            pip = %runnable.pip_id,
            expected_peak_mb = runnable.expected_memory.peak_working_set_mb,
        );
        StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCpu)
    }

    fn handle_retryable(
        &self,
        runnable: &mut RunnablePip,
        reason: RetryReason,
        message: String,
    ) -> StepOutcome {
        let assigned_worker = runnable.worker;
        self.release_worker_slot(runnable);
        if reason == RetryReason::StoppedWorker {
            if let Some(remote) = assigned_worker
                .and_then(|id| self.core.pool.get(id))
                .and_then(|w| w.as_remote())
            {
                remote.mark_stopped();
            }
            runnable.preferred_worker_id = None;
            runnable.worker = None;
        }
        let budget = match reason {
            RetryReason::StoppedWorker => &mut runnable.retries.stopped_worker,
            RetryReason::PrepOrVmFailure => &mut runnable.retries.retryable,
            RetryReason::ResourceExhaustion => &mut runnable.retries.low_memory,
        };
        if *budget == 0 {
            // Retryable failures degrade to plain execution failures once
            // the cap is spent.
            runnable.record_failure(StepError::ExecutionFailed {
                pip: runnable.pip_id,
                exit_code: None,
            });
            return StepOutcome::Proceed(PipExecutionStep::HandleResult);
        }
        *budget -= 1;
        let counter = match reason {
            RetryReason::StoppedWorker => SchedulerCounter::RetriedDueToStoppedWorker,
            RetryReason::PrepOrVmFailure => SchedulerCounter::RetriedDueToRetryableFailure,
            RetryReason::ResourceExhaustion => SchedulerCounter::RetriedDueToLowMemory,
        };
        self.core.counters.increment(counter);
        tracing::warn!(
            name: "pip.retry",
            pip = %runnable.pip_id,
            reason = %reason,
            message = message,
        );
        StepOutcome::Proceed(PipExecutionStep::ChooseWorkerCpu)
    }

    async fn step_execute_non_process(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let payload = self.core.graph.hydrate_pip(runnable.pip_id);
        let outcome = match &payload.spec {
            PipSpec::Meta(_) => Ok(()),
            PipSpec::CopyFile {
                source,
                destination,
            } => match self
                .core
                .collaborators
                .files
                .place_copy(source, destination)
                .await
            {
                Ok(()) => self.produce_declared_outputs(&payload).await,
                Err(error) => Err(error),
            },
            PipSpec::WriteFile {
                destination,
                contents,
            } => match self
                .core
                .collaborators
                .files
                .place_write(destination, contents)
                .await
            {
                Ok(()) => self.produce_declared_outputs(&payload).await,
                Err(error) => Err(error),
            },
            PipSpec::SealDirectory { directory, .. } => {
                self.core
                    .collaborators
                    .files
                    .register_static_directory(directory);
                self.core.collaborators.execution_log.log_event(
                    ExecutionLogEvent::DirectoryOutputs {
                        pip: runnable.pip_id,
                        directory: directory.clone(),
                        contents: Vec::new(),
                    },
                );
                Ok(())
            }
            PipSpec::Ipc(ipc) => self.execute_ipc(&ipc.moniker, &ipc.payload).await,
            PipSpec::Process(_) => Ok(()),
        };
        self.release_worker_slot(runnable);

        match outcome {
            Ok(()) => {
                runnable.execution_result = Some(ExecutionResult::empty_success());
                StepOutcome::Proceed(PipExecutionStep::HandleResult)
            }
            Err(error) => {
                tracing::error!(name: "pip.trivial_execution_failed", pip = %runnable.pip_id, error = %error);
                runnable.record_failure(StepError::ExecutionFailed {
                    pip: runnable.pip_id,
                    exit_code: None,
                });
                StepOutcome::Proceed(PipExecutionStep::HandleResult)
            }
        }
    }

    async fn produce_declared_outputs(&self, payload: &Pip) -> Result<(), CollaboratorError> {
        let outputs = self
            .core
            .collaborators
            .files
            .try_hash_outputs(payload)
            .await?;
        for output in &outputs {
            self.core
                .collaborators
                .files
                .report_output(&output.path, output, OutputOrigin::Produced)
                .await?;
        }
        Ok(())
    }

    async fn execute_ipc(&self, moniker: &str, payload: &str) -> Result<(), CollaboratorError> {
        let provider = self
            .core
            .collaborators
            .ipc
            .as_ref()
            .ok_or_else(|| CollaboratorError::new("ipc.get_client", "no IPC provider"))?;
        let client = provider.get_client(moniker)?;
        let _response = client.call(payload).await?;
        Ok(())
    }

    async fn step_post_process(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let payload = self.core.graph.hydrate_pip(runnable.pip_id);
        let Some(result) = runnable.execution_result.clone() else {
            runnable.record_failure(StepError::ExecutionFailed {
                pip: runnable.pip_id,
                exit_code: None,
            });
            return StepOutcome::Proceed(PipExecutionStep::HandleResult);
        };

        let worker_id = runnable.worker.unwrap_or(LOCAL_WORKER_ID);
        let post_slot = self.core.pool.get(worker_id);
        if let Some(worker) = post_slot {
            self.acquire_activity_slot(worker, SlotKind::PostProcess).await;
        }

        // Shared-opaque outputs must be flagged for the next build's scrubber.
        for directory in payload
            .as_process()
            .map(|p| p.shared_opaque_directories.as_slice())
            .unwrap_or_default()
        {
            let contents: Vec<_> = result
                .outputs
                .iter()
                .filter(|o| o.path.as_str().starts_with(directory.as_str()))
                .cloned()
                .collect();
            self.core.collaborators.execution_log.log_event(
                ExecutionLogEvent::DirectoryOutputs {
                    pip: runnable.pip_id,
                    directory: directory.clone(),
                    contents,
                },
            );
        }

        if !result.observed_accesses.is_empty() {
            if let Some(incremental) = &self.core.collaborators.incremental {
                incremental
                    .record_dynamic_observations(runnable.pip_id.node(), &result.observed_accesses);
            }
            self.core.collaborators.execution_log.log_event(
                ExecutionLogEvent::ObservedInputs {
                    pip: runnable.pip_id,
                    observed: result.observed_accesses.clone(),
                },
            );
        }

        let mut failure = None;
        for output in &result.outputs {
            if let Err(error) = self
                .core
                .collaborators
                .files
                .report_output(&output.path, output, OutputOrigin::Produced)
                .await
            {
                failure = Some(error);
                break;
            }
        }

        if failure.is_none() && self.should_publish(runnable, &payload) {
            let inputs = runnable.source_hashes.clone().unwrap_or_default();
            if let Err(error) = self
                .core
                .collaborators
                .cache
                .publish(&payload, &inputs, &result.outputs)
                .await
            {
                failure = Some(error);
            }
        }

        if runnable.probe_active {
            self.report_probe_outcome(runnable, &result);
        }

        if failure.is_none() {
            if let Some(incremental) = &self.core.collaborators.incremental {
                incremental.mark_clean(runnable.pip_id.node());
                incremental.mark_materialized(runnable.pip_id.node());
            }
        }

        if let Some(worker) = post_slot {
            self.release_activity_slot(worker, SlotKind::PostProcess);
        }

        if let Some(error) = failure {
            runnable.record_failure(StepError::CacheOperationFailed {
                pip: runnable.pip_id,
                error,
            });
        }
        StepOutcome::Proceed(PipExecutionStep::HandleResult)
    }

    fn should_publish(&self, runnable: &RunnablePip, payload: &Pip) -> bool {
        !payload.is_uncacheable()
            && !self
                .core
                .infos
                .get(runnable.pip_id)
                .is_uncacheable_impacted()
            && !runnable.probe_active
            && runnable.cache_hit.is_none()
    }

    /// Compares a probe re-execution against the replayed cache entry.
    fn report_probe_outcome(&self, runnable: &RunnablePip, result: &ExecutionResult) {
        let Some(hit) = &runnable.cache_hit else {
            return;
        };
        let converged = hit.outputs.len() == result.outputs.len()
            && hit
                .outputs
                .iter()
                .zip(result.outputs.iter())
                .all(|(a, b)| a.hash == b.hash && a.path == b.path);
        if converged {
            tracing::info!(name: "probe.converged", pip = %runnable.pip_id);
        } else {
            tracing::warn!(name: "probe.diverged", pip = %runnable.pip_id);
        }
    }

    async fn step_materialize_outputs(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let outputs = runnable
            .execution_result
            .as_ref()
            .map(|r| r.outputs.clone())
            .unwrap_or_default();

        let outcome = match runnable
            .worker
            .and_then(|id| self.core.pool.get(id))
            .and_then(|w| w.as_remote())
        {
            Some(remote) => {
                let payload = self.core.graph.hydrate_pip(runnable.pip_id);
                remote.transport().materialize_outputs(&payload, &outputs).await
            }
            // Outputs produced locally are already in place.
            None => Ok(()),
        };

        if let Err(error) = outcome {
            // Background materialization failures fail the build without
            // cancelling it.
            self.core
                .counters
                .increment(SchedulerCounter::BackgroundMaterializationFailures);
            self.core.note_failure(true);
            tracing::error!(
                name: "pip.materialize_outputs_failed",
                pip = %runnable.pip_id,
                error = %error,
            );
        }

        if runnable.is_background_materialization {
            StepOutcome::Proceed(PipExecutionStep::Done)
        } else {
            StepOutcome::Proceed(PipExecutionStep::HandleResult)
        }
    }

    fn step_cancel(&self, runnable: &mut RunnablePip) -> StepOutcome {
        runnable.is_cancelled = true;
        self.release_worker_slot(runnable);

        // Flag shared-opaque outputs so scrubbing can clean partial writes.
        let payload = self.core.graph.hydrate_pip(runnable.pip_id);
        for directory in payload
            .as_process()
            .map(|p| p.shared_opaque_directories.as_slice())
            .unwrap_or_default()
        {
            self.core.collaborators.execution_log.log_event(
                ExecutionLogEvent::DirectoryOutputs {
                    pip: runnable.pip_id,
                    directory: directory.clone(),
                    contents: Vec::new(),
                },
            );
        }
        StepOutcome::Proceed(PipExecutionStep::HandleResult)
    }

    fn step_skip(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let info = self.core.infos.get(runnable.pip_id);
        if info.try_transition(PipState::Ready, PipState::Running) {
            self.core.state_counters.transition(
                runnable.pip_type,
                PipState::Ready,
                PipState::Running,
            );
        }
        if runnable.failure.is_none() {
            runnable.record_failure(StepError::Skipped {
                pip: runnable.pip_id,
                reason: SkipReason::FailedDependency,
            });
        }
        if let Some(StepError::Skipped { reason, .. }) = &runnable.failure {
            tracing::info!(name: "pip.skipped", pip = %runnable.pip_id, reason = %reason);
        }
        StepOutcome::Proceed(PipExecutionStep::HandleResult)
    }

    fn step_handle_result(&self, runnable: &mut RunnablePip) -> StepOutcome {
        let info = self.core.infos.get(runnable.pip_id);
        let (final_state, result_status) = final_disposition(runnable);

        if matches!(final_state, PipState::Failed) {
            // Every terminal failure is accompanied by at least one logged
            // error identifying the pip.
            let detail = runnable
                .failure
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_owned());
            tracing::error!(name: "pip.failed", pip = %runnable.pip_id, error = detail);
        }

        let previous_state = info.state();
        let won = info.transition_to_terminal(final_state, result_status);
        if !won {
            // A cancel sweep beat this completion; it owns the side effects.
            return StepOutcome::Proceed(PipExecutionStep::Done);
        }
        self.core
            .state_counters
            .transition(runnable.pip_type, previous_state, final_state);

        match result_status {
            PipResultStatus::Failed => self.core.note_failure(false),
            PipResultStatus::Skipped => {
                self.core
                    .counters
                    .increment(SchedulerCounter::PipsSkippedDueToFailedDependencies);
            }
            PipResultStatus::Canceled => {
                self.core.counters.increment(SchedulerCounter::PipsCanceled);
            }
            _ => {}
        }

        self.record_completion_telemetry(runnable, result_status);

        if runnable.semaphores_held {
            self.core.queues.release_semaphores(&runnable.semaphores);
            runnable.semaphores_held = false;
        }

        // Terminal transition is complete; only now may dependents observe it.
        for newly in self.core.driver.on_pip_completed(runnable.pip_id) {
            self.core.schedule_pip(newly.pip, newly.skip);
        }

        // Replicate remote outputs in the background; failures are recorded
        // but never cancel the build.
        if result_status == PipResultStatus::Executed {
            if let Some(worker) = runnable.worker.filter(|w| *w != LOCAL_WORKER_ID) {
                if let Some(result) = runnable.execution_result.clone() {
                    let background = RunnablePip::background_materialization(
                        runnable.pip_id,
                        runnable.pip_type,
                        result,
                        Some(worker),
                    );
                    self.core.enqueue_runnable(Box::new(background));
                }
            }
        }

        self.core.note_pip_finished();
        StepOutcome::Proceed(PipExecutionStep::Done)
    }

    fn record_completion_telemetry(&self, runnable: &RunnablePip, result: PipResultStatus) {
        let info = self.core.infos.get(runnable.pip_id);

        // Actual critical path: own execute time plus the longest completed
        // chain among heavy dependencies.
        let own_ms = info.process_execute_time_ms().max(0);
        let upstream_ms = self
            .core
            .graph
            .incoming_edges(runnable.pip_id.node())
            .iter()
            .filter(|e| e.is_heavy())
            .map(|e| self.core.infos.get(e.target.pip()).critical_path_ms())
            .max()
            .unwrap_or(0)
            .max(0);
        let path_ms = own_ms.saturating_add(upstream_ms);
        info.set_critical_path_ms(path_ms);
        self.core.critical_path.record(
            runnable.pip_id,
            path_ms.max(0) as u32,
            info.had_historic_estimate(),
        );

        if result == PipResultStatus::Executed && runnable.pip_type == PipType::Process {
            if let Some(exec) = &runnable.execution_result {
                self.core.collaborators.historic.record(
                    runnable.pip_id,
                    PipHistoricPerf {
                        duration_ms: own_ms as u32,
                        memory: exec.performance.memory,
                    },
                );
            }
        }

        let performance = runnable
            .execution_result
            .as_ref()
            .map(|r| r.performance.clone())
            .unwrap_or_default();
        self.core.collaborators.execution_log.log_event(
            ExecutionLogEvent::PipExecutionPerformance {
                pip: runnable.pip_id,
                result,
                performance,
            },
        );
    }

    /// Acquires one `kind` slot on `worker`, parking on the slot-released
    /// signal between attempts.
    ///
    /// A successful waiter passes the wake along: several releases may have
    /// collapsed into the single stored permit it consumed.
    async fn acquire_activity_slot(&self, worker: &Worker, kind: SlotKind) {
        loop {
            if worker.common().slots(kind).try_acquire() {
                self.core.slot_released.notify_one();
                return;
            }
            self.core.slot_released.notified().await;
        }
    }

    /// Releases a slot taken by `acquire_activity_slot`, waking one waiter.
    fn release_activity_slot(&self, worker: &Worker, kind: SlotKind) {
        worker.common().release(kind);
        self.core.slot_released.notify_one();
    }

    /// Releases the slot taken by a choose-worker step, waking parked
    /// runnables that wait for one.
    fn release_worker_slot(&self, runnable: &mut RunnablePip) {
        let (Some(worker_id), Some(kind)) = (runnable.worker, runnable.held_slot.take()) else {
            return;
        };
        if let Some(worker) = self.core.pool.get(worker_id) {
            worker.common().release(kind);
            if matches!(kind, SlotKind::Process | SlotKind::Ipc) {
                worker.common().unassign_pip(runnable.pip_id);
            }
        }
        if !matches!(kind, SlotKind::Process | SlotKind::Ipc) {
            runnable.worker = None;
        }
        self.core.notify_worker_available();
        self.core.slot_released.notify_one();
    }
}

/// Maps the accumulated record to its terminal state and result.
fn final_disposition(runnable: &RunnablePip) -> (PipState, PipResultStatus) {
    if let Some(failure) = &runnable.failure {
        return match failure {
            StepError::Skipped { .. } => (PipState::Skipped, PipResultStatus::Skipped),
            StepError::Canceled { .. } => (PipState::Canceled, PipResultStatus::Canceled),
            _ => (PipState::Failed, PipResultStatus::Failed),
        };
    }
    if runnable.is_cancelled {
        return (PipState::Canceled, PipResultStatus::Canceled);
    }
    if runnable.up_to_date {
        return (PipState::Done, PipResultStatus::UpToDate);
    }
    if runnable.cache_hit.is_some() && !runnable.probe_active {
        return (PipState::Done, PipResultStatus::FromCache);
    }
    (PipState::Done, PipResultStatus::Executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::RetryBudgets;
    use buildflow_graph::PipId;

    fn runnable() -> RunnablePip {
        RunnablePip::new(
            PipId::from_index(1),
            PipType::Process,
            7,
            RetryBudgets {
                low_memory: 1,
                retryable: 1,
                stopped_worker: 1,
            },
        )
    }

    #[test]
    fn disposition_prefers_recorded_failures() {
        let mut r = runnable();
        r.is_cancelled = true;
        r.record_failure(StepError::Skipped {
            pip: r.pip_id,
            reason: SkipReason::FailedDependency,
        });
        assert_eq!(
            final_disposition(&r),
            (PipState::Skipped, PipResultStatus::Skipped)
        );
    }

    #[test]
    fn disposition_of_cache_hit_is_from_cache() {
        let mut r = runnable();
        r.cache_hit = Some(buildflow_api::CacheHit {
            fingerprint: buildflow_api::Fingerprint([0; 16]),
            outputs: Vec::new(),
            original_duration_ms: 5,
        });
        assert_eq!(
            final_disposition(&r),
            (PipState::Done, PipResultStatus::FromCache)
        );
        // A probe re-execution reports Executed, not FromCache.
        r.probe_active = true;
        assert_eq!(
            final_disposition(&r),
            (PipState::Done, PipResultStatus::Executed)
        );
    }

    #[test]
    fn disposition_of_up_to_date() {
        let mut r = runnable();
        r.up_to_date = true;
        assert_eq!(
            final_disposition(&r),
            (PipState::Done, PipResultStatus::UpToDate)
        );
    }
}
