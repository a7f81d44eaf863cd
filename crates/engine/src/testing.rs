// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory collaborators and graph fixtures for tests.
//!
//! Every collaborator here is scripted: caches are seeded with hits,
//! runners follow per-pip execution scripts, collectors replay canned
//! samples. Nothing touches the file system or spawns processes.

use crate::context::Collaborators;
use buildflow_api::{
    CacheHit, CollaboratorError, ContentCache, ContentHash, ExecutionLogEvent, ExecutionLogSink,
    ExecutionLogMultiplexer, ExecutionResult, ExecutionStatus, FileContentManager, Fingerprint,
    HistoricalPerfInfo, InMemoryHistoricPerf, IncrementalSchedulingState, MachineCounters,
    MemoryCounters, ObservedAccess, OutputContent, OutputOrigin, PerformanceCollector,
    ProcessExecutionScope, ProcessPerformance, ProcessRunner, PublishResult, ServiceHandle,
    ServiceReadiness, SourceHash, SourceHashes, WorkerAttachment, WorkerTransport,
};
use buildflow_graph::{
    ArtifactPath, EdgeKind, GraphBuilder, NodeId, Pip, PipGraphImpl, PipId, PipSpec, ProcessPip,
    ServicePipKind,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builds a plain process pip producing `output`.
#[must_use]
pub fn process_pip(output: &str) -> Pip {
    Pip {
        id: PipId::from_index(0),
        static_priority: 0,
        module: None,
        semaphores: Vec::new(),
        spec: PipSpec::Process(ProcessPip {
            executable: "/bin/tool".into(),
            arguments: Vec::new(),
            input_files: Vec::new(),
            output_files: vec![output.into()],
            shared_opaque_directories: Vec::new(),
            service_kind: ServicePipKind::None,
            service_dependencies: Vec::new(),
            is_uncacheable: false,
        }),
    }
}

/// Builds a linear chain of `n` process pips and returns it with the ids in
/// dependency order (the first element is the root).
#[must_use]
pub fn process_chain(n: usize) -> (Arc<PipGraphImpl>, Vec<PipId>) {
    let mut builder = GraphBuilder::new();
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = builder
            .add_pip(process_pip(&format!("/out/p{i}")))
            .expect("add pip");
        if let Some(previous) = ids.last() {
            builder
                .add_dependency(id, *previous, EdgeKind::Heavy)
                .expect("edge");
        }
        ids.push(id);
    }
    (Arc::new(builder.build().expect("acyclic")), ids)
}

/// A content cache with scripted hits.
#[derive(Default)]
pub struct TestCache {
    hits: Mutex<HashMap<PipId, CacheHit>>,
    published: Mutex<Vec<PipId>>,
    fail_lookups: Mutex<HashSet<PipId>>,
    closed: AtomicUsize,
}

impl TestCache {
    /// Creates an empty (all-miss) cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a hit for `pip` with one output.
    pub fn seed_hit(&self, pip: PipId, output: &str) {
        let _ = self.hits.lock().insert(
            pip,
            CacheHit {
                fingerprint: Fingerprint([7; 16]),
                outputs: vec![OutputContent {
                    path: output.into(),
                    hash: ContentHash::from_u128(u128::from(pip.index() as u64)),
                    size_bytes: 64,
                }],
                original_duration_ms: 5,
            },
        );
    }

    /// Makes lookups for `pip` fail.
    pub fn fail_lookup(&self, pip: PipId) {
        let _ = self.fail_lookups.lock().insert(pip);
    }

    /// Pips whose results were published.
    #[must_use]
    pub fn published(&self) -> Vec<PipId> {
        self.published.lock().clone()
    }

    /// How many times `close` ran.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ContentCache for TestCache {
    async fn lookup(
        &self,
        pip: &Pip,
        _inputs: &SourceHashes,
    ) -> Result<Option<CacheHit>, CollaboratorError> {
        if self.fail_lookups.lock().contains(&pip.id) {
            return Err(CollaboratorError::new("cache.lookup", "scripted failure"));
        }
        Ok(self.hits.lock().get(&pip.id).cloned())
    }

    async fn publish(
        &self,
        pip: &Pip,
        _inputs: &SourceHashes,
        _outputs: &[OutputContent],
    ) -> Result<PublishResult, CollaboratorError> {
        self.published.lock().push(pip.id);
        Ok(PublishResult { stored: true })
    }

    async fn materialize(
        &self,
        _hash: ContentHash,
        _path: &ArtifactPath,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        let _ = self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A file content manager hashing paths deterministically.
#[derive(Default)]
pub struct TestFileContentManager {
    reported: Mutex<Vec<(ArtifactPath, OutputOrigin)>>,
    fail_hashing: Mutex<HashSet<PipId>>,
}

impl TestFileContentManager {
    /// Creates a manager that succeeds for every pip.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes source hashing fail for `pip`.
    pub fn fail_hashing(&self, pip: PipId) {
        let _ = self.fail_hashing.lock().insert(pip);
    }

    /// Outputs reported so far.
    #[must_use]
    pub fn reported(&self) -> Vec<(ArtifactPath, OutputOrigin)> {
        self.reported.lock().clone()
    }
}

fn hash_of(path: &ArtifactPath) -> ContentHash {
    let mut acc: u128 = 0xcbf2_9ce4_8422_2325;
    for byte in path.as_str().bytes() {
        acc = acc.wrapping_mul(0x0100_0000_01b3).wrapping_add(u128::from(byte));
    }
    ContentHash::from_u128(acc)
}

#[async_trait::async_trait]
impl FileContentManager for TestFileContentManager {
    async fn try_hash_source_dependencies(
        &self,
        pip: &Pip,
    ) -> Result<SourceHashes, CollaboratorError> {
        if self.fail_hashing.lock().contains(&pip.id) {
            return Err(CollaboratorError::new("files.hash", "scripted failure"));
        }
        let inputs = match &pip.spec {
            PipSpec::Process(p) => p.input_files.clone(),
            PipSpec::CopyFile { source, .. } => vec![source.clone()],
            _ => Vec::new(),
        };
        Ok(inputs
            .into_iter()
            .map(|path| SourceHash {
                hash: hash_of(&path),
                size_bytes: path.as_str().len() as u64,
                path,
            })
            .collect())
    }

    async fn try_hash_outputs(&self, pip: &Pip) -> Result<Vec<OutputContent>, CollaboratorError> {
        let outputs = match &pip.spec {
            PipSpec::Process(p) => p.output_files.clone(),
            PipSpec::CopyFile { destination, .. } | PipSpec::WriteFile { destination, .. } => {
                vec![destination.clone()]
            }
            _ => Vec::new(),
        };
        Ok(outputs
            .into_iter()
            .map(|path| OutputContent {
                hash: hash_of(&path),
                size_bytes: 32,
                path,
            })
            .collect())
    }

    async fn report_output(
        &self,
        path: &ArtifactPath,
        _info: &OutputContent,
        origin: OutputOrigin,
    ) -> Result<(), CollaboratorError> {
        self.reported.lock().push((path.clone(), origin));
        Ok(())
    }

    async fn place_copy(
        &self,
        _source: &ArtifactPath,
        _destination: &ArtifactPath,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn place_write(
        &self,
        _destination: &ArtifactPath,
        _contents: &str,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn list_sealed_directory_contents(&self, _dir: PipId) -> Vec<ArtifactPath> {
        Vec::new()
    }

    fn register_static_directory(&self, _dir: &ArtifactPath) {}
}

/// One scripted execution attempt.
#[derive(Debug, Clone)]
pub enum ScriptedExecution {
    /// Exit zero after `duration_ms` of simulated work.
    Succeed {
        /// Simulated wall-clock milliseconds.
        duration_ms: u64,
    },
    /// Exit nonzero.
    Fail {
        /// The exit code reported.
        exit_code: i32,
    },
    /// Canceled by the resource manager with the given observed peak.
    CancelForResources {
        /// The peak working set the scope observed before the cancel.
        observed_mb: u32,
    },
    /// A retryable sandbox failure.
    Retryable(buildflow_api::RetryReason),
}

/// A process runner following per-pip scripts. Default: instant success.
#[derive(Default)]
pub struct TestProcessRunner {
    scripts: Mutex<HashMap<PipId, VecDeque<ScriptedExecution>>>,
    executions: Mutex<HashMap<PipId, usize>>,
    execution_order: Mutex<Vec<PipId>>,
    service_fails_before_ready: Mutex<HashSet<PipId>>,
}

impl TestProcessRunner {
    /// Creates a runner that succeeds instantly for every pip.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a scripted attempt for `pip`; attempts are consumed in order
    /// and fall back to instant success when exhausted.
    pub fn script(&self, pip: PipId, attempt: ScriptedExecution) {
        self.scripts.lock().entry(pip).or_default().push_back(attempt);
    }

    /// Makes the service process for `pip` exit before reporting ready.
    pub fn fail_service_before_ready(&self, pip: PipId) {
        let _ = self.service_fails_before_ready.lock().insert(pip);
    }

    /// How many times `pip` entered execution.
    #[must_use]
    pub fn execution_count(&self, pip: PipId) -> usize {
        self.executions.lock().get(&pip).copied().unwrap_or(0)
    }

    /// Every execution entry, in order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<PipId> {
        self.execution_order.lock().clone()
    }
}

#[async_trait::async_trait]
impl ProcessRunner for TestProcessRunner {
    async fn execute_process(
        &self,
        pip: &Pip,
        scope: Arc<ProcessExecutionScope>,
    ) -> Result<ExecutionResult, CollaboratorError> {
        *self.executions.lock().entry(pip.id).or_insert(0) += 1;
        self.execution_order.lock().push(pip.id);
        let attempt = self
            .scripts
            .lock()
            .get_mut(&pip.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedExecution::Succeed { duration_ms: 1 });

        let outputs = match &pip.spec {
            PipSpec::Process(p) => p
                .output_files
                .iter()
                .map(|path| OutputContent {
                    hash: hash_of(path),
                    size_bytes: 32,
                    path: path.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };

        let status = match attempt {
            ScriptedExecution::Succeed { duration_ms } => {
                let cancel = scope.cancel_token();
                let canceled = tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(duration_ms)) => false,
                    () = cancel.cancelled() => true,
                };
                if canceled {
                    ExecutionStatus::Canceled {
                        reason: scope
                            .cancel_reason()
                            .unwrap_or(buildflow_api::CancelReason::BuildTermination),
                    }
                } else {
                    return Ok(ExecutionResult {
                        status: ExecutionStatus::Succeeded,
                        performance: ProcessPerformance {
                            wall_clock: Duration::from_millis(duration_ms),
                            memory: MemoryCounters {
                                peak_working_set_mb: 64,
                                average_working_set_mb: 32,
                                peak_commit_mb: 80,
                            },
                            io_read_bytes: 0,
                            io_write_bytes: 0,
                        },
                        observed_accesses: Vec::new(),
                        outputs,
                        shared_opaque_outputs: Vec::new(),
                    });
                }
            }
            ScriptedExecution::Fail { exit_code } => ExecutionStatus::Failed {
                exit_code: Some(exit_code),
            },
            ScriptedExecution::CancelForResources { observed_mb } => {
                scope.record_observed_mb(observed_mb);
                ExecutionStatus::Canceled {
                    reason: buildflow_api::CancelReason::ResourcePressure,
                }
            }
            ScriptedExecution::Retryable(reason) => ExecutionStatus::RetryableFailure { reason },
        };

        Ok(ExecutionResult {
            status,
            performance: ProcessPerformance::default(),
            observed_accesses: Vec::new(),
            outputs: Vec::new(),
            shared_opaque_outputs: Vec::new(),
        })
    }

    async fn start_service(&self, pip: &Pip) -> Result<ServiceHandle, CollaboratorError> {
        let fails = self.service_fails_before_ready.lock().contains(&pip.id);
        let (tx, rx) = tokio::sync::watch::channel(ServiceReadiness::Starting);
        let stop = CancellationToken::new();
        let stop_for_task = stop.clone();

        let _ = tokio::spawn(async move {
            if fails {
                let _ = tx.send(ServiceReadiness::Exited { success: false });
                return;
            }
            let _ = tx.send(ServiceReadiness::Ready);
            stop_for_task.cancelled().await;
            let _ = tx.send(ServiceReadiness::Exited { success: true });
        });

        Ok(ServiceHandle {
            readiness: rx,
            stop,
        })
    }
}

/// Incremental scheduling state over hash sets.
#[derive(Default)]
pub struct TestIncrementalState {
    clean: Mutex<HashSet<NodeId>>,
    materialized: Mutex<HashSet<NodeId>>,
    perpetually_dirty: Mutex<HashSet<NodeId>>,
    observations: Mutex<HashMap<NodeId, usize>>,
}

impl TestIncrementalState {
    /// Creates an all-dirty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `node` clean and materialized, as a previous build would have.
    pub fn seed_clean_and_materialized(&self, node: NodeId) {
        let _ = self.clean.lock().insert(node);
        let _ = self.materialized.lock().insert(node);
    }

    /// Whether `node` was marked clean.
    #[must_use]
    pub fn is_clean(&self, node: NodeId) -> bool {
        self.clean.lock().contains(&node)
    }
}

impl IncrementalSchedulingState for TestIncrementalState {
    fn is_clean_and_materialized(&self, node: NodeId) -> bool {
        !self.perpetually_dirty.lock().contains(&node)
            && self.clean.lock().contains(&node)
            && self.materialized.lock().contains(&node)
    }

    fn mark_clean(&self, node: NodeId) {
        let _ = self.clean.lock().insert(node);
    }

    fn mark_materialized(&self, node: NodeId) {
        let _ = self.materialized.lock().insert(node);
    }

    fn mark_perpetually_dirty(&self, node: NodeId) {
        let _ = self.perpetually_dirty.lock().insert(node);
    }

    fn record_dynamic_observations(&self, node: NodeId, observed: &[ObservedAccess]) {
        *self.observations.lock().entry(node).or_insert(0) += observed.len();
    }

    fn save(&self, path: &Path) -> Result<(), CollaboratorError> {
        let clean: Vec<u32> = self.clean.lock().iter().map(|n| n.index() as u32).collect();
        let bytes = serde_json::to_vec(&clean)
            .map_err(|e| CollaboratorError::new("incremental.save", e.to_string()))?;
        std::fs::write(path, bytes)
            .map_err(|e| CollaboratorError::new("incremental.save", e.to_string()))
    }
}

/// A performance collector replaying canned samples; the last one repeats.
pub struct TestCollector {
    samples: Mutex<VecDeque<MachineCounters>>,
    last: Mutex<MachineCounters>,
}

impl Default for TestCollector {
    fn default() -> Self {
        Self::healthy()
    }
}

impl TestCollector {
    /// A machine with ample free memory.
    #[must_use]
    pub fn healthy() -> Self {
        let sample = MachineCounters {
            ram_total_mb: 16_384,
            ram_available_mb: 12_000,
            commit_total_mb: 32_768,
            commit_used_mb: 8_000,
            cpu_percent: 10,
        };
        Self {
            samples: Mutex::new(VecDeque::new()),
            last: Mutex::new(sample),
        }
    }

    /// Queues a sample to be returned before the steady state.
    pub fn push_sample(&self, sample: MachineCounters) {
        self.samples.lock().push_back(sample);
    }
}

impl PerformanceCollector for TestCollector {
    fn sample(&self) -> MachineCounters {
        if let Some(sample) = self.samples.lock().pop_front() {
            *self.last.lock() = sample;
            return sample;
        }
        *self.last.lock()
    }
}

/// An execution-log sink buffering every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecutionLogEvent>>,
    flushes: AtomicUsize,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<ExecutionLogEvent> {
        self.events.lock().clone()
    }

    /// How many times `flush` ran.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl ExecutionLogSink for RecordingSink {
    fn log(&self, event: &ExecutionLogEvent) {
        self.events.lock().push(event.clone());
    }

    fn flush(&self) {
        let _ = self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A scripted remote worker transport.
pub struct TestTransport {
    process_slots: u32,
    executions: AtomicUsize,
    fail_executions: Mutex<usize>,
    finished: AtomicUsize,
}

impl TestTransport {
    /// Creates a transport offering `process_slots` process slots.
    #[must_use]
    pub fn new(process_slots: u32) -> Self {
        Self {
            process_slots,
            executions: AtomicUsize::new(0),
            fail_executions: Mutex::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` remote executions fail as a vanished worker.
    pub fn fail_next_executions(&self, count: usize) {
        *self.fail_executions.lock() = count;
    }

    /// Remote executions performed.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// How many times `finish` ran.
    #[must_use]
    pub fn finish_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl WorkerTransport for TestTransport {
    async fn initialize(&self) -> Result<WorkerAttachment, CollaboratorError> {
        Ok(WorkerAttachment {
            name: "test-remote".to_owned(),
            total_process_slots: self.process_slots,
            total_cache_lookup_slots: self.process_slots,
            total_ram_mb: 8_192,
            total_commit_mb: 16_384,
        })
    }

    async fn cache_lookup(
        &self,
        _pip: &Pip,
        _inputs: &SourceHashes,
    ) -> Result<Option<CacheHit>, CollaboratorError> {
        Ok(None)
    }

    async fn materialize_inputs(&self, _pip: &Pip) -> Result<u64, CollaboratorError> {
        Ok(0)
    }

    async fn execute_process(&self, pip: &Pip) -> Result<ExecutionResult, CollaboratorError> {
        let _ = self.executions.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.fail_executions.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(CollaboratorError::new(
                    "transport.execute",
                    "worker vanished",
                ));
            }
        }
        let outputs = match &pip.spec {
            PipSpec::Process(p) => p
                .output_files
                .iter()
                .map(|path| OutputContent {
                    hash: hash_of(path),
                    size_bytes: 32,
                    path: path.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(ExecutionResult {
            status: ExecutionStatus::Succeeded,
            performance: ProcessPerformance {
                wall_clock: Duration::from_millis(1),
                ..ProcessPerformance::default()
            },
            observed_accesses: Vec::new(),
            outputs,
            shared_opaque_outputs: Vec::new(),
        })
    }

    async fn materialize_outputs(
        &self,
        _pip: &Pip,
        _outputs: &[OutputContent],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn finish(&self) -> Result<(), CollaboratorError> {
        let _ = self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The full bundle of scripted collaborators behind a test build.
pub struct TestHarness {
    /// The scripted cache.
    pub cache: Arc<TestCache>,
    /// The scripted file content manager.
    pub files: Arc<TestFileContentManager>,
    /// The scripted process runner.
    pub runner: Arc<TestProcessRunner>,
    /// The scripted incremental state.
    pub incremental: Arc<TestIncrementalState>,
    /// The historic performance table.
    pub historic: Arc<InMemoryHistoricPerf>,
    /// The recording execution-log sink.
    pub sink: Arc<RecordingSink>,
    /// The canned OS counter collector.
    pub collector: Arc<TestCollector>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with all-default scripts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: Arc::new(TestCache::new()),
            files: Arc::new(TestFileContentManager::new()),
            runner: Arc::new(TestProcessRunner::new()),
            incremental: Arc::new(TestIncrementalState::new()),
            historic: Arc::new(InMemoryHistoricPerf::new()),
            sink: Arc::new(RecordingSink::new()),
            collector: Arc::new(TestCollector::healthy()),
        }
    }

    /// Builds the `Collaborators` bundle over this harness.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        let execution_log = Arc::new(ExecutionLogMultiplexer::new());
        execution_log.register(Arc::clone(&self.sink) as Arc<dyn ExecutionLogSink>);
        Collaborators {
            cache: Arc::clone(&self.cache) as Arc<dyn ContentCache>,
            files: Arc::clone(&self.files) as Arc<dyn FileContentManager>,
            runner: Arc::clone(&self.runner) as Arc<dyn ProcessRunner>,
            incremental: Some(Arc::clone(&self.incremental) as Arc<dyn IncrementalSchedulingState>),
            change_tracker: None,
            historic: Arc::clone(&self.historic) as Arc<dyn HistoricalPerfInfo>,
            execution_log,
            ipc: None,
            collector: Arc::clone(&self.collector) as Arc<dyn PerformanceCollector>,
        }
    }
}
