// SPDX-License-Identifier: Apache-2.0

//! Collaborator contracts and execution data types for the build scheduler.
//!
//! The scheduler core never depends on a concrete cache, sandbox, file
//! manager, or transport implementation; it consumes each through the traits
//! defined here. Implementations are injected at construction time: there
//! are no process-wide singletons, and the execution log is a registered
//! sink list rather than a global.
//!
//! Important note: error types here must stay `Send + Sync` so they can be
//! surfaced from any step-execution task.

pub mod cache;
pub mod error;
pub mod execution;
pub mod files;
pub mod incremental;
pub mod ipc;
pub mod logsink;
pub mod perf;
pub mod runner;
pub mod transport;

pub use cache::{CacheHit, ContentCache, Fingerprint, PublishResult};
pub use error::{CollaboratorError, SkipReason, StepError};
pub use execution::{
    CancelReason, ContentHash, ExecutionResult, ExecutionStatus, MemoryCounters, ObservedAccess,
    ObservedAccessKind, OutputContent, OutputOrigin, PipResultStatus, PipState,
    ProcessPerformance, RetryReason, SourceHash, SourceHashes,
};
pub use files::{FileChangeTracker, FileContentManager, SimpleFileChangeTracker};
pub use incremental::IncrementalSchedulingState;
pub use ipc::{IpcClient, IpcProvider};
pub use logsink::{ExecutionLogEvent, ExecutionLogMultiplexer, ExecutionLogSink, StatusEvent};
pub use perf::{
    HistoricalPerfInfo, InMemoryHistoricPerf, MachineCounters, PerformanceCollector,
    PipHistoricPerf, SysinfoCollector,
};
pub use runner::{
    ProcessExecutionScope, ProcessRunner, RunningProcessRegistry, ServiceHandle, ServiceReadiness,
};
pub use transport::{WorkerAttachment, WorkerTransport};
