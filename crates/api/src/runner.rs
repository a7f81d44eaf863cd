// SPDX-License-Identifier: Apache-2.0

//! Sandboxed process runner contract and the running-process registry.
//!
//! The scheduler is agnostic to the sandbox implementation. Every in-flight
//! process execution registers a [`ProcessExecutionScope`] in the
//! [`RunningProcessRegistry`]; the resource manager operates exclusively on
//! that registry when it needs to reclaim memory.

use crate::error::CollaboratorError;
use crate::execution::{CancelReason, ExecutionResult, MemoryCounters};
use buildflow_graph::{Pip, PipId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Readiness of a started service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceReadiness {
    /// The service process is starting up.
    Starting,
    /// The service reported ready and accepts client calls.
    Ready,
    /// The service exited; `success` reflects its exit status.
    Exited {
        /// Whether the exit was clean.
        success: bool,
    },
}

/// Handle to a started service process.
///
/// Clients wait on `readiness`; a transition straight to `Exited` before
/// `Ready` means startup failed and clients must fail too.
pub struct ServiceHandle {
    /// Readiness signal, updated by the runner.
    pub readiness: tokio::sync::watch::Receiver<ServiceReadiness>,
    /// Requests the service to stop; the runner resolves `readiness` to
    /// `Exited` once the process is gone.
    pub stop: CancellationToken,
}

/// Controls over one in-flight process execution.
///
/// The runner implementation must observe `cancel` cooperatively and may
/// honor the working-set controls on a best-effort basis.
pub struct ProcessExecutionScope {
    /// The executing pip.
    pub pip: PipId,
    /// Index of the worker executing the pip.
    pub worker: usize,
    /// When execution started.
    pub started_at: Instant,
    /// Expected memory of this attempt.
    pub expected_memory: MemoryCounters,
    /// Expected wall-clock milliseconds of this attempt, for resume ordering.
    pub expected_duration_ms: u32,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    suspended: AtomicBool,
    observed_peak_mb: AtomicU32,
}

impl ProcessExecutionScope {
    /// Creates a scope for one execution attempt.
    #[must_use]
    pub fn new(
        pip: PipId,
        worker: usize,
        expected_memory: MemoryCounters,
        expected_duration_ms: u32,
    ) -> Self {
        Self {
            pip,
            worker,
            started_at: Instant::now(),
            expected_memory,
            expected_duration_ms,
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            suspended: AtomicBool::new(false),
            observed_peak_mb: AtomicU32::new(0),
        }
    }

    /// Requests cancellation of the execution for `reason`.
    ///
    /// The first reason wins; repeated cancellation is a no-op.
    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.cancel_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
            self.cancel.cancel();
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The reason cancellation was requested, if it was.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel_reason.lock()
    }

    /// Token observed by the runner implementation.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Best-effort request to trim the process working set. Returns the
    /// megabytes expected to be freed (the current observed peak).
    pub fn try_empty_working_set(&self) -> u32 {
        self.observed_peak_mb.load(Ordering::Relaxed)
    }

    /// Suspends the execution. Returns false when already suspended.
    pub fn try_suspend(&self) -> bool {
        !self.suspended.swap(true, Ordering::SeqCst)
    }

    /// Resumes a suspended execution. Returns false when not suspended.
    pub fn try_resume(&self) -> bool {
        self.suspended.swap(false, Ordering::SeqCst)
    }

    /// Whether the execution is currently suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Records an observed working-set sample, keeping the peak.
    pub fn record_observed_mb(&self, mb: u32) {
        self.observed_peak_mb.fetch_max(mb, Ordering::Relaxed);
    }

    /// Peak working set observed so far.
    #[must_use]
    pub fn observed_peak_mb(&self) -> u32 {
        self.observed_peak_mb.load(Ordering::Relaxed)
    }

    /// Estimated milliseconds of execution remaining.
    #[must_use]
    pub fn remaining_estimate_ms(&self) -> u32 {
        let elapsed = u32::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u32::MAX);
        self.expected_duration_ms.saturating_sub(elapsed)
    }
}

/// Registry of all in-flight process executions.
#[derive(Default)]
pub struct RunningProcessRegistry {
    scopes: Mutex<HashMap<PipId, Arc<ProcessExecutionScope>>>,
}

impl RunningProcessRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a scope for the duration of one execution attempt.
    pub fn register(&self, scope: Arc<ProcessExecutionScope>) {
        let _ = self.scopes.lock().insert(scope.pip, scope);
    }

    /// Removes the scope when the attempt finishes.
    pub fn unregister(&self, pip: PipId) {
        let _ = self.scopes.lock().remove(&pip);
    }

    /// Snapshot of all current scopes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ProcessExecutionScope>> {
        self.scopes.lock().values().cloned().collect()
    }

    /// Number of in-flight executions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.lock().len()
    }

    /// Whether no execution is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.lock().is_empty()
    }
}

/// Sandboxed process runner.
#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `pip` in the sandbox, observing `scope` for cancellation and
    /// suspension requests.
    async fn execute_process(
        &self,
        pip: &Pip,
        scope: Arc<ProcessExecutionScope>,
    ) -> Result<ExecutionResult, CollaboratorError>;

    /// Starts a service process and returns its readiness handle.
    async fn start_service(&self, pip: &Pip) -> Result<ServiceHandle, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cancel_reason_wins() {
        let scope = ProcessExecutionScope::new(
            PipId::from_index(1),
            0,
            MemoryCounters::default(),
            1_000,
        );
        assert!(!scope.is_cancel_requested());
        scope.cancel(CancelReason::ResourcePressure);
        scope.cancel(CancelReason::BuildTermination);
        assert!(scope.is_cancel_requested());
        assert_eq!(scope.cancel_reason(), Some(CancelReason::ResourcePressure));
    }

    #[test]
    fn suspend_resume_toggles_once() {
        let scope = ProcessExecutionScope::new(
            PipId::from_index(2),
            0,
            MemoryCounters::default(),
            1_000,
        );
        assert!(scope.try_suspend());
        assert!(!scope.try_suspend());
        assert!(scope.is_suspended());
        assert!(scope.try_resume());
        assert!(!scope.try_resume());
    }

    #[test]
    fn registry_tracks_scopes() {
        let registry = RunningProcessRegistry::new();
        let scope = Arc::new(ProcessExecutionScope::new(
            PipId::from_index(3),
            0,
            MemoryCounters::default(),
            1_000,
        ));
        registry.register(Arc::clone(&scope));
        assert_eq!(registry.len(), 1);
        registry.unregister(scope.pip);
        assert!(registry.is_empty());
    }
}
