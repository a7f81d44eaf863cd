// SPDX-License-Identifier: Apache-2.0

//! Step-level error taxonomy.
//!
//! Step failures are values, not exceptions: every execution step returns a
//! `Result<_, StepError>` and retries are explicit transitions driven by the
//! scheduler, never unwound control flow.

use crate::execution::RetryReason;
use buildflow_graph::PipId;
use std::fmt;

/// An error reported by a collaborator implementation.
///
/// The core treats collaborator internals as opaque; only the failed
/// operation name and a rendered message cross the boundary.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{operation}: {message}")]
pub struct CollaboratorError {
    /// The collaborator operation that failed (e.g. `cache.lookup`).
    pub operation: &'static str,
    /// Rendered failure message.
    pub message: String,
}

impl CollaboratorError {
    /// Builds an error for `operation` with a rendered `message`.
    #[must_use]
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Why a pip was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An upstream heavy-edge dependency failed.
    FailedDependency,
    /// An upstream heavy-edge dependency was itself skipped.
    SkippedDependency,
    /// Cache-only mode is on and the cache lookup missed.
    CacheMissInCacheOnlyMode,
    /// The service this pip depends on failed before reporting ready.
    ServiceStartupFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::FailedDependency => "failed dependency",
            SkipReason::SkippedDependency => "skipped dependency",
            SkipReason::CacheMissInCacheOnlyMode => "cache miss in cache-only mode",
            SkipReason::ServiceStartupFailed => "service startup failed",
        };
        write!(f, "{label}")
    }
}

/// All ways an execution step can fail.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StepError {
    /// A source input could not be hashed.
    #[error("Hashing source dependencies of {pip} failed: {error}")]
    SourceHashingFailed {
        /// The affected pip.
        pip: PipId,
        /// The underlying collaborator failure.
        error: CollaboratorError,
    },

    /// Inputs could not be placed on the chosen worker.
    #[error("Materializing inputs of {pip} failed: {error}")]
    DependencyMaterializationFailed {
        /// The affected pip.
        pip: PipId,
        /// The underlying collaborator failure.
        error: CollaboratorError,
    },

    /// A cache lookup, replay, or publish failed.
    #[error("Cache operation for {pip} failed: {error}")]
    CacheOperationFailed {
        /// The affected pip.
        pip: PipId,
        /// The underlying collaborator failure.
        error: CollaboratorError,
    },

    /// The process exited nonzero or performed disallowed accesses.
    #[error("Execution of {pip} failed{}", exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    ExecutionFailed {
        /// The affected pip.
        pip: PipId,
        /// Exit code, when the process ran to an exit.
        exit_code: Option<i32>,
    },

    /// A failure the scheduler may retry up to a configured cap.
    #[error("Retryable failure ({reason}) executing {pip}: {message}")]
    Retryable {
        /// The affected pip.
        pip: PipId,
        /// Why a retry may succeed.
        reason: RetryReason,
        /// Rendered failure message.
        message: String,
    },

    /// Build termination reached the pip.
    #[error("{pip} was canceled")]
    Canceled {
        /// The affected pip.
        pip: PipId,
    },

    /// A dependency failed or policy skipped the pip.
    #[error("{pip} was skipped: {reason}")]
    Skipped {
        /// The affected pip.
        pip: PipId,
        /// Why the pip was skipped.
        reason: SkipReason,
    },
}

impl StepError {
    /// The pip this error is about.
    #[must_use]
    pub const fn pip(&self) -> PipId {
        match self {
            StepError::SourceHashingFailed { pip, .. }
            | StepError::DependencyMaterializationFailed { pip, .. }
            | StepError::CacheOperationFailed { pip, .. }
            | StepError::ExecutionFailed { pip, .. }
            | StepError::Retryable { pip, .. }
            | StepError::Canceled { pip }
            | StepError::Skipped { pip, .. } => *pip,
        }
    }

    /// The retry reason, when this failure is retryable.
    #[must_use]
    pub const fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            StepError::Retryable { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
