// SPDX-License-Identifier: Apache-2.0

//! Execution data types shared between the scheduler core and its
//! collaborators.

use buildflow_graph::ArtifactPath;
use std::fmt;
use std::time::Duration;

/// Content hash of a file, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    /// A hash of all zeroes, used for absent or irrelevant content.
    pub const ZERO: ContentHash = ContentHash([0; 16]);

    /// Builds a hash from a 128-bit value.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    /// Builds a hash from the leading bytes of a longer digest,
    /// zero-padding when the digest is shorter.
    #[must_use]
    pub fn from_digest_prefix(digest: &[u8]) -> Self {
        let mut out = [0u8; 16];
        let len = digest.len().min(16);
        out[..len].copy_from_slice(&digest[..len]);
        Self(out)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Hash and size of one source dependency.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceHash {
    /// The source path.
    pub path: ArtifactPath,
    /// Hash of the content.
    pub hash: ContentHash,
    /// Size in bytes, for worker setup-cost estimation.
    pub size_bytes: u64,
}

/// Hashes of a pip's source dependencies, in declaration order.
pub type SourceHashes = Vec<SourceHash>;

/// Memory footprint of a process execution, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MemoryCounters {
    /// Peak working set.
    pub peak_working_set_mb: u32,
    /// Average working set over the execution.
    pub average_working_set_mb: u32,
    /// Peak committed memory.
    pub peak_commit_mb: u32,
}

impl MemoryCounters {
    /// Grows every counter by `factor`, taking the observed peak as a floor.
    ///
    /// Used when a pip is retried after a memory cancellation: the next
    /// reservation must be at least `factor` times the previous expectation
    /// and never below what was actually observed.
    #[must_use]
    pub fn inflated(&self, factor: f64, observed_peak_mb: u32) -> Self {
        let grow = |mb: u32| -> u32 {
            let grown = (f64::from(mb) * factor).ceil();
            if grown >= f64::from(u32::MAX) {
                u32::MAX
            } else {
                grown as u32
            }
        };
        Self {
            peak_working_set_mb: grow(self.peak_working_set_mb).max(observed_peak_mb),
            average_working_set_mb: grow(self.average_working_set_mb),
            peak_commit_mb: grow(self.peak_commit_mb).max(observed_peak_mb),
        }
    }
}

/// Why an execution was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CancelReason {
    /// The build is terminating.
    BuildTermination,
    /// The resource manager reclaimed the pip to relieve memory pressure.
    ResourcePressure,
}

/// Why a failed execution may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RetryReason {
    /// RAM or commit pressure interrupted the execution.
    ResourceExhaustion,
    /// The assigned remote worker detached mid-flight.
    StoppedWorker,
    /// Sandbox preparation or VM provisioning failed.
    PrepOrVmFailure,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetryReason::ResourceExhaustion => "resource-exhaustion",
            RetryReason::StoppedWorker => "stopped-worker",
            RetryReason::PrepOrVmFailure => "prep-or-vm-failure",
        };
        write!(f, "{label}")
    }
}

/// Outcome of a sandboxed process execution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecutionStatus {
    /// The process exited successfully with all accesses allowed.
    Succeeded,
    /// The process exited nonzero or performed disallowed accesses.
    Failed {
        /// Exit code, when the process ran to an exit.
        exit_code: Option<i32>,
    },
    /// The execution was canceled before completion.
    Canceled {
        /// Why it was canceled.
        reason: CancelReason,
    },
    /// The execution failed for a reason the scheduler may retry.
    RetryableFailure {
        /// Why a retry may succeed.
        reason: RetryReason,
    },
}

impl ExecutionStatus {
    /// Whether the execution completed successfully.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded)
    }
}

/// The kind of a file access observed by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ObservedAccessKind {
    /// The file was read.
    Read,
    /// The file was written.
    Write,
    /// Existence was probed without opening.
    Probe,
}

/// A file access observed during sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ObservedAccess {
    /// Accessed path.
    pub path: ArtifactPath,
    /// Kind of access.
    pub kind: ObservedAccessKind,
}

/// Content produced at an output path.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OutputContent {
    /// Output path.
    pub path: ArtifactPath,
    /// Hash of the produced content.
    pub hash: ContentHash,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// Where reported output content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutputOrigin {
    /// Produced by executing the pip.
    Produced,
    /// Replayed from the content cache.
    FromCache,
    /// Already up to date on disk.
    UpToDate,
}

/// Performance of one process execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ProcessPerformance {
    /// Wall-clock execution time.
    #[serde(with = "duration_millis")]
    pub wall_clock: Duration,
    /// Memory footprint.
    pub memory: MemoryCounters,
    /// Bytes read by the process.
    pub io_read_bytes: u64,
    /// Bytes written by the process.
    pub io_write_bytes: u64,
}

/// Full result of executing (or replaying) a pip.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExecutionResult {
    /// Final status.
    pub status: ExecutionStatus,
    /// Execution performance.
    pub performance: ProcessPerformance,
    /// File accesses observed by the sandbox.
    pub observed_accesses: Vec<ObservedAccess>,
    /// Content produced at declared outputs.
    pub outputs: Vec<OutputContent>,
    /// Files written under shared-opaque directories; these must be flagged
    /// so the next build's scrubber can find them.
    pub shared_opaque_outputs: Vec<ArtifactPath>,
}

impl ExecutionResult {
    /// A successful result with no outputs, used by trivial executions.
    #[must_use]
    pub fn empty_success() -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            performance: ProcessPerformance::default(),
            observed_accesses: Vec::new(),
            outputs: Vec::new(),
            shared_opaque_outputs: Vec::new(),
        }
    }
}

/// Scheduling state of a pip.
///
/// Transitions are strictly monotonic toward a terminal state; once
/// terminal, a pip is never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PipState {
    /// In the graph, not scheduled by the current filter.
    Ignored,
    /// Scheduled, waiting on heavy-edge dependencies.
    Waiting,
    /// All heavy-edge dependencies terminal; queued to run.
    Ready,
    /// Inside the execution state machine.
    Running,
    /// Terminal: completed successfully.
    Done,
    /// Terminal: failed.
    Failed,
    /// Terminal: canceled.
    Canceled,
    /// Terminal: skipped.
    Skipped,
}

impl PipState {
    /// Every state, in a stable order usable for dense indexing.
    pub const ALL: [PipState; 8] = [
        PipState::Ignored,
        PipState::Waiting,
        PipState::Ready,
        PipState::Running,
        PipState::Done,
        PipState::Failed,
        PipState::Canceled,
        PipState::Skipped,
    ];

    /// Dense index of this state within [`PipState::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            PipState::Ignored => 0,
            PipState::Waiting => 1,
            PipState::Ready => 2,
            PipState::Running => 3,
            PipState::Done => 4,
            PipState::Failed => 5,
            PipState::Canceled => 6,
            PipState::Skipped => 7,
        }
    }

    /// Whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            PipState::Done | PipState::Failed | PipState::Canceled | PipState::Skipped
        )
    }
}

/// How a pip concluded, for counters and downstream decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PipResultStatus {
    /// Not run yet.
    NotRun,
    /// Executed on a worker.
    Executed,
    /// Replayed from the content cache.
    FromCache,
    /// Skipped because incremental state proved it unchanged and materialized.
    UpToDate,
    /// Failed terminally.
    Failed,
    /// Canceled by build termination or resource reclamation.
    Canceled,
    /// Skipped due to an upstream failure or by policy.
    Skipped,
}

impl PipResultStatus {
    /// Whether this result allows dependents to run.
    #[must_use]
    pub const fn is_successful(&self) -> bool {
        matches!(
            self,
            PipResultStatus::Executed | PipResultStatus::FromCache | PipResultStatus::UpToDate
        )
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        u64::try_from(d.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflated_memory_takes_observed_peak_as_floor() {
        let counters = MemoryCounters {
            peak_working_set_mb: 100,
            average_working_set_mb: 80,
            peak_commit_mb: 120,
        };
        let grown = counters.inflated(1.25, 500);
        assert_eq!(grown.peak_working_set_mb, 500);
        assert_eq!(grown.average_working_set_mb, 100);
        assert_eq!(grown.peak_commit_mb, 500);

        let grown = counters.inflated(1.25, 0);
        assert_eq!(grown.peak_working_set_mb, 125);
        assert_eq!(grown.peak_commit_mb, 150);
    }

    #[test]
    fn content_hash_displays_hex() {
        let hash = ContentHash::from_u128(0x0102);
        assert!(format!("{hash}").starts_with("0201"));
    }

    #[test]
    fn digest_prefix_truncates_and_pads() {
        let long = [0xAB; 32];
        assert_eq!(ContentHash::from_digest_prefix(&long).0, [0xAB; 16]);

        let short = [0x01, 0x02];
        let padded = ContentHash::from_digest_prefix(&short);
        assert_eq!(&padded.0[..2], &short);
        assert_eq!(&padded.0[2..], &[0; 14]);
    }

    #[test]
    fn result_status_success_classes() {
        assert!(PipResultStatus::FromCache.is_successful());
        assert!(PipResultStatus::UpToDate.is_successful());
        assert!(!PipResultStatus::Skipped.is_successful());
        assert!(!PipResultStatus::NotRun.is_successful());
    }
}
