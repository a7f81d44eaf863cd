// SPDX-License-Identifier: Apache-2.0

//! The per-pip execution steps and their dispatch routing.
//!
//! Which queue a step runs on is a pure function of the step and the pip
//! type; the inline-or-enqueue decision after each step is a pure function
//! of the previous and next queue.

use buildflow_graph::PipType;
use buildflow_queue::DispatcherKind;
use std::fmt;

/// Position of a pip in its execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipExecutionStep {
    /// Not started.
    None,
    /// Hash source inputs, resolve module affinity.
    Start,
    /// Build termination reached the pip.
    Cancel,
    /// An upstream failure or a policy skipped the pip.
    Skip,
    /// Consult the incremental scheduling state.
    CheckIncrementalSkip,
    /// Wait briefly to batch cache lookups.
    DelayedCacheLookup,
    /// Acquire a cache-lookup slot on some worker.
    ChooseWorkerCacheLookup,
    /// Ask the cache for a hit under the two-phase fingerprint.
    CacheLookup,
    /// Replay cached outputs.
    RunFromCache,
    /// Acquire a process or IPC slot on some worker.
    ChooseWorkerCpu,
    /// Materialize required inputs on the chosen worker.
    MaterializeInputs,
    /// Execute a non-process pip (copy, write, seal, IPC, meta).
    ExecuteNonProcessPip,
    /// Run the external process on the chosen worker.
    ExecuteProcess,
    /// Analyze, publish, and report an execution result.
    PostProcess,
    /// Replicate outputs; may run in the background.
    MaterializeOutputs,
    /// Complete the pip: terminal transition and dependent propagation.
    HandleResult,
    /// Terminal.
    Done,
}

impl PipExecutionStep {
    /// The queue this step runs on for a pip of `pip_type`.
    #[must_use]
    pub fn dispatcher_kind(self, pip_type: PipType) -> DispatcherKind {
        match self {
            PipExecutionStep::None
            | PipExecutionStep::Cancel
            | PipExecutionStep::HandleResult
            | PipExecutionStep::Done => DispatcherKind::None,
            PipExecutionStep::Skip => DispatcherKind::Light,
            PipExecutionStep::Start => {
                if pip_type.is_meta() {
                    DispatcherKind::Light
                } else {
                    DispatcherKind::IO
                }
            }
            PipExecutionStep::CheckIncrementalSkip => DispatcherKind::Light,
            PipExecutionStep::DelayedCacheLookup => DispatcherKind::DelayedCacheLookup,
            PipExecutionStep::ChooseWorkerCacheLookup => DispatcherKind::ChooseWorkerCacheLookup,
            PipExecutionStep::CacheLookup => DispatcherKind::CacheLookup,
            PipExecutionStep::RunFromCache => DispatcherKind::IO,
            PipExecutionStep::ChooseWorkerCpu => DispatcherKind::ChooseWorkerCpu,
            PipExecutionStep::MaterializeInputs | PipExecutionStep::MaterializeOutputs => {
                DispatcherKind::Materialize
            }
            PipExecutionStep::ExecuteProcess => DispatcherKind::CPU,
            PipExecutionStep::ExecuteNonProcessPip => match pip_type {
                PipType::SealDirectory => DispatcherKind::SealDirs,
                PipType::CopyFile | PipType::WriteFile => DispatcherKind::IO,
                PipType::Ipc => DispatcherKind::CPU,
                _ => DispatcherKind::Light,
            },
            PipExecutionStep::PostProcess => DispatcherKind::IO,
        }
    }
}

impl fmt::Display for PipExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipExecutionStep::None => "None",
            PipExecutionStep::Start => "Start",
            PipExecutionStep::Cancel => "Cancel",
            PipExecutionStep::Skip => "Skip",
            PipExecutionStep::CheckIncrementalSkip => "CheckIncrementalSkip",
            PipExecutionStep::DelayedCacheLookup => "DelayedCacheLookup",
            PipExecutionStep::ChooseWorkerCacheLookup => "ChooseWorkerCacheLookup",
            PipExecutionStep::CacheLookup => "CacheLookup",
            PipExecutionStep::RunFromCache => "RunFromCache",
            PipExecutionStep::ChooseWorkerCpu => "ChooseWorkerCpu",
            PipExecutionStep::MaterializeInputs => "MaterializeInputs",
            PipExecutionStep::ExecuteNonProcessPip => "ExecuteNonProcessPip",
            PipExecutionStep::ExecuteProcess => "ExecuteProcess",
            PipExecutionStep::PostProcess => "PostProcess",
            PipExecutionStep::MaterializeOutputs => "MaterializeOutputs",
            PipExecutionStep::HandleResult => "HandleResult",
            PipExecutionStep::Done => "Done",
        };
        write!(f, "{label}")
    }
}

/// Whether to run the next step inline on the current thread instead of
/// re-enqueueing.
///
/// Inlining is bounded: a step never re-inlines into a choose-worker queue,
/// and `None`-queue steps always run inline. Remote-bound completions and
/// cancellations also stay inline to avoid re-queue churn.
#[must_use]
pub fn should_inline(
    next: DispatcherKind,
    previous: DispatcherKind,
    awaiting_remote: bool,
    cancelling: bool,
) -> bool {
    if next == DispatcherKind::None || cancelling || awaiting_remote {
        return true;
    }
    next == previous && !next.is_choose_worker()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_queue_steps_always_inline() {
        assert!(should_inline(
            DispatcherKind::None,
            DispatcherKind::CPU,
            false,
            false
        ));
    }

    #[test]
    fn same_queue_inlines_except_choose_worker() {
        assert!(should_inline(
            DispatcherKind::IO,
            DispatcherKind::IO,
            false,
            false
        ));
        assert!(!should_inline(
            DispatcherKind::ChooseWorkerCpu,
            DispatcherKind::ChooseWorkerCpu,
            false,
            false
        ));
    }

    #[test]
    fn queue_changes_enqueue() {
        assert!(!should_inline(
            DispatcherKind::CPU,
            DispatcherKind::CacheLookup,
            false,
            false
        ));
    }

    #[test]
    fn cancellation_and_remote_completion_stay_inline() {
        assert!(should_inline(
            DispatcherKind::CPU,
            DispatcherKind::CacheLookup,
            true,
            false
        ));
        assert!(should_inline(
            DispatcherKind::CPU,
            DispatcherKind::CacheLookup,
            false,
            true
        ));
    }

    #[test]
    fn dispatcher_kinds_fork_on_pip_type() {
        assert_eq!(
            PipExecutionStep::Start.dispatcher_kind(PipType::Value),
            DispatcherKind::Light
        );
        assert_eq!(
            PipExecutionStep::Start.dispatcher_kind(PipType::Process),
            DispatcherKind::IO
        );
        assert_eq!(
            PipExecutionStep::ExecuteNonProcessPip.dispatcher_kind(PipType::SealDirectory),
            DispatcherKind::SealDirs
        );
        assert_eq!(
            PipExecutionStep::ExecuteNonProcessPip.dispatcher_kind(PipType::Ipc),
            DispatcherKind::CPU
        );
        assert_eq!(
            PipExecutionStep::ExecuteProcess.dispatcher_kind(PipType::Process),
            DispatcherKind::CPU
        );
        assert_eq!(
            PipExecutionStep::HandleResult.dispatcher_kind(PipType::Process),
            DispatcherKind::None
        );
    }
}
