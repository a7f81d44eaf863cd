// SPDX-License-Identifier: Apache-2.0

//! Per-pip mutable runtime state.
//!
//! One record per pip, all words atomic. A record is mutated by at most one
//! step-execution task at a time, but readiness bookkeeping (refcount
//! decrements, skip requests) races against it from completing dependencies;
//! state transitions therefore go through compare-exchange and the refcount
//! through fetch-sub.

use buildflow_api::{PipResultStatus, PipState};
use buildflow_graph::PipId;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

/// The refcount sentinel of a pip that reached a terminal state.
pub const COMPLETED_REF_COUNT: i32 = -1;

fn state_from_u8(value: u8) -> PipState {
    PipState::ALL[value as usize]
}

fn result_from_u8(value: u8) -> PipResultStatus {
    match value {
        0 => PipResultStatus::NotRun,
        1 => PipResultStatus::Executed,
        2 => PipResultStatus::FromCache,
        3 => PipResultStatus::UpToDate,
        4 => PipResultStatus::Failed,
        5 => PipResultStatus::Canceled,
        _ => PipResultStatus::Skipped,
    }
}

fn result_to_u8(value: PipResultStatus) -> u8 {
    match value {
        PipResultStatus::NotRun => 0,
        PipResultStatus::Executed => 1,
        PipResultStatus::FromCache => 2,
        PipResultStatus::UpToDate => 3,
        PipResultStatus::Failed => 4,
        PipResultStatus::Canceled => 5,
        PipResultStatus::Skipped => 6,
    }
}

/// Mutable runtime state of one pip.
pub struct PipRuntimeInfo {
    state: AtomicU8,
    ref_count: AtomicI32,
    priority: AtomicI32,
    critical_path_ms: AtomicI32,
    process_execute_time_ms: AtomicI32,
    result: AtomicU8,
    uncacheable_impacted: AtomicBool,
    skip_requested: AtomicBool,
    had_historic_estimate: AtomicBool,
}

impl Default for PipRuntimeInfo {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PipState::Ignored.index() as u8),
            ref_count: AtomicI32::new(0),
            priority: AtomicI32::new(0),
            critical_path_ms: AtomicI32::new(0),
            process_execute_time_ms: AtomicI32::new(0),
            result: AtomicU8::new(result_to_u8(PipResultStatus::NotRun)),
            uncacheable_impacted: AtomicBool::new(false),
            skip_requested: AtomicBool::new(false),
            had_historic_estimate: AtomicBool::new(false),
        }
    }
}

impl PipRuntimeInfo {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> PipState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the pip reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Transitions `from -> to`. Fails when another thread moved first.
    ///
    /// Transitions are strictly monotonic: `to` must order after `from`.
    pub fn try_transition(&self, from: PipState, to: PipState) -> bool {
        debug_assert!(to.index() > from.index(), "state transitions are monotonic");
        self.state
            .compare_exchange(
                from.index() as u8,
                to.index() as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves the pip to terminal state `to` with `result`, setting the
    /// refcount sentinel exactly once.
    ///
    /// Returns false when the pip was already terminal; the loser must not
    /// repeat completion side effects.
    pub fn transition_to_terminal(&self, to: PipState, result: PipResultStatus) -> bool {
        debug_assert!(to.is_terminal());
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if state_from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to.index() as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.result.store(result_to_u8(result), Ordering::Release);
                    self.ref_count.store(COMPLETED_REF_COUNT, Ordering::Release);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Initializes the refcount from the heavy in-degree.
    pub fn init_ref_count(&self, count: i32) {
        self.ref_count.store(count, Ordering::Release);
    }

    /// Decrements the refcount for one completed heavy dependency and
    /// returns the new value.
    pub fn decrement_ref_count(&self) -> i32 {
        let new = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(new >= 0, "refcount decremented past zero");
        new
    }

    /// Current refcount. `COMPLETED_REF_COUNT` once terminal.
    #[must_use]
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Assigns the priority word. Assigned before any pip runs and never
    /// mutated thereafter.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    /// The priority word.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    /// Records the critical-path length ending at this pip.
    pub fn set_critical_path_ms(&self, ms: i32) {
        self.critical_path_ms.store(ms, Ordering::Release);
    }

    /// The critical-path length ending at this pip.
    #[must_use]
    pub fn critical_path_ms(&self) -> i32 {
        self.critical_path_ms.load(Ordering::Acquire)
    }

    /// Records the wall-clock execute time of the final attempt.
    pub fn set_process_execute_time_ms(&self, ms: i32) {
        self.process_execute_time_ms.store(ms, Ordering::Release);
    }

    /// The wall-clock execute time of the final attempt.
    #[must_use]
    pub fn process_execute_time_ms(&self) -> i32 {
        self.process_execute_time_ms.load(Ordering::Acquire)
    }

    /// How the pip concluded.
    #[must_use]
    pub fn result(&self) -> PipResultStatus {
        result_from_u8(self.result.load(Ordering::Acquire))
    }

    /// Marks the pip impacted by an uncacheable dependency.
    pub fn set_uncacheable_impacted(&self) {
        self.uncacheable_impacted.store(true, Ordering::Release);
    }

    /// Whether an uncacheable dependency impacts this pip.
    #[must_use]
    pub fn is_uncacheable_impacted(&self) -> bool {
        self.uncacheable_impacted.load(Ordering::Acquire)
    }

    /// Requests that the pip be skipped when it becomes runnable.
    /// Idempotent under races.
    pub fn request_skip(&self) {
        self.skip_requested.store(true, Ordering::Release);
    }

    /// Whether a skip was requested.
    #[must_use]
    pub fn is_skip_requested(&self) -> bool {
        self.skip_requested.load(Ordering::Acquire)
    }

    /// Marks whether the priority pass had a historical duration.
    pub fn set_had_historic_estimate(&self, had: bool) {
        self.had_historic_estimate.store(had, Ordering::Release);
    }

    /// Whether the priority pass had a historical duration.
    #[must_use]
    pub fn had_historic_estimate(&self) -> bool {
        self.had_historic_estimate.load(Ordering::Acquire)
    }
}

/// The runtime-info table, indexed densely by pip id.
pub struct RuntimeInfoTable {
    infos: Vec<PipRuntimeInfo>,
}

impl RuntimeInfoTable {
    /// Creates a table for `count` pips, all `Ignored`.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            infos: (0..count).map(|_| PipRuntimeInfo::default()).collect(),
        }
    }

    /// The record for `pip`.
    #[must_use]
    pub fn get(&self, pip: PipId) -> &PipRuntimeInfo {
        &self.infos[pip.index()]
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Iterates all records with their pip ids.
    pub fn iter(&self) -> impl Iterator<Item = (PipId, &PipRuntimeInfo)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(i, info)| (PipId::from_index(i as u32), info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_wins_once() {
        let info = PipRuntimeInfo::default();
        assert!(info.try_transition(PipState::Ignored, PipState::Waiting));
        assert!(info.try_transition(PipState::Waiting, PipState::Ready));
        assert!(info.try_transition(PipState::Ready, PipState::Running));

        assert!(info.transition_to_terminal(PipState::Done, PipResultStatus::Executed));
        assert!(!info.transition_to_terminal(PipState::Failed, PipResultStatus::Failed));
        assert_eq!(info.state(), PipState::Done);
        assert_eq!(info.result(), PipResultStatus::Executed);
        assert_eq!(info.ref_count(), COMPLETED_REF_COUNT);
    }

    #[test]
    fn refcount_decrements_to_zero() {
        let info = PipRuntimeInfo::default();
        info.init_ref_count(2);
        assert_eq!(info.decrement_ref_count(), 1);
        assert_eq!(info.decrement_ref_count(), 0);
        assert_eq!(info.ref_count(), 0);
    }

    #[test]
    fn lost_state_race_is_reported() {
        let info = PipRuntimeInfo::default();
        assert!(info.try_transition(PipState::Ignored, PipState::Waiting));
        // A racer already moved it; the stale transition fails.
        assert!(!info.try_transition(PipState::Ignored, PipState::Waiting));
    }

    #[test]
    fn skip_requests_are_idempotent() {
        let info = PipRuntimeInfo::default();
        assert!(!info.is_skip_requested());
        info.request_skip();
        info.request_skip();
        assert!(info.is_skip_requested());
    }
}
