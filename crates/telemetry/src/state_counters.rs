// SPDX-License-Identifier: Apache-2.0

//! The (pip-type, state) counter matrix behind status rows.

use buildflow_api::PipState;
use buildflow_graph::PipType;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate pip counts by type and state.
///
/// `transition` moves one pip between states atomically per cell; a snapshot
/// taken concurrently may be off by in-flight transitions but every row sums
/// back to the scheduled total once the build quiesces.
pub struct PipStateCounters {
    cells: [[AtomicU64; PipState::ALL.len()]; PipType::ALL.len()],
}

impl Default for PipStateCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PipStateCounters {
    /// Creates an all-zero matrix.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    /// Registers a pip entering its initial `state`.
    pub fn enter(&self, pip_type: PipType, state: PipState) {
        let _ = self.cells[pip_type.index()][state.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Moves one pip of `pip_type` from `from` to `to`.
    pub fn transition(&self, pip_type: PipType, from: PipState, to: PipState) {
        let row = &self.cells[pip_type.index()];
        let _ = row[from.index()].fetch_sub(1, Ordering::Relaxed);
        let _ = row[to.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count of pips of `pip_type` currently in `state`.
    #[must_use]
    pub fn count(&self, pip_type: PipType, state: PipState) -> u64 {
        self.cells[pip_type.index()][state.index()].load(Ordering::Relaxed)
    }

    /// Count of pips in `state` across all types.
    #[must_use]
    pub fn count_in_state(&self, state: PipState) -> u64 {
        self.cells
            .iter()
            .map(|row| row[state.index()].load(Ordering::Relaxed))
            .sum()
    }

    /// Count of pips of `pip_type` in any terminal state.
    #[must_use]
    pub fn terminal_count(&self, pip_type: PipType) -> u64 {
        PipState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| self.count(pip_type, *s))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_preserve_row_totals() {
        let counters = PipStateCounters::new();
        counters.enter(PipType::Process, PipState::Waiting);
        counters.enter(PipType::Process, PipState::Waiting);
        counters.transition(PipType::Process, PipState::Waiting, PipState::Ready);
        counters.transition(PipType::Process, PipState::Ready, PipState::Running);
        counters.transition(PipType::Process, PipState::Running, PipState::Done);

        assert_eq!(counters.count(PipType::Process, PipState::Waiting), 1);
        assert_eq!(counters.count(PipType::Process, PipState::Done), 1);
        assert_eq!(counters.terminal_count(PipType::Process), 1);

        let total: u64 = PipState::ALL
            .iter()
            .map(|s| counters.count(PipType::Process, *s))
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn state_totals_span_types() {
        let counters = PipStateCounters::new();
        counters.enter(PipType::Process, PipState::Ready);
        counters.enter(PipType::CopyFile, PipState::Ready);
        assert_eq!(counters.count_in_state(PipState::Ready), 2);
    }
}
