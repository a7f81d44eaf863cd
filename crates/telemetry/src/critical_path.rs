// SPDX-License-Identifier: Apache-2.0

//! Critical-path record.
//!
//! Tracks the longest observed chain of pip durations and how well the
//! historical estimates predicted it. The tail pip id is a single atomic
//! updated by CAS together with its length, packed into one 64-bit word so
//! readers never see a torn (length, tail) pair.

use buildflow_graph::PipId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Critical-path statistics, updated as pips complete.
#[derive(Debug, Default)]
pub struct CriticalPathStats {
    /// Completions whose duration had a historical estimate.
    num_hits: AtomicU64,
    /// Completions estimated with a type-based default.
    num_wild_guesses: AtomicU64,
    /// High 32 bits: longest path in milliseconds. Low 32 bits: tail pip.
    longest: AtomicU64,
}

fn pack(path_ms: u32, tail: PipId) -> u64 {
    (u64::from(path_ms) << 32) | u64::from(tail.index() as u32)
}

impl CriticalPathStats {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the completion of `pip` whose chain length is `path_ms`.
    ///
    /// `had_estimate` states whether the initial priority pass had a
    /// historical duration for this pip.
    pub fn record(&self, pip: PipId, path_ms: u32, had_estimate: bool) {
        if had_estimate {
            let _ = self.num_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.num_wild_guesses.fetch_add(1, Ordering::Relaxed);
        }

        let candidate = pack(path_ms, pip);
        let mut current = self.longest.load(Ordering::Relaxed);
        while (current >> 32) < u64::from(path_ms) {
            match self.longest.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// The longest known chain in milliseconds.
    #[must_use]
    pub fn longest_path_ms(&self) -> u32 {
        (self.longest.load(Ordering::Relaxed) >> 32) as u32
    }

    /// The tail pip of the longest known chain, when any chain was recorded.
    #[must_use]
    pub fn tail_pip(&self) -> Option<PipId> {
        let packed = self.longest.load(Ordering::Relaxed);
        if packed == 0 {
            None
        } else {
            Some(PipId::from_index(packed as u32))
        }
    }

    /// Completions with a historical estimate.
    #[must_use]
    pub fn num_hits(&self) -> u64 {
        self.num_hits.load(Ordering::Relaxed)
    }

    /// Completions estimated with a type-based default.
    #[must_use]
    pub fn num_wild_guesses(&self) -> u64 {
        self.num_wild_guesses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_chain_and_tail_update_together() {
        let stats = CriticalPathStats::new();
        stats.record(PipId::from_index(1), 100, true);
        stats.record(PipId::from_index(2), 300, false);
        stats.record(PipId::from_index(3), 200, true);

        assert_eq!(stats.longest_path_ms(), 300);
        assert_eq!(stats.tail_pip(), Some(PipId::from_index(2)));
        assert_eq!(stats.num_hits(), 2);
        assert_eq!(stats.num_wild_guesses(), 1);
    }

    #[test]
    fn empty_record_has_no_tail() {
        let stats = CriticalPathStats::new();
        assert_eq!(stats.tail_pip(), None);
        assert_eq!(stats.longest_path_ms(), 0);
    }
}
