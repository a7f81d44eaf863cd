// SPDX-License-Identifier: Apache-2.0

//! Status rows and the final performance surface.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One status-timer frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Milliseconds since the build started.
    pub elapsed_ms: u64,
    /// Pips in the Ready or Running states.
    pub active_pips: u64,
    /// Process pips currently executing.
    pub running_processes: usize,
    /// Items waiting in dispatch queues (semaphore tier included).
    pub queued: usize,
    /// Machine RAM usage percentage.
    pub ram_percent: u32,
    /// Machine commit usage percentage.
    pub commit_percent: u32,
    /// Resource that most recently blocked worker selection.
    pub limiting_resource: String,
    /// Ratio of actual to expected status-tick period.
    pub unresponsiveness_factor: f64,
}

/// Final stats surface returned by `log_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerPerformanceInfo {
    /// Whether the build succeeded.
    pub success: bool,
    /// Wall-clock duration of the drain, in milliseconds.
    pub duration_ms: u64,
    /// Scheduler-wide counters by stable name.
    pub counters: Vec<(String, u64)>,
    /// Longest critical path observed, in milliseconds.
    pub critical_path_ms: u32,
    /// Tail pip index of the critical path, when one was recorded.
    pub critical_path_tail: Option<u32>,
    /// Critical-path estimate hits.
    pub critical_path_estimate_hits: u64,
    /// Critical-path estimates that fell back to type defaults.
    pub critical_path_wild_guesses: u64,
}

/// Detects status-timer starvation.
///
/// The factor is the ratio of the actual tick period to the configured one;
/// a factor above [`UnresponsivenessTracker::ALERT_FACTOR`] indicates the
/// process was too busy to service its timers and is worth a diagnostic.
#[derive(Debug)]
pub struct UnresponsivenessTracker {
    expected_period: Duration,
    last_tick: Option<Instant>,
    last_factor: f64,
}

impl UnresponsivenessTracker {
    /// Factor above which a diagnostic is logged.
    pub const ALERT_FACTOR: f64 = 10.0;

    /// Creates a tracker for the configured status period.
    #[must_use]
    pub fn new(expected_period: Duration) -> Self {
        Self {
            expected_period,
            last_tick: None,
            last_factor: 1.0,
        }
    }

    /// Records a tick at `now` and returns the current factor.
    pub fn tick(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last_tick {
            let actual = now.duration_since(last);
            let expected = self.expected_period.as_secs_f64().max(f64::MIN_POSITIVE);
            self.last_factor = actual.as_secs_f64() / expected;
            if self.last_factor > Self::ALERT_FACTOR {
                tracing::warn!(
                    name: "scheduler.unresponsive",
                    factor = self.last_factor,
                    expected_ms = self.expected_period.as_millis() as u64,
                    actual_ms = actual.as_millis() as u64,
                );
            }
        }
        self.last_tick = Some(now);
        self.last_factor
    }

    /// The factor computed at the last tick.
    #[must_use]
    pub fn last_factor(&self) -> f64 {
        self.last_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_establishes_the_baseline() {
        let mut tracker = UnresponsivenessTracker::new(Duration::from_secs(2));
        let start = Instant::now();
        assert!((tracker.tick(start) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn late_ticks_raise_the_factor() {
        let mut tracker = UnresponsivenessTracker::new(Duration::from_secs(2));
        let start = Instant::now();
        let _ = tracker.tick(start);
        let factor = tracker.tick(start + Duration::from_secs(30));
        assert!(factor > UnresponsivenessTracker::ALERT_FACTOR);
        assert!((tracker.last_factor() - factor).abs() < f64::EPSILON);
    }

    #[test]
    fn performance_info_serializes() {
        let info = SchedulerPerformanceInfo {
            success: true,
            duration_ms: 1234,
            counters: vec![("ProcessPipCacheHits".to_owned(), 1)],
            critical_path_ms: 42,
            critical_path_tail: Some(7),
            critical_path_estimate_hits: 1,
            critical_path_wild_guesses: 0,
        };
        let json = serde_json::to_string(&info).expect("serialize");
        let back: SchedulerPerformanceInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, info);
    }
}
