// SPDX-License-Identifier: Apache-2.0

//! Adaptive degree control for the I/O queue.
//!
//! The monitor samples the wall-clock time of dispatched I/O steps and
//! nudges the queue's maximum parallel degree: fast samples mean the disk
//! has headroom, slow samples mean it is saturated.

use crate::{DispatcherKind, DispatchQueueSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

const SAMPLE_WINDOW: usize = 32;

/// Raises or lowers the I/O queue degree from observed step latencies.
pub struct IoQueueMonitor {
    samples: Mutex<VecDeque<Duration>>,
    low_watermark: Duration,
    high_watermark: Duration,
    min_degree: u32,
    max_degree: u32,
}

impl IoQueueMonitor {
    /// Creates a monitor bounded to `min_degree..=max_degree`.
    #[must_use]
    pub fn new(min_degree: u32, max_degree: u32) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
            low_watermark: Duration::from_millis(50),
            high_watermark: Duration::from_millis(500),
            min_degree: min_degree.max(1),
            max_degree: max_degree.max(min_degree.max(1)),
        }
    }

    /// Records the wall-clock time of one dispatched I/O step.
    pub fn observe(&self, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == SAMPLE_WINDOW {
            let _ = samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    /// The median of the current sample window.
    fn median(&self) -> Option<Duration> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    /// Applies one adjustment to the I/O queue of `set`, by at most one
    /// degree per call. Returns the new degree when it changed.
    pub fn adjust<T>(&self, set: &DispatchQueueSet<T>) -> Option<u32> {
        let median = self.median()?;
        let current = set.max_degree(DispatcherKind::IO);
        let target = if median < self.low_watermark {
            current.saturating_add(1).min(self.max_degree)
        } else if median > self.high_watermark {
            current.saturating_sub(1).max(self.min_degree)
        } else {
            current
        };
        if target == current {
            return None;
        }
        set.set_max_degree(DispatcherKind::IO, target);
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_set(degree: u32) -> DispatchQueueSet<()> {
        DispatchQueueSet::new(|kind| match kind {
            DispatcherKind::IO => degree,
            _ => 1,
        })
    }

    #[test]
    fn no_samples_means_no_adjustment() {
        let monitor = IoQueueMonitor::new(1, 16);
        let set = io_set(4);
        assert_eq!(monitor.adjust(&set), None);
        assert_eq!(set.max_degree(DispatcherKind::IO), 4);
    }

    #[test]
    fn fast_samples_raise_the_degree() {
        let monitor = IoQueueMonitor::new(1, 16);
        let set = io_set(4);
        for _ in 0..8 {
            monitor.observe(Duration::from_millis(5));
        }
        assert_eq!(monitor.adjust(&set), Some(5));
        assert_eq!(set.max_degree(DispatcherKind::IO), 5);
    }

    #[test]
    fn slow_samples_lower_the_degree_to_the_floor() {
        let monitor = IoQueueMonitor::new(2, 16);
        let set = io_set(3);
        for _ in 0..8 {
            monitor.observe(Duration::from_secs(2));
        }
        assert_eq!(monitor.adjust(&set), Some(2));
        // Already at the floor; no further adjustment.
        assert_eq!(monitor.adjust(&set), None);
    }
}
