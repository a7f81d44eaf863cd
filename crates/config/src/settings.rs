// SPDX-License-Identifier: Apache-2.0

//! Machine tuning knobs: queue parallelism and resource thresholds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub(crate) fn logical_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Maximum parallel degree per dispatch queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Process and IPC execution.
    #[serde(default = "default_cpu_degree")]
    pub cpu: u32,
    /// Cache replays, materialization-adjacent I/O.
    #[serde(default = "default_io_degree")]
    pub io: u32,
    /// Whether the I/O queue degree adapts to observed dispatch latency.
    #[serde(default = "default_true")]
    pub adaptive_io: bool,
    /// Meta pips and other trivial steps.
    #[serde(default = "default_light_degree")]
    pub light: u32,
    /// Input/output materialization steps.
    #[serde(default = "default_cpu_degree")]
    pub materialize: u32,
    /// Cache lookups.
    #[serde(default = "default_cache_lookup_degree")]
    pub cache_lookup: u32,
    /// Cache-lookup worker selection.
    #[serde(default = "default_one")]
    pub choose_worker_cache_lookup: u32,
    /// CPU worker selection.
    #[serde(default = "default_one")]
    pub choose_worker_cpu: u32,
    /// Delayed (batched) cache lookups.
    #[serde(default = "default_one")]
    pub delayed_cache_lookup: u32,
    /// Directory seal bookkeeping.
    #[serde(default = "default_seal_dirs_degree")]
    pub seal_dirs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_degree(),
            io: default_io_degree(),
            adaptive_io: true,
            light: default_light_degree(),
            materialize: default_cpu_degree(),
            cache_lookup: default_cache_lookup_degree(),
            choose_worker_cache_lookup: default_one(),
            choose_worker_cpu: default_one(),
            delayed_cache_lookup: default_one(),
            seal_dirs: default_seal_dirs_degree(),
        }
    }
}

impl QueueConfig {
    pub(crate) fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, degree) in [
            ("cpu", self.cpu),
            ("io", self.io),
            ("light", self.light),
            ("materialize", self.materialize),
            ("cache_lookup", self.cache_lookup),
            ("choose_worker_cache_lookup", self.choose_worker_cache_lookup),
            ("choose_worker_cpu", self.choose_worker_cpu),
            ("delayed_cache_lookup", self.delayed_cache_lookup),
            ("seal_dirs", self.seal_dirs),
        ] {
            if degree == 0 {
                errors.push(format!("{path_prefix}.{name} must be greater than 0"));
            }
        }
        errors
    }
}

fn default_cpu_degree() -> u32 {
    logical_cores()
}

fn default_io_degree() -> u32 {
    4
}

fn default_light_degree() -> u32 {
    logical_cores() * 4
}

fn default_cache_lookup_degree() -> u32 {
    logical_cores() * 2
}

pub(crate) const fn default_one() -> u32 {
    1
}

const fn default_seal_dirs_degree() -> u32 {
    8
}

pub(crate) const fn default_true() -> bool {
    true
}

/// Memory-pressure thresholds and the status timer period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Effective-RAM usage percentage above which RAM is considered low.
    #[serde(default = "default_ram_threshold")]
    pub ram_threshold_percent: u32,
    /// Effective free RAM below which RAM is considered low, in megabytes.
    #[serde(default = "default_min_free_ram")]
    pub minimum_free_ram_mb: u32,
    /// Commit usage percentage above which commit is considered low.
    #[serde(default = "default_commit_threshold")]
    pub commit_threshold_percent: u32,
    /// Status timer period; also drives the resource manager.
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
}

/// Commit usage percentage at which pips are cancelled immediately.
pub const CRITICAL_COMMIT_PERCENT: u32 = 98;

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            ram_threshold_percent: default_ram_threshold(),
            minimum_free_ram_mb: default_min_free_ram(),
            commit_threshold_percent: default_commit_threshold(),
            status_interval: default_status_interval(),
        }
    }
}

impl ResourceConfig {
    pub(crate) fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("ram_threshold_percent", self.ram_threshold_percent),
            ("commit_threshold_percent", self.commit_threshold_percent),
        ] {
            if !(1..=100).contains(&value) {
                errors.push(format!("{path_prefix}.{name} must be within 1..=100"));
            }
        }
        if self.status_interval.is_zero() {
            errors.push(format!("{path_prefix}.status_interval must be nonzero"));
        }
        errors
    }
}

const fn default_ram_threshold() -> u32 {
    90
}

const fn default_min_free_ram() -> u32 {
    500
}

const fn default_commit_threshold() -> u32 {
    95
}

const fn default_status_interval() -> Duration {
    Duration::from_secs(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults_scale_with_the_machine() {
        let queues = QueueConfig::default();
        assert!(queues.cpu >= 1);
        assert_eq!(queues.light, queues.cpu * 4);
        assert_eq!(queues.cache_lookup, queues.cpu * 2);
        assert!(queues.validation_errors("queues").is_empty());
    }

    #[test]
    fn zero_degrees_are_rejected_per_field() {
        let queues = QueueConfig {
            cpu: 0,
            seal_dirs: 0,
            ..QueueConfig::default()
        };
        let errors = queues.validation_errors("queues");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("queues.cpu")));
        assert!(errors.iter().any(|e| e.contains("queues.seal_dirs")));
    }

    #[test]
    fn resource_thresholds_are_percentages() {
        let resources = ResourceConfig {
            ram_threshold_percent: 0,
            commit_threshold_percent: 101,
            ..ResourceConfig::default()
        };
        assert_eq!(resources.validation_errors("resources").len(), 2);
    }
}
