// SPDX-License-Identifier: Apache-2.0

//! Behavioral policy declarations: retry caps, feature switches, and
//! distribution requirements.

use crate::settings::{default_one, default_true};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry caps for the retryable failure classes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after a memory-pressure cancellation.
    #[serde(default = "default_low_memory_retries")]
    pub max_retries_due_to_low_memory: u32,
    /// Retries after sandbox-prep or VM provisioning failures.
    #[serde(default = "default_retryable_retries")]
    pub max_retries_due_to_retryable_failures: u32,
    /// Reassignments after a remote worker detaches mid-flight.
    #[serde(default = "default_one")]
    pub num_retry_failed_pips_on_another_worker: u32,
    /// Growth factor applied to expected memory on a low-memory retry.
    /// Values below 1.25 are raised to 1.25.
    #[serde(default = "default_low_memory_multiplier")]
    pub low_memory_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_due_to_low_memory: default_low_memory_retries(),
            max_retries_due_to_retryable_failures: default_retryable_retries(),
            num_retry_failed_pips_on_another_worker: default_one(),
            low_memory_multiplier: default_low_memory_multiplier(),
        }
    }
}

/// The smallest allowed memory growth factor on retry.
pub const MIN_LOW_MEMORY_MULTIPLIER: f64 = 1.25;

impl RetryConfig {
    pub(crate) fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.low_memory_multiplier < MIN_LOW_MEMORY_MULTIPLIER {
            errors.push(format!(
                "{path_prefix}.low_memory_multiplier must be at least {MIN_LOW_MEMORY_MULTIPLIER}"
            ));
        }
        errors
    }

    /// The memory growth factor, with the minimum enforced.
    #[must_use]
    pub fn effective_low_memory_multiplier(&self) -> f64 {
        self.low_memory_multiplier.max(MIN_LOW_MEMORY_MULTIPLIER)
    }
}

const fn default_low_memory_retries() -> u32 {
    2
}

const fn default_retryable_retries() -> u32 {
    3
}

fn default_low_memory_multiplier() -> f64 {
    MIN_LOW_MEMORY_MULTIPLIER
}

/// Feature switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    /// Cancel the remainder of the build on the first pip failure.
    #[serde(default)]
    pub stop_on_first_error: bool,
    /// Batch cache lookups through a short delay queue.
    #[serde(default)]
    pub delayed_cache_lookup_enabled: bool,
    /// Steer pips of a module to a preferred worker.
    #[serde(default)]
    pub module_affinity_enabled: bool,
    /// Materialize inputs only on the worker that runs the pip.
    #[serde(default = "default_true")]
    pub lazy_materialization: bool,
    /// Skip process pips on cache miss instead of executing them.
    #[serde(default)]
    pub cache_only_mode: bool,
    /// Re-execute cache hits to detect nondeterminism. Diagnostic only.
    #[serde(default)]
    pub determinism_probe: bool,
    /// Release remote workers early when the queued work no longer needs them.
    #[serde(default = "default_true")]
    pub early_worker_release: bool,
    /// Queued-work multiplier below which a remote worker is released.
    #[serde(default = "default_release_multiplier")]
    pub early_worker_release_multiplier: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            stop_on_first_error: false,
            delayed_cache_lookup_enabled: false,
            module_affinity_enabled: false,
            lazy_materialization: true,
            cache_only_mode: false,
            determinism_probe: false,
            early_worker_release: true,
            early_worker_release_multiplier: default_release_multiplier(),
        }
    }
}

fn default_release_multiplier() -> f64 {
    2.0
}

/// Distribution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DistributionConfig {
    /// Minimum number of workers (local included) the build requires.
    #[serde(default = "default_one")]
    pub minimum_workers: u32,
    /// How long to wait for remote workers to attach before the
    /// minimum-worker requirement fails the build.
    #[serde(default = "default_attach_timeout", with = "humantime_serde")]
    pub attach_timeout: Duration,
    /// Oversubscription factor for remote cache-lookup slots; cache lookup
    /// is I/O-dominated.
    #[serde(default = "default_oversubscription")]
    pub remote_cache_lookup_oversubscription: u32,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            minimum_workers: default_one(),
            attach_timeout: default_attach_timeout(),
            remote_cache_lookup_oversubscription: default_oversubscription(),
        }
    }
}

impl DistributionConfig {
    pub(crate) fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.minimum_workers == 0 {
            errors.push(format!("{path_prefix}.minimum_workers must be greater than 0"));
        }
        if self.remote_cache_lookup_oversubscription == 0 {
            errors.push(format!(
                "{path_prefix}.remote_cache_lookup_oversubscription must be greater than 0"
            ));
        }
        errors
    }
}

const fn default_attach_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_oversubscription() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_memory_multiplier_has_a_floor() {
        let retries = RetryConfig {
            low_memory_multiplier: 1.0,
            ..RetryConfig::default()
        };
        assert_eq!(retries.validation_errors("retries").len(), 1);
        assert!((retries.effective_low_memory_multiplier() - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn distribution_requires_at_least_one_worker() {
        let distribution = DistributionConfig {
            minimum_workers: 0,
            remote_cache_lookup_oversubscription: 0,
            ..DistributionConfig::default()
        };
        assert_eq!(distribution.validation_errors("distribution").len(), 2);
    }

    #[test]
    fn feature_defaults_favor_lazy_materialization() {
        let features = FeatureConfig::default();
        assert!(features.lazy_materialization);
        assert!(features.early_worker_release);
        assert!(!features.determinism_probe);
    }
}
