// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the build scheduler.
//!
//! Machine tuning knobs (queue parallelism, resource thresholds) live in
//! [`settings`]; behavioral policies (retry caps, feature switches,
//! distribution requirements) live in [`policy`]. Every section
//! deserializes with full defaults, so an empty document is a valid
//! configuration. Validation accumulates all failures instead of stopping
//! at the first.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod error;
pub mod policy;
pub mod settings;

pub use error::Error;
pub use policy::{DistributionConfig, FeatureConfig, RetryConfig, MIN_LOW_MEMORY_MULTIPLIER};
pub use settings::{QueueConfig, ResourceConfig, CRITICAL_COMMIT_PERCENT};

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Dispatch queue parallelism.
    #[serde(default)]
    pub queues: QueueConfig,
    /// Memory pressure thresholds and timers.
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Retry caps for retryable failures.
    #[serde(default)]
    pub retries: RetryConfig,
    /// Feature switches.
    #[serde(default)]
    pub features: FeatureConfig,
    /// Distribution settings.
    #[serde(default)]
    pub distribution: DistributionConfig,
}

impl SchedulerConfig {
    /// Loads a configuration from a JSON or YAML file, by extension.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
            path: display.clone(),
            details: e.to_string(),
        })?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&contents).map_err(|e| Error::DeserializationError {
                    path: display.clone(),
                    format: "JSON",
                    details: e.to_string(),
                })?
            }
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&contents).map_err(|e| Error::DeserializationError {
                    path: display.clone(),
                    format: "YAML",
                    details: e.to_string(),
                })?
            }
            _ => return Err(Error::UnsupportedFormat { path: display }),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, accumulating every failure.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        errors.extend(self.queues.validation_errors("queues"));
        errors.extend(self.resources.validation_errors("resources"));
        errors.extend(self.retries.validation_errors("retries"));
        errors.extend(self.distribution.validation_errors("distribution"));
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_document_is_a_valid_config() {
        let config: SchedulerConfig = serde_yaml::from_str("{}").expect("parse");
        config.validate().expect("valid");
        assert!(config.queues.cpu >= 1);
        assert_eq!(config.resources.ram_threshold_percent, 90);
        assert_eq!(config.retries.max_retries_due_to_low_memory, 2);
        assert_eq!(config.distribution.remote_cache_lookup_oversubscription, 5);
    }

    #[test]
    fn validation_accumulates_across_sections() {
        let config = SchedulerConfig {
            queues: QueueConfig {
                cpu: 0,
                io: 0,
                ..QueueConfig::default()
            },
            resources: ResourceConfig {
                ram_threshold_percent: 0,
                ..ResourceConfig::default()
            },
            retries: RetryConfig {
                low_memory_multiplier: 1.0,
                ..RetryConfig::default()
            },
            ..SchedulerConfig::default()
        };
        let Err(Error::InvalidConfiguration { errors }) = config.validate() else {
            panic!("expected invalid configuration");
        };
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("queues.cpu")));
        assert!(errors.iter().any(|e| e.contains("low_memory_multiplier")));
    }

    #[test]
    fn humantime_durations_round_trip() {
        let yaml = "resources:\n  status_interval: 5s\n";
        let config: SchedulerConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.resources.status_interval, Duration::from_secs(5));

        let json = serde_json::to_string(&config).expect("serialize");
        let back: SchedulerConfig = serde_json::from_str(&json).expect("reparse");
        assert_eq!(back, config);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "unknown_section: {}\n";
        assert!(serde_yaml::from_str::<SchedulerConfig>(yaml).is_err());
    }
}
