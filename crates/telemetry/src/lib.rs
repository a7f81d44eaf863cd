// SPDX-License-Identifier: Apache-2.0

//! Counters, critical-path stats, and status reporting.
//!
//! Everything here is a passive observer of scheduler transitions: dense
//! atomic counter registries, the per-(pip-type, state) matrix behind status
//! rows, and the critical-path record updated as pips complete. No scheduler
//! decision reads these values.

pub mod counters;
pub mod critical_path;
pub mod state_counters;
pub mod status;

pub use counters::{CounterRegistry, SchedulerCounter};
pub use critical_path::CriticalPathStats;
pub use state_counters::PipStateCounters;
pub use status::{SchedulerPerformanceInfo, StatusReport, UnresponsivenessTracker};
