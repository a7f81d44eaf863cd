// SPDX-License-Identifier: Apache-2.0

//! Machine performance sampling and the historical per-pip performance table.

use crate::error::CollaboratorError;
use crate::execution::MemoryCounters;
use buildflow_graph::PipId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;

/// One sample of machine-wide resource counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct MachineCounters {
    /// Total physical RAM in megabytes.
    pub ram_total_mb: u32,
    /// Available physical RAM in megabytes.
    pub ram_available_mb: u32,
    /// Commit limit in megabytes (total swap + RAM).
    pub commit_total_mb: u32,
    /// Committed memory in megabytes.
    pub commit_used_mb: u32,
    /// Aggregate CPU usage percentage.
    pub cpu_percent: u32,
}

impl MachineCounters {
    /// RAM usage percentage.
    #[must_use]
    pub fn ram_percent(&self) -> u32 {
        percent(
            self.ram_total_mb.saturating_sub(self.ram_available_mb),
            self.ram_total_mb,
        )
    }

    /// Commit usage percentage.
    #[must_use]
    pub fn commit_percent(&self) -> u32 {
        percent(self.commit_used_mb, self.commit_total_mb)
    }
}

fn percent(used: u32, total: u32) -> u32 {
    if total == 0 {
        0
    } else {
        ((u64::from(used) * 100) / u64::from(total)) as u32
    }
}

/// Polls OS counters for RAM, commit, and CPU aggregates.
pub trait PerformanceCollector: Send + Sync {
    /// Takes one sample.
    fn sample(&self) -> MachineCounters;
}

/// Default [`PerformanceCollector`] backed by `sysinfo`.
pub struct SysinfoCollector {
    system: Mutex<sysinfo::System>,
}

impl Default for SysinfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoCollector {
    /// Creates a collector with a fresh system handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

const BYTES_PER_MB: u64 = 1024 * 1024;

impl PerformanceCollector for SysinfoCollector {
    fn sample(&self) -> MachineCounters {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let to_mb = |bytes: u64| (bytes / BYTES_PER_MB).min(u64::from(u32::MAX)) as u32;
        let commit_total = system.total_memory() + system.total_swap();
        let commit_used = system.used_memory() + system.used_swap();
        MachineCounters {
            ram_total_mb: to_mb(system.total_memory()),
            ram_available_mb: to_mb(system.available_memory()),
            commit_total_mb: to_mb(commit_total),
            commit_used_mb: to_mb(commit_used),
            cpu_percent: system.global_cpu_usage().round().clamp(0.0, 100.0) as u32,
        }
    }
}

/// Historical performance of one pip, as recorded by earlier builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct PipHistoricPerf {
    /// Wall-clock milliseconds of the last successful execution.
    pub duration_ms: u32,
    /// Memory footprint of the last successful execution.
    pub memory: MemoryCounters,
}

/// Lookup and update surface of the historical performance table.
pub trait HistoricalPerfInfo: Send + Sync {
    /// The estimated wall-clock milliseconds for `pip`, when known.
    fn estimated_duration_ms(&self, pip: PipId) -> Option<u32>;

    /// The expected memory footprint for `pip`, when known.
    fn expected_memory(&self, pip: PipId) -> Option<MemoryCounters>;

    /// Records the observed performance of a completed `pip`.
    fn record(&self, pip: PipId, perf: PipHistoricPerf);

    /// Persists the table to `path`.
    fn save(&self, path: &Path) -> Result<(), CollaboratorError>;
}

/// In-memory historical performance table with JSON persistence.
#[derive(Default)]
pub struct InMemoryHistoricPerf {
    entries: RwLock<HashMap<PipId, PipHistoricPerf>>,
}

impl InMemoryHistoricPerf {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a previously saved table, or starts empty when `path` does not
    /// exist.
    pub fn load_or_empty(path: &Path) -> Result<Self, CollaboratorError> {
        let entries = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<HashMap<PipId, PipHistoricPerf>>(&bytes)
                .map_err(|e| CollaboratorError::new("historic_perf.load", e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(CollaboratorError::new("historic_perf.load", e.to_string())),
        };
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Number of recorded pips.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl HistoricalPerfInfo for InMemoryHistoricPerf {
    fn estimated_duration_ms(&self, pip: PipId) -> Option<u32> {
        self.entries.read().get(&pip).map(|p| p.duration_ms)
    }

    fn expected_memory(&self, pip: PipId) -> Option<MemoryCounters> {
        self.entries.read().get(&pip).map(|p| p.memory)
    }

    fn record(&self, pip: PipId, perf: PipHistoricPerf) {
        let _ = self.entries.write().insert(pip, perf);
    }

    fn save(&self, path: &Path) -> Result<(), CollaboratorError> {
        let entries = self.entries.read();
        let bytes = serde_json::to_vec(&*entries)
            .map_err(|e| CollaboratorError::new("historic_perf.save", e.to_string()))?;
        std::fs::write(path, bytes)
            .map_err(|e| CollaboratorError::new("historic_perf.save", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        let counters = MachineCounters::default();
        assert_eq!(counters.ram_percent(), 0);
        assert_eq!(counters.commit_percent(), 0);
    }

    #[test]
    fn ram_percent_is_used_over_total() {
        let counters = MachineCounters {
            ram_total_mb: 1000,
            ram_available_mb: 250,
            ..MachineCounters::default()
        };
        assert_eq!(counters.ram_percent(), 75);
    }

    #[test]
    fn historic_perf_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("perf.json");

        let table = InMemoryHistoricPerf::new();
        table.record(
            PipId::from_index(7),
            PipHistoricPerf {
                duration_ms: 1234,
                memory: MemoryCounters {
                    peak_working_set_mb: 64,
                    average_working_set_mb: 32,
                    peak_commit_mb: 80,
                },
            },
        );
        table.save(&path).expect("save");

        let reloaded = InMemoryHistoricPerf::load_or_empty(&path).expect("load");
        assert_eq!(
            reloaded.estimated_duration_ms(PipId::from_index(7)),
            Some(1234)
        );
        assert_eq!(
            reloaded
                .expected_memory(PipId::from_index(7))
                .map(|m| m.peak_working_set_mb),
            Some(64)
        );
        assert_eq!(reloaded.estimated_duration_ms(PipId::from_index(8)), None);
    }
}
