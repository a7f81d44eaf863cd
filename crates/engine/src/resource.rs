// SPDX-License-Identifier: Apache-2.0

//! The resource manager.
//!
//! Runs on the status timer. Samples machine RAM and commit, computes the
//! effective-RAM view (available RAM minus the expected RAM of suspended
//! pips), and applies a tiered response to pressure: empty working set,
//! then suspend, then cancel, preferring the largest and most recent pip in
//! each tier. Critical commit cancels immediately. When pressure clears,
//! suspended pips resume longest-remaining first within the freed budget.

use crate::context::SchedulerCore;
use buildflow_api::{CancelReason, ProcessExecutionScope};
use buildflow_config::CRITICAL_COMMIT_PERCENT;
use buildflow_workers::MemoryResource;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use buildflow_graph::PipId;

/// Tiered memory-pressure response over the running-process registry.
pub(crate) struct ResourceManager {
    /// Pips whose working set was already emptied this pressure episode.
    tried_empty: Mutex<HashSet<PipId>>,
}

impl ResourceManager {
    pub(crate) fn new() -> Self {
        Self {
            tried_empty: Mutex::new(HashSet::new()),
        }
    }

    /// One resource-management pass; called from the status timer.
    pub(crate) fn tick(&self, core: &SchedulerCore) {
        let sample = core.collaborators.collector.sample();
        let scopes = core.running_processes.snapshot();

        let suspended: Vec<&Arc<ProcessExecutionScope>> =
            scopes.iter().filter(|s| s.is_suspended()).collect();
        let expected_suspended_mb: u32 = suspended
            .iter()
            .map(|s| s.expected_memory.peak_working_set_mb)
            .sum();

        let effective_available_mb = sample
            .ram_available_mb
            .saturating_sub(expected_suspended_mb);
        let effective_used_percent = if sample.ram_total_mb == 0 {
            0
        } else {
            ((u64::from(sample.ram_total_mb.saturating_sub(effective_available_mb)) * 100)
                / u64::from(sample.ram_total_mb)) as u32
        };

        let resources = &core.config.resources;
        let low_ram = effective_used_percent > resources.ram_threshold_percent
            && effective_available_mb < resources.minimum_free_ram_mb;
        let commit_percent = sample.commit_percent();
        let low_commit = commit_percent > resources.commit_threshold_percent;

        let mut memory = MemoryResource::empty();
        if low_ram {
            memory |= MemoryResource::LOW_RAM;
        }
        if low_commit {
            memory |= MemoryResource::LOW_COMMIT;
        }

        let local = core.pool.local().common();
        let was_pressured = !local.memory_resource().is_available();
        local.set_memory_resource(memory);
        local.set_free_estimates(
            effective_available_mb,
            sample.commit_total_mb.saturating_sub(sample.commit_used_mb),
        );

        if commit_percent >= CRITICAL_COMMIT_PERCENT {
            // Commit exhaustion kills the machine; free commit immediately.
            if let Some(victim) = pressure_victims(&scopes).find(|s| !s.is_cancel_requested()) {
                tracing::warn!(
                    name: "resource.critical_commit_cancel",
                    pip = %victim.pip,
                    commit_percent = commit_percent,
                );
                victim.cancel(CancelReason::ResourcePressure);
            }
            return;
        }

        if low_ram {
            self.relieve_ram_pressure(&scopes);
            return;
        }

        if memory.is_available() {
            self.tried_empty.lock().clear();
            if !suspended.is_empty() {
                resume_suspended(
                    &suspended,
                    effective_available_mb,
                    resources.minimum_free_ram_mb,
                );
            }
            if was_pressured {
                core.notify_worker_available();
            }
        }
    }

    /// One tier step per tick: empty a working set, then suspend, then
    /// cancel, largest and most recent first.
    fn relieve_ram_pressure(&self, scopes: &[Arc<ProcessExecutionScope>]) {
        let mut tried_empty = self.tried_empty.lock();

        for victim in pressure_victims(scopes) {
            if victim.is_suspended() || victim.is_cancel_requested() {
                continue;
            }
            if !tried_empty.contains(&victim.pip) {
                let freed_mb = victim.try_empty_working_set();
                let _ = tried_empty.insert(victim.pip);
                tracing::info!(name: "resource.empty_working_set", pip = %victim.pip, freed_mb = freed_mb);
                return;
            }
            if victim.try_suspend() {
                tracing::info!(
                    name: "resource.suspend",
                    pip = %victim.pip,
                    expected_mb = victim.expected_memory.peak_working_set_mb,
                );
                return;
            }
        }

        // Everything running was emptied and suspended; cancel to free RAM.
        if let Some(victim) = pressure_victims(scopes).find(|s| !s.is_cancel_requested()) {
            tracing::warn!(name: "resource.cancel_for_ram", pip = %victim.pip);
            victim.cancel(CancelReason::ResourcePressure);
        }
    }
}

/// Running scopes ordered largest observed peak first, then most recent.
fn pressure_victims(
    scopes: &[Arc<ProcessExecutionScope>],
) -> impl Iterator<Item = &Arc<ProcessExecutionScope>> {
    let mut ordered: Vec<&Arc<ProcessExecutionScope>> = scopes.iter().collect();
    ordered.sort_by(|a, b| {
        b.observed_peak_mb()
            .cmp(&a.observed_peak_mb())
            .then_with(|| b.started_at.cmp(&a.started_at))
    });
    ordered.into_iter()
}

/// Resumes suspended pips longest-remaining first within the freed budget.
fn resume_suspended(
    suspended: &[&Arc<ProcessExecutionScope>],
    effective_available_mb: u32,
    minimum_free_ram_mb: u32,
) {
    let mut budget = effective_available_mb.saturating_sub(minimum_free_ram_mb);
    let mut ordered: Vec<&&Arc<ProcessExecutionScope>> = suspended.iter().collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.remaining_estimate_ms()));

    for scope in ordered {
        let needed = scope.expected_memory.peak_working_set_mb;
        if needed > budget {
            continue;
        }
        if scope.try_resume() {
            tracing::info!(name: "resource.resume", pip = %scope.pip, reserved_mb = needed);
            budget -= needed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildflow_api::MemoryCounters;

    fn scope(pip: u32, expected_mb: u32, remaining_ms: u32) -> Arc<ProcessExecutionScope> {
        Arc::new(ProcessExecutionScope::new(
            PipId::from_index(pip),
            0,
            MemoryCounters {
                peak_working_set_mb: expected_mb,
                average_working_set_mb: expected_mb / 2,
                peak_commit_mb: expected_mb,
            },
            remaining_ms,
        ))
    }

    #[test]
    fn victims_are_ordered_by_observed_peak() {
        let small = scope(1, 10, 100);
        small.record_observed_mb(10);
        let large = scope(2, 10, 100);
        large.record_observed_mb(500);
        let scopes = vec![small, Arc::clone(&large)];
        let first = pressure_victims(&scopes).next().expect("victim");
        assert_eq!(first.pip, large.pip);
    }

    #[test]
    fn resume_prefers_longest_remaining_within_budget() {
        let short = scope(1, 100, 1_000_000);
        let long = scope(2, 100, 2_000_000);
        let huge = scope(3, 10_000, 3_000_000);
        for s in [&short, &long, &huge] {
            assert!(s.try_suspend());
        }
        let suspended = vec![&short, &long, &huge];
        // Budget of 700 - 500 = 200MB: the huge one cannot resume, the two
        // small ones can, longest remaining first.
        resume_suspended(&suspended, 700, 500);
        assert!(huge.is_suspended());
        assert!(!long.is_suspended());
        assert!(!short.is_suspended());
    }
}
