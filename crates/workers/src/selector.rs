// SPDX-License-Identifier: Apache-2.0

//! Worker selectors.
//!
//! The CPU selector assigns process and IPC pips at the choose-worker step;
//! the cache-lookup selector assigns cache lookups over its own slot pool.
//! Both yield `None` when no worker fits, leaving the caller to re-enqueue
//! and await a slot-released notification. Every failed attempt advances a
//! blocked counter used to name the limiting resource in status telemetry.

use crate::pool::WorkerPool;
use crate::slots::SlotKind;
use crate::worker::Worker;
use crate::WorkerId;
use buildflow_api::ContentHash;
use buildflow_graph::{ModuleId, PipId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Facts about a runnable pip that drive worker selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunnableFacts<'a> {
    /// The pip being placed.
    pub pip: Option<PipId>,
    /// Module of the pip, for affinity.
    pub module: Option<ModuleId>,
    /// Worker preferred by an earlier attempt or by module affinity.
    pub preferred_worker: Option<WorkerId>,
    /// Input content with sizes, for setup-cost estimation.
    pub inputs: &'a [(ContentHash, u64)],
}

/// The resource naming why selection last failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitingResource {
    /// Nothing has blocked selection yet.
    None,
    /// All candidate slots were busy.
    BusySlots,
    /// All candidates were under memory pressure.
    Memory,
    /// No worker was in the running state.
    NoRunningWorker,
}

/// Blocked-attempt counters per limiting resource.
#[derive(Debug, Default)]
pub struct SelectionCounters {
    busy_slots: AtomicU64,
    memory: AtomicU64,
    no_running_worker: AtomicU64,
}

impl SelectionCounters {
    /// Total failed selection attempts.
    #[must_use]
    pub fn total_blocked(&self) -> u64 {
        self.busy_slots.load(Ordering::Relaxed)
            + self.memory.load(Ordering::Relaxed)
            + self.no_running_worker.load(Ordering::Relaxed)
    }

    /// The resource that has blocked the most attempts.
    #[must_use]
    pub fn limiting_resource(&self) -> LimitingResource {
        let busy = self.busy_slots.load(Ordering::Relaxed);
        let memory = self.memory.load(Ordering::Relaxed);
        let none_running = self.no_running_worker.load(Ordering::Relaxed);
        let max = busy.max(memory).max(none_running);
        if max == 0 {
            LimitingResource::None
        } else if max == busy {
            LimitingResource::BusySlots
        } else if max == memory {
            LimitingResource::Memory
        } else {
            LimitingResource::NoRunningWorker
        }
    }

    fn record(&self, resource: LimitingResource) {
        let counter = match resource {
            LimitingResource::BusySlots => &self.busy_slots,
            LimitingResource::Memory => &self.memory,
            LimitingResource::NoRunningWorker => &self.no_running_worker,
            LimitingResource::None => return,
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Slot pressure is folded into the byte-denominated setup cost at one GiB
/// per unit of saturation, so a fully loaded worker with all inputs present
/// still loses to an idle worker missing a small input.
const SLOT_PRESSURE_UNIT_BYTES: u64 = 1024 * 1024 * 1024;

fn setup_cost(worker: &Worker, facts: &RunnableFacts<'_>, kind: SlotKind) -> u64 {
    let common = worker.common();
    let pool = common.slots(kind);
    let pressure = SLOT_PRESSURE_UNIT_BYTES
        .saturating_mul(u64::from(pool.acquired()))
        / u64::from(pool.total().max(1));
    common.absent_input_bytes(facts.inputs).saturating_add(pressure)
}

/// Chooses workers for process and IPC pips.
pub struct CpuWorkerSelector {
    pool: Arc<WorkerPool>,
    module_affinity_enabled: bool,
    counters: SelectionCounters,
}

impl CpuWorkerSelector {
    /// Creates a selector over `pool`.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, module_affinity_enabled: bool) -> Self {
        Self {
            pool,
            module_affinity_enabled,
            counters: SelectionCounters::default(),
        }
    }

    /// Blocked-attempt counters.
    #[must_use]
    pub fn counters(&self) -> &SelectionCounters {
        &self.counters
    }

    /// Attempts to place a pip, acquiring one `kind` slot on the chosen
    /// worker. Returns `None` when no worker fits right now.
    pub fn choose(&self, facts: &RunnableFacts<'_>, kind: SlotKind) -> Option<WorkerId> {
        debug_assert!(matches!(kind, SlotKind::Process | SlotKind::Ipc));

        let running: Vec<&Arc<Worker>> = self.pool.running().collect();
        if running.is_empty() {
            self.counters.record(LimitingResource::NoRunningWorker);
            return None;
        }

        let available: Vec<&Arc<Worker>> = running
            .iter()
            .copied()
            .filter(|w| w.common().memory_resource().is_available())
            .collect();
        if available.is_empty() {
            self.counters.record(LimitingResource::Memory);
            return None;
        }

        if self.module_affinity_enabled {
            if let Some(chosen) = self.try_affinity_pass(&available, facts, kind) {
                return Some(chosen);
            }
        }

        let mut candidates: Vec<&Arc<Worker>> = available;
        candidates.sort_by_key(|w| {
            (
                setup_cost(w, facts, kind),
                w.common().slots(SlotKind::Process).acquired(),
            )
        });
        for worker in candidates {
            if self.try_take(worker, facts, kind) {
                return Some(worker.common().id());
            }
        }

        self.counters.record(LimitingResource::BusySlots);
        None
    }

    /// Tries the preferred worker and module-assigned workers first.
    fn try_affinity_pass(
        &self,
        available: &[&Arc<Worker>],
        facts: &RunnableFacts<'_>,
        kind: SlotKind,
    ) -> Option<WorkerId> {
        if let Some(preferred) = facts.preferred_worker {
            if let Some(worker) = available.iter().find(|w| w.common().id() == preferred) {
                if self.try_take(worker, facts, kind) {
                    return Some(preferred);
                }
            }
        }
        let module = facts.module?;
        let mut assigned: Vec<&&Arc<Worker>> = available
            .iter()
            .filter(|w| w.common().has_module(module))
            .collect();
        assigned.sort_by_key(|w| setup_cost(w, facts, kind));
        for worker in assigned {
            if self.try_take(worker, facts, kind) {
                return Some(worker.common().id());
            }
        }
        None
    }

    fn try_take(&self, worker: &Arc<Worker>, facts: &RunnableFacts<'_>, kind: SlotKind) -> bool {
        let common = worker.common();
        if !common.try_acquire(kind) {
            return false;
        }
        if let Some(pip) = facts.pip {
            common.assign_pip(pip);
        }
        if self.module_affinity_enabled {
            if let Some(module) = facts.module {
                common.assign_module(module);
            }
        }
        true
    }

    /// Releases the slot taken by a successful `choose`.
    pub fn release(&self, worker: WorkerId, pip: Option<PipId>, kind: SlotKind) {
        if let Some(worker) = self.pool.get(worker) {
            worker.common().release(kind);
            if let Some(pip) = pip {
                worker.common().unassign_pip(pip);
            }
        }
    }
}

/// Chooses workers for cache lookups over the cache-lookup slot pools.
pub struct CacheLookupWorkerSelector {
    pool: Arc<WorkerPool>,
    counters: SelectionCounters,
}

impl CacheLookupWorkerSelector {
    /// Creates a selector over `pool`.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            counters: SelectionCounters::default(),
        }
    }

    /// Blocked-attempt counters.
    #[must_use]
    pub fn counters(&self) -> &SelectionCounters {
        &self.counters
    }

    /// Attempts to take a cache-lookup slot on the least saturated worker.
    pub fn choose(&self) -> Option<WorkerId> {
        let mut running: Vec<&Arc<Worker>> = self.pool.running().collect();
        if running.is_empty() {
            self.counters.record(LimitingResource::NoRunningWorker);
            return None;
        }
        // Least saturated lookup pool first.
        running.sort_by_key(|w| {
            let pool = w.common().slots(SlotKind::CacheLookup);
            (u64::from(pool.acquired()) * 1000) / u64::from(pool.total().max(1))
        });
        for worker in running {
            if worker.common().try_acquire(SlotKind::CacheLookup) {
                return Some(worker.common().id());
            }
        }
        self.counters.record(LimitingResource::BusySlots);
        None
    }

    /// Releases the slot taken by a successful `choose`.
    pub fn release(&self, worker: WorkerId) {
        if let Some(worker) = self.pool.get(worker) {
            worker.common().release(SlotKind::CacheLookup);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::MemoryResource;
    use crate::worker::{LocalWorker, SlotTotals};

    fn pool_with_local(process_slots: u32) -> Arc<WorkerPool> {
        let local = LocalWorker::new(SlotTotals::balanced(process_slots), 4096, 8192);
        local.attach().expect("attach");
        Arc::new(WorkerPool::new(local))
    }

    #[test]
    fn chooses_the_local_worker_when_it_fits() {
        let pool = pool_with_local(2);
        let selector = CpuWorkerSelector::new(Arc::clone(&pool), false);
        let facts = RunnableFacts {
            pip: Some(PipId::from_index(1)),
            ..RunnableFacts::default()
        };
        assert_eq!(selector.choose(&facts, SlotKind::Process), Some(0));
        assert_eq!(pool.local().common().slots(SlotKind::Process).acquired(), 1);
        assert_eq!(pool.local().common().assigned_count(), 1);

        selector.release(0, Some(PipId::from_index(1)), SlotKind::Process);
        assert_eq!(pool.local().common().slots(SlotKind::Process).acquired(), 0);
        assert_eq!(pool.local().common().assigned_count(), 0);
    }

    #[test]
    fn saturated_slots_yield_none_and_count_busy() {
        let pool = pool_with_local(1);
        let selector = CpuWorkerSelector::new(Arc::clone(&pool), false);
        let facts = RunnableFacts::default();
        assert!(selector.choose(&facts, SlotKind::Process).is_some());
        assert_eq!(selector.choose(&facts, SlotKind::Process), None);
        assert_eq!(
            selector.counters().limiting_resource(),
            LimitingResource::BusySlots
        );
    }

    #[test]
    fn memory_pressure_yields_none_and_counts_memory() {
        let pool = pool_with_local(4);
        pool.local()
            .common()
            .set_memory_resource(MemoryResource::LOW_COMMIT);
        let selector = CpuWorkerSelector::new(Arc::clone(&pool), false);
        assert_eq!(selector.choose(&RunnableFacts::default(), SlotKind::Process), None);
        assert_eq!(
            selector.counters().limiting_resource(),
            LimitingResource::Memory
        );
    }

    #[test]
    fn module_affinity_sticks_to_the_first_winner() {
        let pool = pool_with_local(4);
        let selector = CpuWorkerSelector::new(Arc::clone(&pool), true);
        let facts = RunnableFacts {
            pip: Some(PipId::from_index(1)),
            module: Some(ModuleId(7)),
            ..RunnableFacts::default()
        };
        assert_eq!(selector.choose(&facts, SlotKind::Process), Some(0));
        assert!(pool.local().common().has_module(ModuleId(7)));
    }

    #[test]
    fn cache_lookup_selector_uses_its_own_pool() {
        let pool = pool_with_local(1);
        let selector = CacheLookupWorkerSelector::new(Arc::clone(&pool));
        // balanced(1) gives 2 cache-lookup slots.
        assert!(selector.choose().is_some());
        assert!(selector.choose().is_some());
        assert_eq!(selector.choose(), None);
        selector.release(0);
        assert!(selector.choose().is_some());
    }

    #[test]
    fn cache_lookup_ignores_memory_pressure() {
        let pool = pool_with_local(1);
        pool.local()
            .common()
            .set_memory_resource(MemoryResource::LOW_RAM);
        let selector = CacheLookupWorkerSelector::new(Arc::clone(&pool));
        assert!(selector.choose().is_some());
    }
}
