// SPDX-License-Identifier: Apache-2.0

//! The per-kind dispatch queue set.
//!
//! Producers enqueue from any thread; a single drain loop consumes. The
//! `Notify` wake channel stores a permit when the drain loop is not parked,
//! so wakeups between a failed scan and the subsequent wait are never lost.

use crate::error::EnqueueError;
use crate::priority::PriorityQueue;
use crate::semaphore::{SemaphoreRegistry, SemaphoreTier, TierEntry};
use crate::DispatcherKind;
use buildflow_graph::SemaphoreRequirement;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

const QUEUE_COUNT: usize = DispatcherKind::DISPATCHABLE.len();

struct QueueState<T> {
    queue: PriorityQueue<T>,
    max_degree: u32,
    running: u32,
}

impl<T> QueueState<T> {
    fn is_eligible(&self) -> bool {
        !self.queue.is_empty() && self.running < self.max_degree
    }
}

struct Inner<T> {
    queues: [QueueState<T>; QUEUE_COUNT],
    registry: SemaphoreRegistry,
    tier: SemaphoreTier<(DispatcherKind, T)>,
}

/// Result of one drain scan.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome<T> {
    /// An item became dispatchable.
    Item {
        /// The queue the item came from; pass it back to `complete`.
        kind: DispatcherKind,
        /// The dequeued item.
        item: T,
    },
    /// All queues are empty or capped.
    Empty,
    /// The set is cancelled; no further items will be dispatched.
    Cancelled,
}

/// Point-in-time view of the queue set.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    queued: [usize; QUEUE_COUNT],
    running: [u32; QUEUE_COUNT],
    /// Items waiting on saturated semaphores.
    pub tier_waiting: usize,
}

impl QueueStats {
    /// Items queued in `kind`.
    #[must_use]
    pub fn queued(&self, kind: DispatcherKind) -> usize {
        kind.queue_index().map_or(0, |i| self.queued[i])
    }

    /// Items dispatched from `kind` and not yet completed.
    #[must_use]
    pub fn running(&self, kind: DispatcherKind) -> u32 {
        kind.queue_index().map_or(0, |i| self.running[i])
    }

    /// Total queued items across all queues, semaphore tier included.
    #[must_use]
    pub fn total_queued(&self) -> usize {
        self.queued.iter().sum::<usize>() + self.tier_waiting
    }

    /// Total dispatched-and-running items across all queues.
    #[must_use]
    pub fn total_running(&self) -> u32 {
        self.running.iter().sum()
    }
}

/// One dispatch queue per [`DispatcherKind`], drained by a single loop.
pub struct DispatchQueueSet<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl<T> DispatchQueueSet<T> {
    /// Creates the set with the given per-kind maximum parallel degrees.
    pub fn new(max_degree_for: impl Fn(DispatcherKind) -> u32) -> Self {
        let queues = DispatcherKind::DISPATCHABLE.map(|kind| QueueState {
            queue: PriorityQueue::new(),
            max_degree: max_degree_for(kind).max(1),
            running: 0,
        });
        Self {
            inner: Mutex::new(Inner {
                queues,
                registry: SemaphoreRegistry::default(),
                tier: SemaphoreTier::default(),
            }),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Enqueues `item` into the queue for `kind`.
    ///
    /// Items with unsatisfiable semaphore requirements wait in the tier and
    /// enter their queue when releases make room.
    pub fn enqueue(
        &self,
        kind: DispatcherKind,
        priority: i64,
        requirements: &[SemaphoreRequirement],
        item: T,
    ) -> Result<(), EnqueueError<T>> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(EnqueueError::Cancelled(item));
        }
        let index = kind
            .queue_index()
            .expect("cannot enqueue to the None dispatcher");

        let mut inner = self.inner.lock();
        if !requirements.is_empty() && !inner.registry.try_acquire(requirements) {
            inner.tier.push(TierEntry {
                priority,
                item: (kind, item),
                requirements: requirements.to_vec(),
            });
        } else {
            inner.queues[index].queue.push(priority, item);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Releases semaphore units and re-admits waiting tier items.
    pub fn release_semaphores(&self, requirements: &[SemaphoreRequirement]) {
        if requirements.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.registry.release(requirements);
        let Inner {
            queues,
            registry,
            tier,
        } = &mut *inner;
        let admitted = tier.admit_satisfiable(registry);
        let woke = !admitted.is_empty();
        for entry in admitted {
            let (kind, item) = entry.item;
            let index = kind.queue_index().expect("tier holds dispatchable kinds");
            queues[index].queue.push(entry.priority, item);
        }
        drop(inner);
        if woke {
            self.notify.notify_one();
        }
    }

    /// Scans queues in declaration order and pops the first eligible item.
    pub fn drain_next(&self) -> DrainOutcome<T> {
        if self.cancelled.load(Ordering::SeqCst) {
            return DrainOutcome::Cancelled;
        }
        let mut inner = self.inner.lock();
        for (index, kind) in DispatcherKind::DISPATCHABLE.iter().enumerate() {
            let state = &mut inner.queues[index];
            if state.is_eligible() {
                let item = state.queue.pop().expect("eligible queue is nonempty");
                state.running += 1;
                return DrainOutcome::Item { kind: *kind, item };
            }
        }
        DrainOutcome::Empty
    }

    /// Marks an item dispatched from `kind` as finished, freeing its slot.
    pub fn complete(&self, kind: DispatcherKind) {
        let index = kind
            .queue_index()
            .expect("cannot complete on the None dispatcher");
        {
            let mut inner = self.inner.lock();
            let state = &mut inner.queues[index];
            debug_assert!(state.running > 0, "completion without dispatch");
            state.running = state.running.saturating_sub(1);
        }
        self.notify.notify_one();
    }

    /// Adjusts the maximum parallel degree of `kind`, waking the drain loop.
    pub fn set_max_degree(&self, kind: DispatcherKind, degree: u32) {
        if let Some(index) = kind.queue_index() {
            self.inner.lock().queues[index].max_degree = degree.max(1);
            self.notify.notify_one();
        }
    }

    /// The current maximum parallel degree of `kind`.
    #[must_use]
    pub fn max_degree(&self, kind: DispatcherKind) -> u32 {
        kind.queue_index()
            .map_or(0, |index| self.inner.lock().queues[index].max_degree)
    }

    /// Cancels the set: queued items are dropped, no new items are accepted,
    /// in-flight steps finish and release their slots normally.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.lock();
            for state in &mut inner.queues {
                let _ = state.queue.drain();
            }
            let _ = inner.tier.drain();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the set is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether no item is queued, waiting, or running anywhere.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.tier.is_empty()
            && inner
                .queues
                .iter()
                .all(|state| state.queue.is_empty() && state.running == 0)
    }

    /// Takes a consistent snapshot of queue depths and running counts.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats {
            tier_waiting: inner.tier.len(),
            ..QueueStats::default()
        };
        for (index, state) in inner.queues.iter().enumerate() {
            stats.queued[index] = state.queue.len();
            stats.running[index] = state.running;
        }
        stats
    }

    /// Parks until an enqueue, completion, degree change, or cancellation.
    pub async fn wait_for_change(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with_degrees(cpu: u32) -> DispatchQueueSet<&'static str> {
        DispatchQueueSet::new(|kind| match kind {
            DispatcherKind::CPU => cpu,
            _ => 4,
        })
    }

    fn expect_item(
        set: &DispatchQueueSet<&'static str>,
        expected_kind: DispatcherKind,
    ) -> &'static str {
        match set.drain_next() {
            DrainOutcome::Item { kind, item } => {
                assert_eq!(kind, expected_kind);
                item
            }
            other => panic!("expected an item, got {other:?}"),
        }
    }

    #[test]
    fn dispatches_in_descending_priority_within_a_queue() {
        let set = set_with_degrees(4);
        set.enqueue(DispatcherKind::CPU, 1, &[], "low").expect("enqueue");
        set.enqueue(DispatcherKind::CPU, 9, &[], "high").expect("enqueue");
        set.enqueue(DispatcherKind::CPU, 9, &[], "high-late").expect("enqueue");

        assert_eq!(expect_item(&set, DispatcherKind::CPU), "high");
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "high-late");
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "low");
    }

    #[test]
    fn running_cap_blocks_further_dispatch() {
        let set = set_with_degrees(1);
        set.enqueue(DispatcherKind::CPU, 0, &[], "a").expect("enqueue");
        set.enqueue(DispatcherKind::CPU, 0, &[], "b").expect("enqueue");

        assert_eq!(expect_item(&set, DispatcherKind::CPU), "a");
        assert_eq!(set.drain_next(), DrainOutcome::Empty);

        set.complete(DispatcherKind::CPU);
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "b");
    }

    #[test]
    fn degree_adjustment_takes_effect_immediately() {
        let set = set_with_degrees(1);
        set.enqueue(DispatcherKind::CPU, 0, &[], "a").expect("enqueue");
        set.enqueue(DispatcherKind::CPU, 0, &[], "b").expect("enqueue");
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "a");
        assert_eq!(set.drain_next(), DrainOutcome::Empty);

        set.set_max_degree(DispatcherKind::CPU, 2);
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "b");
    }

    #[test]
    fn cancel_is_terminal_and_rejects_enqueues() {
        let set = set_with_degrees(4);
        set.enqueue(DispatcherKind::CPU, 0, &[], "dropped").expect("enqueue");
        set.cancel();
        assert_eq!(set.drain_next(), DrainOutcome::Cancelled);
        assert!(matches!(
            set.enqueue(DispatcherKind::CPU, 0, &[], "late"),
            Err(EnqueueError::Cancelled("late"))
        ));
        assert!(set.is_cancelled());
    }

    #[test]
    fn saturated_semaphores_divert_to_the_tier() {
        let set = set_with_degrees(4);
        let reqs = vec![SemaphoreRequirement {
            name: "license".into(),
            units: 1,
            limit: 1,
        }];
        set.enqueue(DispatcherKind::CPU, 0, &reqs, "holder").expect("enqueue");
        set.enqueue(DispatcherKind::CPU, 0, &reqs, "waiter").expect("enqueue");

        assert_eq!(set.stats().tier_waiting, 1);
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "holder");
        // The waiter stays in the tier until the holder releases.
        set.complete(DispatcherKind::CPU);
        assert_eq!(set.drain_next(), DrainOutcome::Empty);

        set.release_semaphores(&reqs);
        assert_eq!(set.stats().tier_waiting, 0);
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "waiter");
    }

    #[test]
    fn idle_reflects_queues_running_and_tier() {
        let set = set_with_degrees(4);
        assert!(set.is_idle());
        set.enqueue(DispatcherKind::Light, 0, &[], "x").expect("enqueue");
        assert!(!set.is_idle());
        let _ = expect_item(&set, DispatcherKind::Light);
        assert!(!set.is_idle());
        set.complete(DispatcherKind::Light);
        assert!(set.is_idle());
    }

    #[tokio::test]
    async fn wakeup_is_not_lost_between_scan_and_wait() {
        let set = std::sync::Arc::new(set_with_degrees(4));
        assert_eq!(set.drain_next(), DrainOutcome::Empty);
        // Enqueue before the drain loop parks; the stored permit must wake it.
        set.enqueue(DispatcherKind::CPU, 0, &[], "x").expect("enqueue");
        tokio::time::timeout(std::time::Duration::from_secs(1), set.wait_for_change())
            .await
            .expect("wakeup arrived");
        assert_eq!(expect_item(&set, DispatcherKind::CPU), "x");
    }
}
