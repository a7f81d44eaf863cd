// SPDX-License-Identifier: Apache-2.0

//! The worker pool.

use crate::slots::SlotKind;
use crate::worker::{LocalWorker, RemoteWorker, Worker};
use crate::WorkerId;
use buildflow_api::WorkerTransport;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// The set of workers participating in a build.
///
/// The local worker is created with the pool and always sits at index 0;
/// remote workers are appended when distribution is enabled.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    ever_available: AtomicU32,
}

impl WorkerPool {
    /// Creates a pool containing only `local`.
    #[must_use]
    pub fn new(local: LocalWorker) -> Self {
        Self {
            workers: vec![Arc::new(Worker::Local(local))],
            ever_available: AtomicU32::new(0),
        }
    }

    /// Appends a remote worker for `transport`, returning its id.
    pub fn add_remote(&mut self, transport: Arc<dyn WorkerTransport>) -> WorkerId {
        let id = self.workers.len();
        self.workers
            .push(Arc::new(Worker::Remote(RemoteWorker::new(id, transport))));
        id
    }

    /// The worker at `id`.
    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<&Arc<Worker>> {
        self.workers.get(id)
    }

    /// The local worker.
    #[must_use]
    pub fn local(&self) -> &Arc<Worker> {
        &self.workers[crate::LOCAL_WORKER_ID]
    }

    /// All workers, local first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.iter()
    }

    /// Workers currently accepting work.
    pub fn running(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.iter().filter(|w| w.common().is_running())
    }

    /// Number of workers, regardless of state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool is empty. It never is: the local worker is always
    /// present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Records that a worker became available to the build.
    pub fn note_worker_available(&self) {
        let _ = self.ever_available.fetch_add(1, Ordering::Relaxed);
    }

    /// How many workers were ever available during the build.
    #[must_use]
    pub fn ever_available_count(&self) -> u32 {
        self.ever_available.load(Ordering::Relaxed)
    }

    /// Total process slots across running workers.
    #[must_use]
    pub fn total_process_slots(&self) -> u32 {
        self.running()
            .map(|w| w.common().slots(SlotKind::Process).total())
            .sum()
    }

    /// Acquired process slots across running workers.
    #[must_use]
    pub fn acquired_process_slots(&self) -> u32 {
        self.running()
            .map(|w| w.common().slots(SlotKind::Process).acquired())
            .sum()
    }

    /// Total process slots across running workers, excluding `excluded`.
    #[must_use]
    pub fn capacity_without(&self, excluded: WorkerId) -> u32 {
        self.running()
            .filter(|w| w.common().id() != excluded)
            .map(|w| w.common().slots(SlotKind::Process).total())
            .sum()
    }

    /// The running remote worker with the fewest acquired process slots.
    #[must_use]
    pub fn least_loaded_running_remote(&self) -> Option<WorkerId> {
        self.running()
            .filter(|w| w.is_remote())
            .min_by_key(|w| w.common().slots(SlotKind::Process).acquired())
            .map(|w| w.common().id())
    }

    /// The remote worker to release early, when queued process work no
    /// longer needs the full pool.
    ///
    /// A remote is released once the remaining capacity times
    /// `release_multiplier` still covers the queued process work.
    #[must_use]
    pub fn early_release_candidate(
        &self,
        queued_process_work: usize,
        release_multiplier: f64,
    ) -> Option<WorkerId> {
        let candidate = self.least_loaded_running_remote()?;
        let capacity_without = f64::from(self.capacity_without(candidate));
        if (queued_process_work as f64) < capacity_without * release_multiplier {
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{SlotTotals, WorkerState};
    use buildflow_api::{
        CacheHit, CollaboratorError, ExecutionResult, OutputContent, SourceHashes,
        WorkerAttachment,
    };
    use buildflow_graph::Pip;

    struct FakeTransport {
        process_slots: u32,
    }

    #[async_trait::async_trait]
    impl WorkerTransport for FakeTransport {
        async fn initialize(&self) -> Result<WorkerAttachment, CollaboratorError> {
            Ok(WorkerAttachment {
                name: "fake".to_owned(),
                total_process_slots: self.process_slots,
                total_cache_lookup_slots: self.process_slots,
                total_ram_mb: 2048,
                total_commit_mb: 4096,
            })
        }

        async fn cache_lookup(
            &self,
            _pip: &Pip,
            _inputs: &SourceHashes,
        ) -> Result<Option<CacheHit>, CollaboratorError> {
            Ok(None)
        }

        async fn materialize_inputs(&self, _pip: &Pip) -> Result<u64, CollaboratorError> {
            Ok(0)
        }

        async fn execute_process(&self, _pip: &Pip) -> Result<ExecutionResult, CollaboratorError> {
            Ok(ExecutionResult::empty_success())
        }

        async fn materialize_outputs(
            &self,
            _pip: &Pip,
            _outputs: &[OutputContent],
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn finish(&self) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    fn attached_pool(remote_slots: u32) -> WorkerPool {
        let local = LocalWorker::new(SlotTotals::balanced(2), 4096, 8192);
        local.attach().expect("local attach");
        let mut pool = WorkerPool::new(local);
        let id = pool.add_remote(Arc::new(FakeTransport {
            process_slots: remote_slots,
        }));
        let remote = pool.get(id).expect("remote").as_remote().expect("remote");
        futures_executor_block_on(remote.attach(5)).expect("remote attach");
        pool
    }

    // Minimal block_on to keep these tests off the tokio runtime.
    fn futures_executor_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(fut)
    }

    #[test]
    fn local_worker_is_always_index_zero() {
        let pool = attached_pool(4);
        assert_eq!(pool.local().common().id(), crate::LOCAL_WORKER_ID);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn remote_attach_applies_oversubscription() {
        let pool = attached_pool(4);
        let remote = pool.get(1).expect("remote");
        assert_eq!(remote.common().slots(SlotKind::Process).total(), 4);
        assert_eq!(remote.common().slots(SlotKind::CacheLookup).total(), 20);
        assert_eq!(remote.common().state(), WorkerState::Running);
    }

    #[test]
    fn capacity_without_excludes_the_worker() {
        let pool = attached_pool(4);
        assert_eq!(pool.total_process_slots(), 6);
        assert_eq!(pool.capacity_without(1), 2);
    }

    #[test]
    fn early_release_when_queue_fits_remaining_capacity() {
        let pool = attached_pool(4);
        // Local alone offers 2 slots; with multiplier 2.0 the threshold is 4.
        assert_eq!(pool.early_release_candidate(3, 2.0), Some(1));
        assert_eq!(pool.early_release_candidate(10, 2.0), None);
    }
}
