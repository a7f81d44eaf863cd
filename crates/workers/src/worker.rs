// SPDX-License-Identifier: Apache-2.0

//! Local and remote workers.
//!
//! The two variants share all slot and memory accounting through
//! [`WorkerCommon`]; only attachment and teardown differ. State transitions
//! are strictly monotonic: a worker never moves backwards through its
//! lifecycle.

use crate::error::Error;
use crate::slots::{MemoryResource, SlotKind, SlotPool};
use crate::WorkerId;
use buildflow_api::{ContentHash, WorkerTransport};
use buildflow_graph::{ModuleId, PipId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerState {
    /// Construction finished, attach not yet begun.
    Starting = 0,
    /// Attach begun.
    Started = 1,
    /// Attach handshake completed; slot totals known.
    Attached = 2,
    /// Accepting work.
    Running = 3,
    /// Graceful shutdown begun; no new work accepted.
    Stopping = 4,
    /// Fully detached.
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Started,
            2 => WorkerState::Attached,
            3 => WorkerState::Running,
            4 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Per-worker slot totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTotals {
    /// Cache-lookup slots.
    pub cache_lookup: u32,
    /// Input-materialization slots.
    pub materialize: u32,
    /// Process execution slots.
    pub process: u32,
    /// Post-processing slots.
    pub post_process: u32,
    /// IPC execution slots.
    pub ipc: u32,
}

impl SlotTotals {
    /// Balanced totals derived from a process slot count.
    #[must_use]
    pub fn balanced(process: u32) -> Self {
        Self {
            cache_lookup: process * 2,
            materialize: process,
            process,
            post_process: process,
            ipc: process,
        }
    }

    fn for_kind(&self, kind: SlotKind) -> u32 {
        match kind {
            SlotKind::CacheLookup => self.cache_lookup,
            SlotKind::MaterializeInput => self.materialize,
            SlotKind::Process => self.process,
            SlotKind::PostProcess => self.post_process,
            SlotKind::Ipc => self.ipc,
        }
    }
}

/// Slot and memory accounting shared by both worker variants.
pub struct WorkerCommon {
    id: WorkerId,
    name: String,
    state: AtomicU8,
    slots: [SlotPool; SlotKind::ALL.len()],
    memory: AtomicU8,
    total_ram_mb: AtomicU32,
    total_commit_mb: AtomicU32,
    estimated_free_ram_mb: AtomicU32,
    estimated_free_commit_mb: AtomicU32,
    assigned: Mutex<HashSet<PipId>>,
    modules: Mutex<HashSet<ModuleId>>,
    present_content: Mutex<HashSet<ContentHash>>,
}

impl WorkerCommon {
    fn new(id: WorkerId, name: String, totals: SlotTotals) -> Self {
        Self {
            id,
            name,
            state: AtomicU8::new(WorkerState::Starting as u8),
            slots: SlotKind::ALL.map(|kind| SlotPool::new(totals.for_kind(kind))),
            memory: AtomicU8::new(MemoryResource::empty().bits()),
            total_ram_mb: AtomicU32::new(0),
            total_commit_mb: AtomicU32::new(0),
            estimated_free_ram_mb: AtomicU32::new(0),
            estimated_free_commit_mb: AtomicU32::new(0),
            assigned: Mutex::new(HashSet::new()),
            modules: Mutex::new(HashSet::new()),
            present_content: Mutex::new(HashSet::new()),
        }
    }

    /// The worker's pool index.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advances the lifecycle state. Transitions are strictly forward.
    pub fn advance_state(&self, to: WorkerState) -> Result<(), Error> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return Err(Error::InvalidStateTransition {
                    worker: self.id,
                    from: WorkerState::from_u8(current),
                    to,
                });
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the worker currently accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// The slot pool for `kind`.
    #[must_use]
    pub fn slots(&self, kind: SlotKind) -> &SlotPool {
        &self.slots[kind.index()]
    }

    /// Acquires one slot of `kind`.
    ///
    /// Process and IPC acquisitions are double-checked against memory
    /// pressure: a worker under pressure refuses them outright.
    pub fn try_acquire(&self, kind: SlotKind) -> bool {
        if matches!(kind, SlotKind::Process | SlotKind::Ipc)
            && !self.memory_resource().is_available()
        {
            return false;
        }
        self.slots(kind).try_acquire()
    }

    /// Releases one slot of `kind`.
    pub fn release(&self, kind: SlotKind) {
        self.slots(kind).release();
    }

    /// Current memory pressure flags.
    #[must_use]
    pub fn memory_resource(&self) -> MemoryResource {
        MemoryResource::from_bits_truncate(self.memory.load(Ordering::Acquire))
    }

    /// Replaces the memory pressure flags.
    pub fn set_memory_resource(&self, memory: MemoryResource) {
        self.memory.store(memory.bits(), Ordering::Release);
    }

    /// Records machine totals and current estimates, in megabytes.
    pub fn set_memory_totals(&self, total_ram_mb: u32, total_commit_mb: u32) {
        self.total_ram_mb.store(total_ram_mb, Ordering::Release);
        self.total_commit_mb.store(total_commit_mb, Ordering::Release);
        self.estimated_free_ram_mb
            .store(total_ram_mb, Ordering::Release);
        self.estimated_free_commit_mb
            .store(total_commit_mb, Ordering::Release);
    }

    /// Updates the free-memory estimates, in megabytes.
    pub fn set_free_estimates(&self, free_ram_mb: u32, free_commit_mb: u32) {
        self.estimated_free_ram_mb
            .store(free_ram_mb, Ordering::Release);
        self.estimated_free_commit_mb
            .store(free_commit_mb, Ordering::Release);
    }

    /// Estimated free RAM in megabytes.
    #[must_use]
    pub fn estimated_free_ram_mb(&self) -> u32 {
        self.estimated_free_ram_mb.load(Ordering::Acquire)
    }

    /// Records a pip as assigned to this worker.
    pub fn assign_pip(&self, pip: PipId) {
        let _ = self.assigned.lock().insert(pip);
    }

    /// Removes a pip from the assigned set.
    pub fn unassign_pip(&self, pip: PipId) {
        let _ = self.assigned.lock().remove(&pip);
    }

    /// Number of pips currently assigned.
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.assigned.lock().len()
    }

    /// Steers a module to this worker for affinity.
    pub fn assign_module(&self, module: ModuleId) {
        let _ = self.modules.lock().insert(module);
    }

    /// Whether `module` is assigned to this worker.
    #[must_use]
    pub fn has_module(&self, module: ModuleId) -> bool {
        self.modules.lock().contains(&module)
    }

    /// Records content as present on this worker.
    pub fn record_content(&self, hash: ContentHash) {
        let _ = self.present_content.lock().insert(hash);
    }

    /// Whether content is already present on this worker.
    #[must_use]
    pub fn has_content(&self, hash: ContentHash) -> bool {
        self.present_content.lock().contains(&hash)
    }

    /// Bytes of `inputs` that are not yet present on this worker.
    #[must_use]
    pub fn absent_input_bytes(&self, inputs: &[(ContentHash, u64)]) -> u64 {
        let present = self.present_content.lock();
        inputs
            .iter()
            .filter(|(hash, _)| !present.contains(hash))
            .map(|(_, size)| *size)
            .sum()
    }
}

/// The local worker. Always pool index 0; attachment is immediate.
pub struct LocalWorker {
    common: WorkerCommon,
}

impl LocalWorker {
    /// Creates the local worker with the given slot totals and memory size.
    #[must_use]
    pub fn new(totals: SlotTotals, total_ram_mb: u32, total_commit_mb: u32) -> Self {
        let common = WorkerCommon::new(crate::LOCAL_WORKER_ID, "Local".to_owned(), totals);
        common.set_memory_totals(total_ram_mb, total_commit_mb);
        Self { common }
    }

    /// Brings the local worker to `Running`. Infallible in practice.
    pub fn attach(&self) -> Result<(), Error> {
        self.common.advance_state(WorkerState::Started)?;
        self.common.advance_state(WorkerState::Attached)?;
        self.common.advance_state(WorkerState::Running)
    }
}

/// A remote worker behind a transport.
pub struct RemoteWorker {
    common: WorkerCommon,
    transport: Arc<dyn WorkerTransport>,
}

impl RemoteWorker {
    /// Creates a remote worker. Slot totals are learned at attach time.
    #[must_use]
    pub fn new(id: WorkerId, transport: Arc<dyn WorkerTransport>) -> Self {
        let totals = SlotTotals {
            cache_lookup: 0,
            materialize: 0,
            process: 0,
            post_process: 0,
            ipc: 0,
        };
        Self {
            common: WorkerCommon::new(id, format!("Remote{id}"), totals),
            transport,
        }
    }

    /// The transport behind this worker.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn WorkerTransport> {
        &self.transport
    }

    /// Attaches to the remote worker and brings it to `Running`.
    ///
    /// Cache-lookup slots are oversubscribed by `cache_lookup_oversubscription`
    /// because cache lookup is I/O-dominated.
    pub async fn attach(&self, cache_lookup_oversubscription: u32) -> Result<(), Error> {
        self.common.advance_state(WorkerState::Started)?;
        let attachment =
            self.transport
                .initialize()
                .await
                .map_err(|error| Error::TransportFailed {
                    worker: self.common.id(),
                    error,
                })?;

        self.common
            .slots(SlotKind::Process)
            .set_total(attachment.total_process_slots);
        self.common
            .slots(SlotKind::MaterializeInput)
            .set_total(attachment.total_process_slots);
        self.common
            .slots(SlotKind::PostProcess)
            .set_total(attachment.total_process_slots);
        self.common
            .slots(SlotKind::Ipc)
            .set_total(attachment.total_process_slots);
        self.common.slots(SlotKind::CacheLookup).set_total(
            attachment
                .total_cache_lookup_slots
                .saturating_mul(cache_lookup_oversubscription.max(1)),
        );
        self.common
            .set_memory_totals(attachment.total_ram_mb, attachment.total_commit_mb);

        tracing::info!(
            name: "worker.attached",
            worker = self.common.id(),
            remote_name = attachment.name,
            process_slots = attachment.total_process_slots,
        );
        self.common.advance_state(WorkerState::Attached)?;
        self.common.advance_state(WorkerState::Running)
    }

    /// Detaches gracefully.
    pub async fn finish(&self) -> Result<(), Error> {
        self.common.advance_state(WorkerState::Stopping)?;
        let result = self
            .transport
            .finish()
            .await
            .map_err(|error| Error::TransportFailed {
                worker: self.common.id(),
                error,
            });
        self.common.advance_state(WorkerState::Stopped)?;
        result
    }

    /// Marks the worker stopped without a handshake, e.g. after it vanished.
    pub fn mark_stopped(&self) {
        // Transitions may partially fail if a concurrent finish is underway.
        let _ = self.common.advance_state(WorkerState::Stopping);
        let _ = self.common.advance_state(WorkerState::Stopped);
    }
}

/// A worker: the local one or a remote one.
pub enum Worker {
    /// The local worker, always index 0.
    Local(LocalWorker),
    /// A remote worker behind a transport.
    Remote(RemoteWorker),
}

impl Worker {
    /// Shared slot and memory accounting.
    #[must_use]
    pub fn common(&self) -> &WorkerCommon {
        match self {
            Worker::Local(w) => &w.common,
            Worker::Remote(w) => &w.common,
        }
    }

    /// Whether this is a remote worker.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Worker::Remote(_))
    }

    /// The remote variant, when this worker is remote.
    #[must_use]
    pub fn as_remote(&self) -> Option<&RemoteWorker> {
        match self {
            Worker::Remote(w) => Some(w),
            Worker::Local(_) => None,
        }
    }

}
