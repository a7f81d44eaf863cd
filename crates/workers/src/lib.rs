// SPDX-License-Identifier: Apache-2.0

//! Worker pool, slot pools, and worker selectors.
//!
//! A build always has a local worker at index 0 and may attach remote
//! workers behind a transport. Every worker exposes an independent counted
//! slot pool per activity kind; selectors assign pips to workers subject to
//! slot availability, memory pressure, and module affinity, yielding when no
//! worker fits.

pub mod error;
pub mod pool;
pub mod selector;
pub mod slots;
pub mod worker;

pub use error::Error;
pub use pool::WorkerPool;
pub use selector::{
    CacheLookupWorkerSelector, CpuWorkerSelector, LimitingResource, RunnableFacts,
    SelectionCounters,
};
pub use slots::{MemoryResource, SlotKind, SlotPool};
pub use worker::{LocalWorker, RemoteWorker, SlotTotals, Worker, WorkerCommon, WorkerState};

/// Index of a worker within the pool. The local worker is always 0.
pub type WorkerId = usize;

/// The id of the local worker.
pub const LOCAL_WORKER_ID: WorkerId = 0;
