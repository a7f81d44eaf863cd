// SPDX-License-Identifier: Apache-2.0

//! Errors for the worker pool.

use crate::worker::WorkerState;
use crate::WorkerId;
use buildflow_api::CollaboratorError;

/// Errors that can occur operating the worker pool.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A remote transport call failed.
    #[error("Transport failure on worker {worker}: {error}")]
    TransportFailed {
        /// The affected worker.
        worker: WorkerId,
        /// The underlying transport failure.
        error: CollaboratorError,
    },

    /// A worker state transition was attempted out of order.
    #[error("Worker {worker} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// The affected worker.
        worker: WorkerId,
        /// State the worker was in.
        from: WorkerState,
        /// State that was requested.
        to: WorkerState,
    },
}
