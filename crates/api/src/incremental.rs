// SPDX-License-Identifier: Apache-2.0

//! Incremental scheduling state contract.
//!
//! A persistent dirty/clean mark over the graph. A node that is both clean
//! and materialized can be skipped as up to date without touching a worker.

use crate::error::CollaboratorError;
use crate::execution::ObservedAccess;
use buildflow_graph::NodeId;
use std::path::Path;

/// Persistent clean/materialized marks consulted by the incremental-skip step.
pub trait IncrementalSchedulingState: Send + Sync {
    /// Whether `node` is clean and its outputs are materialized on disk.
    fn is_clean_and_materialized(&self, node: NodeId) -> bool;

    /// Marks `node` clean after a successful run or replay.
    fn mark_clean(&self, node: NodeId);

    /// Marks the outputs of `node` materialized on disk.
    fn mark_materialized(&self, node: NodeId);

    /// Marks `node` so it is re-run in every build.
    fn mark_perpetually_dirty(&self, node: NodeId);

    /// Records dynamically observed accesses for `node`.
    fn record_dynamic_observations(&self, node: NodeId, observed: &[ObservedAccess]);

    /// Persists the state to `path`.
    fn save(&self, path: &Path) -> Result<(), CollaboratorError>;
}
