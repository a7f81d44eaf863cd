// SPDX-License-Identifier: Apache-2.0

//! Remote worker transport contract.
//!
//! The wire format is out of scope; the transport exposes the remote build
//! steps as opaque async calls. One transport instance corresponds to one
//! remote worker for the lifetime of the build.

use crate::cache::CacheHit;
use crate::error::CollaboratorError;
use crate::execution::{ExecutionResult, OutputContent, SourceHashes};
use buildflow_graph::Pip;

/// Facts learned when a remote worker attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAttachment {
    /// Human-readable worker name.
    pub name: String,
    /// Process execution slots offered.
    pub total_process_slots: u32,
    /// Cache-lookup slots offered (before oversubscription).
    pub total_cache_lookup_slots: u32,
    /// Total machine RAM in megabytes.
    pub total_ram_mb: u32,
    /// Total machine commit limit in megabytes.
    pub total_commit_mb: u32,
}

/// RPC surface of one remote worker.
#[async_trait::async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Attaches to the remote worker.
    async fn initialize(&self) -> Result<WorkerAttachment, CollaboratorError>;

    /// Performs a cache lookup on the remote worker.
    async fn cache_lookup(
        &self,
        pip: &Pip,
        inputs: &SourceHashes,
    ) -> Result<Option<CacheHit>, CollaboratorError>;

    /// Places the inputs of `pip` on the remote worker. Returns the bytes
    /// that had to be transferred.
    async fn materialize_inputs(&self, pip: &Pip) -> Result<u64, CollaboratorError>;

    /// Executes `pip` on the remote worker.
    async fn execute_process(&self, pip: &Pip) -> Result<ExecutionResult, CollaboratorError>;

    /// Replicates outputs of `pip` back toward the master.
    async fn materialize_outputs(
        &self,
        pip: &Pip,
        outputs: &[OutputContent],
    ) -> Result<(), CollaboratorError>;

    /// Detaches gracefully. No calls may follow.
    async fn finish(&self) -> Result<(), CollaboratorError>;
}
