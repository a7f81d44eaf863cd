// SPDX-License-Identifier: Apache-2.0

//! Content cache contract.
//!
//! The core treats the two-phase fingerprint lookup as opaque: it hands the
//! cache the pip and its hashed inputs, and receives either a ready replay
//! descriptor or a miss.

use crate::error::CollaboratorError;
use crate::execution::{ContentHash, OutputContent, SourceHashes};
use buildflow_graph::{ArtifactPath, Pip};
use std::fmt;

/// Opaque fingerprint under which a process result is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub [u8; 16]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A ready-to-replay cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    /// The fingerprint the entry was stored under.
    pub fingerprint: Fingerprint,
    /// The cached outputs to replay.
    pub outputs: Vec<OutputContent>,
    /// Wall-clock milliseconds of the execution that produced the entry.
    pub original_duration_ms: u32,
}

/// Outcome of publishing a result to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    /// Whether the entry was stored (a concurrent publisher may win).
    pub stored: bool,
}

/// Content-addressed cache consulted before running any process.
#[async_trait::async_trait]
pub trait ContentCache: Send + Sync {
    /// Looks up a replay descriptor for `pip` given its hashed inputs.
    ///
    /// `Ok(None)` is a miss; errors are cache failures, not misses.
    async fn lookup(
        &self,
        pip: &Pip,
        inputs: &SourceHashes,
    ) -> Result<Option<CacheHit>, CollaboratorError>;

    /// Publishes the outputs of an executed `pip`. The fingerprint is
    /// derived by the cache from the pip and its hashed inputs.
    async fn publish(
        &self,
        pip: &Pip,
        inputs: &SourceHashes,
        outputs: &[OutputContent],
    ) -> Result<PublishResult, CollaboratorError>;

    /// Materializes `hash` at `path` on the local machine.
    async fn materialize(
        &self,
        hash: ContentHash,
        path: &ArtifactPath,
    ) -> Result<(), CollaboratorError>;

    /// Flushes and closes the cache. Called once at the end of the build.
    async fn close(&self) -> Result<(), CollaboratorError>;
}
