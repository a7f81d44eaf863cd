// SPDX-License-Identifier: Apache-2.0

//! Errors for graph construction.

use crate::{NodeId, PipId};
use crate::pip::ArtifactPath;

/// Errors that can occur while building or querying a pip graph.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The graph contains a dependency cycle.
    #[error("Dependency cycle detected; {unprocessed} node(s) unreachable from any source")]
    CycleDetected {
        /// Number of nodes left unprocessed by the topological pass.
        unprocessed: usize,
    },

    /// An edge references a pip that was never added.
    #[error("Unknown pip {pip} referenced by an edge")]
    UnknownPip {
        /// The unknown pip.
        pip: PipId,
    },

    /// Two pips declare the same output artifact.
    #[error("Artifact `{artifact}` is produced by both {first} and {second}")]
    DuplicateProducer {
        /// The artifact with two producers.
        artifact: ArtifactPath,
        /// The pip that declared the artifact first.
        first: PipId,
        /// The pip that declared it again.
        second: PipId,
    },

    /// A self-edge was declared.
    #[error("Pip {node} declares a dependency on itself")]
    SelfDependency {
        /// The offending node.
        node: NodeId,
    },

    /// Too many pips for the dense 32-bit identifier space.
    #[error("Pip limit exceeded")]
    PipLimitExceeded,
}
