// SPDX-License-Identifier: Apache-2.0

//! Pip identifiers, pip payloads, and the immutable build DAG.
//!
//! A *pip* is an atomic build unit: an external process, a file copy, a file
//! write, an inter-process call step, a directory seal, or a meta operation
//! whose execution is pure bookkeeping. Pips form a directed acyclic graph
//! where an edge `A -> B` states that `B` consumes something `A` produces.
//!
//! Edges come in two weights. A *heavy* edge participates in reference
//! counting and failure propagation; a *light* edge imposes ordering only.
//!
//! Identifiers are dense `u32` values allocated once at graph build time and
//! never reused. [`PipId`] and [`NodeId`] are the same identifier viewed from
//! the pip table and from the graph respectively; the mapping is identity.

use std::fmt;

pub mod error;
pub mod graph;
pub mod pip;

pub use error::Error;
pub use graph::{GraphBuilder, PipGraph, PipGraphImpl};
pub use pip::{ArtifactPath, ModuleId, Pip, PipSpec, ProcessPip, SemaphoreRequirement, ServicePipKind};

/// Dense, graph-allocated identifier of a pip.
///
/// Allocated once when the graph is built, never reused within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PipId(u32);

/// The same identifier as [`PipId`], viewed from the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl PipId {
    /// Builds a pip id from a dense index.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The dense index of this pip.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The graph-side view of this identifier.
    #[must_use]
    pub const fn node(self) -> NodeId {
        NodeId(self.0)
    }
}

impl NodeId {
    /// Builds a node id from a dense index.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The dense index of this node.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The pip-side view of this identifier.
    #[must_use]
    pub const fn pip(self) -> PipId {
        PipId(self.0)
    }
}

impl From<PipId> for NodeId {
    fn from(id: PipId) -> Self {
        id.node()
    }
}

impl From<NodeId> for PipId {
    fn from(id: NodeId) -> Self {
        id.pip()
    }
}

impl fmt::Display for PipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pip{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node{}", self.0)
    }
}

/// The kind of a pip, determining how it is executed and dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PipType {
    /// An external process run in the sandbox.
    Process,
    /// An inter-process call step against a running service.
    Ipc,
    /// A file copy.
    CopyFile,
    /// A file write with fixed contents.
    WriteFile,
    /// A directory seal, fixing the visible contents of a directory.
    SealDirectory,
    /// Meta: a build value evaluation marker.
    Value,
    /// Meta: a spec file parse marker.
    SpecFile,
    /// Meta: a module evaluation marker.
    Module,
    /// Meta: a source file hash marker.
    HashSourceFile,
}

impl PipType {
    /// All pip types, in a stable order usable for dense indexing.
    pub const ALL: [PipType; 9] = [
        PipType::Process,
        PipType::Ipc,
        PipType::CopyFile,
        PipType::WriteFile,
        PipType::SealDirectory,
        PipType::Value,
        PipType::SpecFile,
        PipType::Module,
        PipType::HashSourceFile,
    ];

    /// Whether execution of this pip type is a no-op or trivial bookkeeping.
    #[must_use]
    pub const fn is_meta(self) -> bool {
        matches!(
            self,
            PipType::Value | PipType::SpecFile | PipType::Module | PipType::HashSourceFile
        )
    }

    /// Dense index of this pip type within [`PipType::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            PipType::Process => 0,
            PipType::Ipc => 1,
            PipType::CopyFile => 2,
            PipType::WriteFile => 3,
            PipType::SealDirectory => 4,
            PipType::Value => 5,
            PipType::SpecFile => 6,
            PipType::Module => 7,
            PipType::HashSourceFile => 8,
        }
    }
}

impl fmt::Display for PipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipType::Process => "Process",
            PipType::Ipc => "Ipc",
            PipType::CopyFile => "CopyFile",
            PipType::WriteFile => "WriteFile",
            PipType::SealDirectory => "SealDirectory",
            PipType::Value => "Value",
            PipType::SpecFile => "SpecFile",
            PipType::Module => "Module",
            PipType::HashSourceFile => "HashSourceFile",
        };
        write!(f, "{label}")
    }
}

/// The weight of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EdgeKind {
    /// Participates in reference counting and failure propagation.
    Heavy,
    /// Imposes ordering only.
    Light,
}

/// A directed edge in the pip DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PipEdge {
    /// The node on the other end of the edge.
    pub target: NodeId,
    /// Edge weight.
    pub kind: EdgeKind,
}

impl PipEdge {
    /// Builds a heavy edge to `target`.
    #[must_use]
    pub const fn heavy(target: NodeId) -> Self {
        Self {
            target,
            kind: EdgeKind::Heavy,
        }
    }

    /// Builds a light edge to `target`.
    #[must_use]
    pub const fn light(target: NodeId) -> Self {
        Self {
            target,
            kind: EdgeKind::Light,
        }
    }

    /// Whether this edge participates in reference counting.
    #[must_use]
    pub const fn is_heavy(&self) -> bool {
        matches!(self.kind, EdgeKind::Heavy)
    }
}
