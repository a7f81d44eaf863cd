// SPDX-License-Identifier: Apache-2.0

//! Pip payloads.
//!
//! The mutable runtime state of a pip lives in the scheduler; the payload
//! described here is the immutable, possibly heavy description of what a pip
//! does. Payloads are hydrated on demand inside the execution step that needs
//! them and dropped at step exit, so they are shared behind an `Arc`.

use crate::{PipId, PipType};
use std::fmt;
use std::sync::Arc;

/// An absolute, normalized path to a build artifact.
///
/// Cheap to clone; paths are interned once at graph construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ArtifactPath(Arc<str>);

impl ArtifactPath {
    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactPath {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for ArtifactPath {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the module a pip was authored in, used for worker affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module{}", self.0)
    }
}

/// A named counting-semaphore requirement declared by a pip.
///
/// Pips whose requirements cannot all be satisfied wait in the dispatcher's
/// semaphore tier until enough units are released.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SemaphoreRequirement {
    /// Semaphore name, scoped to the build session.
    pub name: String,
    /// Units taken while the pip runs.
    pub units: u32,
    /// Total units of the named semaphore.
    pub limit: u32,
}

/// The service role of a process pip, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ServicePipKind {
    /// A plain process pip.
    #[default]
    None,
    /// A long-lived service started on demand before its clients.
    Service {
        /// The companion pip that shuts this service down at drain time.
        shutdown_pip: Option<PipId>,
    },
    /// The shutdown companion of a service.
    ServiceShutdown,
}

impl ServicePipKind {
    /// Whether this is a service start or shutdown pip.
    #[must_use]
    pub const fn is_start_or_shutdown(&self) -> bool {
        !matches!(self, ServicePipKind::None)
    }
}

/// Payload of an external process pip.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessPip {
    /// Executable to run.
    pub executable: ArtifactPath,
    /// Command-line arguments.
    pub arguments: Vec<String>,
    /// Declared input files.
    pub input_files: Vec<ArtifactPath>,
    /// Declared output files.
    pub output_files: Vec<ArtifactPath>,
    /// Directories whose written contents are not statically declared.
    /// Anything produced under these must be flagged for the scrubber.
    pub shared_opaque_directories: Vec<ArtifactPath>,
    /// Service role of this process, if any.
    pub service_kind: ServicePipKind,
    /// Service pips that must be running before this pip executes.
    pub service_dependencies: Vec<PipId>,
    /// When set, results of this pip are never published to the cache and
    /// the flag propagates to dependents.
    pub is_uncacheable: bool,
}

/// Payload of an inter-process call step against a running service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IpcPip {
    /// Moniker identifying the IPC endpoint.
    pub moniker: String,
    /// Serialized operation payload.
    pub payload: String,
    /// Service pips that must be running before this call is made.
    pub service_dependencies: Vec<PipId>,
}

/// Pip-kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PipSpec {
    /// External process.
    Process(ProcessPip),
    /// Inter-process call step.
    Ipc(IpcPip),
    /// Copy `source` to `destination`.
    CopyFile {
        /// File to copy.
        source: ArtifactPath,
        /// Destination path.
        destination: ArtifactPath,
    },
    /// Write `contents` to `destination`.
    WriteFile {
        /// Destination path.
        destination: ArtifactPath,
        /// Contents to write.
        contents: String,
    },
    /// Seal `directory` with the listed contents.
    SealDirectory {
        /// Directory being sealed.
        directory: ArtifactPath,
        /// The full visible contents of the sealed directory.
        contents: Vec<ArtifactPath>,
    },
    /// Meta pip; execution is trivial bookkeeping.
    Meta(PipType),
}

/// A pip: an atomic build unit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Pip {
    /// Identifier, assigned by the graph builder.
    pub id: PipId,
    /// Author-declared scheduling priority; occupies the high 8 bits of the
    /// effective priority word.
    pub static_priority: u8,
    /// Module this pip was authored in, for worker affinity.
    pub module: Option<ModuleId>,
    /// Declared counting-semaphore requirements.
    pub semaphores: Vec<SemaphoreRequirement>,
    /// Kind-specific payload.
    pub spec: PipSpec,
}

impl Pip {
    /// The kind of this pip, derived from its payload.
    #[must_use]
    pub fn pip_type(&self) -> PipType {
        match &self.spec {
            PipSpec::Process(_) => PipType::Process,
            PipSpec::Ipc(_) => PipType::Ipc,
            PipSpec::CopyFile { .. } => PipType::CopyFile,
            PipSpec::WriteFile { .. } => PipType::WriteFile,
            PipSpec::SealDirectory { .. } => PipType::SealDirectory,
            PipSpec::Meta(ty) => *ty,
        }
    }

    /// The process payload, when this is a process pip.
    #[must_use]
    pub fn as_process(&self) -> Option<&ProcessPip> {
        match &self.spec {
            PipSpec::Process(p) => Some(p),
            _ => None,
        }
    }

    /// Service pips this pip requires to be running before it executes.
    #[must_use]
    pub fn service_dependencies(&self) -> &[PipId] {
        match &self.spec {
            PipSpec::Process(p) => &p.service_dependencies,
            PipSpec::Ipc(ipc) => &ipc.service_dependencies,
            _ => &[],
        }
    }

    /// Whether this pip is a service start or shutdown pip.
    #[must_use]
    pub fn is_start_or_shutdown(&self) -> bool {
        self.as_process()
            .is_some_and(|p| p.service_kind.is_start_or_shutdown())
    }

    /// Whether this pip is a client of at least one service.
    #[must_use]
    pub fn is_service_client(&self) -> bool {
        !self.service_dependencies().is_empty()
    }

    /// Whether results of this pip may be published to the cache.
    #[must_use]
    pub fn is_uncacheable(&self) -> bool {
        self.as_process().is_some_and(|p| p.is_uncacheable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_pip(id: u32) -> Pip {
        Pip {
            id: PipId::from_index(id),
            static_priority: 0,
            module: None,
            semaphores: Vec::new(),
            spec: PipSpec::Meta(PipType::Value),
        }
    }

    #[test]
    fn pip_type_is_derived_from_spec() {
        let pip = meta_pip(0);
        assert_eq!(pip.pip_type(), PipType::Value);

        let copy = Pip {
            spec: PipSpec::CopyFile {
                source: "/src/a".into(),
                destination: "/out/a".into(),
            },
            ..meta_pip(1)
        };
        assert_eq!(copy.pip_type(), PipType::CopyFile);
    }

    #[test]
    fn service_roles() {
        let service = Pip {
            spec: PipSpec::Process(ProcessPip {
                executable: "/bin/svc".into(),
                arguments: Vec::new(),
                input_files: Vec::new(),
                output_files: Vec::new(),
                shared_opaque_directories: Vec::new(),
                service_kind: ServicePipKind::Service {
                    shutdown_pip: Some(PipId::from_index(9)),
                },
                service_dependencies: Vec::new(),
                is_uncacheable: false,
            }),
            ..meta_pip(2)
        };
        assert!(service.is_start_or_shutdown());
        assert!(!service.is_service_client());

        let client = Pip {
            spec: PipSpec::Process(ProcessPip {
                executable: "/bin/cl".into(),
                arguments: Vec::new(),
                input_files: Vec::new(),
                output_files: Vec::new(),
                shared_opaque_directories: Vec::new(),
                service_kind: ServicePipKind::None,
                service_dependencies: vec![PipId::from_index(2)],
                is_uncacheable: false,
            }),
            ..meta_pip(3)
        };
        assert!(client.is_service_client());
        assert!(!client.is_start_or_shutdown());
    }

    #[test]
    fn artifact_paths_round_trip_serde() {
        let path = ArtifactPath::from("/out/bin/tool");
        let json = serde_json::to_string(&path).expect("serialize");
        assert_eq!(json, "\"/out/bin/tool\"");
        let back: ArtifactPath = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, path);
    }
}
