// SPDX-License-Identifier: Apache-2.0

//! JSON graph specification accepted by the `bf_engine` binary.
//!
//! A front-end convenience only: the scheduler core consumes the built
//! graph, never this format.

use buildflow_graph::{
    EdgeKind, GraphBuilder, Pip, PipGraphImpl, PipId, PipSpec, PipType, ProcessPip,
    SemaphoreRequirement, ServicePipKind,
};
use serde::Deserialize;
use std::collections::HashMap;

/// One pip declaration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipSpecEntry {
    /// Unique name, referenced by `deps` of other entries.
    pub name: String,
    /// Pip kind and its kind-specific fields.
    #[serde(flatten)]
    pub kind: PipKindSpec,
    /// Author-declared priority (high 8 bits of the effective priority).
    #[serde(default)]
    pub static_priority: u8,
    /// Heavy dependencies by name.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Ordering-only dependencies by name.
    #[serde(default)]
    pub light_deps: Vec<String>,
    /// Counting-semaphore requirements.
    #[serde(default)]
    pub semaphores: Vec<SemaphoreEntry>,
}

/// A counting-semaphore requirement.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SemaphoreEntry {
    /// Semaphore name.
    pub name: String,
    /// Units taken while the pip runs.
    pub units: u32,
    /// Total units of the semaphore.
    pub limit: u32,
}

/// Kind-specific pip fields.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipKindSpec {
    /// An external process.
    Process {
        /// Executable path.
        executable: String,
        /// Command-line arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Declared input files.
        #[serde(default)]
        inputs: Vec<String>,
        /// Declared output files.
        #[serde(default)]
        outputs: Vec<String>,
    },
    /// Copy `source` to `destination`.
    CopyFile {
        /// File to copy.
        source: String,
        /// Destination path.
        destination: String,
    },
    /// Write fixed contents.
    WriteFile {
        /// Destination path.
        destination: String,
        /// Contents to write.
        contents: String,
    },
    /// Seal a directory.
    SealDirectory {
        /// Directory being sealed.
        directory: String,
        /// The visible contents of the sealed directory.
        #[serde(default)]
        contents: Vec<String>,
    },
    /// A meta value pip, useful for grouping.
    Value,
}

/// The whole graph document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    /// All pip declarations.
    pub pips: Vec<PipSpecEntry>,
    /// Names to schedule; all pips when empty.
    #[serde(default)]
    pub filter: Vec<String>,
}

impl GraphSpec {
    /// Builds the pip graph and the filter set.
    pub fn build(self) -> anyhow::Result<(PipGraphImpl, Vec<PipId>)> {
        let mut builder = GraphBuilder::new();
        let mut ids: HashMap<String, PipId> = HashMap::new();

        for entry in &self.pips {
            let spec = match &entry.kind {
                PipKindSpec::Process {
                    executable,
                    args,
                    inputs,
                    outputs,
                } => PipSpec::Process(ProcessPip {
                    executable: executable.as_str().into(),
                    arguments: args.clone(),
                    input_files: inputs.iter().map(|p| p.as_str().into()).collect(),
                    output_files: outputs.iter().map(|p| p.as_str().into()).collect(),
                    shared_opaque_directories: Vec::new(),
                    service_kind: ServicePipKind::None,
                    service_dependencies: Vec::new(),
                    is_uncacheable: false,
                }),
                PipKindSpec::CopyFile {
                    source,
                    destination,
                } => PipSpec::CopyFile {
                    source: source.as_str().into(),
                    destination: destination.as_str().into(),
                },
                PipKindSpec::WriteFile {
                    destination,
                    contents,
                } => PipSpec::WriteFile {
                    destination: destination.as_str().into(),
                    contents: contents.clone(),
                },
                PipKindSpec::SealDirectory {
                    directory,
                    contents,
                } => PipSpec::SealDirectory {
                    directory: directory.as_str().into(),
                    contents: contents.iter().map(|p| p.as_str().into()).collect(),
                },
                PipKindSpec::Value => PipSpec::Meta(PipType::Value),
            };

            let id = builder.add_pip(Pip {
                id: PipId::from_index(0),
                static_priority: entry.static_priority,
                module: None,
                semaphores: entry
                    .semaphores
                    .iter()
                    .map(|s| SemaphoreRequirement {
                        name: s.name.clone(),
                        units: s.units,
                        limit: s.limit,
                    })
                    .collect(),
                spec,
            })?;
            if ids.insert(entry.name.clone(), id).is_some() {
                anyhow::bail!("duplicate pip name `{}`", entry.name);
            }
        }

        let resolve = |name: &str| -> anyhow::Result<PipId> {
            ids.get(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown pip name `{name}`"))
        };
        for entry in &self.pips {
            let dependent = resolve(&entry.name)?;
            for dep in &entry.deps {
                builder.add_dependency(dependent, resolve(dep)?, EdgeKind::Heavy)?;
            }
            for dep in &entry.light_deps {
                builder.add_dependency(dependent, resolve(dep)?, EdgeKind::Light)?;
            }
        }

        let filter = if self.filter.is_empty() {
            ids.values().copied().collect()
        } else {
            self.filter
                .iter()
                .map(|name| resolve(name))
                .collect::<anyhow::Result<Vec<_>>>()?
        };

        Ok((builder.build()?, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_builds_a_small_graph() {
        let json = r##"{
            "pips": [
                {"name": "gen", "kind": "write_file",
                 "destination": "/out/gen.h", "contents": "#define X 1"},
                {"name": "compile", "kind": "process",
                 "executable": "/usr/bin/cc", "args": ["-c", "main.c"],
                 "inputs": ["/src/main.c", "/out/gen.h"],
                 "outputs": ["/out/main.o"], "deps": ["gen"]}
            ]
        }"##;
        let spec: GraphSpec = serde_json::from_str(json).expect("parse");
        let (graph, filter) = spec.build().expect("build");
        use buildflow_graph::PipGraph as _;
        assert_eq!(graph.node_count(), 2);
        assert_eq!(filter.len(), 2);
        assert!(graph.producer_of(&"/out/main.o".into()).is_some());
    }

    #[test]
    fn unknown_dependency_names_are_rejected() {
        let json = r#"{
            "pips": [
                {"name": "a", "kind": "value", "deps": ["missing"]}
            ]
        }"#;
        let spec: GraphSpec = serde_json::from_str(json).expect("parse");
        assert!(spec.build().is_err());
    }
}
