// SPDX-License-Identifier: Apache-2.0

//! The immutable pip graph and its builder.
//!
//! The scheduler core consumes the graph exclusively through the [`PipGraph`]
//! trait; [`PipGraphImpl`] is the in-memory implementation produced by
//! [`GraphBuilder`] and used by the façade binary and by tests.

use crate::error::Error;
use crate::pip::{ArtifactPath, Pip, PipSpec};
use crate::{EdgeKind, NodeId, PipEdge, PipId, PipType};
use std::collections::HashMap;
use std::sync::Arc;

/// Read surface of the immutable build DAG.
///
/// Implementations must be cheap to query: edge lists are borrowed slices and
/// payload hydration returns a shared handle. All methods are infallible;
/// identifiers handed out by the same graph are always valid.
pub trait PipGraph: Send + Sync {
    /// Number of nodes in the graph. Identifiers are dense in `0..node_count()`.
    fn node_count(&self) -> usize;

    /// Edges from `node` to its dependents.
    fn outgoing_edges(&self, node: NodeId) -> &[PipEdge];

    /// Edges from dependencies of `node` to `node`, expressed as the
    /// dependency on the `target` end.
    fn incoming_edges(&self, node: NodeId) -> &[PipEdge];

    /// The kind of the pip behind `id`.
    fn pip_type(&self, id: PipId) -> PipType;

    /// Hydrates the full payload of `id`.
    ///
    /// Callers hydrate inside the step that needs the payload and drop the
    /// handle at step exit; the runtime tables never hold one.
    fn hydrate_pip(&self, id: PipId) -> Arc<Pip>;

    /// The pip producing `artifact`, if any.
    fn producer_of(&self, artifact: &ArtifactPath) -> Option<PipId>;

    /// The sealed contents of a seal-directory pip; empty for other kinds.
    fn list_sealed_directory_contents(&self, dir: PipId) -> &[ArtifactPath];

    /// Nodes in a topological order: every dependency precedes its dependents.
    fn topological_order(&self) -> &[NodeId];
}

struct NodeRecord {
    pip: Arc<Pip>,
    outgoing: Vec<PipEdge>,
    incoming: Vec<PipEdge>,
}

/// In-memory [`PipGraph`] implementation.
pub struct PipGraphImpl {
    nodes: Vec<NodeRecord>,
    producers: HashMap<ArtifactPath, PipId>,
    topo_order: Vec<NodeId>,
    empty_contents: Vec<ArtifactPath>,
}

impl PipGraph for PipGraphImpl {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn outgoing_edges(&self, node: NodeId) -> &[PipEdge] {
        &self.nodes[node.index()].outgoing
    }

    fn incoming_edges(&self, node: NodeId) -> &[PipEdge] {
        &self.nodes[node.index()].incoming
    }

    fn pip_type(&self, id: PipId) -> PipType {
        self.nodes[id.index()].pip.pip_type()
    }

    fn hydrate_pip(&self, id: PipId) -> Arc<Pip> {
        Arc::clone(&self.nodes[id.index()].pip)
    }

    fn producer_of(&self, artifact: &ArtifactPath) -> Option<PipId> {
        self.producers.get(artifact).copied()
    }

    fn list_sealed_directory_contents(&self, dir: PipId) -> &[ArtifactPath] {
        match &self.nodes[dir.index()].pip.spec {
            PipSpec::SealDirectory { contents, .. } => contents,
            _ => &self.empty_contents,
        }
    }

    fn topological_order(&self) -> &[NodeId] {
        &self.topo_order
    }
}

/// Incremental construction of a [`PipGraphImpl`].
///
/// Pips are added first; edges reference previously added pips. `build`
/// validates acyclicity and producer uniqueness.
#[derive(Default)]
pub struct GraphBuilder {
    pips: Vec<Pip>,
    edges: Vec<(NodeId, NodeId, EdgeKind)>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pip, assigning it the next dense identifier.
    ///
    /// The `id` field of the passed payload is overwritten with the assigned
    /// identifier, which is also returned.
    pub fn add_pip(&mut self, mut pip: Pip) -> Result<PipId, Error> {
        let index = u32::try_from(self.pips.len()).map_err(|_| Error::PipLimitExceeded)?;
        let id = PipId::from_index(index);
        pip.id = id;
        self.pips.push(pip);
        Ok(id)
    }

    /// Declares that `dependent` consumes an output of `dependency`.
    pub fn add_dependency(
        &mut self,
        dependent: PipId,
        dependency: PipId,
        kind: EdgeKind,
    ) -> Result<(), Error> {
        if dependent == dependency {
            return Err(Error::SelfDependency {
                node: dependent.node(),
            });
        }
        for id in [dependent, dependency] {
            if id.index() >= self.pips.len() {
                return Err(Error::UnknownPip { pip: id });
            }
        }
        self.edges.push((dependency.node(), dependent.node(), kind));
        Ok(())
    }

    /// Finalizes the graph, validating acyclicity and producer uniqueness.
    pub fn build(self) -> Result<PipGraphImpl, Error> {
        let mut producers: HashMap<ArtifactPath, PipId> = HashMap::new();
        for pip in &self.pips {
            for artifact in declared_outputs(pip) {
                if let Some(first) = producers.insert(artifact.clone(), pip.id) {
                    return Err(Error::DuplicateProducer {
                        artifact: artifact.clone(),
                        first,
                        second: pip.id,
                    });
                }
            }
        }

        let mut nodes: Vec<NodeRecord> = self
            .pips
            .into_iter()
            .map(|pip| NodeRecord {
                pip: Arc::new(pip),
                outgoing: Vec::new(),
                incoming: Vec::new(),
            })
            .collect();

        for (from, to, kind) in self.edges {
            nodes[from.index()].outgoing.push(PipEdge { target: to, kind });
            nodes[to.index()].incoming.push(PipEdge { target: from, kind });
        }

        let topo_order = topological_sort(&nodes)?;

        Ok(PipGraphImpl {
            nodes,
            producers,
            topo_order,
            empty_contents: Vec::new(),
        })
    }
}

fn declared_outputs(pip: &Pip) -> Vec<&ArtifactPath> {
    match &pip.spec {
        PipSpec::Process(p) => p.output_files.iter().collect(),
        PipSpec::CopyFile { destination, .. } | PipSpec::WriteFile { destination, .. } => {
            vec![destination]
        }
        _ => Vec::new(),
    }
}

/// Kahn's algorithm over all edges (light edges order too).
fn topological_sort(nodes: &[NodeRecord]) -> Result<Vec<NodeId>, Error> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.incoming.len()).collect();
    let mut ready: Vec<NodeId> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| NodeId::from_index(i as u32))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop() {
        order.push(node);
        for edge in &nodes[node.index()].outgoing {
            let d = &mut in_degree[edge.target.index()];
            *d -= 1;
            if *d == 0 {
                ready.push(edge.target);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(Error::CycleDetected {
            unprocessed: nodes.len() - order.len(),
        });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pip::ProcessPip;
    use crate::pip::ServicePipKind;

    fn process_pip(out: &str) -> Pip {
        Pip {
            id: PipId::from_index(0),
            static_priority: 0,
            module: None,
            semaphores: Vec::new(),
            spec: PipSpec::Process(ProcessPip {
                executable: "/bin/tool".into(),
                arguments: Vec::new(),
                input_files: Vec::new(),
                output_files: vec![out.into()],
                shared_opaque_directories: Vec::new(),
                service_kind: ServicePipKind::None,
                service_dependencies: Vec::new(),
                is_uncacheable: false,
            }),
        }
    }

    #[test]
    fn builds_a_linear_chain() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_pip(process_pip("/out/a")).expect("add a");
        let b = builder.add_pip(process_pip("/out/b")).expect("add b");
        let c = builder.add_pip(process_pip("/out/c")).expect("add c");
        builder.add_dependency(b, a, EdgeKind::Heavy).expect("b->a");
        builder.add_dependency(c, b, EdgeKind::Heavy).expect("c->b");

        let graph = builder.build().expect("acyclic");
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.outgoing_edges(a.node()), &[PipEdge::heavy(b.node())]);
        assert_eq!(graph.incoming_edges(c.node()), &[PipEdge::heavy(b.node())]);
        assert_eq!(graph.producer_of(&"/out/b".into()), Some(b));

        let order = graph.topological_order();
        let pos = |id: PipId| order.iter().position(|n| *n == id.node()).expect("present");
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn rejects_cycles() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_pip(process_pip("/out/a")).expect("add a");
        let b = builder.add_pip(process_pip("/out/b")).expect("add b");
        builder.add_dependency(b, a, EdgeKind::Heavy).expect("b->a");
        builder.add_dependency(a, b, EdgeKind::Heavy).expect("a->b");
        assert!(matches!(
            builder.build(),
            Err(Error::CycleDetected { unprocessed: 2 })
        ));
    }

    #[test]
    fn rejects_duplicate_producers() {
        let mut builder = GraphBuilder::new();
        let _ = builder.add_pip(process_pip("/out/same")).expect("add");
        let _ = builder.add_pip(process_pip("/out/same")).expect("add");
        assert!(matches!(
            builder.build(),
            Err(Error::DuplicateProducer { .. })
        ));
    }

    #[test]
    fn rejects_self_edges() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_pip(process_pip("/out/a")).expect("add a");
        assert!(matches!(
            builder.add_dependency(a, a, EdgeKind::Heavy),
            Err(Error::SelfDependency { .. })
        ));
    }

    #[test]
    fn sealed_directory_contents_are_listed() {
        let mut builder = GraphBuilder::new();
        let seal = builder
            .add_pip(Pip {
                id: PipId::from_index(0),
                static_priority: 0,
                module: None,
                semaphores: Vec::new(),
                spec: PipSpec::SealDirectory {
                    directory: "/out/dir".into(),
                    contents: vec!["/out/dir/a".into(), "/out/dir/b".into()],
                },
            })
            .expect("add seal");
        let graph = builder.build().expect("acyclic");
        assert_eq!(graph.list_sealed_directory_contents(seal).len(), 2);
        assert_eq!(graph.pip_type(seal), PipType::SealDirectory);
    }
}
