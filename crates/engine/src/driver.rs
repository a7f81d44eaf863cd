// SPDX-License-Identifier: Apache-2.0

//! The dependency-driven DAG driver.
//!
//! Reduces the graph to the filtered scheduled set, assigns every scheduled
//! pip its one-shot priority, seeds the ready set, and propagates completion
//! effects: refcount decrements, skip-on-failure, and the uncacheable-impact
//! flag. Service start and shutdown pips are scheduled but held back; the
//! service manager runs them out of band.

use crate::runtime_info::RuntimeInfoTable;
use buildflow_api::{HistoricalPerfInfo, PipState};
use buildflow_graph::{PipGraph, PipId, PipType};
use buildflow_telemetry::PipStateCounters;
use std::collections::VecDeque;
use std::sync::Arc;

/// The critical-path estimate occupies the low 24 bits of the priority word.
pub const CRITICAL_PATH_PRIORITY_BITS: u32 = 24;
const CRITICAL_PATH_MASK: i32 = (1 << CRITICAL_PATH_PRIORITY_BITS) - 1;

/// The static priority used to lift service clients above any process.
const SERVICE_CLIENT_STATIC_PRIORITY: i32 = 0xFF;

/// Packs a static priority and a critical-path estimate into one word.
#[must_use]
pub fn pack_priority(static_priority: u8, critical_path_ms: i32) -> i32 {
    (i32::from(static_priority) << CRITICAL_PATH_PRIORITY_BITS)
        | critical_path_ms.clamp(0, CRITICAL_PATH_MASK)
}

fn default_duration_ms(pip_type: PipType) -> i32 {
    match pip_type {
        PipType::Process => 10,
        PipType::Ipc => 15,
        PipType::CopyFile => 2,
        PipType::WriteFile | PipType::SealDirectory => 1,
        _ => 0,
    }
}

/// A pip that just became runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewlyRunnable {
    /// The pip whose refcount reached zero.
    pub pip: PipId,
    /// Whether it must be skipped instead of started.
    pub skip: bool,
}

/// Result of the initial scheduling pass.
pub struct InitialSchedule {
    /// Pips ready to run immediately.
    pub ready: Vec<PipId>,
    /// Service start and shutdown pips, run by the service manager.
    pub held_back: Vec<PipId>,
    /// Scheduled pips the drain must complete (held-back ones excluded).
    pub outstanding: usize,
}

/// Computes initial scheduling and propagates completion effects.
pub struct DagDriver {
    graph: Arc<dyn PipGraph>,
    infos: Arc<RuntimeInfoTable>,
    scheduled: Vec<bool>,
    held_back: Vec<bool>,
}

impl DagDriver {
    /// Creates a driver with an empty scheduled set.
    #[must_use]
    pub fn new(graph: Arc<dyn PipGraph>, infos: Arc<RuntimeInfoTable>) -> Self {
        let count = graph.node_count();
        Self {
            graph,
            infos,
            scheduled: vec![false; count],
            held_back: vec![false; count],
        }
    }

    /// Whether `pip` is in the scheduled set.
    #[must_use]
    pub fn is_scheduled(&self, pip: PipId) -> bool {
        self.scheduled.get(pip.index()).copied().unwrap_or(false)
    }

    /// Whether `pip` is held back for the service manager.
    #[must_use]
    pub fn is_held_back(&self, pip: PipId) -> bool {
        self.held_back.get(pip.index()).copied().unwrap_or(false)
    }

    /// Computes the scheduled set, priorities, and the initial ready seeds.
    ///
    /// The scheduled set is the filter plus its transitive dependencies,
    /// closed under "every service client's service and that service's
    /// shutdown pip are included". An empty filter schedules nothing.
    pub fn initialize(
        &mut self,
        filter: &[PipId],
        historic: &dyn HistoricalPerfInfo,
        state_counters: &PipStateCounters,
    ) -> InitialSchedule {
        self.close_over_dependencies(filter);
        self.assign_priorities(historic);
        self.seed_states(state_counters)
    }

    fn close_over_dependencies(&mut self, filter: &[PipId]) {
        let mut worklist: VecDeque<PipId> = filter.iter().copied().collect();
        while let Some(pip) = worklist.pop_front() {
            let index = pip.index();
            if self.scheduled[index] {
                continue;
            }
            self.scheduled[index] = true;

            // Light edges impose ordering, so dependencies of both kinds
            // must be in the scheduled set.
            for edge in self.graph.incoming_edges(pip.node()) {
                worklist.push_back(edge.target.pip());
            }

            let payload = self.graph.hydrate_pip(pip);
            if payload.is_start_or_shutdown() {
                self.held_back[index] = true;
            }
            for service in payload.service_dependencies() {
                worklist.push_back(*service);
                let service_payload = self.graph.hydrate_pip(*service);
                if let Some(process) = service_payload.as_process() {
                    if let buildflow_graph::ServicePipKind::Service {
                        shutdown_pip: Some(shutdown),
                    } = process.service_kind
                    {
                        worklist.push_back(shutdown);
                    }
                }
            }
        }
    }

    /// Assigns priorities in topologically descending order (sinks first),
    /// so every dependent's chain is known before its dependencies.
    fn assign_priorities(&self, historic: &dyn HistoricalPerfInfo) {
        for node in self.graph.topological_order().iter().rev() {
            let pip = node.pip();
            if !self.scheduled[pip.index()] {
                continue;
            }
            let info = self.infos.get(pip);
            let pip_type = self.graph.pip_type(pip);

            let heavy_in_degree = self
                .graph
                .incoming_edges(*node)
                .iter()
                .filter(|e| e.is_heavy())
                .count() as i32;
            let (own_ms, had_estimate) = match historic.estimated_duration_ms(pip) {
                Some(ms) => (i32::try_from(ms).unwrap_or(i32::MAX), true),
                None => (
                    default_duration_ms(pip_type).saturating_mul(1 + heavy_in_degree),
                    false,
                ),
            };

            let downstream = self
                .graph
                .outgoing_edges(*node)
                .iter()
                .filter(|e| e.is_heavy() && self.scheduled[e.target.index()])
                .map(|e| self.infos.get(e.target.pip()).critical_path_ms())
                .max()
                .unwrap_or(0);
            let critical_path = downstream.saturating_add(own_ms);

            info.set_critical_path_ms(critical_path);
            info.set_had_historic_estimate(had_estimate);

            let payload = self.graph.hydrate_pip(pip);
            let priority = if pip_type.is_meta() {
                i32::MAX
            } else if payload.is_service_client() {
                pack_priority(SERVICE_CLIENT_STATIC_PRIORITY as u8, critical_path)
            } else {
                pack_priority(payload.static_priority, critical_path)
            };
            info.set_priority(priority);
        }
    }

    fn seed_states(&self, state_counters: &PipStateCounters) -> InitialSchedule {
        let mut ready = Vec::new();
        let mut held_back = Vec::new();
        let mut outstanding = 0;

        for (pip, info) in self.infos.iter() {
            if !self.scheduled[pip.index()] {
                continue;
            }
            let pip_type = self.graph.pip_type(pip);
            let heavy_in_degree = self
                .graph
                .incoming_edges(pip.node())
                .iter()
                .filter(|e| e.is_heavy())
                .count() as i32;
            info.init_ref_count(heavy_in_degree);
            let _ = info.try_transition(PipState::Ignored, PipState::Waiting);
            state_counters.enter(pip_type, PipState::Waiting);

            if self.held_back[pip.index()] {
                held_back.push(pip);
                continue;
            }
            outstanding += 1;
            if heavy_in_degree == 0 {
                ready.push(pip);
            }
        }

        InitialSchedule {
            ready,
            held_back,
            outstanding,
        }
    }

    /// Propagates the terminal state of `pip` to its dependents.
    ///
    /// Each heavy edge decrements its dependent exactly once; failure and
    /// skip mark the dependent for skipping; the uncacheable-impact flag
    /// flows forward. Dependents whose refcount reaches zero are returned
    /// for scheduling, unless they are held back for the service manager.
    pub fn on_pip_completed(&self, pip: PipId) -> Vec<NewlyRunnable> {
        let info = self.infos.get(pip);
        debug_assert!(info.is_terminal(), "completion of a non-terminal pip");

        let failed_like = matches!(
            info.state(),
            PipState::Failed | PipState::Skipped | PipState::Canceled
        );
        let impacts_dependents =
            info.is_uncacheable_impacted() || self.graph.hydrate_pip(pip).is_uncacheable();

        let mut newly_runnable = Vec::new();
        for edge in self.graph.outgoing_edges(pip.node()) {
            if !edge.is_heavy() || !self.scheduled[edge.target.index()] {
                continue;
            }
            let dependent = edge.target.pip();
            let dependent_info = self.infos.get(dependent);

            if failed_like {
                dependent_info.request_skip();
            }
            if impacts_dependents {
                dependent_info.set_uncacheable_impacted();
            }
            if dependent_info.decrement_ref_count() == 0 && !self.held_back[dependent.index()] {
                newly_runnable.push(NewlyRunnable {
                    pip: dependent,
                    skip: dependent_info.is_skip_requested(),
                });
            }
        }
        newly_runnable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildflow_api::{InMemoryHistoricPerf, PipHistoricPerf, PipResultStatus};
    use buildflow_graph::{EdgeKind, GraphBuilder, Pip, PipSpec, ProcessPip, ServicePipKind};

    fn process(out: &str) -> Pip {
        Pip {
            id: PipId::from_index(0),
            static_priority: 1,
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

    struct Fixture {
        driver: DagDriver,
        infos: Arc<RuntimeInfoTable>,
        schedule: InitialSchedule,
    }

    fn chain_fixture() -> (Fixture, [PipId; 3]) {
        let mut builder = GraphBuilder::new();
        let a = builder.add_pip(process("/out/a")).expect("a");
        let b = builder.add_pip(process("/out/b")).expect("b");
        let c = builder.add_pip(process("/out/c")).expect("c");
        builder.add_dependency(b, a, EdgeKind::Heavy).expect("b->a");
        builder.add_dependency(c, b, EdgeKind::Heavy).expect("c->b");
        let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));
        let infos = Arc::new(RuntimeInfoTable::new(graph.node_count()));
        let mut driver = DagDriver::new(Arc::clone(&graph), Arc::clone(&infos));
        let schedule = driver.initialize(
            &[c],
            &InMemoryHistoricPerf::new(),
            &PipStateCounters::new(),
        );
        (
            Fixture {
                driver,
                infos,
                schedule,
            },
            [a, b, c],
        )
    }

    #[test]
    fn filter_closure_schedules_transitive_dependencies() {
        let (fixture, [a, b, c]) = chain_fixture();
        assert!(fixture.driver.is_scheduled(a));
        assert!(fixture.driver.is_scheduled(b));
        assert!(fixture.driver.is_scheduled(c));
        assert_eq!(fixture.schedule.ready, vec![a]);
        assert_eq!(fixture.schedule.outstanding, 3);
    }

    #[test]
    fn empty_filter_schedules_nothing() {
        let mut builder = GraphBuilder::new();
        let _ = builder.add_pip(process("/out/a")).expect("a");
        let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));
        let infos = Arc::new(RuntimeInfoTable::new(graph.node_count()));
        let mut driver = DagDriver::new(Arc::clone(&graph), infos);
        let schedule = driver.initialize(
            &[],
            &InMemoryHistoricPerf::new(),
            &PipStateCounters::new(),
        );
        assert!(schedule.ready.is_empty());
        assert_eq!(schedule.outstanding, 0);
    }

    #[test]
    fn priorities_descend_along_the_chain() {
        let (fixture, [a, b, c]) = chain_fixture();
        // Sinks-first pass: A's chain subsumes B's and C's.
        let cp = |pip| fixture.infos.get(pip).critical_path_ms();
        assert!(cp(a) > cp(b));
        assert!(cp(b) > cp(c));
        let prio = |pip| fixture.infos.get(pip).priority();
        assert!(prio(a) > prio(b));
        assert_eq!(prio(a) >> CRITICAL_PATH_PRIORITY_BITS, 1);
    }

    #[test]
    fn historic_estimates_override_defaults() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_pip(process("/out/a")).expect("a");
        let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));
        let infos = Arc::new(RuntimeInfoTable::new(graph.node_count()));
        let historic = InMemoryHistoricPerf::new();
        historic.record(
            a,
            PipHistoricPerf {
                duration_ms: 5000,
                memory: Default::default(),
            },
        );
        let mut driver = DagDriver::new(Arc::clone(&graph), Arc::clone(&infos));
        let _ = driver.initialize(&[a], &historic, &PipStateCounters::new());
        assert_eq!(infos.get(a).critical_path_ms(), 5000);
        assert!(infos.get(a).had_historic_estimate());
    }

    #[test]
    fn completion_decrements_and_schedules_dependents() {
        let (fixture, [a, b, _c]) = chain_fixture();
        assert_eq!(fixture.infos.get(b).ref_count(), 1);

        assert!(fixture
            .infos
            .get(a)
            .transition_to_terminal(PipState::Done, PipResultStatus::Executed));
        let runnable = fixture.driver.on_pip_completed(a);
        assert_eq!(
            runnable,
            vec![NewlyRunnable {
                pip: b,
                skip: false
            }]
        );
        assert_eq!(fixture.infos.get(b).ref_count(), 0);
    }

    #[test]
    fn failure_marks_dependents_for_skip() {
        let (fixture, [a, b, _c]) = chain_fixture();
        assert!(fixture
            .infos
            .get(a)
            .transition_to_terminal(PipState::Failed, PipResultStatus::Failed));
        let runnable = fixture.driver.on_pip_completed(a);
        assert_eq!(runnable, vec![NewlyRunnable { pip: b, skip: true }]);
    }

    #[test]
    fn light_edges_do_not_count_toward_refcounts() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_pip(process("/out/a")).expect("a");
        let b = builder.add_pip(process("/out/b")).expect("b");
        builder.add_dependency(b, a, EdgeKind::Light).expect("b->a");
        let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));
        let infos = Arc::new(RuntimeInfoTable::new(graph.node_count()));
        let mut driver = DagDriver::new(Arc::clone(&graph), Arc::clone(&infos));
        let schedule = driver.initialize(
            &[b],
            &InMemoryHistoricPerf::new(),
            &PipStateCounters::new(),
        );
        // Both are sources: the light edge orders but does not gate.
        assert_eq!(schedule.ready.len(), 2);
        assert_eq!(infos.get(b).ref_count(), 0);
    }

    #[test]
    fn service_closure_includes_shutdown_pips_and_holds_them_back() {
        let mut builder = GraphBuilder::new();
        let shutdown = builder
            .add_pip(Pip {
                spec: PipSpec::Process(ProcessPip {
                    executable: "/bin/svc-stop".into(),
                    arguments: Vec::new(),
                    input_files: Vec::new(),
                    output_files: Vec::new(),
                    shared_opaque_directories: Vec::new(),
                    service_kind: ServicePipKind::ServiceShutdown,
                    service_dependencies: Vec::new(),
                    is_uncacheable: false,
                }),
                ..process("/out/unused1")
            })
            .expect("shutdown");
        let service = builder
            .add_pip(Pip {
                spec: PipSpec::Process(ProcessPip {
                    executable: "/bin/svc".into(),
                    arguments: Vec::new(),
                    input_files: Vec::new(),
                    output_files: Vec::new(),
                    shared_opaque_directories: Vec::new(),
                    service_kind: ServicePipKind::Service {
                        shutdown_pip: Some(shutdown),
                    },
                    service_dependencies: Vec::new(),
                    is_uncacheable: false,
                }),
                ..process("/out/unused2")
            })
            .expect("service");
        let client = builder
            .add_pip(Pip {
                spec: PipSpec::Process(ProcessPip {
                    executable: "/bin/client".into(),
                    arguments: Vec::new(),
                    input_files: Vec::new(),
                    output_files: vec!["/out/client".into()],
                    shared_opaque_directories: Vec::new(),
                    service_kind: ServicePipKind::None,
                    service_dependencies: vec![service],
                    is_uncacheable: false,
                }),
                ..process("/out/unused3")
            })
            .expect("client");

        let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));
        let infos = Arc::new(RuntimeInfoTable::new(graph.node_count()));
        let mut driver = DagDriver::new(Arc::clone(&graph), Arc::clone(&infos));
        let schedule = driver.initialize(
            &[client],
            &InMemoryHistoricPerf::new(),
            &PipStateCounters::new(),
        );

        assert!(driver.is_scheduled(service));
        assert!(driver.is_scheduled(shutdown));
        assert!(driver.is_held_back(service));
        assert!(driver.is_held_back(shutdown));
        assert_eq!(schedule.ready, vec![client]);
        assert_eq!(schedule.outstanding, 1);
        assert_eq!(schedule.held_back.len(), 2);

        // Service clients are lifted above any plain process priority.
        assert!(
            infos.get(client).priority() >> CRITICAL_PATH_PRIORITY_BITS
                == SERVICE_CLIENT_STATIC_PRIORITY
        );
    }

    #[test]
    fn uncacheable_impact_propagates() {
        let mut builder = GraphBuilder::new();
        let mut uncacheable = process("/out/a");
        if let PipSpec::Process(ref mut p) = uncacheable.spec {
            p.is_uncacheable = true;
        }
        let a = builder.add_pip(uncacheable).expect("a");
        let b = builder.add_pip(process("/out/b")).expect("b");
        builder.add_dependency(b, a, EdgeKind::Heavy).expect("b->a");
        let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));
        let infos = Arc::new(RuntimeInfoTable::new(graph.node_count()));
        let mut driver = DagDriver::new(Arc::clone(&graph), Arc::clone(&infos));
        let _ = driver.initialize(
            &[b],
            &InMemoryHistoricPerf::new(),
            &PipStateCounters::new(),
        );

        assert!(infos
            .get(a)
            .transition_to_terminal(PipState::Done, PipResultStatus::Executed));
        let _ = driver.on_pip_completed(a);
        assert!(infos.get(b).is_uncacheable_impacted());
    }
}
