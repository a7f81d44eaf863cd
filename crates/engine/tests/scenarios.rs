// SPDX-License-Identifier: Apache-2.0

//! End-to-end scheduler scenarios over the scripted in-memory collaborators.

use buildflow_engine::testing::{
    process_chain, process_pip, ScriptedExecution, TestHarness, TestTransport,
};
use buildflow_engine::{Collaborators, Scheduler};
use buildflow_api::{RetryReason, SimpleFileChangeTracker};
use buildflow_config::SchedulerConfig;
use buildflow_graph::{
    EdgeKind, GraphBuilder, Pip, PipGraph, PipId, PipSpec, ProcessPip, PipType, ServicePipKind,
};
use buildflow_telemetry::SchedulerPerformanceInfo;
use std::sync::Arc;
use std::time::Duration;

fn counter(info: &SchedulerPerformanceInfo, name: &str) -> u64 {
    info.counters
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| *v)
        .unwrap_or_else(|| panic!("counter {name} missing"))
}

fn run_build(
    graph: Arc<dyn PipGraph>,
    filter: &[PipId],
    config: SchedulerConfig,
    collaborators: Collaborators,
    transports: Vec<Arc<TestTransport>>,
) -> (bool, SchedulerPerformanceInfo) {
    let mut scheduler = Scheduler::new(graph, config, collaborators).expect("construct");
    if !transports.is_empty() {
        scheduler
            .enable_distribution(
                transports
                    .into_iter()
                    .map(|t| t as Arc<dyn buildflow_api::WorkerTransport>)
                    .collect(),
            )
            .expect("enable distribution");
    }
    scheduler.init_for_master(filter).expect("init");
    scheduler.start().expect("start");
    let success = scheduler.when_done();
    let stats = scheduler.log_stats();
    scheduler.dispose();
    (success, stats)
}

/// Linear chain, all cache miss: every pip executes, in dependency order.
#[test]
fn linear_chain_all_cache_miss() {
    let (graph, ids) = process_chain(3);
    let harness = TestHarness::new();
    for id in &ids {
        harness.runner.script(*id, ScriptedExecution::Succeed { duration_ms: 1 });
    }

    let (success, stats) = run_build(
        graph,
        &[ids[2]],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    assert_eq!(counter(&stats, "ProcessPipsExecutedDueToCacheMiss"), 3);
    assert_eq!(counter(&stats, "ProcessPipCacheMisses"), 3);
    assert_eq!(counter(&stats, "ProcessPipCacheHits"), 0);
    // Execution respects the heavy-edge order, one run per pip.
    assert_eq!(harness.runner.execution_order(), ids);
    // The critical path is the sum of the three execution times.
    assert_eq!(stats.critical_path_ms, 3);
    assert_eq!(stats.critical_path_tail, Some(ids[2].index() as u32));
}

/// Cache hit at the root: the hit pip replays, its dependent executes.
#[test]
fn cache_hit_at_root() {
    let (graph, ids) = process_chain(2);
    let harness = TestHarness::new();
    harness.cache.seed_hit(ids[0], "/out/p0");

    let (success, stats) = run_build(
        graph,
        &[ids[1]],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    assert_eq!(counter(&stats, "ProcessPipCacheHits"), 1);
    assert_eq!(counter(&stats, "ProcessPipCacheMisses"), 1);
    assert_eq!(counter(&stats, "PipsRunFromCache"), 1);
    assert_eq!(harness.runner.execution_count(ids[0]), 0);
    assert_eq!(harness.runner.execution_count(ids[1]), 1);
    // Only the executed pip publishes.
    assert_eq!(harness.cache.published(), vec![ids[1]]);
}

/// Stop-on-first-error: the failing pip's dependents are skipped, never run.
#[test]
fn stop_on_first_error_skips_dependents() {
    let mut builder = GraphBuilder::new();
    let a = builder.add_pip(process_pip("/out/a")).expect("a");
    let b = builder.add_pip(process_pip("/out/b")).expect("b");
    let c = builder.add_pip(process_pip("/out/c")).expect("c");
    builder.add_dependency(b, a, EdgeKind::Heavy).expect("b->a");
    builder.add_dependency(c, a, EdgeKind::Heavy).expect("c->a");
    let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));

    let harness = TestHarness::new();
    harness.runner.script(a, ScriptedExecution::Fail { exit_code: 3 });

    let mut config = SchedulerConfig::default();
    config.features.stop_on_first_error = true;

    let (success, stats) = run_build(graph, &[b, c], config, harness.collaborators(), Vec::new());

    assert!(!success);
    assert_eq!(harness.runner.execution_count(b), 0);
    assert_eq!(harness.runner.execution_count(c), 0);
    assert_eq!(counter(&stats, "PipsSkippedDueToFailedDependencies"), 2);
}

/// RAM cancel and retry: the canceled attempt retries with inflated memory
/// and succeeds.
#[test]
fn ram_cancel_retries_and_succeeds() {
    let (graph, ids) = process_chain(1);
    let pip = ids[0];
    let harness = TestHarness::new();
    harness
        .runner
        .script(pip, ScriptedExecution::CancelForResources { observed_mb: 800 });
    harness.runner.script(pip, ScriptedExecution::Succeed { duration_ms: 1 });

    let (success, stats) = run_build(
        graph,
        &[pip],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    assert_eq!(counter(&stats, "RetriedDueToLowMemory"), 1);
    assert_eq!(harness.runner.execution_count(pip), 2);
}

/// Retry budget exhaustion degrades to a plain failure.
#[test]
fn low_memory_retry_cap_fails_the_pip() {
    let (graph, ids) = process_chain(1);
    let pip = ids[0];
    let harness = TestHarness::new();
    for _ in 0..4 {
        harness
            .runner
            .script(pip, ScriptedExecution::CancelForResources { observed_mb: 800 });
    }

    let mut config = SchedulerConfig::default();
    config.retries.max_retries_due_to_low_memory = 2;

    let (success, stats) = run_build(graph, &[pip], config, harness.collaborators(), Vec::new());

    assert!(!success);
    assert_eq!(counter(&stats, "RetriedDueToLowMemory"), 2);
    // Initial attempt plus two retries.
    assert_eq!(harness.runner.execution_count(pip), 3);
}

/// Service dependency: the service starts before its client executes and
/// the shutdown pip runs at drain.
#[test]
fn service_starts_before_client_and_shuts_down() {
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
            ..process_pip("/out/s1")
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
            ..process_pip("/out/s2")
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
            ..process_pip("/out/s3")
        })
        .expect("client");
    let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));

    let harness = TestHarness::new();
    let (success, stats) = run_build(
        graph,
        &[client],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    assert_eq!(counter(&stats, "ServicePipsCompleted"), 1);
    assert_eq!(counter(&stats, "ServiceShutdownPipsCompleted"), 1);
    assert_eq!(harness.runner.execution_count(client), 1);
    assert_eq!(harness.runner.execution_count(shutdown), 1);
}

/// A service that dies before reporting ready fails its clients.
#[test]
fn service_dying_before_ready_fails_clients() {
    let mut builder = GraphBuilder::new();
    let service = builder
        .add_pip(Pip {
            spec: PipSpec::Process(ProcessPip {
                executable: "/bin/svc".into(),
                arguments: Vec::new(),
                input_files: Vec::new(),
                output_files: Vec::new(),
                shared_opaque_directories: Vec::new(),
                service_kind: ServicePipKind::Service { shutdown_pip: None },
                service_dependencies: Vec::new(),
                is_uncacheable: false,
            }),
            ..process_pip("/out/s1")
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
            ..process_pip("/out/s2")
        })
        .expect("client");
    let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));

    let harness = TestHarness::new();
    harness.runner.fail_service_before_ready(service);

    let (success, _stats) = run_build(
        graph,
        &[client],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(!success);
    assert_eq!(harness.runner.execution_count(client), 0);
}

/// Two-worker distribution: both workers count as ever available and the
/// remote detaches gracefully by the end of the build.
#[test]
fn two_worker_distribution_completes_and_releases() {
    let mut builder = GraphBuilder::new();
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(builder.add_pip(process_pip(&format!("/out/w{i}"))).expect("pip"));
    }
    let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));

    let harness = TestHarness::new();
    let transport = Arc::new(TestTransport::new(4));
    let mut config = SchedulerConfig::default();
    config.resources.status_interval = Duration::from_millis(20);

    let (success, stats) = run_build(
        graph,
        &ids,
        config,
        harness.collaborators(),
        vec![Arc::clone(&transport)],
    );

    assert!(success);
    assert_eq!(counter(&stats, "EverAvailableWorkerCount"), 2);
    assert!(transport.finish_count() >= 1);
}

/// A stopped-worker style retryable failure reassigns the pip.
#[test]
fn retryable_failure_reruns_the_pip() {
    let (graph, ids) = process_chain(1);
    let pip = ids[0];
    let harness = TestHarness::new();
    harness
        .runner
        .script(pip, ScriptedExecution::Retryable(RetryReason::StoppedWorker));
    harness.runner.script(pip, ScriptedExecution::Succeed { duration_ms: 1 });

    let (success, stats) = run_build(
        graph,
        &[pip],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    assert_eq!(counter(&stats, "RetriedDueToStoppedWorker"), 1);
    assert_eq!(harness.runner.execution_count(pip), 2);
}

/// An empty filter produces an empty scheduled set and immediate success.
#[test]
fn empty_filter_completes_immediately() {
    let (graph, ids) = process_chain(3);
    let harness = TestHarness::new();

    let (success, _stats) = run_build(
        graph,
        &[],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    for id in ids {
        assert_eq!(harness.runner.execution_count(id), 0);
    }
}

/// A graph of only meta pips completes without any worker execution.
#[test]
fn meta_only_graph_runs_no_processes() {
    let mut builder = GraphBuilder::new();
    let mut ids = Vec::new();
    for ty in [PipType::Value, PipType::SpecFile, PipType::Module] {
        ids.push(
            builder
                .add_pip(Pip {
                    spec: PipSpec::Meta(ty),
                    ..process_pip("/unused")
                })
                .expect("meta"),
        );
    }
    builder
        .add_dependency(ids[2], ids[1], EdgeKind::Heavy)
        .expect("edge");
    let graph: Arc<dyn PipGraph> = Arc::new(builder.build().expect("graph"));

    let harness = TestHarness::new();
    let (success, _stats) = run_build(
        graph,
        &ids.clone(),
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    for id in ids {
        assert_eq!(harness.runner.execution_count(id), 0);
    }
}

/// Cancellation before start results in a clean no-op shutdown.
#[test]
fn cancellation_before_start_is_a_noop() {
    let (graph, ids) = process_chain(2);
    let harness = TestHarness::new();
    let mut scheduler = Scheduler::new(
        graph,
        SchedulerConfig::default(),
        harness.collaborators(),
    )
    .expect("construct");
    scheduler.init_for_master(&[ids[1]]).expect("init");
    scheduler.request_termination();
    assert!(scheduler.when_done());
    scheduler.dispose();
    assert_eq!(harness.runner.execution_count(ids[0]), 0);
}

/// Incremental state short-circuits clean, materialized pips to UpToDate.
#[test]
fn incremental_skip_marks_up_to_date() {
    let (graph, ids) = process_chain(2);
    let harness = TestHarness::new();
    harness.incremental.seed_clean_and_materialized(ids[0].node());

    let (success, stats) = run_build(
        graph,
        &[ids[1]],
        SchedulerConfig::default(),
        harness.collaborators(),
        Vec::new(),
    );

    assert!(success);
    assert_eq!(counter(&stats, "PipsUpToDate"), 1);
    assert_eq!(harness.runner.execution_count(ids[0]), 0);
    assert_eq!(harness.runner.execution_count(ids[1]), 1);
    // The executed pip was marked clean for the next build.
    assert!(harness.incremental.is_clean(ids[1].node()));
}

/// Cache-only mode skips process pips on miss instead of executing them.
#[test]
fn cache_only_mode_skips_misses() {
    let (graph, ids) = process_chain(2);
    let harness = TestHarness::new();
    harness.cache.seed_hit(ids[0], "/out/p0");

    let mut config = SchedulerConfig::default();
    config.features.cache_only_mode = true;

    let (success, stats) = run_build(graph, &[ids[1]], config, harness.collaborators(), Vec::new());

    // The root replays; the miss is skipped, leaving the build successful
    // but incomplete.
    assert!(success);
    assert_eq!(counter(&stats, "PipsRunFromCache"), 1);
    assert_eq!(counter(&stats, "PipsSkippedDueToFailedDependencies"), 1);
    assert_eq!(harness.runner.execution_count(ids[1]), 0);
}

/// Saving the tracker and incremental state round-trips byte-identically.
#[test]
fn save_tracker_round_trips() {
    let (graph, ids) = process_chain(1);
    let harness = TestHarness::new();
    let mut collaborators = harness.collaborators();
    collaborators.change_tracker = Some(Arc::new(SimpleFileChangeTracker::default()));

    let mut scheduler =
        Scheduler::new(graph, SchedulerConfig::default(), collaborators).expect("construct");
    scheduler.init_for_master(&[ids[0]]).expect("init");
    scheduler.start().expect("start");
    assert!(scheduler.when_done());

    let dir = tempfile::tempdir().expect("tempdir");
    scheduler.save_file_change_tracker(dir.path()).expect("save");
    scheduler.save_file_change_tracker(dir.path()).expect("save again");
    assert!(dir.path().join("file_change_tracker.json").exists());
    assert!(dir.path().join("incremental_state.json").exists());
    scheduler.dispose();
}

/// Dispose is idempotent.
#[test]
fn dispose_twice_is_a_noop() {
    let (graph, ids) = process_chain(1);
    let harness = TestHarness::new();
    let mut scheduler = Scheduler::new(
        graph,
        SchedulerConfig::default(),
        harness.collaborators(),
    )
    .expect("construct");
    scheduler.init_for_master(&[ids[0]]).expect("init");
    scheduler.start().expect("start");
    assert!(scheduler.when_done());
    scheduler.dispose();
    scheduler.dispose();
    assert_eq!(harness.cache.close_count(), 1);
}

/// Mid-build termination cancels the remainder without failing the build.
#[test]
fn termination_without_failures_reports_canceled_not_failed() {
    let (graph, ids) = process_chain(50);
    let harness = TestHarness::new();
    // Keep the root busy long enough for termination to land mid-build.
    harness
        .runner
        .script(ids[0], ScriptedExecution::Succeed { duration_ms: 200 });

    let mut scheduler = Scheduler::new(
        graph,
        SchedulerConfig::default(),
        harness.collaborators(),
    )
    .expect("construct");
    scheduler.init_for_master(&[ids[49]]).expect("init");
    scheduler.start().expect("start");
    scheduler.request_termination();
    let success = scheduler.when_done();
    let stats = scheduler.log_stats();
    scheduler.dispose();

    // Cancellation alone does not fail the build.
    assert!(success);
    let canceled = counter(&stats, "PipsCanceled");
    assert!(canceled > 0, "expected canceled pips, got {stats:?}");
}
