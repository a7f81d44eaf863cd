// SPDX-License-Identifier: Apache-2.0

//! `bf_engine`: run a pip graph through the build scheduler on the local
//! machine.
//!
//! # Usage
//!
//! ```bash
//! # Run a graph with the default configuration
//! bf_engine --graph demos/hello.json
//!
//! # Run with a config file and fail fast
//! bf_engine --graph build.json --config scheduler.yaml --stop-on-first-error
//! ```

use anyhow::Context;
use buildflow_api::{
    ExecutionLogMultiplexer, ExecutionLogSink, HistoricalPerfInfo, InMemoryHistoricPerf,
    SimpleFileChangeTracker, SysinfoCollector,
};
use buildflow_config::SchedulerConfig;
use buildflow_engine::{Collaborators, Scheduler};
use buildflow_graph::PipGraph;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod graph_spec;
mod local;

use graph_spec::GraphSpec;
use local::{JsonlSink, LocalFileContentManager, LocalProcessRunner, NullCache};

#[derive(Parser)]
#[command(name = "bf_engine")]
#[command(version = "0.1.0")]
#[command(about = "Distributed cache-aware build scheduler")]
#[command(long_about = None)]
struct Cli {
    /// Path to the JSON graph specification.
    #[arg(long)]
    graph: PathBuf,

    /// Path to the scheduler configuration (JSON or YAML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cancel the build on the first pip failure.
    #[arg(long)]
    stop_on_first_error: bool,

    /// Directory for scheduler state (execution log, perf table, tracker).
    #[arg(long, default_value = ".buildflow")]
    state_dir: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("Build failed");
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("Error: {error:#}");
            std::process::exit(1);
        }
    }
}

/// Runs the build to completion; `Ok(true)` means every pip succeeded.
fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    if cli.stop_on_first_error {
        config.features.stop_on_first_error = true;
    }

    let graph_json = std::fs::read_to_string(&cli.graph)
        .with_context(|| format!("reading graph from {}", cli.graph.display()))?;
    let spec: GraphSpec = serde_json::from_str(&graph_json).context("parsing graph spec")?;
    let (graph, filter) = spec.build().context("building pip graph")?;
    let graph: Arc<dyn PipGraph> = Arc::new(graph);

    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("creating state dir {}", cli.state_dir.display()))?;
    let historic_path = cli.state_dir.join("historic_perf.json");
    let historic = Arc::new(
        InMemoryHistoricPerf::load_or_empty(&historic_path)
            .context("loading historic perf table")?,
    );
    let tracker = Arc::new(
        SimpleFileChangeTracker::load_or_start_new(
            &cli.state_dir.join("file_change_tracker.json"),
        )
        .context("loading file change tracker")?,
    );

    let execution_log = Arc::new(ExecutionLogMultiplexer::new());
    let sink = JsonlSink::create(cli.state_dir.join("execution_log.jsonl"))
        .context("creating execution log")?;
    execution_log.register(Arc::new(sink) as Arc<dyn ExecutionLogSink>);

    let collaborators = Collaborators {
        cache: Arc::new(NullCache),
        files: Arc::new(LocalFileContentManager),
        runner: Arc::new(LocalProcessRunner),
        incremental: None,
        change_tracker: Some(tracker),
        historic: Arc::clone(&historic) as Arc<dyn HistoricalPerfInfo>,
        execution_log,
        ipc: None,
        collector: Arc::new(SysinfoCollector::new()),
    };

    let mut scheduler =
        Scheduler::new(graph, config, collaborators).context("constructing scheduler")?;
    scheduler
        .init_for_master(&filter)
        .context("initializing scheduler")?;

    // CTRL-C requests graceful termination; a second CTRL-C kills us.
    if let Some(handle) = scheduler.termination_handle() {
        let _ = std::thread::Builder::new()
            .name("bf-signal".to_owned())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(_) => return,
                };
                rt.block_on(async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!(name: "signal.terminating", "");
                        handle.request_termination();
                    }
                });
            });
    }

    scheduler.start().context("starting scheduler")?;
    let success = scheduler.when_done();

    if let Err(error) = scheduler.save_file_change_tracker(&cli.state_dir) {
        tracing::warn!(name: "state.save_failed", error = %error);
    }
    if let Err(error) = historic.save(&historic_path) {
        tracing::warn!(name: "state.save_failed", error = %error);
    }

    let stats = scheduler.log_stats();
    scheduler.dispose();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(success)
}
