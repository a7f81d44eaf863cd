// SPDX-License-Identifier: Apache-2.0

//! Service pip management.
//!
//! A process pip may declare service dependencies. Before such a client
//! reaches CPU worker selection, the manager starts the corresponding
//! service (once) and blocks the client until the service reports ready. A
//! service that exits before its ready signal fails its clients. Shutdown
//! companions run at drain time, each accounted as a completed process pip.

use crate::context::SchedulerCore;
use buildflow_api::{
    MemoryCounters, PipResultStatus, PipState, ProcessExecutionScope, ProcessRunner,
    ServiceReadiness,
};
use buildflow_graph::{PipGraph, PipId};
use buildflow_telemetry::SchedulerCounter;
use buildflow_workers::LOCAL_WORKER_ID;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct ServiceEntry {
    readiness: watch::Receiver<ServiceReadiness>,
    stop: CancellationToken,
    shutdown_pip: Option<PipId>,
}

/// Starts services on demand and shuts them down at drain.
pub(crate) struct ServicePipManager {
    entries: tokio::sync::Mutex<HashMap<PipId, ServiceEntry>>,
}

impl ServicePipManager {
    pub(crate) fn new() -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Ensures every service in `services` is running and ready.
    ///
    /// Returns the failing service when one exits before its ready signal.
    pub(crate) async fn ensure_ready(
        &self,
        graph: &dyn PipGraph,
        runner: &dyn ProcessRunner,
        services: &[PipId],
    ) -> Result<(), PipId> {
        for service in services {
            let readiness = self.start_if_needed(graph, runner, *service).await?;
            wait_until_ready(readiness, *service).await?;
        }
        Ok(())
    }

    async fn start_if_needed(
        &self,
        graph: &dyn PipGraph,
        runner: &dyn ProcessRunner,
        service: PipId,
    ) -> Result<watch::Receiver<ServiceReadiness>, PipId> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&service) {
            return Ok(entry.readiness.clone());
        }

        let payload = graph.hydrate_pip(service);
        let shutdown_pip = payload.as_process().and_then(|p| match p.service_kind {
            buildflow_graph::ServicePipKind::Service { shutdown_pip } => shutdown_pip,
            _ => None,
        });

        tracing::info!(name: "service.starting", pip = %service);
        let handle = runner.start_service(&payload).await.map_err(|error| {
            tracing::error!(name: "service.start_failed", pip = %service, error = %error);
            service
        })?;
        let readiness = handle.readiness.clone();
        let _ = entries.insert(
            service,
            ServiceEntry {
                readiness: handle.readiness,
                stop: handle.stop,
                shutdown_pip,
            },
        );
        Ok(readiness)
    }

    /// Stops every started service and runs its shutdown pip.
    pub(crate) async fn shutdown_all(&self, core: &SchedulerCore) {
        let entries: Vec<(PipId, ServiceEntry)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };

        for (service, entry) in entries {
            entry.stop.cancel();
            let mut readiness = entry.readiness;
            while !matches!(*readiness.borrow(), ServiceReadiness::Exited { .. }) {
                if readiness.changed().await.is_err() {
                    break;
                }
            }
            tracing::info!(name: "service.stopped", pip = %service);
            complete_service_pip(core, service, PipResultStatus::Executed);
            core.counters
                .increment(SchedulerCounter::ServicePipsCompleted);

            if let Some(shutdown) = entry.shutdown_pip {
                run_shutdown_pip(core, shutdown).await;
            }
        }
    }
}

/// Runs one shutdown pip through the process runner, accounting it as a
/// regular process pip's worth of completion.
async fn run_shutdown_pip(core: &SchedulerCore, shutdown: PipId) {
    let payload = core.graph.hydrate_pip(shutdown);
    let scope = Arc::new(ProcessExecutionScope::new(
        shutdown,
        LOCAL_WORKER_ID,
        MemoryCounters::default(),
        0,
    ));
    match core.collaborators.runner.execute_process(&payload, scope).await {
        Ok(result) if result.status.is_success() => {
            complete_service_pip(core, shutdown, PipResultStatus::Executed);
        }
        Ok(_) | Err(_) => {
            tracing::error!(name: "service.shutdown_failed", pip = %shutdown);
            complete_service_pip(core, shutdown, PipResultStatus::Failed);
        }
    }
    core.counters
        .increment(SchedulerCounter::ServiceShutdownPipsCompleted);
}

fn complete_service_pip(core: &SchedulerCore, pip: PipId, result: PipResultStatus) {
    let info = core.infos.get(pip);
    let from = info.state();
    let to = match result {
        PipResultStatus::Failed => PipState::Failed,
        _ => PipState::Done,
    };
    if info.transition_to_terminal(to, result) {
        core.state_counters
            .transition(core.graph.pip_type(pip), from, to);
    }
}

async fn wait_until_ready(
    mut readiness: watch::Receiver<ServiceReadiness>,
    service: PipId,
) -> Result<(), PipId> {
    loop {
        let current = *readiness.borrow();
        match current {
            ServiceReadiness::Ready => return Ok(()),
            ServiceReadiness::Exited { .. } => {
                tracing::error!(name: "service.exited_before_ready", pip = %service);
                return Err(service);
            }
            ServiceReadiness::Starting => {
                if readiness.changed().await.is_err() {
                    return Err(service);
                }
            }
        }
    }
}
