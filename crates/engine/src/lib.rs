// SPDX-License-Identifier: Apache-2.0

//! Execution core of the build scheduler.
//!
//! Drives an immutable DAG of build units ("pips") through a multi-step
//! execution pipeline: dependency-driven readiness, per-pip state machine,
//! priority dispatch queues drained by one dedicated thread, worker
//! selection over local and remote slot pools, a content-cache consultation
//! before any process runs, and memory-pressure management over in-flight
//! executions.
//!
//! The crate exposes [`Scheduler`] as the façade; everything external (the
//! cache, the sandbox, file management, incremental state, transports) is
//! consumed through the traits in `buildflow-api` and injected via
//! [`Collaborators`].

pub mod driver;
pub mod error;
pub mod runnable;
pub mod runtime_info;
pub mod scheduler;
pub mod steps;

mod context;
mod resource;
mod runner;
mod services;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use context::Collaborators;
pub use driver::{DagDriver, InitialSchedule, NewlyRunnable};
pub use error::Error;
pub use runnable::{PerPipPerformance, RetryBudgets, RunnablePip};
pub use runtime_info::{PipRuntimeInfo, RuntimeInfoTable, COMPLETED_REF_COUNT};
pub use scheduler::{Scheduler, TerminationHandle};
pub use steps::PipExecutionStep;
