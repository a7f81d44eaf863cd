// SPDX-License-Identifier: Apache-2.0

//! Errors for the scheduler engine.

use miette::Diagnostic;

/// Errors that can occur constructing or operating the scheduler.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A wrapper for configuration errors.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] buildflow_config::Error),

    /// A wrapper for graph errors.
    #[error("Graph error: {0}")]
    GraphError(#[from] buildflow_graph::Error),

    /// A wrapper for worker pool errors.
    #[error("Worker error: {0}")]
    WorkerError(#[from] buildflow_workers::Error),

    /// A collaborator failed during initialization or teardown.
    #[error("Collaborator failure: {0}")]
    CollaboratorFailure(#[from] buildflow_api::CollaboratorError),

    /// Fewer workers attached than the build requires.
    #[error(
        "Only {attached} worker(s) attached within {timeout_secs}s; the build requires {required}"
    )]
    MinimumWorkersNotSatisfied {
        /// Workers that attached in time, local included.
        attached: u32,
        /// Workers the configuration requires.
        required: u32,
        /// The attach timeout that elapsed.
        timeout_secs: u64,
    },

    /// A lifecycle method was called out of order.
    #[error("Scheduler lifecycle error: {message}")]
    LifecycleError {
        /// What was violated.
        message: String,
    },

    /// Failed to spawn an OS thread.
    #[error("Failed to spawn thread '{thread_name}': {source}")]
    ThreadSpawnError {
        /// Name of the thread we attempted to spawn.
        thread_name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A scheduler thread panicked.
    #[error("Thread '{thread_name}' panicked: {panic_message}")]
    ThreadJoinPanic {
        /// The thread name that panicked.
        thread_name: String,
        /// Panic message.
        panic_message: String,
    },
}
