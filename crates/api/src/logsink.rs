// SPDX-License-Identifier: Apache-2.0

//! Execution log events and the sink multiplexer.
//!
//! The execution log is a registered sink list, not a global: sinks are
//! added at scheduler construction and every event fans out to all of them.

use crate::execution::{ObservedAccess, OutputContent, PipResultStatus, ProcessPerformance};
use buildflow_graph::{ArtifactPath, PipId};
use parking_lot::RwLock;
use std::sync::Arc;

/// A periodic status frame, as recorded in the execution log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatusEvent {
    /// Milliseconds since the build started.
    pub elapsed_ms: u64,
    /// Pips currently running a step.
    pub running_pips: usize,
    /// Process pips currently executing.
    pub running_processes: usize,
    /// Items waiting in dispatch queues.
    pub queued: usize,
    /// Machine RAM usage percentage.
    pub ram_percent: u32,
    /// Machine commit usage percentage.
    pub commit_percent: u32,
    /// Ratio of actual to expected status-tick period.
    pub unresponsiveness_factor: f64,
}

/// Events recorded in the execution log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExecutionLogEvent {
    /// Per-pip execution performance, recorded at completion.
    PipExecutionPerformance {
        /// The completed pip.
        pip: PipId,
        /// How the pip concluded.
        result: PipResultStatus,
        /// Execution performance of the final attempt.
        performance: ProcessPerformance,
    },
    /// Contents produced under an output directory.
    DirectoryOutputs {
        /// The producing pip.
        pip: PipId,
        /// The directory.
        directory: ArtifactPath,
        /// Produced contents.
        contents: Vec<OutputContent>,
    },
    /// Inputs observed during sandboxed execution.
    ObservedInputs {
        /// The observing pip.
        pip: PipId,
        /// Observed accesses.
        observed: Vec<ObservedAccess>,
    },
    /// A periodic status frame.
    StatusReported(StatusEvent),
}

/// A sink receiving execution log events.
///
/// Sinks must not block; heavy sinks buffer internally and drain in `flush`.
pub trait ExecutionLogSink: Send + Sync {
    /// Receives one event.
    fn log(&self, event: &ExecutionLogEvent);

    /// Drains any buffered events. Called once at the end of the build.
    fn flush(&self) {}
}

/// Fans execution log events out to a registered sink list.
#[derive(Default)]
pub struct ExecutionLogMultiplexer {
    sinks: RwLock<Vec<Arc<dyn ExecutionLogSink>>>,
}

impl ExecutionLogMultiplexer {
    /// Creates a multiplexer with no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink; subsequent events fan out to it.
    pub fn register(&self, sink: Arc<dyn ExecutionLogSink>) {
        self.sinks.write().push(sink);
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Fans one event out to every registered sink.
    pub fn log_event(&self, event: ExecutionLogEvent) {
        ExecutionLogSink::log(self, &event);
    }

    /// Flushes every registered sink.
    pub fn flush_all(&self) {
        ExecutionLogSink::flush(self);
    }
}

impl ExecutionLogSink for ExecutionLogMultiplexer {
    fn log(&self, event: &ExecutionLogEvent) {
        for sink in self.sinks.read().iter() {
            sink.log(event);
        }
    }

    fn flush(&self) {
        for sink in self.sinks.read().iter() {
            sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl ExecutionLogSink for CountingSink {
        fn log(&self, _event: &ExecutionLogEvent) {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn multiplexer_fans_out_to_all_sinks() {
        let mux = ExecutionLogMultiplexer::new();
        let a = Arc::new(CountingSink(AtomicUsize::new(0)));
        let b = Arc::new(CountingSink(AtomicUsize::new(0)));
        mux.register(Arc::clone(&a) as Arc<dyn ExecutionLogSink>);
        mux.register(Arc::clone(&b) as Arc<dyn ExecutionLogSink>);

        mux.log(&ExecutionLogEvent::ObservedInputs {
            pip: PipId::from_index(0),
            observed: Vec::new(),
        });

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }
}
