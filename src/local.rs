// SPDX-License-Identifier: Apache-2.0

//! Built-in local collaborators for the `bf_engine` binary.
//!
//! A pass-through set for single-machine builds: processes run directly via
//! `tokio::process`, files are hashed from disk, and the cache is a null
//! implementation that always misses.

use buildflow_api::{
    CacheHit, CollaboratorError, ContentCache, ContentHash, ExecutionLogEvent, ExecutionLogSink,
    ExecutionResult, ExecutionStatus, FileContentManager, OutputContent, OutputOrigin,
    ProcessExecutionScope, ProcessPerformance, ProcessRunner, PublishResult, ServiceHandle,
    ServiceReadiness, SourceHash, SourceHashes,
};
use buildflow_graph::{ArtifactPath, Pip, PipId, PipSpec};
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

fn content_hash(bytes: &[u8]) -> ContentHash {
    ContentHash::from_digest_prefix(blake3::hash(bytes).as_bytes())
}

async fn hash_file(path: &ArtifactPath) -> Result<(ContentHash, u64), CollaboratorError> {
    let bytes = tokio::fs::read(path.as_str())
        .await
        .map_err(|e| CollaboratorError::new("files.read", format!("{path}: {e}")))?;
    Ok((content_hash(&bytes), bytes.len() as u64))
}

/// A cache that always misses and never stores.
#[derive(Default)]
pub struct NullCache;

#[async_trait::async_trait]
impl ContentCache for NullCache {
    async fn lookup(
        &self,
        _pip: &Pip,
        _inputs: &SourceHashes,
    ) -> Result<Option<CacheHit>, CollaboratorError> {
        Ok(None)
    }

    async fn publish(
        &self,
        _pip: &Pip,
        _inputs: &SourceHashes,
        _outputs: &[OutputContent],
    ) -> Result<PublishResult, CollaboratorError> {
        Ok(PublishResult { stored: false })
    }

    async fn materialize(
        &self,
        _hash: ContentHash,
        _path: &ArtifactPath,
    ) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::new(
            "cache.materialize",
            "the null cache holds no content",
        ))
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Hashes declared inputs and outputs straight from the local disk.
#[derive(Default)]
pub struct LocalFileContentManager;

#[async_trait::async_trait]
impl FileContentManager for LocalFileContentManager {
    async fn try_hash_source_dependencies(
        &self,
        pip: &Pip,
    ) -> Result<SourceHashes, CollaboratorError> {
        let inputs = match &pip.spec {
            PipSpec::Process(p) => p.input_files.clone(),
            PipSpec::CopyFile { source, .. } => vec![source.clone()],
            _ => Vec::new(),
        };
        let mut hashes = Vec::with_capacity(inputs.len());
        for path in inputs {
            let (hash, size_bytes) = hash_file(&path).await?;
            hashes.push(SourceHash {
                path,
                hash,
                size_bytes,
            });
        }
        Ok(hashes)
    }

    async fn try_hash_outputs(&self, pip: &Pip) -> Result<Vec<OutputContent>, CollaboratorError> {
        let outputs = match &pip.spec {
            PipSpec::Process(p) => p.output_files.clone(),
            PipSpec::CopyFile { destination, .. } | PipSpec::WriteFile { destination, .. } => {
                vec![destination.clone()]
            }
            _ => Vec::new(),
        };
        let mut contents = Vec::with_capacity(outputs.len());
        for path in outputs {
            let (hash, size_bytes) = hash_file(&path).await?;
            contents.push(OutputContent {
                path,
                hash,
                size_bytes,
            });
        }
        Ok(contents)
    }

    async fn report_output(
        &self,
        _path: &ArtifactPath,
        _info: &OutputContent,
        _origin: OutputOrigin,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn place_copy(
        &self,
        source: &ArtifactPath,
        destination: &ArtifactPath,
    ) -> Result<(), CollaboratorError> {
        let _ = tokio::fs::copy(source.as_str(), destination.as_str())
            .await
            .map_err(|e| CollaboratorError::new("files.copy", e.to_string()))?;
        Ok(())
    }

    async fn place_write(
        &self,
        destination: &ArtifactPath,
        contents: &str,
    ) -> Result<(), CollaboratorError> {
        tokio::fs::write(destination.as_str(), contents)
            .await
            .map_err(|e| CollaboratorError::new("files.write", e.to_string()))
    }

    fn list_sealed_directory_contents(&self, _dir: PipId) -> Vec<ArtifactPath> {
        Vec::new()
    }

    fn register_static_directory(&self, _dir: &ArtifactPath) {}
}

/// Runs process pips directly on the local machine.
#[derive(Default)]
pub struct LocalProcessRunner;

#[async_trait::async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn execute_process(
        &self,
        pip: &Pip,
        scope: Arc<ProcessExecutionScope>,
    ) -> Result<ExecutionResult, CollaboratorError> {
        let Some(process) = pip.as_process() else {
            return Ok(ExecutionResult::empty_success());
        };

        let started = Instant::now();
        let mut child = tokio::process::Command::new(process.executable.as_str())
            .args(&process.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| CollaboratorError::new("runner.spawn", e.to_string()))?;

        let cancel = scope.cancel_token();
        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| CollaboratorError::new("runner.wait", e.to_string()))?
            }
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(ExecutionResult {
                    status: ExecutionStatus::Canceled {
                        reason: scope
                            .cancel_reason()
                            .unwrap_or(buildflow_api::CancelReason::BuildTermination),
                    },
                    performance: ProcessPerformance::default(),
                    observed_accesses: Vec::new(),
                    outputs: Vec::new(),
                    shared_opaque_outputs: Vec::new(),
                });
            }
        };

        let mut outputs = Vec::with_capacity(process.output_files.len());
        if status.success() {
            for path in &process.output_files {
                let (hash, size_bytes) = hash_file(path).await?;
                outputs.push(OutputContent {
                    path: path.clone(),
                    hash,
                    size_bytes,
                });
            }
        }

        Ok(ExecutionResult {
            status: if status.success() {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::Failed {
                    exit_code: status.code(),
                }
            },
            performance: ProcessPerformance {
                wall_clock: started.elapsed(),
                ..ProcessPerformance::default()
            },
            observed_accesses: Vec::new(),
            outputs,
            shared_opaque_outputs: Vec::new(),
        })
    }

    async fn start_service(&self, pip: &Pip) -> Result<ServiceHandle, CollaboratorError> {
        let Some(process) = pip.as_process() else {
            return Err(CollaboratorError::new(
                "runner.start_service",
                "service pips must be process pips",
            ));
        };
        let mut child = tokio::process::Command::new(process.executable.as_str())
            .args(&process.arguments)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| CollaboratorError::new("runner.spawn", e.to_string()))?;

        let (tx, rx) = tokio::sync::watch::channel(ServiceReadiness::Starting);
        let stop = tokio_util::sync::CancellationToken::new();
        let stop_for_task = stop.clone();

        // Local convention: a service is ready once its process is running.
        let _ = tx.send(ServiceReadiness::Ready);
        let _ = tokio::spawn(async move {
            let success = tokio::select! {
                status = child.wait() => status.map(|s| s.success()).unwrap_or(false),
                () = stop_for_task.cancelled() => {
                    let _ = child.kill().await;
                    true
                }
            };
            let _ = tx.send(ServiceReadiness::Exited { success });
        });

        Ok(ServiceHandle {
            readiness: rx,
            stop,
        })
    }
}

/// Execution-log sink writing one JSON object per line.
pub struct JsonlSink {
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    /// Creates or truncates the log file at `path`.
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            file: Mutex::new(std::fs::File::create(path)?),
        })
    }
}

impl ExecutionLogSink for JsonlSink {
    fn log(&self, event: &ExecutionLogEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut file = self.file.lock();
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}
