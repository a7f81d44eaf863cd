// SPDX-License-Identifier: Apache-2.0

//! File content manager and file-change tracker contracts.

use crate::error::CollaboratorError;
use crate::execution::{OutputContent, OutputOrigin, SourceHashes};
use buildflow_graph::{ArtifactPath, Pip, PipId};
use parking_lot::Mutex;
use std::path::Path;

/// Tracks and hashes file content on behalf of the scheduler.
#[async_trait::async_trait]
pub trait FileContentManager: Send + Sync {
    /// Hashes the declared source dependencies of `pip`.
    async fn try_hash_source_dependencies(
        &self,
        pip: &Pip,
    ) -> Result<SourceHashes, CollaboratorError>;

    /// Hashes the declared outputs of `pip` as found on disk.
    async fn try_hash_outputs(&self, pip: &Pip) -> Result<Vec<OutputContent>, CollaboratorError>;

    /// Reports content that now exists at `path`.
    async fn report_output(
        &self,
        path: &ArtifactPath,
        info: &OutputContent,
        origin: OutputOrigin,
    ) -> Result<(), CollaboratorError>;

    /// Copies `source` to `destination`, performing a copy-file pip.
    async fn place_copy(
        &self,
        source: &ArtifactPath,
        destination: &ArtifactPath,
    ) -> Result<(), CollaboratorError>;

    /// Writes `contents` at `destination`, performing a write-file pip.
    async fn place_write(
        &self,
        destination: &ArtifactPath,
        contents: &str,
    ) -> Result<(), CollaboratorError>;

    /// The visible contents of a sealed directory, as known to the manager.
    fn list_sealed_directory_contents(&self, dir: PipId) -> Vec<ArtifactPath>;

    /// Registers a statically known directory so later probes are cheap.
    fn register_static_directory(&self, dir: &ArtifactPath);
}

/// Persistent journal of file-system changes between builds.
///
/// The tracker itself is a collaborator; the core only ever asks it to save.
pub trait FileChangeTracker: Send + Sync {
    /// Persists the tracker state to `path`.
    fn save(&self, path: &Path) -> Result<(), CollaboratorError>;
}

/// A minimal file-change tracker holding an opaque token per build.
///
/// Suits builds without an OS-level change journal; saving and reloading
/// yields the same token (round-trip identity).
#[derive(Debug, Default)]
pub struct SimpleFileChangeTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct TrackerState {
    /// Monotonic token identifying the tracked checkpoint.
    token: u64,
    /// Paths registered for tracking this build.
    tracked_paths: Vec<String>,
}

impl SimpleFileChangeTracker {
    /// Loads a previously saved tracker, or starts a new one when `path`
    /// does not exist.
    pub fn load_or_start_new(path: &Path) -> Result<Self, CollaboratorError> {
        let state = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CollaboratorError::new("change_tracker.load", e.to_string())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrackerState::default(),
            Err(e) => return Err(CollaboratorError::new("change_tracker.load", e.to_string())),
        };
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Registers `path` for tracking.
    pub fn track(&self, path: &ArtifactPath) {
        let mut state = self.state.lock();
        state.tracked_paths.push(path.as_str().to_owned());
        state.token += 1;
    }

    /// The current checkpoint token.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.state.lock().token
    }
}

impl FileChangeTracker for SimpleFileChangeTracker {
    fn save(&self, path: &Path) -> Result<(), CollaboratorError> {
        let state = self.state.lock().clone();
        let bytes = serde_json::to_vec(&state)
            .map_err(|e| CollaboratorError::new("change_tracker.save", e.to_string()))?;
        std::fs::write(path, bytes)
            .map_err(|e| CollaboratorError::new("change_tracker.save", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tracker.json");

        let tracker = SimpleFileChangeTracker::default();
        tracker.track(&"/src/a.c".into());
        tracker.track(&"/src/b.c".into());
        tracker.save(&path).expect("save");

        let reloaded = SimpleFileChangeTracker::load_or_start_new(&path).expect("load");
        assert_eq!(reloaded.token(), tracker.token());

        // Saving the reloaded state writes identical bytes.
        let path2 = dir.path().join("tracker2.json");
        reloaded.save(&path2).expect("save again");
        assert_eq!(
            std::fs::read(&path).expect("read 1"),
            std::fs::read(&path2).expect("read 2"),
        );
    }

    #[test]
    fn missing_file_starts_a_new_tracker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker =
            SimpleFileChangeTracker::load_or_start_new(&dir.path().join("absent.json"))
                .expect("fresh");
        assert_eq!(tracker.token(), 0);
    }
}
