// SPDX-License-Identifier: Apache-2.0

//! Inter-process call provider contract.

use crate::error::CollaboratorError;
use std::sync::Arc;

/// A client connection to one IPC moniker.
#[async_trait::async_trait]
pub trait IpcClient: Send + Sync {
    /// Performs one call, returning the serialized response.
    async fn call(&self, payload: &str) -> Result<String, CollaboratorError>;
}

/// Provider of IPC client connections, keyed by moniker.
pub trait IpcProvider: Send + Sync {
    /// Returns a client for `moniker`, establishing the connection lazily.
    fn get_client(&self, moniker: &str) -> Result<Arc<dyn IpcClient>, CollaboratorError>;

    /// Tears down all connections. Called once at the end of the build.
    fn stop(&self);
}
