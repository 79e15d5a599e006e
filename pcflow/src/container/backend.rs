//! The remote container backend contract.

use crate::core::ContainerInstance;
use crate::errors::ContainerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A request to launch one container per entry of `cmd_args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Binary to run, e.g. `pid/private-id-server`.
    pub binary_name: String,
    /// Resolved binary version.
    pub version: String,
    /// One rendered command line per container.
    pub cmd_args: Vec<String>,
    /// Per-container execution ceiling.
    pub timeout: Duration,
    /// Environment variables for every container.
    pub env: HashMap<String, String>,
}

/// Backend that owns the actual containers.
///
/// Implementations must tolerate empty or partial id lists: `poll` may omit
/// ids it does not know, and `stop` reports a per-id optional error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Launches containers, returning them in `cmd_args` order.
    async fn start_containers(
        &self,
        request: &StartRequest,
    ) -> Result<Vec<ContainerInstance>, ContainerError>;

    /// Returns fresh snapshots for the given ids.
    async fn poll(&self, ids: &[String]) -> Result<Vec<ContainerInstance>, ContainerError>;

    /// Stops the given containers; one entry per id, `None` on success.
    async fn stop(&self, ids: &[String]) -> Vec<Option<ContainerError>>;
}
