//! Read-only snapshot of a remote container.

use super::ContainerStatus;
use serde::{Deserialize, Serialize};

/// A container as last observed from the backend.
///
/// The backend is authoritative; these snapshots are refreshed by polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstance {
    /// Backend-assigned id.
    pub id: String,
    /// Private network address, once assigned.
    pub ip_address: Option<String>,
    /// Last observed status.
    pub status: ContainerStatus,
}

impl ContainerInstance {
    /// Creates a snapshot with no address.
    #[must_use]
    pub fn new(id: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            id: id.into(),
            ip_address: None,
            status,
        }
    }

    /// Sets the network address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}
