//! Error types for pcflow.
//!
//! Specific failures are modelled as their own error structs so callers can
//! match on them precisely; [`PcflowError`] wraps them all for propagation
//! through the dispatcher and orchestrator.

use crate::core::{InstanceStatus, Phase, Protocol, Role, StageKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for pcflow operations.
#[derive(Debug, Error)]
pub enum PcflowError {
    /// A container backend operation failed.
    #[error("{0}")]
    Container(#[from] ContainerError),

    /// No flow is defined for the requested role and protocol.
    #[error("{0}")]
    UnsupportedFlow(#[from] UnsupportedFlowError),

    /// A flow table contains a dependency cycle.
    #[error("{0}")]
    FlowCycle(#[from] FlowCycleError),

    /// A stage was run before its predecessors completed.
    #[error("{0}")]
    StageNotEligible(#[from] StageNotEligibleError),

    /// A stage was run while it was already in flight.
    #[error("{0}")]
    StageAlreadyRunning(#[from] StageAlreadyRunningError),

    /// A stage's containers failed.
    #[error("{0}")]
    StageFailure(#[from] StageFailureError),

    /// A phase transition was rejected.
    #[error("{0}")]
    InvalidState(#[from] InvalidStateError),

    /// A joint phase was started on the partner side without peer addresses.
    #[error("{0}")]
    MissingServerIps(#[from] MissingServerIpsError),

    /// Cancelling a phase left the instance in an unexpected status.
    #[error("{0}")]
    CancelInvariant(#[from] CancelInvariantError),

    /// The instance store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The address exchange failed.
    #[error("{0}")]
    Exchange(#[from] ExchangeError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PcflowError {
    /// Returns diagnostic metadata for this error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::Container(e) if e.is_throttling() => {
                ErrorInfo::new("PCF-CONTAINER-THROTTLED", self.to_string())
                    .with_fix_hint("The backend kept throttling after the retry; try again later.")
            }
            Self::Container(_) => ErrorInfo::new("PCF-CONTAINER", self.to_string()),
            Self::UnsupportedFlow(e) => ErrorInfo::new("PCF-FLOW-UNSUPPORTED", self.to_string())
                .with_context_entry("role", e.role.to_string())
                .with_context_entry("protocol", e.protocol.to_string()),
            Self::FlowCycle(_) => ErrorInfo::new("PCF-FLOW-CYCLE", self.to_string())
                .with_fix_hint("Remove one of the edges in the cycle from the flow table."),
            Self::StageNotEligible(e) => ErrorInfo::new("PCF-STAGE-NOT-ELIGIBLE", self.to_string())
                .with_context_entry("stage", e.stage.to_string()),
            Self::StageAlreadyRunning(e) => {
                ErrorInfo::new("PCF-STAGE-RUNNING", self.to_string())
                    .with_context_entry("stage", e.stage.to_string())
            }
            Self::StageFailure(e) => ErrorInfo::new("PCF-STAGE-FAILED", self.to_string())
                .with_context_entry("stage", e.stage.to_string())
                .with_fix_hint("Inspect the failed containers, then retry the phase explicitly."),
            Self::InvalidState(e) => ErrorInfo::new("PCF-INVALID-STATE", self.to_string())
                .with_context_entry("status", e.current.to_string())
                .with_context_entry("phase", e.target.to_string()),
            Self::MissingServerIps(_) => ErrorInfo::new("PCF-MISSING-SERVER-IPS", self.to_string())
                .with_fix_hint("Fetch the publisher addresses from the address exchange first."),
            Self::CancelInvariant(_) => ErrorInfo::new("PCF-CANCEL", self.to_string()),
            Self::Store(_) => ErrorInfo::new("PCF-STORE", self.to_string()),
            Self::Exchange(_) => ErrorInfo::new("PCF-EXCHANGE", self.to_string()),
            Self::Config(_) => ErrorInfo::new("PCF-CONFIG", self.to_string()),
            Self::Internal(_) => ErrorInfo::new("PCF-INTERNAL", self.to_string()),
        }
    }
}

/// Metadata about an error for operator-facing diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "PCF-STAGE-FAILED").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised by the container backend or supervisor.
#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    /// The backend rejected the request because of rate limiting.
    #[error("Container backend throttled the request: {message}")]
    Throttled {
        /// Backend message.
        message: String,
    },

    /// Any other backend failure.
    #[error("Container backend error: {message}")]
    Backend {
        /// Backend message.
        message: String,
    },

    /// A container id was unknown to the backend.
    #[error("Container not found: {id}")]
    NotFound {
        /// The container id.
        id: String,
    },

    /// No version is configured for a binary.
    #[error("No binary configuration for '{name}'")]
    UnknownBinary {
        /// The binary name.
        name: String,
    },

    /// Containers did not reach a terminal status in time.
    #[error("Timed out after {timeout_seconds}s waiting for containers: {}", ids.join(", "))]
    Timeout {
        /// Ids still not terminal.
        ids: Vec<String>,
        /// The timeout in seconds.
        timeout_seconds: u64,
    },
}

impl ContainerError {
    /// Creates a throttling error.
    #[must_use]
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            message: message.into(),
        }
    }

    /// Creates a generic backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns true for the transient throttling class.
    #[must_use]
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

/// Raised when no flow table entry exists for a role and protocol.
#[derive(Debug, Clone, Error)]
#[error("No stage flow defined for role '{role}' and protocol '{protocol}'")]
pub struct UnsupportedFlowError {
    /// The requested role.
    pub role: Role,
    /// The requested protocol.
    pub protocol: Protocol,
}

/// Raised when a flow table's edges form a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage flow among: {}", stages.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
pub struct FlowCycleError {
    /// Stages that could not be ordered.
    pub stages: Vec<StageKind>,
}

/// Raised when a stage still has unfinished predecessors or is not in the graph.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' is not eligible to run")]
pub struct StageNotEligibleError {
    /// The stage.
    pub stage: StageKind,
}

/// Raised when a stage is run while already started.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' is already running")]
pub struct StageAlreadyRunningError {
    /// The stage.
    pub stage: StageKind,
}

/// Raised when a stage's containers fail.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' of instance '{instance_id}' failed; failed containers: {}", failed_containers.join(", "))]
pub struct StageFailureError {
    /// The instance.
    pub instance_id: String,
    /// The stage.
    pub stage: StageKind,
    /// Ids of containers observed as failed.
    pub failed_containers: Vec<String>,
}

/// Raised when a phase transition is not allowed from the current status.
#[derive(Debug, Clone, Error)]
#[error("Cannot run phase '{target}' from status '{current}': {reason}")]
pub struct InvalidStateError {
    /// The current top-level status.
    pub current: InstanceStatus,
    /// The requested phase.
    pub target: Phase,
    /// Why it was rejected.
    pub reason: String,
}

/// Raised when a partner runs a joint phase without publisher addresses.
#[derive(Debug, Clone, Error)]
#[error("Joint phase '{phase}' on the partner side needs publisher server addresses")]
pub struct MissingServerIpsError {
    /// The joint phase.
    pub phase: Phase,
}

/// Raised when cancelling leaves the instance outside the expected statuses.
#[derive(Debug, Clone, Error)]
#[error("Cancelling phase '{phase}' left instance '{instance_id}' in '{actual}', expected '{expected}'")]
pub struct CancelInvariantError {
    /// The instance.
    pub instance_id: String,
    /// The phase being cancelled.
    pub phase: Phase,
    /// The status after cancellation.
    pub actual: InstanceStatus,
    /// The expected status.
    pub expected: InstanceStatus,
}

/// Errors raised by an instance store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No instance with this id.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// An instance with this id already exists.
    #[error("Instance already exists: {0}")]
    AlreadyExists(String),

    /// The stored document belongs to a different instance.
    #[error("Stored document for '{requested}' holds instance '{found}'")]
    IdMismatch {
        /// The id asked for.
        requested: String,
        /// The id in the document.
        found: String,
    },

    /// IO error.
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by an address exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The peer did not publish addresses in time.
    #[error("Timed out after {timeout_seconds}s waiting for addresses under '{key}'")]
    Timeout {
        /// The exchange key.
        key: String,
        /// The timeout in seconds.
        timeout_seconds: u64,
    },

    /// IO error.
    #[error("Exchange IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Exchange serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error.
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be parsed.
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it is invalid.
        reason: String,
    },
}
