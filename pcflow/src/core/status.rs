//! Stage kinds and the status enums derived from container state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage of the id-matching graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Splits the raw input into `num_shards` files.
    Shard,
    /// Normalises each shard for the PID protocol.
    Prepare,
    /// Runs the PID protocol against the other party, one container per shard.
    RunPid,
}

impl StageKind {
    /// All stage kinds in flow order.
    pub const ALL: [Self; 3] = [Self::Shard, Self::Prepare, Self::RunPid];

    /// Returns true when the stage talks to the other party's containers.
    #[must_use]
    pub fn is_joint_stage(&self) -> bool {
        matches!(self, Self::RunPid)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shard => write!(f, "shard"),
            Self::Prepare => write!(f, "prepare"),
            Self::RunPid => write!(f, "run_pid"),
        }
    }
}

/// Status of a single remote container, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Not yet observed.
    #[default]
    Unknown,
    /// Pending or running.
    Started,
    /// Exited successfully.
    Completed,
    /// Exited with an error, or was stopped.
    Failed,
}

impl ContainerStatus {
    /// Returns true if the status will not change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The execution status of a graph stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No containers observed yet.
    #[default]
    Unknown,
    /// Registered in the graph, waiting on predecessors or dispatch.
    Ready,
    /// Containers are in flight.
    Started,
    /// All containers completed.
    Completed,
    /// At least one container failed.
    Failed,
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Ready => write!(f, "ready"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Shard.to_string(), "shard");
        assert_eq!(StageKind::Prepare.to_string(), "prepare");
        assert_eq!(StageKind::RunPid.to_string(), "run_pid");
    }

    #[test]
    fn test_only_run_pid_is_joint() {
        assert!(StageKind::RunPid.is_joint_stage());
        assert!(!StageKind::Shard.is_joint_stage());
        assert!(!StageKind::Prepare.is_joint_stage());
    }

    #[test]
    fn test_container_status_is_terminal() {
        assert!(ContainerStatus::Completed.is_terminal());
        assert!(ContainerStatus::Failed.is_terminal());
        assert!(!ContainerStatus::Started.is_terminal());
        assert!(!ContainerStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Completed).unwrap();
        assert_eq!(json, r#""completed""#);

        let deserialized: StageStatus = serde_json::from_str(r#""ready""#).unwrap();
        assert_eq!(deserialized, StageStatus::Ready);
    }
}
