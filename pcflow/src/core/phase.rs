//! Pipeline phases and the top-level instance status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named phase of the per-party pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Private id matching (a stage graph).
    IdMatch,
    /// Joins matched ids back onto the party's data.
    Prepare,
    /// The secure joint computation.
    Compute,
    /// Aggregates the per-shard results.
    Aggregate,
    /// Publishes and cleans up results.
    PostProcess,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 5] = [
        Self::IdMatch,
        Self::Prepare,
        Self::Compute,
        Self::Aggregate,
        Self::PostProcess,
    ];

    /// Status set while the phase is in flight.
    #[must_use]
    pub fn started_status(&self) -> InstanceStatus {
        match self {
            Self::IdMatch => InstanceStatus::IdMatchStarted,
            Self::Prepare => InstanceStatus::PrepareStarted,
            Self::Compute => InstanceStatus::ComputeStarted,
            Self::Aggregate => InstanceStatus::AggregateStarted,
            Self::PostProcess => InstanceStatus::PostProcessStarted,
        }
    }

    /// Status set once the phase succeeded.
    #[must_use]
    pub fn completed_status(&self) -> InstanceStatus {
        match self {
            Self::IdMatch => InstanceStatus::IdMatchCompleted,
            Self::Prepare => InstanceStatus::PrepareCompleted,
            Self::Compute => InstanceStatus::ComputeCompleted,
            Self::Aggregate => InstanceStatus::AggregateCompleted,
            Self::PostProcess => InstanceStatus::PostProcessCompleted,
        }
    }

    /// Status set once the phase failed.
    #[must_use]
    pub fn failed_status(&self) -> InstanceStatus {
        match self {
            Self::IdMatch => InstanceStatus::IdMatchFailed,
            Self::Prepare => InstanceStatus::PrepareFailed,
            Self::Compute => InstanceStatus::ComputeFailed,
            Self::Aggregate => InstanceStatus::AggregateFailed,
            Self::PostProcess => InstanceStatus::PostProcessFailed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdMatch => write!(f, "id_match"),
            Self::Prepare => write!(f, "prepare"),
            Self::Compute => write!(f, "compute"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::PostProcess => write!(f, "post_process"),
        }
    }
}

/// Top-level status of a computation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum InstanceStatus {
    /// Freshly created; no phase has run.
    #[default]
    Created,
    IdMatchStarted,
    IdMatchCompleted,
    IdMatchFailed,
    PrepareStarted,
    PrepareCompleted,
    PrepareFailed,
    ComputeStarted,
    ComputeCompleted,
    ComputeFailed,
    AggregateStarted,
    AggregateCompleted,
    AggregateFailed,
    PostProcessStarted,
    PostProcessCompleted,
    PostProcessFailed,
}

impl InstanceStatus {
    /// The phase this status belongs to, if any.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        Phase::ALL.into_iter().find(|phase| {
            *self == phase.started_status()
                || *self == phase.completed_status()
                || *self == phase.failed_status()
        })
    }

    /// Returns true for any `*_started` status.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.phase().is_some_and(|phase| *self == phase.started_status())
    }

    /// Returns true for any `*_failed` status.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.phase().is_some_and(|phase| *self == phase.failed_status())
    }

    /// Returns true for any `*_completed` status.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phase().is_some_and(|phase| *self == phase.completed_status())
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.phase()) {
            (Self::Created, _) | (_, None) => write!(f, "created"),
            (status, Some(phase)) if *status == phase.started_status() => {
                write!(f, "{phase}_started")
            }
            (status, Some(phase)) if *status == phase.completed_status() => {
                write!(f, "{phase}_completed")
            }
            (_, Some(phase)) => write!(f, "{phase}_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_phase() {
        for phase in Phase::ALL {
            assert_eq!(phase.started_status().phase(), Some(phase));
            assert_eq!(phase.completed_status().phase(), Some(phase));
            assert_eq!(phase.failed_status().phase(), Some(phase));
        }
        assert_eq!(InstanceStatus::Created.phase(), None);
    }

    #[test]
    fn test_status_predicates() {
        assert!(InstanceStatus::ComputeStarted.is_started());
        assert!(!InstanceStatus::ComputeStarted.is_failed());
        assert!(InstanceStatus::PrepareFailed.is_failed());
        assert!(InstanceStatus::IdMatchCompleted.is_completed());
        assert!(!InstanceStatus::Created.is_started());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(InstanceStatus::Created.to_string(), "created");
        assert_eq!(InstanceStatus::IdMatchStarted.to_string(), "id_match_started");
        assert_eq!(InstanceStatus::PostProcessFailed.to_string(), "post_process_failed");
    }

    #[test]
    fn test_status_serialize_matches_display() {
        let json = serde_json::to_string(&InstanceStatus::AggregateCompleted).unwrap();
        assert_eq!(json, r#""aggregate_completed""#);
    }
}
