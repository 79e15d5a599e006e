//! Lifecycle events for phases and stages.
//!
//! The dispatcher and orchestrator report what they do through an
//! [`EventSink`]. Emission is fire-and-forget: a sink must never fail the run
//! that emitted the event.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::{Phase, StageKind};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A graph stage launched its containers.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A graph stage's containers all completed.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A graph stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A phase passed validation and is running.
    #[serde(rename = "phase.started")]
    PhaseStarted,
    /// A phase finished and its status was re-derived.
    #[serde(rename = "phase.completed")]
    PhaseCompleted,
    /// A phase failed.
    #[serde(rename = "phase.failed")]
    PhaseFailed,
    /// A running phase was cancelled.
    #[serde(rename = "phase.cancelled")]
    PhaseCancelled,
    /// Publisher container addresses were published for the partner.
    #[serde(rename = "addresses.published")]
    AddressesPublished,
}

impl EventKind {
    /// Dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::PhaseStarted => "phase.started",
            Self::PhaseCompleted => "phase.completed",
            Self::PhaseFailed => "phase.failed",
            Self::PhaseCancelled => "phase.cancelled",
            Self::AddressesPublished => "addresses.published",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Time-ordered unique id.
    pub event_id: Uuid,
    /// Event kind.
    pub kind: EventKind,
    /// The instance it concerns.
    pub instance_id: String,
    /// The phase, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// The graph stage, for stage events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    /// Free-form details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
    /// When the event was created.
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Creates an event with no phase, stage or detail.
    #[must_use]
    pub fn new(kind: EventKind, instance_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            instance_id: instance_id.into(),
            phase: None,
            stage: None,
            detail: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageKind) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the detail payload.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_as_dotted_name() {
        for kind in [
            EventKind::StageStarted,
            EventKind::PhaseCancelled,
            EventKind::AddressesPublished,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn test_event_skips_empty_fields() {
        let event = LifecycleEvent::new(EventKind::PhaseStarted, "run-1").with_phase(Phase::Compute);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "phase.started");
        assert_eq!(json["phase"], "compute");
        assert!(json.get("stage").is_none());
        assert!(json.get("detail").is_none());
        assert_eq!(json["event_id"], event.event_id.to_string());
    }
}
