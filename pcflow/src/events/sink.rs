//! Event sink trait and implementations.

use super::{EventKind, LifecycleEvent};
use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Receives lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: LifecycleEvent);

    /// Emits an event without awaiting. Must never panic.
    fn try_emit(&self, event: LifecycleEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: LifecycleEvent) {}

    fn try_emit(&self, _event: LifecycleEvent) {}
}

/// Writes each event as a structured `tracing` record.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`; anything but DEBUG logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// A debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &LifecycleEvent) {
        let phase = event.phase.map(|p| p.to_string()).unwrap_or_default();
        let stage = event.stage.map(|s| s.to_string()).unwrap_or_default();

        if self.level == Level::DEBUG {
            debug!(
                event = %event.kind,
                instance_id = %event.instance_id,
                phase = %phase,
                stage = %stage,
                detail = %event.detail,
                "Lifecycle event"
            );
        } else {
            info!(
                event = %event.kind,
                instance_id = %event.instance_id,
                phase = %phase,
                stage = %stage,
                detail = %event.detail,
                "Lifecycle event"
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory; for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Kinds of all collected events, oldest first.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Collected events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        let event = LifecycleEvent::new(EventKind::StageStarted, "run-1").with_stage(StageKind::Shard);
        NoOpEventSink.emit(event.clone()).await;
        LoggingEventSink::default().emit(event.clone()).await;
        LoggingEventSink::debug().try_emit(event);
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_kind() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(LifecycleEvent::new(EventKind::StageStarted, "run-1")).await;
        sink.try_emit(LifecycleEvent::new(EventKind::StageCompleted, "run-1"));
        sink.try_emit(LifecycleEvent::new(EventKind::StageStarted, "run-1"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.of_kind(EventKind::StageStarted).len(), 2);
        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::StageStarted,
                EventKind::StageCompleted,
                EventKind::StageStarted
            ]
        );

        sink.clear();
        assert!(sink.is_empty());
    }
}
