//! Event sink trait and implementations.

use super::PipelineEvent;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// Receives pipeline lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: PipelineEvent, data: Value);

    /// Emits an event without awaiting. Never fails; errors are logged
    /// and dropped.
    fn try_emit(&self, event: PipelineEvent, data: Value);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: PipelineEvent, _data: Value) {}

    fn try_emit(&self, _event: PipelineEvent, _data: Value) {}
}

/// Writes events to `tracing`. Failure events are logged at warn level
/// whatever the configured level.
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
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: PipelineEvent, data: &Value) {
        let failure = matches!(
            event,
            PipelineEvent::StageFailed | PipelineEvent::PipelineFailed
        );
        if failure {
            warn!(event_type = %event, event_data = %data, "Event: {event}");
        } else if self.level == Level::DEBUG {
            debug!(event_type = %event, event_data = %data, "Event: {event}");
        } else {
            info!(event_type = %event, event_data = %data, "Event: {event}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: PipelineEvent, data: Value) {
        self.log_event(event, &data);
    }

    fn try_emit(&self, event: PipelineEvent, data: Value) {
        self.log_event(event, &data);
    }
}

/// Keeps every event in memory, for tests and embedding callers.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(PipelineEvent, Value)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(PipelineEvent, Value)> {
        self.events.read().clone()
    }

    /// Just the event kinds, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<PipelineEvent> {
        self.events.read().iter().map(|(e, _)| *e).collect()
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: PipelineEvent) -> Vec<Value> {
        self.events
            .read()
            .iter()
            .filter(|(e, _)| *e == kind)
            .map(|(_, d)| d.clone())
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

    /// Drops everything collected so far.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: PipelineEvent, data: Value) {
        self.events.write().push((event, data));
    }

    fn try_emit(&self, event: PipelineEvent, data: Value) {
        self.events.write().push((event, data));
    }
}
