//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

use crate::core::{StageEvent, StageStatus};

/// Trait for event sinks that receive stage events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: StageEvent);

    /// Emits an event without awaiting.
    ///
    /// This never fails; sinks log and drop what they cannot handle.
    fn try_emit(&self, event: StageEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: StageEvent) {}

    fn try_emit(&self, _event: StageEvent) {}
}

/// An event sink that logs events using the tracing framework.
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
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &StageEvent) {
        // Failures are always surfaced, whatever the configured level.
        if event.status == StageStatus::Failed {
            warn!(
                event_type = %event.event_type,
                stage = %event.stage,
                status = %event.status,
                event_data = ?event.data,
                "{}", event.summary()
            );
            return;
        }

        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                stage = %event.stage,
                status = %event.status,
                event_data = ?event.data,
                "{}", event.summary()
            );
        } else {
            info!(
                event_type = %event.event_type,
                stage = %event.stage,
                status = %event.status,
                event_data = ?event.data,
                "{}", event.summary()
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: StageEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: StageEvent) {
        self.log_event(&event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<StageEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the stage names of events with the given status, in order.
    #[must_use]
    pub fn stages_with_status(&self, status: StageStatus) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.stage.clone())
            .collect()
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<StageEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: StageEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: StageEvent) {
        self.events.write().push(event);
    }
}
