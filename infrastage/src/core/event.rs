//! Stage lifecycle events.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::StageStatus;

/// An event emitted while a stage is set up or torn down.
///
/// Events are consumed by event sinks for logging and by tests that assert
/// on execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// The event type (e.g., "stage.started", "stage.destroyed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// The stage (or runner step) name.
    pub stage: String,

    /// The status category.
    pub status: StageStatus,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// Additional payload.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageEvent {
    /// Creates a new stage event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, stage: impl Into<String>, status: StageStatus) -> Self {
        Self {
            event_type: event_type.into(),
            stage: stage.into(),
            status,
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn started(stage: &str) -> Self {
        Self::new("stage.started", stage, StageStatus::Running)
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn completed(stage: &str, duration_ms: f64) -> Self {
        Self::new("stage.completed", stage, StageStatus::Created)
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.skipped" event.
    #[must_use]
    pub fn skipped(stage: &str, reason: &str) -> Self {
        Self::new("stage.skipped", stage, StageStatus::Skipped)
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn failed(stage: &str, error: &str) -> Self {
        Self::new("stage.failed", stage, StageStatus::Failed)
            .add_data("error", serde_json::json!(error))
    }

    /// Creates a "stage.reused" event.
    #[must_use]
    pub fn reused(stage: &str, run_id: &str) -> Self {
        Self::new("stage.reused", stage, StageStatus::Reused)
            .add_data("run_id", serde_json::json!(run_id))
    }

    /// Creates a "stage.destroyed" event.
    #[must_use]
    pub fn destroyed(stage: &str) -> Self {
        Self::new("stage.destroyed", stage, StageStatus::Destroyed)
    }

    /// Creates a "stage.absent" event.
    #[must_use]
    pub fn absent(stage: &str) -> Self {
        Self::new("stage.absent", stage, StageStatus::Absent)
    }

    /// Returns the human-readable log line for this event.
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{} {} [{}]", self.status.glyph(), self.stage, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_factories_set_status() {
        assert_eq!(StageEvent::started("network").status, StageStatus::Running);
        assert_eq!(StageEvent::destroyed("network").status, StageStatus::Destroyed);
        assert_eq!(StageEvent::absent("network").status, StageStatus::Absent);
        assert_eq!(StageEvent::skipped("network", "SKIP_network").status, StageStatus::Skipped);
    }

    #[test]
    fn test_event_summary_has_glyph() {
        let event = StageEvent::destroyed("database");
        assert_eq!(event.summary(), "🗑️ database [destroyed]");
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = StageEvent::failed("app", "boom");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "stage.failed");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["data"]["error"], "boom");
    }
}
