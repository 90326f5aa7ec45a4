//! Stage status categories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome category of a stage step.
///
/// Every log line and report entry about a stage is tagged with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not been reached yet.
    #[default]
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage provisioned its resources.
    Created,
    /// Stage reused state from a prior run.
    Reused,
    /// Stage was suppressed by an operator skip signal.
    Skipped,
    /// Stage resources were destroyed.
    Destroyed,
    /// Stage had no persisted state, so teardown was a no-op.
    Absent,
    /// Stage failed.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Created => write!(f, "created"),
            Self::Reused => write!(f, "reused"),
            Self::Skipped => write!(f, "skipped"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Absent => write!(f, "absent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns the glyph shown next to the stage name in log lines.
    #[must_use]
    pub fn glyph(&self) -> &'static str {
        match self {
            Self::Pending => "⏳",
            Self::Running => "🔧",
            Self::Created => "✅",
            Self::Reused => "♻️",
            Self::Skipped => "⏭️",
            Self::Destroyed => "🗑️",
            Self::Absent => "💤",
            Self::Failed => "❌",
        }
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}
