//! Logging setup for orchestration runs.
//!
//! All components log through `tracing`; this module installs the
//! subscriber and builds the spans stage work runs inside.

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Returns false if
/// a subscriber was already installed, which is expected when several tests
/// share a process.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
    };

    result.is_ok()
}

/// Creates the span a stage step runs inside.
#[must_use]
pub fn stage_span(stage: &str, provider: &str) -> Span {
    tracing::info_span!("stage", stage = %stage, provider = %provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let _ = init_tracing(LogFormat::Pretty);
        assert!(!init_tracing(LogFormat::Json));
    }
}
