//! Named, skippable, at-most-once steps.
//!
//! Every setup and teardown step of an orchestration goes through
//! [`StageRunner::run_stage`]. An operator can skip any step by setting
//! `SKIP_<step>` to a non-empty value, which is how partial re-runs work:
//! skip `setup_network` to reuse an existing network, skip the cleanup steps
//! to keep resources around for debugging.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, Instrument};

use crate::core::{Provider, StageEvent};
use crate::errors::Result;
use crate::events::{EventSink, LoggingEventSink};
use crate::observability::stage_span;

/// Prefix of the skip toggles.
pub const SKIP_PREFIX: &str = "SKIP_";

/// Returns the name of the setup step for a stage.
#[must_use]
pub fn setup_step(stage: &str) -> String {
    format!("setup_{stage}")
}

/// Returns the name of the teardown step for a stage.
#[must_use]
pub fn cleanup_step(stage: &str) -> String {
    format!("cleanup_{stage}")
}

/// The set of step names the operator asked to skip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipSignals {
    skipped: BTreeSet<String>,
}

impl SkipSignals {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects `SKIP_<step>` entries with non-empty values.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let skipped = vars
            .into_iter()
            .filter(|(_, value)| !value.as_ref().is_empty())
            .filter_map(|(key, _)| key.as_ref().strip_prefix(SKIP_PREFIX).map(str::to_string))
            .filter(|step| !step.is_empty())
            .collect();
        Self { skipped }
    }

    /// Marks a step as skipped.
    #[must_use]
    pub fn with_skip(mut self, step: impl Into<String>) -> Self {
        self.skipped.insert(step.into());
        self
    }

    /// Returns true if the step should be skipped.
    #[must_use]
    pub fn is_skipped(&self, step: &str) -> bool {
        self.skipped.contains(step)
    }

    /// Returns the skipped step names.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.skipped.iter().map(String::as_str)
    }
}

/// Runs named steps at most once per invocation.
pub struct StageRunner {
    provider: Provider,
    skips: SkipSignals,
    sink: Arc<dyn EventSink>,
    executed: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("provider", &self.provider)
            .field("skips", &self.skips)
            .field("executed", &self.executed.lock().len())
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Creates a runner that logs events through `tracing`.
    #[must_use]
    pub fn new(provider: Provider, skips: SkipSignals) -> Self {
        Self {
            provider,
            skips,
            sink: Arc::new(LoggingEventSink::default()),
            executed: Mutex::new(HashSet::new()),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the skip signals.
    #[must_use]
    pub fn skips(&self) -> &SkipSignals {
        &self.skips
    }

    /// Returns true if the step should be skipped.
    #[must_use]
    pub fn is_skipped(&self, step: &str) -> bool {
        self.skips.is_skipped(step)
    }

    /// Returns true if the step already ran in this invocation.
    #[must_use]
    pub fn has_run(&self, step: &str) -> bool {
        self.executed.lock().contains(step)
    }

    /// Runs `body` unless the step is skipped or already ran.
    ///
    /// Returns `Ok(None)` when the body was not invoked. Errors from the body
    /// are returned unchanged.
    pub async fn run_stage<T, F, Fut>(&self, step: &str, body: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.skips.is_skipped(step) {
            info!(
                step = %step,
                "The '{SKIP_PREFIX}{step}' environment variable is set, so skipping stage '{step}'"
            );
            self.sink
                .emit(StageEvent::skipped(step, &format!("{SKIP_PREFIX}{step}")))
                .await;
            return Ok(None);
        }

        if !self.executed.lock().insert(step.to_string()) {
            debug!(step = %step, "Step already ran in this invocation");
            return Ok(None);
        }

        let span = stage_span(step, self.provider.as_str());
        self.sink.emit(StageEvent::started(step)).await;
        let start = Instant::now();

        match body().instrument(span).await {
            Ok(value) => {
                info!(step = %step, elapsed_ms = start.elapsed().as_millis() as u64, "Step finished");
                Ok(Some(value))
            }
            Err(err) => {
                self.sink.emit(StageEvent::failed(step, &err.to_string())).await;
                Err(err)
            }
        }
    }
}
