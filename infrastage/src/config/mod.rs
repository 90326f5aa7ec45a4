//! Orchestrator configuration.
//!
//! Configuration is assembled once, from an explicit variable snapshot or
//! from the process environment plus an optional env file, and passed by
//! reference to everything that needs it. Nothing else reads the
//! environment.

pub mod env_file;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backend::{parse_bool, BackendSettings};
use crate::errors::ConfigError;
use crate::observability::LogFormat;
use crate::runner::SkipSignals;

/// Root of persisted stage state.
pub const STATE_ROOT_KEY: &str = "INFRASTAGE_STATE_ROOT";
/// Directory holding the template fixtures.
pub const FIXTURES_ROOT_KEY: &str = "INFRASTAGE_FIXTURES_ROOT";
/// Directory run-scoped template copies are created in.
pub const WORKSPACE_ROOT_KEY: &str = "INFRASTAGE_WORKSPACE_ROOT";
/// Reuse the network of a previous run.
pub const USE_EXISTING_NETWORK_KEY: &str = "USE_EXISTING_NETWORK";
/// Resume this exact run instead of the most recent one.
pub const RESUME_RUN_ID_KEY: &str = "INFRASTAGE_RESUME_RUN_ID";
/// Run variant pipelines concurrently.
pub const PARALLEL_VARIANTS_KEY: &str = "INFRASTAGE_PARALLEL_VARIANTS";
/// Log output format (`pretty` or `json`).
pub const LOG_FORMAT_KEY: &str = "INFRASTAGE_LOG_FORMAT";

const DEFAULT_STATE_ROOT: &str = "test-runs";
const DEFAULT_FIXTURES_ROOT: &str = "fixtures";
const DEFAULT_WORKSPACE_ROOT: &str = ".";

/// How a missing configuration value is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// Missing values abort the run.
    Critical,
    /// Missing values are logged as warnings.
    Optional,
}

/// A configuration value a deployment expects to be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// The variable name.
    pub key: String,
    /// How a missing value is treated.
    pub kind: ConfigKind,
}

impl ConfigEntry {
    /// Creates a critical entry.
    #[must_use]
    pub fn critical(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ConfigKind::Critical,
        }
    }

    /// Creates an optional entry.
    #[must_use]
    pub fn optional(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ConfigKind::Optional,
        }
    }
}

/// Entries every deployment logs, whatever the provider.
#[must_use]
pub fn common_entries() -> Vec<ConfigEntry> {
    [
        "TF_LOG",
        "TF_LOG_PATH",
        "ENVIRONMENT",
        crate::backend::REMOTE_BACKEND_FLAG,
        crate::backend::BUCKET_KEY,
        crate::backend::REGION_KEY,
        crate::backend::PREFIX_KEY,
    ]
    .into_iter()
    .map(ConfigEntry::optional)
    .collect()
}

/// Everything the orchestrator reads from its environment.
#[derive(Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root of persisted stage state.
    pub state_root: PathBuf,
    /// Directory holding the template fixtures.
    pub fixtures_root: PathBuf,
    /// Directory run-scoped template copies are created in.
    pub workspace_root: PathBuf,
    /// Reuse the network of a previous run instead of creating one.
    pub use_existing_network: bool,
    /// Resume this run id rather than the most recently modified one.
    pub resume_run_id: Option<String>,
    /// Steps to skip.
    pub skips: SkipSignals,
    /// Remote state settings.
    pub backend: BackendSettings,
    /// Run variant pipelines concurrently.
    pub parallel_variants: bool,
    /// Log output format.
    pub log_format: LogFormat,
    /// The full variable snapshot the configuration was built from.
    #[serde(skip)]
    pub values: BTreeMap<String, String>,
}

impl fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: BTreeMap<&str, &str> = self
            .values
            .iter()
            .map(|(key, value)| {
                let shown = if is_secret(key) { "<set>" } else { value.as_str() };
                (key.as_str(), shown)
            })
            .collect();

        f.debug_struct("OrchestratorConfig")
            .field("state_root", &self.state_root)
            .field("fixtures_root", &self.fixtures_root)
            .field("workspace_root", &self.workspace_root)
            .field("use_existing_network", &self.use_existing_network)
            .field("resume_run_id", &self.resume_run_id)
            .field("skips", &self.skips)
            .field("backend", &self.backend)
            .field("parallel_variants", &self.parallel_variants)
            .field("log_format", &self.log_format)
            .field("values", &values)
            .finish()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(DEFAULT_STATE_ROOT),
            fixtures_root: PathBuf::from(DEFAULT_FIXTURES_ROOT),
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            use_existing_network: false,
            resume_run_id: None,
            skips: SkipSignals::default(),
            backend: BackendSettings::default(),
            parallel_variants: false,
            log_format: LogFormat::default(),
            values: BTreeMap::new(),
        }
    }
}

fn flag(values: &BTreeMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    values.get(key).map_or(Ok(false), |raw| parse_bool(key, raw))
}

impl OrchestratorConfig {
    /// Builds a configuration from a variable snapshot.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| values.get(key).filter(|v| !v.trim().is_empty()).cloned();

        let backend = BackendSettings::from_lookup(|key| values.get(key).cloned())?;
        backend.validate()?;

        // Any non-empty value except an explicit false enables reuse.
        let use_existing_network = match get(USE_EXISTING_NETWORK_KEY) {
            Some(raw) => parse_bool(USE_EXISTING_NETWORK_KEY, &raw).unwrap_or(true),
            None => false,
        };

        Ok(Self {
            state_root: get(STATE_ROOT_KEY).map_or_else(|| PathBuf::from(DEFAULT_STATE_ROOT), PathBuf::from),
            fixtures_root: get(FIXTURES_ROOT_KEY)
                .map_or_else(|| PathBuf::from(DEFAULT_FIXTURES_ROOT), PathBuf::from),
            workspace_root: get(WORKSPACE_ROOT_KEY)
                .map_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_ROOT), PathBuf::from),
            use_existing_network,
            resume_run_id: get(RESUME_RUN_ID_KEY),
            skips: SkipSignals::from_vars(&values),
            backend,
            parallel_variants: flag(&values, PARALLEL_VARIANTS_KEY)?,
            log_format: get(LOG_FORMAT_KEY).map_or_else(LogFormat::default, |v| LogFormat::parse(&v)),
            values,
        })
    }

    /// Builds a configuration from the process environment, pre-loaded from
    /// `local.env` or `.env` in `dir` when present. Process variables win
    /// over file values.
    pub fn from_env(dir: &Path) -> Result<Self, ConfigError> {
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        match env_file::load(dir)? {
            Some((_, vars)) => values.extend(vars),
            None => warn!(dir = %dir.display(), "Neither local.env nor .env found"),
        }
        values.extend(std::env::vars());
        Self::from_vars(values)
    }

    /// Returns a value from the snapshot; empty values count as unset.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Sets a value in the snapshot.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets the state root.
    #[must_use]
    pub fn with_state_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.state_root = root.into();
        self
    }

    /// Sets the fixtures root.
    #[must_use]
    pub fn with_fixtures_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.fixtures_root = root.into();
        self
    }

    /// Sets the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Sets the skip signals.
    #[must_use]
    pub fn with_skips(mut self, skips: SkipSignals) -> Self {
        self.skips = skips;
        self
    }

    /// Enables or disables network reuse.
    #[must_use]
    pub fn with_use_existing_network(mut self, enabled: bool) -> Self {
        self.use_existing_network = enabled;
        self
    }

    /// Sets the run id to resume.
    #[must_use]
    pub fn with_resume_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.resume_run_id = Some(run_id.into());
        self
    }

    /// Enables or disables concurrent variants.
    #[must_use]
    pub fn with_parallel_variants(mut self, enabled: bool) -> Self {
        self.parallel_variants = enabled;
        self
    }

    /// Checks that expected entries are set.
    ///
    /// Missing critical entries fail; missing optional entries are logged.
    pub fn check(&self, entries: &[ConfigEntry]) -> Result<(), ConfigError> {
        info!("📋 Environment configuration:");
        for entry in entries {
            match (self.value(&entry.key), entry.kind) {
                (Some(value), _) => {
                    let shown = if is_secret(&entry.key) { "<set>" } else { value };
                    info!(key = %entry.key, value = %shown, "configured");
                }
                (None, ConfigKind::Critical) => {
                    return Err(ConfigError::missing_critical(&entry.key));
                }
                (None, ConfigKind::Optional) => {
                    warn!(key = %entry.key, "⚠️ {} not set", entry.key);
                }
            }
        }
        Ok(())
    }
}

fn is_secret(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["SECRET", "PASSWORD", "TOKEN", "LICENSE", "ACCESS_KEY"]
        .iter()
        .any(|marker| upper.contains(marker))
}
