//! Seams to the external provisioning tooling.
//!
//! The orchestrator never talks to an infrastructure-as-code tool directly.
//! It hands an [`InvocationDescriptor`] to a [`ProvisioningEngine`] and
//! materializes templates through a [`FixtureCopier`].

mod fixtures;
#[cfg(feature = "terraform")]
mod terraform;

pub use fixtures::{stage_workspace, run_workspace, DirFixtureCopier, FixtureCopier};
#[cfg(feature = "terraform")]
pub use terraform::{flatten_outputs, TerraformCli};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ProvisioningError;

/// Flat output map produced by one stage.
pub type StageOutputs = BTreeMap<String, String>;

/// Retry behavior the engine applies to its own calls.
///
/// The orchestrator passes this through unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Error-output pattern to a description of why it is transient.
    #[serde(default)]
    pub retryable_errors: BTreeMap<String, String>,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between attempts in seconds.
    #[serde(default = "default_time_between_retries")]
    pub time_between_retries_secs: u64,
}

fn default_max_retries() -> u32 {
    1
}

fn default_time_between_retries() -> u64 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable_errors: [("RequestError".to_string(), "Request failed".to_string())]
                .into_iter()
                .collect(),
            max_retries: default_max_retries(),
            time_between_retries_secs: default_time_between_retries(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            retryable_errors: BTreeMap::new(),
            max_retries: 0,
            time_between_retries_secs: 0,
        }
    }

    /// Adds a retryable error pattern.
    #[must_use]
    pub fn with_retryable(mut self, pattern: impl Into<String>, description: impl Into<String>) -> Self {
        self.retryable_errors.insert(pattern.into(), description.into());
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Returns the pause between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.time_between_retries_secs)
    }
}

fn default_no_color() -> bool {
    true
}

/// Everything needed to apply, and later destroy, one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    /// Stage label used in logs and errors.
    pub label: String,
    /// Working directory holding the stage's template.
    pub template_dir: PathBuf,
    /// Input variable document.
    #[serde(default)]
    pub vars: serde_json::Map<String, serde_json::Value>,
    /// Remote state connection parameters; `None` means local state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_config: Option<BTreeMap<String, String>>,
    /// Engine retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Disable colored engine output.
    #[serde(default = "default_no_color")]
    pub no_color: bool,
}

impl InvocationDescriptor {
    /// Creates a descriptor for a template directory.
    #[must_use]
    pub fn new(label: impl Into<String>, template_dir: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            template_dir: template_dir.into(),
            vars: serde_json::Map::new(),
            backend_config: None,
            retry: RetryPolicy::default(),
            no_color: true,
        }
    }

    /// Sets one input variable.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    /// Sets the backend parameters.
    #[must_use]
    pub fn with_backend_config(mut self, config: Option<BTreeMap<String, String>>) -> Self {
        self.backend_config = config;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Merges variables, overwriting existing keys.
    pub fn merge_vars(&mut self, vars: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in vars {
            self.vars.insert(key.clone(), value.clone());
        }
    }
}

/// The external tool that turns descriptors into real resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Creates or updates the described resources and returns their outputs.
    async fn apply(&self, descriptor: &InvocationDescriptor) -> Result<StageOutputs, ProvisioningError>;

    /// Destroys the described resources.
    async fn destroy(&self, descriptor: &InvocationDescriptor) -> Result<(), ProvisioningError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default_matches_request_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.delay(), Duration::from_secs(10));
        assert!(policy.retryable_errors.contains_key("RequestError"));
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = serde_json::json!({
            "label": "network",
            "template_dir": "/tmp/network",
        });
        let descriptor: InvocationDescriptor = serde_json::from_value(json).unwrap();

        assert!(descriptor.no_color);
        assert!(descriptor.vars.is_empty());
        assert!(descriptor.backend_config.is_none());
        assert_eq!(descriptor.retry.max_retries, 1);
    }

    #[test]
    fn test_merge_vars_overwrites() {
        let mut descriptor = InvocationDescriptor::new("app", "/tmp/app")
            .with_var("install_instance", serde_json::json!(false))
            .with_var("region", serde_json::json!("us-east-1"));

        let mut follow_up = serde_json::Map::new();
        follow_up.insert("install_instance".to_string(), serde_json::json!(true));
        descriptor.merge_vars(&follow_up);

        assert_eq!(descriptor.vars["install_instance"], serde_json::json!(true));
        assert_eq!(descriptor.vars["region"], serde_json::json!("us-east-1"));
    }
}
