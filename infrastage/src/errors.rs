//! Error types for the infrastage orchestrator.
//!
//! Configuration problems, missing upstream outputs, provisioning failures
//! during `apply` and failed resumption lookups are fatal. Absent stage state
//! is never an error: teardown reports it as a normal status instead.

use std::collections::HashMap;
use thiserror::Error;

/// The main error type for infrastage operations.
#[derive(Debug, Error)]
pub enum InfrastageError {
    /// A configuration value is missing or malformed.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A dependent stage needed an output that was never produced.
    #[error("{0}")]
    MissingOutput(#[from] MissingOutputError),

    /// The provisioning engine reported a failure.
    #[error("{0}")]
    Provisioning(#[from] ProvisioningError),

    /// No prior run could be located for resumption.
    #[error("{0}")]
    ResumeLookup(#[from] ResumeLookupError),

    /// The deployment plan is malformed.
    #[error("{0}")]
    Plan(#[from] PlanValidationError),

    /// A remote object operation failed.
    #[error("{0}")]
    RemoteObject(#[from] RemoteObjectError),

    /// An orchestration phase transition was not allowed.
    #[error("Illegal phase transition: {from} -> {to}")]
    Phase {
        /// The current phase.
        from: String,
        /// The requested phase.
        to: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for InfrastageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl InfrastageError {
    /// Returns a short category label used in logs and reports.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::MissingOutput(_) => "missing_output",
            Self::Provisioning(_) => "provisioning",
            Self::ResumeLookup(_) => "resume_lookup",
            Self::Plan(_) => "plan",
            Self::RemoteObject(_) => "remote_object",
            Self::Phase { .. } => "phase",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.category()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Self::MissingOutput(err) = self {
            map.insert("stage".to_string(), serde_json::json!(err.stage));
            map.insert("key".to_string(), serde_json::json!(err.key));
        }
        map
    }
}

/// Errors raised while assembling configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value marked critical was not set.
    #[error("{key} not set")]
    MissingCritical {
        /// The configuration key.
        key: String,
    },

    /// A boolean toggle could not be parsed.
    #[error("invalid {key} value: {value}")]
    InvalidBool {
        /// The configuration key.
        key: String,
        /// The raw value.
        value: String,
    },

    /// The provider name is not supported.
    #[error("unsupported provider: {0}")]
    UnknownProvider(String),

    /// A value required by the remote backend is missing.
    #[error("{key} is required when {flag} is enabled")]
    RemoteBackend {
        /// The missing key.
        key: String,
        /// The toggle that enabled the remote backend.
        flag: String,
    },

    /// The configuration file could not be read.
    #[error("failed to load environment from {path}: {reason}")]
    EnvFile {
        /// The file path.
        path: String,
        /// Why loading failed.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a missing critical value error.
    #[must_use]
    pub fn missing_critical(key: impl Into<String>) -> Self {
        Self::MissingCritical { key: key.into() }
    }

    /// Creates a remote backend validation error.
    #[must_use]
    pub fn remote_backend(key: impl Into<String>, flag: impl Into<String>) -> Self {
        Self::RemoteBackend {
            key: key.into(),
            flag: flag.into(),
        }
    }
}

/// Error raised when a dependent stage finds a required output empty.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot run stage '{consumer}': missing '{key}' from stage '{stage}'. Run the {stage} stage first.")]
pub struct MissingOutputError {
    /// The stage that should have produced the output.
    pub stage: String,
    /// The missing output key.
    pub key: String,
    /// The stage that needed it.
    pub consumer: String,
}

impl MissingOutputError {
    /// Creates a new missing output error.
    #[must_use]
    pub fn new(stage: impl Into<String>, key: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            key: key.into(),
            consumer: consumer.into(),
        }
    }
}

/// Errors reported by a provisioning engine.
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    /// `apply` did not succeed.
    #[error("apply failed for {label} after {attempts} attempt(s): {reason}")]
    ApplyFailed {
        /// The stage label.
        label: String,
        /// The failure reason.
        reason: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// `destroy` did not succeed.
    #[error("destroy failed for {label} after {attempts} attempt(s): {reason}")]
    DestroyFailed {
        /// The stage label.
        label: String,
        /// The failure reason.
        reason: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The engine process could not be started.
    #[error("failed to run {program}: {reason}")]
    Spawn {
        /// The program name.
        program: String,
        /// The failure reason.
        reason: String,
    },

    /// Engine outputs could not be decoded.
    #[error("invalid outputs for {label}: {reason}")]
    InvalidOutputs {
        /// The stage label.
        label: String,
        /// The failure reason.
        reason: String,
    },
}

impl ProvisioningError {
    /// Creates an apply failure.
    #[must_use]
    pub fn apply_failed(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApplyFailed {
            label: label.into(),
            reason: reason.into(),
            attempts: 1,
        }
    }

    /// Creates a destroy failure.
    #[must_use]
    pub fn destroy_failed(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DestroyFailed {
            label: label.into(),
            reason: reason.into(),
            attempts: 1,
        }
    }
}

/// Error raised when no prior run can be resumed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unable to use existing network under {location}: {reason}")]
pub struct ResumeLookupError {
    /// Where the lookup happened.
    pub location: String,
    /// Why it failed.
    pub reason: String,
}

impl ResumeLookupError {
    /// Creates a new resume lookup error.
    #[must_use]
    pub fn new(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when a deployment plan fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PlanValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PlanValidationError {
    /// Creates a new plan validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised by a remote object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to {operation} s3://{bucket}/{key}: {reason}")]
pub struct RemoteObjectError {
    /// What was attempted (`upload`, `list`, `delete`).
    pub operation: String,
    /// The bucket.
    pub bucket: String,
    /// The object key or prefix.
    pub key: String,
    /// Why it failed.
    pub reason: String,
}

impl RemoteObjectError {
    /// Creates a new remote object error.
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            bucket: bucket.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = InfrastageError> = std::result::Result<T, E>;
