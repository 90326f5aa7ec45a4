//! Remote state backend selection.
//!
//! By default each stage keeps its engine state locally next to its template
//! copy. With `TF_TEST_REMOTE_BACKEND` enabled, state goes to a shared S3
//! bucket under a key derived from provider, run id and stage, so a crashed
//! CI job can still be cleaned up from elsewhere. Variable documents are
//! uploaded next to the state through a [`RemoteObjectStore`].

mod objects;
#[cfg(feature = "s3")]
mod s3;

#[cfg(test)]
pub use objects::MockRemoteObjectStore;
pub use objects::{ObjectMetadata, RemoteObjectStore};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::Provider;
use crate::errors::ConfigError;

/// Toggle enabling the remote backend.
pub const REMOTE_BACKEND_FLAG: &str = "TF_TEST_REMOTE_BACKEND";
/// Bucket holding remote state.
pub const BUCKET_KEY: &str = "TF_TEST_S3_BUCKET";
/// Region of the bucket.
pub const REGION_KEY: &str = "TF_TEST_S3_REGION";
/// Prefix of every key written to the bucket.
pub const PREFIX_KEY: &str = "TF_TEST_S3_PREFIX";
/// Access key id used for the bucket.
pub const ACCESS_KEY_ID_KEY: &str = "AWS_ACCESS_KEY_ID";
/// Secret access key used for the bucket.
pub const SECRET_ACCESS_KEY_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Optional session token for temporary credentials.
pub const SESSION_TOKEN_KEY: &str = "AWS_SESSION_TOKEN";

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "test-runs";

/// Parses a boolean toggle. An empty value is false.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "" => Ok(false),
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Raw remote backend settings as read from configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Whether the remote backend is enabled.
    pub enabled: bool,
    /// Bucket name.
    pub bucket: Option<String>,
    /// Bucket region.
    pub region: Option<String>,
    /// Key prefix; [`DEFAULT_PREFIX`] when unset.
    pub prefix: Option<String>,
    /// Access key id.
    pub access_key_id: Option<String>,
    /// Secret access key.
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Session token.
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("enabled", &self.enabled)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl BackendSettings {
    /// Reads settings through a key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = match lookup(REMOTE_BACKEND_FLAG) {
            Some(raw) => parse_bool(REMOTE_BACKEND_FLAG, &raw)?,
            None => false,
        };

        Ok(Self {
            enabled,
            bucket: non_empty(lookup(BUCKET_KEY)),
            region: non_empty(lookup(REGION_KEY)),
            prefix: non_empty(lookup(PREFIX_KEY)),
            access_key_id: non_empty(lookup(ACCESS_KEY_ID_KEY)),
            secret_access_key: non_empty(lookup(SECRET_ACCESS_KEY_KEY)),
            session_token: non_empty(lookup(SESSION_TOKEN_KEY)),
        })
    }

    /// Checks that everything the remote backend needs is present.
    ///
    /// Disabled settings are always valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        let required = [
            (BUCKET_KEY, &self.bucket),
            (REGION_KEY, &self.region),
            (ACCESS_KEY_ID_KEY, &self.access_key_id),
            (SECRET_ACCESS_KEY_KEY, &self.secret_access_key),
        ];
        for (key, value) in required {
            if value.is_none() {
                return Err(ConfigError::remote_backend(key, REMOTE_BACKEND_FLAG));
            }
        }
        Ok(())
    }

    /// Returns the configured prefix or the default.
    #[must_use]
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(DEFAULT_PREFIX)
    }
}

/// A fully validated remote backend for one stage.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteBackend {
    /// Bucket name.
    pub bucket: String,
    /// Bucket region.
    pub region: String,
    /// Object key of the stage's state.
    pub key: String,
    /// Object key of the stage's variable document.
    pub tfvars_key: String,
    /// Prefix shared by every object of the run.
    pub run_prefix: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RemoteBackend {
    /// Metadata attached to the stage's variable document.
    #[must_use]
    pub fn tfvars_metadata(&self, provider: Provider, stage: &str, run_id: &str) -> ObjectMetadata {
        [
            ("provider", provider.as_str()),
            ("stage", stage),
            ("run-id", run_id),
            ("file-type", "terraform-tfvars-json"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

/// Where a stage keeps its engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    /// The engine's local default.
    Local,
    /// A shared remote store.
    Remote(RemoteBackend),
}

impl BackendSelection {
    /// Returns true for the remote store.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Returns the engine's backend connection parameters.
    #[must_use]
    pub fn backend_config(&self) -> Option<BTreeMap<String, String>> {
        let Self::Remote(remote) = self else {
            return None;
        };

        let mut config = BTreeMap::new();
        config.insert("bucket".to_string(), remote.bucket.clone());
        config.insert("key".to_string(), remote.key.clone());
        config.insert("region".to_string(), remote.region.clone());
        config.insert("access_key".to_string(), remote.access_key_id.clone());
        config.insert("secret_key".to_string(), remote.secret_access_key.clone());
        config.insert("skip_credentials_validation".to_string(), "false".to_string());
        config.insert("skip_metadata_api_check".to_string(), "false".to_string());
        if let Some(token) = &remote.session_token {
            config.insert("token".to_string(), token.clone());
        }
        Some(config)
    }
}

/// Returns the state object key of a stage.
#[must_use]
pub fn state_key(prefix: &str, provider: Provider, run_id: &str, stage: &str) -> String {
    format!("{prefix}/{provider}/{run_id}/{stage}/terraform.tfstate")
}

/// Returns the variable document object key of a stage.
#[must_use]
pub fn tfvars_key(prefix: &str, provider: Provider, run_id: &str, stage: &str) -> String {
    format!("{prefix}/{provider}/{run_id}/{stage}/terraform.tfvars.json")
}

/// Returns the prefix shared by all objects of a run.
#[must_use]
pub fn run_prefix(prefix: &str, provider: Provider, run_id: &str) -> String {
    format!("{prefix}/{provider}/{run_id}/")
}

/// Chooses the state backend for one stage.
pub fn select_backend(
    settings: &BackendSettings,
    provider: Provider,
    stage: &str,
    run_id: &str,
) -> Result<BackendSelection, ConfigError> {
    if !settings.enabled {
        return Ok(BackendSelection::Local);
    }
    settings.validate()?;

    let require = |value: &Option<String>, key: &str| {
        value
            .clone()
            .ok_or_else(|| ConfigError::remote_backend(key, REMOTE_BACKEND_FLAG))
    };
    let prefix = settings.prefix();

    Ok(BackendSelection::Remote(RemoteBackend {
        bucket: require(&settings.bucket, BUCKET_KEY)?,
        region: require(&settings.region, REGION_KEY)?,
        key: state_key(prefix, provider, run_id, stage),
        tfvars_key: tfvars_key(prefix, provider, run_id, stage),
        run_prefix: run_prefix(prefix, provider, run_id),
        access_key_id: require(&settings.access_key_id, ACCESS_KEY_ID_KEY)?,
        secret_access_key: require(&settings.secret_access_key, SECRET_ACCESS_KEY_KEY)?,
        session_token: settings.session_token.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn enabled() -> BackendSettings {
        BackendSettings {
            enabled: true,
            bucket: Some("tf-state".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: None,
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("secret".to_string()),
            session_token: None,
        }
    }

    #[test]
    fn test_disabled_is_local() {
        let selection =
            select_backend(&BackendSettings::default(), Provider::Aws, "network", "t1-abcde").unwrap();
        assert_eq!(selection, BackendSelection::Local);
        assert!(selection.backend_config().is_none());
    }

    #[test]
    fn test_remote_key_layout() {
        let selection = select_backend(&enabled(), Provider::Gcp, "gke-disk-enabled", "t1-abcde").unwrap();
        let BackendSelection::Remote(remote) = &selection else {
            panic!("expected remote backend");
        };

        assert_eq!(remote.key, "test-runs/gcp/t1-abcde/gke-disk-enabled/terraform.tfstate");
        assert_eq!(remote.tfvars_key, "test-runs/gcp/t1-abcde/gke-disk-enabled/terraform.tfvars.json");
        assert_eq!(remote.run_prefix, "test-runs/gcp/t1-abcde/");

        let config = selection.backend_config().unwrap();
        assert_eq!(config["bucket"], "tf-state");
        assert_eq!(config["key"], remote.key);
        assert_eq!(config["skip_metadata_api_check"], "false");
        assert!(!config.contains_key("token"));
    }

    #[test]
    fn test_tfvars_metadata() {
        let BackendSelection::Remote(remote) = select_backend(&enabled(), Provider::Azure, "network", "r1").unwrap()
        else {
            panic!("expected remote backend");
        };
        let metadata = remote.tfvars_metadata(Provider::Azure, "network", "r1");
        assert_eq!(metadata["provider"], "azure");
        assert_eq!(metadata["run-id"], "r1");
        assert_eq!(metadata["file-type"], "terraform-tfvars-json");
    }

    #[test]
    fn test_session_token_and_prefix() {
        let mut settings = enabled();
        settings.prefix = Some("ci".to_string());
        settings.session_token = Some("tok".to_string());

        let config = select_backend(&settings, Provider::Aws, "network", "r1")
            .unwrap()
            .backend_config()
            .unwrap();
        assert_eq!(config["key"], "ci/aws/r1/network/terraform.tfstate");
        assert_eq!(config["token"], "tok");
    }

    #[test]
    fn test_missing_bucket_is_fatal() {
        let mut settings = enabled();
        settings.bucket = None;

        let err = select_backend(&settings, Provider::Aws, "network", "r1").unwrap_err();
        assert_eq!(err, ConfigError::remote_backend(BUCKET_KEY, REMOTE_BACKEND_FLAG));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (REMOTE_BACKEND_FLAG, "true"),
            (BUCKET_KEY, "tf-state"),
            (REGION_KEY, ""),
            (ACCESS_KEY_ID_KEY, "AKIA"),
        ]
        .into_iter()
        .collect();

        let settings = BackendSettings::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.region, None);
        assert_eq!(settings.prefix(), DEFAULT_PREFIX);
        assert_eq!(
            settings.validate().unwrap_err(),
            ConfigError::remote_backend(REGION_KEY, REMOTE_BACKEND_FLAG)
        );
    }

    #[test]
    fn test_invalid_flag() {
        let err = BackendSettings::from_lookup(|k| (k == REMOTE_BACKEND_FLAG).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", select_backend(&enabled(), Provider::Aws, "network", "r1").unwrap());
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("AKIA"));
    }
}
