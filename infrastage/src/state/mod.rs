//! Durable per-stage state.
//!
//! Each stage of a run owns a small record: the invocation descriptor needed
//! to destroy its resources later, and the flat output map later stages read
//! their inputs from. A missing record is never an error. It means the stage
//! has not run (or was torn down), and reads return empty values.

mod file;
mod memory;

pub use file::{FileStateStore, FAMILY_ID_FILE};
pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Provider;
use crate::errors::Result;
use crate::identity::FamilyId;
use crate::provision::{InvocationDescriptor, StageOutputs};

/// Identifies one orchestration run of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunPath {
    /// The provider the run targets.
    pub provider: Provider,
    /// The run id (the family id of a fresh run).
    pub run_id: String,
}

impl RunPath {
    /// Creates a run path.
    #[must_use]
    pub fn new(provider: Provider, run_id: impl Into<String>) -> Self {
        Self {
            provider,
            run_id: run_id.into(),
        }
    }

    /// Returns the path of one stage inside this run.
    #[must_use]
    pub fn stage(&self, name: impl Into<String>) -> StagePath {
        StagePath {
            run: self.clone(),
            stage: name.into(),
        }
    }
}

impl fmt::Display for RunPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.run_id)
    }
}

/// Identifies one stage's record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagePath {
    /// The owning run.
    pub run: RunPath,
    /// The stage name.
    pub stage: String,
}

impl fmt::Display for StagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run, self.stage)
    }
}

/// Everything persisted for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The invocation parameters used to create the stage.
    pub invocation: InvocationDescriptor,
    /// The stage's outputs.
    #[serde(default)]
    pub outputs: StageOutputs,
}

/// Storage for stage records, family ids and run discovery.
#[async_trait]
pub trait StageStateStore: Send + Sync {
    /// Writes one output value, overwriting any previous value.
    async fn put(&self, stage: &StagePath, key: &str, value: &str) -> Result<()>;

    /// Reads one output value; empty when the key or stage is unknown.
    async fn get(&self, stage: &StagePath, key: &str) -> Result<String>;

    /// Reads the whole output map; empty when the stage is unknown.
    async fn outputs(&self, stage: &StagePath) -> Result<StageOutputs>;

    /// Persists the invocation descriptor for a stage.
    async fn put_invocation(&self, stage: &StagePath, descriptor: &InvocationDescriptor) -> Result<()>;

    /// Loads the invocation descriptor; `None` when the stage's resources do
    /// not currently exist.
    async fn get_invocation(&self, stage: &StagePath) -> Result<Option<InvocationDescriptor>>;

    /// Deletes a stage's record. Deleting an unknown stage is a no-op.
    async fn remove_stage(&self, stage: &StagePath) -> Result<()>;

    /// Persists the family id of a run.
    async fn put_family_id(&self, run: &RunPath, id: &FamilyId) -> Result<()>;

    /// Loads the family id of a run.
    async fn get_family_id(&self, run: &RunPath) -> Result<Option<FamilyId>>;

    /// Deletes everything stored for a run. Unknown runs are a no-op.
    async fn remove_run(&self, run: &RunPath) -> Result<()>;

    /// Returns the most recently modified run of a provider.
    async fn latest_run(&self, provider: Provider) -> Result<Option<RunPath>>;

    /// Returns true if an invocation descriptor is persisted for the stage.
    async fn exists(&self, stage: &StagePath) -> Result<bool> {
        Ok(self.get_invocation(stage).await?.is_some())
    }

    /// Writes several output values.
    async fn put_outputs(&self, stage: &StagePath, outputs: &StageOutputs) -> Result<()> {
        for (key, value) in outputs {
            self.put(stage, key, value).await?;
        }
        Ok(())
    }

    /// Loads the full record of a stage.
    async fn record(&self, stage: &StagePath) -> Result<Option<StageRecord>> {
        let Some(invocation) = self.get_invocation(stage).await? else {
            return Ok(None);
        };
        Ok(Some(StageRecord {
            invocation,
            outputs: self.outputs(stage).await?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_display() {
        let run = RunPath::new(Provider::Aws, "t250101120000-ab3cd");
        assert_eq!(run.to_string(), "aws/t250101120000-ab3cd");
        assert_eq!(run.stage("network").to_string(), "aws/t250101120000-ab3cd/network");
    }

    #[test]
    fn test_record_serialization_defaults_outputs() {
        let json = serde_json::json!({
            "invocation": {"label": "network", "template_dir": "/tmp/network"},
        });
        let record: StageRecord = serde_json::from_value(json).unwrap();
        assert!(record.outputs.is_empty());
        assert_eq!(record.invocation.label, "network");
    }
}
