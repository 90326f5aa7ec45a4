//! Filesystem-backed stage state.
//!
//! Layout:
//!
//! ```text
//! {root}/{provider}/{run_id}/resource_unique_id
//! {root}/{provider}/{run_id}/{stage}/invocation.json
//! {root}/{provider}/{run_id}/{stage}/outputs.json
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

use super::{RunPath, StagePath, StageStateStore};
use crate::core::Provider;
use crate::errors::Result;
use crate::identity::FamilyId;
use crate::provision::{InvocationDescriptor, StageOutputs};

/// File holding a run's family id, next to its stage directories.
pub const FAMILY_ID_FILE: &str = "resource_unique_id";
const INVOCATION_FILE: &str = "invocation.json";
const OUTPUTS_FILE: &str = "outputs.json";

/// Stage state stored as JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `root`. Nothing is created until written.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding a run's state.
    #[must_use]
    pub fn run_dir(&self, run: &RunPath) -> PathBuf {
        self.root.join(run.provider.as_str()).join(&run.run_id)
    }

    /// Returns the directory holding a stage's state.
    #[must_use]
    pub fn stage_dir(&self, stage: &StagePath) -> PathBuf {
        self.run_dir(&stage.run).join(&stage.stage)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes through a temporary sibling and renames it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

async fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StageStateStore for FileStateStore {
    async fn put(&self, stage: &StagePath, key: &str, value: &str) -> Result<()> {
        let path = self.stage_dir(stage).join(OUTPUTS_FILE);
        let mut outputs: StageOutputs = read_json(&path).await?.unwrap_or_default();
        outputs.insert(key.to_string(), value.to_string());
        write_json(&path, &outputs).await
    }

    async fn get(&self, stage: &StagePath, key: &str) -> Result<String> {
        let outputs = self.outputs(stage).await?;
        Ok(outputs.get(key).cloned().unwrap_or_default())
    }

    async fn outputs(&self, stage: &StagePath) -> Result<StageOutputs> {
        let path = self.stage_dir(stage).join(OUTPUTS_FILE);
        Ok(read_json(&path).await?.unwrap_or_default())
    }

    async fn put_outputs(&self, stage: &StagePath, outputs: &StageOutputs) -> Result<()> {
        let path = self.stage_dir(stage).join(OUTPUTS_FILE);
        let mut merged: StageOutputs = read_json(&path).await?.unwrap_or_default();
        merged.extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        write_json(&path, &merged).await
    }

    async fn put_invocation(&self, stage: &StagePath, descriptor: &InvocationDescriptor) -> Result<()> {
        let path = self.stage_dir(stage).join(INVOCATION_FILE);
        debug!(stage = %stage, path = %path.display(), "Saving invocation");
        write_json(&path, descriptor).await
    }

    async fn get_invocation(&self, stage: &StagePath) -> Result<Option<InvocationDescriptor>> {
        read_json(&self.stage_dir(stage).join(INVOCATION_FILE)).await
    }

    async fn remove_stage(&self, stage: &StagePath) -> Result<()> {
        remove_dir(&self.stage_dir(stage)).await
    }

    async fn put_family_id(&self, run: &RunPath, id: &FamilyId) -> Result<()> {
        write_atomic(&self.run_dir(run).join(FAMILY_ID_FILE), id.as_str().as_bytes()).await
    }

    async fn get_family_id(&self, run: &RunPath) -> Result<Option<FamilyId>> {
        match fs::read_to_string(self.run_dir(run).join(FAMILY_ID_FILE)).await {
            Ok(raw) => {
                let trimmed = raw.trim();
                Ok((!trimmed.is_empty()).then(|| FamilyId::new(trimmed)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_run(&self, run: &RunPath) -> Result<()> {
        remove_dir(&self.run_dir(run)).await
    }

    async fn latest_run(&self, provider: Provider) -> Result<Option<RunPath>> {
        let dir = self.root.join(provider.as_str());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<(SystemTime, String)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let modified = metadata.modified()?;
            let newer = latest
                .as_ref()
                .map_or(true, |(time, id)| (modified, &name) > (*time, id));
            if newer {
                latest = Some((modified, name));
            }
        }

        Ok(latest.map(|(_, run_id)| RunPath::new(provider, run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn run() -> RunPath {
        RunPath::new(Provider::Aws, "t250101120000-ab3cd")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let network = run().stage("network");

        store.put(&network, "vpc_id", "vpc-123").await.unwrap();
        store.put(&network, "vpc_id", "vpc-456").await.unwrap();
        store.put(&network, "cluster_name", "eks").await.unwrap();

        assert_eq!(store.get(&network, "vpc_id").await.unwrap(), "vpc-456");
        assert_eq!(store.outputs(&network).await.unwrap().len(), 2);
        assert!(dir
            .path()
            .join("aws/t250101120000-ab3cd/network/outputs.json")
            .exists());
    }

    #[tokio::test]
    async fn test_unknown_stage_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("never-created"));
        let stage = run().stage("database");

        assert_eq!(store.get(&stage, "endpoint").await.unwrap(), "");
        assert!(store.get_invocation(&stage).await.unwrap().is_none());
        assert!(!store.exists(&stage).await.unwrap());
        assert!(store.record(&stage).await.unwrap().is_none());
        store.remove_stage(&stage).await.unwrap();
        store.remove_run(&stage.run).await.unwrap();
    }

    #[tokio::test]
    async fn test_invocation_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let stage = run().stage("eks-disk-enabled");
        let descriptor = InvocationDescriptor::new("eks-disk-enabled", "/work/eks")
            .with_var("cluster_name", serde_json::json!("t1-eks"));

        store.put_invocation(&stage, &descriptor).await.unwrap();
        assert!(store.exists(&stage).await.unwrap());
        assert_eq!(store.get_invocation(&stage).await.unwrap(), Some(descriptor));

        store.remove_stage(&stage).await.unwrap();
        assert!(!store.exists(&stage).await.unwrap());
        assert!(!store.stage_dir(&stage).exists());
    }

    #[tokio::test]
    async fn test_family_id_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let id = FamilyId::new("t250101120000-ab3cd");

        assert!(store.get_family_id(&run()).await.unwrap().is_none());
        store.put_family_id(&run(), &id).await.unwrap();
        assert_eq!(store.get_family_id(&run()).await.unwrap(), Some(id));

        store.remove_run(&run()).await.unwrap();
        assert!(store.get_family_id(&run()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_run_skips_hidden_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.latest_run(Provider::Aws).await.unwrap().is_none());

        let older = RunPath::new(Provider::Aws, "t250101120000-aaaaa");
        store.put_family_id(&older, &FamilyId::new("t250101120000-aaaaa")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let newer = RunPath::new(Provider::Aws, "t250101120500-bbbbb");
        store.put_family_id(&newer, &FamilyId::new("t250101120500-bbbbb")).await.unwrap();

        std::fs::create_dir_all(dir.path().join("aws/.cache")).unwrap();
        std::fs::write(dir.path().join("aws/notes.txt"), "x").unwrap();

        assert_eq!(store.latest_run(Provider::Aws).await.unwrap(), Some(newer));
        assert!(store.latest_run(Provider::Gcp).await.unwrap().is_none());
    }
}
