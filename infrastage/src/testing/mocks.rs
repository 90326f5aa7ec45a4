//! Recording doubles for the provisioning and remote object seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::backend::{ObjectMetadata, RemoteObjectStore};
use crate::errors::{ProvisioningError, RemoteObjectError};
use crate::provision::{FixtureCopier, InvocationDescriptor, ProvisioningEngine, StageOutputs};

/// A call made against a [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// `apply` was called for the label.
    Apply(String),
    /// `destroy` was called for the label.
    Destroy(String),
}

/// An engine that records every call and returns configured outputs.
///
/// Labels without configured outputs apply successfully with no outputs.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    outputs: Mutex<HashMap<String, StageOutputs>>,
    failing_applies: Mutex<HashSet<String>>,
    failing_destroys: Mutex<HashSet<String>>,
    calls: Mutex<Vec<EngineCall>>,
    descriptors: Mutex<Vec<InvocationDescriptor>>,
}

impl RecordingEngine {
    /// Creates an engine with no outputs configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the outputs returned when `label` is applied.
    #[must_use]
    pub fn with_outputs<I, K, V>(self, label: &str, outputs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.set_outputs(label, outputs);
        self
    }

    /// Sets the outputs returned when `label` is applied.
    pub fn set_outputs<I, K, V>(&self, label: &str, outputs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let outputs = outputs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.outputs.lock().insert(label.to_string(), outputs);
    }

    /// Makes every apply of `label` fail.
    #[must_use]
    pub fn failing_apply(self, label: &str) -> Self {
        self.failing_applies.lock().insert(label.to_string());
        self
    }

    /// Makes every destroy of `label` fail.
    #[must_use]
    pub fn failing_destroy(self, label: &str) -> Self {
        self.failing_destroys.lock().insert(label.to_string());
        self
    }

    /// Lets destroys of `label` succeed again.
    pub fn recover_destroy(&self, label: &str) {
        self.failing_destroys.lock().remove(label);
    }

    /// Returns every call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Returns the labels applied, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                EngineCall::Apply(label) => Some(label.clone()),
                EngineCall::Destroy(_) => None,
            })
            .collect()
    }

    /// Returns the labels destroyed, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                EngineCall::Destroy(label) => Some(label.clone()),
                EngineCall::Apply(_) => None,
            })
            .collect()
    }

    /// Returns the descriptor of the last call for `label`.
    #[must_use]
    pub fn last_descriptor(&self, label: &str) -> Option<InvocationDescriptor> {
        self.descriptors.lock().iter().rev().find(|d| d.label == label).cloned()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.descriptors.lock().clear();
    }

    fn record(&self, call: EngineCall, descriptor: &InvocationDescriptor) {
        self.calls.lock().push(call);
        self.descriptors.lock().push(descriptor.clone());
    }
}

#[async_trait]
impl ProvisioningEngine for RecordingEngine {
    async fn apply(&self, descriptor: &InvocationDescriptor) -> Result<StageOutputs, ProvisioningError> {
        self.record(EngineCall::Apply(descriptor.label.clone()), descriptor);
        if self.failing_applies.lock().contains(&descriptor.label) {
            return Err(ProvisioningError::apply_failed(&descriptor.label, "simulated apply failure"));
        }
        Ok(self.outputs.lock().get(&descriptor.label).cloned().unwrap_or_default())
    }

    async fn destroy(&self, descriptor: &InvocationDescriptor) -> Result<(), ProvisioningError> {
        self.record(EngineCall::Destroy(descriptor.label.clone()), descriptor);
        if self.failing_destroys.lock().contains(&descriptor.label) {
            return Err(ProvisioningError::destroy_failed(&descriptor.label, "simulated destroy failure"));
        }
        Ok(())
    }
}

/// A fixture copier that only records what it was asked to copy.
#[derive(Debug, Default)]
pub struct RecordingCopier {
    copies: Mutex<Vec<(String, PathBuf)>>,
}

impl RecordingCopier {
    /// Creates an empty copier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `(fixture, destination)` pairs copied, in order.
    #[must_use]
    pub fn copies(&self) -> Vec<(String, PathBuf)> {
        self.copies.lock().clone()
    }
}

impl FixtureCopier for RecordingCopier {
    fn copy(&self, fixture: &str, destination: &Path) -> io::Result<bool> {
        self.copies.lock().push((fixture.to_string(), destination.to_path_buf()));
        Ok(true)
    }
}

/// An in-memory bucket that records uploads and prefix deletions.
#[derive(Debug, Default)]
pub struct RecordingObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    deleted_prefixes: Mutex<Vec<String>>,
}

impl RecordingObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `bucket/key` names currently stored.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Returns an object's body parsed as JSON.
    #[must_use]
    pub fn json(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        let objects = self.objects.lock();
        let body = objects.get(&format!("{bucket}/{key}"))?;
        serde_json::from_slice(body).ok()
    }

    /// Returns the prefixes deleted, in order.
    #[must_use]
    pub fn deleted_prefixes(&self) -> Vec<String> {
        self.deleted_prefixes.lock().clone()
    }
}

#[async_trait]
impl RemoteObjectStore for RecordingObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _metadata: ObjectMetadata,
    ) -> Result<(), RemoteObjectError> {
        self.objects.lock().insert(format!("{bucket}/{key}"), body);
        Ok(())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, RemoteObjectError> {
        let full = format!("{bucket}/{prefix}");
        let mut objects = self.objects.lock();
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(&full));
        self.deleted_prefixes.lock().push(prefix.to_string());
        Ok(before - objects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_engine() {
        let engine = RecordingEngine::new()
            .with_outputs("network", [("vpc_id", "vpc-1")])
            .failing_destroy("network");
        let descriptor = InvocationDescriptor::new("network", "/tmp/network");

        let outputs = engine.apply(&descriptor).await.unwrap();
        assert_eq!(outputs["vpc_id"], "vpc-1");
        assert!(engine.destroy(&descriptor).await.is_err());

        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Apply("network".to_string()),
                EngineCall::Destroy("network".to_string()),
            ]
        );
        assert_eq!(engine.applied(), vec!["network"]);
        assert!(engine.last_descriptor("network").is_some());

        engine.reset();
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_recording_object_store() {
        let objects = RecordingObjectStore::new();
        objects
            .put_object("b", "runs/r1/network/vars.json", br#"{"a":1}"#.to_vec(), ObjectMetadata::new())
            .await
            .unwrap();
        objects
            .put_object("b", "runs/r2/network/vars.json", b"{}".to_vec(), ObjectMetadata::new())
            .await
            .unwrap();

        assert_eq!(objects.json("b", "runs/r1/network/vars.json"), Some(serde_json::json!({"a": 1})));
        assert_eq!(objects.delete_prefix("b", "runs/r1/").await.unwrap(), 1);
        assert_eq!(objects.keys(), vec!["b/runs/r2/network/vars.json"]);
        assert_eq!(objects.deleted_prefixes(), vec!["runs/r1/"]);
    }

    #[test]
    fn test_recording_copier() {
        let copier = RecordingCopier::new();
        assert!(copier.copy("test-eks", Path::new("/w/eks")).unwrap());
        assert_eq!(copier.copies(), vec![("test-eks".to_string(), PathBuf::from("/w/eks"))]);
    }
}
