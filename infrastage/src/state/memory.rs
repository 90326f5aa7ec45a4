//! In-memory stage state.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{RunPath, StagePath, StageStateStore};
use crate::core::Provider;
use crate::errors::Result;
use crate::identity::FamilyId;
use crate::provision::{InvocationDescriptor, StageOutputs};

#[derive(Debug, Default)]
struct Slot {
    invocation: Option<InvocationDescriptor>,
    outputs: StageOutputs,
}

#[derive(Debug, Default)]
struct Inner {
    stages: HashMap<StagePath, Slot>,
    family_ids: HashMap<RunPath, FamilyId>,
    /// Last modification sequence number per run.
    touched: HashMap<RunPath, u64>,
    sequence: u64,
}

impl Inner {
    fn touch(&mut self, run: &RunPath) {
        self.sequence += 1;
        self.touched.insert(run.clone(), self.sequence);
    }
}

/// Stage state kept in process memory.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stages with a persisted record or outputs.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.inner.lock().stages.len()
    }

    /// Returns the names of stages of `run` that currently hold an invocation.
    #[must_use]
    pub fn live_stages(&self, run: &RunPath) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .stages
            .iter()
            .filter(|(path, slot)| &path.run == run && slot.invocation.is_some())
            .map(|(path, _)| path.stage.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StageStateStore for InMemoryStateStore {
    async fn put(&self, stage: &StagePath, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .stages
            .entry(stage.clone())
            .or_default()
            .outputs
            .insert(key.to_string(), value.to_string());
        inner.touch(&stage.run);
        Ok(())
    }

    async fn get(&self, stage: &StagePath, key: &str) -> Result<String> {
        let inner = self.inner.lock();
        Ok(inner
            .stages
            .get(stage)
            .and_then(|slot| slot.outputs.get(key).cloned())
            .unwrap_or_default())
    }

    async fn outputs(&self, stage: &StagePath) -> Result<StageOutputs> {
        let inner = self.inner.lock();
        Ok(inner.stages.get(stage).map(|slot| slot.outputs.clone()).unwrap_or_default())
    }

    async fn put_invocation(&self, stage: &StagePath, descriptor: &InvocationDescriptor) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stages.entry(stage.clone()).or_default().invocation = Some(descriptor.clone());
        inner.touch(&stage.run);
        Ok(())
    }

    async fn get_invocation(&self, stage: &StagePath) -> Result<Option<InvocationDescriptor>> {
        let inner = self.inner.lock();
        Ok(inner.stages.get(stage).and_then(|slot| slot.invocation.clone()))
    }

    async fn remove_stage(&self, stage: &StagePath) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stages.remove(stage).is_some() {
            inner.touch(&stage.run);
        }
        Ok(())
    }

    async fn put_family_id(&self, run: &RunPath, id: &FamilyId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.family_ids.insert(run.clone(), id.clone());
        inner.touch(run);
        Ok(())
    }

    async fn get_family_id(&self, run: &RunPath) -> Result<Option<FamilyId>> {
        Ok(self.inner.lock().family_ids.get(run).cloned())
    }

    async fn remove_run(&self, run: &RunPath) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stages.retain(|path, _| &path.run != run);
        inner.family_ids.remove(run);
        inner.touched.remove(run);
        Ok(())
    }

    async fn latest_run(&self, provider: Provider) -> Result<Option<RunPath>> {
        let inner = self.inner.lock();
        Ok(inner
            .touched
            .iter()
            .filter(|(run, _)| run.provider == provider)
            .max_by_key(|(_, sequence)| **sequence)
            .map(|(run, _)| run.clone()))
    }
}
