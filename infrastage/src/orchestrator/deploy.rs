//! Staged deployment execution and teardown.

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::phase::RunPhase;
use super::plan::{DeploymentPlan, OutputShape, StageDefinition, VarValue, VariantPipeline};
#[cfg(feature = "s3")]
use crate::backend::S3ObjectStore;
use crate::backend::{select_backend, BackendSelection, RemoteObjectStore};
use crate::config::OrchestratorConfig;
use crate::core::{StageEvent, StageStatus};
use crate::errors::{
    ConfigError, InfrastageError, MissingOutputError, ProvisioningError, Result, ResumeLookupError,
};
use crate::events::{EventSink, LoggingEventSink};
use crate::identity::{self, FamilyId, NamingRule};
use crate::provision::{
    run_workspace, stage_workspace, DirFixtureCopier, FixtureCopier, InvocationDescriptor,
    ProvisioningEngine, StageOutputs,
};
use crate::runner::{cleanup_step, setup_step, StageRunner};
use crate::state::{FileStateStore, RunPath, StagePath, StageStateStore};

/// The run an orchestration is operating on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRun {
    /// Where the run's state lives.
    pub run: RunPath,
    /// The run's family id.
    pub family_id: FamilyId,
}

/// The result of [`StagedDeployment::deploy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    /// The run that was deployed.
    pub run: ActiveRun,
    /// True if an existing network was reused.
    pub network_reused: bool,
    /// Stages applied in this invocation, in completion order.
    pub created: Vec<String>,
    /// Stages that were not applied (skipped or already applied).
    pub skipped: Vec<String>,
}

/// The outcome of tearing down one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownEntry {
    /// The stage name.
    pub stage: String,
    /// `Destroyed`, `Absent`, `Skipped` or `Failed`.
    pub status: StageStatus,
    /// The failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TeardownEntry {
    fn new(stage: &str, status: StageStatus) -> Self {
        Self {
            stage: stage.to_string(),
            status,
            error: None,
        }
    }

    fn failed(stage: &str, error: String) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Failed,
            error: Some(error),
        }
    }
}

/// Everything teardown did, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// One entry per stage, in teardown order.
    pub entries: Vec<TeardownEntry>,
    /// True if the run's state directory was removed.
    pub run_removed: bool,
}

impl TeardownReport {
    fn stages_with(&self, status: StageStatus) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.stage.clone())
            .collect()
    }

    /// Stages that were destroyed, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.stages_with(StageStatus::Destroyed)
    }

    /// Stages that had nothing to destroy.
    #[must_use]
    pub fn absent(&self) -> Vec<String> {
        self.stages_with(StageStatus::Absent)
    }

    /// Stages whose teardown step was skipped.
    #[must_use]
    pub fn skipped(&self) -> Vec<String> {
        self.stages_with(StageStatus::Skipped)
    }

    /// Stages whose teardown failed.
    #[must_use]
    pub fn failed(&self) -> Vec<String> {
        self.stages_with(StageStatus::Failed)
    }

    /// Returns the status recorded for a stage.
    #[must_use]
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.entries.iter().find(|e| e.stage == stage).map(|e| e.status)
    }

    /// True if nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| !e.status.is_failure())
    }

    /// True if every stage is gone (destroyed or never created).
    #[must_use]
    pub fn all_gone(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.status, StageStatus::Destroyed | StageStatus::Absent))
    }
}

/// Drives a [`DeploymentPlan`] through setup and teardown.
pub struct StagedDeployment {
    plan: DeploymentPlan,
    config: OrchestratorConfig,
    engine: Arc<dyn ProvisioningEngine>,
    store: Arc<dyn StageStateStore>,
    copier: Arc<dyn FixtureCopier>,
    sink: Arc<dyn EventSink>,
    objects: Option<Arc<dyn RemoteObjectStore>>,
    runner: StageRunner,
    phase: Mutex<RunPhase>,
    active: Mutex<Option<ActiveRun>>,
}

impl std::fmt::Debug for StagedDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedDeployment")
            .field("provider", &self.plan.provider)
            .field("phase", &*self.phase.lock())
            .field("active", &*self.active.lock())
            .finish_non_exhaustive()
    }
}

fn render(value: &serde_json::Value, family_id: &FamilyId) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(
            s.replace("{family_id}", family_id.as_str())
                .replace("{short_id}", family_id.short_id()),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render(v, family_id)).collect())
        }
        serde_json::Value::Object(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render(v, family_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn shape(value: &str, shape: OutputShape) -> serde_json::Value {
    match shape {
        OutputShape::Scalar => serde_json::Value::String(value.to_string()),
        OutputShape::List => serde_json::Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| serde_json::Value::String(v.to_string()))
                .collect(),
        ),
        OutputShape::First => serde_json::Value::String(
            value
                .split(',')
                .map(str::trim)
                .find(|v| !v.is_empty())
                .unwrap_or_default()
                .to_string(),
        ),
    }
}

async fn remove_workspace(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => info!(path = %path.display(), "🧹 Workspace cleaned up"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "⚠️ Failed to clean up workspace"),
    }
}

impl StagedDeployment {
    /// Creates a deployment backed by the filesystem state store and the
    /// directory fixture copier rooted at the configured paths.
    pub fn new(
        plan: DeploymentPlan,
        config: OrchestratorConfig,
        engine: Arc<dyn ProvisioningEngine>,
    ) -> Result<Self> {
        plan.validate()?;
        let sink: Arc<dyn EventSink> = Arc::new(LoggingEventSink::default());
        let runner = StageRunner::new(plan.provider, config.skips.clone()).with_sink(sink.clone());

        #[cfg(feature = "s3")]
        let objects: Option<Arc<dyn RemoteObjectStore>> = if config.backend.enabled {
            Some(Arc::new(S3ObjectStore::from_settings(&config.backend)?))
        } else {
            None
        };
        #[cfg(not(feature = "s3"))]
        let objects: Option<Arc<dyn RemoteObjectStore>> = None;

        Ok(Self {
            store: Arc::new(FileStateStore::new(config.state_root.clone())),
            copier: Arc::new(DirFixtureCopier::new(config.fixtures_root.clone())),
            plan,
            config,
            engine,
            sink,
            objects,
            runner,
            phase: Mutex::new(RunPhase::NotStarted),
            active: Mutex::new(None),
        })
    }

    /// Replaces the state store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StageStateStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the fixture copier.
    #[must_use]
    pub fn with_copier(mut self, copier: Arc<dyn FixtureCopier>) -> Self {
        self.copier = copier;
        self
    }

    /// Replaces the store variable documents are uploaded to when the remote
    /// backend is enabled.
    #[must_use]
    pub fn with_object_store(mut self, objects: Arc<dyn RemoteObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.runner = StageRunner::new(self.plan.provider, self.config.skips.clone()).with_sink(sink.clone());
        self.sink = sink;
        self
    }

    /// Returns the plan.
    #[must_use]
    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase.lock().clone()
    }

    /// Returns the run being operated on, if one was created or located.
    #[must_use]
    pub fn active_run(&self) -> Option<ActiveRun> {
        self.active.lock().clone()
    }

    fn transition(&self, next: RunPhase) -> Result<()> {
        self.phase.lock().transition(next)
    }

    /// Provisions the network and every variant.
    ///
    /// The network is reused instead of created when reuse is configured or
    /// its setup step is skipped. Any stage failure aborts the remaining
    /// stages; already created resources stay recorded for teardown.
    pub async fn deploy(&self) -> Result<DeploymentSummary> {
        let network_step = setup_step(&self.plan.network.name);
        let network_reused = self.config.use_existing_network || self.runner.is_skipped(&network_step);

        let active = if network_reused {
            self.use_existing().await?
        } else {
            match self.runner.run_stage(&network_step, || self.create_network()).await? {
                Some(active) => active,
                None => self.active_run().ok_or_else(|| InfrastageError::Phase {
                    from: self.phase().to_string(),
                    to: RunPhase::NetworkReady.to_string(),
                })?,
            }
        };

        let mut created = Vec::new();
        let mut skipped = Vec::new();
        if !network_reused {
            created.push(self.plan.network.name.clone());
        }

        let total = self.plan.variants.len();
        if total > 0 {
            self.transition(RunPhase::VariantPending { completed: 0, total })?;
            let outcomes = if self.config.parallel_variants {
                info!(variants = total, "Provisioning variants concurrently");
                let results = try_join_all(
                    self.plan
                        .variants
                        .iter()
                        .map(|variant| self.run_variant(&active, variant)),
                )
                .await?;
                self.transition(RunPhase::VariantPending { completed: total, total })?;
                results.into_iter().flatten().collect::<Vec<_>>()
            } else {
                let mut all = Vec::new();
                for (index, variant) in self.plan.variants.iter().enumerate() {
                    all.extend(self.run_variant(&active, variant).await?);
                    self.transition(RunPhase::VariantPending {
                        completed: index + 1,
                        total,
                    })?;
                }
                all
            };

            for (stage, applied) in outcomes {
                if applied {
                    created.push(stage);
                } else {
                    skipped.push(stage);
                }
            }
        }
        self.transition(RunPhase::VariantsComplete)?;

        info!(family_id = %active.family_id, created = created.len(), "✅ Deployment complete");
        Ok(DeploymentSummary {
            run: active,
            network_reused,
            created,
            skipped,
        })
    }

    async fn run_variant(&self, active: &ActiveRun, variant: &VariantPipeline) -> Result<Vec<(String, bool)>> {
        info!(variant = %variant.name, "Running {} setup", variant.name);
        let mut outcomes = Vec::with_capacity(variant.stages.len());
        for stage in &variant.stages {
            let applied = self
                .runner
                .run_stage(&setup_step(&stage.name), || self.apply_stage(active, stage))
                .await?
                .is_some();
            outcomes.push((stage.name.clone(), applied));
        }
        info!(variant = %variant.name, "✅ {} setup completed", variant.name);
        Ok(outcomes)
    }

    async fn create_network(&self) -> Result<ActiveRun> {
        let family_id = identity::generate(&NamingRule::for_provider(self.plan.provider));
        let run = RunPath::new(self.plan.provider, family_id.as_str());
        info!(family_id = %family_id, state = %run, "🏷️ Infrastructure ID");

        self.store.put_family_id(&run, &family_id).await?;
        let active = ActiveRun { run, family_id };
        // Recorded before apply so teardown can find a half-created network.
        *self.active.lock() = Some(active.clone());

        self.apply_stage(&active, &self.plan.network).await?;
        self.transition(RunPhase::NetworkReady)?;
        Ok(active)
    }

    /// Locates the run to resume: the configured run id, otherwise the most
    /// recently modified run of the provider.
    ///
    /// The most-recent heuristic assumes a single orchestrator per state
    /// root; two concurrent runs may pick up each other's networks.
    async fn locate_run(&self) -> Result<ActiveRun> {
        let provider = self.plan.provider;
        let location = self.config.state_root.join(provider.as_str()).display().to_string();

        let run = match &self.config.resume_run_id {
            Some(run_id) => RunPath::new(provider, run_id.clone()),
            None => self
                .store
                .latest_run(provider)
                .await?
                .ok_or_else(|| ResumeLookupError::new(&location, "no previous run found"))?,
        };

        let family_id = self.store.get_family_id(&run).await?.ok_or_else(|| {
            ResumeLookupError::new(run.to_string(), "family id not found; run the network stage first")
        })?;
        Ok(ActiveRun { run, family_id })
    }

    /// Reuses the network of a previous run.
    ///
    /// Fails if no run can be located or if any required network output is
    /// empty.
    pub async fn use_existing(&self) -> Result<ActiveRun> {
        let active = self.locate_run().await?;
        let network = active.run.stage(&self.plan.network.name);

        for key in &self.plan.network.outputs {
            if self.store.get(&network, key).await?.is_empty() {
                return Err(ResumeLookupError::new(
                    active.run.to_string(),
                    format!("cannot skip network creation: '{key}' is empty"),
                )
                .into());
            }
        }

        info!(family_id = %active.family_id, run = %active.run, "♻️ Skipping network creation, using existing");
        self.sink
            .emit(StageEvent::reused(&self.plan.network.name, &active.run.run_id))
            .await;

        *self.active.lock() = Some(active.clone());
        if self.phase() == RunPhase::NotStarted {
            self.transition(RunPhase::NetworkReady)?;
        }
        Ok(active)
    }

    fn resolve_vars(
        &self,
        stage: &StageDefinition,
        family_id: &FamilyId,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut vars = serde_json::Map::new();
        for (name, value) in &stage.vars {
            let resolved = match value {
                VarValue::Value(v) => render(v, family_id),
                VarValue::Config { key, default } => {
                    match self.config.value(key).or(default.as_deref()) {
                        Some(v) => serde_json::Value::String(v.to_string()),
                        None => return Err(ConfigError::missing_critical(key).into()),
                    }
                }
            };
            vars.insert(name.clone(), resolved);
        }
        Ok(vars)
    }

    async fn load_inputs(
        &self,
        active: &ActiveRun,
        stage: &StageDefinition,
        vars: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        for input in &stage.inputs {
            let value = self.store.get(&active.run.stage(&input.stage), &input.key).await?;
            if value.trim().is_empty() {
                return Err(MissingOutputError::new(&input.stage, &input.key, &stage.name).into());
            }
            vars.insert(input.var.clone(), shape(&value, input.shape));
        }
        Ok(())
    }

    async fn apply_stage(&self, active: &ActiveRun, stage: &StageDefinition) -> Result<StageOutputs> {
        let start = Instant::now();
        let path = active.run.stage(&stage.name);

        let mut vars = self.resolve_vars(stage, &active.family_id)?;
        self.load_inputs(active, stage, &mut vars).await?;

        let workspace = stage_workspace(&self.config.workspace_root, &active.family_id, &stage.name);
        self.copier.copy(&stage.fixture, &workspace)?;

        let backend = select_backend(&self.config.backend, self.plan.provider, &stage.name, &active.run.run_id)?;
        if backend.is_remote() {
            info!(stage = %stage.name, "☁️ Using remote state backend");
        }

        let mut descriptor = InvocationDescriptor::new(&stage.name, workspace)
            .with_backend_config(backend.backend_config())
            .with_retry(stage.retry.clone());
        descriptor.merge_vars(&vars);

        // Persisted before apply so a partial apply can still be destroyed.
        self.store.put_invocation(&path, &descriptor).await?;
        self.upload_vars(&backend, active, &descriptor).await;

        info!(stage = %stage.name, family_id = %active.family_id, "🔧 Applying stage");
        let mut outputs = self.engine.apply(&descriptor).await?;

        if let Some(follow_up) = &stage.follow_up {
            info!(stage = %stage.name, "🔧 Applying follow-up phase");
            descriptor.merge_vars(follow_up);
            self.store.put_invocation(&path, &descriptor).await?;
            self.upload_vars(&backend, active, &descriptor).await;
            outputs = self.engine.apply(&descriptor).await?;
        }

        for key in &stage.outputs {
            if outputs.get(key).map_or(true, |v| v.trim().is_empty()) {
                return Err(ProvisioningError::InvalidOutputs {
                    label: stage.name.clone(),
                    reason: format!("required output '{key}' is empty"),
                }
                .into());
            }
        }

        self.store.put_outputs(&path, &outputs).await?;
        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = start.elapsed().as_millis() as f64;
        self.sink.emit(StageEvent::completed(&stage.name, elapsed_ms)).await;
        info!(stage = %stage.name, outputs = outputs.len(), "✅ Stage created");
        Ok(outputs)
    }

    /// Tears everything down in reverse order: variants last to first, each
    /// variant's stages last to first, then the network.
    ///
    /// Stages that never ran are reported as absent. Failures are recorded
    /// and teardown continues. The run's state is removed only once every
    /// stage is gone.
    pub async fn teardown(&self) -> Result<TeardownReport> {
        let active = match self.active_run() {
            Some(active) => Some(active),
            None => match self.locate_run().await {
                Ok(active) => Some(active),
                Err(InfrastageError::ResumeLookup(err)) => {
                    info!(reason = %err, "♻️ No run to tear down");
                    None
                }
                Err(err) => return Err(err),
            },
        };

        let stages: Vec<&StageDefinition> = self
            .plan
            .variants
            .iter()
            .rev()
            .flat_map(|variant| variant.stages.iter().rev())
            .chain(std::iter::once(&self.plan.network))
            .collect();

        let mut report = TeardownReport::default();
        for stage in stages {
            let entry = match &active {
                Some(active) => self.teardown_stage(active, stage).await,
                None => {
                    self.sink.emit(StageEvent::absent(&stage.name)).await;
                    TeardownEntry::new(&stage.name, StageStatus::Absent)
                }
            };
            report.entries.push(entry);
        }

        if let Some(active) = &active {
            if report.all_gone() {
                info!(run = %active.run, "🗂️ Removing state directory");
                self.store.remove_run(&active.run).await?;
                remove_workspace(&run_workspace(&self.config.workspace_root, &active.family_id)).await;
                self.cleanup_remote_objects(active).await;
                report.run_removed = true;
                *self.active.lock() = None;
            } else {
                warn!(
                    run = %active.run,
                    failed = ?report.failed(),
                    skipped = ?report.skipped(),
                    "Keeping state directory; some stages still exist"
                );
            }
        }

        self.transition(RunPhase::TornDown)?;
        Ok(report)
    }

    /// Uploads a stage's variable document next to its remote state.
    /// Failures are logged and never fail the stage.
    async fn upload_vars(&self, backend: &BackendSelection, active: &ActiveRun, descriptor: &InvocationDescriptor) {
        let (BackendSelection::Remote(remote), Some(objects)) = (backend, &self.objects) else {
            return;
        };
        let body = match serde_json::to_vec_pretty(&descriptor.vars) {
            Ok(body) => body,
            Err(err) => {
                warn!(stage = %descriptor.label, error = %err, "⚠️ Failed to encode variables for upload");
                return;
            }
        };
        let metadata = remote.tfvars_metadata(self.plan.provider, &descriptor.label, &active.run.run_id);
        if let Err(err) = objects.put_object(&remote.bucket, &remote.tfvars_key, body, metadata).await {
            warn!(stage = %descriptor.label, error = %err, "⚠️ Failed to upload variables (non-fatal)");
        }
    }

    /// Deletes every remote object of a fully torn down run.
    async fn cleanup_remote_objects(&self, active: &ActiveRun) {
        let Some(objects) = &self.objects else {
            return;
        };
        let remote = match select_backend(
            &self.config.backend,
            self.plan.provider,
            &self.plan.network.name,
            &active.run.run_id,
        ) {
            Ok(BackendSelection::Remote(remote)) => remote,
            Ok(BackendSelection::Local) => return,
            Err(err) => {
                warn!(error = %err, "⚠️ Remote backend settings unusable, skipping remote cleanup");
                return;
            }
        };
        match objects.delete_prefix(&remote.bucket, &remote.run_prefix).await {
            Ok(deleted) => info!(prefix = %remote.run_prefix, deleted, "✅ Remote objects cleanup completed"),
            Err(err) => warn!(error = %err, "⚠️ Failed to clean up remote objects (non-fatal)"),
        }
    }

    async fn teardown_stage(&self, active: &ActiveRun, stage: &StageDefinition) -> TeardownEntry {
        let step = cleanup_step(&stage.name);
        let path = active.run.stage(&stage.name);

        let outcome = self
            .runner
            .run_stage(&step, || async { Ok(self.destroy_stage(&path).await) })
            .await;

        match outcome {
            Ok(Some(entry)) => entry,
            Ok(None) if self.runner.is_skipped(&step) => TeardownEntry::new(&stage.name, StageStatus::Skipped),
            // Already ran on this instance; the stored record decides what is left.
            Ok(None) => self.destroy_stage(&path).await,
            Err(err) => TeardownEntry::failed(&stage.name, err.to_string()),
        }
    }

    async fn destroy_stage(&self, path: &StagePath) -> TeardownEntry {
        let stage = path.stage.as_str();
        info!(stage = %stage, "🗑️ Cleaning up stage");

        let descriptor = match self.store.get_invocation(path).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                info!(stage = %stage, "♻️ No stage to clean up (was not created)");
                self.sink.emit(StageEvent::absent(stage)).await;
                return TeardownEntry::new(stage, StageStatus::Absent);
            }
            Err(err) => {
                warn!(stage = %stage, error = %err, "⚠️ Failed to load stage record");
                self.sink.emit(StageEvent::failed(stage, &err.to_string())).await;
                return TeardownEntry::failed(stage, err.to_string());
            }
        };

        if let Err(err) = self.engine.destroy(&descriptor).await {
            warn!(stage = %stage, error = %err, "❌ Destroy failed, continuing teardown");
            self.sink.emit(StageEvent::failed(stage, &err.to_string())).await;
            return TeardownEntry::failed(stage, err.to_string());
        }

        if let Err(err) = self.store.remove_stage(path).await {
            warn!(stage = %stage, error = %err, "⚠️ Failed to remove stage record");
        }
        remove_workspace(&descriptor.template_dir).await;

        self.sink.emit(StageEvent::destroyed(stage)).await;
        info!(stage = %stage, "✅ Stage cleanup completed");
        TeardownEntry::new(stage, StageStatus::Destroyed)
    }
}
