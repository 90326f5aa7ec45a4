//! Testing utilities for staged deployments.
//!
//! This module provides:
//! - A provisioning engine that records calls instead of provisioning
//! - A fixture copier that records copies instead of touching the disk
//! - An in-memory bucket standing in for remote object storage
//! - A small plan and config harness for orchestration tests

mod mocks;

pub use mocks::{EngineCall, RecordingCopier, RecordingEngine, RecordingObjectStore};

use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::core::Provider;
use crate::events::CollectingEventSink;
use crate::orchestrator::{DeploymentPlan, StageDefinition, StagedDeployment, VariantPipeline};
use crate::state::InMemoryStateStore;

/// A plan with one network and one `cluster → database → app` variant.
///
/// Each stage requires a single output, readable by the next stage.
#[must_use]
pub fn linear_plan(provider: Provider) -> DeploymentPlan {
    DeploymentPlan::new(
        provider,
        StageDefinition::new("network", "test-networking").with_outputs(["vpc_id"]),
    )
    .variant(
        VariantPipeline::new("default")
            .stage(
                StageDefinition::new("cluster", "test-cluster")
                    .with_input("network", "vpc_id")
                    .with_outputs(["cluster_name"]),
            )
            .stage(
                StageDefinition::new("database", "test-database")
                    .with_input("network", "vpc_id")
                    .with_input("cluster", "cluster_name")
                    .with_outputs(["database_endpoint"]),
            )
            .stage(
                StageDefinition::new("app", "test-app")
                    .with_input("cluster", "cluster_name")
                    .with_input("database", "database_endpoint"),
            ),
    )
}

/// An engine returning the outputs [`linear_plan`] stages require.
#[must_use]
pub fn linear_engine() -> RecordingEngine {
    RecordingEngine::new()
        .with_outputs("network", [("vpc_id", "vpc-123")])
        .with_outputs("cluster", [("cluster_name", "eks-1")])
        .with_outputs("database", [("database_endpoint", "db.local:5432")])
}

/// Everything an orchestration test inspects.
pub struct Harness {
    /// The deployment under test.
    pub deployment: StagedDeployment,
    /// The engine it drives.
    pub engine: Arc<RecordingEngine>,
    /// Its state store.
    pub store: Arc<InMemoryStateStore>,
    /// Its fixture copier.
    pub copier: Arc<RecordingCopier>,
    /// Its remote object store.
    pub objects: Arc<RecordingObjectStore>,
    /// Every event it emitted.
    pub events: Arc<CollectingEventSink>,
}

impl Harness {
    /// Builds a deployment with in-memory state and recording doubles.
    pub fn new(
        plan: DeploymentPlan,
        config: OrchestratorConfig,
        engine: RecordingEngine,
    ) -> crate::errors::Result<Self> {
        Self::with_store(plan, config, engine, Arc::new(InMemoryStateStore::new()))
    }

    /// Builds a deployment sharing an existing store.
    pub fn with_store(
        plan: DeploymentPlan,
        config: OrchestratorConfig,
        engine: RecordingEngine,
        store: Arc<InMemoryStateStore>,
    ) -> crate::errors::Result<Self> {
        let engine = Arc::new(engine);
        let copier = Arc::new(RecordingCopier::new());
        let objects = Arc::new(RecordingObjectStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let deployment = StagedDeployment::new(plan, config, engine.clone())?
            .with_store(store.clone())
            .with_copier(copier.clone())
            .with_object_store(objects.clone())
            .with_sink(events.clone());
        Ok(Self {
            deployment,
            engine,
            store,
            copier,
            objects,
            events,
        })
    }
}
