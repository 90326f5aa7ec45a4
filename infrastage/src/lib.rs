//! # Infrastage
//!
//! Staged, resumable orchestration of multi-stage infrastructure
//! provisioning tests.
//!
//! A deployment is a shared network stage followed by independent variant
//! pipelines (cluster, database, application). Infrastage provides:
//!
//! - **Run identity**: one provider-compliant family id per run, threaded
//!   through every resource name
//! - **Persisted stage state**: invocations and outputs recorded per stage so
//!   a later process can resume or tear down
//! - **Skippable stages**: `SKIP_<step>` toggles for every setup and cleanup
//!   step
//! - **Remote state**: optional S3 backend configuration per stage, with
//!   variable documents uploaded alongside and removed after teardown
//! - **Fault-tolerant teardown**: reverse order, absent stages are no-ops,
//!   failures are recorded and teardown continues
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use infrastage::prelude::*;
//!
//! let config = OrchestratorConfig::from_env(Path::new("."))?;
//! config.check(&presets::required_config(Provider::Aws))?;
//!
//! let deployment = StagedDeployment::new(
//!     presets::aws(),
//!     config,
//!     Arc::new(TerraformCli::new()),
//! )?;
//!
//! let summary = deployment.deploy().await?;
//! let report = deployment.teardown().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod identity;
pub mod observability;
pub mod orchestrator;
pub mod provision;
pub mod runner;
pub mod state;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{select_backend, BackendSelection, BackendSettings, RemoteObjectStore};
    #[cfg(feature = "s3")]
    pub use crate::backend::S3ObjectStore;
    pub use crate::config::{ConfigEntry, ConfigKind, OrchestratorConfig};
    pub use crate::core::{Provider, StageEvent, StageStatus};
    pub use crate::errors::{
        ConfigError, InfrastageError, MissingOutputError, PlanValidationError,
        ProvisioningError, RemoteObjectError, ResumeLookupError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::identity::{FamilyId, NamingRule};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{
        presets, DeploymentPlan, DeploymentSummary, RunPhase, StageDefinition,
        StagedDeployment, TeardownReport, VariantPipeline,
    };
    pub use crate::provision::{
        DirFixtureCopier, FixtureCopier, InvocationDescriptor, ProvisioningEngine,
        RetryPolicy, StageOutputs,
    };
    #[cfg(feature = "terraform")]
    pub use crate::provision::TerraformCli;
    pub use crate::runner::{SkipSignals, StageRunner};
    pub use crate::state::{
        FileStateStore, InMemoryStateStore, RunPath, StagePath, StageStateStore,
    };
}
