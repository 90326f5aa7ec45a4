//! Staged deployment orchestration.
//!
//! A [`DeploymentPlan`] is one shared network stage followed by independent
//! [`VariantPipeline`]s. [`StagedDeployment`] provisions it stage by stage,
//! persisting every invocation so a later process can resume from the
//! network or tear everything down in reverse order.

mod deploy;
mod phase;
mod plan;
pub mod presets;


pub use deploy::{ActiveRun, DeploymentSummary, StagedDeployment, TeardownEntry, TeardownReport};
pub use phase::RunPhase;
pub use plan::{DeploymentPlan, InputBinding, OutputShape, StageDefinition, VarValue, VariantPipeline};
