//! Deployment plan model.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use crate::core::Provider;
use crate::errors::PlanValidationError;
use crate::provision::RetryPolicy;
use crate::state::FAMILY_ID_FILE;

// Stage names become directory names under the run and workspace roots.
fn stage_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("stage name regex"))
}

/// How an upstream output is handed to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// Passed as a string.
    #[default]
    Scalar,
    /// A comma-joined output passed as a list of strings.
    List,
    /// The first element of a comma-joined output, passed as a string.
    First,
}

/// A stage input read from an earlier stage's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    /// The producing stage.
    pub stage: String,
    /// The output key on the producing stage.
    pub key: String,
    /// The input variable it is passed as.
    pub var: String,
    /// How the value is shaped.
    #[serde(default)]
    pub shape: OutputShape,
}

/// The value of a stage input variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarValue {
    /// A literal value. Strings anywhere inside it may use the `{family_id}`
    /// and `{short_id}` placeholders.
    Value(serde_json::Value),
    /// A configuration value.
    Config {
        /// The configuration key.
        key: String,
        /// Used when the key is unset; unset without a default is an error.
        default: Option<String>,
    },
}

/// One provisioning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name; also the state and workspace directory name.
    pub name: String,
    /// Template fixture copied into the stage's workspace.
    pub fixture: String,
    /// Inputs read from earlier stages.
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    /// Input variables.
    #[serde(default)]
    pub vars: BTreeMap<String, VarValue>,
    /// Output keys that must be non-empty after apply.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Engine retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Variables for a second apply right after the first succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StageDefinition {
    /// Creates a stage built from a fixture.
    #[must_use]
    pub fn new(name: impl Into<String>, fixture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixture: fixture.into(),
            inputs: Vec::new(),
            vars: BTreeMap::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            follow_up: None,
        }
    }

    /// Reads `key` from `stage` into the variable of the same name.
    #[must_use]
    pub fn with_input(self, stage: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        self.with_input_as(stage, key.clone(), key, OutputShape::Scalar)
    }

    /// Reads a comma-joined `key` from `stage` into a list variable.
    #[must_use]
    pub fn with_list_input(self, stage: impl Into<String>, key: impl Into<String>, var: impl Into<String>) -> Self {
        self.with_input_as(stage, key, var, OutputShape::List)
    }

    /// Reads `key` from `stage` into `var`.
    #[must_use]
    pub fn with_input_as(
        mut self,
        stage: impl Into<String>,
        key: impl Into<String>,
        var: impl Into<String>,
        shape: OutputShape,
    ) -> Self {
        self.inputs.push(InputBinding {
            stage: stage.into(),
            key: key.into(),
            var: var.into(),
            shape,
        });
        self
    }

    /// Sets a literal variable.
    #[must_use]
    pub fn with_var(mut self, var: impl Into<String>, value: serde_json::Value) -> Self {
        self.vars.insert(var.into(), VarValue::Value(value));
        self
    }

    /// Sets a variable read from configuration.
    #[must_use]
    pub fn with_config_var(mut self, var: impl Into<String>, key: impl Into<String>) -> Self {
        self.vars.insert(
            var.into(),
            VarValue::Config {
                key: key.into(),
                default: None,
            },
        );
        self
    }

    /// Sets a variable read from configuration with a fallback.
    #[must_use]
    pub fn with_config_var_or(
        mut self,
        var: impl Into<String>,
        key: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        self.vars.insert(
            var.into(),
            VarValue::Config {
                key: key.into(),
                default: Some(default.into()),
            },
        );
        self
    }

    /// Adds required output keys.
    #[must_use]
    pub fn with_outputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets a follow-up apply with extra variables.
    #[must_use]
    pub fn with_follow_up(mut self, vars: serde_json::Map<String, serde_json::Value>) -> Self {
        self.follow_up = Some(vars);
        self
    }
}

/// An ordered chain of stages sharing one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantPipeline {
    /// Variant name.
    pub name: String,
    /// Stages in dependency order.
    pub stages: Vec<StageDefinition>,
}

impl VariantPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Returns the ordinal position of a stage.
    #[must_use]
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }
}

/// A network stage followed by independent variant pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Target provider.
    pub provider: Provider,
    /// The shared network stage.
    pub network: StageDefinition,
    /// Variant pipelines built on the network.
    pub variants: Vec<VariantPipeline>,
}

impl DeploymentPlan {
    /// Creates a plan with no variants.
    #[must_use]
    pub fn new(provider: Provider, network: StageDefinition) -> Self {
        Self {
            provider,
            network,
            variants: Vec::new(),
        }
    }

    /// Appends a variant pipeline.
    #[must_use]
    pub fn variant(mut self, variant: VariantPipeline) -> Self {
        self.variants.push(variant);
        self
    }

    /// Returns every stage name, network first.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        std::iter::once(self.network.name.as_str())
            .chain(self.variants.iter().flat_map(|v| v.stages.iter().map(|s| s.name.as_str())))
            .collect()
    }

    /// Checks that the plan is well formed.
    ///
    /// Stage and variant names must be unique, no variant may be empty, the
    /// network takes no inputs, and every input must come from the network or
    /// an earlier stage of the same variant.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        let mut seen = HashSet::new();
        for name in self.stage_names() {
            if name.is_empty() {
                return Err(PlanValidationError::new("stage names must not be empty"));
            }
            if !stage_name_pattern().is_match(name) {
                return Err(PlanValidationError::new(format!(
                    "stage name '{name}' may only contain letters, digits, '_' and '-'"
                ))
                .with_stages(vec![name.to_string()]));
            }
            if name == FAMILY_ID_FILE {
                return Err(PlanValidationError::new(format!("stage name '{name}' is reserved"))
                    .with_stages(vec![name.to_string()]));
            }
            if !seen.insert(name) {
                return Err(PlanValidationError::new(format!("duplicate stage name '{name}'"))
                    .with_stages(vec![name.to_string()]));
            }
        }

        if !self.network.inputs.is_empty() {
            return Err(PlanValidationError::new("the network stage cannot take inputs")
                .with_stages(vec![self.network.name.clone()]));
        }

        let mut variant_names = HashSet::new();
        for variant in &self.variants {
            if !variant_names.insert(variant.name.as_str()) {
                return Err(PlanValidationError::new(format!(
                    "duplicate variant name '{}'",
                    variant.name
                )));
            }
            if variant.stages.is_empty() {
                return Err(PlanValidationError::new(format!(
                    "variant '{}' has no stages",
                    variant.name
                )));
            }

            let mut available: HashSet<&str> = HashSet::from([self.network.name.as_str()]);
            for stage in &variant.stages {
                for input in &stage.inputs {
                    if !available.contains(input.stage.as_str()) {
                        return Err(PlanValidationError::new(format!(
                            "stage '{}' reads '{}' from '{}', which does not run before it",
                            stage.name, input.key, input.stage
                        ))
                        .with_stages(vec![stage.name.clone(), input.stage.clone()]));
                    }
                }
                available.insert(stage.name.as_str());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> DeploymentPlan {
        DeploymentPlan::new(
            Provider::Aws,
            StageDefinition::new("network", "test-networking").with_outputs(["vpc_id"]),
        )
        .variant(
            VariantPipeline::new("disk-enabled")
                .stage(StageDefinition::new("cluster", "test-eks").with_input("network", "vpc_id"))
                .stage(StageDefinition::new("database", "test-database").with_input("cluster", "cluster_name")),
        )
    }

    #[test]
    fn test_valid_plan() {
        let plan = plan();
        plan.validate().unwrap();
        assert_eq!(plan.stage_names(), vec!["network", "cluster", "database"]);
        assert_eq!(plan.variants[0].position("database"), Some(1));
    }

    #[test]
    fn test_rejects_duplicate_stage() {
        let plan = plan().variant(
            VariantPipeline::new("disk-disabled").stage(StageDefinition::new("cluster", "test-eks")),
        );
        let err = plan.validate().unwrap_err();
        assert!(err.message.contains("duplicate stage name 'cluster'"));
    }

    #[test]
    fn test_rejects_forward_reference() {
        let plan = DeploymentPlan::new(Provider::Aws, StageDefinition::new("network", "net")).variant(
            VariantPipeline::new("v")
                .stage(StageDefinition::new("database", "db").with_input("cluster", "cluster_name"))
                .stage(StageDefinition::new("cluster", "eks")),
        );
        let err = plan.validate().unwrap_err();
        assert_eq!(err.stages, vec!["database".to_string(), "cluster".to_string()]);
    }

    #[test]
    fn test_rejects_cross_variant_reference() {
        let plan = plan().variant(
            VariantPipeline::new("disk-disabled")
                .stage(StageDefinition::new("cluster-2", "test-eks").with_input("cluster", "cluster_name")),
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_rejects_path_like_stage_names() {
        for name in ["../escape", "a/b", ".hidden", "has space"] {
            let plan = plan().variant(VariantPipeline::new("bad").stage(StageDefinition::new(name, "test-eks")));
            let err = plan.validate().unwrap_err();
            assert_eq!(err.stages, vec![name.to_string()], "{name}");
        }
    }

    #[test]
    fn test_rejects_reserved_stage_name() {
        let plan = plan().variant(
            VariantPipeline::new("bad").stage(StageDefinition::new(FAMILY_ID_FILE, "test-eks")),
        );
        assert!(plan.validate().unwrap_err().message.contains("reserved"));
    }

    #[test]
    fn test_rejects_empty_variant() {
        let plan = plan().variant(VariantPipeline::new("empty"));
        assert!(plan.validate().unwrap_err().message.contains("no stages"));
    }

    #[test]
    fn test_list_input_shape() {
        let stage = StageDefinition::new("cluster", "eks").with_list_input("network", "private_subnet_ids", "subnet_ids");
        assert_eq!(stage.inputs[0].shape, OutputShape::List);
        assert_eq!(stage.inputs[0].var, "subnet_ids");

        let stage = stage.with_input_as("network", "subnets_names", "subnet_name", OutputShape::First);
        assert_eq!(stage.inputs[1].shape, OutputShape::First);
    }
}
