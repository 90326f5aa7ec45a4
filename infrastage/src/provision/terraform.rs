//! `terraform` command-line engine.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{InvocationDescriptor, ProvisioningEngine, RetryPolicy, StageOutputs};
use crate::errors::ProvisioningError;

const VAR_FILE: &str = "terraform.tfvars.json";

/// Drives the `terraform` binary in a stage's template directory.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
    envs: BTreeMap<String, String>,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of one command invocation.
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

impl TerraformCli {
    /// Creates an engine that runs `terraform` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "terraform".to_string(),
            envs: BTreeMap::new(),
        }
    }

    /// Uses a different binary (e.g. `tofu` or an absolute path).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Adds environment variables passed to every command, e.g. values
    /// loaded from an env file that are not in the process environment.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    async fn exec(&self, dir: &Path, args: &[String]) -> Result<CommandOutput, ProvisioningError> {
        debug!(binary = %self.binary, dir = %dir.display(), args = ?args, "Running command");
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .envs(&self.envs)
            .env("TF_INPUT", "0")
            .output()
            .await
            .map_err(|e| ProvisioningError::Spawn {
                program: self.binary.clone(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs a command, retrying while its output matches a retryable pattern.
    ///
    /// Returns stdout on success, or the last combined output and the number
    /// of attempts made on failure.
    async fn exec_with_retry(
        &self,
        descriptor: &InvocationDescriptor,
        args: &[String],
    ) -> Result<Result<String, (String, u32)>, ProvisioningError> {
        let retry = &descriptor.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let output = self.exec(&descriptor.template_dir, args).await?;
            if output.success {
                return Ok(Ok(output.stdout));
            }

            let combined = output.combined();
            match retryable_reason(retry, &combined) {
                Some(reason) if attempts <= retry.max_retries => {
                    warn!(
                        stage = %descriptor.label,
                        attempt = attempts,
                        reason = %reason,
                        "Retryable provisioning error, retrying"
                    );
                    tokio::time::sleep(retry.delay()).await;
                }
                _ => return Ok(Err((combined, attempts))),
            }
        }
    }

    fn common_flags(descriptor: &InvocationDescriptor) -> Vec<String> {
        let mut flags = vec!["-input=false".to_string()];
        if descriptor.no_color {
            flags.push("-no-color".to_string());
        }
        flags
    }

    async fn init(&self, descriptor: &InvocationDescriptor) -> Result<(), ProvisioningError> {
        let mut args = vec!["init".to_string(), "-reconfigure".to_string()];
        args.extend(Self::common_flags(descriptor));
        if let Some(config) = &descriptor.backend_config {
            for (key, value) in config {
                args.push(format!("-backend-config={key}={value}"));
            }
        }

        match self.exec_with_retry(descriptor, &args).await? {
            Ok(_) => Ok(()),
            Err((output, attempts)) => Err(ProvisioningError::ApplyFailed {
                label: descriptor.label.clone(),
                reason: format!("init: {}", last_lines(&output)),
                attempts,
            }),
        }
    }

    async fn write_var_file(descriptor: &InvocationDescriptor) -> Result<(), ProvisioningError> {
        let body = serde_json::to_vec_pretty(&descriptor.vars).map_err(|e| {
            ProvisioningError::apply_failed(&descriptor.label, format!("encode variables: {e}"))
        })?;
        tokio::fs::write(descriptor.template_dir.join(VAR_FILE), body)
            .await
            .map_err(|e| ProvisioningError::apply_failed(&descriptor.label, format!("write {VAR_FILE}: {e}")))
    }

    async fn read_outputs(&self, descriptor: &InvocationDescriptor) -> Result<StageOutputs, ProvisioningError> {
        let args = vec!["output".to_string(), "-json".to_string(), "-no-color".to_string()];
        let output = self.exec(&descriptor.template_dir, &args).await?;
        if !output.success {
            return Err(ProvisioningError::InvalidOutputs {
                label: descriptor.label.clone(),
                reason: last_lines(&output.combined()),
            });
        }

        let raw: serde_json::Value =
            serde_json::from_str(&output.stdout).map_err(|e| ProvisioningError::InvalidOutputs {
                label: descriptor.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(flatten_outputs(&raw))
    }
}

#[async_trait]
impl ProvisioningEngine for TerraformCli {
    async fn apply(&self, descriptor: &InvocationDescriptor) -> Result<StageOutputs, ProvisioningError> {
        info!(stage = %descriptor.label, dir = %descriptor.template_dir.display(), "terraform apply");
        Self::write_var_file(descriptor).await?;
        self.init(descriptor).await?;

        let mut args = vec!["apply".to_string(), "-auto-approve".to_string()];
        args.extend(Self::common_flags(descriptor));
        args.push(format!("-var-file={VAR_FILE}"));

        match self.exec_with_retry(descriptor, &args).await? {
            Ok(_) => self.read_outputs(descriptor).await,
            Err((output, attempts)) => Err(ProvisioningError::ApplyFailed {
                label: descriptor.label.clone(),
                reason: last_lines(&output),
                attempts,
            }),
        }
    }

    async fn destroy(&self, descriptor: &InvocationDescriptor) -> Result<(), ProvisioningError> {
        info!(stage = %descriptor.label, dir = %descriptor.template_dir.display(), "terraform destroy");
        if !descriptor.template_dir.is_dir() {
            return Err(ProvisioningError::destroy_failed(
                &descriptor.label,
                format!("template directory {} is missing", descriptor.template_dir.display()),
            ));
        }
        Self::write_var_file(descriptor).await.map_err(|e| {
            ProvisioningError::destroy_failed(&descriptor.label, e.to_string())
        })?;
        self.init(descriptor).await.map_err(|e| {
            ProvisioningError::destroy_failed(&descriptor.label, e.to_string())
        })?;

        let mut args = vec!["destroy".to_string(), "-auto-approve".to_string()];
        args.extend(Self::common_flags(descriptor));
        args.push(format!("-var-file={VAR_FILE}"));

        match self.exec_with_retry(descriptor, &args).await? {
            Ok(_) => Ok(()),
            Err((output, attempts)) => Err(ProvisioningError::DestroyFailed {
                label: descriptor.label.clone(),
                reason: last_lines(&output),
                attempts,
            }),
        }
    }
}

/// Returns the description of the first retryable pattern found in `output`.
fn retryable_reason<'a>(policy: &'a RetryPolicy, output: &str) -> Option<&'a str> {
    policy.retryable_errors.iter().find_map(|(pattern, description)| {
        let matched = match Regex::new(pattern) {
            Ok(re) => re.is_match(output),
            Err(_) => output.contains(pattern.as_str()),
        };
        matched.then_some(description.as_str())
    })
}

fn last_lines(output: &str) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

fn scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten_into(prefix: &str, value: &serde_json::Value, out: &mut StageOutputs) {
    match value {
        serde_json::Value::Array(items) => {
            let joined: Vec<String> = items.iter().map(scalar).collect();
            out.insert(prefix.to_string(), joined.join(","));
        }
        serde_json::Value::Object(fields) => {
            for (key, field) in fields {
                flatten_into(&format!("{prefix}.{key}"), field, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), scalar(other));
        }
    }
}

/// Flattens `terraform output -json` into a flat string map.
///
/// Lists become comma-joined strings and maps become `name.field` entries.
#[must_use]
pub fn flatten_outputs(raw: &serde_json::Value) -> StageOutputs {
    let mut out = StageOutputs::new();
    if let Some(outputs) = raw.as_object() {
        for (name, entry) in outputs {
            let value = entry.get("value").unwrap_or(entry);
            flatten_into(name, value, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flatten_outputs() {
        let raw = serde_json::json!({
            "vpc_id": {"sensitive": false, "type": "string", "value": "vpc-123"},
            "private_subnets": {"type": ["list", "string"], "value": ["subnet-a", "subnet-b"]},
            "nlb_details": {"value": {"arn": "arn:aws:nlb", "dns_name": "nlb.example.com"}},
            "node_count": {"value": 3},
        });
        let flat = flatten_outputs(&raw);

        assert_eq!(flat["vpc_id"], "vpc-123");
        assert_eq!(flat["private_subnets"], "subnet-a,subnet-b");
        assert_eq!(flat["nlb_details.arn"], "arn:aws:nlb");
        assert_eq!(flat["nlb_details.dns_name"], "nlb.example.com");
        assert_eq!(flat["node_count"], "3");
    }

    #[test]
    fn test_flatten_outputs_ignores_non_objects() {
        assert!(flatten_outputs(&serde_json::json!([])).is_empty());
    }

    #[test]
    fn test_retryable_reason() {
        let policy = RetryPolicy::default();
        assert_eq!(
            retryable_reason(&policy, "Error: RequestError: send request failed"),
            Some("Request failed")
        );
        assert_eq!(retryable_reason(&policy, "Error: AccessDenied"), None);
        assert_eq!(retryable_reason(&RetryPolicy::none(), "RequestError"), None);
    }

    #[test]
    fn test_last_lines_keeps_tail() {
        let output = (1..=8).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n\n");
        assert_eq!(last_lines(&output), "line 4\nline 5\nline 6\nline 7\nline 8");
    }

    #[tokio::test]
    async fn test_var_file_holds_descriptor_vars() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = InvocationDescriptor::new("network", dir.path())
            .with_var("region", serde_json::json!("us-east-1"))
            .with_var("azs", serde_json::json!(["a", "b"]));

        TerraformCli::write_var_file(&descriptor).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(dir.path().join(VAR_FILE)).await.unwrap()).unwrap();
        assert_eq!(written, serde_json::json!({"region": "us-east-1", "azs": ["a", "b"]}));
    }

    #[tokio::test]
    async fn test_var_file_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = InvocationDescriptor::new("network", dir.path().join("gone"));

        let err = TerraformCli::write_var_file(&descriptor).await.unwrap_err();
        assert!(err.to_string().contains(VAR_FILE));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TerraformCli::new().with_binary("infrastage-no-such-binary");
        let descriptor = InvocationDescriptor::new("network", dir.path()).with_retry(RetryPolicy::none());

        let err = engine.apply(&descriptor).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Spawn { .. }));
        assert!(dir.path().join(VAR_FILE).exists());
    }
}
