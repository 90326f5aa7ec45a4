//! Ready-made deployment plans for the supported providers.
//!
//! Every plan shares one network stage between a disk-enabled and a
//! disk-disabled variant. AWS splits each variant into cluster, database and
//! application stages; Azure and GCP provision a variant in one consolidated
//! stage.

use serde_json::json;

use super::plan::{DeploymentPlan, OutputShape, StageDefinition, VariantPipeline};
use crate::config::{common_entries, ConfigEntry, USE_EXISTING_NETWORK_KEY};
use crate::core::Provider;
use crate::provision::RetryPolicy;

/// Name of the shared network stage.
pub const NETWORK_STAGE: &str = "network";

/// The disk-enabled variant.
pub const DISK_ENABLED: &str = "disk_enabled";

/// The disk-disabled variant.
pub const DISK_DISABLED: &str = "disk_disabled";

const PROJECT: &str = "materialize";
const TEST_PASSWORD: &str = "test-password-123!";
const LICENSE_KEY: &str = "MATERIALIZE_LICENSE_KEY";

fn tags() -> serde_json::Value {
    json!({ "project": PROJECT, "test_run": "{family_id}" })
}

/// Returns the preset plan for a provider.
#[must_use]
pub fn plan_for(provider: Provider) -> DeploymentPlan {
    match provider {
        Provider::Aws => aws(),
        Provider::Azure => azure(),
        Provider::Gcp => gcp(),
    }
}

/// Returns the configuration a provider's preset needs, followed by the
/// entries common to every provider.
#[must_use]
pub fn required_config(provider: Provider) -> Vec<ConfigEntry> {
    let mut entries = match provider {
        Provider::Aws => vec![
            ConfigEntry::critical("AWS_REGION"),
            ConfigEntry::critical("AWS_PROFILE"),
        ],
        Provider::Azure => vec![
            ConfigEntry::critical("ARM_SUBSCRIPTION_ID"),
            ConfigEntry::critical("TEST_REGION"),
            ConfigEntry::optional(LICENSE_KEY),
        ],
        Provider::Gcp => vec![
            ConfigEntry::critical("GOOGLE_PROJECT"),
            ConfigEntry::optional(LICENSE_KEY),
        ],
    };
    entries.push(ConfigEntry::optional(USE_EXISTING_NETWORK_KEY));
    entries.push(ConfigEntry::optional("SKIP_setup_network"));
    entries.extend(common_entries());
    entries
}

// AWS

const AWS_VPC_CIDR: &str = "10.0.0.0/16";
const AWS_PRIVATE_SUBNETS: [&str; 2] = ["10.0.1.0/24", "10.0.2.0/24"];
const AWS_PUBLIC_SUBNETS: [&str; 2] = ["10.0.101.0/24", "10.0.102.0/24"];
const AWS_AVAILABILITY_ZONES: [&str; 2] = ["us-east-1a", "us-east-1b"];
const AWS_KUBERNETES_VERSION: &str = "1.33";

/// The AWS plan: VPC, then EKS, RDS and Materialize per variant.
#[must_use]
pub fn aws() -> DeploymentPlan {
    let network = StageDefinition::new(NETWORK_STAGE, "test-networking")
        .with_config_var("profile", "AWS_PROFILE")
        .with_config_var("region", "AWS_REGION")
        .with_var("name_prefix", json!("{family_id}-net"))
        .with_var("vpc_cidr", json!(AWS_VPC_CIDR))
        .with_var("availability_zones", json!(AWS_AVAILABILITY_ZONES))
        .with_var("private_subnet_cidrs", json!(AWS_PRIVATE_SUBNETS))
        .with_var("public_subnet_cidrs", json!(AWS_PUBLIC_SUBNETS))
        .with_var("single_nat_gateway", json!(true))
        .with_var("create_vpc", json!(true))
        .with_var("tags", tags())
        .with_outputs(["vpc_id", "private_subnet_ids", "public_subnet_ids"]);

    DeploymentPlan::new(Provider::Aws, network)
        .variant(aws_variant(DISK_ENABLED, "de", true, "r7gd.2xlarge"))
        .variant(aws_variant(DISK_DISABLED, "dd", false, "r7g.2xlarge"))
}

fn aws_variant(variant: &str, suffix: &str, disk: bool, instance_type: &str) -> VariantPipeline {
    let eks = format!("eks_{variant}");
    let database = format!("database_{variant}");
    let materialize = format!("materialize_{variant}");

    let eks_stage = StageDefinition::new(&eks, "test-eks")
        .with_config_var("profile", "AWS_PROFILE")
        .with_config_var("region", "AWS_REGION")
        .with_input(NETWORK_STAGE, "vpc_id")
        .with_list_input(NETWORK_STAGE, "private_subnet_ids", "subnet_ids")
        .with_var("cluster_name", json!(format!("{{family_id}}-{suffix}")))
        .with_var("cluster_version", json!(AWS_KUBERNETES_VERSION))
        .with_var("cluster_enabled_log_types", json!(["api", "audit"]))
        .with_var("enable_cluster_creator_admin_permissions", json!(true))
        .with_var("min_nodes", json!(1))
        .with_var("max_nodes", json!(3))
        .with_var("desired_nodes", json!(2))
        .with_var("instance_types", json!([instance_type]))
        .with_var("capacity_type", json!("ON_DEMAND"))
        .with_var("swap_enabled", json!(disk))
        .with_var("iam_role_use_name_prefix", json!(false))
        .with_var("tags", tags())
        .with_retry(RetryPolicy::default().with_retryable("InvalidParameterException", "EKS service error"))
        .with_outputs([
            "cluster_name",
            "cluster_endpoint",
            "cluster_security_group_id",
            "node_security_group_id",
            "oidc_provider_arn",
            "cluster_oidc_issuer_url",
            "cluster_certificate_authority_data",
        ]);

    let database_stage = StageDefinition::new(&database, "test-database")
        .with_config_var("profile", "AWS_PROFILE")
        .with_config_var("region", "AWS_REGION")
        .with_input(NETWORK_STAGE, "vpc_id")
        .with_list_input(NETWORK_STAGE, "private_subnet_ids", "database_subnet_ids")
        .with_input(&eks, "cluster_name")
        .with_input(&eks, "cluster_security_group_id")
        .with_input(&eks, "node_security_group_id")
        .with_var("name_prefix", json!(format!("{{family_id}}-{suffix}")))
        .with_var("postgres_version", json!("15"))
        .with_var("instance_class", json!("db.t3.micro"))
        .with_var("allocated_storage", json!(20))
        .with_var("max_allocated_storage", json!(40))
        .with_var("multi_az", json!(false))
        .with_var("database_name", json!("materialize_test"))
        .with_var("database_username", json!("materialize_test"))
        .with_var("database_password", json!(TEST_PASSWORD))
        .with_var("maintenance_window", json!("sun:05:00-sun:06:00"))
        .with_var("backup_window", json!("04:00-05:00"))
        .with_var("backup_retention_period", json!(7))
        .with_var("tags", tags())
        .with_outputs(["database_endpoint", "database_name", "database_username"]);

    let mut install = serde_json::Map::new();
    install.insert("install_materialize_instance".to_string(), json!(true));

    let materialize_stage = StageDefinition::new(&materialize, "test-materialize")
        .with_config_var("profile", "AWS_PROFILE")
        .with_config_var("region", "AWS_REGION")
        .with_input(NETWORK_STAGE, "vpc_id")
        .with_list_input(NETWORK_STAGE, "private_subnet_ids", "subnet_ids")
        .with_input(&eks, "cluster_name")
        .with_input(&eks, "cluster_endpoint")
        .with_input(&eks, "cluster_certificate_authority_data")
        .with_input(&eks, "oidc_provider_arn")
        .with_input(&eks, "cluster_oidc_issuer_url")
        .with_input(&database, "database_endpoint")
        .with_input(&database, "database_name")
        .with_input(&database, "database_username")
        .with_var("database_password", json!(TEST_PASSWORD))
        .with_var("bucket_force_destroy", json!(true))
        .with_var("install_cert_manager", json!(true))
        .with_var("cert_manager_namespace", json!(format!("cert-manager-{suffix}")))
        .with_var("operator_namespace", json!(format!("mz-operator-{suffix}")))
        .with_var("instance_namespace", json!(format!("mz-instance-{suffix}")))
        .with_var("instance_name", json!(format!("{{family_id}}-{suffix}")))
        .with_var("name_prefix", json!(format!("{{family_id}}-{suffix}")))
        .with_var("swap_enabled", json!(disk))
        .with_var("install_materialize_instance", json!(false))
        .with_var("external_login_password_mz_system", json!(TEST_PASSWORD))
        .with_config_var_or("license_key", LICENSE_KEY, "")
        .with_var("tags", tags())
        .with_follow_up(install)
        .with_outputs(["metadata_backend_url", "persist_backend_url", "instance_resource_id"]);

    VariantPipeline::new(variant)
        .stage(eks_stage)
        .stage(database_stage)
        .stage(materialize_stage)
}

// Azure

/// The Azure plan: VNet, then one consolidated AKS stack per variant.
#[must_use]
pub fn azure() -> DeploymentPlan {
    let network = StageDefinition::new(NETWORK_STAGE, "networking")
        .with_config_var("subscription_id", "ARM_SUBSCRIPTION_ID")
        .with_config_var("location", "TEST_REGION")
        .with_var("resource_group_name", json!("{short_id}-rg"))
        .with_var("prefix", json!("{short_id}"))
        .with_var("vnet_address_space", json!("10.100.0.0/16"))
        .with_var("aks_subnet_cidr", json!("10.100.0.0/20"))
        .with_var("postgres_subnet_cidr", json!("10.100.16.0/24"))
        .with_var("tags", tags())
        .with_outputs([
            "resource_group_name",
            "vnet_name",
            "aks_subnet_id",
            "aks_subnet_name",
            "postgres_subnet_id",
            "private_dns_zone_id",
        ]);

    DeploymentPlan::new(Provider::Azure, network)
        .variant(azure_variant(DISK_ENABLED, "de", true, "Standard_E4pds_v6"))
        .variant(azure_variant(DISK_DISABLED, "dd", false, "Standard_D4s_v3"))
}

fn azure_variant(variant: &str, suffix: &str, disk: bool, vm_size: &str) -> VariantPipeline {
    let stage = StageDefinition::new(format!("materialize_{variant}"), "materialize")
        .with_config_var("subscription_id", "ARM_SUBSCRIPTION_ID")
        .with_config_var("location", "TEST_REGION")
        .with_input(NETWORK_STAGE, "resource_group_name")
        .with_input(NETWORK_STAGE, "vnet_name")
        .with_input_as(NETWORK_STAGE, "aks_subnet_name", "subnet_name", OutputShape::Scalar)
        .with_input_as(NETWORK_STAGE, "aks_subnet_id", "subnet_id", OutputShape::Scalar)
        .with_input_as(NETWORK_STAGE, "postgres_subnet_id", "database_subnet_id", OutputShape::Scalar)
        .with_input(NETWORK_STAGE, "private_dns_zone_id")
        .with_var("prefix", json!(format!("{{short_id}}{suffix}")))
        .with_var("kubernetes_version", json!("1.32"))
        .with_var("service_cidr", json!("10.101.0.0/16"))
        .with_var("nodepool_vm_size", json!(vm_size))
        .with_var("min_nodes", json!(1))
        .with_var("max_nodes", json!(5))
        .with_var("swap_enabled", json!(disk))
        .with_var("administrator_login", json!("materialize_test"))
        .with_var("administrator_password", json!(TEST_PASSWORD))
        .with_var("sku_name", json!("GP_Standard_D2s_v3"))
        .with_var("postgres_version", json!("15"))
        .with_var("cert_manager_namespace", json!(format!("cert-manager-{suffix}")))
        .with_var("operator_namespace", json!(format!("mz-operator-{suffix}")))
        .with_var("instance_namespace", json!(format!("mz-instance-{suffix}")))
        .with_var("instance_name", json!("materialize-test"))
        .with_var("external_login_password_mz_system", json!(TEST_PASSWORD))
        .with_config_var_or("license_key", LICENSE_KEY, "")
        .with_var("tags", tags())
        .with_outputs(["cluster_name", "server_fqdn", "storage_account_name", "instance_resource_id"]);

    VariantPipeline::new(variant).stage(stage)
}

// GCP

const GCP_REGION: &str = "us-central1";

/// The GCP plan: VPC, then one consolidated GKE stack per variant.
#[must_use]
pub fn gcp() -> DeploymentPlan {
    let network = StageDefinition::new(NETWORK_STAGE, "networking")
        .with_config_var("project_id", "GOOGLE_PROJECT")
        .with_var("region", json!(GCP_REGION))
        .with_var("prefix", json!("{short_id}"))
        .with_var("labels", tags())
        .with_var(
            "subnets",
            json!([{
                "name": "{short_id}-subnet",
                "cidr": "10.100.0.0/20",
                "region": GCP_REGION,
                "private_access": true,
                "secondary_ranges": [
                    { "range_name": "pods", "ip_cidr_range": "10.104.0.0/14" },
                    { "range_name": "services", "ip_cidr_range": "10.108.0.0/20" },
                ],
            }]),
        )
        .with_outputs(["network_name", "network_id", "subnets_names"]);

    DeploymentPlan::new(Provider::Gcp, network)
        .variant(gcp_variant(DISK_ENABLED, "de", true, "n2-highmem-8", 100, 1))
        .variant(gcp_variant(DISK_DISABLED, "dd", false, "n2-standard-4", 50, 0))
}

fn gcp_variant(
    variant: &str,
    suffix: &str,
    disk: bool,
    machine_type: &str,
    disk_size: u32,
    local_ssd_count: u32,
) -> VariantPipeline {
    let stage = StageDefinition::new(format!("materialize_{variant}"), "materialize")
        .with_config_var("project_id", "GOOGLE_PROJECT")
        .with_var("region", json!(GCP_REGION))
        .with_input(NETWORK_STAGE, "network_name")
        .with_input(NETWORK_STAGE, "network_id")
        .with_input_as(NETWORK_STAGE, "subnets_names", "subnet_name", OutputShape::First)
        .with_var("prefix", json!(format!("{{short_id}}{suffix}")))
        .with_var("namespace", json!("materialize"))
        .with_var("materialize_node_type", json!(machine_type))
        .with_var("min_nodes", json!(1))
        .with_var("max_nodes", json!(3))
        .with_var("enable_private_nodes", json!(true))
        .with_var("swap_enabled", json!(disk))
        .with_var("disk_size", json!(disk_size))
        .with_var("local_ssd_count", json!(local_ssd_count))
        .with_var("database_tier", json!("db-custom-2-4096"))
        .with_var("db_version", json!("POSTGRES_15"))
        .with_var("cert_manager_namespace", json!(format!("cert-manager-{suffix}")))
        .with_var("operator_namespace", json!(format!("mz-operator-{suffix}")))
        .with_var("instance_namespace", json!(format!("mz-instance-{suffix}")))
        .with_var("instance_name", json!("main"))
        .with_var("external_login_password_mz_system", json!(TEST_PASSWORD))
        .with_config_var_or("license_key", LICENSE_KEY, "")
        .with_var("labels", tags())
        .with_outputs(["cluster_name", "private_ip", "instance_resource_id"]);

    VariantPipeline::new(variant).stage(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKind;

    #[test]
    fn test_presets_validate() {
        for provider in Provider::ALL {
            let plan = plan_for(provider);
            plan.validate().unwrap();
            assert_eq!(plan.provider, provider);
            assert_eq!(plan.variants.len(), 2);
        }
    }

    #[test]
    fn test_aws_stage_order() {
        let plan = aws();
        assert_eq!(
            plan.stage_names(),
            vec![
                "network",
                "eks_disk_enabled",
                "database_disk_enabled",
                "materialize_disk_enabled",
                "eks_disk_disabled",
                "database_disk_disabled",
                "materialize_disk_disabled",
            ]
        );
    }

    #[test]
    fn test_aws_materialize_installs_in_two_phases() {
        let plan = aws();
        let stage = &plan.variants[0].stages[2];
        let follow_up = stage.follow_up.as_ref().unwrap();
        assert_eq!(follow_up["install_materialize_instance"], json!(true));
        assert!(stage.retry.retryable_errors.contains_key("RequestError"));

        let eks = &plan.variants[0].stages[0];
        assert!(eks.retry.retryable_errors.contains_key("InvalidParameterException"));
    }

    #[test]
    fn test_required_config() {
        let entries = required_config(Provider::Azure);
        let critical: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == ConfigKind::Critical)
            .map(|e| e.key.as_str())
            .collect();
        assert_eq!(critical, vec!["ARM_SUBSCRIPTION_ID", "TEST_REGION"]);
        assert!(entries.iter().any(|e| e.key == "TF_TEST_REMOTE_BACKEND"));
    }
}
