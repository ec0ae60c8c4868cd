//! Deployer configuration.
//!
//! One [`DeployerConfig`] is built at the CLI boundary (optional JSON file,
//! then flags) and shared read-only by every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kt_userdata::TemplateSet;

use crate::error::{DeployError, DeployResult};
use crate::image::{validate_image_id, Arch, OsImage, DEFAULT_INSTANCE_TYPE};
use crate::poll::PollPolicy;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default IAM role assumed by instances.
pub const DEFAULT_ROLE_NAME: &str = "provider-aws-test-role";

/// Default instance profile wrapping [`DEFAULT_ROLE_NAME`].
pub const DEFAULT_INSTANCE_PROFILE: &str = "provider-aws-test-instance-profile";

/// Zones that lack the instance types the cluster needs.
pub const DEFAULT_EXCLUDED_ZONES: [&str; 1] = ["us-east-1e"];

/// Retry budgets for launch and readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Attempts per readiness gate.
    pub attempts: u32,
    /// Seconds between gate attempts.
    pub interval_secs: u64,
    /// Budget for the instance to reach `running`.
    pub running_timeout_secs: u64,
    /// Describes after create while waiting for addresses.
    pub launch_describe_attempts: u32,
    /// Seconds between those describes.
    pub launch_describe_interval_secs: u64,
    /// Budget for the post-install cloud-init check.
    pub cloud_init_timeout_secs: u64,
    /// Seconds between post-install cloud-init checks.
    pub cloud_init_interval_secs: u64,
    /// `kubectl wait` timeout for node readiness.
    pub node_ready_timeout_secs: u64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval_secs: 15,
            running_timeout_secs: 300,
            launch_describe_attempts: 30,
            launch_describe_interval_secs: 5,
            cloud_init_timeout_secs: 300,
            cloud_init_interval_secs: 10,
            node_ready_timeout_secs: 300,
        }
    }
}

impl ReadinessPolicy {
    /// Policy shared by every readiness gate.
    #[must_use]
    pub fn gate(&self) -> PollPolicy {
        PollPolicy::new(self.attempts, Duration::from_secs(self.interval_secs))
    }

    /// Policy for waiting on addresses after create.
    #[must_use]
    pub fn launch(&self) -> PollPolicy {
        PollPolicy::new(
            self.launch_describe_attempts,
            Duration::from_secs(self.launch_describe_interval_secs),
        )
    }

    /// Policy for the post-install cloud-init check.
    #[must_use]
    pub fn cloud_init(&self) -> PollPolicy {
        PollPolicy::within(
            Duration::from_secs(self.cloud_init_timeout_secs),
            Duration::from_secs(self.cloud_init_interval_secs),
        )
    }

    /// Budget for reaching `running`.
    #[must_use]
    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }
}

/// How instances are reached over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Push a key through EC2 Instance Connect before dialing.
    pub instance_connect: bool,
    /// Login user; derived from the OS image when unset.
    pub user: Option<String>,
    /// Key pair reused from `~/.ssh/<key_name>` when present.
    pub key_name: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            instance_connect: true,
            user: None,
            key_name: "kubetest2-ec2".to_string(),
        }
    }
}

/// Configuration for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    /// AWS region.
    pub region: String,
    /// AMI id or OS name for the control plane (empty: Ubuntu 24.04).
    pub image: String,
    /// AMI id or OS name for workers; defaults to `image`.
    pub worker_image: Option<String>,
    /// Instance type for the control plane.
    pub instance_type: String,
    /// Instance type for workers; defaults to `instance_type`.
    pub worker_instance_type: Option<String>,
    /// CPU architecture.
    pub arch: Arch,
    /// Number of worker instances.
    pub workers: usize,
    /// Bucket name or base URL holding staged binaries.
    pub staging_bucket: String,
    /// Version directory under the staging location.
    pub staging_version: String,
    /// Comma separated feature gates.
    pub feature_gates: String,
    /// API server runtime config.
    pub runtime_config: String,
    /// Run the external cloud controller manager.
    pub external_cloud_provider: bool,
    /// Image override for the cloud controller manager.
    pub external_cloud_provider_image: String,
    /// Install the AWS load balancer controller.
    pub external_load_balancer: bool,
    /// Install the NVIDIA device plugin.
    pub enable_nvidia_device_plugin: bool,
    /// Template overrides.
    pub templates: TemplateSet,
    /// IAM role for instances.
    pub role_name: String,
    /// Instance profile for instances.
    pub instance_profile: String,
    /// Zones never used for placement.
    pub excluded_zones: Vec<String>,
    /// SSH access.
    pub ssh: SshSettings,
    /// Retry budgets.
    pub readiness: ReadinessPolicy,
    /// Where to write the kubeconfig; mirrored to `~/.kube/config` when unset.
    pub kubeconfig_path: Option<PathBuf>,
    /// Directory for session state, keys and kubeconfig.
    pub run_dir: PathBuf,
    /// Directory for dumped logs; defaults to `<run_dir>/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            image: String::new(),
            worker_image: None,
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            worker_instance_type: None,
            arch: Arch::default(),
            workers: 1,
            staging_bucket: String::new(),
            staging_version: String::new(),
            feature_gates: String::new(),
            runtime_config: String::new(),
            external_cloud_provider: false,
            external_cloud_provider_image: String::new(),
            external_load_balancer: false,
            enable_nvidia_device_plugin: false,
            templates: TemplateSet::embedded(),
            role_name: DEFAULT_ROLE_NAME.to_string(),
            instance_profile: DEFAULT_INSTANCE_PROFILE.to_string(),
            excluded_zones: DEFAULT_EXCLUDED_ZONES.iter().map(ToString::to_string).collect(),
            ssh: SshSettings::default(),
            readiness: ReadinessPolicy::default(),
            kubeconfig_path: None,
            run_dir: PathBuf::from("_rundir"),
            logs_dir: None,
        }
    }
}

impl DeployerConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> DeployResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DeployError::config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parses configuration from JSON.
    pub fn from_json(content: &str) -> DeployResult<Self> {
        serde_json::from_str(content).map_err(|e| DeployError::config(format!("invalid JSON: {e}")))
    }

    /// Image requested for workers.
    #[must_use]
    pub fn worker_image(&self) -> &str {
        self.worker_image.as_deref().unwrap_or(&self.image)
    }

    /// Instance type requested for workers.
    #[must_use]
    pub fn worker_instance_type(&self) -> &str {
        self.worker_instance_type.as_deref().unwrap_or(&self.instance_type)
    }

    /// Login user for SSH.
    #[must_use]
    pub fn ssh_user(&self) -> String {
        self.ssh.user.clone().unwrap_or_else(|| {
            OsImage::from_name(&self.image)
                .unwrap_or_default()
                .default_user()
                .to_string()
        })
    }

    /// Directory logs are dumped into.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir.clone().unwrap_or_else(|| self.run_dir.join("logs"))
    }

    /// Checks the configuration before any cloud call.
    pub fn validate(&self) -> DeployResult<()> {
        if self.region.is_empty() {
            return Err(DeployError::config("region cannot be empty"));
        }
        if self.staging_bucket.is_empty() {
            return Err(DeployError::config("staging location cannot be empty"));
        }
        if self.staging_version.is_empty() {
            return Err(DeployError::config("staging version cannot be empty"));
        }
        for image in [self.image.as_str(), self.worker_image()] {
            if image.starts_with("ami-") {
                validate_image_id(image)?;
            } else if OsImage::from_name(image).is_none() {
                return Err(DeployError::InvalidImageId(image.to_string()));
            }
        }
        if self.instance_type.is_empty() || self.worker_instance_type().is_empty() {
            return Err(DeployError::config("instance type cannot be empty"));
        }
        if self.readiness.attempts == 0 {
            return Err(DeployError::config("readiness attempts must be at least 1"));
        }
        if self.role_name.is_empty() || self.instance_profile.is_empty() {
            return Err(DeployError::config("role and instance profile names cannot be empty"));
        }
        if self.ssh.key_name.is_empty() || self.ssh.key_name.contains('/') {
            return Err(DeployError::config("ssh key name must be a plain file name"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn valid() -> DeployerConfig {
        DeployerConfig {
            staging_bucket: "kubetest-staging".into(),
            staging_version: "v1.32.0".into(),
            ..DeployerConfig::default()
        }
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = DeployerConfig::default();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.instance_type, "t3a.medium");
        assert_eq!(config.excluded_zones, vec!["us-east-1e".to_string()]);
        assert_eq!(config.readiness.attempts, 30);
        assert_eq!(config.readiness.interval_secs, 15);
        assert_eq!(config.readiness.gate(), PollPolicy::new(30, Duration::from_secs(15)));
        assert_eq!(config.readiness.cloud_init().max_attempts, 30);
        assert_eq!(config.logs_dir(), PathBuf::from("_rundir/logs"));
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test_case(|c: &mut DeployerConfig| c.region.clear() ; "empty region")]
    #[test_case(|c: &mut DeployerConfig| c.staging_bucket.clear() ; "missing staging location")]
    #[test_case(|c: &mut DeployerConfig| c.staging_version.clear() ; "missing version")]
    #[test_case(|c: &mut DeployerConfig| c.image = "ami-xyz".into() ; "bad ami")]
    #[test_case(|c: &mut DeployerConfig| c.worker_image = Some("windows".into()) ; "unknown os")]
    #[test_case(|c: &mut DeployerConfig| c.readiness.attempts = 0 ; "no attempts")]
    #[test_case(|c: &mut DeployerConfig| c.ssh.key_name = "../id".into() ; "key path")]
    fn invalid_configs_fail_fast(mutate: fn(&mut DeployerConfig)) {
        let mut config = valid();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error(), "{err}");
    }

    #[test]
    fn worker_fields_fall_back() {
        let mut config = valid();
        config.image = "al2023".into();
        assert_eq!(config.worker_image(), "al2023");
        assert_eq!(config.worker_instance_type(), "t3a.medium");
        assert_eq!(config.ssh_user(), "ec2-user");

        config.worker_instance_type = Some("m6i.large".into());
        config.ssh.user = Some("admin".into());
        assert_eq!(config.worker_instance_type(), "m6i.large");
        assert_eq!(config.ssh_user(), "admin");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = DeployerConfig::from_json(
            r#"{"staging_bucket":"b","staging_version":"v1.31.0","workers":3,"readiness":{"attempts":5}}"#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.readiness.attempts, 5);
        assert_eq!(config.readiness.interval_secs, 15);
        assert_eq!(config.region, "us-east-1");
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = DeployerConfig::from_file("/nonexistent/kubetest.json").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
