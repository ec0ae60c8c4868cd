//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use kt_deployer::image::Arch;
use kt_deployer::{DeployResult, DeployerConfig};

/// kubetest-ec2 - ephemeral kubeadm clusters on EC2.
#[derive(Parser, Debug, Clone)]
#[command(name = "kubetest-ec2")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file; flags override its values.
    #[arg(short, long, env = "KUBETEST_EC2_CONFIG")]
    pub config: Option<PathBuf>,

    /// AWS region.
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// AMI id or OS name (ubuntu2404, ubuntu2204, al2023) for the control plane.
    #[arg(long)]
    pub image: Option<String>,

    /// AMI id or OS name for workers.
    #[arg(long)]
    pub worker_image: Option<String>,

    /// Instance type for the control plane.
    #[arg(long)]
    pub instance_type: Option<String>,

    /// Instance type for workers.
    #[arg(long)]
    pub worker_instance_type: Option<String>,

    /// CPU architecture (amd64 or arm64).
    #[arg(long, value_parser = parse_arch)]
    pub arch: Option<Arch>,

    /// Number of worker instances.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Bucket name or base URL holding the staged binaries.
    #[arg(long, env = "KUBETEST_EC2_STAGING_BUCKET")]
    pub staging_bucket: Option<String>,

    /// Version directory under the staging location.
    #[arg(long, env = "KUBETEST_EC2_STAGING_VERSION")]
    pub staging_version: Option<String>,

    /// Comma separated feature gates.
    #[arg(long)]
    pub feature_gates: Option<String>,

    /// Run the external cloud controller manager.
    #[arg(long)]
    pub external_cloud_provider: bool,

    /// Where to write the kubeconfig.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Directory for session state, keys and logs.
    #[arg(long, env = "KUBETEST_EC2_RUN_DIR")]
    pub run_dir: Option<PathBuf>,

    /// SSH login user.
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// Private key used when Instance Connect is disabled.
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Do not push keys through EC2 Instance Connect.
    #[arg(long)]
    pub no_instance_connect: bool,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    pub format: Format,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Plain text.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Launch a cluster and wait until every node is ready.
    Up {
        /// Terminate everything that was created if bring-up fails.
        #[arg(long)]
        teardown_on_failure: bool,
    },

    /// Dump logs and terminate the cluster from the saved session.
    Down,

    /// Report whether the saved cluster is still healthy.
    IsUp,

    /// Print the kubeconfig path of the saved cluster.
    Kubeconfig,
}

fn parse_arch(value: &str) -> Result<Arch, String> {
    Arch::parse(value).ok_or_else(|| format!("unsupported architecture '{value}', expected amd64 or arm64"))
}

impl Cli {
    /// Builds the deployer configuration: file (or defaults), then flags.
    pub fn deployer_config(&self) -> DeployResult<DeployerConfig> {
        let mut config = match &self.config {
            Some(path) => DeployerConfig::from_file(path)?,
            None => DeployerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut DeployerConfig) {
        if let Some(region) = &self.region {
            config.region.clone_from(region);
        }
        if let Some(image) = &self.image {
            config.image.clone_from(image);
        }
        if let Some(image) = &self.worker_image {
            config.worker_image = Some(image.clone());
        }
        if let Some(instance_type) = &self.instance_type {
            config.instance_type.clone_from(instance_type);
        }
        if let Some(instance_type) = &self.worker_instance_type {
            config.worker_instance_type = Some(instance_type.clone());
        }
        if let Some(arch) = self.arch {
            config.arch = arch;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(bucket) = &self.staging_bucket {
            config.staging_bucket.clone_from(bucket);
        }
        if let Some(version) = &self.staging_version {
            config.staging_version.clone_from(version);
        }
        if let Some(gates) = &self.feature_gates {
            config.feature_gates.clone_from(gates);
        }
        if self.external_cloud_provider {
            config.external_cloud_provider = true;
        }
        if let Some(path) = &self.kubeconfig {
            config.kubeconfig_path = Some(path.clone());
        }
        if let Some(dir) = &self.run_dir {
            config.run_dir.clone_from(dir);
        }
        if let Some(user) = &self.ssh_user {
            config.ssh.user = Some(user.clone());
        }
        if self.no_instance_connect {
            config.ssh.instance_connect = false;
        }
    }
}
