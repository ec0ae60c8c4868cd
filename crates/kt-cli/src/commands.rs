//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info, warn};

use kt_deployer::{kubeconfig, AwsCli, DeployerConfig, Fleet, InstanceRecord, SshRemote};

use crate::cli::{Cli, Commands, Format};

/// Fleet wired to the real AWS and SSH backends.
pub type AwsFleet = Fleet<AwsCli, SshRemote>;

/// Result of a subcommand that decides the exit status itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Command succeeded.
    Success,
    /// Command ran but the answer is negative (`is-up` on a broken cluster).
    Negative,
}

/// Runs the parsed command line.
pub async fn run(cli: Cli) -> Result<Outcome> {
    let config = cli.deployer_config().context("failed to build configuration")?;
    match cli.command {
        Commands::Up { teardown_on_failure } => up(config, cli.ssh_key, cli.format, teardown_on_failure).await,
        Commands::Down => down(config, cli.ssh_key).await,
        Commands::IsUp => is_up(config, cli.ssh_key, cli.format).await,
        Commands::Kubeconfig => print_kubeconfig(config, cli.ssh_key, cli.format),
    }
}

fn backends(config: &DeployerConfig, ssh_key: Option<PathBuf>) -> (Arc<AwsCli>, Arc<SshRemote>) {
    let cloud = AwsCli::new(config.region.clone());
    let mut remote = SshRemote::new(config.ssh_user());
    if let Some(key) = ssh_key {
        remote = remote.with_default_key(key);
    }
    (Arc::new(cloud), Arc::new(remote))
}

async fn up(
    config: DeployerConfig,
    ssh_key: Option<PathBuf>,
    format: Format,
    teardown_on_failure: bool,
) -> Result<Outcome> {
    let (cloud, remote) = backends(&config, ssh_key);
    let mut fleet = Fleet::new(cloud, remote, config);
    info!(cluster_id = %fleet.session().cluster_id(), "bringing cluster up");

    if let Err(e) = fleet.up().await {
        error!(error = %e, "cluster bring-up failed");
        if teardown_on_failure && !e.is_config_error() {
            if let Err(teardown) = fleet.down().await {
                warn!(error = %teardown, "teardown after failed bring-up was incomplete");
            }
        }
        return Err(e.into());
    }

    print_summary(&fleet, format);
    Ok(Outcome::Success)
}

async fn down(config: DeployerConfig, ssh_key: Option<PathBuf>) -> Result<Outcome> {
    let (cloud, remote) = backends(&config, ssh_key);
    let mut fleet = Fleet::from_state(cloud, remote, config).context("no saved session to tear down")?;
    info!(cluster_id = %fleet.session().cluster_id(), "tearing cluster down");
    fleet.down().await?;
    Ok(Outcome::Success)
}

async fn is_up(config: DeployerConfig, ssh_key: Option<PathBuf>, format: Format) -> Result<Outcome> {
    let (cloud, remote) = backends(&config, ssh_key);
    let fleet = Fleet::from_state(cloud, remote, config).context("no saved session")?;
    let up = fleet.is_up().await?;
    match format {
        Format::Text => println!("{up}"),
        Format::Json => println!("{}", json!({ "cluster_id": fleet.session().cluster_id(), "up": up })),
    }
    Ok(if up { Outcome::Success } else { Outcome::Negative })
}

fn print_kubeconfig(config: DeployerConfig, ssh_key: Option<PathBuf>, format: Format) -> Result<Outcome> {
    let explicit = config.kubeconfig_path.clone();
    let (cloud, remote) = backends(&config, ssh_key);
    let saved = Fleet::from_state(cloud, remote, config)
        .ok()
        .and_then(|fleet| fleet.kubeconfig().map(Path::to_path_buf));
    let path = saved
        .or_else(|| kubeconfig::lookup(explicit.as_deref()))
        .context("no kubeconfig found for this session")?;
    match format {
        Format::Text => println!("{}", path.display()),
        Format::Json => println!("{}", json!({ "kubeconfig": path })),
    }
    Ok(Outcome::Success)
}

fn instance_json(record: &InstanceRecord) -> serde_json::Value {
    json!({
        "instance_id": record.instance_id,
        "role": record.role.to_string(),
        "availability_zone": record.availability_zone,
        "public_ip": record.public_ip,
        "private_ip": record.private_ip,
    })
}

fn print_summary(fleet: &AwsFleet, format: Format) {
    match format {
        Format::Text => {
            println!("cluster {} is up", fleet.session().cluster_id());
            for record in fleet.instances() {
                println!(
                    "  {:<14} {:<21} {}",
                    record.role.to_string(),
                    record.instance_id,
                    record.public_ip.as_deref().unwrap_or("-")
                );
            }
            if let Some(path) = fleet.kubeconfig() {
                println!("kubeconfig: {}", path.display());
            }
        }
        Format::Json => {
            let instances: Vec<_> = fleet.instances().iter().map(instance_json).collect();
            println!(
                "{}",
                json!({
                    "cluster_id": fleet.session().cluster_id(),
                    "instances": instances,
                    "kubeconfig": fleet.kubeconfig(),
                })
            );
        }
    }
}
