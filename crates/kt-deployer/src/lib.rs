//! # kt-deployer
//!
//! Ephemeral kubeadm clusters on EC2 for end-to-end tests.
//!
//! A [`Fleet`] validates its configuration, launches one control plane and
//! N workers, and drives each instance through the readiness gates of
//! [`ReadinessPoller`] until the cluster answers `kubectl`. The cloud and
//! the remote shell are reached through narrow traits ([`CloudProvider`],
//! [`RemoteExec`]) implemented here over the `aws` and `ssh` binaries.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kt_deployer::{AwsCli, DeployerConfig, Fleet, SshRemote};
//!
//! # async fn run() -> kt_deployer::DeployResult<()> {
//! let config = DeployerConfig {
//!     staging_bucket: "my-staging-bucket".into(),
//!     staging_version: "v1.32.0".into(),
//!     ..DeployerConfig::default()
//! };
//! let cloud = Arc::new(AwsCli::new(&config.region));
//! let remote = Arc::new(SshRemote::new(config.ssh_user()));
//! let mut fleet = Fleet::new(cloud, remote, config);
//! fleet.up().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Deployer configuration and poll budgets
//! - [`fleet`]: `up`, `down` and `is_up`
//! - [`poller`]: Per-instance readiness state machine
//! - [`launcher`]: Instance creation
//! - [`image`]: Image resolution
//! - [`provision`]: IAM role and instance profile
//! - [`cloud`] / [`aws`]: Cloud traits and the AWS CLI backend
//! - [`remote`]: SSH command execution

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aws;
pub mod cloud;
pub mod command;
pub mod config;
pub mod dump;
pub mod error;
pub mod fleet;
pub mod image;
pub mod kubeconfig;
pub mod launcher;
pub mod poll;
pub mod poller;
pub mod provision;
pub mod remote;
pub mod session;
pub mod sshkey;
pub mod staging;
pub mod state;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use aws::AwsCli;
pub use cloud::{CloudError, CloudProvider, CloudResult};
pub use command::{AllowedProgram, CommandError, SafeCommand};
pub use config::{DeployerConfig, ReadinessPolicy, SshSettings};
pub use error::{DeployError, DeployResult, TeardownFailure};
pub use fleet::{Fleet, FleetPhase};
pub use image::{Arch, ImageResolver, OsImage, ResolvedImage};
pub use launcher::{ImageSpec, InstanceRecord, Launcher};
pub use poll::{poll_until, Attempt, PollError, PollPolicy};
pub use poller::{Gate, PollState, ReadinessPoller};
pub use provision::Provisioner;
pub use remote::{RemoteError, RemoteExec, SshRemote};
pub use session::ClusterSession;
pub use state::SessionState;
