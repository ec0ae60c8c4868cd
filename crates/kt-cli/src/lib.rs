//! # kt-cli
//!
//! Command line for ephemeral EC2 test clusters.
//!
//! - `up` launches a control plane and workers, waits for readiness and
//!   writes a kubeconfig
//! - `down` dumps node logs and terminates everything the session created
//! - `is-up` checks the saved session is still healthy
//! - `kubeconfig` prints where the admin kubeconfig was written
//!
//! Every subcommand after `up` works from the session file kept in the run
//! directory, so separate invocations share one cluster.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, Format};
pub use commands::{run, Outcome};
