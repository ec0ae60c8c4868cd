//! Error types for cluster deployment.

use thiserror::Error;

use kt_userdata::UserDataError;

use crate::cloud::CloudError;
use crate::remote::RemoteError;

/// Result type alias for deployer operations.
pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// One instance that could not be terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// Instance that survived teardown.
    pub instance_id: String,
    /// Why termination failed.
    pub reason: String,
}

fn summarize(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.instance_id, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur while bringing a cluster up or down.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An image identifier does not look like `ami-<hex>`.
    #[error("invalid image id '{0}'")]
    InvalidImageId(String),

    /// The staging location or version is unusable.
    #[error("staging error: {0}")]
    Staging(String),

    /// User-data could not be rendered.
    #[error(transparent)]
    UserData(#[from] UserDataError),

    /// A cloud API call failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// A remote command failed outside of a readiness gate.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// An instance never reached the running state.
    #[error("instance {instance_id} did not reach running within {timeout_secs}s: {reason}")]
    NotRunning {
        /// The instance.
        instance_id: String,
        /// Wait budget in seconds.
        timeout_secs: u64,
        /// Last error from the wait.
        reason: String,
    },

    /// A readiness gate ran out of attempts.
    #[error("instance {instance_id} failed gate '{gate}' after {attempts} attempts; last output: {last_output}")]
    ReadinessExhausted {
        /// The instance.
        instance_id: String,
        /// Name of the gate.
        gate: String,
        /// Attempts made.
        attempts: u32,
        /// Last observed command output or error.
        last_output: String,
    },

    /// cloud-init reported an error on the instance.
    #[error("instance {instance_id} failed to boot: {output}")]
    BootFailed {
        /// The instance.
        instance_id: String,
        /// Output of the status query.
        output: String,
    },

    /// One or more instances could not be terminated.
    #[error("teardown failed for {}", summarize(.failures))]
    Teardown {
        /// Every instance that failed to terminate.
        failures: Vec<TeardownFailure>,
    },

    /// Kubeconfig could not be fetched or written.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Session state could not be read or written.
    #[error("session state error: {0}")]
    State(String),

    /// A polling task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Creates a `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a `Staging` error.
    #[must_use]
    pub fn staging(message: impl Into<String>) -> Self {
        Self::Staging(message.into())
    }

    /// The instance this error is about, if any.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::NotRunning { instance_id, .. }
            | Self::ReadinessExhausted { instance_id, .. }
            | Self::BootFailed { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }

    /// Returns true for errors raised before any cloud resource exists.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidImageId(_) | Self::Staging(_) | Self::UserData(_)
        )
    }
}
