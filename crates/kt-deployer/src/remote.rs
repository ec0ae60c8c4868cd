//! Remote command execution on cluster instances.
//!
//! Instances are addressed by id. The readiness poller fills the
//! [`HostRegistry`] with each instance's public address and key file as it
//! learns them; everything after that (gates, log dumps, teardown) only
//! needs the id.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

use crate::command::{AllowedProgram, CommandError, SafeCommand};

/// Result type alias for remote execution.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Errors from remote execution.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No address has been registered for the instance yet.
    #[error("no host registered for instance {0}")]
    UnknownInstance(String),

    /// The remote command ran and failed.
    #[error("remote command on {instance_id} failed: {message}")]
    Failed {
        /// Target instance.
        instance_id: String,
        /// Short failure description.
        message: String,
        /// Whatever the command printed.
        output: String,
    },

    /// The local client could not be run.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl RemoteError {
    /// Output captured from the failed command.
    #[must_use]
    pub fn output(&self) -> String {
        match self {
            Self::Failed { output, .. } => output.clone(),
            Self::Command(e) => e.output(),
            Self::UnknownInstance(_) => String::new(),
        }
    }
}

/// Address and credentials for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostEntry {
    /// Public address.
    pub host: String,
    /// Private key to authenticate with.
    pub key_file: Option<PathBuf>,
}

/// Instance id to host lookup shared between tasks.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<String, HostEntry>>,
}

impl HostRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the address of an instance.
    pub fn set_host(&self, instance_id: &str, host: &str) {
        self.hosts.write().entry(instance_id.to_string()).or_default().host = host.to_string();
    }

    /// Records the key file of an instance.
    pub fn set_key(&self, instance_id: &str, key_file: &Path) {
        self.hosts.write().entry(instance_id.to_string()).or_default().key_file =
            Some(key_file.to_path_buf());
    }

    /// Looks up an instance with a known address.
    #[must_use]
    pub fn get(&self, instance_id: &str) -> Option<HostEntry> {
        self.hosts
            .read()
            .get(instance_id)
            .filter(|entry| !entry.host.is_empty())
            .cloned()
    }

    /// Forgets an instance.
    pub fn remove(&self, instance_id: &str) {
        self.hosts.write().remove(instance_id);
    }
}

/// Runs commands on, and copies files from, instances.
pub trait RemoteExec: Send + Sync {
    /// Registers the address used to reach an instance.
    fn register_host(&self, instance_id: &str, host: &str);

    /// Registers the private key used to reach an instance.
    fn register_key(&self, instance_id: &str, key_file: &Path);

    /// Runs `args` on the instance and returns its stdout.
    fn ssh(&self, instance_id: &str, args: &[&str]) -> impl Future<Output = RemoteResult<String>> + Send;

    /// Copies `remote_path` (a glob is allowed) into `local_dir`.
    fn scp(
        &self,
        instance_id: &str,
        remote_path: &str,
        local_dir: &Path,
    ) -> impl Future<Output = RemoteResult<()>> + Send;
}

/// SSH connection options shared by `ssh` and `scp`.
const SSH_OPTIONS: [&str; 8] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// [`RemoteExec`] over the OpenSSH client binaries.
#[derive(Debug)]
pub struct SshRemote {
    registry: HostRegistry,
    user: String,
    default_key: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshRemote {
    /// Creates a remote that logs in as `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            registry: HostRegistry::new(),
            user: user.into(),
            default_key: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }

    /// Key used for instances without a registered key.
    #[must_use]
    pub fn with_default_key(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.default_key = Some(key_file.into());
        self
    }

    /// Limit for a single remote command.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The host registry.
    #[must_use]
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    fn base_command(&self, program: AllowedProgram, instance_id: &str) -> RemoteResult<(SafeCommand, String)> {
        let entry = self
            .registry
            .get(instance_id)
            .ok_or_else(|| RemoteError::UnknownInstance(instance_id.to_string()))?;
        let mut cmd = SafeCommand::new(program)
            .args(SSH_OPTIONS)
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .timeout(self.command_timeout);
        if let Some(key) = entry.key_file.as_ref().or(self.default_key.as_ref()) {
            cmd = cmd.arg("-i").arg(key.to_string_lossy());
        }
        Ok((cmd, format!("{}@{}", self.user, entry.host)))
    }
}

fn failed(instance_id: &str, error: CommandError) -> RemoteError {
    let output = error.output();
    match error {
        CommandError::NonZeroExit { exit_code, .. } => RemoteError::Failed {
            instance_id: instance_id.to_string(),
            message: format!("exit code {exit_code}"),
            output,
        },
        CommandError::Timeout { timeout_secs, .. } => RemoteError::Failed {
            instance_id: instance_id.to_string(),
            message: format!("timed out after {timeout_secs}s"),
            output: String::new(),
        },
        other => RemoteError::Command(other),
    }
}

impl RemoteExec for SshRemote {
    fn register_host(&self, instance_id: &str, host: &str) {
        self.registry.set_host(instance_id, host);
    }

    fn register_key(&self, instance_id: &str, key_file: &Path) {
        self.registry.set_key(instance_id, key_file);
    }

    async fn ssh(&self, instance_id: &str, args: &[&str]) -> RemoteResult<String> {
        let (cmd, target) = self.base_command(AllowedProgram::Ssh, instance_id)?;
        let output = cmd
            .arg(target)
            .arg("--")
            .args(args)
            .execute()
            .await
            .map_err(|e| failed(instance_id, e))?;
        Ok(output.stdout_lossy())
    }

    async fn scp(&self, instance_id: &str, remote_path: &str, local_dir: &Path) -> RemoteResult<()> {
        let (cmd, target) = self.base_command(AllowedProgram::Scp, instance_id)?;
        cmd.arg("-r")
            .arg(format!("{target}:{remote_path}"))
            .arg(local_dir.to_string_lossy())
            .execute()
            .await
            .map_err(|e| failed(instance_id, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_requires_a_host() {
        let registry = HostRegistry::new();
        registry.set_key("i-1", Path::new("/tmp/key"));
        assert!(registry.get("i-1").is_none());

        registry.set_host("i-1", "203.0.113.5");
        let entry = registry.get("i-1").unwrap();
        assert_eq!(entry.host, "203.0.113.5");
        assert_eq!(entry.key_file.as_deref(), Some(Path::new("/tmp/key")));

        registry.remove("i-1");
        assert!(registry.get("i-1").is_none());
    }

    #[test]
    fn base_command_uses_registered_key() {
        let remote = SshRemote::new("ubuntu").with_default_key("/keys/default");
        remote.register_host("i-1", "203.0.113.5");
        let (cmd, target) = remote.base_command(AllowedProgram::Ssh, "i-1").unwrap();
        assert_eq!(target, "ubuntu@203.0.113.5");
        assert!(cmd.command_description().contains("-i /keys/default"));

        remote.register_key("i-1", Path::new("/keys/i-1"));
        let (cmd, _) = remote.base_command(AllowedProgram::Ssh, "i-1").unwrap();
        assert!(cmd.command_description().contains("-i /keys/i-1"));
        assert!(cmd.command_description().contains("StrictHostKeyChecking=no"));
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let remote = SshRemote::new("ubuntu");
        let err = remote.ssh("i-missing", &["true"]).await.unwrap_err();
        assert!(matches!(err, RemoteError::UnknownInstance(ref id) if id == "i-missing"));
        assert!(err.output().is_empty());
    }

    #[test]
    fn non_zero_exit_keeps_output() {
        let err = failed(
            "i-1",
            CommandError::NonZeroExit {
                command: "ssh".into(),
                exit_code: 1,
                stdout: "status: error".into(),
                stderr: String::new(),
            },
        );
        assert_eq!(err.output(), "status: error");
        assert!(err.to_string().contains("exit code 1"));
    }
}
