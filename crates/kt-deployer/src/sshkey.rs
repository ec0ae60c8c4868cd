//! SSH key material for reaching instances.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{AllowedProgram, SafeCommand};
use crate::error::{DeployError, DeployResult};

/// A private key file and its public half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    private_key: PathBuf,
    public_key: String,
}

fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

impl SshKeyPair {
    /// Loads a pair if both `private_key` and `<private_key>.pub` exist.
    pub fn load(private_key: &Path) -> DeployResult<Option<Self>> {
        let public_path = public_key_path(private_key);
        if !private_key.is_file() || !public_path.is_file() {
            return Ok(None);
        }
        let public_key = std::fs::read_to_string(&public_path)?.trim().to_string();
        if public_key.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            private_key: private_key.to_path_buf(),
            public_key,
        }))
    }

    /// Reuses `<ssh_dir>/<name>` when present, else the copy in `run_dir`,
    /// else generates a fresh ed25519 key in `run_dir`.
    pub async fn ensure(name: &str, run_dir: &Path, ssh_dir: Option<&Path>) -> DeployResult<Self> {
        if let Some(dir) = ssh_dir {
            if let Some(pair) = Self::load(&dir.join(name))? {
                tracing::info!(key = %pair.private_key.display(), "reusing ssh key");
                return Ok(pair);
            }
        }

        let private_key = run_dir.join(name);
        if let Some(pair) = Self::load(&private_key)? {
            return Ok(pair);
        }

        std::fs::create_dir_all(run_dir)?;
        SafeCommand::new(AllowedProgram::SshKeygen)
            .args(["-t", "ed25519", "-N", "", "-q", "-C", name, "-f"])
            .arg(private_key.to_string_lossy())
            .timeout(Duration::from_secs(30))
            .execute()
            .await
            .map_err(|e| DeployError::config(format!("failed to generate ssh key: {e}")))?;
        restrict_permissions(&private_key)?;
        tracing::info!(key = %private_key.display(), "generated ssh key");

        Self::load(&private_key)?
            .ok_or_else(|| DeployError::config(format!("ssh-keygen did not produce {}", private_key.display())))
    }

    /// Path of the private key.
    #[must_use]
    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// Public key in OpenSSH format.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
