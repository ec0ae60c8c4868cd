//! Admin kubeconfig rewriting, persistence and lookup.

use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{DeployError, DeployResult};

/// Path of the admin credentials on the control plane.
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

static SERVER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?P<prefix>[ \t]*server:[ \t]*)https://[^\s]*:6443[ \t]*$").unwrap_or_else(|_| unreachable!())
});

/// Points every `server: https://<host>:6443` line at `public_ip`.
///
/// All other lines are returned byte for byte.
#[must_use]
pub fn rewrite_server(content: &str, public_ip: &str) -> String {
    SERVER_LINE
        .replace_all(content, |caps: &regex::Captures<'_>| {
            format!("{}https://{public_ip}:6443", &caps["prefix"])
        })
        .into_owned()
}

/// Writes `content` to a fresh 0600 file in `dir` and returns its path.
pub fn persist_private(dir: &Path, content: &str) -> DeployResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("kubeconfig-")
        .tempfile_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    let (_, path) = file
        .keep()
        .map_err(|e| DeployError::Kubeconfig(format!("failed to keep kubeconfig: {e}")))?;
    Ok(path)
}

/// Writes `content` to `path`, creating parent directories.
pub fn write_to(path: &Path, content: &str) -> DeployResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    restrict_permissions(path)?;
    Ok(())
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

/// The user's default kubeconfig, `$HOME/.kube/config`.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

/// Stores a rewritten kubeconfig.
///
/// The content always goes to a private file in `run_dir`. It is then
/// copied to `explicit` when given, otherwise mirrored to the user's
/// default location. The returned path is the one callers should use.
pub fn store(content: &str, run_dir: &Path, explicit: Option<&Path>) -> DeployResult<PathBuf> {
    let private = persist_private(run_dir, content)?;
    tracing::info!(path = %private.display(), "wrote kubeconfig");

    match explicit {
        Some(path) => {
            write_to(path, content)?;
            tracing::info!(path = %path.display(), "wrote kubeconfig to configured path");
            Ok(path.to_path_buf())
        }
        None => {
            if let Some(default) = default_path() {
                match write_to(&default, content) {
                    Ok(()) => tracing::info!(path = %default.display(), "mirrored kubeconfig"),
                    Err(e) => tracing::warn!(path = %default.display(), error = %e, "failed to mirror kubeconfig"),
                }
            }
            Ok(private)
        }
    }
}

/// Picks the kubeconfig to use: `explicit`, then `env_value`, then `default`.
#[must_use]
pub fn resolve(explicit: Option<&Path>, env_value: Option<&str>, default: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value.filter(|v| !v.is_empty()).map(PathBuf::from))
        .or(default)
}

/// [`resolve`] against `$KUBECONFIG` and `$HOME/.kube/config`.
#[must_use]
pub fn lookup(explicit: Option<&Path>) -> Option<PathBuf> {
    let env_value = std::env::var("KUBECONFIG").ok();
    resolve(explicit, env_value.as_deref(), default_path())
}
