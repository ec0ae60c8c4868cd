//! Checks that the staged binaries a node will download actually exist.

use std::collections::BTreeSet;

use crate::cloud::ObjectStore;
use crate::error::{DeployError, DeployResult};

/// Returns true if `location` is a URL rather than a bucket name.
#[must_use]
pub fn is_url(location: &str) -> bool {
    location.contains("://")
}

/// Verifies that `version` is staged under `location`.
///
/// URL locations are trusted as-is. For a bucket, the bucket must be
/// reachable and hold keys under `version`; failing that, a staged
/// directory that is a proper prefix of `version` is accepted.
pub async fn validate_staging<S: ObjectStore>(store: &S, location: &str, version: &str) -> DeployResult<()> {
    if is_url(location) {
        tracing::debug!(location, "staging location is a URL, skipping bucket checks");
        return Ok(());
    }

    store
        .head_bucket(location)
        .await
        .map_err(|e| DeployError::staging(format!("unable to find bucket {location}: {e}")))?;

    let entries = store
        .list_prefix(location, version)
        .await
        .map_err(|e| DeployError::staging(format!("version {version} is missing from bucket {location}: {e}")))?;
    if !entries.is_empty() {
        tracing::info!(bucket = location, version, "found staged version");
        return Ok(());
    }

    let entries = store
        .list_prefix(location, "v")
        .await
        .map_err(|e| DeployError::staging(format!("unable to list items in bucket {location}: {e}")))?;
    let available: BTreeSet<&str> = entries
        .iter()
        .filter_map(|key| key.split('/').next())
        .filter(|dir| !dir.is_empty())
        .collect();

    if let Some(dir) = available
        .iter()
        .find(|dir| version.len() > dir.len() && version.starts_with(**dir))
    {
        tracing::info!(bucket = location, staged = dir, version, "using staged prefix");
        return Ok(());
    }

    Err(DeployError::staging(format!(
        "version {version} is missing from bucket {location}, choose one of [{}]",
        available.into_iter().collect::<Vec<_>>().join(", ")
    )))
}
