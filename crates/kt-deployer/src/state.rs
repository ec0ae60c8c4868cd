//! Session state persisted between `up` and later commands.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kt_userdata::NodeRole;

use crate::error::{DeployError, DeployResult};
use crate::launcher::InstanceRecord;

/// File name of the state file inside the run directory.
pub const STATE_FILE: &str = "session.json";

/// One tracked instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedInstance {
    /// Instance id.
    pub instance_id: String,
    /// Node role.
    pub role: NodeRole,
    /// Public address, if known.
    pub public_ip: Option<String>,
    /// Private address, if known.
    pub private_ip: Option<String>,
    /// SSH key, if one was installed.
    pub key_file: Option<PathBuf>,
}

impl From<&InstanceRecord> for TrackedInstance {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            role: record.role,
            public_ip: record.public_ip.clone(),
            private_ip: record.private_ip.clone(),
            key_file: record.key_file.clone(),
        }
    }
}

/// Everything a later process needs to inspect or tear down a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Cluster id.
    pub cluster_id: String,
    /// Region.
    pub region: String,
    /// When the session started.
    pub created_at: DateTime<Utc>,
    /// Launched instances, control plane first.
    pub instances: Vec<TrackedInstance>,
    /// Kubeconfig written for the cluster.
    pub kubeconfig: Option<PathBuf>,
}

impl SessionState {
    /// Creates an empty state.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            region: region.into(),
            created_at: Utc::now(),
            instances: Vec::new(),
            kubeconfig: None,
        }
    }

    /// Path of the state file in `run_dir`.
    #[must_use]
    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(STATE_FILE)
    }

    /// Inserts or replaces the entry for `instance`.
    pub fn track(&mut self, instance: TrackedInstance) {
        match self.instances.iter_mut().find(|i| i.instance_id == instance.instance_id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    /// The control-plane entry, if any.
    #[must_use]
    pub fn control_plane(&self) -> Option<&TrackedInstance> {
        self.instances.iter().find(|i| i.role.is_control_plane())
    }

    /// Writes the state atomically.
    pub fn save(&self, run_dir: &Path) -> DeployResult<()> {
        std::fs::create_dir_all(run_dir)?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DeployError::State(format!("failed to serialize session: {e}")))?;
        let path = Self::path(run_dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), instances = self.instances.len(), "saved session state");
        Ok(())
    }

    /// Loads the state from `run_dir`.
    pub fn load(run_dir: &Path) -> DeployResult<Self> {
        let path = Self::path(run_dir);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DeployError::State(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| DeployError::State(format!("invalid session state in {}: {e}", path.display())))
    }

    /// Deletes the state file; a missing file is not an error.
    pub fn remove(run_dir: &Path) -> DeployResult<()> {
        match std::fs::remove_file(Self::path(run_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
