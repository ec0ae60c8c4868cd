//! Identity and learned facts of one cluster run.

use once_cell::sync::OnceCell;
use rand::Rng;

use kt_userdata::ClusterValues;

use crate::cloud::Subnet;
use crate::config::DeployerConfig;
use crate::error::{DeployError, DeployResult};

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
        .collect()
}

/// Generates a cluster id of the form `tmp-e2e-<8 hex>`.
#[must_use]
pub fn generate_cluster_id() -> String {
    format!("tmp-e2e-{}", hex::encode(rand::random::<[u8; 4]>()))
}

/// Generates a kubeadm bootstrap token (`[0-9a-z]{6}.[0-9a-z]{16}`).
#[must_use]
pub fn generate_kubeadm_token() -> String {
    format!("{}.{}", random_token(6), random_token(16))
}

/// Generates a certificate key: 32 random bytes, hex encoded.
#[must_use]
pub fn generate_certificate_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// One end-to-end run.
///
/// Everything except the subnet and the control-plane address is fixed at
/// construction. Those two are learned once and never change afterwards.
#[derive(Debug)]
pub struct ClusterSession {
    cluster_id: String,
    kubeadm_token: String,
    certificate_key: String,
    region: String,
    subnet: OnceCell<Subnet>,
    control_plane_ip: OnceCell<String>,
}

impl ClusterSession {
    /// Starts a session with freshly generated secrets.
    #[must_use]
    pub fn generate(region: impl Into<String>) -> Self {
        Self::from_parts(
            generate_cluster_id(),
            generate_kubeadm_token(),
            generate_certificate_key(),
            region,
        )
    }

    /// Rebuilds a session from known identity.
    #[must_use]
    pub fn from_parts(
        cluster_id: impl Into<String>,
        kubeadm_token: impl Into<String>,
        certificate_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            kubeadm_token: kubeadm_token.into(),
            certificate_key: certificate_key.into(),
            region: region.into(),
            subnet: OnceCell::new(),
            control_plane_ip: OnceCell::new(),
        }
    }

    /// Cluster identifier.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Bootstrap token shared by every node.
    #[must_use]
    pub fn kubeadm_token(&self) -> &str {
        &self.kubeadm_token
    }

    /// Key used to share control-plane certificates.
    #[must_use]
    pub fn certificate_key(&self) -> &str {
        &self.certificate_key
    }

    /// Region the cluster lives in.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Subnet chosen for this run, if already picked.
    #[must_use]
    pub fn subnet(&self) -> Option<&Subnet> {
        self.subnet.get()
    }

    /// Returns the session subnet, choosing it with `pick` the first time.
    pub fn subnet_or_init(&self, pick: impl FnOnce() -> DeployResult<Subnet>) -> DeployResult<&Subnet> {
        self.subnet.get_or_try_init(pick)
    }

    /// Control-plane private address, once learned.
    #[must_use]
    pub fn control_plane_ip(&self) -> Option<&str> {
        self.control_plane_ip.get().map(String::as_str)
    }

    /// Records the control-plane private address.
    ///
    /// Setting the same value again is accepted; a different value is an error.
    pub fn set_control_plane_ip(&self, ip: &str) -> DeployResult<()> {
        let stored = self.control_plane_ip.get_or_init(|| ip.to_string());
        if stored == ip {
            Ok(())
        } else {
            Err(DeployError::State(format!(
                "control-plane address already set to {stored}, refusing {ip}"
            )))
        }
    }

    /// Values substituted into every node's user-data.
    #[must_use]
    pub fn cluster_values(&self, config: &DeployerConfig) -> ClusterValues {
        ClusterValues {
            staging_bucket: config.staging_bucket.clone(),
            staging_version: config.staging_version.clone(),
            kubeadm_token: self.kubeadm_token.clone(),
            certificate_key: self.certificate_key.clone(),
            cluster_id: self.cluster_id.clone(),
            feature_gates: config.feature_gates.clone(),
            runtime_config: config.runtime_config.clone(),
            external_cloud_provider: config.external_cloud_provider,
            external_cloud_provider_image: config.external_cloud_provider_image.clone(),
            external_load_balancer: config.external_load_balancer,
            enable_nvidia_device_plugin: config.enable_nvidia_device_plugin,
        }
    }
}
