//! Per-role rendering of the boot payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::encode::gzip_base64;
use crate::error::{UserDataError, UserDataResult};
use crate::placeholder::{find_placeholders, Placeholder};
use crate::template::{Document, TemplateSet};

/// Largest user-data payload EC2 accepts for a single instance.
pub const MAX_USER_DATA_BYTES: usize = 16 * 1024;

/// Role an instance plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs the API server and is initialised with `kubeadm init`.
    ControlPlane,
    /// Joins the cluster with `kubeadm join`.
    Worker,
}

impl NodeRole {
    /// Value substituted for `{{KUBEADM_CONTROL_PLANE}}`.
    #[must_use]
    pub const fn flag(&self) -> &'static str {
        match self {
            Self::ControlPlane => "true",
            Self::Worker => "false",
        }
    }

    /// Returns true for the control plane.
    #[must_use]
    pub const fn is_control_plane(&self) -> bool {
        matches!(self, Self::ControlPlane)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => f.write_str("control-plane"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Cluster-wide values substituted into every document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterValues {
    /// Bucket name or base URL holding the staged binaries.
    pub staging_bucket: String,
    /// Version directory under the staging location.
    pub staging_version: String,
    /// kubeadm bootstrap token.
    pub kubeadm_token: String,
    /// kubeadm certificate key.
    pub certificate_key: String,
    /// Cluster identifier.
    pub cluster_id: String,
    /// Comma separated feature gates.
    pub feature_gates: String,
    /// API server runtime config.
    pub runtime_config: String,
    /// Run the external cloud controller manager.
    pub external_cloud_provider: bool,
    /// Image override for the cloud controller manager.
    pub external_cloud_provider_image: String,
    /// Install the AWS load balancer controller.
    pub external_load_balancer: bool,
    /// Install the NVIDIA device plugin.
    pub enable_nvidia_device_plugin: bool,
}

impl ClusterValues {
    fn text_fields(&self) -> [(&'static str, &str); 8] {
        [
            ("staging_bucket", &self.staging_bucket),
            ("staging_version", &self.staging_version),
            ("kubeadm_token", &self.kubeadm_token),
            ("certificate_key", &self.certificate_key),
            ("cluster_id", &self.cluster_id),
            ("feature_gates", &self.feature_gates),
            ("runtime_config", &self.runtime_config),
            ("external_cloud_provider_image", &self.external_cloud_provider_image),
        ]
    }

    /// Rejects values that would break out of a quoted YAML or env string.
    pub fn validate(&self) -> UserDataResult<()> {
        for (field, value) in self.text_fields() {
            if let Some(c) = value.chars().find(|c| matches!(c, '"' | '\n' | '\r' | '\0')) {
                return Err(UserDataError::invalid_value(
                    field,
                    format!("contains forbidden character {c:?}"),
                ));
            }
            if value.contains("{{") {
                return Err(UserDataError::invalid_value(field, "contains a template token"));
            }
        }
        Ok(())
    }

    /// Produces the value for a scalar placeholder; `None` for documents and
    /// the launch-time token.
    fn produce(&self, placeholder: Placeholder, role: NodeRole) -> Option<String> {
        let value = match placeholder {
            Placeholder::StagingBucket => self.staging_bucket.clone(),
            Placeholder::StagingVersion => self.staging_version.clone(),
            Placeholder::KubeadmToken => self.kubeadm_token.clone(),
            Placeholder::KubeadmCertificateKey => self.certificate_key.clone(),
            Placeholder::KubeadmClusterId => self.cluster_id.clone(),
            Placeholder::FeatureGates => self.feature_gates.clone(),
            Placeholder::RuntimeConfig => self.runtime_config.clone(),
            Placeholder::ExternalCloudProvider => {
                let mode = if self.external_cloud_provider { "external" } else { "" };
                mode.to_string()
            }
            Placeholder::ExternalCloudProviderImage => self.external_cloud_provider_image.clone(),
            Placeholder::ExternalLoadBalancer => self.external_load_balancer.to_string(),
            Placeholder::EnableNvidiaDevicePlugin => self.enable_nvidia_device_plugin.to_string(),
            Placeholder::KubeadmControlPlane => role.flag().to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Renders user-data payloads for a cluster.
#[derive(Debug, Clone)]
pub struct Composer {
    values: ClusterValues,
    templates: TemplateSet,
}

impl Composer {
    /// Creates a composer over `values` and `templates`.
    #[must_use]
    pub fn new(values: ClusterValues, templates: TemplateSet) -> Self {
        Self { values, templates }
    }

    /// The values substituted by this composer.
    #[must_use]
    pub fn values(&self) -> &ClusterValues {
        &self.values
    }

    fn substitutions(&self, role: NodeRole) -> Vec<(String, String)> {
        Placeholder::SCALARS
            .iter()
            .filter_map(|p| self.values.produce(*p, role).map(|v| (p.token(), v)))
            .collect()
    }

    /// Renders the payload for `role`.
    ///
    /// Only `{{KUBEADM_CONTROL_PLANE_IP}}` may remain afterwards. The result is
    /// checked against [`MAX_USER_DATA_BYTES`].
    pub fn compose(&self, role: NodeRole) -> UserDataResult<RenderedUserData> {
        self.values.validate()?;
        let substitutions = self.substitutions(role);

        let mut payload = self.templates.load(Document::UserData)?.into_owned();
        for document in Document::EMBEDDED {
            let Some(placeholder) = document.placeholder() else {
                continue;
            };
            let text = apply(&self.templates.load(document)?, &substitutions);
            ensure_resolved(document.file_name(), &text, None)?;
            let encoded = gzip_base64(text.as_bytes()).map_err(|source| UserDataError::Encode {
                document: document.file_name().to_string(),
                source,
            })?;
            payload = payload.replace(&placeholder.token(), &encoded);
        }
        let payload = apply(&payload, &substitutions);
        ensure_resolved(Document::UserData.file_name(), &payload, Some(Placeholder::LAUNCH_TIME))?;
        ensure_size(role, payload.len())?;

        tracing::debug!(role = %role, bytes = payload.len(), "composed user-data");
        Ok(RenderedUserData { role, payload })
    }
}

fn apply(text: &str, substitutions: &[(String, String)]) -> String {
    substitutions
        .iter()
        .fold(text.to_string(), |acc, (token, value)| acc.replace(token, value))
}

fn ensure_resolved(document: &str, text: &str, allowed: Option<Placeholder>) -> UserDataResult<()> {
    let allowed = allowed.map(|p| p.token());
    match find_placeholders(text)
        .into_iter()
        .find(|token| allowed.as_deref() != Some(*token))
    {
        Some(token) => Err(UserDataError::unresolved(document, token)),
        None => Ok(()),
    }
}

fn ensure_size(role: NodeRole, size: usize) -> UserDataResult<()> {
    if size > MAX_USER_DATA_BYTES {
        return Err(UserDataError::PayloadTooLarge {
            role,
            size,
            limit: MAX_USER_DATA_BYTES,
        });
    }
    Ok(())
}

/// A composed payload still carrying the launch-time token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedUserData {
    role: NodeRole,
    payload: String,
}

impl RenderedUserData {
    /// Role this payload was rendered for.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// The composed text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.payload
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns true if the payload references the control-plane IP.
    #[must_use]
    pub fn needs_control_plane_ip(&self) -> bool {
        self.payload.contains(&Placeholder::LAUNCH_TIME.token())
    }

    /// Substitutes the control-plane IP and returns the final payload.
    ///
    /// The control plane renders the token as an empty string. Workers must
    /// be given the IP whenever their template references it.
    pub fn finalize(&self, control_plane_ip: Option<&str>) -> UserDataResult<String> {
        let ip = match (self.role, control_plane_ip) {
            (NodeRole::ControlPlane, _) => "",
            (NodeRole::Worker, Some(ip)) => ip,
            (NodeRole::Worker, None) if self.needs_control_plane_ip() => {
                return Err(UserDataError::invalid_value(
                    "control_plane_ip",
                    "worker user-data requires the control-plane address",
                ));
            }
            (NodeRole::Worker, None) => "",
        };
        if !ip.is_empty() && ip.parse::<std::net::IpAddr>().is_err() {
            return Err(UserDataError::invalid_value(
                "control_plane_ip",
                format!("{ip} is not an IP address"),
            ));
        }

        let payload = self.payload.replace(&Placeholder::LAUNCH_TIME.token(), ip);
        ensure_resolved(Document::UserData.file_name(), &payload, None)?;
        ensure_size(self.role, payload.len())?;
        Ok(payload)
    }
}
