//! The `{{TOKEN}}` vocabulary shared by every template.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches any `{{NAME}}` token, tolerating inner whitespace.
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*[A-Za-z0-9_]+\s*\}\}").unwrap_or_else(|_| unreachable!())
});

/// A named placeholder that may appear in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// Artifact bucket or base URL holding staged binaries.
    StagingBucket,
    /// Version directory under the staging location.
    StagingVersion,
    /// kubeadm bootstrap token.
    KubeadmToken,
    /// kubeadm certificate key for uploaded control-plane certs.
    KubeadmCertificateKey,
    /// Cluster identifier.
    KubeadmClusterId,
    /// `"true"` on the control plane, `"false"` on workers.
    KubeadmControlPlane,
    /// Private IP of the control plane; filled in at launch time.
    KubeadmControlPlaneIp,
    /// Comma separated feature gates.
    FeatureGates,
    /// API server `--runtime-config`.
    RuntimeConfig,
    /// `""` or `"external"`.
    ExternalCloudProvider,
    /// Image override for the cloud controller manager.
    ExternalCloudProviderImage,
    /// Whether the AWS load balancer controller is installed.
    ExternalLoadBalancer,
    /// Whether the NVIDIA device plugin is installed.
    EnableNvidiaDevicePlugin,
    /// Embedded `configure.sh`.
    ConfigureSh,
    /// Embedded `kubeadm-init.yaml`.
    KubeadmInitYaml,
    /// Embedded `kubeadm-join.yaml`.
    KubeadmJoinYaml,
    /// Embedded `run-kubeadm.sh`.
    RunKubeadmSh,
    /// Embedded `run-post-install.sh`.
    RunPostInstallSh,
    /// Embedded `containerd-installation.service`.
    ContainerdInstallationService,
    /// Embedded `kubeadm.service`.
    KubeadmService,
}

impl Placeholder {
    /// Scalar substitutions in the order they are applied. The role flag is last.
    pub const SCALARS: [Self; 12] = [
        Self::StagingBucket,
        Self::StagingVersion,
        Self::KubeadmToken,
        Self::KubeadmCertificateKey,
        Self::KubeadmClusterId,
        Self::FeatureGates,
        Self::RuntimeConfig,
        Self::ExternalCloudProvider,
        Self::ExternalCloudProviderImage,
        Self::ExternalLoadBalancer,
        Self::EnableNvidiaDevicePlugin,
        Self::KubeadmControlPlane,
    ];

    /// The only token allowed to survive composition.
    pub const LAUNCH_TIME: Self = Self::KubeadmControlPlaneIp;

    /// Bare token name, e.g. `STAGING_BUCKET`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StagingBucket => "STAGING_BUCKET",
            Self::StagingVersion => "STAGING_VERSION",
            Self::KubeadmToken => "KUBEADM_TOKEN",
            Self::KubeadmCertificateKey => "KUBEADM_CERTIFICATE_KEY",
            Self::KubeadmClusterId => "KUBEADM_CLUSTER_ID",
            Self::KubeadmControlPlane => "KUBEADM_CONTROL_PLANE",
            Self::KubeadmControlPlaneIp => "KUBEADM_CONTROL_PLANE_IP",
            Self::FeatureGates => "FEATURE_GATES",
            Self::RuntimeConfig => "RUNTIME_CONFIG",
            Self::ExternalCloudProvider => "EXTERNAL_CLOUD_PROVIDER",
            Self::ExternalCloudProviderImage => "EXTERNAL_CLOUD_PROVIDER_IMAGE",
            Self::ExternalLoadBalancer => "EXTERNAL_LOAD_BALANCER",
            Self::EnableNvidiaDevicePlugin => "ENABLE_NVIDIA_DEVICE_PLUGIN",
            Self::ConfigureSh => "CONFIGURE_SH",
            Self::KubeadmInitYaml => "KUBEADM_INIT_YAML",
            Self::KubeadmJoinYaml => "KUBEADM_JOIN_YAML",
            Self::RunKubeadmSh => "RUN_KUBEADM_SH",
            Self::RunPostInstallSh => "RUN_POST_INSTALL_SH",
            Self::ContainerdInstallationService => "CONTAINERD_INSTALLATION_SERVICE",
            Self::KubeadmService => "KUBEADM_SERVICE",
        }
    }

    /// The literal token as it appears in templates, e.g. `{{STAGING_BUCKET}}`.
    #[must_use]
    pub fn token(&self) -> String {
        format!("{{{{{}}}}}", self.name())
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returns every `{{TOKEN}}` occurrence in `text`, in order of appearance.
#[must_use]
pub fn find_placeholders(text: &str) -> Vec<&str> {
    PLACEHOLDER_RE.find_iter(text).map(|m| m.as_str()).collect()
}
