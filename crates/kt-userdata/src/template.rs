//! Template documents and where their text comes from.
//!
//! Every document has an embedded default compiled into the binary. The base
//! user-data template and the two kubeadm configs can be overridden with
//! explicit files; `configure.sh` is picked up from the directory of an
//! overriding user-data file when one sits next to it.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{UserDataError, UserDataResult};
use crate::placeholder::Placeholder;

/// One template document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    /// The cloud-init base template the others are spliced into.
    UserData,
    /// Node preparation script.
    ConfigureSh,
    /// `kubeadm init` configuration.
    KubeadmInit,
    /// `kubeadm join` configuration.
    KubeadmJoin,
    /// Script running init or join.
    RunKubeadm,
    /// Add-on installation script.
    RunPostInstall,
    /// Unit running `configure.sh`.
    ContainerdInstallationService,
    /// Unit running `run-kubeadm.sh`.
    KubeadmService,
}

impl Document {
    /// Sub-documents in splice order.
    pub const EMBEDDED: [Self; 7] = [
        Self::ConfigureSh,
        Self::KubeadmInit,
        Self::KubeadmJoin,
        Self::RunKubeadm,
        Self::RunPostInstall,
        Self::ContainerdInstallationService,
        Self::KubeadmService,
    ];

    /// File name of the document.
    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::UserData => "ubuntu2404.yaml",
            Self::ConfigureSh => "configure.sh",
            Self::KubeadmInit => "kubeadm-init.yaml",
            Self::KubeadmJoin => "kubeadm-join.yaml",
            Self::RunKubeadm => "run-kubeadm.sh",
            Self::RunPostInstall => "run-post-install.sh",
            Self::ContainerdInstallationService => "containerd-installation.service",
            Self::KubeadmService => "kubeadm.service",
        }
    }

    /// Placeholder the encoded document replaces in the base template.
    #[must_use]
    pub const fn placeholder(&self) -> Option<Placeholder> {
        match self {
            Self::UserData => None,
            Self::ConfigureSh => Some(Placeholder::ConfigureSh),
            Self::KubeadmInit => Some(Placeholder::KubeadmInitYaml),
            Self::KubeadmJoin => Some(Placeholder::KubeadmJoinYaml),
            Self::RunKubeadm => Some(Placeholder::RunKubeadmSh),
            Self::RunPostInstall => Some(Placeholder::RunPostInstallSh),
            Self::ContainerdInstallationService => Some(Placeholder::ContainerdInstallationService),
            Self::KubeadmService => Some(Placeholder::KubeadmService),
        }
    }

    /// The compiled-in default text.
    #[must_use]
    pub const fn embedded(&self) -> &'static str {
        match self {
            Self::UserData => include_str!("../assets/ubuntu2404.yaml"),
            Self::ConfigureSh => include_str!("../assets/configure.sh"),
            Self::KubeadmInit => include_str!("../assets/kubeadm-init.yaml"),
            Self::KubeadmJoin => include_str!("../assets/kubeadm-join.yaml"),
            Self::RunKubeadm => include_str!("../assets/run-kubeadm.sh"),
            Self::RunPostInstall => include_str!("../assets/run-post-install.sh"),
            Self::ContainerdInstallationService => {
                include_str!("../assets/containerd-installation.service")
            }
            Self::KubeadmService => include_str!("../assets/kubeadm.service"),
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Where a document's text is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Compiled-in default.
    Embedded,
    /// File on disk.
    File(PathBuf),
}

/// Template overrides for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSet {
    /// Base user-data template override.
    #[serde(default)]
    pub user_data: Option<PathBuf>,
    /// `kubeadm-init.yaml` override.
    #[serde(default)]
    pub kubeadm_init: Option<PathBuf>,
    /// `kubeadm-join.yaml` override.
    #[serde(default)]
    pub kubeadm_join: Option<PathBuf>,
}

impl TemplateSet {
    /// Uses the embedded template for every document.
    #[must_use]
    pub fn embedded() -> Self {
        Self::default()
    }

    /// Overrides the base user-data template.
    #[must_use]
    pub fn with_user_data(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_data = Some(path.into());
        self
    }

    /// Overrides `kubeadm-init.yaml`.
    #[must_use]
    pub fn with_kubeadm_init(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeadm_init = Some(path.into());
        self
    }

    /// Overrides `kubeadm-join.yaml`.
    #[must_use]
    pub fn with_kubeadm_join(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeadm_join = Some(path.into());
        self
    }

    /// Resolves where `document` is read from.
    #[must_use]
    pub fn source(&self, document: Document) -> TemplateSource {
        let explicit = match document {
            Document::UserData => self.user_data.clone(),
            Document::KubeadmInit => self.kubeadm_init.clone(),
            Document::KubeadmJoin => self.kubeadm_join.clone(),
            Document::ConfigureSh => self
                .user_data
                .as_deref()
                .and_then(Path::parent)
                .map(|dir| dir.join(Document::ConfigureSh.file_name()))
                .filter(|candidate| candidate.is_file()),
            _ => None,
        };
        explicit.map_or(TemplateSource::Embedded, TemplateSource::File)
    }

    /// Loads the text of `document`.
    pub fn load(&self, document: Document) -> UserDataResult<Cow<'static, str>> {
        match self.source(document) {
            TemplateSource::Embedded => Ok(Cow::Borrowed(document.embedded())),
            TemplateSource::File(path) => {
                tracing::debug!(document = %document, path = %path.display(), "loading template override");
                std::fs::read_to_string(&path)
                    .map(Cow::Owned)
                    .map_err(|source| UserDataError::TemplateRead { path, source })
            }
        }
    }
}
