//! Boot image resolution.
//!
//! An explicit `ami-` id is used as given. An empty request or a known OS
//! name is turned into a public SSM parameter path and looked up.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cloud::ParameterStore;
use crate::error::{DeployError, DeployResult};

/// Default instance type on amd64.
pub const DEFAULT_INSTANCE_TYPE: &str = "t3a.medium";

/// Equivalent of [`DEFAULT_INSTANCE_TYPE`] on arm64.
pub const ARM64_INSTANCE_TYPE: &str = "t4g.medium";

static AMI_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ami-(?:[0-9a-f]{8}|[0-9a-f]{17})$").unwrap_or_else(|_| unreachable!()));

/// Checks that `image_id` looks like `ami-` followed by 8 or 17 hex digits.
pub fn validate_image_id(image_id: &str) -> DeployResult<()> {
    if AMI_ID_REGEX.is_match(image_id) {
        Ok(())
    } else {
        Err(DeployError::InvalidImageId(image_id.to_string()))
    }
}

/// CPU architecture of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// x86-64.
    #[default]
    Amd64,
    /// 64-bit ARM.
    Arm64,
}

impl Arch {
    /// Parses `amd64`/`x86_64` or `arm64`/`aarch64`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "amd64" | "x86_64" => Some(Self::Amd64),
            "arm64" | "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }

    /// Debian-style name used by Canonical's parameters.
    #[must_use]
    pub const fn debian_name(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    /// Kernel-style name used by Amazon Linux parameters.
    #[must_use]
    pub const fn kernel_name(&self) -> &'static str {
        match self {
            Self::Amd64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.debian_name())
    }
}

/// Operating systems with a known SSM parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OsImage {
    /// Ubuntu 24.04 LTS.
    #[default]
    Ubuntu2404,
    /// Ubuntu 22.04 LTS.
    Ubuntu2204,
    /// Amazon Linux 2023.
    Al2023,
}

impl OsImage {
    /// Maps an OS name to an image family; an empty name is Ubuntu 24.04.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "ubuntu2404" => Some(Self::Ubuntu2404),
            "ubuntu2204" => Some(Self::Ubuntu2204),
            "al2023" => Some(Self::Al2023),
            _ => None,
        }
    }

    /// SSM parameter holding the latest image id for `arch`.
    #[must_use]
    pub fn ssm_path(&self, arch: Arch) -> String {
        match self {
            Self::Ubuntu2404 => format!(
                "/aws/service/canonical/ubuntu/server/24.04/stable/current/{}/hvm/ebs-gp3/ami-id",
                arch.debian_name()
            ),
            Self::Ubuntu2204 => format!(
                "/aws/service/canonical/ubuntu/server/jammy/stable/current/{}/hvm/ebs-gp2/ami-id",
                arch.debian_name()
            ),
            Self::Al2023 => format!(
                "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-{}",
                arch.kernel_name()
            ),
        }
    }

    /// Login user baked into the image.
    #[must_use]
    pub const fn default_user(&self) -> &'static str {
        match self {
            Self::Ubuntu2404 | Self::Ubuntu2204 => "ubuntu",
            Self::Al2023 => "ec2-user",
        }
    }
}

/// A concrete image and the instance type to run it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// `ami-` id.
    pub image_id: String,
    /// Instance type, possibly swapped for the arm64 default.
    pub instance_type: String,
}

/// Resolves requested images through a parameter store.
#[derive(Debug)]
pub struct ImageResolver<'a, P> {
    store: &'a P,
}

impl<'a, P: ParameterStore> ImageResolver<'a, P> {
    /// Creates a resolver over `store`.
    #[must_use]
    pub fn new(store: &'a P) -> Self {
        Self { store }
    }

    /// Resolves `requested` (an `ami-` id, an OS name, or empty) for `arch`.
    pub async fn resolve(&self, requested: &str, arch: Arch, instance_type: &str) -> DeployResult<ResolvedImage> {
        let image_id = if requested.starts_with("ami-") {
            validate_image_id(requested)?;
            requested.to_string()
        } else {
            let os = OsImage::from_name(requested)
                .ok_or_else(|| DeployError::InvalidImageId(requested.to_string()))?;
            let path = os.ssm_path(arch);
            tracing::info!(path = %path, "image not pinned, looking up latest in SSM");
            let id = self.store.get_parameter(&path).await?;
            validate_image_id(&id)?;
            tracing::info!(image_id = %id, "using image from SSM");
            id
        };

        let instance_type = if arch == Arch::Arm64 && instance_type == DEFAULT_INSTANCE_TYPE {
            ARM64_INSTANCE_TYPE.to_string()
        } else {
            instance_type.to_string()
        };

        Ok(ResolvedImage {
            image_id,
            instance_type,
        })
    }
}
