//! Cloud collaborator traits and the data they exchange.
//!
//! The deployer talks to the cloud through four narrow traits so every
//! component can be driven by an in-memory fake in tests. [`CloudProvider`]
//! is implemented for anything that implements all four.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandError;

/// Result type alias for cloud calls.
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Errors returned by cloud collaborators.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The API rejected a call.
    #[error("{operation} failed: {message}")]
    Api {
        /// API operation, e.g. `ec2 run-instances`.
        operation: String,
        /// Error reported by the API.
        message: String,
    },

    /// A named resource does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Resource identifier.
        id: String,
    },

    /// A response could not be decoded.
    #[error("failed to parse {operation} response: {message}")]
    Parse {
        /// API operation.
        operation: String,
        /// Decoder error.
        message: String,
    },

    /// A wait did not finish in time.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        /// API operation.
        operation: String,
        /// Timeout in seconds.
        timeout_secs: u64,
    },

    /// The client program could not be run.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// Creates an `Api` error.
    #[must_use]
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Returns true for a missing resource.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Being created.
    Pending,
    /// Running.
    Running,
    /// Being terminated.
    ShuttingDown,
    /// Gone.
    Terminated,
    /// Being stopped.
    Stopping,
    /// Stopped.
    Stopped,
    /// Anything the API adds later.
    Other(String),
}

impl InstanceState {
    /// Parses an EC2 state name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// A network interface attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkInterface {
    /// Interface id (`eni-...`).
    pub interface_id: String,
    /// Primary private address.
    pub private_ip: Option<String>,
    /// Associated public address.
    pub public_ip: Option<String>,
    /// Whether source/destination checking is on.
    pub source_dest_check: bool,
}

/// What `describe` reports about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    /// Instance id (`i-...`).
    pub instance_id: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Availability zone the instance was placed in.
    pub availability_zone: String,
    /// Primary private address.
    pub private_ip: Option<String>,
    /// Primary public address.
    pub public_ip: Option<String>,
    /// Attached interfaces.
    pub network_interfaces: Vec<NetworkInterface>,
}

impl InstanceDescription {
    /// Returns true once both addresses are known.
    #[must_use]
    pub fn has_addresses(&self) -> bool {
        self.private_ip.is_some() && self.public_ip.is_some()
    }
}

/// Image metadata needed to attach the root volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescription {
    /// Image id.
    pub image_id: String,
    /// Root device name, e.g. `/dev/sda1`.
    pub root_device_name: String,
    /// CPU architecture as reported by EC2 (`x86_64`, `arm64`).
    pub architecture: String,
}

/// A subnet in the default VPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet id.
    pub subnet_id: String,
    /// Availability zone.
    pub availability_zone: String,
    /// Owning VPC.
    pub vpc_id: String,
}

/// A resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Creates a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Root volume override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootVolume {
    /// Device name from the image metadata.
    pub device_name: String,
    /// Size in GiB.
    pub size_gib: u32,
    /// EBS volume type.
    pub volume_type: String,
}

/// A fully specified create-instance call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInstanceRequest {
    /// Image to boot.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Subnet for the single network interface.
    pub subnet_id: String,
    /// Associate a public IP with the interface.
    pub associate_public_ip: bool,
    /// Tags applied to the instance and its volumes.
    pub tags: Vec<Tag>,
    /// Root volume override.
    pub root_volume: RootVolume,
    /// Require IMDSv2 session tokens.
    pub require_imdsv2: bool,
    /// Final user-data text (not yet base64 encoded).
    pub user_data: String,
    /// Instance profile to attach.
    pub instance_profile_arn: Option<String>,
}

/// An IAM role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSummary {
    /// Role name.
    pub name: String,
    /// Role ARN.
    pub arn: String,
}

/// An IAM instance profile and the roles attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfileSummary {
    /// Profile name.
    pub name: String,
    /// Profile ARN.
    pub arn: String,
    /// Names of attached roles.
    pub roles: Vec<String>,
}

/// Compute operations.
pub trait ComputeApi: Send + Sync {
    /// Creates one instance.
    fn run_instance(
        &self,
        request: &RunInstanceRequest,
    ) -> impl Future<Output = CloudResult<InstanceDescription>> + Send;

    /// Describes one instance.
    fn describe_instance(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = CloudResult<InstanceDescription>> + Send;

    /// Blocks until the instance is running or `timeout` elapses.
    fn wait_until_running(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = CloudResult<()>> + Send;

    /// Terminates one instance.
    fn terminate_instance(&self, instance_id: &str) -> impl Future<Output = CloudResult<()>> + Send;

    /// Describes an image.
    fn describe_image(&self, image_id: &str) -> impl Future<Output = CloudResult<ImageDescription>> + Send;

    /// Turns off source/destination checking on an interface.
    fn disable_source_dest_check(&self, interface_id: &str) -> impl Future<Output = CloudResult<()>> + Send;

    /// Lists the subnets of the default VPC.
    fn default_vpc_subnets(&self) -> impl Future<Output = CloudResult<Vec<Subnet>>> + Send;

    /// Pushes a public key valid for about 60 seconds through EC2 Instance Connect.
    fn send_ssh_public_key(
        &self,
        instance_id: &str,
        availability_zone: &str,
        os_user: &str,
        public_key: &str,
    ) -> impl Future<Output = CloudResult<()>> + Send;
}

/// IAM operations.
pub trait IdentityApi: Send + Sync {
    /// Lists roles under `path_prefix`.
    fn list_roles(&self, path_prefix: &str) -> impl Future<Output = CloudResult<Vec<RoleSummary>>> + Send;

    /// Creates a role with the given trust policy.
    fn create_role(
        &self,
        name: &str,
        path: &str,
        trust_policy: &str,
    ) -> impl Future<Output = CloudResult<RoleSummary>> + Send;

    /// Attaches a managed policy to a role.
    fn attach_role_policy(&self, role: &str, policy_arn: &str) -> impl Future<Output = CloudResult<()>> + Send;

    /// Lists instance profiles under `path_prefix`.
    fn list_instance_profiles(
        &self,
        path_prefix: &str,
    ) -> impl Future<Output = CloudResult<Vec<InstanceProfileSummary>>> + Send;

    /// Lists the instance profiles holding `role`, under any path.
    fn list_instance_profiles_for_role(
        &self,
        role: &str,
    ) -> impl Future<Output = CloudResult<Vec<InstanceProfileSummary>>> + Send;

    /// Creates an instance profile.
    fn create_instance_profile(
        &self,
        name: &str,
        path: &str,
    ) -> impl Future<Output = CloudResult<InstanceProfileSummary>> + Send;

    /// Adds a role to an instance profile.
    fn add_role_to_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> impl Future<Output = CloudResult<()>> + Send;
}

/// Parameter store lookups.
pub trait ParameterStore: Send + Sync {
    /// Reads a parameter value.
    fn get_parameter(&self, name: &str) -> impl Future<Output = CloudResult<String>> + Send;
}

/// Object storage lookups.
pub trait ObjectStore: Send + Sync {
    /// Succeeds if the bucket exists and is readable.
    fn head_bucket(&self, bucket: &str) -> impl Future<Output = CloudResult<()>> + Send;

    /// Lists keys and common prefixes directly under `prefix`.
    fn list_prefix(&self, bucket: &str, prefix: &str) -> impl Future<Output = CloudResult<Vec<String>>> + Send;
}

/// Everything the deployer needs from the cloud.
pub trait CloudProvider: ComputeApi + IdentityApi + ParameterStore + ObjectStore {}

impl<T> CloudProvider for T where T: ComputeApi + IdentityApi + ParameterStore + ObjectStore {}
