//! Creates one instance per [`ImageSpec`].

use std::path::PathBuf;

use rand::seq::SliceRandom;

use kt_userdata::{NodeRole, RenderedUserData};

use crate::cloud::{
    ComputeApi, IdentityApi, InstanceDescription, InstanceState, NetworkInterface, RootVolume,
    RunInstanceRequest, Subnet, Tag,
};
use crate::error::{DeployError, DeployResult};
use crate::poll::{poll_until, Attempt, PollPolicy};
use crate::provision::Provisioner;
use crate::session::ClusterSession;

/// Root volume size in GiB.
pub const ROOT_VOLUME_GIB: u32 = 50;

/// Root volume type.
pub const ROOT_VOLUME_TYPE: &str = "gp3";

/// Tag carrying the node role.
pub const ROLE_TAG: &str = "kubetest-ec2/role";

/// Everything needed to launch one instance.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Human readable name, used as the `Name` tag.
    pub name: String,
    /// Node role; exactly one spec per session is the control plane.
    pub role: NodeRole,
    /// Concrete image id.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Composed user-data, still carrying the control-plane IP token.
    pub user_data: RenderedUserData,
    /// Instance profile name; empty for none.
    pub instance_profile: String,
}

/// A launched instance as the deployer tracks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Instance id.
    pub instance_id: String,
    /// `Name` tag.
    pub name: String,
    /// Node role.
    pub role: NodeRole,
    /// Availability zone.
    pub availability_zone: String,
    /// Public address, once known.
    pub public_ip: Option<String>,
    /// Private address, once known.
    pub private_ip: Option<String>,
    /// Attached interfaces.
    pub network_interfaces: Vec<NetworkInterface>,
    /// Private key used for SSH, once set up.
    pub key_file: Option<PathBuf>,
    /// Last observed state.
    pub state: InstanceState,
}

impl InstanceRecord {
    /// Creates a record from the create call's response.
    #[must_use]
    pub fn new(name: impl Into<String>, role: NodeRole, description: &InstanceDescription) -> Self {
        let mut record = Self {
            instance_id: description.instance_id.clone(),
            name: name.into(),
            role,
            availability_zone: String::new(),
            public_ip: None,
            private_ip: None,
            network_interfaces: Vec::new(),
            key_file: None,
            state: InstanceState::Pending,
        };
        record.update(description);
        record
    }

    /// Merges a fresh description, keeping known addresses.
    pub fn update(&mut self, description: &InstanceDescription) {
        self.state = description.state.clone();
        if !description.availability_zone.is_empty() {
            self.availability_zone.clone_from(&description.availability_zone);
        }
        if description.public_ip.is_some() {
            self.public_ip.clone_from(&description.public_ip);
        }
        if description.private_ip.is_some() {
            self.private_ip.clone_from(&description.private_ip);
        }
        if !description.network_interfaces.is_empty() {
            self.network_interfaces.clone_from(&description.network_interfaces);
        }
    }

    /// Returns true once both addresses are known.
    #[must_use]
    pub fn has_addresses(&self) -> bool {
        self.public_ip.is_some() && self.private_ip.is_some()
    }

    /// Returns true for the control-plane instance.
    #[must_use]
    pub fn is_control_plane(&self) -> bool {
        self.role.is_control_plane()
    }
}

/// Builds the create call for `spec`.
#[must_use]
pub fn build_request(
    spec: &ImageSpec,
    cluster_id: &str,
    subnet_id: &str,
    root_device_name: &str,
    user_data: String,
    instance_profile_arn: Option<String>,
) -> RunInstanceRequest {
    RunInstanceRequest {
        image_id: spec.image_id.clone(),
        instance_type: spec.instance_type.clone(),
        subnet_id: subnet_id.to_string(),
        associate_public_ip: true,
        tags: vec![
            Tag::new("Name", &spec.name),
            Tag::new(format!("kubernetes.io/cluster/{cluster_id}"), "owned"),
            Tag::new(ROLE_TAG, spec.role.to_string()),
        ],
        root_volume: RootVolume {
            device_name: root_device_name.to_string(),
            size_gib: ROOT_VOLUME_GIB,
            volume_type: ROOT_VOLUME_TYPE.to_string(),
        },
        require_imdsv2: true,
        user_data,
        instance_profile_arn,
    }
}

/// Picks a random default-VPC subnet outside `excluded_zones`.
pub async fn select_subnet<C: ComputeApi>(cloud: &C, excluded_zones: &[String]) -> DeployResult<Subnet> {
    let subnets: Vec<Subnet> = cloud
        .default_vpc_subnets()
        .await?
        .into_iter()
        .filter(|s| !excluded_zones.contains(&s.availability_zone))
        .collect();
    let subnet = subnets
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| DeployError::config("no usable subnet in the default VPC"))?;
    tracing::info!(subnet = %subnet.subnet_id, zone = %subnet.availability_zone, "selected subnet");
    Ok(subnet)
}

/// Launches instances into the session's subnet.
#[derive(Debug)]
pub struct Launcher<'a, C> {
    cloud: &'a C,
    session: &'a ClusterSession,
    excluded_zones: &'a [String],
    describe_policy: PollPolicy,
}

impl<'a, C: ComputeApi + IdentityApi> Launcher<'a, C> {
    /// Creates a launcher.
    #[must_use]
    pub fn new(
        cloud: &'a C,
        session: &'a ClusterSession,
        excluded_zones: &'a [String],
        describe_policy: PollPolicy,
    ) -> Self {
        Self {
            cloud,
            session,
            excluded_zones,
            describe_policy,
        }
    }

    /// The session subnet, chosen on first use.
    pub async fn subnet(&self) -> DeployResult<Subnet> {
        if let Some(subnet) = self.session.subnet() {
            return Ok(subnet.clone());
        }
        let picked = select_subnet(self.cloud, self.excluded_zones).await?;
        self.session.subnet_or_init(|| Ok(picked)).cloned()
    }

    /// Creates the instance for `spec` and waits briefly for its addresses.
    ///
    /// Missing addresses after the wait are not an error; the readiness
    /// poller keeps describing the instance.
    pub async fn launch(&self, spec: &ImageSpec) -> DeployResult<InstanceRecord> {
        let image = self.cloud.describe_image(&spec.image_id).await?;
        let profile_arn = if spec.instance_profile.is_empty() {
            None
        } else {
            Some(
                Provisioner::new(self.cloud)
                    .instance_profile_arn(&spec.instance_profile)
                    .await?,
            )
        };
        let user_data = spec.user_data.finalize(self.session.control_plane_ip())?;
        let subnet = self.subnet().await?;

        let request = build_request(
            spec,
            self.session.cluster_id(),
            &subnet.subnet_id,
            &image.root_device_name,
            user_data,
            profile_arn,
        );
        let created = self.cloud.run_instance(&request).await?;
        tracing::info!(
            instance_id = %created.instance_id,
            name = %spec.name,
            role = %spec.role,
            image_id = %spec.image_id,
            "created instance"
        );

        let mut record = InstanceRecord::new(&spec.name, spec.role, &created);
        if !record.has_addresses() {
            let cloud = self.cloud;
            let instance_id = record.instance_id.clone();
            let id = instance_id.as_str();
            let described = poll_until(&self.describe_policy, "instance addresses", move |_| async move {
                match cloud.describe_instance(id).await {
                    Ok(d) if d.has_addresses() => Attempt::Ready(d),
                    Ok(d) => Attempt::Retry(format!("no addresses yet (state {})", d.state)),
                    Err(e) => Attempt::Retry(e.to_string()),
                }
            })
            .await;
            match described {
                Ok(description) => record.update(&description),
                Err(e) => tracing::warn!(instance_id = %id, error = ?e, "addresses not yet assigned"),
            }
        }
        Ok(record)
    }
}
