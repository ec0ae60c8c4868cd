//! Idempotent IAM role and instance-profile provisioning.

use serde_json::json;

use crate::cloud::IdentityApi;
use crate::error::{DeployError, DeployResult};

/// IAM path every role and profile lives under.
pub const IAM_PATH: &str = "/kubetest2/";

/// Managed policies attached to a newly created role.
pub const MANAGED_POLICIES: [&str; 7] = [
    "AmazonEC2ContainerRegistryReadOnly",
    "AmazonEKSClusterPolicy",
    "AmazonEKSServicePolicy",
    "AmazonEKSVPCResourceController",
    "AmazonEKSWorkerNodePolicy",
    "AmazonEKS_CNI_Policy",
    "AmazonS3ReadOnlyAccess",
];

/// Assume-role document for EC2 and EKS.
#[must_use]
pub fn trust_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": ["ec2.amazonaws.com", "eks.amazonaws.com"] },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// Creates the instance role and profile on first use.
#[derive(Debug)]
pub struct Provisioner<'a, I> {
    iam: &'a I,
}

impl<'a, I: IdentityApi> Provisioner<'a, I> {
    /// Creates a provisioner over `iam`.
    #[must_use]
    pub fn new(iam: &'a I) -> Self {
        Self { iam }
    }

    /// Ensures role `name` exists, creating it with the managed policies if not.
    pub async fn ensure_role(&self, name: &str) -> DeployResult<()> {
        let roles = self.iam.list_roles(IAM_PATH).await?;
        if roles.iter().any(|r| r.name == name) {
            tracing::debug!(role = name, "role already exists");
            return Ok(());
        }

        let role = self.iam.create_role(name, IAM_PATH, &trust_policy()).await?;
        tracing::info!(role = %role.name, arn = %role.arn, "created role");
        for policy in MANAGED_POLICIES {
            self.iam
                .attach_role_policy(name, &format!("arn:aws:iam::aws:policy/{policy}"))
                .await?;
        }
        Ok(())
    }

    /// Ensures instance profile `profile` exists and carries `role`.
    pub async fn ensure_instance_profile(&self, profile: &str, role: &str) -> DeployResult<()> {
        let profiles = self.iam.list_instance_profiles(IAM_PATH).await?;
        if profiles.iter().any(|p| p.name == profile) {
            tracing::debug!(profile, "instance profile already exists");
            return Ok(());
        }

        let created = self.iam.create_instance_profile(profile, IAM_PATH).await?;
        tracing::info!(profile = %created.name, arn = %created.arn, "created instance profile");

        // A role can belong to at most one instance profile, wherever it lives.
        let holders = self.iam.list_instance_profiles_for_role(role).await?;
        if let Some(holder) = holders.first() {
            tracing::debug!(role, profile = %holder.name, "role already attached to an instance profile");
        } else {
            self.iam.add_role_to_instance_profile(profile, role).await?;
        }
        Ok(())
    }

    /// ARN of instance profile `name`.
    pub async fn instance_profile_arn(&self, name: &str) -> DeployResult<String> {
        self.iam
            .list_instance_profiles(IAM_PATH)
            .await?
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.arn)
            .ok_or_else(|| DeployError::config(format!("instance profile {name} not found under {IAM_PATH}")))
    }

    /// Ensures both role and profile, then returns the profile ARN.
    pub async fn provision(&self, role: &str, profile: &str) -> DeployResult<String> {
        self.ensure_role(role).await?;
        self.ensure_instance_profile(profile, role).await?;
        self.instance_profile_arn(profile).await
    }
}
