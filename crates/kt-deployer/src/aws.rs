//! [`CloudProvider`](crate::cloud::CloudProvider) backed by the `aws` CLI.
//!
//! Each call runs one `aws <service> <operation> --output json` through
//! [`SafeCommand`] and decodes the JSON response. Credentials, retries and
//! pagination are left to the CLI.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::cloud::{
    CloudError, CloudResult, ComputeApi, IdentityApi, ImageDescription, InstanceDescription,
    InstanceProfileSummary, InstanceState, NetworkInterface, ObjectStore, ParameterStore,
    RoleSummary, RunInstanceRequest, Subnet,
};
use crate::command::{AllowedProgram, CommandError, SafeCommand};

/// Default limit for a single CLI call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// AWS client that shells out to the `aws` CLI.
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
    profile: Option<String>,
    program_path: Option<String>,
    call_timeout: Duration,
}

impl AwsCli {
    /// Creates a client for `region`.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            profile: None,
            program_path: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Uses a named CLI profile.
    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Runs the CLI from `path` instead of searching `PATH`.
    #[must_use]
    pub fn with_program_path(mut self, path: impl Into<String>) -> Self {
        self.program_path = Some(path.into());
        self
    }

    /// The configured region.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    fn command(&self, service: &str, operation: &str) -> SafeCommand {
        let mut cmd = SafeCommand::new(AllowedProgram::Aws);
        if let Some(path) = &self.program_path {
            cmd = cmd.with_program_path(path);
        }
        cmd = cmd
            .args([service, operation])
            .args(["--region", self.region.as_str(), "--output", "json"])
            .timeout(self.call_timeout);
        if let Some(profile) = &self.profile {
            cmd = cmd.args(["--profile", profile.as_str()]);
        }
        cmd
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, cmd: SafeCommand) -> CloudResult<T> {
        let output = cmd.execute().await.map_err(|e| map_command_error(operation, e))?;
        parse_response(operation, &output.stdout)
    }

    async fn call_unit(&self, operation: &str, cmd: SafeCommand) -> CloudResult<()> {
        cmd.execute().await.map_err(|e| map_command_error(operation, e))?;
        Ok(())
    }
}

fn map_command_error(operation: &str, error: CommandError) -> CloudError {
    match error {
        CommandError::NonZeroExit { stderr, .. } => CloudError::api(operation, stderr.trim()),
        CommandError::Timeout { timeout_secs, .. } => CloudError::Timeout {
            operation: operation.to_string(),
            timeout_secs,
        },
        other => CloudError::Command(other),
    }
}

/// Maps an API error naming a missing instance to [`CloudError::NotFound`].
fn instance_not_found(instance_id: &str, error: CloudError) -> CloudError {
    match error {
        CloudError::Api { ref message, .. } if message.contains("InvalidInstanceID.NotFound") => {
            CloudError::not_found("instance", instance_id)
        }
        other => other,
    }
}

fn parse_response<T: DeserializeOwned>(operation: &str, stdout: &[u8]) -> CloudResult<T> {
    let body: &[u8] = if stdout.iter().all(u8::is_ascii_whitespace) { b"{}" } else { stdout };
    serde_json::from_slice(body).map_err(|e| CloudError::Parse {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

/// Arguments for `ec2 run-instances`, after the service and operation.
pub fn run_instances_args(request: &RunInstanceRequest, user_data_file: &Path) -> Vec<String> {
    let interfaces = json!([{
        "DeviceIndex": 0,
        "SubnetId": request.subnet_id,
        "AssociatePublicIpAddress": request.associate_public_ip,
        "DeleteOnTermination": true,
    }]);
    let tags = json!([
        { "ResourceType": "instance", "Tags": request.tags },
        { "ResourceType": "volume", "Tags": request.tags },
    ]);
    let block_devices = json!([{
        "DeviceName": request.root_volume.device_name,
        "Ebs": {
            "VolumeSize": request.root_volume.size_gib,
            "VolumeType": request.root_volume.volume_type,
            "DeleteOnTermination": true,
        },
    }]);
    let http_tokens = if request.require_imdsv2 { "required" } else { "optional" };

    let mut args = vec![
        "--image-id".to_string(),
        request.image_id.clone(),
        "--instance-type".to_string(),
        request.instance_type.clone(),
        "--count".to_string(),
        "1".to_string(),
        "--network-interfaces".to_string(),
        interfaces.to_string(),
        "--tag-specifications".to_string(),
        tags.to_string(),
        "--block-device-mappings".to_string(),
        block_devices.to_string(),
        "--metadata-options".to_string(),
        format!("HttpTokens={http_tokens},HttpEndpoint=enabled"),
        "--user-data".to_string(),
        format!("file://{}", user_data_file.display()),
    ];
    if let Some(arn) = &request.instance_profile_arn {
        args.push("--iam-instance-profile".to_string());
        args.push(format!("Arn={arn}"));
    }
    args
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Reservations {
    reservations: Vec<InstanceList>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InstanceList {
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2Instance {
    instance_id: String,
    state: Ec2State,
    placement: Ec2Placement,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
    network_interfaces: Vec<Ec2NetworkInterface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2State {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2Placement {
    availability_zone: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2NetworkInterface {
    network_interface_id: String,
    private_ip_address: Option<String>,
    source_dest_check: bool,
    association: Option<Ec2Association>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2Association {
    public_ip: Option<String>,
}

impl From<Ec2Instance> for InstanceDescription {
    fn from(instance: Ec2Instance) -> Self {
        let network_interfaces = instance
            .network_interfaces
            .into_iter()
            .map(|eni| NetworkInterface {
                interface_id: eni.network_interface_id,
                private_ip: eni.private_ip_address,
                public_ip: eni.association.and_then(|a| a.public_ip),
                source_dest_check: eni.source_dest_check,
            })
            .collect::<Vec<_>>();
        Self {
            instance_id: instance.instance_id,
            state: InstanceState::from_name(&instance.state.name),
            availability_zone: instance.placement.availability_zone,
            private_ip: instance
                .private_ip_address
                .or_else(|| network_interfaces.iter().find_map(|n| n.private_ip.clone())),
            public_ip: instance
                .public_ip_address
                .or_else(|| network_interfaces.iter().find_map(|n| n.public_ip.clone())),
            network_interfaces,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Images {
    images: Vec<Ec2Image>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2Image {
    image_id: String,
    root_device_name: String,
    architecture: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Vpcs {
    vpcs: Vec<Ec2Vpc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2Vpc {
    vpc_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Subnets {
    subnets: Vec<Ec2Subnet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Ec2Subnet {
    subnet_id: String,
    availability_zone: String,
    vpc_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Roles {
    roles: Vec<IamRole>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreatedRole {
    role: IamRole,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct IamRole {
    role_name: String,
    arn: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InstanceProfiles {
    instance_profiles: Vec<IamInstanceProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreatedInstanceProfile {
    instance_profile: IamInstanceProfile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct IamInstanceProfile {
    instance_profile_name: String,
    arn: String,
    roles: Vec<IamRole>,
}

impl From<IamInstanceProfile> for InstanceProfileSummary {
    fn from(profile: IamInstanceProfile) -> Self {
        Self {
            name: profile.instance_profile_name,
            arn: profile.arn,
            roles: profile.roles.into_iter().map(|r| r.role_name).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ParameterResponse {
    parameter: Option<SsmParameter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SsmParameter {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ObjectListing {
    contents: Vec<S3Object>,
    common_prefixes: Vec<S3Prefix>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct S3Object {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct S3Prefix {
    prefix: String,
}

fn first_instance(operation: &str, instances: Vec<Ec2Instance>, id: &str) -> CloudResult<InstanceDescription> {
    instances
        .into_iter()
        .next()
        .map(InstanceDescription::from)
        .ok_or_else(|| {
            if id.is_empty() {
                CloudError::api(operation, "response contained no instances")
            } else {
                CloudError::not_found("instance", id)
            }
        })
}

impl ComputeApi for AwsCli {
    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<InstanceDescription> {
        let mut file = tempfile::Builder::new().prefix("user-data-").tempfile()?;
        file.write_all(request.user_data.as_bytes())?;
        file.flush()?;

        let cmd = self
            .command("ec2", "run-instances")
            .args(run_instances_args(request, file.path()));
        let response: InstanceList = self.call("ec2 run-instances", cmd).await?;
        first_instance("ec2 run-instances", response.instances, "")
    }

    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription> {
        let cmd = self
            .command("ec2", "describe-instances")
            .args(["--instance-ids", instance_id]);
        let response: Reservations = self
            .call("ec2 describe-instances", cmd)
            .await
            .map_err(|e| instance_not_found(instance_id, e))?;
        let instances = response.reservations.into_iter().flat_map(|r| r.instances).collect();
        first_instance("ec2 describe-instances", instances, instance_id)
    }

    async fn wait_until_running(&self, instance_id: &str, timeout: Duration) -> CloudResult<()> {
        let cmd = self
            .command("ec2", "wait")
            .timeout(timeout)
            .args(["instance-running", "--instance-ids", instance_id]);
        self.call_unit("ec2 wait instance-running", cmd).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        let cmd = self
            .command("ec2", "terminate-instances")
            .args(["--instance-ids", instance_id]);
        self.call_unit("ec2 terminate-instances", cmd)
            .await
            .map_err(|e| instance_not_found(instance_id, e))
    }

    async fn describe_image(&self, image_id: &str) -> CloudResult<ImageDescription> {
        let cmd = self.command("ec2", "describe-images").args(["--image-ids", image_id]);
        let response: Images = self.call("ec2 describe-images", cmd).await?;
        response
            .images
            .into_iter()
            .next()
            .map(|image| ImageDescription {
                image_id: image.image_id,
                root_device_name: image.root_device_name,
                architecture: image.architecture,
            })
            .ok_or_else(|| CloudError::not_found("image", image_id))
    }

    async fn disable_source_dest_check(&self, interface_id: &str) -> CloudResult<()> {
        let cmd = self
            .command("ec2", "modify-network-interface-attribute")
            .args(["--network-interface-id", interface_id, "--no-source-dest-check"]);
        self.call_unit("ec2 modify-network-interface-attribute", cmd).await
    }

    async fn default_vpc_subnets(&self) -> CloudResult<Vec<Subnet>> {
        let cmd = self
            .command("ec2", "describe-vpcs")
            .args(["--filters", "Name=isDefault,Values=true"]);
        let vpcs: Vpcs = self.call("ec2 describe-vpcs", cmd).await?;
        let vpc = vpcs
            .vpcs
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::not_found("default vpc", self.region.clone()))?;

        let cmd = self
            .command("ec2", "describe-subnets")
            .args(["--filters".to_string(), format!("Name=vpc-id,Values={}", vpc.vpc_id)]);
        let subnets: Subnets = self.call("ec2 describe-subnets", cmd).await?;
        Ok(subnets
            .subnets
            .into_iter()
            .map(|s| Subnet {
                subnet_id: s.subnet_id,
                availability_zone: s.availability_zone,
                vpc_id: s.vpc_id,
            })
            .collect())
    }

    async fn send_ssh_public_key(
        &self,
        instance_id: &str,
        availability_zone: &str,
        os_user: &str,
        public_key: &str,
    ) -> CloudResult<()> {
        let cmd = self.command("ec2-instance-connect", "send-ssh-public-key").args([
            "--instance-id",
            instance_id,
            "--instance-os-user",
            os_user,
            "--availability-zone",
            availability_zone,
            "--ssh-public-key",
            public_key.trim(),
        ]);
        self.call_unit("ec2-instance-connect send-ssh-public-key", cmd).await
    }
}

impl IdentityApi for AwsCli {
    async fn list_roles(&self, path_prefix: &str) -> CloudResult<Vec<RoleSummary>> {
        let cmd = self.command("iam", "list-roles").args(["--path-prefix", path_prefix]);
        let response: Roles = self.call("iam list-roles", cmd).await?;
        Ok(response
            .roles
            .into_iter()
            .map(|r| RoleSummary {
                name: r.role_name,
                arn: r.arn,
            })
            .collect())
    }

    async fn create_role(&self, name: &str, path: &str, trust_policy: &str) -> CloudResult<RoleSummary> {
        let cmd = self.command("iam", "create-role").args([
            "--role-name",
            name,
            "--path",
            path,
            "--assume-role-policy-document",
            trust_policy,
        ]);
        let response: CreatedRole = self.call("iam create-role", cmd).await?;
        Ok(RoleSummary {
            name: response.role.role_name,
            arn: response.role.arn,
        })
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        let cmd = self
            .command("iam", "attach-role-policy")
            .args(["--role-name", role, "--policy-arn", policy_arn]);
        self.call_unit("iam attach-role-policy", cmd).await
    }

    async fn list_instance_profiles(&self, path_prefix: &str) -> CloudResult<Vec<InstanceProfileSummary>> {
        let cmd = self
            .command("iam", "list-instance-profiles")
            .args(["--path-prefix", path_prefix]);
        let response: InstanceProfiles = self.call("iam list-instance-profiles", cmd).await?;
        Ok(response.instance_profiles.into_iter().map(Into::into).collect())
    }

    async fn list_instance_profiles_for_role(&self, role: &str) -> CloudResult<Vec<InstanceProfileSummary>> {
        let cmd = self
            .command("iam", "list-instance-profiles-for-role")
            .args(["--role-name", role]);
        let response: InstanceProfiles = self.call("iam list-instance-profiles-for-role", cmd).await?;
        Ok(response.instance_profiles.into_iter().map(Into::into).collect())
    }

    async fn create_instance_profile(&self, name: &str, path: &str) -> CloudResult<InstanceProfileSummary> {
        let cmd = self
            .command("iam", "create-instance-profile")
            .args(["--instance-profile-name", name, "--path", path]);
        let response: CreatedInstanceProfile = self.call("iam create-instance-profile", cmd).await?;
        Ok(response.instance_profile.into())
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let cmd = self
            .command("iam", "add-role-to-instance-profile")
            .args(["--instance-profile-name", profile, "--role-name", role]);
        self.call_unit("iam add-role-to-instance-profile", cmd).await
    }
}

impl ParameterStore for AwsCli {
    async fn get_parameter(&self, name: &str) -> CloudResult<String> {
        let cmd = self.command("ssm", "get-parameter").args(["--name", name]);
        let response: ParameterResponse = self.call("ssm get-parameter", cmd).await?;
        response
            .parameter
            .map(|p| p.value)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CloudError::not_found("parameter", name))
    }
}

impl ObjectStore for AwsCli {
    async fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        let cmd = self.command("s3api", "head-bucket").args(["--bucket", bucket]);
        self.call_unit("s3api head-bucket", cmd).await
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<String>> {
        let cmd = self.command("s3api", "list-objects-v2").args([
            "--bucket",
            bucket,
            "--prefix",
            prefix,
            "--delimiter",
            "/",
        ]);
        let response: ObjectListing = self.call("s3api list-objects-v2", cmd).await?;
        Ok(response
            .common_prefixes
            .into_iter()
            .map(|p| p.prefix)
            .chain(response.contents.into_iter().map(|o| o.key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{RootVolume, Tag};
    use std::path::PathBuf;

    fn request() -> RunInstanceRequest {
        RunInstanceRequest {
            image_id: "ami-0123456789abcdef0".into(),
            instance_type: "t3a.medium".into(),
            subnet_id: "subnet-1".into(),
            associate_public_ip: true,
            tags: vec![
                Tag::new("Name", "tmp-e2e-1a2b3c4d-control-plane"),
                Tag::new("kubernetes.io/cluster/tmp-e2e-1a2b3c4d", "owned"),
            ],
            root_volume: RootVolume {
                device_name: "/dev/sda1".into(),
                size_gib: 50,
                volume_type: "gp3".into(),
            },
            require_imdsv2: true,
            user_data: "#cloud-config\n".into(),
            instance_profile_arn: Some("arn:aws:iam::1:instance-profile/kubetest2/p".into()),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let index = args.iter().position(|a| a == flag).unwrap();
        &args[index + 1]
    }

    #[test]
    fn run_instances_args_carry_every_setting() {
        let args = run_instances_args(&request(), &PathBuf::from("/tmp/ud"));
        assert_eq!(value_after(&args, "--image-id"), "ami-0123456789abcdef0");
        assert_eq!(value_after(&args, "--user-data"), "file:///tmp/ud");
        assert_eq!(value_after(&args, "--metadata-options"), "HttpTokens=required,HttpEndpoint=enabled");
        assert_eq!(
            value_after(&args, "--iam-instance-profile"),
            "Arn=arn:aws:iam::1:instance-profile/kubetest2/p"
        );

        let interfaces: serde_json::Value =
            serde_json::from_str(value_after(&args, "--network-interfaces")).unwrap();
        assert_eq!(interfaces.as_array().map(Vec::len), Some(1));
        assert_eq!(interfaces[0]["AssociatePublicIpAddress"], true);

        let devices: serde_json::Value =
            serde_json::from_str(value_after(&args, "--block-device-mappings")).unwrap();
        assert_eq!(devices[0]["DeviceName"], "/dev/sda1");
        assert_eq!(devices[0]["Ebs"]["VolumeSize"], 50);
        assert_eq!(devices[0]["Ebs"]["VolumeType"], "gp3");

        let tags: serde_json::Value =
            serde_json::from_str(value_after(&args, "--tag-specifications")).unwrap();
        assert_eq!(tags[0]["ResourceType"], "instance");
        assert_eq!(tags[1]["ResourceType"], "volume");
        assert_eq!(tags[1]["Tags"][1]["Key"], "kubernetes.io/cluster/tmp-e2e-1a2b3c4d");

        assert!(args.iter().all(|a| !a.contains('\n')));
    }

    #[test]
    fn run_instances_args_without_profile() {
        let mut req = request();
        req.instance_profile_arn = None;
        let args = run_instances_args(&req, &PathBuf::from("/tmp/ud"));
        assert!(!args.iter().any(|a| a == "--iam-instance-profile"));
    }

    #[test]
    fn parses_describe_instances() {
        let body = br#"{"Reservations":[{"Instances":[{
            "InstanceId":"i-0abc","State":{"Code":16,"Name":"running"},
            "Placement":{"AvailabilityZone":"us-east-1b"},
            "PrivateIpAddress":"172.31.4.10",
            "NetworkInterfaces":[{"NetworkInterfaceId":"eni-1","PrivateIpAddress":"172.31.4.10",
                "SourceDestCheck":true,"Association":{"PublicIp":"203.0.113.5"}}]
        }]}]}"#;
        let response: Reservations = parse_response("ec2 describe-instances", body).unwrap();
        let instances = response.reservations.into_iter().flat_map(|r| r.instances).collect();
        let description = first_instance("ec2 describe-instances", instances, "i-0abc").unwrap();
        assert_eq!(description.state, InstanceState::Running);
        assert_eq!(description.availability_zone, "us-east-1b");
        assert_eq!(description.public_ip.as_deref(), Some("203.0.113.5"));
        assert!(description.network_interfaces[0].source_dest_check);
    }

    #[test]
    fn empty_reservations_is_not_found() {
        let response: Reservations = parse_response("ec2 describe-instances", b"{\"Reservations\":[]}").unwrap();
        let instances = response.reservations.into_iter().flat_map(|r| r.instances).collect();
        let err = first_instance("ec2 describe-instances", instances, "i-gone").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_stdout_decodes_as_empty_object() {
        let listing: ObjectListing = parse_response("s3api list-objects-v2", b"\n").unwrap();
        assert!(listing.contents.is_empty());
        assert!(listing.common_prefixes.is_empty());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_response::<Images>("ec2 describe-images", b"<html>").unwrap_err();
        assert!(matches!(err, CloudError::Parse { .. }));
    }

    #[test]
    fn parses_instance_profiles() {
        let body = br#"{"InstanceProfiles":[{"InstanceProfileName":"p","Arn":"arn:p",
            "Path":"/kubetest2/","Roles":[{"RoleName":"r","Arn":"arn:r"}]}]}"#;
        let response: InstanceProfiles = parse_response("iam list-instance-profiles", body).unwrap();
        let profiles: Vec<InstanceProfileSummary> =
            response.instance_profiles.into_iter().map(Into::into).collect();
        assert_eq!(profiles[0].name, "p");
        assert_eq!(profiles[0].roles, vec!["r".to_string()]);
    }

    #[test]
    fn command_errors_map_to_cloud_errors() {
        let err = map_command_error(
            "ssm get-parameter",
            CommandError::NonZeroExit {
                command: "aws".into(),
                exit_code: 254,
                stdout: String::new(),
                stderr: "ParameterNotFound\n".into(),
            },
        );
        assert_eq!(err.to_string(), "ssm get-parameter failed: ParameterNotFound");

        let err = map_command_error(
            "ec2 wait instance-running",
            CommandError::Timeout {
                command: "aws".into(),
                timeout_secs: 300,
            },
        );
        assert!(matches!(err, CloudError::Timeout { timeout_secs: 300, .. }));
    }

    #[test]
    fn missing_instance_maps_to_not_found() {
        let err = instance_not_found(
            "i-gone",
            CloudError::api(
                "ec2 terminate-instances",
                "An error occurred (InvalidInstanceID.NotFound) when calling the TerminateInstances operation",
            ),
        );
        assert!(err.is_not_found());

        let err = instance_not_found("i-1", CloudError::api("ec2 terminate-instances", "RequestLimitExceeded"));
        assert!(!err.is_not_found());
    }
}
