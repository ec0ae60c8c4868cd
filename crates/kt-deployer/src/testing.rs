//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cloud::{
    CloudError, CloudResult, ComputeApi, IdentityApi, ImageDescription, InstanceDescription,
    InstanceProfileSummary, InstanceState, NetworkInterface, ObjectStore, ParameterStore,
    RoleSummary, RunInstanceRequest, Subnet,
};
use crate::remote::{RemoteError, RemoteExec, RemoteResult};

const ACCOUNT: &str = "123456789012";

#[derive(Debug, Default)]
struct FakeState {
    next_id: u32,
    instances: BTreeMap<String, InstanceDescription>,
    run_requests: Vec<RunInstanceRequest>,
    roles: Vec<(String, RoleSummary)>,
    attached_policies: Vec<(String, String)>,
    profiles: Vec<(String, InstanceProfileSummary)>,
    calls: Vec<String>,
}

/// A cloud that keeps every resource in memory.
#[derive(Debug)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
    parameters: HashMap<String, String>,
    buckets: BTreeMap<String, Vec<String>>,
    subnets: Vec<Subnet>,
    failing_terminations: HashSet<String>,
    never_running: HashSet<String>,
    slow_running: HashMap<String, Duration>,
    missing_images: HashSet<String>,
    fail_source_dest_check: bool,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    /// A cloud with two default-VPC subnets, one of them in `us-east-1e`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            parameters: HashMap::new(),
            buckets: BTreeMap::new(),
            subnets: vec![
                Subnet {
                    subnet_id: "subnet-0a".into(),
                    availability_zone: "us-east-1a".into(),
                    vpc_id: "vpc-default".into(),
                },
                Subnet {
                    subnet_id: "subnet-0e".into(),
                    availability_zone: "us-east-1e".into(),
                    vpc_id: "vpc-default".into(),
                },
            ],
            failing_terminations: HashSet::new(),
            never_running: HashSet::new(),
            slow_running: HashMap::new(),
            missing_images: HashSet::new(),
            fail_source_dest_check: false,
        }
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.buckets.entry(bucket.into()).or_default();
        self
    }

    pub fn with_object(mut self, bucket: &str, key: &str) -> Self {
        self.buckets.entry(bucket.into()).or_default().push(key.into());
        self
    }


    pub fn failing_termination(mut self, instance_id: &str) -> Self {
        self.failing_terminations.insert(instance_id.into());
        self
    }

    pub fn never_running(mut self, instance_id: &str) -> Self {
        self.never_running.insert(instance_id.into());
        self
    }

    /// Makes the running wait for `instance_id` take `delay`.
    pub fn slow_running(mut self, instance_id: &str, delay: Duration) -> Self {
        self.slow_running.insert(instance_id.into(), delay);
        self
    }

    pub fn missing_image(mut self, image_id: &str) -> Self {
        self.missing_images.insert(image_id.into());
        self
    }

    pub fn failing_source_dest_check(mut self) -> Self {
        self.fail_source_dest_check = true;
        self
    }

    /// Pre-creates a running instance, as if launched by an earlier process.
    pub fn seed_instance(&self, instance_id: &str, public_ip: &str, private_ip: &str) {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.instances.insert(
            instance_id.into(),
            described(instance_id, InstanceState::Running, "us-east-1a", private_ip, public_ip),
        );
    }

    /// Pre-creates an instance profile under `path` holding `roles`.
    pub fn seed_profile(&self, path: &str, name: &str, roles: &[&str]) {
        let profile = InstanceProfileSummary {
            name: name.into(),
            arn: format!("arn:aws:iam::{ACCOUNT}:instance-profile{path}{name}"),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
        };
        self.state.lock().profiles.push((path.into(), profile));
    }

    /// Every call made, in order, as `operation argument`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(operation)).collect()
    }

    pub fn run_requests(&self) -> Vec<RunInstanceRequest> {
        self.state.lock().run_requests.clone()
    }

    pub fn attached_policies(&self) -> Vec<(String, String)> {
        self.state.lock().attached_policies.clone()
    }

    pub fn state_of(&self, instance_id: &str) -> Option<InstanceState> {
        self.state.lock().instances.get(instance_id).map(|i| i.state.clone())
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

fn described(id: &str, state: InstanceState, zone: &str, private_ip: &str, public_ip: &str) -> InstanceDescription {
    InstanceDescription {
        instance_id: id.into(),
        state,
        availability_zone: zone.into(),
        private_ip: Some(private_ip.into()),
        public_ip: Some(public_ip.into()),
        network_interfaces: vec![NetworkInterface {
            interface_id: format!("eni-{}", id.trim_start_matches("i-")),
            private_ip: Some(private_ip.into()),
            public_ip: Some(public_ip.into()),
            source_dest_check: true,
        }],
    }
}

impl ComputeApi for FakeCloud {
    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<InstanceDescription> {
        let mut state = self.state.lock();
        state.calls.push(format!("run_instance {}", request.image_id));
        state.next_id += 1;
        let n = state.next_id;
        let id = format!("i-{n:04}");
        let zone = self
            .subnets
            .iter()
            .find(|s| s.subnet_id == request.subnet_id)
            .map_or("us-east-1a", |s| s.availability_zone.as_str());
        let full = described(
            &id,
            InstanceState::Pending,
            zone,
            &format!("10.0.0.{n}"),
            &format!("203.0.113.{n}"),
        );
        state.instances.insert(id.clone(), full.clone());
        state.run_requests.push(request.clone());
        Ok(InstanceDescription {
            private_ip: None,
            public_ip: None,
            network_interfaces: vec![],
            ..full
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription> {
        let mut state = self.state.lock();
        state.calls.push(format!("describe_instance {instance_id}"));
        state
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CloudError::not_found("instance", instance_id))
    }

    async fn wait_until_running(&self, instance_id: &str, timeout: Duration) -> CloudResult<()> {
        if let Some(delay) = self.slow_running.get(instance_id) {
            tokio::time::sleep(*delay).await;
        }
        let mut state = self.state.lock();
        state.calls.push(format!("wait_until_running {instance_id}"));
        if self.never_running.contains(instance_id) {
            return Err(CloudError::Timeout {
                operation: "ec2 wait instance-running".into(),
                timeout_secs: timeout.as_secs(),
            });
        }
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::not_found("instance", instance_id))?;
        instance.state = InstanceState::Running;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("terminate_instance {instance_id}"));
        if self.failing_terminations.contains(instance_id) {
            return Err(CloudError::api("ec2 terminate-instances", "RequestLimitExceeded"));
        }
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::not_found("instance", instance_id))?;
        instance.state = InstanceState::Terminated;
        Ok(())
    }

    async fn describe_image(&self, image_id: &str) -> CloudResult<ImageDescription> {
        self.record(format!("describe_image {image_id}"));
        if self.missing_images.contains(image_id) {
            return Err(CloudError::not_found("image", image_id));
        }
        Ok(ImageDescription {
            image_id: image_id.into(),
            root_device_name: "/dev/sda1".into(),
            architecture: "x86_64".into(),
        })
    }

    async fn disable_source_dest_check(&self, interface_id: &str) -> CloudResult<()> {
        self.record(format!("disable_source_dest_check {interface_id}"));
        if self.fail_source_dest_check {
            return Err(CloudError::api("ec2 modify-network-interface-attribute", "UnauthorizedOperation"));
        }
        Ok(())
    }

    async fn default_vpc_subnets(&self) -> CloudResult<Vec<Subnet>> {
        self.record("default_vpc_subnets".into());
        Ok(self.subnets.clone())
    }

    async fn send_ssh_public_key(
        &self,
        instance_id: &str,
        availability_zone: &str,
        os_user: &str,
        _public_key: &str,
    ) -> CloudResult<()> {
        self.record(format!("send_ssh_public_key {instance_id} {availability_zone} {os_user}"));
        Ok(())
    }
}

impl IdentityApi for FakeCloud {
    async fn list_roles(&self, path_prefix: &str) -> CloudResult<Vec<RoleSummary>> {
        let mut state = self.state.lock();
        state.calls.push(format!("list_roles {path_prefix}"));
        Ok(state
            .roles
            .iter()
            .filter(|(path, _)| path.starts_with(path_prefix))
            .map(|(_, role)| role.clone())
            .collect())
    }

    async fn create_role(&self, name: &str, path: &str, _trust_policy: &str) -> CloudResult<RoleSummary> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_role {name}"));
        let role = RoleSummary {
            name: name.into(),
            arn: format!("arn:aws:iam::{ACCOUNT}:role{path}{name}"),
        };
        state.roles.push((path.into(), role.clone()));
        Ok(role)
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("attach_role_policy {role}"));
        state.attached_policies.push((role.into(), policy_arn.into()));
        Ok(())
    }

    async fn list_instance_profiles(&self, path_prefix: &str) -> CloudResult<Vec<InstanceProfileSummary>> {
        let mut state = self.state.lock();
        state.calls.push(format!("list_instance_profiles {path_prefix}"));
        Ok(state
            .profiles
            .iter()
            .filter(|(path, _)| path.starts_with(path_prefix))
            .map(|(_, profile)| profile.clone())
            .collect())
    }

    async fn list_instance_profiles_for_role(&self, role: &str) -> CloudResult<Vec<InstanceProfileSummary>> {
        let mut state = self.state.lock();
        state.calls.push(format!("list_instance_profiles_for_role {role}"));
        Ok(state
            .profiles
            .iter()
            .filter(|(_, profile)| profile.roles.iter().any(|r| r == role))
            .map(|(_, profile)| profile.clone())
            .collect())
    }

    async fn create_instance_profile(&self, name: &str, path: &str) -> CloudResult<InstanceProfileSummary> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_instance_profile {name}"));
        let profile = InstanceProfileSummary {
            name: name.into(),
            arn: format!("arn:aws:iam::{ACCOUNT}:instance-profile{path}{name}"),
            roles: vec![],
        };
        state.profiles.push((path.into(), profile.clone()));
        Ok(profile)
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("add_role_to_instance_profile {profile} {role}"));
        let (_, entry) = state
            .profiles
            .iter_mut()
            .find(|(_, p)| p.name == profile)
            .ok_or_else(|| CloudError::not_found("instance profile", profile))?;
        entry.roles.push(role.into());
        Ok(())
    }
}

impl ParameterStore for FakeCloud {
    async fn get_parameter(&self, name: &str) -> CloudResult<String> {
        self.record(format!("get_parameter {name}"));
        self.parameters
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("parameter", name))
    }
}

impl ObjectStore for FakeCloud {
    async fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.record(format!("head_bucket {bucket}"));
        if self.buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(CloudError::not_found("bucket", bucket))
        }
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<String>> {
        self.record(format!("list_prefix {bucket} {prefix}"));
        let keys = self
            .buckets
            .get(bucket)
            .ok_or_else(|| CloudError::not_found("bucket", bucket))?;
        let mut entries: Vec<String> = keys
            .iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?;
                Some(match rest.find('/') {
                    Some(i) => format!("{prefix}{}", &rest[..=i]),
                    None => key.clone(),
                })
            })
            .collect();
        entries.dedup();
        Ok(entries)
    }
}

/// A canned reply to a remote command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The command succeeds with this stdout.
    Ok(String),
    /// The command fails with this output.
    Fail(String),
}

#[derive(Debug)]
struct Rule {
    instance_id: Option<String>,
    needle: String,
    replies: VecDeque<Reply>,
}

/// A remote whose commands are answered from scripted rules.
///
/// The first rule whose needle occurs in the joined command answers it. A
/// rule with several replies hands them out in order and then repeats the
/// last one.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    rules: Mutex<Vec<Rule>>,
    hosts: Mutex<HashMap<String, String>>,
    keys: Mutex<HashMap<String, PathBuf>>,
    commands: Mutex<Vec<(String, String)>>,
    copies: Mutex<Vec<(String, String)>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote that answers every gate of a healthy node.
    pub fn healthy() -> Self {
        Self::healthy_after(Self::new())
    }

    /// Adds the healthy-node rules after the rules already in `remote`.
    pub fn healthy_after(remote: Self) -> Self {
        remote
            .reply("systemctl list-units", Reply::Ok("containerd.service loaded active running containerd".into()))
            .reply("cloud-init status", Reply::Ok("status: done".into()))
            .reply("version", Reply::Ok("Client Version: v1.32.0\nServer Version: v1.32.0".into()))
            .reply("get nodes -o name", Reply::Ok("node/ip-10-0-0-1\nnode/ip-10-0-0-2".into()))
            .reply("cat /etc/kubernetes/admin.conf", Reply::Ok(
                "apiVersion: v1\nclusters:\n- cluster:\n    server: https://10.0.0.1:6443\n  name: kubernetes\n".into(),
            ))
            .reply("", Reply::Ok(String::new()))
    }

    /// Answers commands containing `needle` on any instance.
    pub fn reply(self, needle: &str, reply: Reply) -> Self {
        self.push_rule(None, needle, vec![reply])
    }

    /// Answers commands containing `needle` on one instance.
    pub fn reply_for(self, instance_id: &str, needle: &str, reply: Reply) -> Self {
        self.push_rule(Some(instance_id), needle, vec![reply])
    }

    /// Answers in sequence, repeating the last reply.
    pub fn replies(self, needle: &str, replies: Vec<Reply>) -> Self {
        self.push_rule(None, needle, replies)
    }

    fn push_rule(self, instance_id: Option<&str>, needle: &str, replies: Vec<Reply>) -> Self {
        self.rules.lock().push(Rule {
            instance_id: instance_id.map(String::from),
            needle: needle.into(),
            replies: replies.into(),
        });
        self
    }

    /// Every command run, as `(instance, joined args)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().clone()
    }

    pub fn commands_for(&self, instance_id: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, cmd)| cmd)
            .collect()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().clone()
    }

    pub fn host(&self, instance_id: &str) -> Option<String> {
        self.hosts.lock().get(instance_id).cloned()
    }

    pub fn key(&self, instance_id: &str) -> Option<PathBuf> {
        self.keys.lock().get(instance_id).cloned()
    }

    fn answer(&self, instance_id: &str, command: &str) -> Option<Reply> {
        let mut rules = self.rules.lock();
        let rule = rules.iter_mut().find(|r| {
            r.instance_id.as_deref().is_none_or(|id| id == instance_id) && command.contains(&r.needle)
        })?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

impl RemoteExec for ScriptedRemote {
    fn register_host(&self, instance_id: &str, host: &str) {
        self.hosts.lock().insert(instance_id.into(), host.into());
    }

    fn register_key(&self, instance_id: &str, key_file: &Path) {
        self.keys.lock().insert(instance_id.into(), key_file.to_path_buf());
    }

    async fn ssh(&self, instance_id: &str, args: &[&str]) -> RemoteResult<String> {
        if !self.hosts.lock().contains_key(instance_id) {
            return Err(RemoteError::UnknownInstance(instance_id.into()));
        }
        let command = args.join(" ");
        self.commands.lock().push((instance_id.into(), command.clone()));
        match self.answer(instance_id, &command) {
            Some(Reply::Ok(stdout)) => Ok(stdout),
            Some(Reply::Fail(output)) => Err(RemoteError::Failed {
                instance_id: instance_id.into(),
                message: "exit code 1".into(),
                output,
            }),
            None => Err(RemoteError::Failed {
                instance_id: instance_id.into(),
                message: "no scripted reply".into(),
                output: String::new(),
            }),
        }
    }

    async fn scp(&self, instance_id: &str, remote_path: &str, _local_dir: &Path) -> RemoteResult<()> {
        self.copies.lock().push((instance_id.into(), remote_path.into()));
        Ok(())
    }
}
