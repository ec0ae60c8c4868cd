//! Per-instance readiness state machine.
//!
//! Each launched instance is driven through a fixed sequence of gates:
//!
//! ```text
//! Launched -> Running -> Network -> [SshKeyed] -> ContainerRuntime -> CloudInit
//!          -> (control plane: ApiServer -> NodeRegistered -> NodeReady) -> Ready
//! ```
//!
//! Every gate after `Running` is a bounded [`poll_until`] loop. A remote
//! command failure inside a gate is a retry, except an explicit cloud-init
//! error which aborts the instance. Exhausting a gate's budget fails the
//! instance with the last observed output.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cloud::{CloudProvider, InstanceState};
use crate::config::DeployerConfig;
use crate::error::{DeployError, DeployResult};
use crate::kubeconfig::{self, ADMIN_CONF};
use crate::launcher::InstanceRecord;
use crate::poll::{poll_until, Attempt, PollError, PollPolicy};
use crate::remote::{RemoteError, RemoteExec};
use crate::sshkey::SshKeyPair;

/// Lists running services.
pub const LIST_SERVICES: [&str; 5] = ["sudo", "systemctl", "list-units", "--type=service", "--state=running"];

/// Reports cloud-init progress.
pub const CLOUD_INIT_STATUS: [&str; 3] = ["sudo", "cloud-init", "status"];

/// Runs kubectl against the local admin credentials.
fn kubectl<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut command = vec!["sudo", "kubectl", "--kubeconfig", ADMIN_CONF];
    command.extend_from_slice(args);
    command
}

/// One readiness precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    /// The cloud reports the instance running.
    Running,
    /// The instance has addresses and is registered for remote commands.
    Network,
    /// An SSH key has been pushed and installed.
    SshKeyed,
    /// containerd or CRI-O is running.
    ContainerRuntime,
    /// cloud-init has finished.
    CloudInit,
    /// The API server answers.
    ApiServer,
    /// At least one node is registered.
    NodeRegistered,
    /// Every node reports ready.
    NodeReady,
}

impl Gate {
    /// Stable name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Network => "network",
            Self::SshKeyed => "ssh-keyed",
            Self::ContainerRuntime => "container-runtime",
            Self::CloudInit => "cloud-init",
            Self::ApiServer => "api-server",
            Self::NodeRegistered => "node-registered",
            Self::NodeReady => "node-ready",
        }
    }

    /// Gates for an instance, in the order they are checked.
    #[must_use]
    pub fn sequence(control_plane: bool, instance_connect: bool) -> Vec<Self> {
        let mut gates = vec![Self::Running, Self::Network];
        if instance_connect {
            gates.push(Self::SshKeyed);
        }
        gates.extend([Self::ContainerRuntime, Self::CloudInit]);
        if control_plane {
            gates.extend([Self::ApiServer, Self::NodeRegistered, Self::NodeReady]);
        }
        gates
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an instance is in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Created, not yet polled.
    Launched,
    /// Waiting on a gate.
    Waiting(Gate),
    /// All gates passed.
    Ready,
    /// A gate failed.
    Failed(Gate),
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launched => f.write_str("launched"),
            Self::Waiting(gate) => write!(f, "waiting-{gate}"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(gate) => write!(f, "failed-{gate}"),
        }
    }
}

/// cloud-init progress parsed from `cloud-init status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudInitStatus {
    /// Finished.
    Done,
    /// Finished with an error.
    Error,
    /// Still running, or unknown.
    Pending,
}

impl CloudInitStatus {
    /// Classifies command output.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let output = output.to_ascii_lowercase();
        if output.contains("status: error") {
            Self::Error
        } else if output.contains("status: done") || output.contains("exited") {
            Self::Done
        } else {
            Self::Pending
        }
    }
}

/// Returns true if the service list shows a container runtime.
#[must_use]
pub fn has_container_runtime(services: &str) -> bool {
    services
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|unit| unit == "containerd.service" || unit == "crio.service")
}

/// Error text plus whatever the command printed.
fn observed(error: &RemoteError) -> String {
    let output = error.output();
    if output.trim().is_empty() {
        error.to_string()
    } else {
        format!("{error}: {}", output.trim())
    }
}

/// Counts `node/` lines in `kubectl get nodes -o name` output.
#[must_use]
pub fn count_nodes(output: &str) -> usize {
    output.lines().filter(|line| line.trim().starts_with("node/")).count()
}

/// Result of a successful poll.
#[derive(Debug, Clone)]
pub struct ReadyInstance {
    /// The instance, with addresses and key file filled in.
    pub record: InstanceRecord,
    /// Kubeconfig written for the control plane.
    pub kubeconfig: Option<PathBuf>,
}

/// Drives instances through their gates.
pub struct ReadinessPoller<C, R> {
    cloud: Arc<C>,
    remote: Arc<R>,
    config: Arc<DeployerConfig>,
    ssh_key: Option<Arc<SshKeyPair>>,
    policy: PollPolicy,
}

impl<C, R> Clone for ReadinessPoller<C, R> {
    fn clone(&self) -> Self {
        Self {
            cloud: Arc::clone(&self.cloud),
            remote: Arc::clone(&self.remote),
            config: Arc::clone(&self.config),
            ssh_key: self.ssh_key.clone(),
            policy: self.policy,
        }
    }
}

impl<C, R> fmt::Debug for ReadinessPoller<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessPoller")
            .field("policy", &self.policy)
            .field("ssh_key", &self.ssh_key)
            .finish_non_exhaustive()
    }
}

impl<C: CloudProvider, R: RemoteExec> ReadinessPoller<C, R> {
    /// Creates a poller. `ssh_key` is pushed through instance connect
    /// when the configuration asks for it.
    #[must_use]
    pub fn new(cloud: Arc<C>, remote: Arc<R>, config: Arc<DeployerConfig>, ssh_key: Option<Arc<SshKeyPair>>) -> Self {
        let policy = config.readiness.gate();
        Self {
            cloud,
            remote,
            config,
            ssh_key,
            policy,
        }
    }

    fn enter(&self, record: &InstanceRecord, state: PollState) {
        tracing::info!(instance_id = %record.instance_id, role = %record.role, state = %state, "readiness");
    }

    /// Runs every gate for `record` and, for the control plane, the
    /// post-conditions that produce the kubeconfig.
    pub async fn run(&self, mut record: InstanceRecord) -> DeployResult<ReadyInstance> {
        self.enter(&record, PollState::Launched);
        let instance_connect = self.config.ssh.instance_connect && self.ssh_key.is_some();
        for gate in Gate::sequence(record.is_control_plane(), instance_connect) {
            self.enter(&record, PollState::Waiting(gate));
            if let Err(e) = self.pass(gate, &mut record).await {
                self.enter(&record, PollState::Failed(gate));
                tracing::error!(instance_id = %record.instance_id, gate = %gate, error = %e, "instance failed readiness");
                return Err(e);
            }
        }

        let kubeconfig = if record.is_control_plane() {
            Some(self.fetch_kubeconfig(&record).await?)
        } else {
            None
        };
        self.enter(&record, PollState::Ready);
        Ok(ReadyInstance { record, kubeconfig })
    }

    async fn pass(&self, gate: Gate, record: &mut InstanceRecord) -> DeployResult<()> {
        match gate {
            Gate::Running => self.wait_running(record).await,
            Gate::Network => self.wait_network(record).await,
            Gate::SshKeyed => self.install_key(record).await,
            Gate::ContainerRuntime => {
                let id = record.instance_id.as_str();
                self.retry(gate, id, move |_| self.check_container_runtime(id)).await
            }
            Gate::CloudInit => {
                let id = record.instance_id.as_str();
                self.retry(gate, id, move |_| self.check_cloud_init(id)).await
            }
            Gate::ApiServer => {
                let id = record.instance_id.as_str();
                self.retry(gate, id, move |_| self.check_api_server(id)).await
            }
            Gate::NodeRegistered => {
                let id = record.instance_id.as_str();
                self.retry(gate, id, move |_| self.check_node_registered(id)).await
            }
            Gate::NodeReady => self.wait_nodes_ready(record).await,
        }
    }

    async fn retry<T, F, Fut>(&self, gate: Gate, instance_id: &str, attempt_fn: F) -> DeployResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        match poll_until(&self.policy, gate.name(), attempt_fn).await {
            Ok(value) => Ok(value),
            Err(PollError::Aborted(e)) => Err(e),
            Err(PollError::Exhausted { attempts, last }) => Err(DeployError::ReadinessExhausted {
                instance_id: instance_id.to_string(),
                gate: gate.name().to_string(),
                attempts,
                last_output: last,
            }),
        }
    }

    async fn wait_running(&self, record: &mut InstanceRecord) -> DeployResult<()> {
        let timeout = self.config.readiness.running_timeout();
        self.cloud
            .wait_until_running(&record.instance_id, timeout)
            .await
            .map_err(|e| DeployError::NotRunning {
                instance_id: record.instance_id.clone(),
                timeout_secs: timeout.as_secs(),
                reason: e.to_string(),
            })?;
        record.state = InstanceState::Running;
        Ok(())
    }

    async fn wait_network(&self, record: &mut InstanceRecord) -> DeployResult<()> {
        let id = record.instance_id.as_str();
        let cloud = &*self.cloud;
        let description = self
            .retry(Gate::Network, id, move |_| async move {
                match cloud.describe_instance(id).await {
                    Ok(d) if d.has_addresses() => Attempt::Ready(d),
                    Ok(d) => Attempt::Retry(format!("instance has no addresses yet (state {})", d.state)),
                    Err(e) => Attempt::Retry(e.to_string()),
                }
            })
            .await?;
        record.update(&description);

        for interface in record.network_interfaces.iter().filter(|i| i.source_dest_check) {
            if let Err(e) = self.cloud.disable_source_dest_check(&interface.interface_id).await {
                tracing::warn!(
                    instance_id = %record.instance_id,
                    interface = %interface.interface_id,
                    error = %e,
                    "failed to disable source/destination check"
                );
            }
        }

        if let Some(public_ip) = &record.public_ip {
            self.remote.register_host(&record.instance_id, public_ip);
        }
        Ok(())
    }

    async fn install_key(&self, record: &mut InstanceRecord) -> DeployResult<()> {
        let Some(key) = self.ssh_key.as_deref() else {
            return Ok(());
        };
        let user = self.config.ssh_user();
        let id = record.instance_id.as_str();
        let zone = record.availability_zone.as_str();
        let append = format!(
            "mkdir -p ~/.ssh && (grep -qxF '{pk}' ~/.ssh/authorized_keys 2>/dev/null || echo '{pk}' >> ~/.ssh/authorized_keys)",
            pk = key.public_key()
        );

        self.remote.register_key(id, key.private_key());
        let cloud = &*self.cloud;
        let remote = &*self.remote;
        let user = user.as_str();
        let append = append.as_str();
        self.retry(Gate::SshKeyed, id, move |_| async move {
            if let Err(e) = cloud.send_ssh_public_key(id, zone, user, key.public_key()).await {
                return Attempt::Retry(e.to_string());
            }
            match remote.ssh(id, &[append]).await {
                Ok(_) => Attempt::Ready(()),
                Err(e) => Attempt::Retry(observed(&e)),
            }
        })
        .await?;
        record.key_file = Some(key.private_key().to_path_buf());
        Ok(())
    }

    async fn check_container_runtime(&self, id: &str) -> Attempt<()> {
        match self.remote.ssh(id, &LIST_SERVICES).await {
            Ok(services) if has_container_runtime(&services) => Attempt::Ready(()),
            Ok(services) => Attempt::Retry(format!("no container runtime running: {}", services.trim())),
            Err(e) => Attempt::Retry(observed(&e)),
        }
    }

    async fn check_cloud_init(&self, id: &str) -> Attempt<()> {
        // `cloud-init status` exits non-zero on error, so inspect failures too.
        let (output, failure) = match self.remote.ssh(id, &CLOUD_INIT_STATUS).await {
            Ok(output) => (output, None),
            Err(e) => (e.output(), Some(observed(&e))),
        };
        match CloudInitStatus::parse(&output) {
            CloudInitStatus::Error => Attempt::Abort(DeployError::BootFailed {
                instance_id: id.to_string(),
                output: output.trim().to_string(),
            }),
            CloudInitStatus::Done => Attempt::Ready(()),
            CloudInitStatus::Pending => Attempt::Retry(failure.unwrap_or_else(|| output.trim().to_string())),
        }
    }

    async fn check_api_server(&self, id: &str) -> Attempt<()> {
        match self.remote.ssh(id, &kubectl(&["version"])).await {
            Ok(_) => Attempt::Ready(()),
            Err(e) => Attempt::Retry(observed(&e)),
        }
    }

    async fn check_node_registered(&self, id: &str) -> Attempt<()> {
        match self.remote.ssh(id, &kubectl(&["get", "nodes", "-o", "name"])).await {
            Ok(nodes) if count_nodes(&nodes) > 0 => Attempt::Ready(()),
            Ok(nodes) => Attempt::Retry(format!("no nodes registered: {}", nodes.trim())),
            Err(e) => Attempt::Retry(observed(&e)),
        }
    }

    async fn wait_nodes_ready(&self, record: &InstanceRecord) -> DeployResult<()> {
        let timeout = format!("--timeout={}s", self.config.readiness.node_ready_timeout_secs);
        let wait = kubectl(&["wait", "--for=condition=ready", "nodes", "--all", timeout.as_str()]);
        self.remote
            .ssh(&record.instance_id, &wait)
            .await
            .map_err(|e| DeployError::ReadinessExhausted {
                instance_id: record.instance_id.clone(),
                gate: Gate::NodeReady.name().to_string(),
                attempts: 1,
                last_output: e.output(),
            })?;

        let untaint = kubectl(&["taint", "nodes", "--all", "node-role.kubernetes.io/control-plane:NoSchedule-"]);
        self.remote
            .ssh(&record.instance_id, &untaint)
            .await
            .map_err(|e| DeployError::ReadinessExhausted {
                instance_id: record.instance_id.clone(),
                gate: Gate::NodeReady.name().to_string(),
                attempts: 1,
                last_output: format!("failed to remove control-plane taint: {}", observed(&e)),
            })?;
        Ok(())
    }

    async fn fetch_kubeconfig(&self, record: &InstanceRecord) -> DeployResult<PathBuf> {
        let public_ip = record
            .public_ip
            .as_deref()
            .ok_or_else(|| DeployError::Kubeconfig(format!("{} has no public address", record.instance_id)))?;
        let admin = self
            .remote
            .ssh(&record.instance_id, &["sudo", "cat", ADMIN_CONF])
            .await
            .map_err(|e| DeployError::Kubeconfig(format!("failed to read {ADMIN_CONF}: {e}")))?;
        let content = kubeconfig::rewrite_server(&admin, public_ip);
        kubeconfig::store(&content, &self.config.run_dir, self.config.kubeconfig_path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kt_userdata::NodeRole;
    use test_case::test_case;

    use crate::cloud::{ComputeApi, InstanceDescription};
    use crate::config::ReadinessPolicy;
    use crate::testing::{FakeCloud, Reply, ScriptedRemote};

    struct Harness {
        cloud: Arc<FakeCloud>,
        remote: Arc<ScriptedRemote>,
        poller: ReadinessPoller<FakeCloud, ScriptedRemote>,
        _dir: tempfile::TempDir,
    }

    fn harness(cloud: FakeCloud, remote: ScriptedRemote) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = DeployerConfig {
            run_dir: dir.path().to_path_buf(),
            kubeconfig_path: Some(dir.path().join("kubeconfig")),
            readiness: ReadinessPolicy {
                attempts: 3,
                interval_secs: 15,
                ..ReadinessPolicy::default()
            },
            ..DeployerConfig::default()
        };
        let cloud = Arc::new(cloud);
        let remote = Arc::new(remote);
        let poller = ReadinessPoller::new(Arc::clone(&cloud), Arc::clone(&remote), Arc::new(config), None);
        Harness {
            cloud,
            remote,
            poller,
            _dir: dir,
        }
    }

    async fn launched(cloud: &FakeCloud, role: NodeRole) -> InstanceRecord {
        let request = crate::cloud::RunInstanceRequest {
            image_id: "ami-0123abcd".into(),
            instance_type: "t3a.medium".into(),
            subnet_id: "subnet-0a".into(),
            associate_public_ip: true,
            tags: vec![],
            root_volume: crate::cloud::RootVolume {
                device_name: "/dev/sda1".into(),
                size_gib: 50,
                volume_type: "gp3".into(),
            },
            require_imdsv2: true,
            user_data: String::new(),
            instance_profile_arn: None,
        };
        let description: InstanceDescription = cloud.run_instance(&request).await.unwrap();
        InstanceRecord::new("node", role, &description)
    }

    #[test]
    fn worker_sequence_skips_control_plane_gates() {
        assert_eq!(
            Gate::sequence(false, false),
            vec![Gate::Running, Gate::Network, Gate::ContainerRuntime, Gate::CloudInit]
        );
        let control_plane = Gate::sequence(true, true);
        assert_eq!(control_plane[2], Gate::SshKeyed);
        assert_eq!(control_plane.last(), Some(&Gate::NodeReady));
    }

    #[test_case("status: done", CloudInitStatus::Done)]
    #[test_case("Active: active (exited) since Mon", CloudInitStatus::Done)]
    #[test_case("status: running", CloudInitStatus::Pending)]
    #[test_case("\nstatus: error\n", CloudInitStatus::Error)]
    #[test_case("", CloudInitStatus::Pending)]
    fn parses_cloud_init_status(output: &str, expected: CloudInitStatus) {
        assert_eq!(CloudInitStatus::parse(output), expected);
    }

    #[test]
    fn container_runtime_needs_a_runtime_unit() {
        assert!(has_container_runtime("  containerd.service loaded active running containerd"));
        assert!(has_container_runtime("crio.service loaded active running CRI-O"));
        assert!(!has_container_runtime("ssh.service loaded active running OpenSSH"));
        assert!(!has_container_runtime("containerd-installation.service loaded active running"));
    }

    #[test]
    fn counts_node_lines() {
        assert_eq!(count_nodes("node/a\nnode/b\n"), 2);
        assert_eq!(count_nodes("No resources found"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_worker_becomes_ready() {
        let h = harness(FakeCloud::new(), ScriptedRemote::healthy());
        let record = launched(&h.cloud, NodeRole::Worker).await;
        let ready = h.poller.run(record).await.unwrap();

        assert_eq!(ready.record.public_ip.as_deref(), Some("203.0.113.1"));
        assert!(ready.kubeconfig.is_none());
        assert_eq!(h.remote.host("i-0001").as_deref(), Some("203.0.113.1"));
        assert_eq!(h.cloud.calls_to("disable_source_dest_check"), vec!["disable_source_dest_check eni-0001"]);
        assert!(h.remote.commands_for("i-0001").iter().all(|c| !c.contains("kubectl")));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_control_plane_writes_kubeconfig() {
        let h = harness(FakeCloud::new(), ScriptedRemote::healthy());
        let record = launched(&h.cloud, NodeRole::ControlPlane).await;
        let ready = h.poller.run(record).await.unwrap();

        let path = ready.kubeconfig.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("server: https://203.0.113.1:6443"));

        let commands = h.remote.commands_for("i-0001");
        let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
        assert!(position("list-units") < position("cloud-init status"));
        assert!(position("cloud-init status") < position(" version"));
        assert!(position(" version") < position("get nodes"));
        assert!(position("get nodes") < position("wait --for=condition=ready"));
        assert!(position("wait --for=condition=ready") < position("NoSchedule-"));
    }

    #[test_case(Gate::ContainerRuntime, "list-units", "cloud-init status")]
    #[test_case(Gate::CloudInit, "cloud-init status", " version")]
    #[test_case(Gate::ApiServer, " version", "get nodes")]
    #[test_case(Gate::NodeRegistered, "get nodes", "wait --for")]
    #[tokio::test(start_paused = true)]
    async fn failing_gate_stops_the_sequence(gate: Gate, failing: &str, next: &str) {
        let remote = ScriptedRemote::new()
            .reply(failing, Reply::Fail("connection refused".into()));
        let remote = ScriptedRemote::healthy_after(remote);
        let h = harness(FakeCloud::new(), remote);
        let record = launched(&h.cloud, NodeRole::ControlPlane).await;

        let err = h.poller.run(record).await.unwrap_err();
        match err {
            DeployError::ReadinessExhausted { instance_id, gate: failed, attempts, last_output } => {
                assert_eq!(instance_id, "i-0001");
                assert_eq!(failed, gate.name());
                assert_eq!(attempts, 3);
                assert!(last_output.contains("connection refused"), "{last_output}");
            }
            other => panic!("unexpected {other:?}"),
        }
        let commands = h.remote.commands_for("i-0001");
        assert_eq!(commands.iter().filter(|c| c.contains(failing)).count(), 3);
        assert!(commands.iter().all(|c| !c.contains(next)), "{commands:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cloud_init_error_aborts_without_retry() {
        let remote = ScriptedRemote::healthy_after(
            ScriptedRemote::new().reply("cloud-init status", Reply::Fail("status: error".into())),
        );
        let h = harness(FakeCloud::new(), remote);
        let record = launched(&h.cloud, NodeRole::Worker).await;

        let err = h.poller.run(record).await.unwrap_err();
        assert!(matches!(err, DeployError::BootFailed { ref output, .. } if output == "status: error"));
        let attempts = h.remote.commands_for("i-0001").iter().filter(|c| c.contains("cloud-init")).count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let remote = ScriptedRemote::healthy_after(ScriptedRemote::new().replies(
            "list-units",
            vec![
                Reply::Fail("ssh: connect to host port 22: Connection refused".into()),
                Reply::Ok("ssh.service loaded active running".into()),
                Reply::Ok("containerd.service loaded active running".into()),
            ],
        ));
        let h = harness(FakeCloud::new(), remote);
        let record = launched(&h.cloud, NodeRole::Worker).await;
        let start = tokio::time::Instant::now();
        h.poller.run(record).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn never_running_fails_before_any_remote_command() {
        let h = harness(FakeCloud::new().never_running("i-0001"), ScriptedRemote::healthy());
        let record = launched(&h.cloud, NodeRole::Worker).await;
        let err = h.poller.run(record).await.unwrap_err();
        assert!(matches!(err, DeployError::NotRunning { ref instance_id, .. } if instance_id == "i-0001"));
        assert!(h.remote.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn source_dest_check_failure_is_not_fatal() {
        let h = harness(FakeCloud::new().failing_source_dest_check(), ScriptedRemote::healthy());
        let record = launched(&h.cloud, NodeRole::Worker).await;
        h.poller.run(record).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn instance_connect_installs_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("kt");
        std::fs::write(&key_path, "private").unwrap();
        std::fs::write(dir.path().join("kt.pub"), "ssh-ed25519 AAAA test\n").unwrap();
        let key = SshKeyPair::load(&key_path).unwrap().unwrap();

        let cloud = Arc::new(FakeCloud::new());
        let remote = Arc::new(ScriptedRemote::healthy());
        let config = DeployerConfig {
            run_dir: dir.path().to_path_buf(),
            ..DeployerConfig::default()
        };
        let poller = ReadinessPoller::new(
            Arc::clone(&cloud),
            Arc::clone(&remote),
            Arc::new(config),
            Some(Arc::new(key)),
        );
        let record = launched(&cloud, NodeRole::Worker).await;
        let ready = poller.run(record).await.unwrap();

        assert_eq!(ready.record.key_file.as_deref(), Some(key_path.as_path()));
        assert_eq!(remote.key("i-0001").as_deref(), Some(key_path.as_path()));
        assert_eq!(
            cloud.calls_to("send_ssh_public_key"),
            vec!["send_ssh_public_key i-0001 us-east-1a ubuntu"]
        );
        let commands = remote.commands_for("i-0001");
        assert!(commands[0].contains("authorized_keys"));
        assert!(commands[0].contains("ssh-ed25519 AAAA test"));
    }

    #[tokio::test(start_paused = true)]
    async fn key_install_failure_is_retried_before_later_gates() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("kt");
        std::fs::write(&key_path, "private").unwrap();
        std::fs::write(dir.path().join("kt.pub"), "ssh-ed25519 AAAA test\n").unwrap();
        let key = SshKeyPair::load(&key_path).unwrap().unwrap();

        let cloud = Arc::new(FakeCloud::new());
        let remote = Arc::new(ScriptedRemote::healthy_after(ScriptedRemote::new().replies(
            "authorized_keys",
            vec![
                Reply::Fail("Permission denied (publickey)".into()),
                Reply::Ok(String::new()),
            ],
        )));
        let config = DeployerConfig {
            run_dir: dir.path().to_path_buf(),
            readiness: ReadinessPolicy {
                attempts: 3,
                interval_secs: 15,
                ..ReadinessPolicy::default()
            },
            ..DeployerConfig::default()
        };
        let poller = ReadinessPoller::new(
            Arc::clone(&cloud),
            Arc::clone(&remote),
            Arc::new(config),
            Some(Arc::new(key)),
        );
        let record = launched(&cloud, NodeRole::Worker).await;
        let start = tokio::time::Instant::now();
        let ready = poller.run(record).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert_eq!(ready.record.key_file.as_deref(), Some(key_path.as_path()));
        // The key is pushed on every attempt.
        assert_eq!(cloud.calls_to("send_ssh_public_key").len(), 2);

        let commands = remote.commands_for("i-0001");
        let keyed: Vec<_> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| c.contains("authorized_keys"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(keyed, vec![0, 1]);
        let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
        assert!(position("list-units") > 1);
        assert!(position("list-units") < position("cloud-init status"));
    }

    #[tokio::test(start_paused = true)]
    async fn taint_removal_failure_fails_the_control_plane() {
        let remote = ScriptedRemote::healthy_after(
            ScriptedRemote::new().reply("NoSchedule-", Reply::Fail("taint not found".into())),
        );
        let h = harness(FakeCloud::new(), remote);
        let record = launched(&h.cloud, NodeRole::ControlPlane).await;

        let err = h.poller.run(record).await.unwrap_err();
        match err {
            DeployError::ReadinessExhausted { instance_id, gate, attempts, last_output } => {
                assert_eq!(instance_id, "i-0001");
                assert_eq!(gate, Gate::NodeReady.name());
                assert_eq!(attempts, 1);
                assert!(last_output.contains("control-plane taint"), "{last_output}");
                assert!(last_output.contains("taint not found"), "{last_output}");
            }
            other => panic!("unexpected {other:?}"),
        }
        let untaints = h.remote.commands_for("i-0001").iter().filter(|c| c.contains("NoSchedule-")).count();
        assert_eq!(untaints, 1);
    }
}
