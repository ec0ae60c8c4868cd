//! Cluster lifecycle: `up`, `down` and `is_up`.
//!
//! `up` validates everything that can be checked before spending money,
//! then launches the control plane followed by the workers. Each instance
//! gets its own readiness task as soon as it exists; the first task to
//! fail cancels the rest and becomes the error. `down` dumps logs and
//! terminates every tracked instance, reporting all failures together.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};

use kt_userdata::{Composer, NodeRole};

use crate::cloud::{CloudProvider, InstanceState};
use crate::config::DeployerConfig;
use crate::dump::LogDumper;
use crate::error::{DeployError, DeployResult, TeardownFailure};
use crate::image::ImageResolver;
use crate::kubeconfig::ADMIN_CONF;
use crate::launcher::{ImageSpec, InstanceRecord, Launcher};
use crate::poll::{poll_until, Attempt, PollError};
use crate::poller::{count_nodes, CloudInitStatus, ReadinessPoller, ReadyInstance, CLOUD_INIT_STATUS};
use crate::provision::Provisioner;
use crate::remote::RemoteExec;
use crate::session::ClusterSession;
use crate::sshkey::SshKeyPair;
use crate::staging::validate_staging;
use crate::state::{SessionState, TrackedInstance};

/// Lifecycle phase of the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetPhase {
    /// Nothing done yet.
    Idle,
    /// Checking configuration, images, staging and IAM.
    Validating,
    /// Creating instances.
    Launching,
    /// Waiting for every readiness task.
    PollingConcurrent,
    /// Cluster-wide checks after every node is ready.
    PostInstall,
    /// The cluster is usable.
    Up,
    /// Dumping logs and terminating instances.
    TearingDown,
    /// Every instance has been terminated.
    Down,
}

impl fmt::Display for FleetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Launching => "launching",
            Self::PollingConcurrent => "polling",
            Self::PostInstall => "post-install",
            Self::Up => "up",
            Self::TearingDown => "tearing-down",
            Self::Down => "down",
        };
        f.write_str(name)
    }
}

type PollTasks = JoinSet<DeployResult<ReadyInstance>>;

/// A control plane and its workers.
pub struct Fleet<C, R> {
    cloud: Arc<C>,
    remote: Arc<R>,
    config: Arc<DeployerConfig>,
    session: Arc<ClusterSession>,
    state: SessionState,
    instances: Vec<InstanceRecord>,
    ssh_key: Option<Arc<SshKeyPair>>,
    kubeconfig: Option<PathBuf>,
    phase: FleetPhase,
}

impl<C, R> fmt::Debug for Fleet<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fleet")
            .field("cluster_id", &self.session.cluster_id())
            .field("phase", &self.phase)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl<C, R> Fleet<C, R>
where
    C: CloudProvider + 'static,
    R: RemoteExec + 'static,
{
    /// Starts a new session.
    #[must_use]
    pub fn new(cloud: Arc<C>, remote: Arc<R>, config: DeployerConfig) -> Self {
        let session = ClusterSession::generate(config.region.clone());
        let state = SessionState::new(session.cluster_id(), session.region());
        Self {
            cloud,
            remote,
            config: Arc::new(config),
            session: Arc::new(session),
            state,
            instances: Vec::new(),
            ssh_key: None,
            kubeconfig: None,
            phase: FleetPhase::Idle,
        }
    }

    /// Reattaches to a session saved by an earlier `up`.
    pub fn from_state(cloud: Arc<C>, remote: Arc<R>, config: DeployerConfig) -> DeployResult<Self> {
        let state = SessionState::load(&config.run_dir)?;
        let session = ClusterSession::from_parts(&state.cluster_id, "", "", &state.region);

        let mut instances = Vec::with_capacity(state.instances.len());
        for tracked in &state.instances {
            if let Some(host) = &tracked.public_ip {
                remote.register_host(&tracked.instance_id, host);
            }
            if let Some(key) = &tracked.key_file {
                remote.register_key(&tracked.instance_id, key);
            }
            if tracked.role.is_control_plane() {
                if let Some(ip) = &tracked.private_ip {
                    session.set_control_plane_ip(ip)?;
                }
            }
            instances.push(InstanceRecord {
                instance_id: tracked.instance_id.clone(),
                name: tracked.instance_id.clone(),
                role: tracked.role,
                availability_zone: String::new(),
                public_ip: tracked.public_ip.clone(),
                private_ip: tracked.private_ip.clone(),
                network_interfaces: Vec::new(),
                key_file: tracked.key_file.clone(),
                state: InstanceState::Other("unknown".to_string()),
            });
        }
        tracing::info!(cluster_id = %state.cluster_id, instances = instances.len(), "loaded session");

        Ok(Self {
            cloud,
            remote,
            config: Arc::new(config),
            session: Arc::new(session),
            kubeconfig: state.kubeconfig.clone(),
            state,
            instances,
            ssh_key: None,
            phase: FleetPhase::Up,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> FleetPhase {
        self.phase
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &ClusterSession {
        &self.session
    }

    /// Tracked instances, control plane first.
    #[must_use]
    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    /// Kubeconfig written for the cluster.
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    fn enter(&mut self, phase: FleetPhase) {
        tracing::info!(cluster_id = %self.session.cluster_id(), phase = %phase, "fleet");
        self.phase = phase;
    }

    /// Brings the cluster up.
    ///
    /// On failure the instances created so far stay tracked so the caller
    /// can decide whether to tear them down.
    pub async fn up(&mut self) -> DeployResult<()> {
        self.enter(FleetPhase::Validating);
        let specs = self.plan().await?;

        let mut tasks = PollTasks::new();
        if let Err(e) = self.launch_and_wait(&specs, &mut tasks).await {
            tasks.shutdown().await;
            tracing::error!(cluster_id = %self.session.cluster_id(), error = %e, "cluster bring-up failed");
            self.dump_logs().await;
            return Err(e);
        }

        self.enter(FleetPhase::PostInstall);
        if let Err(e) = self.post_install(specs.len()).await {
            self.dump_logs().await;
            return Err(e);
        }

        self.enter(FleetPhase::Up);
        Ok(())
    }

    /// Everything that can fail before an instance exists.
    async fn plan(&mut self) -> DeployResult<Vec<ImageSpec>> {
        let config = Arc::clone(&self.config);
        config.validate()?;

        let composer = Composer::new(self.session.cluster_values(&config), config.templates.clone());
        let control_plane_data = composer.compose(NodeRole::ControlPlane)?;
        let worker_data = composer.compose(NodeRole::Worker)?;
        tracing::info!(
            control_plane_bytes = control_plane_data.len(),
            worker_bytes = worker_data.len(),
            "composed user-data"
        );

        let resolver = ImageResolver::new(&*self.cloud);
        let control_plane_image = resolver
            .resolve(&config.image, config.arch, &config.instance_type)
            .await?;
        let worker_image = if config.workers > 0 {
            resolver
                .resolve(config.worker_image(), config.arch, config.worker_instance_type())
                .await?
        } else {
            control_plane_image.clone()
        };

        validate_staging(&*self.cloud, &config.staging_bucket, &config.staging_version).await?;
        Provisioner::new(&*self.cloud)
            .provision(&config.role_name, &config.instance_profile)
            .await?;

        if config.ssh.instance_connect {
            let ssh_dir = dirs::home_dir().map(|home| home.join(".ssh"));
            let key = SshKeyPair::ensure(&config.ssh.key_name, &config.run_dir, ssh_dir.as_deref()).await?;
            self.ssh_key = Some(Arc::new(key));
        }

        let cluster_id = self.session.cluster_id();
        let mut specs = Vec::with_capacity(config.workers + 1);
        specs.push(ImageSpec {
            name: format!("{cluster_id}-control-plane"),
            role: NodeRole::ControlPlane,
            image_id: control_plane_image.image_id,
            instance_type: control_plane_image.instance_type,
            user_data: control_plane_data,
            instance_profile: config.instance_profile.clone(),
        });
        for i in 1..=config.workers {
            specs.push(ImageSpec {
                name: format!("{cluster_id}-worker-{i}"),
                role: NodeRole::Worker,
                image_id: worker_image.image_id.clone(),
                instance_type: worker_image.instance_type.clone(),
                user_data: worker_data.clone(),
                instance_profile: config.instance_profile.clone(),
            });
        }
        Ok(specs)
    }

    async fn launch_and_wait(&mut self, specs: &[ImageSpec], tasks: &mut PollTasks) -> DeployResult<()> {
        self.enter(FleetPhase::Launching);
        let cloud = Arc::clone(&self.cloud);
        let session = Arc::clone(&self.session);
        let config = Arc::clone(&self.config);
        let launcher = Launcher::new(&*cloud, &session, &config.excluded_zones, config.readiness.launch());
        let poller = ReadinessPoller::new(
            Arc::clone(&self.cloud),
            Arc::clone(&self.remote),
            Arc::clone(&self.config),
            self.ssh_key.clone(),
        );

        for spec in specs {
            while let Some(joined) = tasks.try_join_next() {
                self.absorb(joined)?;
            }

            let record = launcher.launch(spec).await?;
            if record.is_control_plane() {
                let ip = record.private_ip.as_deref().ok_or_else(|| {
                    DeployError::State(format!("control plane {} has no private address", record.instance_id))
                })?;
                session.set_control_plane_ip(ip)?;
            }
            self.track(&record)?;

            let poller = poller.clone();
            tasks.spawn(async move { poller.run(record).await });
        }

        self.enter(FleetPhase::PollingConcurrent);
        while let Some(joined) = tasks.join_next().await {
            self.absorb(joined)?;
        }
        Ok(())
    }

    fn track(&mut self, record: &InstanceRecord) -> DeployResult<()> {
        match self.instances.iter_mut().find(|r| r.instance_id == record.instance_id) {
            Some(existing) => *existing = record.clone(),
            None => self.instances.push(record.clone()),
        }
        self.state.track(TrackedInstance::from(record));
        self.state.save(&self.config.run_dir)
    }

    fn absorb(&mut self, joined: Result<DeployResult<ReadyInstance>, JoinError>) -> DeployResult<()> {
        let ready = joined.map_err(|e| DeployError::Task(e.to_string()))??;
        tracing::info!(instance_id = %ready.record.instance_id, role = %ready.record.role, "instance ready");
        if let Some(path) = ready.kubeconfig {
            self.state.kubeconfig = Some(path.clone());
            self.kubeconfig = Some(path);
        }
        self.track(&ready.record)
    }

    fn control_plane(&self) -> DeployResult<&InstanceRecord> {
        self.instances
            .iter()
            .find(|r| r.is_control_plane())
            .ok_or_else(|| DeployError::State("no control-plane instance is tracked".to_string()))
    }

    async fn post_install(&self, expected_nodes: usize) -> DeployResult<()> {
        let control_plane = self.control_plane()?.instance_id.clone();
        let id = control_plane.as_str();
        let remote = &*self.remote;

        let nodes = poll_until(&self.config.readiness.gate(), "node count", move |_| async move {
            match remote
                .ssh(id, &["sudo", "kubectl", "--kubeconfig", ADMIN_CONF, "get", "nodes", "-o", "name"])
                .await
            {
                Ok(output) if count_nodes(&output) >= expected_nodes => Attempt::Ready(count_nodes(&output)),
                Ok(output) => Attempt::Retry(format!(
                    "{} of {expected_nodes} nodes registered",
                    count_nodes(&output)
                )),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
        .await;
        match nodes {
            Ok(count) => tracing::info!(nodes = count, "all nodes registered"),
            Err(PollError::Aborted(e)) => return Err(e),
            Err(PollError::Exhausted { attempts, last }) => {
                return Err(DeployError::ReadinessExhausted {
                    instance_id: control_plane.clone(),
                    gate: "node-count".to_string(),
                    attempts,
                    last_output: last,
                });
            }
        }

        let cloud_init = poll_until(&self.config.readiness.cloud_init(), "cloud-init", move |_| async move {
            match remote.ssh(id, &CLOUD_INIT_STATUS).await {
                Ok(output) if CloudInitStatus::parse(&output) == CloudInitStatus::Done => Attempt::Ready(()),
                Ok(output) => Attempt::Retry(output.trim().to_string()),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
        .await;
        if let Err(e) = cloud_init {
            tracing::warn!(instance_id = %control_plane, error = ?e, "cloud-init did not finish on the control plane");
        }

        if self.config.external_cloud_provider {
            let timeout = format!("--timeout={}s", self.config.readiness.node_ready_timeout_secs);
            let wait = [
                "sudo",
                "kubectl",
                "--kubeconfig",
                ADMIN_CONF,
                "wait",
                "--for=condition=ready",
                "pods",
                "-n",
                "kube-system",
                "-l",
                "k8s-app=aws-cloud-controller-manager",
                timeout.as_str(),
            ];
            if let Err(e) = self.remote.ssh(id, &wait).await {
                tracing::warn!(instance_id = %control_plane, error = %e, "cloud controller manager is not ready");
            }
        }
        Ok(())
    }

    /// Dumps logs from every tracked instance. Never fails.
    pub async fn dump_logs(&self) {
        let logs_dir = self.config.logs_dir();
        let dumper = LogDumper::new(&*self.remote, &logs_dir);
        for record in &self.instances {
            let report = dumper.dump_instance(&record.instance_id, record.is_control_plane()).await;
            tracing::info!(
                instance_id = %record.instance_id,
                files = report.written.len(),
                failures = report.failures.len(),
                "dumped logs"
            );
        }
    }

    /// Dumps logs, then terminates every tracked instance.
    ///
    /// One failed termination does not stop the others; the error lists
    /// every instance that could not be terminated.
    pub async fn down(&mut self) -> DeployResult<()> {
        self.enter(FleetPhase::TearingDown);
        self.dump_logs().await;

        let mut failures = Vec::new();
        for record in &mut self.instances {
            match self.cloud.terminate_instance(&record.instance_id).await {
                Ok(()) => {
                    tracing::info!(instance_id = %record.instance_id, "terminated instance");
                    record.state = InstanceState::ShuttingDown;
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!(instance_id = %record.instance_id, "instance already gone");
                    record.state = InstanceState::Terminated;
                }
                Err(e) => {
                    tracing::error!(instance_id = %record.instance_id, error = %e, "failed to terminate instance");
                    failures.push(TeardownFailure {
                        instance_id: record.instance_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.instances
            .retain(|r| failures.iter().any(|f| f.instance_id == r.instance_id));
        self.state
            .instances
            .retain(|t| failures.iter().any(|f| f.instance_id == t.instance_id));

        if failures.is_empty() {
            SessionState::remove(&self.config.run_dir)?;
            self.enter(FleetPhase::Down);
            Ok(())
        } else {
            self.state.save(&self.config.run_dir)?;
            Err(DeployError::Teardown { failures })
        }
    }

    /// Returns true if every tracked instance is running and the API
    /// server lists at least one node.
    pub async fn is_up(&self) -> DeployResult<bool> {
        if self.instances.is_empty() {
            return Ok(false);
        }
        for record in &self.instances {
            match self.cloud.describe_instance(&record.instance_id).await {
                Ok(d) if d.state == InstanceState::Running => {}
                Ok(d) => {
                    tracing::info!(instance_id = %record.instance_id, state = %d.state, "instance not running");
                    return Ok(false);
                }
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        let control_plane = self.control_plane()?;
        let output = self
            .remote
            .ssh(
                &control_plane.instance_id,
                &["sudo", "kubectl", "--kubeconfig", ADMIN_CONF, "get", "nodes", "-o", "name"],
            )
            .await;
        match output {
            Ok(nodes) => Ok(count_nodes(&nodes) > 0),
            Err(e) => {
                tracing::info!(instance_id = %control_plane.instance_id, error = %e, "cannot list nodes");
                Ok(false)
            }
        }
    }
}
