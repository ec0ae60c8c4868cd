//! Best-effort collection of node logs.

use std::path::{Path, PathBuf};

use crate::kubeconfig::ADMIN_CONF;
use crate::remote::RemoteExec;

/// A log file captured from the output of one remote command.
#[derive(Debug, Clone, Copy)]
struct CommandLog {
    file: &'static str,
    command: &'static [&'static str],
    control_plane_only: bool,
}

const COMMAND_LOGS: [CommandLog; 7] = [
    CommandLog {
        file: "containerd-installation.log",
        command: &["sudo", "journalctl", "-u", "containerd-installation", "--no-pager"],
        control_plane_only: false,
    },
    CommandLog {
        file: "containerd.log",
        command: &["sudo", "journalctl", "-u", "containerd", "--no-pager"],
        control_plane_only: false,
    },
    CommandLog {
        file: "cloud-init.log",
        command: &["sudo", "cat", "/var/log/cloud-init.log"],
        control_plane_only: false,
    },
    CommandLog {
        file: "cloud-init-output.log",
        command: &["sudo", "cat", "/var/log/cloud-init-output.log"],
        control_plane_only: false,
    },
    CommandLog {
        file: "kubelet.log",
        command: &["sudo", "journalctl", "-u", "kubelet", "--no-pager"],
        control_plane_only: false,
    },
    CommandLog {
        file: "cluster-info.log",
        command: &[
            "sudo",
            "kubectl",
            "--kubeconfig",
            ADMIN_CONF,
            "cluster-info",
            "dump",
            "--all-namespaces",
        ],
        control_plane_only: true,
    },
    CommandLog {
        file: "journal.log",
        command: &["sudo", "journalctl", "--no-pager"],
        control_plane_only: false,
    },
];

/// What a dump managed to collect for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpReport {
    /// Files written.
    pub written: Vec<PathBuf>,
    /// Steps that failed, as `step: reason`.
    pub failures: Vec<String>,
}

/// Copies node logs into `<logs_dir>/<instance-id>/`.
#[derive(Debug)]
pub struct LogDumper<'a, R> {
    remote: &'a R,
    logs_dir: &'a Path,
}

impl<'a, R: RemoteExec> LogDumper<'a, R> {
    /// Creates a dumper writing under `logs_dir`.
    #[must_use]
    pub fn new(remote: &'a R, logs_dir: &'a Path) -> Self {
        Self { remote, logs_dir }
    }

    /// Dumps everything reachable on one instance. Never fails.
    pub async fn dump_instance(&self, instance_id: &str, control_plane: bool) -> DumpReport {
        let mut report = DumpReport::default();
        let dir = self.logs_dir.join(instance_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(instance_id, dir = %dir.display(), error = %e, "failed to create log directory");
            report.failures.push(format!("mkdir: {e}"));
            return report;
        }

        self.dump_cni(instance_id, &dir, &mut report).await;

        for log in COMMAND_LOGS.iter().filter(|l| control_plane || !l.control_plane_only) {
            tracing::debug!(instance_id, file = log.file, "dumping log");
            let output = match self.remote.ssh(instance_id, log.command).await {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(instance_id, file = log.file, error = %e, "log command failed");
                    report.failures.push(format!("{}: {e}", log.file));
                    e.output()
                }
            };
            let path = dir.join(log.file);
            match std::fs::write(&path, output) {
                Ok(()) => report.written.push(path),
                Err(e) => {
                    tracing::warn!(instance_id, path = %path.display(), error = %e, "failed to write log");
                    report.failures.push(format!("{}: {e}", log.file));
                }
            }
        }
        report
    }

    async fn dump_cni(&self, instance_id: &str, dir: &Path, report: &mut DumpReport) {
        let cni_dir = dir.join("aws-cni");
        let pods_dir = dir.join("pods");
        for d in [&cni_dir, &pods_dir] {
            if let Err(e) = std::fs::create_dir_all(d) {
                report.failures.push(format!("mkdir {}: {e}", d.display()));
                return;
            }
        }

        let steps: [(&str, Result<(), String>); 4] = [
            (
                "aws-cni-support",
                self.remote
                    .ssh(instance_id, &["sudo", "/opt/cni/bin/aws-cni-support.sh"])
                    .await
                    .map(drop)
                    .map_err(|e| e.to_string()),
            ),
            (
                "eks bundle",
                self.remote
                    .scp(instance_id, "/var/log/eks*.tar.gz", &cni_dir)
                    .await
                    .map_err(|e| e.to_string()),
            ),
            (
                "pod log permissions",
                self.remote
                    .ssh(
                        instance_id,
                        &["sudo", "chmod", "-R", "a+rx", "/var/log/pods/", "/var/log/containers/"],
                    )
                    .await
                    .map(drop)
                    .map_err(|e| e.to_string()),
            ),
            (
                "pod logs",
                self.remote
                    .scp(instance_id, "/var/log/pods/", &pods_dir)
                    .await
                    .map_err(|e| e.to_string()),
            ),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                tracing::warn!(instance_id, step, error = %e, "log collection step failed");
                report.failures.push(format!("{step}: {e}"));
            }
        }
    }
}
