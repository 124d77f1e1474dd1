use crate::config::types::{DirectoryBinding, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything the proxy needs to set up and exec one payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    /// Sandbox root on the host; becomes `/` when the run is jailed
    pub root_dir: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub strict_mode: bool,
    pub allow_degraded: bool,
    pub enable_pid_namespace: bool,
    pub enable_mount_namespace: bool,
    pub enable_network_namespace: bool,
    pub memory_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    pub process_limit: Option<u32>,
    pub fd_limit: Option<u64>,
    /// Input directories exposed inside the root
    pub directory_bindings: Vec<DirectoryBinding>,
    /// Host directories bound read-only into the root so the entrypoint can run
    pub system_mounts: Vec<PathBuf>,
    pub output_limit: usize,
    pub kill_grace_ms: u64,
}

impl ExecutionProfile {
    pub fn from_config(
        config: &SandboxConfig,
        command: Vec<String>,
        root_dir: PathBuf,
        directory_bindings: Vec<DirectoryBinding>,
    ) -> Self {
        Self {
            command,
            environment: config.environment.clone(),
            root_dir,
            uid: config.uid,
            gid: config.gid,
            strict_mode: config.strict_mode,
            allow_degraded: config.allow_degraded,
            enable_pid_namespace: config.enable_pid_namespace,
            enable_mount_namespace: config.enable_mount_namespace,
            enable_network_namespace: config.enable_network_namespace,
            memory_limit: config.memory_limit,
            file_size_limit: config.file_size_limit,
            stack_limit: config.stack_limit,
            process_limit: config.process_limit,
            fd_limit: config.fd_limit,
            directory_bindings,
            system_mounts: config.system_mounts.clone(),
            output_limit: config.output_limit,
            kill_grace_ms: config.kill_grace.as_millis() as u64,
        }
    }
}

/// Host->proxy launch contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLaunchRequest {
    pub run_id: String,
    pub profile: ExecutionProfile,
}

/// Signal escalation report for timeout/cancel teardown.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Which isolation controls were requested and which actually held.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LaunchEvidence {
    pub strict_requested: bool,
    pub running_as_root: bool,
    pub degraded: bool,
    pub configured_controls: Vec<String>,
    pub applied_controls: Vec<String>,
    pub missing_controls: Vec<String>,
    pub mode_decision_reason: String,
}

/// Proxy->host status payload transferred through status pipe.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub payload_pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    pub wall_time_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    /// Pre-exec failure reported by the payload child before exec
    pub setup_error: Option<String>,
    /// Proxy-side failure (pipes, fork, wait)
    pub internal_error: Option<String>,
    pub reaped_descendants: u32,
}

/// Core launch output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLaunchOutcome {
    pub proxy_host_pid: i32,
    pub payload_host_pid: Option<i32>,
    /// Deadline expiry or caller cancellation forced a teardown
    pub timed_out: bool,
    pub canceled: bool,
    pub status: ProxyStatus,
    pub evidence: LaunchEvidence,
    pub kill_report: Option<KillReport>,
}
