/// Core types and structures shared across the upletbox worker
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of an uplet as tracked by the ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Todo,
        TaskStatus::Pending,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal statuses are never left once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UpletError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UpletError::InvalidStatus(s.to_string()))
    }
}

/// Uplet type, using the wire names understood by the ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "learnuplet")]
    Learn,
    #[serde(rename = "preduplet")]
    Predict,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Learn => "learnuplet",
            TaskKind::Predict => "preduplet",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = UpletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "learnuplet" => Ok(TaskKind::Learn),
            "preduplet" => Ok(TaskKind::Predict),
            other => Err(UpletError::InvalidTaskType(other.to_string())),
        }
    }
}

/// Classification of a failed sandbox run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxFailureKind {
    /// Deadline exceeded or run canceled; the environment was torn down
    Timeout,
    /// Environment could not be created or started
    SetupFailure,
    /// The sandboxed program ran and failed, or produced malformed output
    ExecutionFailure,
}

impl SandboxFailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SandboxFailureKind::ExecutionFailure)
    }
}

impl fmt::Display for SandboxFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SandboxFailureKind::Timeout => "timeout",
            SandboxFailureKind::SetupFailure => "setup failure",
            SandboxFailureKind::ExecutionFailure => "execution failure",
        };
        f.write_str(label)
    }
}

/// Directory binding configuration for sandbox mounts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryBinding {
    /// Source directory on host system
    pub source: PathBuf,
    /// Target directory within sandbox
    pub target: PathBuf,
    /// Access permissions
    pub permissions: DirectoryPermissions,
}

/// Directory access permissions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DirectoryPermissions {
    /// Read-only access
    ReadOnly,
    /// Read-only and no execution allowed
    NoExec,
}

impl DirectoryBinding {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            permissions: DirectoryPermissions::ReadOnly,
        }
    }

    /// Read-only binding for inputs that are never executed
    pub fn inert(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            permissions: DirectoryPermissions::NoExec,
            ..Self::read_only(source, target)
        }
    }
}

/// Isolation settings for every sandbox run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Command prefix, run from the sandbox root; the operation name (train/test/predict) is appended
    pub entrypoint: Vec<String>,
    /// Parent directory for run-scoped workspaces
    pub workspace_root: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub memory_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub process_limit: Option<u32>,
    pub fd_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    /// Fail the run when any isolation control cannot be applied
    pub strict_mode: bool,
    /// Run without namespaces when clone() is refused (development only)
    pub allow_degraded: bool,
    pub enable_pid_namespace: bool,
    pub enable_mount_namespace: bool,
    pub enable_network_namespace: bool,
    /// Host directories bound read-only into a jailed root
    pub system_mounts: Vec<PathBuf>,
    /// Captured bytes per stdout/stderr stream
    pub output_limit: usize,
    /// Grace period between SIGTERM and SIGKILL on teardown
    #[serde(with = "duration_millis")]
    pub kill_grace: Duration,
    pub environment: Vec<(String, String)>,
}

impl SandboxConfig {
    /// Workspace root scoped by effective UID.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("upletbox-uid-{}", euid))
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            entrypoint: vec!["/bin/sh".to_string(), "algo/run".to_string()],
            workspace_root: Self::runtime_root_dir(),
            uid: None,
            gid: None,
            memory_limit: Some(4 * 1024 * 1024 * 1024),
            file_size_limit: Some(1024 * 1024 * 1024),
            process_limit: Some(256),
            fd_limit: Some(1024),
            stack_limit: None,
            strict_mode: false,
            allow_degraded: false,
            enable_pid_namespace: true,
            enable_mount_namespace: true,
            enable_network_namespace: true,
            system_mounts: ["/bin", "/usr", "/lib", "/lib64", "/etc"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            output_limit: 1024 * 1024,
            kill_grace: Duration::from_millis(200),
            environment: vec![(
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            )],
        }
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Error classes driving the dispatcher's settlement decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed record or request; rejected before any side effect
    Validation,
    /// Worth another attempt: network, sandbox timeout/setup, local I/O
    Transient,
    /// The task itself cannot succeed
    FatalTask,
    /// Unexpected remote answer
    Protocol,
    /// The ledger settled the task elsewhere
    Conflict,
}

/// What the dispatcher does with a message after its handler failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Return the message to the queue
    Requeue,
    /// Drop the message and report the task failed
    Fail,
    /// Drop the message without touching the ledger
    Discard,
}

/// Error type for the whole crate
#[derive(Error, Debug)]
pub enum UpletError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status: {0} (only pending and failed can be requested)")]
    InvalidStatus(String),

    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),

    #[error("Task {task_id} is already claimed")]
    AlreadyClaimed { task_id: Uuid },

    #[error("Task {task_id} already has a terminal status")]
    AlreadyReported { task_id: Uuid },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Protocol error (status {status}): {message}")]
    Protocol { status: u16, message: String },

    #[error("Sandbox {kind}: {message}")]
    Sandbox {
        kind: SandboxFailureKind,
        message: String,
    },

    #[error("Task failed: {0}")]
    FatalTask(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Privilege error: {0}")]
    Privilege(String),
}

impl UpletError {
    pub fn sandbox(kind: SandboxFailureKind, message: impl Into<String>) -> Self {
        UpletError::Sandbox {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        UpletError::Protocol {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            UpletError::Validation(_)
            | UpletError::InvalidStatus(_)
            | UpletError::InvalidTaskType(_)
            | UpletError::Config(_)
            | UpletError::Unsupported(_) => ErrorClass::Validation,
            UpletError::Io(_)
            | UpletError::Transient(_)
            | UpletError::Process(_)
            | UpletError::Namespace(_)
            | UpletError::Filesystem(_)
            | UpletError::Privilege(_) => ErrorClass::Transient,
            UpletError::Sandbox { kind, .. } if kind.is_retryable() => ErrorClass::Transient,
            UpletError::Sandbox { .. } | UpletError::FatalTask(_) | UpletError::NotFound(_) => {
                ErrorClass::FatalTask
            }
            UpletError::Protocol { .. } => ErrorClass::Protocol,
            UpletError::AlreadyClaimed { .. } | UpletError::AlreadyReported { .. } => {
                ErrorClass::Conflict
            }
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.class() {
            ErrorClass::Transient => Disposition::Requeue,
            ErrorClass::FatalTask => Disposition::Fail,
            ErrorClass::Protocol => match self {
                UpletError::Protocol { status, .. } if (400..500).contains(status) => {
                    Disposition::Fail
                }
                _ => Disposition::Requeue,
            },
            ErrorClass::Validation | ErrorClass::Conflict => Disposition::Discard,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Requeue
    }

    pub fn sandbox_kind(&self) -> Option<SandboxFailureKind> {
        match self {
            UpletError::Sandbox { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<nix::errno::Errno> for UpletError {
    fn from(err: nix::errno::Errno) -> Self {
        UpletError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for UpletError {
    fn from(err: serde_json::Error) -> Self {
        UpletError::Validation(format!("malformed JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, UpletError>;
