use crate::config::types::{duration_millis, Result, SandboxConfig, UpletError};
/// Worker configuration loading from a JSON file and UPLETBOX_* environment overrides
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Host, port and basic-auth credentials of a remote HTTP service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            user: String::new(),
            password: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Consumption settings for one topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub concurrency: usize,
    /// Per-message bound, also the sandbox deadline for that message
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: Uuid,
    /// Scratch area where input blobs are materialized per task
    pub staging_dir: PathBuf,
    /// Root of the filesystem blob store
    pub blob_root: PathBuf,
    pub ledger: EndpointConfig,
    pub storage: EndpointConfig,
    pub learn: TopicConfig,
    pub predict: TopicConfig,
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
    /// Attempts at reporting a failure before giving up
    pub report_retries: u32,
    #[serde(with = "duration_millis")]
    pub report_backoff: Duration,
    /// Deliveries per message before the queue stops requeueing it
    pub queue_max_attempts: u32,
    /// JSON-lines task audit trail; log output only when unset
    pub audit_log: Option<PathBuf>,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let runtime_root = SandboxConfig::runtime_root_dir();
        Self {
            worker_id: Uuid::new_v4(),
            staging_dir: runtime_root.join("staging"),
            blob_root: runtime_root.join("blobs"),
            ledger: EndpointConfig::new("localhost", 8083),
            storage: EndpointConfig::new("localhost", 8081),
            learn: TopicConfig {
                name: "learn".to_string(),
                concurrency: 1,
                timeout: Duration::from_secs(20 * 60),
            },
            predict: TopicConfig {
                name: "predict".to_string(),
                concurrency: 1,
                timeout: Duration::from_secs(10 * 60),
            },
            drain_timeout: Duration::from_secs(30),
            report_retries: 5,
            report_backoff: Duration::from_millis(200),
            queue_max_attempts: 5,
            audit_log: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| UpletError::Config(format!("Failed to read config file: {}", e)))?;

        let config: WorkerConfig = serde_json::from_str(&content)
            .map_err(|e| UpletError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    /// File (or defaults when `path` is None), then `UPLETBOX_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("UPLETBOX_WORKER_ID") {
            self.worker_id = Uuid::parse_str(&raw).map_err(|e| {
                UpletError::Config(format!("UPLETBOX_WORKER_ID is not a UUID: {}", e))
            })?;
        }
        if let Some(dir) = lookup("UPLETBOX_STAGING_DIR") {
            self.staging_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("UPLETBOX_BLOB_ROOT") {
            self.blob_root = PathBuf::from(dir);
        }
        if let Some(path) = lookup("UPLETBOX_AUDIT_LOG") {
            self.audit_log = Some(PathBuf::from(path));
        }

        apply_endpoint(&lookup, "LEDGER", &mut self.ledger)?;
        apply_endpoint(&lookup, "STORAGE", &mut self.storage)?;
        apply_topic(&lookup, "LEARN", &mut self.learn)?;
        apply_topic(&lookup, "PREDICT", &mut self.predict)?;

        if let Some(raw) = lookup("UPLETBOX_SANDBOX_STRICT") {
            self.sandbox.strict_mode = parse_var("UPLETBOX_SANDBOX_STRICT", &raw)?;
        }
        if let Some(raw) = lookup("UPLETBOX_SANDBOX_ALLOW_DEGRADED") {
            self.sandbox.allow_degraded = parse_var("UPLETBOX_SANDBOX_ALLOW_DEGRADED", &raw)?;
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| UpletError::Config(format!("Invalid value for {}: {} ({})", name, raw, e)))
}

fn apply_endpoint<F>(lookup: &F, prefix: &str, endpoint: &mut EndpointConfig) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup(&format!("UPLETBOX_{}_HOST", prefix)) {
        endpoint.host = host;
    }
    let port_var = format!("UPLETBOX_{}_PORT", prefix);
    if let Some(raw) = lookup(&port_var) {
        endpoint.port = parse_var(&port_var, &raw)?;
    }
    if let Some(user) = lookup(&format!("UPLETBOX_{}_USER", prefix)) {
        endpoint.user = user;
    }
    if let Some(password) = lookup(&format!("UPLETBOX_{}_PASSWORD", prefix)) {
        endpoint.password = password;
    }
    Ok(())
}

fn apply_topic<F>(lookup: &F, prefix: &str, topic: &mut TopicConfig) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let concurrency_var = format!("UPLETBOX_{}_CONCURRENCY", prefix);
    if let Some(raw) = lookup(&concurrency_var) {
        topic.concurrency = parse_var(&concurrency_var, &raw)?;
    }
    let timeout_var = format!("UPLETBOX_{}_TIMEOUT_SECS", prefix);
    if let Some(raw) = lookup(&timeout_var) {
        topic.timeout = Duration::from_secs(parse_var(&timeout_var, &raw)?);
    }
    Ok(())
}
