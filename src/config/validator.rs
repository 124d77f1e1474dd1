// Startup validation of the worker configuration.
// Strict sandbox mode fails fast with actionable errors; otherwise problems are returned as findings.

use crate::config::config::{EndpointConfig, TopicConfig, WorkerConfig};
use crate::config::types::{Result, UpletError};

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate config at startup
pub fn validate_config(config: &WorkerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.worker_id.is_nil() {
        result.add_error("worker_id must not be the nil UUID".to_string());
    }

    validate_endpoint("ledger", &config.ledger, &mut result);
    validate_endpoint("storage", &config.storage, &mut result);
    validate_topic(&config.learn, &mut result);
    validate_topic(&config.predict, &mut result);
    validate_sandbox(config, &mut result);

    if config.report_retries == 0 {
        result.add_error("report_retries must be at least 1".to_string());
    }
    if config.queue_max_attempts == 0 {
        result.add_error("queue_max_attempts must be at least 1".to_string());
    }

    if config.sandbox.strict_mode && !result.is_valid() {
        let error_msg = format!(
            "Config validation failed in strict mode:\n{}",
            result.errors.join("\n")
        );
        return Err(UpletError::Config(error_msg));
    }

    Ok(result)
}

fn validate_endpoint(name: &str, endpoint: &EndpointConfig, result: &mut ValidationResult) {
    if endpoint.host.trim().is_empty() {
        result.add_error(format!("{} host cannot be empty", name));
    }
    if endpoint.port == 0 {
        result.add_error(format!("{} port cannot be zero", name));
    }
    if endpoint.user.is_empty() {
        result.add_warning(format!("{} has no basic-auth user configured", name));
    }
}

fn validate_topic(topic: &TopicConfig, result: &mut ValidationResult) {
    if topic.name.trim().is_empty() {
        result.add_error("topic name cannot be empty".to_string());
    }
    if topic.concurrency == 0 {
        result.add_error(format!("topic {} concurrency cannot be zero", topic.name));
    }
    if topic.timeout.is_zero() {
        result.add_error(format!("topic {} timeout cannot be zero", topic.name));
    }
}

fn validate_sandbox(config: &WorkerConfig, result: &mut ValidationResult) {
    let sandbox = &config.sandbox;

    if sandbox.entrypoint.is_empty() {
        result.add_error("sandbox entrypoint cannot be empty".to_string());
    }
    if !sandbox.workspace_root.is_absolute() {
        result.add_error(format!(
            "sandbox workspace_root must be absolute path: {:?}",
            sandbox.workspace_root
        ));
    }
    if sandbox.memory_limit == Some(0) {
        result.add_error("memory_limit cannot be zero".to_string());
    }
    if sandbox.process_limit == Some(0) {
        result.add_error("process_limit cannot be zero".to_string());
    }

    if sandbox.strict_mode {
        if !sandbox.enable_pid_namespace || !sandbox.enable_mount_namespace {
            result.add_error(
                "pid and mount namespaces are mandatory in strict mode".to_string(),
            );
        }
        if !sandbox.enable_network_namespace {
            result.add_error("network namespace is mandatory in strict mode".to_string());
        }
        if sandbox.allow_degraded {
            result.add_error("allow_degraded cannot be combined with strict mode".to_string());
        }
    } else if sandbox.allow_degraded {
        result.add_warning(
            "allow_degraded enabled: runs may execute without isolation (unsafe for untrusted code)"
                .to_string(),
        );
    }

    if sandbox.uid.is_none() {
        result.add_warning("sandbox uid unset; payload keeps the worker's identity".to_string());
    }
}
