/// Task lifecycle audit trail
///
/// Every lifecycle step of a task (claim, staging, sandbox run, report,
/// requeue) becomes one structured JSON line carrying the correlation ids
/// needed to follow a task across workers: task id, worker id, run id.
use crate::config::types::{Result, UpletError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Received,
    Claimed,
    ClaimLost,
    Staged,
    SandboxStart,
    SandboxFinish,
    Timeout,
    Teardown,
    Reported,
    ReportFailed,
    Requeued,
    Dropped,
}

impl TaskEventType {
    pub fn default_severity(&self) -> Severity {
        match self {
            TaskEventType::Received
            | TaskEventType::Claimed
            | TaskEventType::Staged
            | TaskEventType::SandboxStart
            | TaskEventType::SandboxFinish
            | TaskEventType::Teardown
            | TaskEventType::Reported => Severity::Low,
            TaskEventType::ClaimLost | TaskEventType::Requeued => Severity::Medium,
            TaskEventType::Timeout | TaskEventType::Dropped => Severity::High,
            // the ledger may never learn the task's fate
            TaskEventType::ReportFailed => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_type: TaskEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub run_id: Option<String>,
    pub topic: Option<String>,
}

impl TaskEvent {
    pub fn new(event_type: TaskEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            task_id: None,
            worker_id: None,
            run_id: None,
            topic: None,
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_worker(mut self, worker_id: Uuid) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(task_id) = self.task_id {
            entry["task_id"] = serde_json::json!(task_id);
        }
        if let Some(worker_id) = self.worker_id {
            entry["worker_id"] = serde_json::json!(worker_id);
        }
        if let Some(run_id) = &self.run_id {
            entry["run_id"] = serde_json::json!(run_id);
        }
        if let Some(topic) = &self.topic {
            entry["topic"] = serde_json::json!(topic);
        }
        entry
    }
}

enum Sink {
    LogOnly,
    File { file: Mutex<File>, path: PathBuf },
    Memory(Mutex<Vec<TaskEvent>>),
}

/// Audit trail writer; every event also goes to the `log` facade
pub struct TaskAuditLog {
    sink: Sink,
}

impl Default for TaskAuditLog {
    fn default() -> Self {
        Self::log_only()
    }
}

impl TaskAuditLog {
    pub fn log_only() -> Self {
        Self { sink: Sink::LogOnly }
    }

    /// Keep events in memory for inspection
    pub fn in_memory() -> Self {
        Self {
            sink: Sink::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Append JSON lines to `path`
    pub fn to_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpletError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| UpletError::Config(format!("Failed to open audit log: {}", e)))?;
        Ok(Self {
            sink: Sink::File {
                file: Mutex::new(file),
                path,
            },
        })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn record(&self, event: TaskEvent) {
        let entry = event.to_json();
        match event.severity {
            Severity::Critical | Severity::High => error!("{:?}: {}", event.event_type, entry),
            Severity::Medium => warn!("{:?}: {}", event.event_type, entry),
            Severity::Low => info!("{:?}: {}", event.event_type, entry),
        }

        match &self.sink {
            Sink::LogOnly => {}
            Sink::File { file, .. } => {
                let mut file = lock(file);
                if let Err(e) = writeln!(file, "{}", entry).and_then(|_| file.flush()) {
                    error!("Failed to write to audit log: {}", e);
                }
            }
            Sink::Memory(events) => lock(events).push(event),
        }
    }

    /// Events kept by an in-memory log
    pub fn events(&self) -> Vec<TaskEvent> {
        match &self.sink {
            Sink::Memory(events) => lock(events).clone(),
            _ => Vec::new(),
        }
    }

    pub fn count(&self, event_type: TaskEventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
