//! Task ledger access
//!
//! The ledger owns canonical task state and arbitrates claims. Workers only
//! ever move a task to `pending` (claim) or to a terminal status.

pub mod http;
pub mod memory;

pub use http::OrchestratorApi;
pub use memory::{MemoryLedger, TaskEntry};

use crate::config::types::{Result, TaskKind, TaskStatus, UpletError};
use crate::model::{LearnResult, PredictResult};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Statuses a worker may request through a status update
static UPDATABLE_STATUSES: Lazy<HashSet<TaskStatus>> =
    Lazy::new(|| [TaskStatus::Pending, TaskStatus::Failed].into_iter().collect());

/// Reject statuses that cannot be requested, before any network call
pub fn ensure_updatable(status: TaskStatus) -> Result<()> {
    if UPDATABLE_STATUSES.contains(&status) {
        Ok(())
    } else {
        Err(UpletError::InvalidStatus(status.to_string()))
    }
}

/// Ledger backend
pub trait Ledger: Send + Sync {
    /// Move a task to `pending` (claim) or `failed`
    fn update_status(
        &self,
        kind: TaskKind,
        status: TaskStatus,
        task_id: Uuid,
        worker_id: Uuid,
    ) -> Result<()>;

    fn post_learn_result(&self, task_id: Uuid, result: &LearnResult) -> Result<()>;

    fn post_predict_result(&self, task_id: Uuid, result: &PredictResult) -> Result<()>;
}

/// Task lifecycle operations on top of a ledger backend
#[derive(Clone)]
pub struct TaskLedgerClient {
    backend: Arc<dyn Ledger>,
}

impl TaskLedgerClient {
    pub fn new(backend: Arc<dyn Ledger>) -> Self {
        Self { backend }
    }

    pub fn update_status(
        &self,
        kind: TaskKind,
        status: TaskStatus,
        task_id: Uuid,
        worker_id: Uuid,
    ) -> Result<()> {
        ensure_updatable(status)?;
        self.backend.update_status(kind, status, task_id, worker_id)
    }

    /// `todo -> pending`; a task claimed by another worker yields `AlreadyClaimed`
    pub fn claim(&self, kind: TaskKind, task_id: Uuid, worker_id: Uuid) -> Result<()> {
        self.update_status(kind, TaskStatus::Pending, task_id, worker_id)?;
        log::info!("Claimed {} {} for worker {}", kind, task_id, worker_id);
        Ok(())
    }

    pub fn report_failure(&self, kind: TaskKind, task_id: Uuid, worker_id: Uuid) -> Result<()> {
        let outcome = self.update_status(kind, TaskStatus::Failed, task_id, worker_id);
        tolerate_duplicate(task_id, outcome)
    }

    pub fn report_learn_result(&self, task_id: Uuid, result: &LearnResult) -> Result<()> {
        tolerate_duplicate(task_id, self.backend.post_learn_result(task_id, result))
    }

    pub fn report_predict_result(&self, task_id: Uuid, result: &PredictResult) -> Result<()> {
        tolerate_duplicate(task_id, self.backend.post_predict_result(task_id, result))
    }
}

/// The ledger keeps the first terminal report; later ones are not errors
fn tolerate_duplicate(task_id: Uuid, outcome: Result<()>) -> Result<()> {
    match outcome {
        Err(UpletError::AlreadyReported { .. }) => {
            log::warn!("Task {} was already settled, keeping the ledger's status", task_id);
            Ok(())
        }
        other => other,
    }
}
