use crate::config::types::{Result, TaskKind, TaskStatus, UpletError};
use crate::ledger::Ledger;
use crate::model::{LearnResult, PredictResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Ledger-side state of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub worker: Option<Uuid>,
    pub learn_result: Option<LearnResult>,
    pub predict_result: Option<PredictResult>,
}

impl TaskEntry {
    fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            status: TaskStatus::Todo,
            worker: None,
            learn_result: None,
            predict_result: None,
        }
    }
}

/// In-process ledger with atomic claims and a reachability switch
#[derive(Debug)]
pub struct MemoryLedger {
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register a task in `todo`
    pub fn insert(&self, kind: TaskKind, task_id: Uuid) {
        self.lock().insert(task_id, TaskEntry::new(kind));
    }

    pub fn entry(&self, task_id: Uuid) -> Option<TaskEntry> {
        self.lock().get(&task_id).cloned()
    }

    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.entry(task_id).map(|entry| entry.status)
    }

    /// While unreachable every call fails with a transient error
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Backend calls received, reachable or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call, check reachability, then run `f` on the task under the lock
    fn with_task<T>(
        &self,
        task_id: Uuid,
        f: impl FnOnce(&mut TaskEntry) -> Result<T>,
    ) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(UpletError::Transient("ledger unreachable".to_string()));
        }

        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(&task_id)
            .ok_or_else(|| UpletError::protocol(404, format!("unknown task {}", task_id)))?;
        f(entry)
    }

    fn settle(entry: &mut TaskEntry, task_id: Uuid) -> Result<()> {
        match entry.status {
            TaskStatus::Pending => Ok(()),
            TaskStatus::Done | TaskStatus::Failed => Err(UpletError::AlreadyReported { task_id }),
            TaskStatus::Todo => Err(UpletError::protocol(
                400,
                format!("task {} was never claimed", task_id),
            )),
        }
    }
}

impl Ledger for MemoryLedger {
    fn update_status(
        &self,
        kind: TaskKind,
        status: TaskStatus,
        task_id: Uuid,
        worker_id: Uuid,
    ) -> Result<()> {
        self.with_task(task_id, |entry| {
            if entry.kind != kind {
                return Err(UpletError::protocol(
                    400,
                    format!("task {} is a {}, not a {}", task_id, entry.kind, kind),
                ));
            }

            match status {
                TaskStatus::Pending => match (entry.status, entry.worker) {
                    (TaskStatus::Todo, _) => {
                        entry.status = TaskStatus::Pending;
                        entry.worker = Some(worker_id);
                        Ok(())
                    }
                    // redelivered message, same worker
                    (TaskStatus::Pending, Some(owner)) if owner == worker_id => Ok(()),
                    _ => Err(UpletError::AlreadyClaimed { task_id }),
                },
                TaskStatus::Failed => {
                    if entry.status.is_terminal() {
                        return Err(UpletError::AlreadyReported { task_id });
                    }
                    entry.status = TaskStatus::Failed;
                    if entry.worker.is_none() {
                        entry.worker = Some(worker_id);
                    }
                    Ok(())
                }
                other => Err(UpletError::InvalidStatus(other.to_string())),
            }
        })
    }

    fn post_learn_result(&self, task_id: Uuid, result: &LearnResult) -> Result<()> {
        self.with_task(task_id, |entry| {
            Self::settle(entry, task_id)?;
            entry.status = result.status;
            entry.learn_result = Some(result.clone());
            Ok(())
        })
    }

    fn post_predict_result(&self, task_id: Uuid, result: &PredictResult) -> Result<()> {
        self.with_task(task_id, |entry| {
            Self::settle(entry, task_id)?;
            entry.status = result.status;
            entry.predict_result = Some(result.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PerfMap;

    #[test]
    fn claim_is_exclusive_but_idempotent_for_the_owner() {
        let ledger = MemoryLedger::new();
        let (task, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        ledger.insert(TaskKind::Learn, task);

        ledger.update_status(TaskKind::Learn, TaskStatus::Pending, task, a).unwrap();
        ledger.update_status(TaskKind::Learn, TaskStatus::Pending, task, a).unwrap();
        assert!(matches!(
            ledger.update_status(TaskKind::Learn, TaskStatus::Pending, task, b),
            Err(UpletError::AlreadyClaimed { .. })
        ));
        assert_eq!(ledger.entry(task).unwrap().worker, Some(a));
    }

    #[test]
    fn first_terminal_report_wins() {
        let ledger = MemoryLedger::new();
        let (task, worker) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.insert(TaskKind::Learn, task);
        ledger.update_status(TaskKind::Learn, TaskStatus::Pending, task, worker).unwrap();

        let result = LearnResult::done(0.8, PerfMap::new(), PerfMap::new());
        ledger.post_learn_result(task, &result).unwrap();
        assert!(matches!(
            ledger.update_status(TaskKind::Learn, TaskStatus::Failed, task, worker),
            Err(UpletError::AlreadyReported { .. })
        ));
        assert_eq!(ledger.status(task), Some(TaskStatus::Done));
    }

    #[test]
    fn unreachable_ledger_fails_transiently_and_counts_calls() {
        let ledger = MemoryLedger::new();
        let task = Uuid::new_v4();
        ledger.insert(TaskKind::Predict, task);
        ledger.set_reachable(false);

        let err = ledger
            .update_status(TaskKind::Predict, TaskStatus::Pending, task, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, UpletError::Transient(_)));
        assert_eq!(ledger.calls(), 1);
        assert_eq!(ledger.status(task), Some(TaskStatus::Todo));
    }

    #[test]
    fn wrong_kind_or_unknown_task_is_a_protocol_error() {
        let ledger = MemoryLedger::new();
        let task = Uuid::new_v4();
        ledger.insert(TaskKind::Learn, task);

        assert!(matches!(
            ledger.update_status(TaskKind::Predict, TaskStatus::Pending, task, Uuid::new_v4()),
            Err(UpletError::Protocol { status: 400, .. })
        ));
        assert!(matches!(
            ledger.update_status(TaskKind::Learn, TaskStatus::Pending, Uuid::new_v4(), Uuid::new_v4()),
            Err(UpletError::Protocol { status: 404, .. })
        ));
    }
}
