//! Learn and predict pipelines
//!
//! A [`Worker`] turns one task message into ledger calls, blob transfers and
//! sandbox runs:
//!
//! ```text
//! decode -> check -> claim -> stage inputs -> run -> store output -> report
//! ```
//!
//! Inputs are staged into a per-task directory that is removed when the task
//! settles, whatever the outcome. Errors keep their classification so the
//! consumer can decide between requeue, failure report and discard.

use crate::broker::{Consumer, Handler, HandlerContext, Message, RetryPolicy, WorkQueue};
use crate::config::types::{Result, SandboxFailureKind, TaskKind, UpletError};
use crate::config::{validate_config, WorkerConfig};
use crate::ledger::{OrchestratorApi, TaskLedgerClient};
use crate::model::{
    Checkable, LearnResult, LearnTask, PredictResult, PredictTask, ResourceKind,
};
use crate::observability::{TaskAuditLog, TaskEvent, TaskEventType};
use crate::safety::{Workspace, WorkspaceManager};
use crate::sandbox::{IsolatedRunner, RunInputs, RunOp, SandboxRunner};
use crate::storage::{BlobStore, FsBlobStore};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// File name of the staged algorithm package inside `algo/`
const ALGO_FILE: &str = "run";
/// File name of a staged model inside its model directory
const MODEL_FILE: &str = "model";

pub struct Worker {
    worker_id: Uuid,
    ledger: TaskLedgerClient,
    blobs: Arc<dyn BlobStore>,
    runner: Arc<dyn SandboxRunner>,
    staging: WorkspaceManager,
    audit: Arc<TaskAuditLog>,
}

impl Worker {
    pub fn new(
        worker_id: Uuid,
        ledger: TaskLedgerClient,
        blobs: Arc<dyn BlobStore>,
        runner: Arc<dyn SandboxRunner>,
        staging_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            worker_id,
            ledger,
            blobs,
            runner,
            staging: WorkspaceManager::new(staging_dir.into())?,
            audit: Arc::new(TaskAuditLog::default()),
        })
    }

    /// Production wiring: orchestrator ledger, filesystem blobs, namespace sandbox.
    /// Fails on any configuration error; warnings are logged.
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let validation = validate_config(config)?;
        for warning in &validation.warnings {
            log::warn!("Config: {}", warning);
        }
        if !validation.is_valid() {
            return Err(UpletError::Config(validation.errors.join("; ")));
        }

        let ledger = TaskLedgerClient::new(Arc::new(OrchestratorApi::new(&config.ledger)?));
        let blobs = Arc::new(FsBlobStore::new(config.blob_root.clone())?);
        let runner = Arc::new(IsolatedRunner::new(config.sandbox.clone())?);
        let worker = Self::new(
            config.worker_id,
            ledger,
            blobs,
            runner,
            config.staging_dir.clone(),
        )?;
        match &config.audit_log {
            Some(path) => Ok(worker.with_audit(Arc::new(TaskAuditLog::to_file(path)?))),
            None => Ok(worker),
        }
    }

    pub fn with_audit(mut self, audit: Arc<TaskAuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn audit(&self) -> &Arc<TaskAuditLog> {
        &self.audit
    }

    /// Consumer serving the learn and predict topics of `config` with this worker
    pub fn consumer(self: &Arc<Self>, queue: Arc<dyn WorkQueue>, config: &WorkerConfig) -> Consumer {
        let mut consumer = Consumer::new(queue)
            .with_drain_timeout(config.drain_timeout)
            .with_retry_policy(RetryPolicy {
                attempts: config.report_retries,
                base_delay: config.report_backoff,
                ..RetryPolicy::default()
            })
            .with_audit(Arc::clone(&self.audit));
        consumer
            .add_handler(
                config.learn.name.clone(),
                Arc::new(LearnHandler(Arc::clone(self))),
                config.learn.concurrency,
                config.learn.timeout,
            )
            .add_handler(
                config.predict.name.clone(),
                Arc::new(PredictHandler(Arc::clone(self))),
                config.predict.concurrency,
                config.predict.timeout,
            );
        consumer
    }

    /// Decode, validate and claim a learn task, then run it to a reported result
    pub fn handle_learn(&self, body: &[u8], ctx: &HandlerContext) -> Result<()> {
        let task: LearnTask = decode(body)?;
        task.check()?;
        self.claim(task.kind(), task.id)?;

        let result = self.run_learn(&task, ctx)?;
        self.ledger.report_learn_result(task.id, &result)?;
        self.record(
            TaskEvent::new(TaskEventType::Reported, format!("done, perf {}", result.perf))
                .with_task(task.id),
        );
        Ok(())
    }

    pub fn handle_predict(&self, body: &[u8], ctx: &HandlerContext) -> Result<()> {
        let task: PredictTask = decode(body)?;
        task.check()?;
        self.claim(task.kind(), task.id)?;

        let result = self.run_predict(&task, ctx)?;
        self.ledger.report_predict_result(task.id, &result)?;
        self.record(
            TaskEvent::new(
                TaskEventType::Reported,
                format!("done, prediction {}", result.prediction_storage_uuid),
            )
            .with_task(task.id),
        );
        Ok(())
    }

    /// Train on `train_data`, evaluate on `test_data` and store the model.
    /// The task must already be claimed.
    pub fn run_learn(&self, task: &LearnTask, ctx: &HandlerContext) -> Result<LearnResult> {
        let staging = self.staging.create_workspace()?;
        let outcome = self.learn_in(&staging, task, ctx);
        self.teardown(staging, task.id);
        outcome
    }

    /// Predict over `data` with the task's workflow and model, and store the prediction.
    /// The task must already be claimed.
    pub fn run_predict(&self, task: &PredictTask, ctx: &HandlerContext) -> Result<PredictResult> {
        let staging = self.staging.create_workspace()?;
        let outcome = self.predict_in(&staging, task, ctx);
        self.teardown(staging, task.id);
        outcome
    }

    fn learn_in(&self, staging: &Workspace, task: &LearnTask, ctx: &HandlerContext) -> Result<LearnResult> {
        let algo_dir = self.stage_algo(staging, task.algo)?;
        let train_dir = self.stage_data(staging, "train", &task.train_data)?;
        let test_dir = self.stage_data(staging, "test", &task.test_data)?;

        let mut train_inputs = RunInputs::new(&algo_dir, &train_dir).with_cancel(Arc::clone(&ctx.cancel));
        if task.rank > 0 {
            let model_start = task.model_start().ok_or_else(|| {
                UpletError::Validation(format!("rank {} and empty model_start", task.rank))
            })?;
            let start_dir = staging.input_dir("model_start")?;
            self.fetch(&ResourceKind::Model.blob_key(model_start), &start_dir.join(MODEL_FILE))?;
            train_inputs = train_inputs.with_model(start_dir);
        }
        self.record(
            TaskEvent::new(
                TaskEventType::Staged,
                format!(
                    "{} train and {} test blob(s), rank {}",
                    task.train_data.len(),
                    task.test_data.len(),
                    task.rank
                ),
            )
            .with_task(task.id)
            .with_run(staging.run_id()),
        );

        let trained = self.sandboxed(task.id, RunOp::Train, ctx, |timeout| {
            self.runner.train(&train_inputs, timeout)
        })?;

        let model_dir = staging.input_dir("model")?;
        write_file(&model_dir.join(MODEL_FILE), &trained.model)?;

        let test_inputs = RunInputs::new(&algo_dir, &test_dir)
            .with_model(&model_dir)
            .with_cancel(Arc::clone(&ctx.cancel));
        let tested = self.sandboxed(task.id, RunOp::Test, ctx, |timeout| {
            self.runner.test(&test_inputs, timeout)
        })?;

        let model_id = task.model_end().unwrap_or_else(Uuid::new_v4);
        self.blobs
            .put_bytes(&ResourceKind::Model.blob_key(model_id), &trained.model)?;
        log::info!(
            "Task {}: model {} stored ({} bytes), perf {}",
            task.id,
            model_id,
            trained.model.len(),
            tested.perf
        );

        Ok(LearnResult::done(
            tested.perf,
            trained.score.metrics,
            tested.metrics,
        ))
    }

    fn predict_in(
        &self,
        staging: &Workspace,
        task: &PredictTask,
        ctx: &HandlerContext,
    ) -> Result<PredictResult> {
        let algo_dir = self.stage_algo(staging, task.workflow)?;
        let model_dir = staging.input_dir("model")?;
        self.fetch(&ResourceKind::Model.blob_key(task.model), &model_dir.join(MODEL_FILE))?;
        let data_dir = self.stage_data(staging, "data", &task.data)?;
        self.record(
            TaskEvent::new(
                TaskEventType::Staged,
                format!("model {} and {} data blob(s)", task.model, task.data.len()),
            )
            .with_task(task.id)
            .with_run(staging.run_id()),
        );

        let inputs = RunInputs::new(&algo_dir, &data_dir)
            .with_model(&model_dir)
            .with_cancel(Arc::clone(&ctx.cancel));
        let prediction = self.sandboxed(task.id, RunOp::Predict, ctx, |timeout| {
            self.runner.predict(&inputs, timeout)
        })?;

        let prediction_id = Uuid::new_v4();
        self.blobs
            .put_bytes(&ResourceKind::Prediction.blob_key(prediction_id), &prediction)?;
        Ok(PredictResult::done(prediction_id))
    }

    /// Run one sandbox operation within what is left of the message deadline
    fn sandboxed<T>(
        &self,
        task_id: Uuid,
        op: RunOp,
        ctx: &HandlerContext,
        run: impl FnOnce(std::time::Duration) -> Result<T>,
    ) -> Result<T> {
        if ctx.is_canceled() {
            return Err(UpletError::sandbox(
                SandboxFailureKind::Timeout,
                format!("{} canceled before start", op),
            ));
        }

        let timeout = ctx.remaining();
        self.record(
            TaskEvent::new(TaskEventType::SandboxStart, format!("{} (timeout {:?})", op, timeout))
                .with_task(task_id),
        );
        let started = Instant::now();
        let outcome = run(timeout);

        let event = match &outcome {
            Ok(_) => TaskEvent::new(
                TaskEventType::SandboxFinish,
                format!("{} completed in {:?}", op, started.elapsed()),
            ),
            Err(e) if e.sandbox_kind() == Some(SandboxFailureKind::Timeout) => {
                TaskEvent::new(TaskEventType::Timeout, format!("{}: {}", op, e))
            }
            Err(e) => TaskEvent::new(TaskEventType::SandboxFinish, format!("{}: {}", op, e)),
        };
        self.record(event.with_task(task_id));
        outcome
    }

    fn claim(&self, kind: TaskKind, task_id: Uuid) -> Result<()> {
        match self.ledger.claim(kind, task_id, self.worker_id) {
            Ok(()) => {
                self.record(TaskEvent::new(TaskEventType::Claimed, kind.as_str()).with_task(task_id));
                Ok(())
            }
            Err(e) => {
                if matches!(e, UpletError::AlreadyClaimed { .. }) {
                    self.record(
                        TaskEvent::new(TaskEventType::ClaimLost, e.to_string()).with_task(task_id),
                    );
                }
                Err(e)
            }
        }
    }

    fn stage_algo(&self, staging: &Workspace, algo: Uuid) -> Result<PathBuf> {
        let dir = staging.input_dir("algo")?;
        self.fetch(&ResourceKind::Algo.blob_key(algo), &dir.join(ALGO_FILE))?;
        Ok(dir)
    }

    /// Stage data blobs under `name/`, one file per blob named by its uuid
    fn stage_data(&self, staging: &Workspace, name: &str, ids: &[Uuid]) -> Result<PathBuf> {
        let dir = staging.input_dir(name)?;
        for id in ids {
            self.fetch(&ResourceKind::Data.blob_key(*id), &dir.join(id.to_string()))?;
        }
        Ok(dir)
    }

    fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        let mut reader = self.blobs.get(key)?;
        let mut file = File::create(dest)?;
        let size = io::copy(&mut reader, &mut file)?;
        file.flush()?;
        log::debug!("Staged {} ({} bytes) at {}", key, size, dest.display());
        Ok(())
    }

    fn teardown(&self, staging: Workspace, task_id: Uuid) {
        let run_id = staging.run_id().to_string();
        if let Err(e) = staging.cleanup() {
            log::warn!("Task {}: {}", task_id, e);
        }
        drop(staging);
        self.record(
            TaskEvent::new(TaskEventType::Teardown, "staging removed")
                .with_task(task_id)
                .with_run(run_id),
        );
    }

    fn record(&self, event: TaskEvent) {
        self.audit.record(event.with_worker(self.worker_id));
    }

    fn report_failure(&self, kind: TaskKind, task_id: Uuid) -> Result<()> {
        self.ledger.report_failure(kind, task_id, self.worker_id)?;
        self.record(TaskEvent::new(TaskEventType::Reported, "failed").with_task(task_id));
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| UpletError::Validation(format!("undecodable task message: {}", e)))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}

/// Learn topic handler
pub struct LearnHandler(pub Arc<Worker>);

/// Predict topic handler
pub struct PredictHandler(pub Arc<Worker>);

impl Handler for LearnHandler {
    fn handle(&self, message: &Message, ctx: &HandlerContext) -> Result<()> {
        self.0.handle_learn(&message.body, ctx)
    }

    fn report_failure(&self, message: &Message) -> Result<()> {
        let task: LearnTask = decode(&message.body)?;
        self.0.report_failure(TaskKind::Learn, task.id)
    }
}

impl Handler for PredictHandler {
    fn handle(&self, message: &Message, ctx: &HandlerContext) -> Result<()> {
        self.0.handle_predict(&message.body, ctx)
    }

    fn report_failure(&self, message: &Message) -> Result<()> {
        let task: PredictTask = decode(&message.body)?;
        self.0.report_failure(TaskKind::Predict, task.id)
    }
}
