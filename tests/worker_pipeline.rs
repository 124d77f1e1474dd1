//! Integration tests for the learn/predict pipeline behind the consumer
//!
//! Every collaborator is the deterministic in-memory implementation, so the
//! tests exercise claim, staging, settlement and reporting without a sandbox.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use upletbox::broker::{Settlement, WorkQueue};
use upletbox::model::{LearnTask, PerfMap, PredictTask, ResourceKind};
use upletbox::observability::{self, TaskAuditLog, TaskEventType};
use upletbox::sandbox::{RunInputs, ScriptedOutcome, Score, TrainOutput};
use upletbox::{
    BlobStore, Consumer, MemoryBlobStore, MemoryBroker, MemoryLedger, Result, SandboxFailureKind,
    SandboxRunner, ScriptedRunner, TaskKind, TaskLedgerClient, TaskStatus, UpletError, Worker,
    WorkerConfig,
};
use uuid::Uuid;

struct Harness {
    _dir: tempfile::TempDir,
    config: WorkerConfig,
    ledger: Arc<MemoryLedger>,
    blobs: Arc<MemoryBlobStore>,
    broker: Arc<MemoryBroker>,
    audit: Arc<TaskAuditLog>,
}

impl Harness {
    fn new() -> Self {
        observability::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::default();
        config.staging_dir = dir.path().join("staging");
        config.report_retries = 3;
        config.report_backoff = Duration::from_millis(1);
        config.drain_timeout = Duration::from_secs(1);
        config.queue_max_attempts = 2;
        Self {
            broker: Arc::new(MemoryBroker::new(config.queue_max_attempts)),
            _dir: dir,
            config,
            ledger: Arc::new(MemoryLedger::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            audit: Arc::new(TaskAuditLog::in_memory()),
        }
    }

    fn consumer(&self, runner: Arc<dyn SandboxRunner>) -> Consumer {
        let worker = Worker::new(
            self.config.worker_id,
            TaskLedgerClient::new(self.ledger.clone()),
            self.blobs.clone(),
            runner,
            &self.config.staging_dir,
        )
        .unwrap()
        .with_audit(self.audit.clone());
        Arc::new(worker).consumer(self.broker.clone(), &self.config)
    }

    fn blob(&self, kind: ResourceKind, bytes: &[u8]) -> Uuid {
        let id = Uuid::new_v4();
        self.blobs.put_bytes(&kind.blob_key(id), bytes).unwrap();
        id
    }

    fn learn_task(&self) -> LearnTask {
        let algo = self.blob(ResourceKind::Algo, b"#!/bin/sh\n");
        let train = self.blob(ResourceKind::Data, b"1,0\n");
        let test = self.blob(ResourceKind::Data, b"0,1\n");
        let task = LearnTask::new(Uuid::new_v4(), algo, vec![train], vec![test]);
        self.ledger.insert(TaskKind::Learn, task.id);
        task
    }

    /// Pull the next message of `topic` and settle it synchronously
    fn deliver(&self, consumer: &Consumer, topic: &str) -> Result<Settlement> {
        let message = self
            .broker
            .pull(topic, Duration::from_millis(100))
            .unwrap()
            .expect("a queued message");
        consumer.handle_message(message)
    }

    fn staging_is_empty(&self) -> bool {
        dir_is_empty(&self.config.staging_dir)
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).map_or(true, |mut entries| entries.next().is_none())
}

fn score(perf: f64, metric: &str) -> Score {
    Score {
        perf,
        metrics: PerfMap::from([(metric.to_string(), perf)]),
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(10) {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_learn_task_runs_to_a_done_report() {
    let h = Harness::new();
    let runner = Arc::new(ScriptedRunner::new());
    runner
        .push(ScriptedOutcome::Train(TrainOutput {
            score: score(0.6, "train_acc"),
            model: b"trained weights".to_vec(),
        }))
        .push(ScriptedOutcome::Test(score(0.9, "test_acc")));
    let consumer = h.consumer(runner.clone());

    let mut task = h.learn_task();
    let model_end = Uuid::new_v4();
    task.model_end = Some(model_end);
    h.broker.push("learn", &task).unwrap();

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    thread::scope(|scope| {
        let running = scope.spawn(|| consumer.consume_until_killed(&stop_rx));
        assert!(wait_for(|| h.ledger.status(task.id) == Some(TaskStatus::Done)));
        stop_tx.send(()).unwrap();
        running.join().unwrap().unwrap();
    });

    let entry = h.ledger.entry(task.id).unwrap();
    assert_eq!(entry.worker, Some(h.config.worker_id));
    let result = entry.learn_result.unwrap();
    assert_eq!(result.perf, 0.9);
    assert_eq!(result.train_perf["train_acc"], 0.6);
    assert_eq!(result.test_perf["test_acc"], 0.9);

    assert_eq!(
        h.blobs.get_bytes(&ResourceKind::Model.blob_key(model_end)).unwrap(),
        b"trained weights"
    );

    let observed = runner.observed();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0].data_files, vec![task.train_data[0].to_string()]);
    assert!(observed[0].model_files.is_empty());
    assert_eq!(observed[1].data_files, vec![task.test_data[0].to_string()]);
    assert_eq!(observed[1].model_files, vec!["model"]);

    assert!(h.staging_is_empty());
    assert_eq!(consumer.counts().acked, 1);
    for event in [
        TaskEventType::Claimed,
        TaskEventType::Staged,
        TaskEventType::Reported,
        TaskEventType::Teardown,
    ] {
        assert_eq!(h.audit.count(event), 1, "{:?}", event);
    }
    assert_eq!(h.audit.count(TaskEventType::SandboxStart), 2);
}

#[test]
fn test_predict_task_stores_the_prediction() {
    let h = Harness::new();
    let runner = Arc::new(ScriptedRunner::new());
    runner.push(ScriptedOutcome::Predict(b"0.1\n0.9\n".to_vec()));
    let consumer = h.consumer(runner.clone());

    let workflow = h.blob(ResourceKind::Algo, b"#!/bin/sh\n");
    let model = h.blob(ResourceKind::Model, b"weights");
    let data = h.blob(ResourceKind::Data, b"x\n");
    let task = PredictTask::new(Uuid::new_v4(), workflow, model, vec![data]);
    h.ledger.insert(TaskKind::Predict, task.id);
    h.broker.push("predict", &task).unwrap();

    assert_eq!(h.deliver(&consumer, "predict").unwrap(), Settlement::Acked);

    let result = h.ledger.entry(task.id).unwrap().predict_result.unwrap();
    let key = ResourceKind::Prediction.blob_key(result.prediction_storage_uuid);
    assert_eq!(h.blobs.get_bytes(&key).unwrap(), b"0.1\n0.9\n");
    assert_eq!(runner.observed()[0].model_files, vec!["model"]);
    assert!(h.staging_is_empty());
}

#[test]
fn test_execution_failure_is_reported_failed_without_requeue() {
    let h = Harness::new();
    let runner = Arc::new(ScriptedRunner::new());
    runner.push(ScriptedOutcome::Fail(
        SandboxFailureKind::ExecutionFailure,
        "exited with status 1".to_string(),
    ));
    let consumer = h.consumer(runner.clone());

    let task = h.learn_task();
    h.broker.push("learn", &task).unwrap();

    assert_eq!(h.deliver(&consumer, "learn").unwrap(), Settlement::Failed);
    assert_eq!(h.ledger.status(task.id), Some(TaskStatus::Failed));
    assert_eq!(h.broker.stats().requeued, 0);
    assert_eq!(h.broker.pending("learn"), 0);
    assert_eq!(runner.observed().len(), 1);
    assert!(h.staging_is_empty());
}

#[test]
fn test_timeouts_are_requeued_until_the_budget_is_spent() {
    let h = Harness::new();
    let runner = Arc::new(ScriptedRunner::new());
    for _ in 0..2 {
        runner.push(ScriptedOutcome::Fail(
            SandboxFailureKind::Timeout,
            "deadline exceeded".to_string(),
        ));
    }
    let consumer = h.consumer(runner.clone());

    let task = h.learn_task();
    h.broker.push("learn", &task).unwrap();

    assert_eq!(h.deliver(&consumer, "learn").unwrap(), Settlement::Requeued);
    assert_eq!(h.ledger.status(task.id), Some(TaskStatus::Pending));

    // redelivery reaches the same worker, whose claim is idempotent
    assert_eq!(h.deliver(&consumer, "learn").unwrap(), Settlement::Failed);
    assert_eq!(h.ledger.status(task.id), Some(TaskStatus::Failed));
    assert_eq!(h.broker.stats().exhausted, 1);
    assert_eq!(h.audit.count(TaskEventType::Timeout), 2);
}

#[test]
fn test_task_claimed_elsewhere_is_discarded() {
    let h = Harness::new();
    let runner = Arc::new(ScriptedRunner::new());
    let consumer = h.consumer(runner.clone());

    let task = h.learn_task();
    TaskLedgerClient::new(h.ledger.clone())
        .claim(TaskKind::Learn, task.id, Uuid::new_v4())
        .unwrap();
    h.broker.push("learn", &task).unwrap();

    assert_eq!(h.deliver(&consumer, "learn").unwrap(), Settlement::Discarded);
    assert!(runner.observed().is_empty());
    assert_eq!(h.ledger.status(task.id), Some(TaskStatus::Pending));
    assert_eq!(h.audit.count(TaskEventType::ClaimLost), 1);
}

#[test]
fn test_invalid_task_is_discarded_before_any_ledger_call() {
    let h = Harness::new();
    let consumer = h.consumer(Arc::new(ScriptedRunner::new()));

    let mut task = h.learn_task();
    task.rank = 2;
    h.broker.push("learn", &task).unwrap();
    h.broker.publish("learn", b"{not json".to_vec()).unwrap();

    assert_eq!(h.deliver(&consumer, "learn").unwrap(), Settlement::Discarded);
    assert_eq!(h.deliver(&consumer, "learn").unwrap(), Settlement::Discarded);
    assert_eq!(h.ledger.calls(), 0);
}

/// Fails every run after cutting the ledger off
struct LedgerOutageRunner {
    ledger: Arc<MemoryLedger>,
}

impl LedgerOutageRunner {
    fn fail(&self) -> UpletError {
        self.ledger.set_reachable(false);
        UpletError::sandbox(SandboxFailureKind::ExecutionFailure, "exited with status 2")
    }
}

impl SandboxRunner for LedgerOutageRunner {
    fn train(&self, _inputs: &RunInputs, _timeout: Duration) -> Result<TrainOutput> {
        Err(self.fail())
    }

    fn test(&self, _inputs: &RunInputs, _timeout: Duration) -> Result<Score> {
        Err(self.fail())
    }

    fn predict(&self, _inputs: &RunInputs, _timeout: Duration) -> Result<Vec<u8>> {
        Err(self.fail())
    }
}

#[test]
fn test_unreachable_ledger_during_failure_report_surfaces_transient() {
    let h = Harness::new();
    let consumer = h.consumer(Arc::new(LedgerOutageRunner {
        ledger: h.ledger.clone(),
    }));

    let task = h.learn_task();
    h.broker.push("learn", &task).unwrap();

    let err = h.deliver(&consumer, "learn").unwrap_err();
    assert!(matches!(err, UpletError::Transient(_)));
    // one claim, then the bounded failure reports
    assert_eq!(h.ledger.calls(), 1 + h.config.report_retries as usize);
    assert_eq!(h.ledger.status(task.id), Some(TaskStatus::Pending));
    assert_eq!(h.audit.count(TaskEventType::ReportFailed), 1);
    assert!(h.staging_is_empty());
}
