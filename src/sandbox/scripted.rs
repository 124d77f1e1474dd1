use crate::config::types::{Result, SandboxFailureKind, UpletError};
use crate::sandbox::{RunInputs, RunOp, RunPhase, RunRecord, SandboxRunner, Score, TrainOutput};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One queued run result
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    Train(TrainOutput),
    Test(Score),
    Predict(Vec<u8>),
    Fail(SandboxFailureKind, String),
    /// Block until canceled or past the timeout, then report `Timeout`
    Hang,
}

/// What a run was given, captured when it started
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedRun {
    pub op: RunOp,
    pub algo_files: Vec<String>,
    pub data_files: Vec<String>,
    pub model_files: Vec<String>,
}

/// Deterministic runner replaying queued outcomes in call order
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<ScriptedOutcome>>,
    observed: Mutex<Vec<ObservedRun>>,
    records: Mutex<Vec<RunRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Relative paths of every regular file under `dir`, sorted
fn list_files(dir: &Path) -> Vec<String> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out);
            } else if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }

    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ScriptedOutcome) -> &Self {
        lock(&self.queue).push_back(outcome);
        self
    }

    pub fn observed(&self) -> Vec<ObservedRun> {
        lock(&self.observed).clone()
    }

    pub fn records(&self) -> Vec<RunRecord> {
        lock(&self.records).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.queue).len()
    }

    fn run(&self, op: RunOp, inputs: &RunInputs, timeout: Duration) -> Result<ScriptedOutcome> {
        let run_id = format!("scripted-{}", lock(&self.records).len());
        let mut record = RunRecord::new(run_id, op);
        record.advance(RunPhase::Started)?;

        lock(&self.observed).push(ObservedRun {
            op,
            algo_files: list_files(&inputs.algo_dir),
            data_files: list_files(&inputs.data_dir),
            model_files: inputs.model_dir.as_deref().map(list_files).unwrap_or_default(),
        });

        let next = lock(&self.queue).pop_front();
        let result = match next {
            None => {
                record.advance(RunPhase::StartFailed)?;
                Err(UpletError::sandbox(
                    SandboxFailureKind::SetupFailure,
                    format!("no scripted outcome left for {}", op),
                ))
            }
            Some(ScriptedOutcome::Hang) => {
                record.advance(RunPhase::Running)?;
                let started = Instant::now();
                while !inputs.is_canceled() && started.elapsed() < timeout {
                    std::thread::sleep(Duration::from_millis(5));
                }
                record.advance(RunPhase::TimedOut)?;
                Err(UpletError::sandbox(
                    SandboxFailureKind::Timeout,
                    if inputs.is_canceled() { "run canceled" } else { "deadline exceeded" },
                ))
            }
            Some(ScriptedOutcome::Fail(kind, message)) => {
                record.advance(RunPhase::Running)?;
                let phase = match kind {
                    SandboxFailureKind::Timeout => RunPhase::TimedOut,
                    _ => RunPhase::Crashed,
                };
                record.advance(phase)?;
                Err(UpletError::sandbox(kind, message))
            }
            Some(outcome) => {
                record.advance(RunPhase::Running)?;
                record.advance(RunPhase::Completed)?;
                Ok(outcome)
            }
        };

        record.advance(RunPhase::TornDown)?;
        lock(&self.records).push(record);
        result
    }
}

fn mismatch(op: RunOp, got: &ScriptedOutcome) -> UpletError {
    UpletError::sandbox(
        SandboxFailureKind::ExecutionFailure,
        format!("scripted outcome {:?} does not match a {} run", got, op),
    )
}

impl SandboxRunner for ScriptedRunner {
    fn train(&self, inputs: &RunInputs, timeout: Duration) -> Result<TrainOutput> {
        match self.run(RunOp::Train, inputs, timeout)? {
            ScriptedOutcome::Train(output) => Ok(output),
            other => Err(mismatch(RunOp::Train, &other)),
        }
    }

    fn test(&self, inputs: &RunInputs, timeout: Duration) -> Result<Score> {
        match self.run(RunOp::Test, inputs, timeout)? {
            ScriptedOutcome::Test(score) => Ok(score),
            other => Err(mismatch(RunOp::Test, &other)),
        }
    }

    fn predict(&self, inputs: &RunInputs, timeout: Duration) -> Result<Vec<u8>> {
        match self.run(RunOp::Predict, inputs, timeout)? {
            ScriptedOutcome::Predict(bytes) => Ok(bytes),
            other => Err(mismatch(RunOp::Predict, &other)),
        }
    }
}
