//! Sandboxed train/test/predict runs
//!
//! A [`SandboxRunner`] executes one operation of an algorithm package against
//! already-materialized input directories. [`IsolatedRunner`] drives the
//! namespace sandbox in [`crate::core`]; [`ScriptedRunner`] replays queued
//! outcomes for tests.

pub mod isolated;
pub mod scripted;
pub mod verdict;

pub use isolated::IsolatedRunner;
pub use scripted::{ObservedRun, ScriptedOutcome, ScriptedRunner};
pub use verdict::{Verdict, VerdictClassifier};

use crate::config::types::{Result, UpletError};
use crate::model::PerfMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Operation requested from the algorithm entrypoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOp {
    Train,
    Test,
    Predict,
}

impl RunOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOp::Train => "train",
            RunOp::Test => "test",
            RunOp::Predict => "predict",
        }
    }
}

impl fmt::Display for RunOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host directories exposed to one run, plus its cancellation token
#[derive(Clone, Debug)]
pub struct RunInputs {
    pub algo_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Empty `model/` inside the sandbox when unset
    pub model_dir: Option<PathBuf>,
    pub cancel: Arc<AtomicBool>,
}

impl RunInputs {
    pub fn new(algo_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            algo_dir: algo_dir.into(),
            data_dir: data_dir.into(),
            model_dir: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_model(mut self, model_dir: impl Into<PathBuf>) -> Self {
        self.model_dir = Some(model_dir.into());
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Contents of `output/perf.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub perf: f64,
    #[serde(default)]
    pub metrics: PerfMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainOutput {
    pub score: Score,
    pub model: Vec<u8>,
}

/// Isolated execution of algorithm code
pub trait SandboxRunner: Send + Sync {
    /// Writes `output/model` and `output/perf.json`
    fn train(&self, inputs: &RunInputs, timeout: Duration) -> Result<TrainOutput>;

    /// Writes `output/perf.json`
    fn test(&self, inputs: &RunInputs, timeout: Duration) -> Result<Score>;

    /// Writes `output/prediction`
    fn predict(&self, inputs: &RunInputs, timeout: Duration) -> Result<Vec<u8>>;
}

/// Lifecycle of one sandbox run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Created,
    Started,
    Running,
    StartFailed,
    Completed,
    TimedOut,
    Crashed,
    TornDown,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Created, Started)
                | (Created, TornDown)
                | (Started, Running)
                | (Started, StartFailed)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, Crashed)
                | (StartFailed, TornDown)
                | (Completed, TornDown)
                | (TimedOut, TornDown)
                | (Crashed, TornDown)
        )
    }

    /// Phases after which only teardown remains
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RunPhase::StartFailed | RunPhase::Completed | RunPhase::TimedOut | RunPhase::Crashed
        )
    }
}

/// Phase history of one run
#[derive(Clone, Debug, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub op: RunOp,
    pub history: Vec<RunPhase>,
    pub workspace: Option<PathBuf>,
    pub proxy_pid: Option<i32>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, op: RunOp) -> Self {
        Self {
            run_id: run_id.into(),
            op,
            history: vec![RunPhase::Created],
            workspace: None,
            proxy_pid: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.history.last().copied().unwrap_or(RunPhase::Created)
    }

    pub fn advance(&mut self, next: RunPhase) -> Result<()> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(UpletError::Process(format!(
                "run {}: illegal transition {:?} -> {:?}",
                self.run_id, current, next
            )));
        }
        self.history.push(next);
        Ok(())
    }

    pub fn torn_down(&self) -> bool {
        self.phase() == RunPhase::TornDown
    }

    /// The phase the run ended in before teardown
    pub fn outcome(&self) -> Option<RunPhase> {
        self.history.iter().rev().copied().find(|p| p.is_finished())
    }
}
