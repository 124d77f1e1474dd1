/// Learn and predict uplets with their field invariants
use crate::config::types::{Result, TaskKind, TaskStatus, UpletError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Named per-metric performance values
pub type PerfMap = BTreeMap<String, f64>;

/// Records that can be validated after decoding
pub trait Checkable {
    fn check(&self) -> Result<()>;
}

fn invalid(message: String) -> UpletError {
    UpletError::Validation(message)
}

fn check_status(raw: &str) -> Result<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        let choices: Vec<&str> = TaskStatus::ALL.iter().map(TaskStatus::as_str).collect();
        invalid(format!(
            "status field is not valid (provided: {}, possible choices: {})",
            raw,
            choices.join(", ")
        ))
    })
}

fn non_nil(id: Option<Uuid>) -> Option<Uuid> {
    id.filter(|id| !id.is_nil())
}

/// A learning task: train an algorithm on `train_data`, evaluate on `test_data`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnTask {
    #[serde(rename = "key")]
    pub id: Uuid,
    pub problem: Uuid,
    pub algo: Uuid,
    pub train_data: Vec<Uuid>,
    pub test_data: Vec<Uuid>,
    pub model_start: Option<Uuid>,
    pub model_end: Option<Uuid>,
    pub rank: u32,
    pub worker: Option<Uuid>,
    /// Kept as received; `check()` validates it against the closed set
    pub status: String,
    #[serde(rename = "timestamp_request")]
    pub requested_at: i64,
    #[serde(rename = "timestamp_done")]
    pub completed_at: i64,
    pub perf: f64,
    pub train_perf: PerfMap,
    pub test_perf: PerfMap,
}

impl LearnTask {
    /// New rank-0 task in `todo`
    pub fn new(problem: Uuid, algo: Uuid, train_data: Vec<Uuid>, test_data: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem,
            algo,
            train_data,
            test_data,
            status: TaskStatus::Todo.to_string(),
            requested_at: chrono::Utc::now().timestamp(),
            ..Self::default()
        }
    }

    /// Continue training from an existing model
    pub fn continuing(mut self, model_start: Uuid, rank: u32) -> Self {
        self.model_start = Some(model_start);
        self.rank = rank;
        self
    }

    pub fn kind(&self) -> TaskKind {
        TaskKind::Learn
    }

    pub fn model_start(&self) -> Option<Uuid> {
        non_nil(self.model_start)
    }

    pub fn model_end(&self) -> Option<Uuid> {
        non_nil(self.model_end)
    }

    pub fn status(&self) -> Result<TaskStatus> {
        check_status(&self.status)
    }
}

impl Checkable for LearnTask {
    fn check(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(invalid("id field is required".to_string()));
        }
        if self.problem.is_nil() {
            return Err(invalid("problem field is required".to_string()));
        }
        if self.algo.is_nil() {
            return Err(invalid("algo field is required".to_string()));
        }

        if self.train_data.is_empty() {
            return Err(invalid("train_data field is empty or unset".to_string()));
        }
        if let Some(pos) = self.train_data.iter().position(Uuid::is_nil) {
            return Err(invalid(format!("Nil UUID in train_data field at pos {}", pos)));
        }

        if self.test_data.is_empty() {
            return Err(invalid("test_data field is empty or unset".to_string()));
        }
        if let Some(pos) = self.test_data.iter().position(Uuid::is_nil) {
            return Err(invalid(format!("Nil UUID in test_data field at pos {}", pos)));
        }

        check_status(&self.status)?;

        if self.rank > 0 && self.model_start().is_none() {
            return Err(invalid(format!("rank {} and empty model_start", self.rank)));
        }

        Ok(())
    }
}

/// A prediction task: run a trained model over `data`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictTask {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub problem: Uuid,
    /// Algorithm package executing the prediction
    pub workflow: Uuid,
    pub model: Uuid,
    pub data: Vec<Uuid>,
    pub worker: Option<Uuid>,
    pub status: String,
    #[serde(rename = "timestamp_request")]
    pub requested_at: i64,
    #[serde(rename = "timestamp_done")]
    pub completed_at: i64,
    #[serde(rename = "prediction_storage_uuid")]
    pub prediction: Option<Uuid>,
}

impl PredictTask {
    pub fn new(problem: Uuid, workflow: Uuid, model: Uuid, data: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem,
            workflow,
            model,
            data,
            status: TaskStatus::Todo.to_string(),
            requested_at: chrono::Utc::now().timestamp(),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> TaskKind {
        TaskKind::Predict
    }

    pub fn status(&self) -> Result<TaskStatus> {
        check_status(&self.status)
    }
}

impl Checkable for PredictTask {
    fn check(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(invalid("id field is unset".to_string()));
        }
        if self.problem.is_nil() {
            return Err(invalid("problem field is unset".to_string()));
        }
        if self.workflow.is_nil() {
            return Err(invalid("workflow field is required".to_string()));
        }
        if self.model.is_nil() {
            return Err(invalid("model field is required".to_string()));
        }
        if self.data.is_empty() {
            return Err(invalid("data field is empty or unset".to_string()));
        }
        if let Some(pos) = self.data.iter().position(Uuid::is_nil) {
            return Err(invalid(format!("Nil UUID in data field at pos {}", pos)));
        }

        check_status(&self.status)?;
        Ok(())
    }
}
