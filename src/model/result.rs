/// Result bodies posted to the ledger once a task settles
use crate::config::types::TaskStatus;
use crate::model::task::PerfMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnResult {
    pub status: TaskStatus,
    /// Headline score, taken from the test run
    pub perf: f64,
    pub train_perf: PerfMap,
    pub test_perf: PerfMap,
}

impl LearnResult {
    pub fn done(perf: f64, train_perf: PerfMap, test_perf: PerfMap) -> Self {
        Self {
            status: TaskStatus::Done,
            perf,
            train_perf,
            test_perf,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictResult {
    pub status: TaskStatus,
    pub prediction_storage_uuid: Uuid,
}

impl PredictResult {
    pub fn done(prediction: Uuid) -> Self {
        Self {
            status: TaskStatus::Done,
            prediction_storage_uuid: prediction,
        }
    }
}
