use crate::config::config::EndpointConfig;
use crate::config::types::{Result, TaskKind, TaskStatus, UpletError};
use crate::endpoint::{decode_json, unexpected_status, HttpEndpoint};
use crate::ledger::Ledger;
use crate::model::{
    Algo, Checkable, Data, LearnResult, LearnTask, LedgerLearnRecord, PredictResult, Prediction,
    Problem, Resource,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Collections the ledger can list
const LISTABLE: [&str; 6] = ["algo", "data", "learnuplet", "preduplet", "prediction", "problem"];

/// Result route per uplet type
fn done_route(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Learn => "learndone",
        TaskKind::Predict => "preddone",
    }
}

/// HTTP client for the orchestrator ledger
#[derive(Debug, Clone)]
pub struct OrchestratorApi {
    endpoint: HttpEndpoint,
}

impl OrchestratorApi {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config)?,
        })
    }

    /// Register a storage resource with the ledger under its kind's route
    fn register<R: Resource + Serialize>(&self, resource: &R) -> Result<()> {
        resource.check()?;
        let request = self.endpoint.post(resource.kind().as_str()).json(resource);
        let response = self.endpoint.send(request)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            _ => Err(unexpected_status(response, "200 OK or 201 Created")),
        }
    }

    pub fn post_algo(&self, algo: &Algo) -> Result<()> {
        self.register(algo)
    }

    pub fn post_data(&self, data: &Data) -> Result<()> {
        self.register(data)
    }

    pub fn post_prediction(&self, prediction: &Prediction) -> Result<()> {
        self.register(prediction)
    }

    pub fn post_problem(&self, problem: &Problem) -> Result<()> {
        self.register(problem)
    }

    /// Fetch every entry of a ledger collection
    pub fn get_list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        if !LISTABLE.contains(&collection) {
            return Err(UpletError::Validation(format!(
                "unknown ledger collection: {} (possible choices: {})",
                collection,
                LISTABLE.join(", ")
            )));
        }
        let response = self.endpoint.send(self.endpoint.get(collection))?;
        match response.status() {
            StatusCode::OK => decode_json(response),
            _ => Err(unexpected_status(response, "200 OK")),
        }
    }

    /// Learn uplets known to the ledger, converted from their query representation
    pub fn learn_uplets(&self) -> Result<Vec<LearnTask>> {
        self.get_list::<LedgerLearnRecord>("learnuplet")?
            .into_iter()
            .map(LedgerLearnRecord::into_task)
            .collect()
    }

    fn post_result<T: Serialize>(&self, kind: TaskKind, task_id: Uuid, body: &T) -> Result<()> {
        let request = self
            .endpoint
            .post(&format!("{}/{}", done_route(kind), task_id))
            .json(body);
        let response = self.endpoint.send(request)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT => Err(UpletError::AlreadyReported { task_id }),
            _ => Err(unexpected_status(response, "200 OK or 201 Created")),
        }
    }
}

impl Ledger for OrchestratorApi {
    fn update_status(
        &self,
        kind: TaskKind,
        status: TaskStatus,
        task_id: Uuid,
        worker_id: Uuid,
    ) -> Result<()> {
        let (request, conflict) = match status {
            TaskStatus::Pending => (
                self.endpoint
                    .post(&format!("worker/{}/{}", kind, task_id))
                    .json(&serde_json::json!({ "worker": worker_id })),
                UpletError::AlreadyClaimed { task_id },
            ),
            TaskStatus::Failed => (
                self.endpoint
                    .post(&format!("{}/{}", done_route(kind), task_id))
                    .json(&serde_json::json!({ "status": TaskStatus::Failed })),
                UpletError::AlreadyReported { task_id },
            ),
            other => return Err(UpletError::InvalidStatus(other.to_string())),
        };

        let response = self.endpoint.send(request)?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(conflict),
            _ => Err(unexpected_status(response, "200 OK")),
        }
    }

    fn post_learn_result(&self, task_id: Uuid, result: &LearnResult) -> Result<()> {
        self.post_result(TaskKind::Learn, task_id, result)
    }

    fn post_predict_result(&self, task_id: Uuid, result: &PredictResult) -> Result<()> {
        self.post_result(TaskKind::Predict, task_id, result)
    }
}
