/// The ledger's query representation of a learn task
use crate::config::types::{Result, UpletError};
use crate::model::task::{LearnTask, PerfMap};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Learn task as returned by ledger queries; object references are `<object>_<uuid>` keys
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerLearnRecord {
    pub key: String,
    pub problem_storage_address: String,
    pub algo: String,
    pub model_start: String,
    pub model_end: String,
    pub train_data: Vec<String>,
    pub test_data: Vec<String>,
    pub worker: String,
    pub status: String,
    pub rank: i64,
    pub perf: f64,
    pub train_perf: PerfMap,
    pub test_perf: PerfMap,
}

/// Extract the UUID out of a `<object>_<uuid>` ledger key
pub fn uuid_from_key(key: &str) -> Result<Uuid> {
    let wrong_format = || {
        UpletError::Validation(format!(
            "Wrong format for key: should be <object>_<uuid>, have: \"{}\"",
            key
        ))
    };

    let parts: Vec<&str> = key.split('_').collect();
    if parts.len() != 2 {
        return Err(wrong_format());
    }
    Uuid::parse_str(parts[1])
        .map_err(|e| UpletError::Validation(format!("Invalid UUID in key \"{}\": {}", key, e)))
}

fn optional_uuid(field: &str, raw: &str) -> Result<Option<Uuid>> {
    if raw.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(raw)
        .map(Some)
        .map_err(|e| UpletError::Validation(format!("Failed to parse {} UUID: {}", field, e)))
}

fn keys_to_uuids(keys: &[String]) -> Result<Vec<Uuid>> {
    keys.iter().map(|key| uuid_from_key(key)).collect()
}

impl LedgerLearnRecord {
    /// Convert into a `LearnTask`; the request timestamp is set to now
    pub fn into_task(self) -> Result<LearnTask> {
        let problem = Uuid::parse_str(&self.problem_storage_address).map_err(|e| {
            UpletError::Validation(format!("Failed to parse problem_storage_address UUID: {}", e))
        })?;
        let rank = u32::try_from(self.rank)
            .map_err(|_| UpletError::Validation(format!("rank {} is negative", self.rank)))?;

        Ok(LearnTask {
            id: uuid_from_key(&self.key)?,
            problem,
            algo: uuid_from_key(&self.algo)?,
            train_data: keys_to_uuids(&self.train_data)?,
            test_data: keys_to_uuids(&self.test_data)?,
            model_start: optional_uuid("model_start", &self.model_start)?,
            model_end: optional_uuid("model_end", &self.model_end)?,
            rank,
            worker: optional_uuid("worker", &self.worker)?,
            status: self.status,
            requested_at: chrono::Utc::now().timestamp(),
            completed_at: 0,
            perf: self.perf,
            train_perf: self.train_perf,
            test_perf: self.test_perf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::Checkable;

    #[test]
    fn keys_must_have_exactly_two_parts() {
        let id = Uuid::new_v4();
        assert_eq!(uuid_from_key(&format!("algo_{}", id)).unwrap(), id);

        let err = uuid_from_key("learnuplet").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Wrong format for key: should be <object>_<uuid>, have: \"learnuplet\""
        );
        assert!(uuid_from_key(&format!("data_x_{}", id)).is_err());
    }

    #[test]
    fn record_converts_into_checked_task() {
        let (key, algo, train, test, problem) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        let record = LedgerLearnRecord {
            key: format!("learnuplet_{}", key),
            problem_storage_address: problem.to_string(),
            algo: format!("algo_{}", algo),
            train_data: vec![format!("data_{}", train)],
            test_data: vec![format!("data_{}", test)],
            status: "todo".to_string(),
            ..LedgerLearnRecord::default()
        };

        let task = record.into_task().unwrap();
        assert_eq!(task.id, key);
        assert_eq!(task.problem, problem);
        assert_eq!(task.train_data, vec![train]);
        assert_eq!(task.model_start(), None);
        assert!(task.requested_at > 0);
        assert!(task.check().is_ok());
    }

    #[test]
    fn negative_rank_is_rejected() {
        let record = LedgerLearnRecord {
            key: format!("learnuplet_{}", Uuid::new_v4()),
            problem_storage_address: Uuid::new_v4().to_string(),
            algo: format!("algo_{}", Uuid::new_v4()),
            rank: -1,
            ..LedgerLearnRecord::default()
        };
        assert!(matches!(record.into_task(), Err(UpletError::Validation(_))));
    }
}
