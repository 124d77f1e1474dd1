/// Storage resources: immutable once created, never deleted by the worker
use crate::config::types::{Result, UpletError};
use crate::model::task::Checkable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Resource kinds; the string form doubles as the storage route and blob key prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Algo,
    Data,
    Model,
    Prediction,
    Problem,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Algo => "algo",
            ResourceKind::Data => "data",
            ResourceKind::Model => "model",
            ResourceKind::Prediction => "prediction",
            ResourceKind::Problem => "problem",
        }
    }

    /// Blob key of a resource of this kind: `<kind>/<uuid>`
    pub fn blob_key(&self, id: Uuid) -> String {
        format!("{}/{}", self.as_str(), id)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = UpletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "algo" => Ok(ResourceKind::Algo),
            "data" => Ok(ResourceKind::Data),
            "model" => Ok(ResourceKind::Model),
            "prediction" => Ok(ResourceKind::Prediction),
            "problem" => Ok(ResourceKind::Problem),
            other => Err(UpletError::Validation(format!("unknown resource kind: {}", other))),
        }
    }
}

/// Common view over the resource records
pub trait Resource: Checkable {
    fn uuid(&self) -> Uuid;
    fn kind(&self) -> ResourceKind;
    /// Type-specific metadata sent alongside the blob on upload
    fn metadata_fields(&self) -> Vec<(&'static str, String)>;
}

fn unset(field: &str) -> UpletError {
    UpletError::Validation(format!("'{}' unset", field))
}

fn check_common(id: Uuid, owner: Uuid, timestamp_upload: i64) -> Result<()> {
    if id.is_nil() {
        return Err(unset("uuid"));
    }
    if owner.is_nil() {
        return Err(unset("owner"));
    }
    if timestamp_upload <= 0 {
        return Err(unset("timestamp_upload"));
    }
    Ok(())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Algo {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub timestamp_upload: i64,
    pub owner: Uuid,
    pub name: String,
}

impl Algo {
    pub fn new(owner: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_upload: now(),
            owner,
            name: name.into(),
        }
    }
}

impl Checkable for Algo {
    fn check(&self) -> Result<()> {
        check_common(self.id, self.owner, self.timestamp_upload)?;
        if self.name.is_empty() {
            return Err(unset("name"));
        }
        Ok(())
    }
}

impl Resource for Algo {
    fn uuid(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Algo
    }

    fn metadata_fields(&self) -> Vec<(&'static str, String)> {
        vec![("uuid", self.id.to_string()), ("name", self.name.clone())]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Data {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub timestamp_upload: i64,
    pub owner: Uuid,
}

impl Data {
    pub fn new(owner: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_upload: now(),
            owner,
        }
    }
}

impl Checkable for Data {
    fn check(&self) -> Result<()> {
        check_common(self.id, self.owner, self.timestamp_upload)
    }
}

impl Resource for Data {
    fn uuid(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Data
    }

    fn metadata_fields(&self) -> Vec<(&'static str, String)> {
        vec![("uuid", self.id.to_string())]
    }
}

/// A trained model snapshot, tied to the algorithm that produced it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub timestamp_upload: i64,
    pub owner: Uuid,
    pub algo: Uuid,
}

impl Model {
    pub fn new(owner: Uuid, algo: &Algo) -> Self {
        Self::for_algo(Uuid::new_v4(), owner, algo.id)
    }

    /// Model record with a caller-chosen identity
    pub fn for_algo(id: Uuid, owner: Uuid, algo: Uuid) -> Self {
        Self {
            id,
            timestamp_upload: now(),
            owner,
            algo,
        }
    }
}

impl Checkable for Model {
    fn check(&self) -> Result<()> {
        check_common(self.id, self.owner, self.timestamp_upload)?;
        if self.algo.is_nil() {
            return Err(unset("algo"));
        }
        Ok(())
    }
}

impl Resource for Model {
    fn uuid(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Model
    }

    fn metadata_fields(&self) -> Vec<(&'static str, String)> {
        vec![("uuid", self.id.to_string()), ("algo", self.algo.to_string())]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prediction {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub timestamp_upload: i64,
    pub owner: Uuid,
}

impl Prediction {
    pub fn new(owner: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_upload: now(),
            owner,
        }
    }
}

impl Checkable for Prediction {
    fn check(&self) -> Result<()> {
        check_common(self.id, self.owner, self.timestamp_upload)
    }
}

impl Resource for Prediction {
    fn uuid(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Prediction
    }

    fn metadata_fields(&self) -> Vec<(&'static str, String)> {
        vec![("uuid", self.id.to_string())]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Problem {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub timestamp_upload: i64,
    pub owner: Uuid,
    pub name: String,
    pub description: String,
}

impl Problem {
    pub fn new(owner: Uuid, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_upload: now(),
            owner,
            name: name.into(),
            description: description.into(),
        }
    }
}

impl Checkable for Problem {
    fn check(&self) -> Result<()> {
        check_common(self.id, self.owner, self.timestamp_upload)?;
        if self.name.is_empty() {
            return Err(unset("name"));
        }
        if self.description.is_empty() {
            return Err(unset("description"));
        }
        Ok(())
    }
}

impl Resource for Problem {
    fn uuid(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Problem
    }

    fn metadata_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("uuid", self.id.to_string()),
            ("name", self.name.clone()),
            ("description", self.description.clone()),
        ]
    }
}

/// Typed per-kind fields for creating a resource generically
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceFields {
    Algo { name: String },
    Data,
    Model { algo: Uuid },
    Prediction,
    Problem { name: String, description: String },
}

/// Any one of the resource records
#[derive(Clone, Debug, PartialEq)]
pub enum AnyResource {
    Algo(Algo),
    Data(Data),
    Model(Model),
    Prediction(Prediction),
    Problem(Problem),
}

impl ResourceFields {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceFields::Algo { .. } => ResourceKind::Algo,
            ResourceFields::Data => ResourceKind::Data,
            ResourceFields::Model { .. } => ResourceKind::Model,
            ResourceFields::Prediction => ResourceKind::Prediction,
            ResourceFields::Problem { .. } => ResourceKind::Problem,
        }
    }

    /// Build and validate a record; `id` defaults to a fresh UUID
    pub fn build(self, id: Option<Uuid>, owner: Uuid) -> Result<AnyResource> {
        let id = id.filter(|id| !id.is_nil()).unwrap_or_else(Uuid::new_v4);
        let timestamp_upload = now();
        let resource = match self {
            ResourceFields::Algo { name } => AnyResource::Algo(Algo {
                id,
                timestamp_upload,
                owner,
                name,
            }),
            ResourceFields::Data => AnyResource::Data(Data {
                id,
                timestamp_upload,
                owner,
            }),
            ResourceFields::Model { algo } => AnyResource::Model(Model {
                id,
                timestamp_upload,
                owner,
                algo,
            }),
            ResourceFields::Prediction => AnyResource::Prediction(Prediction {
                id,
                timestamp_upload,
                owner,
            }),
            ResourceFields::Problem { name, description } => AnyResource::Problem(Problem {
                id,
                timestamp_upload,
                owner,
                name,
                description,
            }),
        };
        resource.check()?;
        Ok(resource)
    }
}

impl AnyResource {
    fn inner(&self) -> &dyn Resource {
        match self {
            AnyResource::Algo(r) => r,
            AnyResource::Data(r) => r,
            AnyResource::Model(r) => r,
            AnyResource::Prediction(r) => r,
            AnyResource::Problem(r) => r,
        }
    }
}

impl Checkable for AnyResource {
    fn check(&self) -> Result<()> {
        self.inner().check()
    }
}

impl Resource for AnyResource {
    fn uuid(&self) -> Uuid {
        self.inner().uuid()
    }

    fn kind(&self) -> ResourceKind {
        self.inner().kind()
    }

    fn metadata_fields(&self) -> Vec<(&'static str, String)> {
        self.inner().metadata_fields()
    }
}
