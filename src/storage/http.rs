//! Client for the HTTP resource-storage service
//!
//! Resources are immutable once uploaded, so the blob-store view of the
//! service supports reads and writes but neither deletes nor renames.

use crate::config::config::EndpointConfig;
use crate::config::types::{Result, UpletError};
use crate::endpoint::{decode_json, unexpected_status, HttpEndpoint};
use crate::model::{Algo, Checkable, Data, Model, Prediction, Problem, Resource, ResourceKind};
use crate::storage::{read_exact_size, BlobStore, SizedReader};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Body;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::io::Read;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StorageApi {
    endpoint: HttpEndpoint,
}

/// Split a `<kind>/<uuid>` blob key
fn parse_key(key: &str) -> Result<(ResourceKind, Uuid)> {
    let (kind, id) = key.split_once('/').ok_or_else(|| {
        UpletError::Validation(format!("storage key should be <kind>/<uuid>, have: {}", key))
    })?;
    let id = Uuid::parse_str(id)
        .map_err(|e| UpletError::Validation(format!("invalid UUID in storage key {}: {}", key, e)))?;
    Ok((kind.parse()?, id))
}

impl StorageApi {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config)?,
        })
    }

    fn get_metadata<T: DeserializeOwned>(&self, kind: ResourceKind, id: Uuid) -> Result<T> {
        let response = self
            .endpoint
            .send(self.endpoint.get(&format!("{}/{}", kind, id)))?;
        match response.status() {
            StatusCode::OK => decode_json(response),
            StatusCode::NOT_FOUND => Err(UpletError::NotFound(kind.blob_key(id))),
            _ => Err(unexpected_status(response, "200 OK")),
        }
    }

    pub fn get_algo(&self, id: Uuid) -> Result<Algo> {
        self.get_metadata(ResourceKind::Algo, id)
    }

    pub fn get_data(&self, id: Uuid) -> Result<Data> {
        self.get_metadata(ResourceKind::Data, id)
    }

    pub fn get_model(&self, id: Uuid) -> Result<Model> {
        self.get_metadata(ResourceKind::Model, id)
    }

    pub fn get_problem(&self, id: Uuid) -> Result<Problem> {
        self.get_metadata(ResourceKind::Problem, id)
    }

    /// Upload a model blob; the record must be valid and the algorithm it
    /// references must already exist
    pub fn post_model<R>(&self, model: &Model, reader: R, size: u64) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        model.check()?;
        self.get_algo(model.algo)?;

        let request = self
            .endpoint
            .post(&format!("model?uuid={}&algo={}", model.id, model.algo))
            .body(Body::sized(SizedReader::new(reader, size), size));
        let response = self.endpoint.send(request)?;
        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status(response, "201 Created"));
        }
        Ok(())
    }

    /// Multipart upload: metadata fields, `size`, then the streamed `blob` file part
    fn post_resource<R>(&self, resource: &dyn Resource, reader: R, size: u64) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        resource.check()?;

        let mut form = Form::new();
        for (name, value) in resource.metadata_fields() {
            form = form.text(name, value);
        }
        form = form.text("size", size.to_string()).part(
            "blob",
            Part::reader_with_length(SizedReader::new(reader, size), size)
                .file_name(resource.uuid().to_string()),
        );

        let request = self
            .endpoint
            .post(resource.kind().as_str())
            .multipart(form);
        let response = self.endpoint.send(request)?;
        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status(response, "201 Created"));
        }
        log::info!("Uploaded {} {}", resource.kind(), resource.uuid());
        Ok(())
    }

    pub fn post_algo<R: Read + Send + 'static>(&self, algo: &Algo, reader: R, size: u64) -> Result<()> {
        self.post_resource(algo, reader, size)
    }

    pub fn post_data<R: Read + Send + 'static>(&self, data: &Data, reader: R, size: u64) -> Result<()> {
        self.post_resource(data, reader, size)
    }

    pub fn post_problem<R: Read + Send + 'static>(
        &self,
        problem: &Problem,
        reader: R,
        size: u64,
    ) -> Result<()> {
        self.post_resource(problem, reader, size)
    }

    pub fn post_prediction<R: Read + Send + 'static>(
        &self,
        prediction: &Prediction,
        reader: R,
        size: u64,
    ) -> Result<()> {
        self.post_resource(prediction, reader, size)
    }
}

// The trait lends its reader, and a blocking request body must own one, so
// blob-view writes are buffered; the typed uploads above stream.
impl BlobStore for StorageApi {
    fn put(&self, key: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        let (kind, id) = parse_key(key)?;
        let bytes = read_exact_size(reader, size)?;

        let request = self
            .endpoint
            .post(&format!("{}?uuid={}", kind, id))
            .body(bytes);
        let response = self.endpoint.send(request)?;
        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status(response, "201 Created"));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let (kind, id) = parse_key(key)?;
        let response = self
            .endpoint
            .send(self.endpoint.get(&format!("{}/{}/blob", kind, id)))?;
        match response.status() {
            StatusCode::OK => Ok(Box::new(response)),
            StatusCode::NOT_FOUND => Err(UpletError::NotFound(key.to_string())),
            _ => Err(unexpected_status(response, "200 OK")),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        Err(UpletError::Unsupported(format!(
            "storage resources are immutable, cannot delete {}",
            key
        )))
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        Err(UpletError::Unsupported(format!(
            "storage resources are immutable, cannot rename {} to {}",
            old, new
        )))
    }
}
