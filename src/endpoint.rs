/// Blocking HTTP plumbing shared by the ledger and storage clients
use crate::config::config::EndpointConfig;
use crate::config::types::{Result, UpletError};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::error::Error as _;
use std::io;

/// Error body returned by the remote services
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Base URL, credentials and a pooled client
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl HttpEndpoint {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| UpletError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.user.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.user, Some(&self.password))
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(self.url(path)))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.post(self.url(path)))
    }

    /// Send a request; failures to reach the service are transient
    pub fn send(&self, builder: RequestBuilder) -> Result<Response> {
        builder.send().map_err(|e| {
            let target = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| self.base_url.clone());
            if let Some(short) = short_upload(&e) {
                UpletError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, short))
            } else if e.is_timeout() {
                UpletError::Transient(format!("request to {} timed out", target))
            } else {
                UpletError::Transient(format!("request to {} failed: {}", target, e))
            }
        })
    }
}

/// A streamed body that ran dry before its declared size
fn short_upload(err: &reqwest::Error) -> Option<String> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::UnexpectedEof {
                return Some(io_err.to_string());
            }
        }
        source = cause.source();
    }
    None
}

/// Turn an unexpected response into a protocol error, keeping the remote error text
pub fn unexpected_status(response: Response, expected: &str) -> UpletError {
    let status = response.status().as_u16();
    let text = response.text().unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.error,
        Err(_) if text.is_empty() => format!("expected {}", expected),
        Err(_) => format!("expected {}: {}", expected, text),
    };
    UpletError::protocol(status, message)
}

/// Decode a JSON response body; a malformed body is a protocol error with status 0
pub fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json::<T>()
        .map_err(|e| UpletError::protocol(0, format!("malformed response body: {}", e)))
}
