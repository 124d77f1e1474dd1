//! Client for the compute API that accepts uplets for execution
//!
//! The compute service sits on the worker's private network and takes no
//! credentials; any set in the endpoint configuration are ignored.

use crate::config::config::EndpointConfig;
use crate::config::types::Result;
use crate::endpoint::{unexpected_status, HttpEndpoint};
use crate::model::{Checkable, LearnTask, PredictTask};
use reqwest::StatusCode;
use serde::Serialize;

const LEARN_ROUTE: &str = "learn";
const PREDICT_ROUTE: &str = "pred";

#[derive(Debug, Clone)]
pub struct ComputeApi {
    endpoint: HttpEndpoint,
}

impl ComputeApi {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let anonymous = EndpointConfig {
            user: String::new(),
            password: String::new(),
            ..config.clone()
        };
        Ok(Self {
            endpoint: HttpEndpoint::new(&anonymous)?,
        })
    }

    fn submit<T: Checkable + Serialize>(&self, route: &str, uplet: &T) -> Result<()> {
        uplet.check()?;
        let response = self.endpoint.send(self.endpoint.post(route).json(uplet))?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            _ => Err(unexpected_status(response, "200 OK or 202 Accepted")),
        }
    }

    /// Hand a learn uplet to the compute service
    pub fn post_learn_task(&self, task: &LearnTask) -> Result<()> {
        self.submit(LEARN_ROUTE, task)
    }

    /// Hand a predict uplet to the compute service
    pub fn post_predict_task(&self, task: &PredictTask) -> Result<()> {
        self.submit(PREDICT_ROUTE, task)
    }
}
