//! Configuration and shared types
//!
//! Worker settings, validation, and the crate-wide error taxonomy.

pub mod config;
pub mod types;
pub mod validator;

pub use config::{EndpointConfig, TopicConfig, WorkerConfig};
pub use validator::{validate_config, ValidationResult};
