//! upletbox: compute worker for sandboxed machine-learning uplets
//!
//! A worker pulls learn and predict tasks from a work queue, claims them in
//! the task ledger, stages their input blobs, runs the algorithm in a
//! disposable namespace sandbox and reports the outcome.
//!
//! # Architecture
//!
//! ## Records ([`model`])
//! - [`model::task`]: learn and predict uplets with their field invariants
//! - [`model::resource`]: storage resources (algo, data, model, prediction, problem)
//! - [`model::result`]: result bodies posted to the ledger
//!
//! ## Collaborators
//! - [`storage`]: key-addressed blob storage (filesystem, in-memory, HTTP)
//! - [`ledger`]: task status transitions and claim arbitration
//! - [`broker`]: work queue and the per-topic [`broker::Consumer`]
//! - [`compute`]: submission of uplets to the compute API
//!
//! ## Sandbox ([`sandbox`])
//! - [`sandbox::isolated`]: train/test/predict in the namespace sandbox
//! - [`sandbox::verdict`]: outcome classification
//! - [`core`]: supervisor -> proxy -> payload process model and teardown
//! - [`exec::preexec`]: type-state ordered payload setup
//! - [`kernel`]: namespaces, mounts, credentials
//! - [`safety::workspace`]: run-scoped scratch directories
//!
//! ## Pipeline ([`worker`])
//! The learn and predict handlers gluing the collaborators together.
//!
//! ## Ambient
//! - [`config`]: worker configuration, validation and the error taxonomy
//! - [`observability`]: logging setup and the task audit trail

pub mod config;
pub mod endpoint;
pub mod model;

pub mod ledger;
pub mod storage;

pub mod broker;
pub mod compute;

pub mod core;
pub mod exec;
pub mod kernel;
pub mod safety;
pub mod sandbox;

pub mod observability;
pub mod worker;

pub use compute::ComputeApi;
pub use broker::{Consumer, Handler, HandlerContext, MemoryBroker, Message, WorkQueue};
pub use config::types::{
    Disposition, ErrorClass, Result, SandboxConfig, SandboxFailureKind, TaskKind, TaskStatus,
    UpletError,
};
pub use config::WorkerConfig;
pub use ledger::{Ledger, MemoryLedger, OrchestratorApi, TaskLedgerClient};
pub use sandbox::{IsolatedRunner, RunInputs, SandboxRunner, ScriptedRunner};
pub use storage::{BlobStore, FsBlobStore, MemoryBlobStore, StorageApi};
pub use worker::{LearnHandler, PredictHandler, Worker};
