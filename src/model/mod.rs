//! Task and resource records
//!
//! Every record is validated with [`Checkable::check`] before it reaches the
//! network or the sandbox.

pub mod record;
pub mod resource;
pub mod result;
pub mod task;

pub use record::{uuid_from_key, LedgerLearnRecord};
pub use resource::{
    Algo, AnyResource, Data, Model, Prediction, Problem, Resource, ResourceFields, ResourceKind,
};
pub use result::{LearnResult, PredictResult};
pub use task::{Checkable, LearnTask, PerfMap, PredictTask};
