//! Sandbox process core.
//!
//! Owns the supervisor -> proxy -> payload process model, deadline and
//! cancellation teardown, and launch evidence. What runs inside and how its
//! outcome is judged lives in [`crate::sandbox`].

pub mod proxy;
pub mod supervisor;
pub mod types;
