//! Execution control
//!
//! Type-state enforced pre-exec setup of the payload process.

pub mod preexec;
