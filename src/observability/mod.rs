//! Observability
//!
//! Logging setup and the structured task audit trail.

pub mod audit;

pub use audit::{Severity, TaskAuditLog, TaskEvent, TaskEventType};

/// Install `env_logger` with the filter from `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
