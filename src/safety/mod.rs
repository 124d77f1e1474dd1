//! Run isolation on disk
//!
//! Run-scoped workspaces with idempotent cleanup.

pub mod workspace;

pub use workspace::{Workspace, WorkspaceManager};
