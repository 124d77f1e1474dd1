//! Filesystem isolation for the sandbox root.

pub mod filesystem;

pub use filesystem::{copy_directory_contents, BindingMode, SandboxRoot};
