//! Thin wrappers around Linux kernel primitives.
//!
//! `unsafe` code is concentrated here.
//! Dependency direction: namespace -> mount -> credentials

pub mod credentials;
pub mod mount;
pub mod namespace;
