//! RustCI job controller
//!
//! Executes workflow job tasks on Kubernetes clusters: a task's spec is
//! turned into a cluster Job, driven to a terminal state, and its outputs,
//! logs and terminal record are collected.

pub mod ci;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod services;
pub mod testing;

// Re-export commonly used types
pub use error::{AppError, Result};
