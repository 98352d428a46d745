//! Repository interfaces used by job controllers
//!
//! Implementations live in `crate::infrastructure`.

pub mod job_info;
pub mod log_store;

pub use job_info::JobInfoStore;
pub use log_store::LogStore;
