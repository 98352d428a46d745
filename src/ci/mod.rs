//! Workflow job execution

pub mod jobcontroller;

pub use jobcontroller::{new_job_ctl, AckFn, JobCtl, JobCtlEnv, JobCtlSettings};
