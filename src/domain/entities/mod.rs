//! Domain entities for workflow job execution
//!
//! A workflow run is made of job tasks; each job task is executed by a job
//! controller that owns it for the duration of the run.

pub mod job;
pub mod job_info;
pub mod plugin;
pub mod workflow;

pub use job::{JobLabel, JobOutput, JobStatus, JobTask, JobTaskSpec, JobType};
pub use job_info::JobInfo;
pub use plugin::{
    JobProperties, KeyVal, PluginInput, PluginOutput, PluginJobSpec, PluginTemplate,
    RegistryNamespace, ResourceLimits, ResourceRequest, ResourceRequestSpec,
    ATTACHED_CLUSTER_NAMESPACE, DEFAULT_TIMEOUT_MINUTES, LOCAL_CLUSTER_ID, MAX_TIMEOUT_MINUTES,
};
pub use workflow::WorkflowTaskCtx;
