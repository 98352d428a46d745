use serde::{Deserialize, Serialize};

use super::job::{JobTask, JobType};
use super::workflow::WorkflowTaskCtx;

/// Terminal snapshot of a job task, written once after it finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub workflow_name: String,
    pub workflow_display_name: String,
    pub task_id: i64,
    pub product_name: String,
    pub start_time: i64,
    pub end_time: i64,
    /// Seconds
    pub duration: i64,
    pub status: String,
}

impl JobInfo {
    pub fn from_task(job: &JobTask, workflow_ctx: &WorkflowTaskCtx) -> Self {
        Self {
            job_type: job.job_type,
            workflow_name: workflow_ctx.workflow_name.clone(),
            workflow_display_name: workflow_ctx.workflow_display_name.clone(),
            task_id: workflow_ctx.task_id,
            product_name: workflow_ctx.project_name.clone(),
            start_time: job.start_time,
            end_time: job.end_time,
            duration: job.end_time - job.start_time,
            status: job.status.as_str().to_string(),
        }
    }
}
