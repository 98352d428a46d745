use async_trait::async_trait;

use crate::domain::entities::JobInfo;
use crate::error::Result;

/// Store of terminal job records
#[async_trait]
pub trait JobInfoStore: Send + Sync {
    /// Persist a terminal record
    async fn create(&self, info: &JobInfo) -> Result<()>;

    /// Records written for a workflow, oldest first
    async fn list_by_workflow(&self, workflow_name: &str) -> Result<Vec<JobInfo>>;
}
