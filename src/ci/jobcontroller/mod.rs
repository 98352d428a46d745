//! Job controllers
//!
//! A job controller owns one job task for the duration of a workflow run.
//! It translates the task into cluster workloads, drives them to a terminal
//! state and records the outcome on the task.

pub mod plugin;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::domain::entities::{JobTask, JobTaskSpec, WorkflowTaskCtx};
use crate::domain::repositories::{JobInfoStore, LogStore};
use crate::error::Result;
use crate::infrastructure::kubernetes::ClusterResolver;

pub use plugin::PluginJobCtl;

/// Called once when a job's pod is observed running
pub type AckFn = Arc<dyn Fn(&JobTask) + Send + Sync>;

#[async_trait]
pub trait JobCtl: Send + Sync {
    /// Drive the job to a terminal state, a timeout or cancellation
    async fn run(&mut self, cancel: CancellationToken);

    async fn clean(&self);

    /// Persist the terminal record of the job
    async fn save_info(&self) -> Result<()>;

    fn job(&self) -> &JobTask;

    fn into_job(self: Box<Self>) -> JobTask;
}

/// Tunables shared by all job controllers
#[derive(Debug, Clone)]
pub struct JobCtlSettings {
    /// Namespace used on the local cluster
    pub namespace: String,
    pub poll_interval: Duration,
    pub delete_timeout: Duration,
}

impl Default for JobCtlSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for JobCtlSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            poll_interval: config.poll_interval,
            delete_timeout: config.delete_timeout,
        }
    }
}

/// Collaborators injected into job controllers
#[derive(Clone)]
pub struct JobCtlEnv {
    pub resolver: Arc<dyn ClusterResolver>,
    pub log_store: Arc<dyn LogStore>,
    pub job_info_store: Arc<dyn JobInfoStore>,
    pub settings: JobCtlSettings,
    /// Notified when the detached cluster cleanup of a job has finished
    pub cleanup_hook: Option<Arc<Notify>>,
}

impl JobCtlEnv {
    pub fn new(
        resolver: Arc<dyn ClusterResolver>,
        log_store: Arc<dyn LogStore>,
        job_info_store: Arc<dyn JobInfoStore>,
        settings: JobCtlSettings,
    ) -> Self {
        Self {
            resolver,
            log_store,
            job_info_store,
            settings,
            cleanup_hook: None,
        }
    }

    pub fn with_cleanup_hook(mut self, hook: Arc<Notify>) -> Self {
        self.cleanup_hook = Some(hook);
        self
    }
}

/// Build the controller matching the task's job type
pub fn new_job_ctl(
    job: JobTask,
    workflow_ctx: WorkflowTaskCtx,
    ack: AckFn,
    env: JobCtlEnv,
) -> Result<Box<dyn JobCtl>> {
    match JobTaskSpec::decode(job.job_type, &job.spec)? {
        JobTaskSpec::Plugin(spec) => Ok(Box::new(PluginJobCtl::new(
            job,
            workflow_ctx,
            spec,
            ack,
            env,
        ))),
    }
}
