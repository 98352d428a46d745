//! Kubernetes job lifecycle management
//!
//! This module handles the lifecycle of a single cluster Job:
//! - Idempotent deletion by job label
//! - Submission
//! - Waiting for the job's pod to start
//! - Waiting for the job to reach a terminal phase

use k8s_openapi::api::batch::v1::{Job, JobStatus as K8sJobStatus};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::ClusterOps;
use crate::domain::entities::{JobLabel, JobStatus};
use crate::error::{AppError, Result};

/// Delete every job carrying `label` and wait until none is left
pub async fn ensure_delete_job(
    namespace: &str,
    label: &JobLabel,
    ops: &dyn ClusterOps,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let selector = label.selector();
    let existing = ops.list_jobs(namespace, &selector).await?;
    if existing.is_empty() {
        debug!(namespace = %namespace, selector = %selector, "No existing job to delete");
        return Ok(());
    }

    info!(
        namespace = %namespace,
        job = %label.job_name,
        "🧹 Deleting {} existing job(s)",
        existing.len()
    );
    ops.delete_jobs(namespace, &selector).await?;

    let deadline = Instant::now() + timeout;
    loop {
        if ops.list_jobs(namespace, &selector).await?.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(AppError::KubernetesError(format!(
                "job {} still present after {:?}",
                label.job_name, timeout
            )));
        }
        sleep(poll_interval).await;
    }
}

/// Submit a job manifest
pub async fn create_job(job: &Job, ops: &dyn ClusterOps) -> Result<()> {
    ops.create_job(job).await
}

fn counts(status: Option<&K8sJobStatus>) -> (i32, i32, i32) {
    status
        .map(|s| {
            (
                s.active.unwrap_or(0),
                s.succeeded.unwrap_or(0),
                s.failed.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0, 0))
}

fn has_condition(status: Option<&K8sJobStatus>, condition_type: &str) -> bool {
    status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
        .unwrap_or(false)
}

fn failure_reason(status: Option<&K8sJobStatus>) -> Option<String> {
    status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
        })
        .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
}

/// Wait until the job's pod has started.
///
/// Returns `Running` once the job reports an active, succeeded or failed
/// pod, `Timeout` when `deadline` passes and `Cancelled` when `cancel`
/// fires. Transient API errors are retried until the deadline.
pub async fn wait_job_start(
    cancel: &CancellationToken,
    namespace: &str,
    job_name: &str,
    ops: &dyn ClusterOps,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<JobStatus> {
    info!(namespace = %namespace, job = %job_name, "⏳ Waiting for job to start");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(job = %job_name, "Job cancelled before it started");
                return Ok(JobStatus::Cancelled);
            }
            _ = sleep_until(deadline) => {
                warn!(
                    namespace = %namespace,
                    job = %job_name,
                    "⏰ Timed out waiting for job to start"
                );
                return Ok(JobStatus::Timeout);
            }
            _ = sleep(poll_interval) => {}
        }

        match ops.get_job(namespace, job_name).await {
            Ok(Some(job)) => {
                let (active, succeeded, failed) = counts(job.status.as_ref());
                if active > 0 || succeeded > 0 || failed > 0 {
                    info!(namespace = %namespace, job = %job_name, "🔄 Job is running");
                    return Ok(JobStatus::Running);
                }
                debug!(job = %job_name, "⏸️ Job is pending");
            }
            Ok(None) => {
                error!(
                    namespace = %namespace,
                    job = %job_name,
                    "Job disappeared before it started"
                );
                return Err(AppError::NotFound(format!(
                    "job {}/{} not found",
                    namespace, job_name
                )));
            }
            Err(e) => {
                warn!(job = %job_name, error = %e, "Failed to get job status");
            }
        }
    }
}

/// Wait until the job reaches a terminal phase.
pub async fn wait_plain_job_end(
    cancel: &CancellationToken,
    timeout_minutes: i64,
    deadline: Instant,
    namespace: &str,
    job_name: &str,
    ops: &dyn ClusterOps,
    poll_interval: Duration,
) -> JobStatus {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(job = %job_name, "Job cancelled while running");
                return JobStatus::Cancelled;
            }
            _ = sleep_until(deadline) => {
                warn!(
                    namespace = %namespace,
                    job = %job_name,
                    "⏰ Job timed out after {} minute(s)",
                    timeout_minutes
                );
                return JobStatus::Timeout;
            }
            _ = sleep(poll_interval) => {}
        }

        match ops.get_job(namespace, job_name).await {
            Ok(Some(job)) => {
                let status = job.status.as_ref();
                let (_, succeeded, failed) = counts(status);
                if succeeded > 0 || has_condition(status, "Complete") {
                    info!(namespace = %namespace, job = %job_name, "✅ Job succeeded");
                    return JobStatus::Succeeded;
                }
                if failed > 0 || has_condition(status, "Failed") {
                    let reason = failure_reason(status)
                        .unwrap_or_else(|| "job failed without specific reason".to_string());
                    error!(
                        namespace = %namespace,
                        job = %job_name,
                        reason = %reason,
                        "❌ Job failed"
                    );
                    return JobStatus::Failed;
                }
            }
            Ok(None) => {
                error!(namespace = %namespace, job = %job_name, "Job disappeared while running");
                return JobStatus::Failed;
            }
            Err(e) => {
                warn!(job = %job_name, error = %e, "Failed to get job status");
            }
        }
    }
}
