//! Harvesting of job results: structured outputs and container logs

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use super::client::ClusterOps;
use crate::domain::entities::workflow::job_output_key;
use crate::domain::entities::{JobLabel, JobOutput, JobTask, WorkflowTaskCtx};
use crate::domain::repositories::LogStore;
use crate::error::{AppError, Result};

fn termination_message(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter_map(|status| status.state.as_ref()?.terminated.as_ref())
        .filter_map(|terminated| terminated.message.as_deref())
        .find(|message| !message.trim().is_empty())
}

fn owned_by(pod: &Pod, uid: &str) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|owners| owners.iter().any(|owner| owner.uid == uid))
        .unwrap_or(false)
}

/// Pods of the current incarnation of the job. Pods left behind by an
/// earlier job with the same name carry the same labels but a different
/// owner UID.
async fn job_pods(namespace: &str, label: &JobLabel, ops: &dyn ClusterOps) -> Result<Vec<Pod>> {
    let pods = ops.list_pods(namespace, &label.selector()).await?;
    let uid = ops
        .get_job(namespace, &label.job_name)
        .await?
        .and_then(|job| job.metadata.uid);

    Ok(match uid {
        Some(uid) => pods.into_iter().filter(|pod| owned_by(pod, &uid)).collect(),
        None => pods,
    })
}

/// Read the outputs a job wrote to its termination message into the
/// workflow's global context
pub async fn job_outputs_from_termination_message(
    namespace: &str,
    task: &JobTask,
    workflow_ctx: &WorkflowTaskCtx,
    ops: &dyn ClusterOps,
) -> Result<()> {
    let pods = job_pods(namespace, &task.label(), ops).await?;

    let Some(message) = pods.iter().find_map(termination_message) else {
        debug!(job = %task.k8s_job_name, "No termination message, job has no outputs");
        return Ok(());
    };

    let outputs: Vec<JobOutput> = serde_json::from_str(message).map_err(|e| {
        AppError::ValidationError(format!(
            "invalid termination message for job {}: {}",
            task.k8s_job_name, e
        ))
    })?;

    for output in outputs {
        debug!(job = %task.k8s_job_name, output = %output.name, "📤 Job output");
        workflow_ctx.global_context_set(job_output_key(&task.key, &output.name), output.value);
    }
    Ok(())
}

/// Storage key of a job's container log
pub fn container_log_key(workflow_name: &str, task_id: i64, job_name: &str) -> String {
    let file_name = format!("{}-{}-{}.log", workflow_name, job_name, task_id);
    format!("{}/{}/log/{}", workflow_name, task_id, file_name)
        .to_lowercase()
        .replace('_', "-")
}

/// Persist the logs of the job's first container, returning the storage key
#[allow(clippy::too_many_arguments)]
pub async fn save_container_log(
    namespace: &str,
    cluster_id: &str,
    workflow_name: &str,
    task_id: i64,
    label: &JobLabel,
    ops: &dyn ClusterOps,
    store: &dyn LogStore,
) -> Result<String> {
    let pods = job_pods(namespace, label, ops).await?;
    let pod = pods.first().ok_or_else(|| {
        AppError::NotFound(format!(
            "no pod found for job {} in {}/{}",
            label.job_name, cluster_id, namespace
        ))
    })?;
    let pod_name = pod.metadata.name.as_deref().ok_or_else(|| {
        AppError::KubernetesError(format!("pod of job {} has no name", label.job_name))
    })?;
    let container = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .map(|container| container.name.as_str());

    let logs = match ops.pod_logs(namespace, pod_name, container).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!(
                cluster = %cluster_id,
                namespace = %namespace,
                pod = %pod_name,
                error = %e,
                "Failed to fetch container logs"
            );
            return Err(e);
        }
    };

    let key = container_log_key(workflow_name, task_id, &label.job_name);
    store.put(&key, &logs).await?;
    info!(job = %label.job_name, key = %key, "📝 Container log saved");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::JobType;
    use crate::infrastructure::storage::MemoryLogStore;
    use crate::testing::{FakeCluster, PodOutcome};

    async fn finished_job(cluster: &FakeCluster, task: &JobTask) {
        cluster
            .create_job(&cluster.job_manifest("rustci", &task.label()))
            .await
            .unwrap();
        // two polls: one to start, one to finish
        for _ in 0..2 {
            cluster.get_job("rustci", &task.k8s_job_name).await.unwrap();
        }
    }

    #[test]
    fn test_container_log_key() {
        assert_eq!(
            container_log_key("Build_Flow", 7, "build_flow-notify-a1b2c3"),
            "build-flow/7/log/build-flow-build-flow-notify-a1b2c3-7.log"
        );
    }

    #[tokio::test]
    async fn test_outputs_are_written_to_context() {
        let cluster = FakeCluster::new()
            .start_after_polls(1)
            .run_for_polls(1)
            .outcome(PodOutcome::Succeeded)
            .termination_message(r#"[{"name":"version","value":"1.2.3"}]"#);
        let task = JobTask::new("build", JobType::Plugin, "wf");
        let ctx = WorkflowTaskCtx::new("wf", "Workflow", 1, "demo");
        finished_job(&cluster, &task).await;

        job_outputs_from_termination_message("rustci", &task, &ctx, &cluster)
            .await
            .unwrap();
        assert_eq!(
            ctx.global_context_get("{{.job.build.output.version}}").as_deref(),
            Some("1.2.3")
        );
    }

    #[tokio::test]
    async fn test_missing_termination_message_yields_no_outputs() {
        let cluster = FakeCluster::new().start_after_polls(1).run_for_polls(1);
        let task = JobTask::new("build", JobType::Plugin, "wf");
        let ctx = WorkflowTaskCtx::new("wf", "Workflow", 1, "demo");
        finished_job(&cluster, &task).await;

        job_outputs_from_termination_message("rustci", &task, &ctx, &cluster)
            .await
            .unwrap();
        assert_eq!(ctx.global_context_len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_termination_message_is_error() {
        let cluster = FakeCluster::new()
            .start_after_polls(1)
            .run_for_polls(1)
            .termination_message("not json");
        let task = JobTask::new("build", JobType::Plugin, "wf");
        let ctx = WorkflowTaskCtx::new("wf", "Workflow", 1, "demo");
        finished_job(&cluster, &task).await;

        let result = job_outputs_from_termination_message("rustci", &task, &ctx, &cluster).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_save_container_log() {
        let cluster = FakeCluster::new()
            .start_after_polls(1)
            .run_for_polls(1)
            .logs("hello from the job\n");
        let task = JobTask::new("build", JobType::Plugin, "wf");
        finished_job(&cluster, &task).await;
        let store = MemoryLogStore::new();

        let key = save_container_log("rustci", "local", "wf", 3, &task.label(), &cluster, &store)
            .await
            .unwrap();
        assert!(key.starts_with("wf/3/log/"));
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some("hello from the job\n")
        );
    }

    #[tokio::test]
    async fn test_pods_of_an_earlier_job_are_ignored() {
        let cluster = FakeCluster::new()
            .start_after_polls(1)
            .run_for_polls(1)
            .termination_message(r#"[{"name":"version","value":"2.0.0"}]"#)
            .logs("second attempt\n");
        let task = JobTask::new("build", JobType::Plugin, "wf");
        let ctx = WorkflowTaskCtx::new("wf", "Workflow", 1, "demo");
        cluster.leave_stale_pod(
            "rustci",
            &task.label(),
            r#"[{"name":"version","value":"1.0.0"}]"#,
            "first attempt\n",
        );
        finished_job(&cluster, &task).await;
        let store = MemoryLogStore::new();

        job_outputs_from_termination_message("rustci", &task, &ctx, &cluster)
            .await
            .unwrap();
        let key = save_container_log("rustci", "local", "wf", 1, &task.label(), &cluster, &store)
            .await
            .unwrap();

        assert_eq!(
            ctx.global_context_get("{{.job.build.output.version}}").as_deref(),
            Some("2.0.0")
        );
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some("second attempt\n")
        );
    }

    #[tokio::test]
    async fn test_save_container_log_without_pod_fails() {
        let cluster = FakeCluster::new();
        let label = JobLabel::new(JobType::Plugin, "missing");
        let store = MemoryLogStore::new();

        let result =
            save_container_log("rustci", "local", "wf", 3, &label, &cluster, &store).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
