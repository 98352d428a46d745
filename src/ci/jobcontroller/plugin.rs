use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AckFn, JobCtl, JobCtlEnv};
use crate::domain::entities::{
    JobInfo, JobStatus, JobTask, KeyVal, PluginJobSpec, ResourceRequest, WorkflowTaskCtx,
    ATTACHED_CLUSTER_NAMESPACE,
};
use crate::error::{AppError, Result};
use crate::infrastructure::kubernetes::harvest::{
    job_outputs_from_termination_message, save_container_log,
};
use crate::infrastructure::kubernetes::job_builder::build_plain_job;
use crate::infrastructure::kubernetes::lifecycle::{
    create_job, ensure_delete_job, wait_job_start, wait_plain_job_end,
};
use crate::infrastructure::kubernetes::registry::{ensure_registry_secrets, matched_registries};
use crate::infrastructure::kubernetes::ClusterOps;

/// Runs a plugin step as a single-pod cluster Job
pub struct PluginJobCtl {
    job: JobTask,
    workflow_ctx: WorkflowTaskCtx,
    spec: PluginJobSpec,
    ack: AckFn,
    env: JobCtlEnv,
}

impl PluginJobCtl {
    pub fn new(
        job: JobTask,
        workflow_ctx: WorkflowTaskCtx,
        spec: PluginJobSpec,
        ack: AckFn,
        env: JobCtlEnv,
    ) -> Self {
        Self {
            job,
            workflow_ctx,
            spec,
            ack,
            env,
        }
    }

    pub fn spec(&self) -> &PluginJobSpec {
        &self.spec
    }

    fn prepare(&mut self) {
        self.spec.properties.apply_defaults();
    }

    fn namespace(&self) -> &str {
        &self.spec.properties.namespace
    }

    /// Log and record a failure of the submission phase
    fn abort(&mut self, stage: &str, err: AppError) {
        let message = format!("{} error: {}", stage, err);
        error!(
            job = %self.job.k8s_job_name,
            namespace = %self.spec.properties.namespace,
            "❌ {}",
            message
        );
        self.job.record_error(message);
    }

    /// Submit the cluster Job, returning the cluster it runs on
    async fn submit(&mut self) -> Option<Arc<dyn ClusterOps>> {
        self.spec.properties.namespace = if self.spec.properties.is_local_cluster() {
            self.env.settings.namespace.clone()
        } else {
            ATTACHED_CLUSTER_NAMESPACE.to_string()
        };

        let ops = match self.env.resolver.resolve(&self.spec.properties.cluster_id).await {
            Ok(ops) => ops,
            Err(e) => {
                self.abort("get cluster client", e);
                return None;
            }
        };

        let label = self.job.label();
        self.spec.properties.registries =
            matched_registries(&self.spec.plugin.image, &self.spec.properties.registries);

        let manifest = key_vals_to_map(&self.spec.properties.custom_labels)
            .and_then(|labels| {
                let annotations = key_vals_to_map(&self.spec.properties.custom_annotations)?;
                build_plain_job(
                    &self.job.k8s_job_name,
                    self.spec
                        .properties
                        .resource_request
                        .unwrap_or(ResourceRequest::Min),
                    &self.spec.properties.res_req_spec,
                    &self.job,
                    &self.spec,
                    &self.workflow_ctx,
                    &labels,
                    &annotations,
                )
            });
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                self.abort("create job context", e);
                return None;
            }
        };

        let namespace = self.namespace().to_string();
        let settings = self.env.settings.clone();
        if let Err(e) = ensure_delete_job(
            &namespace,
            &label,
            ops.as_ref(),
            settings.delete_timeout,
            settings.poll_interval,
        )
        .await
        {
            self.abort("delete job", e);
            return None;
        }

        let registries = &self.spec.properties.registries;
        if let Err(e) = ensure_registry_secrets(&namespace, registries, ops.as_ref()).await {
            self.abort("create secret", e);
            return None;
        }

        if let Err(e) = create_job(&manifest, ops.as_ref()).await {
            self.abort("create job", e);
            return None;
        }

        info!(
            job = %self.job.k8s_job_name,
            namespace = %namespace,
            cluster = %ops.cluster_id(),
            "🚀 Succeeded to create job"
        );
        Some(ops)
    }

    /// Wait for the job to start and then to finish. Returns whether the
    /// job was ever observed running.
    async fn wait(&mut self, cancel: &CancellationToken, ops: &dyn ClusterOps) -> bool {
        let timeout_minutes = self.spec.properties.timeout;
        let timeout = Duration::from_secs(self.spec.properties.timeout_seconds().unsigned_abs());
        let deadline = Instant::now() + timeout;
        let namespace = self.namespace().to_string();
        let poll_interval = self.env.settings.poll_interval;

        self.job.status = match wait_job_start(
            cancel,
            &namespace,
            &self.job.k8s_job_name,
            ops,
            deadline,
            poll_interval,
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(
                    job = %self.job.k8s_job_name,
                    namespace = %namespace,
                    error = %e,
                    "Wait job start error"
                );
                self.job.record_error(format!("wait job start error: {}", e));
                JobStatus::Failed
            }
        };

        if self.job.status != JobStatus::Running {
            return false;
        }
        (self.ack)(&self.job);

        self.job.status = wait_plain_job_end(
            cancel,
            timeout_minutes,
            deadline,
            &namespace,
            &self.job.k8s_job_name,
            ops,
            poll_interval,
        )
        .await;
        true
    }

    async fn complete(&mut self, ops: &Arc<dyn ClusterOps>) {
        self.harvest(ops.as_ref()).await;
        self.spawn_cleanup(ops.clone());
    }

    async fn harvest(&mut self, ops: &dyn ClusterOps) {
        let namespace = self.namespace().to_string();

        let outputs =
            job_outputs_from_termination_message(&namespace, &self.job, &self.workflow_ctx, ops);
        if let Err(e) = outputs.await {
            error!(
                job = %self.job.k8s_job_name,
                namespace = %namespace,
                error = %e,
                "Failed to read job outputs"
            );
            self.job.record_error(e.to_string());
        }

        if let Err(e) = save_container_log(
            &namespace,
            &self.spec.properties.cluster_id,
            &self.workflow_ctx.workflow_name,
            self.workflow_ctx.task_id,
            &self.job.label(),
            ops,
            self.env.log_store.as_ref(),
        )
        .await
        {
            error!(
                job = %self.job.k8s_job_name,
                namespace = %namespace,
                error = %e,
                "Failed to save container log"
            );
            self.job.record_error(e.to_string());
            return;
        }

        info!(
            job = %self.job.k8s_job_name,
            namespace = %namespace,
            status = %self.job.status,
            "🏁 Job completed"
        );
    }

    /// Delete the cluster Job in the background
    fn spawn_cleanup(&self, ops: Arc<dyn ClusterOps>) {
        let namespace = self.namespace().to_string();
        let label = self.job.label();
        let settings = self.env.settings.clone();
        let hook = self.env.cleanup_hook.clone();

        tokio::spawn(async move {
            if let Err(e) = ensure_delete_job(
                &namespace,
                &label,
                ops.as_ref(),
                settings.delete_timeout,
                settings.poll_interval,
            )
            .await
            {
                warn!(
                    job = %label.job_name,
                    namespace = %namespace,
                    error = %e,
                    "Failed to clean up job"
                );
            }
            if let Some(hook) = hook {
                hook.notify_one();
            }
        });
    }

    fn store_resolved_spec(&mut self) {
        match serde_json::to_value(&self.spec) {
            Ok(value) => self.job.spec = value,
            Err(e) => warn!(job = %self.job.k8s_job_name, error = %e, "Failed to encode job spec"),
        }
    }
}

#[async_trait]
impl JobCtl for PluginJobCtl {
    async fn run(&mut self, cancel: CancellationToken) {
        if self.job.start_time == 0 {
            self.job.start_time = Utc::now().timestamp();
        }
        self.prepare();

        if let Some(ops) = self.submit().await {
            if self.wait(&cancel, ops.as_ref()).await {
                self.complete(&ops).await;
            } else {
                self.spawn_cleanup(ops);
            }
        }

        self.store_resolved_spec();
        self.job.end_time = Utc::now().timestamp();
    }

    async fn clean(&self) {
        debug!(job = %self.job.k8s_job_name, "Nothing to clean for plugin job");
    }

    async fn save_info(&self) -> Result<()> {
        let info = JobInfo::from_task(&self.job, &self.workflow_ctx);
        self.env.job_info_store.create(&info).await
    }

    fn job(&self) -> &JobTask {
        &self.job
    }

    fn into_job(self: Box<Self>) -> JobTask {
        self.job
    }
}

fn key_vals_to_map(items: &[KeyVal]) -> Result<BTreeMap<String, String>> {
    items
        .iter()
        .map(|kv| Ok((kv.key.clone(), kv.value_string()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::jobcontroller::JobCtlSettings;
    use crate::domain::entities::{JobLabel, JobType, RegistryNamespace, MAX_TIMEOUT_MINUTES};
    use crate::domain::repositories::{JobInfoStore, LogStore};
    use crate::infrastructure::repositories::InMemoryJobInfoStore;
    use crate::infrastructure::storage::MemoryLogStore;
    use crate::testing::{FakeCluster, PodOutcome};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Harness {
        cluster: FakeCluster,
        logs: Arc<MemoryLogStore>,
        infos: Arc<InMemoryJobInfoStore>,
        acks: Arc<AtomicUsize>,
        cleaned: Arc<Notify>,
    }

    impl Harness {
        fn new(cluster: FakeCluster) -> Self {
            Self {
                cluster,
                logs: Arc::new(MemoryLogStore::new()),
                infos: Arc::new(InMemoryJobInfoStore::new()),
                acks: Arc::new(AtomicUsize::new(0)),
                cleaned: Arc::new(Notify::new()),
            }
        }

        fn ctl(&self, spec: serde_json::Value) -> (PluginJobCtl, WorkflowTaskCtx) {
            let job = JobTask::new("notify", JobType::Plugin, "wf").with_spec(spec.clone());
            let ctx = WorkflowTaskCtx::new("wf", "Workflow", 9, "demo");
            let acks = self.acks.clone();
            let env = JobCtlEnv::new(
                Arc::new(self.cluster.clone()),
                self.logs.clone(),
                self.infos.clone(),
                JobCtlSettings {
                    namespace: "rustci".to_string(),
                    poll_interval: Duration::from_millis(100),
                    delete_timeout: Duration::from_secs(5),
                },
            )
            .with_cleanup_hook(self.cleaned.clone());
            let spec: PluginJobSpec = serde_json::from_value(spec).unwrap();
            let ack: AckFn = Arc::new(move |_: &JobTask| {
                acks.fetch_add(1, Ordering::SeqCst);
            });
            (PluginJobCtl::new(job, ctx.clone(), spec, ack, env), ctx)
        }
    }

    fn busybox_spec() -> serde_json::Value {
        json!({
            "properties": { "timeout": 0, "cluster_id": "" },
            "plugin": { "name": "notify", "image": "busybox" }
        })
    }

    #[test]
    fn test_prepare_applies_defaults_once() {
        let harness = Harness::new(FakeCluster::new());
        let (mut ctl, _) = harness.ctl(busybox_spec());

        ctl.prepare();
        let first = ctl.spec().properties.clone();
        ctl.prepare();

        assert_eq!(first.timeout, 600);
        assert_eq!(first.cluster_id, "local");
        assert_eq!(first.resource_request, Some(ResourceRequest::Min));
        assert_eq!(ctl.spec().properties, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run() {
        let harness = Harness::new(
            FakeCluster::new()
                .termination_message(r#"[{"name":"ts","value":"1700000000"}]"#)
                .logs("done\n"),
        );
        let (mut ctl, ctx) = harness.ctl(busybox_spec());

        ctl.run(CancellationToken::new()).await;
        harness.cleaned.notified().await;

        let job = ctl.job();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.error, None);
        assert!(job.end_time >= job.start_time);
        assert_eq!(job.spec["properties"]["namespace"], "rustci");
        assert_eq!(harness.acks.load(Ordering::SeqCst), 1);
        assert_eq!(
            ctx.global_context_get("{{.job.notify.output.ts}}").as_deref(),
            Some("1700000000")
        );
        assert_eq!(harness.logs.keys().len(), 1);
        assert!(harness.cluster.job_names().is_empty());
        assert_eq!(harness.cluster.resolved_clusters(), vec!["local".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_cluster_uses_agent_namespace() {
        let harness = Harness::new(FakeCluster::new());
        let (mut ctl, _) = harness.ctl(json!({
            "properties": { "cluster_id": "edge-1" },
            "plugin": { "name": "notify", "image": "busybox" }
        }));

        ctl.run(CancellationToken::new()).await;

        let submitted = harness.cluster.submitted_jobs();
        assert_eq!(
            submitted[0].metadata.namespace.as_deref(),
            Some(ATTACHED_CLUSTER_NAMESPACE)
        );
        assert_eq!(harness.cluster.resolved_clusters(), vec!["edge-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_job_is_replaced() {
        let harness = Harness::new(FakeCluster::new().never_start());
        let (mut ctl, _) = harness.ctl(busybox_spec());
        let label = JobLabel::new(JobType::Plugin, &ctl.job().k8s_job_name);
        harness
            .cluster
            .insert_job(harness.cluster.job_manifest("rustci", &label));

        let cancel = CancellationToken::new();
        cancel.cancel();
        ctl.run(cancel).await;
        harness.cleaned.notified().await;

        assert_eq!(ctl.job().status, JobStatus::Cancelled);
        assert_eq!(ctl.job().error, None);
        assert_eq!(harness.cluster.submitted_jobs().len(), 1);
        assert!(harness.cluster.job_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_resolution_failure_aborts() {
        let harness = Harness::new(FakeCluster::new().fail_resolve());
        let (mut ctl, _) = harness.ctl(busybox_spec());

        ctl.run(CancellationToken::new()).await;

        let job = ctl.job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.as_deref().unwrap().starts_with("get cluster client error"));
        assert!(harness.cluster.submitted_jobs().is_empty());
        assert_eq!(harness.acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secret_failure_aborts() {
        let harness = Harness::new(FakeCluster::new().fail_secrets());
        let (mut ctl, _) = harness.ctl(json!({
            "properties": {
                "registries": [{
                    "id": "r1",
                    "reg_addr": "https://registry.example.com",
                    "namespace": "team"
                }]
            },
            "plugin": { "name": "notify", "image": "registry.example.com/team/notify:1" }
        }));

        ctl.run(CancellationToken::new()).await;

        assert!(ctl.job().error.as_deref().unwrap().starts_with("create secret error"));
        assert!(harness.cluster.submitted_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_matching_registries_are_provisioned() {
        let harness = Harness::new(FakeCluster::new());
        let (mut ctl, _) = harness.ctl(json!({
            "properties": {
                "registries": [
                    { "id": "r1", "reg_addr": "https://registry.example.com", "namespace": "team" },
                    { "id": "r2", "reg_addr": "https://other.example.com", "namespace": "team" }
                ]
            },
            "plugin": { "name": "notify", "image": "registry.example.com/team/notify:1" }
        }));

        ctl.run(CancellationToken::new()).await;

        let secrets = harness.cluster.secrets();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].metadata.name.as_deref(), Some("r1-registry-secret"));
        let registries: Vec<RegistryNamespace> =
            serde_json::from_value(ctl.job().spec["properties"]["registries"].clone()).unwrap();
        assert_eq!(registries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_custom_label_aborts() {
        let harness = Harness::new(FakeCluster::new());
        let (mut ctl, _) = harness.ctl(json!({
            "properties": { "custom_labels": [{ "key": "team", "value": ["a", "b"] }] },
            "plugin": { "name": "notify", "image": "busybox" }
        }));

        ctl.run(CancellationToken::new()).await;

        assert!(ctl.job().error.as_deref().unwrap().starts_with("create job context error"));
        assert!(harness.cluster.submitted_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_that_never_starts_times_out_without_ack() {
        let harness = Harness::new(FakeCluster::new().never_start());
        let (mut ctl, _) = harness.ctl(json!({
            "properties": { "timeout": 1 },
            "plugin": { "name": "notify", "image": "busybox" }
        }));

        ctl.run(CancellationToken::new()).await;
        harness.cleaned.notified().await;

        assert_eq!(ctl.job().status, JobStatus::Timeout);
        assert_eq!(harness.acks.load(Ordering::SeqCst), 0);
        assert!(harness.logs.keys().is_empty());
        assert!(harness.cluster.job_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_timeout_runs_with_bounded_deadline() {
        let harness = Harness::new(FakeCluster::new());
        let (mut ctl, _) = harness.ctl(json!({
            "properties": { "timeout": 200_000_000_000_000_000_i64 },
            "plugin": { "name": "notify", "image": "busybox" }
        }));

        ctl.run(CancellationToken::new()).await;

        assert_eq!(ctl.job().status, JobStatus::Succeeded);
        assert_eq!(ctl.spec().properties.timeout, MAX_TIMEOUT_MINUTES);
        let submitted = harness.cluster.submitted_jobs();
        assert_eq!(
            submitted[0].spec.as_ref().unwrap().active_deadline_seconds,
            Some(MAX_TIMEOUT_MINUTES * 60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_is_still_harvested() {
        let harness = Harness::new(FakeCluster::new().outcome(PodOutcome::Failed).logs("boom\n"));
        let (mut ctl, _) = harness.ctl(busybox_spec());

        ctl.run(CancellationToken::new()).await;

        assert_eq!(ctl.job().status, JobStatus::Failed);
        assert_eq!(harness.acks.load(Ordering::SeqCst), 1);
        let key = &harness.logs.keys()[0];
        assert_eq!(harness.logs.get(key).await.unwrap().as_deref(), Some("boom\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_running() {
        let harness = Harness::new(FakeCluster::new().outcome(PodOutcome::Hang));
        let (mut ctl, _) = harness.ctl(busybox_spec());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        ctl.run(cancel).await;

        assert_eq!(ctl.job().status, JobStatus::Cancelled);
        assert_eq!(harness.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_failure_after_success_is_recorded() {
        let harness = Harness::new(
            FakeCluster::new()
                .termination_message(r#"[{"name":"digest","value":"sha256:abc"}]"#)
                .fail_logs(),
        );
        let (mut ctl, ctx) = harness.ctl(busybox_spec());

        ctl.run(CancellationToken::new()).await;
        harness.cleaned.notified().await;

        let job = ctl.job();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.error.as_deref().unwrap().contains("logs unavailable"));
        assert_eq!(
            ctx.global_context_get("{{.job.notify.output.digest}}").as_deref(),
            Some("sha256:abc")
        );
        assert!(harness.cluster.job_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_info_records_duration() {
        let harness = Harness::new(FakeCluster::new());
        let (mut ctl, _) = harness.ctl(busybox_spec());
        ctl.job.start_time = 1_700_000_000;

        ctl.run(CancellationToken::new()).await;
        ctl.save_info().await.unwrap();

        let records = harness.infos.list_by_workflow("wf").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "succeeded");
        assert_eq!(records[0].task_id, 9);
        assert_eq!(records[0].duration, ctl.job().end_time - 1_700_000_000);
    }

    #[test]
    fn test_key_vals_to_map() {
        let map = key_vals_to_map(&[
            KeyVal::new("team", "platform"),
            KeyVal::new("tier", 2),
            KeyVal::new("canary", true),
        ])
        .unwrap();
        assert_eq!(map["tier"], "2");
        assert_eq!(map["canary"], "true");
        assert!(key_vals_to_map(&[KeyVal::new("x", json!({"a": 1}))]).is_err());
    }
}
