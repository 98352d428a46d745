#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use rustci_jobctl::ci::{new_job_ctl, AckFn, JobCtl, JobCtlEnv, JobCtlSettings};
use rustci_jobctl::domain::entities::{JobTask, JobType, WorkflowTaskCtx};
use rustci_jobctl::infrastructure::repositories::InMemoryJobInfoStore;
use rustci_jobctl::infrastructure::storage::MemoryLogStore;
use rustci_jobctl::testing::FakeCluster;

/// Builder for plugin job task specs
pub struct PluginSpecBuilder {
    properties: Value,
    plugin: Value,
}

impl PluginSpecBuilder {
    pub fn new(image: &str) -> Self {
        Self {
            properties: json!({}),
            plugin: json!({ "name": "step", "image": image }),
        }
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties[key] = value;
        self
    }

    pub fn with_plugin_field(mut self, key: &str, value: Value) -> Self {
        self.plugin[key] = value;
        self
    }

    pub fn build(self) -> Value {
        json!({ "properties": self.properties, "plugin": self.plugin })
    }
}

/// A fake cluster plus every collaborator a controller needs
pub struct TestEnvironment {
    pub cluster: FakeCluster,
    pub logs: Arc<MemoryLogStore>,
    pub infos: Arc<InMemoryJobInfoStore>,
    pub cleaned: Arc<Notify>,
    pub acks: Arc<AtomicUsize>,
    pub workflow_ctx: WorkflowTaskCtx,
}

impl TestEnvironment {
    pub fn new(cluster: FakeCluster) -> Self {
        Self {
            cluster,
            logs: Arc::new(MemoryLogStore::new()),
            infos: Arc::new(InMemoryJobInfoStore::new()),
            cleaned: Arc::new(Notify::new()),
            acks: Arc::new(AtomicUsize::new(0)),
            workflow_ctx: WorkflowTaskCtx::new("release", "Release", 42, "shop"),
        }
    }

    pub fn env(&self) -> JobCtlEnv {
        JobCtlEnv::new(
            Arc::new(self.cluster.clone()),
            self.logs.clone(),
            self.infos.clone(),
            JobCtlSettings {
                namespace: "rustci".to_string(),
                poll_interval: Duration::from_millis(200),
                delete_timeout: Duration::from_secs(10),
            },
        )
        .with_cleanup_hook(self.cleaned.clone())
    }

    pub fn controller(&self, key: &str, spec: Value) -> Box<dyn JobCtl> {
        let job = JobTask::new(key, JobType::Plugin, &self.workflow_ctx.workflow_name)
            .with_spec(spec);
        self.controller_for(job)
    }

    /// Controller for an existing task, e.g. a retried one
    pub fn controller_for(&self, job: JobTask) -> Box<dyn JobCtl> {
        let acks = self.acks.clone();
        let ack: AckFn = Arc::new(move |_: &JobTask| {
            acks.fetch_add(1, Ordering::SeqCst);
        });
        new_job_ctl(job, self.workflow_ctx.clone(), ack, self.env())
            .expect("plugin spec should decode")
    }

    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}
