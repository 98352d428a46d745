use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared context of one workflow run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTaskCtx {
    pub workflow_name: String,
    #[serde(default)]
    pub workflow_display_name: String,
    pub task_id: i64,
    #[serde(default)]
    pub project_name: String,
    /// Values shared between jobs of the run, e.g. job outputs
    #[serde(skip)]
    global_context: Arc<DashMap<String, String>>,
}

impl WorkflowTaskCtx {
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_display_name: impl Into<String>,
        task_id: i64,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            workflow_display_name: workflow_display_name.into(),
            task_id,
            project_name: project_name.into(),
            global_context: Arc::new(DashMap::new()),
        }
    }

    pub fn global_context_set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.global_context.insert(key.into(), value.into());
    }

    pub fn global_context_get(&self, key: &str) -> Option<String> {
        self.global_context.get(key).map(|v| v.value().clone())
    }

    pub fn global_context_len(&self) -> usize {
        self.global_context.len()
    }

    pub fn global_context_snapshot(&self) -> BTreeMap<String, String> {
        self.global_context
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Global context key under which a job output is published
pub fn job_output_key(job_key: &str, output_name: &str) -> String {
    format!("{{{{.job.{}.output.{}}}}}", job_key, output_name)
}
