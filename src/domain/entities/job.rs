//! Job task entities
//!
//! A `JobTask` is the unit a job controller executes. Its spec payload is
//! kept as raw JSON on the task and decoded into a `JobTaskSpec` keyed by
//! the task's `JobType`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::plugin::PluginJobSpec;
use crate::error::{AppError, Result};

/// Label key carrying the job type
pub const JOB_LABEL_TYPE_KEY: &str = "s-type";
/// Label key carrying the cluster job name
pub const JOB_LABEL_NAME_KEY: &str = "s-job";

const K8S_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Plugin,
    Freestyle,
    Build,
    Deploy,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Plugin => "plugin",
            JobType::Freestyle => "freestyle",
            JobType::Build => "build",
            JobType::Deploy => "deploy",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a job task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution unit of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    /// Job key inside the workflow, used to namespace outputs
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub k8s_job_name: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw spec payload, shaped according to `job_type`
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl JobTask {
    /// Create a pending task with a freshly generated cluster job name
    pub fn new(key: impl Into<String>, job_type: JobType, workflow_name: &str) -> Self {
        let key = key.into();
        let k8s_job_name = generate_k8s_job_name(workflow_name, &key);
        Self {
            name: key.clone(),
            key,
            job_type,
            k8s_job_name,
            status: JobStatus::Pending,
            start_time: 0,
            end_time: 0,
            error: None,
            spec: serde_json::Value::Null,
        }
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn label(&self) -> JobLabel {
        JobLabel::new(self.job_type, &self.k8s_job_name)
    }

    /// Record an error unless an earlier one is already on the task
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }
}

/// Generate a DNS-1123 compliant, per-task unique cluster job name
pub fn generate_k8s_job_name(workflow_name: &str, job_key: &str) -> String {
    let suffix = &Uuid::new_v4().simple().to_string()[..6];
    let base: String = format!("{}-{}", workflow_name, job_key)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let max_base = K8S_NAME_MAX_LEN - suffix.len() - 1;
    let base: String = base.chars().take(max_base).collect();
    let base = base.trim_matches('-');
    if base.is_empty() {
        format!("job-{}", suffix)
    } else {
        format!("{}-{}", base, suffix)
    }
}

/// Sanitize a string for use as a Kubernetes label value
pub fn sanitize_label_value(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(K8S_NAME_MAX_LEN)
        .collect::<String>()
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Stable (job type, job name) key used to find and delete cluster jobs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobLabel {
    pub job_type: JobType,
    pub job_name: String,
}

impl JobLabel {
    pub fn new(job_type: JobType, job_name: impl Into<String>) -> Self {
        Self {
            job_type,
            job_name: job_name.into(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                JOB_LABEL_TYPE_KEY.to_string(),
                self.job_type.as_str().to_string(),
            ),
            (
                JOB_LABEL_NAME_KEY.to_string(),
                sanitize_label_value(&self.job_name.replace('_', "-")),
            ),
        ])
    }

    /// Equality label selector matching every object carrying these labels
    pub fn selector(&self) -> String {
        self.labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether an object's labels carry this job label
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(labels) = labels else {
            return false;
        };
        self.labels()
            .iter()
            .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}

/// Structured output written by a job into its termination message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub name: String,
    pub value: String,
}

/// Spec payload decoded according to the job type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobTaskSpec {
    Plugin(PluginJobSpec),
}

impl JobTaskSpec {
    pub fn decode(job_type: JobType, raw: &serde_json::Value) -> Result<Self> {
        match job_type {
            JobType::Plugin => serde_json::from_value::<PluginJobSpec>(raw.clone())
                .map(JobTaskSpec::Plugin)
                .map_err(|source| AppError::SpecDecode { job_type, source }),
            other => Err(AppError::UnsupportedJobType(other)),
        }
    }
}
