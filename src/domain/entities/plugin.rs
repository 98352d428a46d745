//! Plugin job spec
//!
//! Declares how a plugin step runs: the container it runs in, the resource
//! tier it is scheduled with, the cluster it targets and the registries its
//! image is pulled from.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{AppError, Result};

/// Timeout applied to jobs that leave it unset or non-positive, in minutes
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 600;
/// Upper bound on a job timeout, in minutes (30 days)
pub const MAX_TIMEOUT_MINUTES: i64 = 30 * 24 * 60;
/// Cluster ID of the cluster the controller itself runs in
pub const LOCAL_CLUSTER_ID: &str = "local";
/// Namespace jobs run in on attached (non-local) clusters
pub const ATTACHED_CLUSTER_NAMESPACE: &str = "rustci-agent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginJobSpec {
    #[serde(default)]
    pub properties: JobProperties,
    pub plugin: PluginTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProperties {
    /// Timeout in minutes
    #[serde(default)]
    pub timeout: i64,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub resource_request: Option<ResourceRequest>,
    #[serde(default)]
    pub res_req_spec: ResourceRequestSpec,
    #[serde(default)]
    pub cluster_id: String,
    /// Derived from the cluster during submission
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub registries: Vec<RegistryNamespace>,
    #[serde(default)]
    pub custom_labels: Vec<KeyVal>,
    #[serde(default)]
    pub custom_annotations: Vec<KeyVal>,
    #[serde(default)]
    pub envs: Vec<KeyVal>,
}

impl JobProperties {
    /// Fill timeout, resource tier and cluster defaults. Idempotent.
    pub fn apply_defaults(&mut self) {
        if self.timeout <= 0 {
            self.timeout = DEFAULT_TIMEOUT_MINUTES;
        }
        self.timeout = self.timeout.min(MAX_TIMEOUT_MINUTES);
        if self.resource_request.is_none() {
            self.resource_request = Some(ResourceRequest::Min);
        }
        if self.cluster_id.is_empty() {
            self.cluster_id = LOCAL_CLUSTER_ID.to_string();
        }
    }

    /// Timeout in seconds, never less than one minute
    pub fn timeout_seconds(&self) -> i64 {
        self.timeout.clamp(1, MAX_TIMEOUT_MINUTES).saturating_mul(60)
    }

    pub fn is_local_cluster(&self) -> bool {
        self.cluster_id == LOCAL_CLUSTER_ID
    }
}

fn empty_string_as_none<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<ResourceRequest>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(value) => ResourceRequest::deserialize(serde_json::Value::String(value.to_string()))
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Named resource tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceRequest {
    High,
    Medium,
    Low,
    Min,
    /// Limits taken from `ResourceRequestSpec`
    Define,
}

/// User supplied limits for the `define` tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequestSpec {
    /// Millicores
    #[serde(default)]
    pub cpu_limit: u32,
    /// MiB
    #[serde(default)]
    pub memory_limit: u32,
}

/// Concrete CPU (millicores) and memory (MiB) limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_millis: u32,
    pub memory_mib: u32,
}

impl ResourceLimits {
    /// Requests are a quarter of the limits
    pub fn requests(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_millis: (self.cpu_millis / 4).max(1),
            memory_mib: (self.memory_mib / 4).max(1),
        }
    }
}

impl ResourceRequest {
    pub fn limits(&self, spec: &ResourceRequestSpec) -> Result<ResourceLimits> {
        let limits = match self {
            ResourceRequest::High => ResourceLimits {
                cpu_millis: 16000,
                memory_mib: 32768,
            },
            ResourceRequest::Medium => ResourceLimits {
                cpu_millis: 8000,
                memory_mib: 16384,
            },
            ResourceRequest::Low => ResourceLimits {
                cpu_millis: 4000,
                memory_mib: 8192,
            },
            ResourceRequest::Min => ResourceLimits {
                cpu_millis: 2000,
                memory_mib: 2048,
            },
            ResourceRequest::Define => {
                if spec.cpu_limit == 0 || spec.memory_limit == 0 {
                    return Err(AppError::ValidationError(
                        "define resource tier requires cpu_limit and memory_limit".to_string(),
                    ));
                }
                ResourceLimits {
                    cpu_millis: spec.cpu_limit,
                    memory_mib: spec.memory_limit,
                }
            }
        };
        Ok(limits)
    }
}

/// Image registry credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryNamespace {
    #[serde(default)]
    pub id: String,
    pub reg_addr: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Typed key/value pair as submitted by the workflow editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyVal {
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl KeyVal {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Render the value as a string; only scalar values are accepted
    pub fn value_string(&self) -> Result<String> {
        match &self.value {
            serde_json::Value::String(s) => Ok(s.clone()),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::Bool(b) => Ok(b.to_string()),
            serde_json::Value::Null => Ok(String::new()),
            other => Err(AppError::ValidationError(format!(
                "value of '{}' must be a scalar, got {}",
                self.key, other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmds: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<KeyVal>,
    #[serde(default)]
    pub inputs: Vec<PluginInput>,
    #[serde(default)]
    pub outputs: Vec<PluginOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInput {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOutput {
    pub name: String,
    #[serde(default)]
    pub description: String,
}
