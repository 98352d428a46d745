//! Kubernetes Job manifest generation for plugin steps

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::debug;

use super::registry::registry_secret_name;
use crate::domain::entities::{
    JobTask, KeyVal, PluginJobSpec, ResourceLimits, ResourceRequest, ResourceRequestSpec,
    WorkflowTaskCtx,
};
use crate::error::{AppError, Result};

pub const TERMINATION_MESSAGE_PATH: &str = "/dev/termination-log";
const TTL_SECONDS_AFTER_FINISHED: i32 = 300;

/// Build the Job manifest that runs a plugin step
#[allow(clippy::too_many_arguments)]
pub fn build_plain_job(
    name: &str,
    resource_request: ResourceRequest,
    res_req_spec: &ResourceRequestSpec,
    task: &JobTask,
    spec: &PluginJobSpec,
    workflow_ctx: &WorkflowTaskCtx,
    custom_labels: &BTreeMap<String, String>,
    custom_annotations: &BTreeMap<String, String>,
) -> Result<Job> {
    debug!(job = %name, "🏗️ Building plugin job manifest");

    if spec.plugin.image.trim().is_empty() {
        return Err(AppError::ValidationError(format!(
            "plugin job {} requires an image",
            task.key
        )));
    }

    let limits = resource_request.limits(res_req_spec)?;

    let mut labels = custom_labels.clone();
    labels.extend(task.label().labels());

    let inputs: BTreeMap<&str, &str> = spec
        .plugin
        .inputs
        .iter()
        .map(|input| (input.name.as_str(), input.value.as_str()))
        .collect();

    let container = Container {
        name: name.to_string(),
        image: Some(spec.plugin.image.clone()),
        command: non_empty(render_all(&spec.plugin.cmds, &inputs)),
        args: non_empty(render_all(&spec.plugin.args, &inputs)),
        env: Some(build_env(name, spec, workflow_ctx, &inputs)?),
        resources: Some(build_resources(limits)),
        termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
        termination_message_policy: Some("File".to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..Default::default()
    };

    let image_pull_secrets: Vec<LocalObjectReference> = spec
        .properties
        .registries
        .iter()
        .map(|registry| LocalObjectReference {
            name: Some(registry_secret_name(registry)),
        })
        .collect();

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            annotations: non_empty_map(custom_annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            image_pull_secrets: non_empty(image_pull_secrets),
            ..Default::default()
        }),
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: non_empty_string(&spec.properties.namespace),
            labels: Some(labels),
            annotations: non_empty_map(custom_annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template,
            completions: Some(1),
            parallelism: Some(1),
            backoff_limit: Some(0),
            active_deadline_seconds: Some(spec.properties.timeout_seconds()),
            ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(job)
}

fn build_env(
    name: &str,
    spec: &PluginJobSpec,
    workflow_ctx: &WorkflowTaskCtx,
    inputs: &BTreeMap<&str, &str>,
) -> Result<Vec<EnvVar>> {
    let mut env = vec![
        env_var("WORKFLOW", &workflow_ctx.workflow_name),
        env_var("TASK_ID", &workflow_ctx.task_id.to_string()),
        env_var("PROJECT", &workflow_ctx.project_name),
        env_var("JOB_NAME", name),
    ];

    for kv in spec.properties.envs.iter().chain(spec.plugin.envs.iter()) {
        env.push(env_from_key_val(kv, inputs)?);
    }
    Ok(env)
}

fn env_from_key_val(kv: &KeyVal, inputs: &BTreeMap<&str, &str>) -> Result<EnvVar> {
    if kv.key.is_empty() {
        return Err(AppError::ValidationError(
            "environment variable name must not be empty".to_string(),
        ));
    }
    Ok(env_var(&kv.key, &render_inputs(&kv.value_string()?, inputs)))
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn build_resources(limits: ResourceLimits) -> ResourceRequirements {
    let requests = limits.requests();
    ResourceRequirements {
        limits: Some(quantities(limits)),
        requests: Some(quantities(requests)),
        ..Default::default()
    }
}

fn quantities(limits: ResourceLimits) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{}m", limits.cpu_millis))),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", limits.memory_mib)),
        ),
    ])
}

/// Replace `$(inputs.<name>)` references with the declared input values
pub fn render_inputs(template: &str, inputs: &BTreeMap<&str, &str>) -> String {
    let mut rendered = template.to_string();
    for (name, value) in inputs {
        rendered = rendered.replace(&format!("$(inputs.{})", name), value);
    }
    rendered
}

fn render_all(items: &[String], inputs: &BTreeMap<&str, &str>) -> Vec<String> {
    items.iter().map(|item| render_inputs(item, inputs)).collect()
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

fn non_empty_string(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{
        JobProperties, JobType, PluginInput, PluginTemplate, RegistryNamespace,
    };

    fn plugin_spec() -> PluginJobSpec {
        PluginJobSpec {
            properties: JobProperties {
                timeout: 10,
                resource_request: Some(ResourceRequest::Low),
                namespace: "rustci".to_string(),
                envs: vec![KeyVal::new("LEVEL", 3)],
                registries: vec![RegistryNamespace {
                    id: "reg1".to_string(),
                    reg_addr: "registry.example.com".to_string(),
                    namespace: "team".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            plugin: PluginTemplate {
                name: "notify".to_string(),
                image: "registry.example.com/team/notify:1.0".to_string(),
                args: vec!["--channel".to_string(), "$(inputs.channel)".to_string()],
                envs: vec![KeyVal::new("TARGET", "$(inputs.channel)")],
                inputs: vec![PluginInput {
                    name: "channel".to_string(),
                    value: "#builds".to_string(),
                    description: String::new(),
                }],
                ..Default::default()
            },
        }
    }

    fn build(spec: &PluginJobSpec, labels: &BTreeMap<String, String>) -> Result<Job> {
        let task = JobTask::new("notify", JobType::Plugin, "wf");
        let ctx = WorkflowTaskCtx::new("wf", "Workflow", 12, "demo");
        build_plain_job(
            &task.k8s_job_name,
            spec.properties.resource_request.unwrap_or(ResourceRequest::Min),
            &spec.properties.res_req_spec,
            &task,
            spec,
            &ctx,
            labels,
            &BTreeMap::new(),
        )
    }

    #[test]
    fn test_build_plain_job() {
        let spec = plugin_spec();
        let job = build(&spec, &BTreeMap::new()).unwrap();

        assert_eq!(job.metadata.namespace.as_deref(), Some("rustci"));
        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.backoff_limit, Some(0));
        assert_eq!(job_spec.active_deadline_seconds, Some(600));

        let pod = job_spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.image_pull_secrets.as_ref().unwrap()[0].name.as_deref(),
            Some("reg1-registry-secret")
        );

        let container = &pod.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["--channel".to_string(), "#builds".to_string()]
        );
        assert!(container.command.is_none());
        assert_eq!(
            container.termination_message_path.as_deref(),
            Some(TERMINATION_MESSAGE_PATH)
        );

        let env = container.env.as_ref().unwrap();
        let value_of = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(value_of("TASK_ID").as_deref(), Some("12"));
        assert_eq!(value_of("LEVEL").as_deref(), Some("3"));
        assert_eq!(value_of("TARGET").as_deref(), Some("#builds"));

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("4000m".to_string()));
        assert_eq!(limits["memory"], Quantity("8192Mi".to_string()));
    }

    #[test]
    fn test_job_label_overrides_custom_labels() {
        let spec = plugin_spec();
        let custom = BTreeMap::from([
            ("team".to_string(), "platform".to_string()),
            ("s-type".to_string(), "spoofed".to_string()),
        ]);
        let job = build(&spec, &custom).unwrap();
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels["team"], "platform");
        assert_eq!(labels["s-type"], "plugin");
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let mut spec = plugin_spec();
        spec.plugin.image = " ".to_string();
        assert!(matches!(
            build(&spec, &BTreeMap::new()),
            Err(AppError::ValidationError(_))
        ));
    }

    #[test]
    fn test_render_inputs_leaves_unknown_references() {
        let inputs = BTreeMap::from([("a", "1")]);
        assert_eq!(render_inputs("$(inputs.a)-$(inputs.b)", &inputs), "1-$(inputs.b)");
    }
}
