use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobSpec, JobStatus as K8sJobStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec,
    PodStatus, PodTemplateSpec, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::domain::entities::JobLabel;
use crate::error::{AppError, Result};
use crate::infrastructure::kubernetes::{ClusterOps, ClusterResolver};

/// How a started job ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodOutcome {
    Succeeded,
    Failed,
    /// Keeps running forever
    Hang,
}

#[derive(Debug, Clone)]
struct Behavior {
    start_after_polls: Option<u32>,
    run_for_polls: u32,
    outcome: PodOutcome,
    termination_message: Option<String>,
    logs: String,
    fail_resolve: bool,
    fail_create: bool,
    fail_secrets: bool,
    fail_logs: bool,
    fail_get_job_polls: u32,
    stuck_delete: bool,
    conditions_only: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            start_after_polls: Some(1),
            run_for_polls: 1,
            outcome: PodOutcome::Succeeded,
            termination_message: None,
            logs: String::new(),
            fail_resolve: false,
            fail_create: false,
            fail_secrets: false,
            fail_logs: false,
            fail_get_job_polls: 0,
            stuck_delete: false,
            conditions_only: false,
        }
    }
}

struct FakeJob {
    job: Job,
    polls: u32,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<(String, String), FakeJob>,
    secrets: BTreeMap<(String, String), Secret>,
    submitted: Vec<Job>,
    resolved: Vec<String>,
    /// Pods whose job is gone, with their logs
    stale_pods: Vec<(Pod, String)>,
    get_job_calls: u32,
}

/// In-memory cluster for exercising job controllers.
///
/// A job's pod starts on the `start_after_polls`-th status read and ends
/// `run_for_polls` reads later with the configured outcome. Clones share
/// the same cluster state. Every job gets a fresh UID when it enters the
/// cluster and its pod is owned by that UID.
#[derive(Clone)]
pub struct FakeCluster {
    cluster_id: String,
    behavior: Behavior,
    state: Arc<Mutex<State>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            cluster_id: "fake".to_string(),
            behavior: Behavior::default(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn start_after_polls(mut self, polls: u32) -> Self {
        self.behavior.start_after_polls = Some(polls);
        self
    }

    pub fn never_start(mut self) -> Self {
        self.behavior.start_after_polls = None;
        self
    }

    pub fn run_for_polls(mut self, polls: u32) -> Self {
        self.behavior.run_for_polls = polls;
        self
    }

    pub fn outcome(mut self, outcome: PodOutcome) -> Self {
        self.behavior.outcome = outcome;
        self
    }

    pub fn termination_message(mut self, message: impl Into<String>) -> Self {
        self.behavior.termination_message = Some(message.into());
        self
    }

    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.behavior.logs = logs.into();
        self
    }

    pub fn fail_resolve(mut self) -> Self {
        self.behavior.fail_resolve = true;
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.behavior.fail_create = true;
        self
    }

    pub fn fail_secrets(mut self) -> Self {
        self.behavior.fail_secrets = true;
        self
    }

    pub fn fail_logs(mut self) -> Self {
        self.behavior.fail_logs = true;
        self
    }

    /// Fail the first `polls` status reads with an API error
    pub fn fail_get_job_polls(mut self, polls: u32) -> Self {
        self.behavior.fail_get_job_polls = polls;
        self
    }

    /// Accept deletions but never remove anything
    pub fn stuck_delete(mut self) -> Self {
        self.behavior.stuck_delete = true;
        self
    }

    /// Report finished jobs through conditions only, without pod counts
    pub fn conditions_only(mut self) -> Self {
        self.behavior.conditions_only = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Minimal job manifest carrying `label`
    pub fn job_manifest(&self, namespace: &str, label: &JobLabel) -> Job {
        let labels = label.labels();
        Job {
            metadata: ObjectMeta {
                name: Some(label.job_name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: label.job_name.clone(),
                            image: Some("busybox".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Place a job in the cluster without going through `create_job`
    pub fn insert_job(&self, job: Job) {
        let key = job_key(&job);
        self.state().jobs.insert(
            key,
            FakeJob {
                job: with_uid(job),
                polls: 0,
            },
        );
    }

    /// Leave behind a terminated pod of an earlier, already deleted job
    /// carrying `label`
    pub fn leave_stale_pod(
        &self,
        namespace: &str,
        label: &JobLabel,
        termination_message: &str,
        logs: &str,
    ) {
        let owner = job_owner(&label.job_name, &Uuid::new_v4().to_string());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-stale", label.job_name)),
                namespace: Some(namespace.to_string()),
                labels: Some(label.labels()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: label.job_name.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: label.job_name.clone(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            message: Some(termination_message.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        self.state().stale_pods.push((pod, logs.to_string()));
    }

    /// Names of the jobs currently in the cluster
    pub fn job_names(&self) -> Vec<String> {
        self.state().jobs.keys().map(|(_, name)| name.clone()).collect()
    }

    /// Every manifest accepted by `create_job`, in order
    pub fn submitted_jobs(&self) -> Vec<Job> {
        self.state().submitted.clone()
    }

    pub fn secrets(&self) -> Vec<Secret> {
        self.state().secrets.values().cloned().collect()
    }

    /// Cluster IDs passed to `resolve`, in order
    pub fn resolved_clusters(&self) -> Vec<String> {
        self.state().resolved.clone()
    }

    fn phase(&self, polls: u32) -> Phase {
        let Some(start) = self.behavior.start_after_polls else {
            return Phase::Pending;
        };
        if polls < start {
            Phase::Pending
        } else if polls < start + self.behavior.run_for_polls {
            Phase::Running
        } else {
            match self.behavior.outcome {
                PodOutcome::Succeeded => Phase::Succeeded,
                PodOutcome::Failed => Phase::Failed,
                PodOutcome::Hang => Phase::Running,
            }
        }
    }

    fn with_status(&self, fake: &FakeJob) -> Job {
        let mut job = fake.job.clone();
        let conditions_only = self.behavior.conditions_only;
        let status = match self.phase(fake.polls) {
            Phase::Pending => K8sJobStatus::default(),
            Phase::Running => K8sJobStatus {
                active: Some(1),
                ..Default::default()
            },
            Phase::Succeeded if conditions_only => K8sJobStatus {
                conditions: Some(vec![condition("Complete", None)]),
                ..Default::default()
            },
            Phase::Succeeded => K8sJobStatus {
                succeeded: Some(1),
                ..Default::default()
            },
            Phase::Failed if conditions_only => K8sJobStatus {
                conditions: Some(vec![condition("Failed", Some("DeadlineExceeded"))]),
                ..Default::default()
            },
            Phase::Failed => K8sJobStatus {
                failed: Some(1),
                ..Default::default()
            },
        };
        job.status = Some(status);
        job
    }

    fn pod_for(&self, fake: &FakeJob) -> Option<Pod> {
        let phase = self.phase(fake.polls);
        if phase == Phase::Pending {
            return None;
        }
        let name = fake.job.metadata.name.clone().unwrap_or_default();
        let uid = fake.job.metadata.uid.clone().unwrap_or_default();
        let template = fake.job.spec.as_ref().map(|spec| spec.template.clone());
        let labels = template
            .as_ref()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone());
        let pod_spec = template.and_then(|t| t.spec);
        let container_name = pod_spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .map(|c| c.name.clone())
            .unwrap_or_else(|| name.clone());

        let state = match phase {
            Phase::Succeeded | Phase::Failed => ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: if phase == Phase::Succeeded { 0 } else { 1 },
                    message: self.behavior.termination_message.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            _ => ContainerState::default(),
        };

        Some(Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-pod", name)),
                namespace: fake.job.metadata.namespace.clone(),
                labels,
                owner_references: Some(vec![job_owner(&name, &uid)]),
                ..Default::default()
            },
            spec: pod_spec,
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: container_name,
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

fn job_key(job: &Job) -> (String, String) {
    (
        job.metadata.namespace.clone().unwrap_or_default(),
        job.metadata.name.clone().unwrap_or_default(),
    )
}

fn with_uid(mut job: Job) -> Job {
    job.metadata
        .uid
        .get_or_insert_with(|| Uuid::new_v4().to_string());
    job
}

fn job_owner(job_name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        name: job_name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        ..Default::default()
    }
}

fn condition(type_: &str, reason: Option<&str>) -> JobCondition {
    JobCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: reason.map(str::to_string),
        ..Default::default()
    }
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                labels.and_then(|l| l.get(key)).map(String::as_str) == Some(value)
            }
            None => false,
        })
}

#[async_trait]
impl ClusterOps for FakeCluster {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>> {
        let state = self.state();
        Ok(state
            .jobs
            .iter()
            .filter(|((ns, _), fake)| {
                ns == namespace && matches_selector(fake.job.metadata.labels.as_ref(), selector)
            })
            .map(|(_, fake)| self.with_status(fake))
            .collect())
    }

    async fn delete_jobs(&self, namespace: &str, selector: &str) -> Result<()> {
        if self.behavior.stuck_delete {
            return Ok(());
        }
        self.state().jobs.retain(|(ns, _), fake| {
            ns != namespace || !matches_selector(fake.job.metadata.labels.as_ref(), selector)
        });
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        if self.behavior.fail_create {
            return Err(AppError::KubernetesError("create job rejected".to_string()));
        }
        if job.metadata.namespace.is_none() {
            return Err(AppError::ValidationError("job manifest has no namespace".to_string()));
        }
        let key = job_key(job);
        let mut state = self.state();
        if state.jobs.contains_key(&key) {
            return Err(AppError::KubernetesError(format!(
                "jobs.batch \"{}\" already exists",
                key.1
            )));
        }
        state.submitted.push(job.clone());
        state.jobs.insert(
            key,
            FakeJob {
                job: with_uid(job.clone()),
                polls: 0,
            },
        );
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let mut state = self.state();
        state.get_job_calls += 1;
        if state.get_job_calls <= self.behavior.fail_get_job_polls {
            return Err(AppError::KubernetesError(
                "the server is currently unable to handle the request".to_string(),
            ));
        }
        let key = (namespace.to_string(), name.to_string());
        Ok(state.jobs.get_mut(&key).map(|fake| {
            fake.polls += 1;
            self.with_status(fake)
        }))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let state = self.state();
        let stale = state.stale_pods.iter().map(|(pod, _)| pod.clone());
        let live = state
            .jobs
            .iter()
            .filter_map(|(_, fake)| self.pod_for(fake));
        Ok(stale
            .chain(live)
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| matches_selector(pod.metadata.labels.as_ref(), selector))
            .collect())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        _container: Option<&str>,
    ) -> Result<String> {
        if self.behavior.fail_logs {
            return Err(AppError::KubernetesError(format!(
                "logs unavailable for pod {}",
                pod
            )));
        }
        let state = self.state();
        let stale = state
            .stale_pods
            .iter()
            .find(|(stale, _)| stale.metadata.name.as_deref() == Some(pod));
        Ok(match stale {
            Some((_, logs)) => logs.clone(),
            None => self.behavior.logs.clone(),
        })
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        if self.behavior.fail_secrets {
            return Err(AppError::KubernetesError("secret apply rejected".to_string()));
        }
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.state().secrets.insert(key, secret.clone());
        Ok(())
    }
}

#[async_trait]
impl ClusterResolver for FakeCluster {
    async fn resolve(&self, cluster_id: &str) -> Result<Arc<dyn ClusterOps>> {
        self.state().resolved.push(cluster_id.to_string());
        if self.behavior.fail_resolve {
            return Err(AppError::ClusterUnavailable {
                cluster_id: cluster_id.to_string(),
                reason: "cluster is not connected".to_string(),
            });
        }
        Ok(Arc::new(self.clone()))
    }
}
