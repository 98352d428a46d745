//! Cluster client resolution
//!
//! A cluster ID resolves to a pair of kube clients: a typed client used for
//! writes and a reader used for status polling. Controllers only ever see
//! the pair through the `ClusterOps` trait, which keeps them testable
//! against an in-memory cluster.

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::entities::LOCAL_CLUSTER_ID;
use crate::error::{AppError, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "rustci-jobctl";

/// Cluster operations needed to run and observe a job
#[async_trait]
pub trait ClusterOps: Send + Sync {
    fn cluster_id(&self) -> &str;

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>>;

    /// Delete every job matching `selector`. A job stays listed until its
    /// pods are gone.
    async fn delete_jobs(&self, namespace: &str, selector: &str) -> Result<()>;

    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn pod_logs(&self, namespace: &str, pod: &str, container: Option<&str>) -> Result<String>;

    /// Create or update a secret
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;
}

/// Resolves a cluster ID to live cluster operations
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    async fn resolve(&self, cluster_id: &str) -> Result<Arc<dyn ClusterOps>>;
}

/// Typed client and raw API reader for one cluster
#[derive(Clone)]
pub struct ClusterClients {
    pub client: Client,
    pub api_reader: Client,
}

impl ClusterClients {
    pub fn from_client(client: Client) -> Self {
        Self {
            api_reader: client.clone(),
            client,
        }
    }
}

/// `ClusterOps` backed by kube-rs
pub struct KubeClusterOps {
    cluster_id: String,
    clients: ClusterClients,
}

impl KubeClusterOps {
    pub fn new(cluster_id: impl Into<String>, clients: ClusterClients) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            clients,
        }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.clients.client.clone(), namespace)
    }

    fn job_reader(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.clients.api_reader.clone(), namespace)
    }

    fn pod_reader(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.clients.api_reader.clone(), namespace)
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>> {
        let list = self
            .job_reader(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_jobs(&self, namespace: &str, selector: &str) -> Result<()> {
        self.jobs(namespace)
            .delete_collection(
                &DeleteParams::foreground(),
                &ListParams::default().labels(selector),
            )
            .await?;
        debug!(namespace = %namespace, selector = %selector, "Deleted jobs by label");
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let namespace = job.metadata.namespace.as_deref().ok_or_else(|| {
            AppError::ValidationError("job manifest has no namespace".to_string())
        })?;
        self.jobs(namespace)
            .create(&PostParams::default(), job)
            .await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.job_reader(namespace).get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pod_reader(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<String> {
        let params = LogParams {
            container: container.map(str::to_string),
            ..Default::default()
        };
        Ok(self.pod_reader(namespace).logs(pod, &params).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| AppError::ValidationError("secret has no name".to_string()))?;
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| AppError::ValidationError("secret has no namespace".to_string()))?;

        let api: Api<Secret> = Api::namespaced(self.clients.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }
}

/// Resolves the local cluster from the ambient kubeconfig (or in-cluster
/// config) and attached clusters from `<kubeconfig_dir>/<cluster id>.yaml`.
pub struct KubeClusterResolver {
    kubeconfig_dir: PathBuf,
    cache: DashMap<String, Arc<dyn ClusterOps>>,
}

impl KubeClusterResolver {
    pub fn new(kubeconfig_dir: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig_dir: kubeconfig_dir.into(),
            cache: DashMap::new(),
        }
    }

    fn kubeconfig_path(&self, cluster_id: &str) -> PathBuf {
        self.kubeconfig_dir.join(format!("{}.yaml", cluster_id))
    }

    async fn connect(&self, cluster_id: &str) -> Result<Client> {
        let unavailable = |reason: String| AppError::ClusterUnavailable {
            cluster_id: cluster_id.to_string(),
            reason,
        };

        if cluster_id == LOCAL_CLUSTER_ID {
            return Client::try_default()
                .await
                .map_err(|e| unavailable(format!("failed to create client: {}", e)));
        }

        let path = self.kubeconfig_path(cluster_id);
        let kubeconfig = Kubeconfig::read_from(&path)
            .map_err(|e| unavailable(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| unavailable(format!("invalid kubeconfig: {}", e)))?;
        Client::try_from(config).map_err(|e| unavailable(format!("failed to create client: {}", e)))
    }
}

#[async_trait]
impl ClusterResolver for KubeClusterResolver {
    async fn resolve(&self, cluster_id: &str) -> Result<Arc<dyn ClusterOps>> {
        if let Some(ops) = self.cache.get(cluster_id) {
            return Ok(ops.value().clone());
        }

        let client = self.connect(cluster_id).await?;
        let ops: Arc<dyn ClusterOps> = Arc::new(KubeClusterOps::new(
            cluster_id,
            ClusterClients::from_client(client),
        ));
        self.cache.insert(cluster_id.to_string(), ops.clone());
        info!(cluster = %cluster_id, "🔌 Connected to cluster");
        Ok(ops)
    }
}
