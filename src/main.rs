use anyhow::{bail, Context};
use dotenv::dotenv;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustci_jobctl::ci::{new_job_ctl, AckFn, JobCtlEnv, JobCtlSettings};
use rustci_jobctl::config::AppConfig;
use rustci_jobctl::domain::entities::{JobStatus, JobTask, JobType, WorkflowTaskCtx};
use rustci_jobctl::domain::repositories::JobInfoStore;
use rustci_jobctl::infrastructure::database::DatabaseManager;
use rustci_jobctl::infrastructure::kubernetes::KubeClusterResolver;
use rustci_jobctl::infrastructure::repositories::{InMemoryJobInfoStore, MongoJobInfoRepository};
use rustci_jobctl::infrastructure::storage::FileLogStore;
use rustci_jobctl::services::{AesGcmEncryptionService, HookSecret};

/// A single job task of a workflow run, as read from a YAML or JSON file
#[derive(Debug, Deserialize)]
struct TaskFile {
    workflow: WorkflowTaskCtx,
    job: JobDefinition,
}

#[derive(Debug, Deserialize)]
struct JobDefinition {
    key: String,
    #[serde(rename = "type")]
    job_type: JobType,
    spec: serde_json::Value,
}

async fn job_info_store(config: &AppConfig) -> anyhow::Result<Arc<dyn JobInfoStore>> {
    match &config.mongodb_uri {
        Some(uri) => {
            let db = DatabaseManager::new(uri, &config.mongodb_database).await?;
            Ok(Arc::new(MongoJobInfoRepository::new(db.get_database()).await?))
        }
        None => {
            warn!("MONGODB_URI not set, job info is kept in memory");
            Ok(Arc::new(InMemoryJobInfoStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: rustci-jobctl <task file>")?;

    let config = AppConfig::from_env()?;

    if let Some(encryption) = AesGcmEncryptionService::from_config(&config)? {
        let hook_secret = HookSecret::new(&encryption)?;
        info!(secret = ?hook_secret, "🔐 Hook secret initialized");
    }

    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let task: TaskFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let env = JobCtlEnv::new(
        Arc::new(KubeClusterResolver::new(&config.kubeconfig_dir)),
        Arc::new(FileLogStore::new(&config.log_storage_dir)),
        job_info_store(&config).await?,
        JobCtlSettings::from(&config),
    );

    let job = JobTask::new(task.job.key, task.job.job_type, &task.workflow.workflow_name)
        .with_spec(task.job.spec);
    let workflow_ctx = task.workflow;
    let ack: AckFn = Arc::new(|job: &JobTask| {
        info!(job = %job.k8s_job_name, "🔄 Job acknowledged as running");
    });

    let mut ctl = new_job_ctl(job, workflow_ctx.clone(), ack, env)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling job");
            on_signal.cancel();
        }
    });

    info!(
        workflow = %workflow_ctx.workflow_name,
        task_id = workflow_ctx.task_id,
        "🚀 Running job"
    );
    ctl.run(cancel).await;
    ctl.clean().await;
    ctl.save_info().await?;

    let job = ctl.into_job();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "job": &job,
            "outputs": workflow_ctx.global_context_snapshot(),
        }))?
    );

    if job.status != JobStatus::Succeeded {
        bail!("job {} finished with status {}", job.k8s_job_name, job.status);
    }
    Ok(())
}
