use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Namespace jobs run in on the local cluster
    pub namespace: String,
    /// Directory holding one kubeconfig per attached cluster, named `<cluster id>.yaml`
    pub kubeconfig_dir: PathBuf,
    pub log_storage_dir: PathBuf,

    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,

    pub poll_interval: Duration,
    pub delete_timeout: Duration,

    pub encryption_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: "rustci".to_string(),
            kubeconfig_dir: PathBuf::from("/etc/rustci/clusters"),
            log_storage_dir: PathBuf::from("./job-logs"),
            mongodb_uri: None,
            mongodb_database: "rustci".to_string(),
            poll_interval: Duration::from_millis(1000),
            delete_timeout: Duration::from_secs(60),
            encryption_key: None,
        }
    }
}

impl AppConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<AppConfig> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();

        let namespace = lookup("NAMESPACE").unwrap_or(defaults.namespace);
        let kubeconfig_dir = lookup("KUBECONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.kubeconfig_dir);
        let log_storage_dir = lookup("LOG_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_storage_dir);

        let mongodb_uri = lookup("MONGODB_URI").filter(|uri| !uri.is_empty());
        let mongodb_database = lookup("MONGODB_DATABASE").unwrap_or(defaults.mongodb_database);

        let poll_interval = match lookup("JOB_POLL_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(parse_number::<u64>("JOB_POLL_INTERVAL_MS", &raw)?),
            None => defaults.poll_interval,
        };
        let delete_timeout = match lookup("JOB_DELETE_TIMEOUT_SECONDS") {
            Some(raw) => {
                Duration::from_secs(parse_number::<u64>("JOB_DELETE_TIMEOUT_SECONDS", &raw)?)
            }
            None => defaults.delete_timeout,
        };

        let encryption_key = lookup("ENCRYPTION_KEY").filter(|key| !key.is_empty());

        if namespace.is_empty() {
            return Err(AppError::ConfigError("NAMESPACE must not be empty".to_string()));
        }
        if poll_interval.is_zero() {
            return Err(AppError::ConfigError(
                "JOB_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        Ok(AppConfig {
            namespace,
            kubeconfig_dir,
            log_storage_dir,
            mongodb_uri,
            mongodb_database,
            poll_interval,
            delete_timeout,
            encryption_key,
        })
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::ConfigError(format!("{} must be a number, got '{}'", key, raw)))
}
