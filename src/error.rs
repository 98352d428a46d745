use crate::domain::entities::JobType;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cluster {cluster_id} is unavailable: {reason}")]
    ClusterUnavailable { cluster_id: String, reason: String },

    #[error("Failed to decode {job_type} job spec: {source}")]
    SpecDecode {
        job_type: JobType,
        #[source]
        source: serde_json::Error,
    },

    #[error("No controller for job type: {0}")]
    UnsupportedJobType(JobType),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::StorageError(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::ValidationError(format!("YAML error: {}", err))
    }
}

impl From<kube::Error> for AppError {
    fn from(err: kube::Error) -> Self {
        AppError::KubernetesError(err.to_string())
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
