use async_trait::async_trait;

use crate::error::Result;

/// Durable storage for job container logs
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Write `contents` under `key`, replacing any previous object
    async fn put(&self, key: &str, contents: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
}
