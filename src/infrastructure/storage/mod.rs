//! Log storage backends

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::domain::repositories::LogStore;
use crate::error::{AppError, Result};

/// Stores each log as a file under a root directory, using the key as a
/// relative path
pub struct FileLogStore {
    root: PathBuf,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(AppError::StorageError(format!("invalid log key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn put(&self, key: &str, contents: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, contents).await?;
        debug!(path = %path.display(), "Log written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory log store
#[derive(Default)]
pub struct MemoryLogStore {
    logs: DashMap<String, String>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.logs.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn put(&self, key: &str, contents: &str) -> Result<()> {
        self.logs.insert(key.to_string(), contents.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.logs.get(key).map(|entry| entry.value().clone()))
    }
}
