use async_trait::async_trait;
use mongodb::{
    bson::doc,
    options::{FindOptions, IndexOptions},
    Collection, Database, IndexModel,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    domain::entities::JobInfo,
    domain::repositories::JobInfoStore,
    error::{AppError, Result},
};

const JOB_INFO_COLLECTION: &str = "job_info";

/// MongoDB-backed store of terminal job records
pub struct MongoJobInfoRepository {
    collection: Collection<JobInfo>,
}

impl MongoJobInfoRepository {
    pub async fn new(database: &Database) -> Result<Self> {
        let collection = database.collection::<JobInfo>(JOB_INFO_COLLECTION);
        let repo = Self { collection };
        repo.create_indexes().await?;
        Ok(repo)
    }

    async fn create_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! {
                "workflow_name": 1,
                "task_id": 1
            })
            .options(
                IndexOptions::builder()
                    .name("workflow_task_idx".to_string())
                    .build(),
            )
            .build();

        self.collection
            .create_index(index, None)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to create job_info index: {}", e))
            })?;

        debug!("📇 job_info indexes ensured");
        Ok(())
    }
}

#[async_trait]
impl JobInfoStore for MongoJobInfoRepository {
    async fn create(&self, info: &JobInfo) -> Result<()> {
        self.collection
            .insert_one(info, None)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to insert job info: {}", e)))?;

        info!(
            workflow = %info.workflow_name,
            task_id = info.task_id,
            status = %info.status,
            "💾 Job info saved"
        );
        Ok(())
    }

    async fn list_by_workflow(&self, workflow_name: &str) -> Result<Vec<JobInfo>> {
        let options = FindOptions::builder()
            .sort(doc! { "task_id": 1, "start_time": 1 })
            .build();

        let mut cursor = self
            .collection
            .find(doc! { "workflow_name": workflow_name }, options)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to find job info: {}", e)))?;

        let mut records = Vec::new();
        while cursor
            .advance()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Cursor error: {}", e)))?
        {
            let record = cursor.deserialize_current().map_err(|e| {
                AppError::DatabaseError(format!("Failed to deserialize job info: {}", e))
            })?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Process-local job info store, used when no database is configured
#[derive(Default)]
pub struct InMemoryJobInfoStore {
    records: RwLock<Vec<JobInfo>>,
}

impl InMemoryJobInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobInfoStore for InMemoryJobInfoStore {
    async fn create(&self, info: &JobInfo) -> Result<()> {
        self.records.write().await.push(info.clone());
        Ok(())
    }

    async fn list_by_workflow(&self, workflow_name: &str) -> Result<Vec<JobInfo>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|record| record.workflow_name == workflow_name)
            .cloned()
            .collect())
    }
}
