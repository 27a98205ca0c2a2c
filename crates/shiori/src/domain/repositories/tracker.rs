use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::tracker::SyncRecord;

#[derive(Debug, Error)]
pub enum TrackerRepositoryError {
    #[error("tracker not available")]
    NoTracker,
    #[error("database return error: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait SyncRecordRepository: Send + Sync {
    async fn get_sync_records_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<SyncRecord>, TrackerRepositoryError>;

    async fn update_sync_record(&self, record: &SyncRecord) -> Result<(), TrackerRepositoryError>;
}

/// A remote sync service that receives reading progress.
#[async_trait]
pub trait SyncSender: Send + Sync {
    fn id(&self) -> i64;

    fn is_logged_in(&self) -> bool;

    async fn update(&self, record: &SyncRecord) -> Result<(), anyhow::Error>;
}
