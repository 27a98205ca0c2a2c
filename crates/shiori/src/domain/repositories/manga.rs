use async_trait::async_trait;

use thiserror::Error;

use crate::domain::entities::manga::Manga;

#[derive(Debug, Error)]
pub enum MangaRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("serialize error: {0}")]
    SerializeError(#[from] serde_json::Error),
}

#[async_trait]
pub trait MangaRepository: Send + Sync {
    async fn get_manga_by_id(&self, id: i64) -> Result<Manga, MangaRepositoryError>;

    async fn get_manga_by_source_path(
        &self,
        source_id: i64,
        path: &str,
    ) -> Result<Option<Manga>, MangaRepositoryError>;

    /// Returns the id of the new record.
    async fn insert_manga(&self, manga: &Manga) -> Result<i64, MangaRepositoryError>;

    async fn update_manga(&self, manga: &Manga) -> Result<(), MangaRepositoryError>;
}
