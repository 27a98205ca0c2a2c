use async_trait::async_trait;

use thiserror::Error;

use crate::domain::entities::{chapter::Chapter, manga::ChapterSorting};

#[derive(Debug, Error)]
pub enum ChapterRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

#[async_trait]
pub trait ChapterRepository: Send + Sync {
    async fn insert_chapters(&self, chapters: &[Chapter]) -> Result<(), ChapterRepositoryError>;

    async fn get_chapter_by_id(&self, id: i64) -> Result<Chapter, ChapterRepositoryError>;

    async fn get_chapter_by_manga_url(
        &self,
        manga_id: i64,
        path: &str,
    ) -> Result<Option<Chapter>, ChapterRepositoryError>;

    async fn get_chapters_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<Chapter>, ChapterRepositoryError>;

    /// At most one chapter on the given side of `chapter` under `sorting`.
    async fn get_adjacent_chapter(
        &self,
        sorting: ChapterSorting,
        chapter: &Chapter,
        direction: Direction,
    ) -> Result<Option<Chapter>, ChapterRepositoryError>;

    /// Persist `read` and `last_page_read` in a single statement.
    async fn update_chapter_progress(&self, chapter: &Chapter)
    -> Result<(), ChapterRepositoryError>;
}
