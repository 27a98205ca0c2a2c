use async_trait::async_trait;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use sqlx::{Row, SqlitePool};

use crate::{
    domain::{
        entities::tracker::SyncRecord,
        repositories::tracker::{SyncRecordRepository, TrackerRepositoryError},
    },
    infrastructure::database::Pool,
};

#[derive(Clone)]
pub struct SyncRecordRepositoryImpl {
    pool: Pool,
}

impl SyncRecordRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl SyncRecordRepository for SyncRecordRepositoryImpl {
    async fn get_sync_records_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<SyncRecord>, TrackerRepositoryError> {
        let records = sqlx::query("SELECT * FROM manga_sync WHERE manga_id = ?")
            .bind(manga_id)
            .fetch_all(&self.pool as &SqlitePool)
            .await?
            .into_par_iter()
            .map(|row| SyncRecord {
                id: row.get("id"),
                manga_id: row.get("manga_id"),
                sync_id: row.get("sync_id"),
                remote_id: row.get("remote_id"),
                title: row.get("title"),
                last_chapter_read: row.get("last_chapter_read"),
                total_chapters: row.get("total_chapters"),
                score: row.get("score"),
                status: row.get("status"),
                update: false,
            })
            .collect();

        Ok(records)
    }

    async fn update_sync_record(&self, record: &SyncRecord) -> Result<(), TrackerRepositoryError> {
        sqlx::query(
            r#"INSERT INTO manga_sync(
                manga_id,
                sync_id,
                remote_id,
                title,
                last_chapter_read,
                total_chapters,
                score,
                status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(manga_id, sync_id) DO UPDATE SET
                remote_id=excluded.remote_id,
                title=excluded.title,
                last_chapter_read=excluded.last_chapter_read,
                total_chapters=excluded.total_chapters,
                score=excluded.score,
                status=excluded.status"#,
        )
        .bind(record.manga_id)
        .bind(record.sync_id)
        .bind(record.remote_id)
        .bind(&record.title)
        .bind(record.last_chapter_read)
        .bind(record.total_chapters)
        .bind(record.score)
        .bind(record.status)
        .execute(&self.pool as &SqlitePool)
        .await?;

        Ok(())
    }
}
