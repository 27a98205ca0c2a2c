use async_trait::async_trait;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    domain::{
        entities::{chapter::Chapter, manga::ChapterSorting},
        repositories::chapter::{ChapterRepository, ChapterRepositoryError, Direction},
    },
    infrastructure::database::Pool,
};

const CHAPTER_COLUMNS: &str = "id, source_id, manga_id, title, path, number, source_order, read, last_page_read, uploaded, date_added";

#[derive(Clone)]
pub struct ChapterRepositoryImpl {
    pool: Pool,
}

impl ChapterRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

fn chapter_from_row(row: &SqliteRow) -> Chapter {
    Chapter {
        id: row.get("id"),
        source_id: row.get("source_id"),
        manga_id: row.get("manga_id"),
        title: row.get("title"),
        path: row.get("path"),
        number: row.get("number"),
        source_order: row.get("source_order"),
        read: row.get("read"),
        last_page_read: row.get("last_page_read"),
        uploaded: row.get("uploaded"),
        date_added: row.get("date_added"),
    }
}

#[async_trait]
impl ChapterRepository for ChapterRepositoryImpl {
    async fn insert_chapters(&self, chapters: &[Chapter]) -> Result<(), ChapterRepositoryError> {
        if chapters.is_empty() {
            return Ok(());
        }

        let mut values = vec![];
        values.resize(chapters.len(), "(?, ?, ?, ?, ?, ?, ?, ?)");

        let query_str = format!(
            r#"INSERT INTO chapter(
            source_id,
            manga_id,
            title,
            path,
            number,
            source_order,
            uploaded,
            date_added
        ) VALUES {} ON CONFLICT(manga_id, path) DO UPDATE SET
            title=excluded.title,
            number=excluded.number,
            source_order=excluded.source_order,
            uploaded=excluded.uploaded
        "#,
            values.join(",")
        );

        let now = chrono::Utc::now().naive_utc();
        let mut query = sqlx::query(&query_str);
        for chapter in chapters {
            query = query
                .bind(chapter.source_id)
                .bind(chapter.manga_id)
                .bind(&chapter.title)
                .bind(&chapter.path)
                .bind(chapter.number)
                .bind(chapter.source_order)
                .bind(chapter.uploaded)
                .bind(now);
        }

        query.execute(&self.pool as &SqlitePool).await?;

        Ok(())
    }

    async fn get_chapter_by_id(&self, id: i64) -> Result<Chapter, ChapterRepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHAPTER_COLUMNS} FROM chapter WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool as &SqlitePool)
            .await?;

        Ok(chapter_from_row(&row))
    }

    async fn get_chapter_by_manga_url(
        &self,
        manga_id: i64,
        path: &str,
    ) -> Result<Option<Chapter>, ChapterRepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapter WHERE manga_id = ? AND path = ?"
        ))
        .bind(manga_id)
        .bind(path)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?;

        Ok(row.as_ref().map(chapter_from_row))
    }

    async fn get_chapters_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<Chapter>, ChapterRepositoryError> {
        let chapters = sqlx::query(&format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapter WHERE manga_id = ? ORDER BY source_order ASC"
        ))
        .bind(manga_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| chapter_from_row(&row))
        .collect();

        Ok(chapters)
    }

    async fn get_adjacent_chapter(
        &self,
        sorting: ChapterSorting,
        chapter: &Chapter,
        direction: Direction,
    ) -> Result<Option<Chapter>, ChapterRepositoryError> {
        // sources list chapters newest first, so reading forward means a lower source order
        let (condition, order, key) = match (sorting, direction) {
            (ChapterSorting::ByNumber, _) if !chapter.is_recognized_number() => return Ok(None),
            (ChapterSorting::ByNumber, Direction::Next) => {
                ("number > ?", "number ASC", chapter.number)
            }
            (ChapterSorting::ByNumber, Direction::Previous) => {
                ("number >= 0 AND number < ?", "number DESC", chapter.number)
            }
            (ChapterSorting::BySourceOrder, Direction::Next) => (
                "source_order < ?",
                "source_order DESC",
                chapter.source_order as f64,
            ),
            (ChapterSorting::BySourceOrder, Direction::Previous) => (
                "source_order > ?",
                "source_order ASC",
                chapter.source_order as f64,
            ),
        };

        let row = sqlx::query(&format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapter WHERE manga_id = ? AND {condition} ORDER BY {order} LIMIT 1"
        ))
        .bind(chapter.manga_id)
        .bind(key)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?;

        Ok(row.as_ref().map(chapter_from_row))
    }

    async fn update_chapter_progress(
        &self,
        chapter: &Chapter,
    ) -> Result<(), ChapterRepositoryError> {
        sqlx::query(
            "UPDATE chapter SET read = ?, last_page_read = ?, last_read_at = ? WHERE id = ?",
        )
        .bind(chapter.read)
        .bind(chapter.last_page_read)
        .bind(chrono::Utc::now().naive_utc())
        .bind(chapter.id)
        .execute(&self.pool as &SqlitePool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        domain::{entities::manga::Manga, repositories::manga::MangaRepository},
        infrastructure::{
            database::establish_connection, domain::repositories::manga::MangaRepositoryImpl,
        },
    };

    async fn setup(dir: &tempfile::TempDir, numbers: &[f64]) -> (ChapterRepositoryImpl, i64) {
        let db_path = dir.path().join("shiori.db");
        let pool = establish_connection(&db_path.display().to_string(), true)
            .await
            .expect("open database");

        let manga_repo = MangaRepositoryImpl::new(pool.clone());
        let manga_id = manga_repo
            .insert_manga(&Manga {
                source_id: 1,
                title: "Test".to_string(),
                path: "/manga/test".to_string(),
                ..Default::default()
            })
            .await
            .expect("insert manga");

        let chapters: Vec<Chapter> = numbers
            .iter()
            .enumerate()
            .map(|(i, number)| Chapter {
                source_id: 1,
                manga_id,
                title: format!("Chapter {number}"),
                path: format!("/chapter/{i}"),
                number: *number,
                source_order: (numbers.len() - i - 1) as i64,
                ..Default::default()
            })
            .collect();

        let repo = ChapterRepositoryImpl::new(pool);
        repo.insert_chapters(&chapters).await.expect("insert chapters");

        (repo, manga_id)
    }

    async fn chapter_by_number(repo: &ChapterRepositoryImpl, manga_id: i64, n: f64) -> Chapter {
        repo.get_chapters_by_manga_id(manga_id)
            .await
            .expect("chapters")
            .into_iter()
            .find(|c| c.number == n)
            .expect("chapter exists")
    }

    #[tokio::test]
    async fn test_adjacent_chapters_by_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (repo, manga_id) = setup(&dir, &[1.0, 2.0, 3.0]).await;

        let second = chapter_by_number(&repo, manga_id, 2.0).await;
        let prev = repo
            .get_adjacent_chapter(ChapterSorting::ByNumber, &second, Direction::Previous)
            .await
            .expect("prev");
        let next = repo
            .get_adjacent_chapter(ChapterSorting::ByNumber, &second, Direction::Next)
            .await
            .expect("next");
        assert_eq!(prev.map(|c| c.number), Some(1.0));
        assert_eq!(next.map(|c| c.number), Some(3.0));

        let first = chapter_by_number(&repo, manga_id, 1.0).await;
        let prev = repo
            .get_adjacent_chapter(ChapterSorting::ByNumber, &first, Direction::Previous)
            .await
            .expect("prev");
        let next = repo
            .get_adjacent_chapter(ChapterSorting::ByNumber, &first, Direction::Next)
            .await
            .expect("next");
        assert!(prev.is_none());
        assert_eq!(next.map(|c| c.number), Some(2.0));
    }

    #[tokio::test]
    async fn test_adjacent_chapters_by_source_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (repo, manga_id) = setup(&dir, &[1.0, 2.0, 3.0]).await;

        let last = chapter_by_number(&repo, manga_id, 3.0).await;
        let prev = repo
            .get_adjacent_chapter(ChapterSorting::BySourceOrder, &last, Direction::Previous)
            .await
            .expect("prev");
        let next = repo
            .get_adjacent_chapter(ChapterSorting::BySourceOrder, &last, Direction::Next)
            .await
            .expect("next");
        assert_eq!(prev.map(|c| c.number), Some(2.0));
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_update_chapter_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (repo, manga_id) = setup(&dir, &[1.0]).await;

        let mut chapter = chapter_by_number(&repo, manga_id, 1.0).await;
        chapter.read = true;
        chapter.last_page_read = 12;
        repo.update_chapter_progress(&chapter).await.expect("update");

        let stored = repo.get_chapter_by_id(chapter.id).await.expect("get");
        assert!(stored.read);
        assert_eq!(stored.last_page_read, 12);

        repo.insert_chapters(&[Chapter {
            title: "Renamed".to_string(),
            read: false,
            last_page_read: 0,
            ..stored.clone()
        }])
        .await
        .expect("upsert");

        let stored = repo
            .get_chapter_by_manga_url(manga_id, &stored.path)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.title, "Renamed");
        assert!(stored.read);
    }
}
