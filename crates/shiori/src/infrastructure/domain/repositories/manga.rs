use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    domain::{
        entities::manga::{ChapterSorting, Manga},
        repositories::manga::{MangaRepository, MangaRepositoryError},
    },
    infrastructure::database::Pool,
};

#[derive(Clone)]
pub struct MangaRepositoryImpl {
    pool: Pool,
}

impl MangaRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

fn manga_from_row(row: &SqliteRow) -> Result<Manga, MangaRepositoryError> {
    let author: String = row.get("author");
    let genre: String = row.get("genre");

    Ok(Manga {
        id: row.get("id"),
        source_id: row.get("source_id"),
        title: row.get("title"),
        author: serde_json::from_str(&author)?,
        genre: serde_json::from_str(&genre)?,
        status: row.get("status"),
        description: row.get("description"),
        path: row.get("path"),
        cover_url: row.get("cover_url"),
        favorite: row.get("favorite"),
        sorting: ChapterSorting::from_i64(row.get("sorting")),
        initialized: row.get("initialized"),
        date_added: row.get("date_added"),
    })
}

#[async_trait]
impl MangaRepository for MangaRepositoryImpl {
    async fn get_manga_by_id(&self, id: i64) -> Result<Manga, MangaRepositoryError> {
        let row = sqlx::query("SELECT * FROM manga WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool as &SqlitePool)
            .await?;

        manga_from_row(&row)
    }

    async fn get_manga_by_source_path(
        &self,
        source_id: i64,
        path: &str,
    ) -> Result<Option<Manga>, MangaRepositoryError> {
        let row = sqlx::query("SELECT * FROM manga WHERE source_id = ? AND path = ?")
            .bind(source_id)
            .bind(path)
            .fetch_optional(&self.pool as &SqlitePool)
            .await?;

        row.as_ref().map(manga_from_row).transpose()
    }

    async fn insert_manga(&self, manga: &Manga) -> Result<i64, MangaRepositoryError> {
        let row_id = sqlx::query(
            r#"INSERT INTO manga(
                source_id,
                title,
                author,
                genre,
                status,
                description,
                path,
                cover_url,
                favorite,
                sorting,
                initialized,
                date_added
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(manga.source_id)
        .bind(&manga.title)
        .bind(serde_json::to_string(&manga.author)?)
        .bind(serde_json::to_string(&manga.genre)?)
        .bind(&manga.status)
        .bind(&manga.description)
        .bind(&manga.path)
        .bind(&manga.cover_url)
        .bind(manga.favorite)
        .bind(manga.sorting.as_i64())
        .bind(manga.initialized)
        .bind(chrono::Utc::now().naive_utc())
        .execute(&self.pool as &SqlitePool)
        .await?
        .last_insert_rowid();

        Ok(row_id)
    }

    async fn update_manga(&self, manga: &Manga) -> Result<(), MangaRepositoryError> {
        sqlx::query(
            r#"UPDATE manga SET
                title = ?,
                author = ?,
                genre = ?,
                status = ?,
                description = ?,
                cover_url = ?,
                favorite = ?,
                sorting = ?,
                initialized = ?
            WHERE id = ?"#,
        )
        .bind(&manga.title)
        .bind(serde_json::to_string(&manga.author)?)
        .bind(serde_json::to_string(&manga.genre)?)
        .bind(&manga.status)
        .bind(&manga.description)
        .bind(&manga.cover_url)
        .bind(manga.favorite)
        .bind(manga.sorting.as_i64())
        .bind(manga.initialized)
        .bind(manga.id)
        .execute(&self.pool as &SqlitePool)
        .await?;

        Ok(())
    }
}
