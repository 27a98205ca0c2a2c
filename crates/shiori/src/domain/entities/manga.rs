use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Ordering used to find the previous and next chapter while reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChapterSorting {
    #[default]
    ByNumber,
    BySourceOrder,
}

impl ChapterSorting {
    pub fn as_i64(&self) -> i64 {
        match self {
            ChapterSorting::ByNumber => 0,
            ChapterSorting::BySourceOrder => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ChapterSorting::BySourceOrder,
            _ => ChapterSorting::ByNumber,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manga {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub author: Vec<String>,
    pub genre: Vec<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub path: String,
    pub cover_url: String,
    pub favorite: bool,
    pub sorting: ChapterSorting,
    pub initialized: bool,
    pub date_added: NaiveDateTime,
}

impl Default for Manga {
    fn default() -> Self {
        Self {
            id: 0,
            source_id: 0,
            title: "".to_string(),
            author: vec![],
            genre: vec![],
            status: None,
            description: None,
            path: "".to_string(),
            cover_url: "".to_string(),
            favorite: false,
            sorting: ChapterSorting::ByNumber,
            initialized: false,
            date_added: NaiveDateTime::default(),
        }
    }
}

impl Manga {
    /// Take the details fetched from a source, keeping local state.
    pub fn copy_from(&mut self, m: shiori_lib::models::MangaInfo) {
        if !m.title.is_empty() {
            self.title = m.title;
        }
        if !m.author.is_empty() {
            self.author = m.author;
        }
        if !m.genre.is_empty() {
            self.genre = m.genre;
        }
        if m.status.is_some() {
            self.status = m.status;
        }
        if m.description.is_some() {
            self.description = m.description;
        }
        if !m.cover_url.is_empty() {
            self.cover_url = m.cover_url;
        }
        self.initialized = true;
    }
}

impl From<shiori_lib::models::MangaInfo> for Manga {
    fn from(m: shiori_lib::models::MangaInfo) -> Self {
        Self {
            source_id: m.source_id,
            title: m.title,
            author: m.author,
            genre: m.genre,
            status: m.status,
            description: m.description,
            path: m.path,
            cover_url: m.cover_url,
            date_added: chrono::Utc::now().naive_utc(),
            ..Default::default()
        }
    }
}
