use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{chapter::Chapter, manga::Manga};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    #[default]
    NotDownloaded,
    Queued,
    Downloading,
    Downloaded,
    Error,
}

/// Live progress of a chapter download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub chapter_id: i64,
    pub manga_id: i64,
    pub source_id: i64,
    pub state: DownloadStatus,
    pub pages_downloaded: usize,
    pub pages_total: usize,
}

impl DownloadTask {
    pub fn queued(request: &DownloadRequest) -> Self {
        Self {
            chapter_id: request.chapter.id,
            manga_id: request.manga.id,
            source_id: request.manga.source_id,
            state: DownloadStatus::Queued,
            pages_downloaded: 0,
            pages_total: request.pages.as_ref().map_or(0, Vec::len),
        }
    }
}

/// Precedence between an active download task and a locally held status.
pub fn resolve_status(live: Option<&DownloadTask>, local: DownloadStatus) -> DownloadStatus {
    live.map_or(local, |task| task.state)
}

/// The unit of work handed to the download manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub manga: Manga,
    pub chapter: Chapter,
    /// Page list if already known, e.g. from an open reading session.
    #[serde(default)]
    pub pages: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPage {
    pub url: String,
    pub file: String,
}

/// Written last into a chapter directory, its presence marks the download
/// as complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterManifest {
    pub chapter_id: i64,
    pub manga_id: i64,
    pub source_id: i64,
    pub manga_title: String,
    pub chapter_title: String,
    pub pages: Vec<ManifestPage>,
    pub completed_at: NaiveDateTime,
}
