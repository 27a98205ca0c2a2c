use std::{collections::HashMap, sync::Arc};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{
    download::{DownloadStatus, DownloadTask, resolve_status},
    page::PageHandle,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub source_id: i64,
    pub manga_id: i64,
    pub title: String,
    pub path: String,
    pub number: f64,
    pub source_order: i64,
    pub read: bool,
    pub last_page_read: i64,
    pub uploaded: NaiveDateTime,
    pub date_added: NaiveDateTime,
}

impl Default for Chapter {
    fn default() -> Self {
        Self {
            id: 0,
            source_id: 0,
            manga_id: 0,
            title: "".to_string(),
            path: "".to_string(),
            number: -1.0,
            source_order: 0,
            read: false,
            last_page_read: 0,
            uploaded: NaiveDateTime::default(),
            date_added: NaiveDateTime::default(),
        }
    }
}

impl Chapter {
    /// Sources report a negative number when the chapter number could not be parsed.
    pub fn is_recognized_number(&self) -> bool {
        self.number >= 0.0
    }
}

/// A chapter opened in a reading session.
///
/// Wraps the persisted record, which is never mutated here, and carries the
/// transient state of the session: download status, loaded pages and the
/// progress made since the chapter was opened.
#[derive(Debug, Clone)]
pub struct ReaderChapter {
    chapter: Arc<Chapter>,
    pub status: DownloadStatus,
    pub pages: Option<Vec<PageHandle>>,
    pub last_page_read: i64,
    pub read: bool,
    pub requested_page: i64,
}

impl ReaderChapter {
    pub fn new(chapter: Chapter) -> Self {
        let last_page_read = chapter.last_page_read;
        let read = chapter.read;
        Self {
            chapter: Arc::new(chapter),
            status: DownloadStatus::NotDownloaded,
            pages: None,
            last_page_read,
            read,
            requested_page: 0,
        }
    }

    pub fn chapter(&self) -> &Chapter {
        &self.chapter
    }

    pub fn id(&self) -> i64 {
        self.chapter.id
    }

    pub fn is_downloaded(&self) -> bool {
        self.status == DownloadStatus::Downloaded
    }

    /// Status as seen by observers: a live download task overrides the
    /// session's own value.
    pub fn download_status(&self, live: &HashMap<i64, DownloadTask>) -> DownloadStatus {
        resolve_status(live.get(&self.chapter.id), self.status)
    }

    /// Page to show first. A partially read chapter resumes where it was left,
    /// otherwise `requested` is used (`-1` meaning the last page).
    pub fn resolve_requested_page(&mut self, requested: i64) {
        self.requested_page = if !self.read && self.last_page_read != 0 {
            self.last_page_read
        } else {
            requested
        };
    }

    /// Persisted record with the session's progress applied.
    pub fn progress(&self) -> Chapter {
        Chapter {
            read: self.read,
            last_page_read: self.last_page_read,
            ..(*self.chapter).clone()
        }
    }
}
