use serde::{Deserialize, Serialize};

use super::MangaInfo;

/// One page of catalogue results as returned by a source.
///
/// `url` is the address the page was requested with, `next_page_url` is
/// `None` when the catalogue has no further pages.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MangasPage {
    pub page: i64,
    pub url: Option<String>,
    pub mangas: Vec<MangaInfo>,
    pub next_page_url: Option<String>,
}

impl MangasPage {
    pub fn new(page: i64) -> Self {
        Self {
            page,
            ..Default::default()
        }
    }

    pub fn has_next_page(&self) -> bool {
        self.next_page_url.is_some()
    }
}
