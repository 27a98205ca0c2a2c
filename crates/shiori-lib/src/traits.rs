use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::Error,
    models::{MangaInfo, MangasPage, SourceInfo},
};
use anyhow::Result;

/// Contract implemented by every catalogue adapter.
///
/// All fetching methods may fail with a network error. Callers treat each call
/// as a unit of work that can be retried or abandoned.
#[async_trait]
pub trait Extension: Send + Sync {
    fn get_source_info(&self) -> SourceInfo;

    /// Whether the source needs an authenticated session for catalogue use.
    fn requires_login(&self) -> bool {
        false
    }

    fn is_logged_in(&self) -> bool {
        false
    }

    /// Fetch a page of popular manga. `url` is the `next_page_url` of the
    /// previous page, `None` for the first page.
    async fn get_popular_manga(&self, page: i64, url: Option<String>) -> Result<MangasPage>;

    async fn search_manga(
        &self,
        page: i64,
        url: Option<String>,
        query: &str,
    ) -> Result<MangasPage>;

    async fn get_manga_detail(&self, path: String) -> Result<MangaInfo>;

    /// Ordered image urls of a chapter.
    async fn get_pages(&self, path: String) -> Result<Vec<String>>;

    async fn get_image_bytes(&self, url: String) -> Result<Bytes>;

    /// Keep a chapter's page list so a later session can skip `get_pages`.
    async fn save_page_list(&self, _path: String, _pages: Vec<String>) -> Result<()> {
        Err(Error::Unsupported.into())
    }

    async fn get_saved_page_list(&self, _path: String) -> Result<Option<Vec<String>>> {
        Ok(None)
    }
}
