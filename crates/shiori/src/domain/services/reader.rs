use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    application::worker::downloads::DownloadManager,
    domain::{
        entities::{
            chapter::{Chapter, ReaderChapter},
            manga::Manga,
            page::{PageHandle, PageStatus},
            tracker::SyncRecord,
        },
        repositories::{
            chapter::{ChapterRepository, ChapterRepositoryError, Direction},
            image_cache::ImageCacheRepository,
            tracker::SyncRecordRepository,
        },
        services::{
            loader::{ChapterLoader, LoaderError},
            tracker::{SyncService, chapter_to_update},
        },
    },
    infrastructure::{config::Config, source::SourceManager},
};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("chapter error: {0}")]
    Chapter(#[from] ChapterRepositoryError),
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    pub remove_after_read: bool,
    pub remove_after_read_previous: bool,
    pub save_chapter_progress: bool,
    pub auto_update_sync: bool,
}

impl From<&Config> for ReaderOptions {
    fn from(config: &Config) -> Self {
        Self {
            remove_after_read: config.remove_after_read,
            remove_after_read_previous: config.remove_after_read_previous,
            save_chapter_progress: config.save_chapter_progress,
            auto_update_sync: config.auto_update_sync,
        }
    }
}

/// Reading session over one manga: the open chapter, its neighbours and the
/// progress bookkeeping done when moving between them.
pub struct ReaderSession<R, T, C>
where
    R: ChapterRepository,
    T: SyncRecordRepository + Clone + 'static,
    C: ImageCacheRepository + Clone + 'static,
{
    manga: Manga,
    chapter_repo: R,
    sources: SourceManager,
    downloads: DownloadManager<C>,
    loader: ChapterLoader<C>,
    sync: SyncService<T>,
    options: ReaderOptions,
    sync_records: Vec<SyncRecord>,
    chapter: Option<ReaderChapter>,
    previous: Option<ReaderChapter>,
    next: Option<ReaderChapter>,
}

impl<R, T, C> ReaderSession<R, T, C>
where
    R: ChapterRepository,
    T: SyncRecordRepository + Clone + 'static,
    C: ImageCacheRepository + Clone + 'static,
{
    pub fn new(
        manga: Manga,
        chapter_repo: R,
        sources: SourceManager,
        downloads: DownloadManager<C>,
        loader: ChapterLoader<C>,
        sync: SyncService<T>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            manga,
            chapter_repo,
            sources,
            downloads,
            loader,
            sync,
            options,
            sync_records: vec![],
            chapter: None,
            previous: None,
            next: None,
        }
    }

    pub fn manga(&self) -> &Manga {
        &self.manga
    }

    pub fn chapter(&self) -> Option<&ReaderChapter> {
        self.chapter.as_ref()
    }

    pub fn previous(&self) -> Option<&ReaderChapter> {
        self.previous.as_ref()
    }

    pub fn next(&self) -> Option<&ReaderChapter> {
        self.next.as_ref()
    }

    /// Neighbours of `chapter` under the manga's sorting mode, as
    /// `(previous, next)`.
    pub async fn get_adjacent_chapters(
        &self,
        chapter: &Chapter,
    ) -> Result<(Option<Chapter>, Option<Chapter>), ReaderError> {
        let sorting = self.manga.sorting;
        let previous = self
            .chapter_repo
            .get_adjacent_chapter(sorting, chapter, Direction::Previous)
            .await?;
        let next = self
            .chapter_repo
            .get_adjacent_chapter(sorting, chapter, Direction::Next)
            .await?;

        Ok((previous, next))
    }

    /// Open the first chapter of the session.
    pub async fn open(&mut self, chapter: Chapter) -> Result<(), ReaderError> {
        if self.options.auto_update_sync {
            match self.sync.get_sync_records(self.manga.id).await {
                Ok(records) => self.sync_records = records,
                Err(e) => error!("error reading sync records of {}: {e}", self.manga.title),
            }
        }

        self.load_chapter(chapter, 0).await
    }

    async fn load_chapter(&mut self, chapter: Chapter, requested_page: i64) -> Result<(), ReaderError> {
        let mut current = ReaderChapter::new(chapter);
        current.resolve_requested_page(requested_page);

        self.previous = None;
        self.next = None;

        match self.get_adjacent_chapters(current.chapter()).await {
            Ok((previous, next)) => {
                self.previous = previous.map(ReaderChapter::new);
                self.next = next.map(ReaderChapter::new);
            }
            Err(e) => error!("error reading chapters next to {}: {e}", current.id()),
        }

        let loaded = self.loader.load_chapter(&mut current).await;
        self.chapter = Some(current);

        Ok(loaded?)
    }

    /// Record that page `index` of the open chapter is on screen.
    pub fn on_page_changed(&mut self, index: usize) {
        let Some(chapter) = &mut self.chapter else {
            return;
        };
        let Some((page, total)) = chapter
            .pages
            .as_ref()
            .and_then(|pages| pages.get(index).cloned().map(|page| (page, pages.len())))
        else {
            return;
        };

        chapter.last_page_read = index as i64;
        if index + 1 == total {
            chapter.read = true;
        }

        if !chapter.is_downloaded() && page.status() == PageStatus::Queue {
            self.loader.load_priorized_page(&page);
        }
    }

    /// Load page `index` of the open chapter again.
    pub async fn retry_page(&self, index: usize) {
        let page = self
            .chapter
            .as_ref()
            .and_then(|chapter| chapter.pages.as_ref())
            .and_then(|pages| pages.get(index));
        if let Some(page) = page {
            self.loader.retry_page(page).await;
        }
    }

    /// Bookkeeping for the chapter being left: remember its page list, drop
    /// read downloads when configured and persist progress. Failures are only
    /// logged.
    pub async fn on_chapter_left(&self) {
        let Some(chapter) = &self.chapter else {
            return;
        };
        let Some(pages) = &chapter.pages else {
            return;
        };

        if !chapter.is_downloaded() && self.options.save_chapter_progress {
            self.save_page_list(chapter.chapter(), pages).await;
        }

        if chapter.read && self.options.remove_after_read {
            let target = if self.options.remove_after_read_previous {
                self.previous.as_ref()
            } else {
                Some(chapter)
            };
            if let Some(target) = target {
                self.delete_chapter(target.id());
            }
        }

        if let Err(e) = self
            .chapter_repo
            .update_chapter_progress(&chapter.progress())
            .await
        {
            error!("error saving progress of chapter {}: {e}", chapter.id());
        }
    }

    async fn save_page_list(&self, chapter: &Chapter, pages: &[PageHandle]) {
        let source = match self.sources.get(chapter.source_id) {
            Ok(source) => source,
            Err(e) => {
                debug!("page list of {} not saved: {e}", chapter.path);
                return;
            }
        };

        let urls = pages.iter().map(PageHandle::url).collect();
        if let Err(e) = source.save_page_list(chapter.path.clone(), urls).await {
            debug!("page list of {} not saved: {e}", chapter.path);
        }
    }

    fn delete_chapter(&self, chapter_id: i64) {
        let downloads = self.downloads.clone();
        tokio::spawn(async move {
            if let Err(e) = downloads.delete(chapter_id).await {
                error!("error deleting chapter {chapter_id}: {e}");
            }
        });
    }

    /// Move to the next chapter. Returns false when there is none.
    pub async fn load_next_chapter(&mut self) -> Result<bool, ReaderError> {
        let Some(next) = self.next.as_ref().map(|next| next.id()) else {
            return Ok(false);
        };

        self.on_chapter_left().await;
        let chapter = self.chapter_repo.get_chapter_by_id(next).await?;
        self.load_chapter(chapter, 0).await?;

        Ok(true)
    }

    /// Move to the previous chapter, opening it on its last page when it was
    /// already read. Returns false when there is none.
    pub async fn load_previous_chapter(&mut self) -> Result<bool, ReaderError> {
        let Some(previous) = self.previous.as_ref().map(|previous| previous.id()) else {
            return Ok(false);
        };

        self.on_chapter_left().await;
        let chapter = self.chapter_repo.get_chapter_by_id(previous).await?;
        let requested_page = if chapter.read { -1 } else { 0 };
        self.load_chapter(chapter, requested_page).await?;

        Ok(true)
    }

    /// End the session. Returns the pending sync updates.
    pub async fn close(&mut self) -> Vec<JoinHandle<()>> {
        self.on_chapter_left().await;

        let mut handles = vec![];
        if self.options.auto_update_sync {
            if let Some(chapter) = &self.chapter {
                let last_chapter_read =
                    chapter_to_update(chapter, self.previous.as_ref(), &mut self.sync_records);
                if last_chapter_read > 0 {
                    info!(
                        "updating sync services of {} to chapter {last_chapter_read}",
                        self.manga.title
                    );
                    handles = self
                        .sync
                        .update_last_chapter_read(std::mem::take(&mut self.sync_records));
                }
            }
        }

        self.loader.cleanup();
        self.chapter = None;
        self.previous = None;
        self.next = None;

        handles
    }
}
