use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use shiori_lib::traits::Extension;
use thiserror::Error;
use tokio::{sync::Notify, task::JoinSet, time::Duration};

use crate::{
    application::worker::downloads::DownloadManager,
    domain::{
        entities::{
            chapter::ReaderChapter,
            download::DownloadStatus,
            page::{Page, PageHandle, PageStatus},
        },
        repositories::image_cache::{ImageCacheRepository, key_for_url},
    },
    infrastructure::{config::Config, source::SourceManager, utils::retry_with_backoff},
};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("network error: {0}")]
    Network(anyhow::Error),
    #[error("source {0} is not available")]
    SourceUnavailable(i64),
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub concurrency: usize,
    pub retries: usize,
    pub retry_delay: Duration,
}

impl From<&Config> for LoaderOptions {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.loader_concurrency,
            retries: config.page_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Pages waiting for a worker, front first.
#[derive(Default)]
struct PageQueue {
    pages: Mutex<VecDeque<PageHandle>>,
    notify: Notify,
}

impl PageQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<PageHandle>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_back(&self, page: PageHandle) {
        self.lock().push_back(page);
        self.notify.notify_one();
    }

    fn push_front(&self, page: PageHandle) {
        self.lock().push_front(page);
        self.notify.notify_one();
    }

    /// Take the next queued page and mark it as being loaded.
    fn pop(&self) -> Option<PageHandle> {
        let mut pages = self.lock();
        while let Some(page) = pages.pop_front() {
            if page.status() == PageStatus::Queue {
                page.set_status(PageStatus::LoadPage);
                return Some(page);
            }
        }

        None
    }

    fn prioritize(&self, page: &PageHandle) -> bool {
        let mut pages = self.lock();
        match pages.iter().position(|p| p.same_page(page)) {
            Some(0) => true,
            Some(position) => {
                if let Some(page) = pages.remove(position) {
                    pages.push_front(page);
                }
                true
            }
            None => false,
        }
    }
}

struct PageWorker<C>
where
    C: ImageCacheRepository + Clone + 'static,
{
    source: Arc<dyn Extension>,
    cache: C,
    queue: Arc<PageQueue>,
    cancelled: Arc<AtomicBool>,
    options: LoaderOptions,
}

impl<C> PageWorker<C>
where
    C: ImageCacheRepository + Clone + 'static,
{
    async fn run(self) {
        while !self.cancelled.load(Ordering::SeqCst) {
            match self.queue.pop() {
                Some(page) => self.load(&page).await,
                None => self.queue.notify.notified().await,
            }
        }
    }

    async fn load(&self, page: &PageHandle) {
        let url = page.url();
        let key = key_for_url(&url);

        match self.cache.image_path(&key).await {
            Ok(Some(path)) => {
                if !self.cancelled.load(Ordering::SeqCst) {
                    page.set_ready(path);
                }
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("error reading cached page {url}: {e}"),
        }

        page.set_status(PageStatus::DownloadImage);
        let data = retry_with_backoff(self.options.retries, self.options.retry_delay, &url, || {
            self.source.get_image_bytes(url.clone())
        })
        .await;
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        let data = match data {
            Ok(data) => data,
            Err(_) => {
                page.set_status(PageStatus::Error);
                return;
            }
        };

        match self.cache.set(&key, &data).await {
            Ok(path) if !self.cancelled.load(Ordering::SeqCst) => page.set_ready(path),
            Ok(_) => {}
            Err(e) => {
                error!("error caching page {url}: {e}");
                page.set_status(PageStatus::Error);
            }
        }
    }
}

struct LoaderSession {
    chapter_id: i64,
    queue: Arc<PageQueue>,
    cancelled: Arc<AtomicBool>,
    workers: JoinSet<()>,
}

impl LoaderSession {
    fn cancel(mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.notify.notify_waiters();
        self.workers.abort_all();
    }
}

/// Resolves the pages of the chapter being read and fetches their images.
///
/// A downloaded chapter is served from its directory. Otherwise page images
/// go through the page cache and are fetched by a small pool of workers; the
/// page the reader is looking at can jump to the front of their queue.
pub struct ChapterLoader<C>
where
    C: ImageCacheRepository + Clone + 'static,
{
    sources: SourceManager,
    downloads: DownloadManager<C>,
    page_cache: C,
    options: LoaderOptions,
    session: Option<LoaderSession>,
}

impl<C> ChapterLoader<C>
where
    C: ImageCacheRepository + Clone + 'static,
{
    pub fn new(
        sources: SourceManager,
        downloads: DownloadManager<C>,
        page_cache: C,
        options: LoaderOptions,
    ) -> Self {
        Self {
            sources,
            downloads,
            page_cache,
            options,
            session: None,
        }
    }

    /// Fill `chapter.pages`. Returns as soon as the page list is known, images
    /// keep loading in the background.
    pub async fn load_chapter(&mut self, chapter: &mut ReaderChapter) -> Result<(), LoaderError> {
        self.restart();

        let chapter_id = chapter.id();
        let downloaded = match self.downloads.manifest(chapter_id).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                warn!("unreadable download of chapter {chapter_id}, loading from source: {e}");
                None
            }
        };
        if let Some((dir, manifest)) = downloaded {
            debug!("loading chapter {chapter_id} from {}", dir.display());
            chapter.status = DownloadStatus::Downloaded;
            chapter.pages = Some(
                manifest
                    .pages
                    .into_iter()
                    .enumerate()
                    .map(|(index, page)| {
                        PageHandle::new(Page {
                            chapter_id,
                            index,
                            url: page.url,
                            image_path: Some(dir.join(page.file)),
                            status: PageStatus::Ready,
                        })
                    })
                    .collect(),
            );
            return Ok(());
        }
        // a chapter whose manifest cannot be used is read from the source
        chapter.status = match self.downloads.status(chapter_id) {
            DownloadStatus::Downloaded => DownloadStatus::NotDownloaded,
            status => status,
        };

        let source_id = chapter.chapter().source_id;
        let source = self
            .sources
            .get(source_id)
            .map_err(|_| LoaderError::SourceUnavailable(source_id))?;
        let path = chapter.chapter().path.clone();

        let saved = match source.get_saved_page_list(path.clone()).await {
            Ok(saved) => saved.filter(|pages| !pages.is_empty()),
            Err(e) => {
                debug!("no saved page list for {path}: {e}");
                None
            }
        };
        let urls = match saved {
            Some(urls) => urls,
            None => retry_with_backoff(self.options.retries, self.options.retry_delay, &path, || {
                source.get_pages(path.clone())
            })
            .await
            .map_err(LoaderError::Network)?,
        };

        let pages: Vec<PageHandle> = urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| PageHandle::new(Page::new(chapter_id, index, url)))
            .collect();

        let queue = Arc::new(PageQueue::default());
        for page in &pages {
            queue.push_back(page.clone());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();
        for _ in 0..self.options.concurrency.max(1) {
            workers.spawn(
                PageWorker {
                    source: source.clone(),
                    cache: self.page_cache.clone(),
                    queue: queue.clone(),
                    cancelled: cancelled.clone(),
                    options: self.options.clone(),
                }
                .run(),
            );
        }

        debug!("loading {} pages of chapter {chapter_id}", pages.len());
        self.session = Some(LoaderSession {
            chapter_id,
            queue,
            cancelled,
            workers,
        });
        chapter.pages = Some(pages);

        Ok(())
    }

    /// Move a queued page to the front of the queue.
    pub fn load_priorized_page(&self, page: &PageHandle) {
        if page.status() != PageStatus::Queue {
            return;
        }

        if let Some(session) = &self.session {
            if session.queue.prioritize(page) {
                trace!("prioritized page {}", page.index());
            }
        }
    }

    /// Evict a page's cached image and load it again ahead of the others.
    /// Only failed or ready pages are reloaded, a page still being fetched is
    /// left to its worker.
    pub async fn retry_page(&self, page: &PageHandle) {
        if !matches!(page.status(), PageStatus::Error | PageStatus::Ready) {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        if page.get().chapter_id != session.chapter_id {
            return;
        }

        if let Err(e) = self.page_cache.remove(&key_for_url(&page.url())).await {
            warn!("error evicting page {}: {e}", page.index());
        }
        page.set_status(PageStatus::Queue);
        session.queue.push_front(page.clone());
    }

    /// Abandon the current chapter so the loader can take another one.
    pub fn restart(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("abandon loading chapter {}", session.chapter_id);
            session.cancel();
        }
    }

    pub fn cleanup(&mut self) {
        self.restart();
    }

    pub fn chapter_id(&self) -> Option<i64> {
        self.session.as_ref().map(|session| session.chapter_id)
    }
}

impl<C> Drop for ChapterLoader<C>
where
    C: ImageCacheRepository + Clone + 'static,
{
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        application::worker::downloads::DownloadOptions,
        domain::entities::{chapter::Chapter, download::DownloadRequest, manga::Manga},
        infrastructure::{
            domain::repositories::image_cache::DiskCache, source::fake::FakeSource,
            storage::MANIFEST_FILE,
        },
    };
    use tokio::{sync::Semaphore, time::timeout};

    struct Fixture {
        _dir: tempfile::TempDir,
        source: Arc<FakeSource>,
        cache: DiskCache,
        downloads: DownloadManager<DiskCache>,
        loader: ChapterLoader<DiskCache>,
    }

    async fn fixture(source: FakeSource, concurrency: usize) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(source);
        let sources = SourceManager::new();
        sources.insert(source.clone());

        let cache = DiskCache::open(dir.path().join("cache"), 1 << 20).expect("open cache");
        let downloads = DownloadManager::new(
            dir.path().join("downloads"),
            sources.clone(),
            cache.clone(),
            DownloadOptions {
                workers: 1,
                retries: 1,
                retry_delay: Duration::ZERO,
            },
        );
        downloads.start().await.expect("start downloads");

        let loader = ChapterLoader::new(
            sources,
            downloads.clone(),
            cache.clone(),
            LoaderOptions {
                concurrency,
                retries: 3,
                retry_delay: Duration::ZERO,
            },
        );

        Fixture {
            _dir: dir,
            source,
            cache,
            downloads,
            loader,
        }
    }

    fn chapter() -> Chapter {
        Chapter {
            id: 1,
            source_id: 1,
            manga_id: 1,
            title: "Chapter 1".to_string(),
            path: "/chapter/1".to_string(),
            number: 1.0,
            ..Default::default()
        }
    }

    async fn settled(page: &PageHandle) -> PageStatus {
        let mut rx = page.subscribe();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|p| matches!(p.status, PageStatus::Ready | PageStatus::Error)),
        )
        .await
        .expect("page did not settle")
        .expect("page dropped")
        .status
    }

    #[tokio::test]
    async fn test_load_pages_with_transient_failures() {
        let source = FakeSource::new(1, "fake");
        source.fail(&FakeSource::page_url("/chapter/1", 1), 2);
        let mut fx = fixture(source, 2).await;

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");

        let pages = reader_chapter.pages.clone().expect("pages");
        assert_eq!(pages.len(), 3);
        for page in &pages {
            assert_eq!(settled(page).await, PageStatus::Ready);
            let path = page.get().image_path.expect("image path");
            assert_eq!(
                std::fs::read(path).expect("read page"),
                page.url().into_bytes()
            );
        }
        assert_eq!(fx.cache.len(), 3);
        assert_eq!(fx.source.fetched().len(), 3);
        assert_eq!(fx.source.attempted().len(), 5);
    }

    #[tokio::test]
    async fn test_prioritized_page_is_fetched_next() {
        let gate = Arc::new(Semaphore::new(0));
        let source = FakeSource {
            page_count: 5,
            image_gate: Some(gate.clone()),
            ..FakeSource::new(1, "fake")
        };
        let mut fx = fixture(source, 1).await;

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");
        let pages = reader_chapter.pages.clone().expect("pages");

        timeout(Duration::from_secs(5), async {
            while fx.source.attempted().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loading never started");

        fx.loader.load_priorized_page(&pages[2]);
        fx.loader.load_priorized_page(&pages[0]);
        gate.add_permits(5);

        for page in &pages {
            assert_eq!(settled(page).await, PageStatus::Ready);
        }
        let order: Vec<String> = [0, 2, 1, 3, 4]
            .iter()
            .map(|i| FakeSource::page_url("/chapter/1", *i))
            .collect();
        assert_eq!(fx.source.fetched(), order);
    }

    #[tokio::test]
    async fn test_retry_failed_page() {
        let source = FakeSource::new(1, "fake");
        let broken = FakeSource::page_url("/chapter/1", 0);
        source.fail(&broken, 10);
        let mut fx = fixture(source, 1).await;

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");
        let pages = reader_chapter.pages.clone().expect("pages");
        assert_eq!(settled(&pages[0]).await, PageStatus::Error);

        fx.source.fail(&broken, 0);
        fx.loader.retry_page(&pages[0]).await;
        assert_eq!(settled(&pages[0]).await, PageStatus::Ready);
    }

    #[tokio::test]
    async fn test_retry_ignores_page_being_fetched() {
        let gate = Arc::new(Semaphore::new(0));
        let source = FakeSource {
            page_count: 1,
            image_gate: Some(gate.clone()),
            ..FakeSource::new(1, "fake")
        };
        let mut fx = fixture(source, 2).await;

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");
        let pages = reader_chapter.pages.clone().expect("pages");

        timeout(Duration::from_secs(5), async {
            while fx.source.attempted().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loading never started");
        assert_eq!(pages[0].status(), PageStatus::DownloadImage);

        fx.loader.retry_page(&pages[0]).await;
        gate.add_permits(2);
        assert_eq!(settled(&pages[0]).await, PageStatus::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.source.attempted().len(), 1);
        assert_eq!(fx.source.fetched().len(), 1);
        assert_eq!(fx.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_downloaded_chapter_skips_network() {
        let mut fx = fixture(FakeSource::new(1, "fake"), 2).await;

        fx.downloads
            .enqueue(DownloadRequest {
                manga: Manga {
                    id: 1,
                    source_id: 1,
                    title: "Manga".to_string(),
                    ..Default::default()
                },
                chapter: chapter(),
                pages: None,
            })
            .await
            .expect("enqueue");
        let mut rx = fx.downloads.subscribe();
        timeout(Duration::from_secs(5), rx.wait_for(|tasks| tasks.is_empty()))
            .await
            .expect("download did not finish")
            .expect("status closed");
        let fetched = fx.source.fetched().len();
        let listed = fx.source.page_list_requests.load(Ordering::SeqCst);

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");

        assert!(reader_chapter.is_downloaded());
        let pages = reader_chapter.pages.expect("pages");
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|page| page.status() == PageStatus::Ready));
        assert!(pages.iter().all(|page| {
            page.get()
                .image_path
                .is_some_and(|path| path.exists())
        }));
        assert_eq!(fx.source.fetched().len(), fetched);
        assert_eq!(fx.source.page_list_requests.load(Ordering::SeqCst), listed);
        assert!(fx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_manifest_falls_back_to_source() {
        let mut fx = fixture(FakeSource::new(1, "fake"), 2).await;

        fx.downloads
            .enqueue(DownloadRequest {
                manga: Manga {
                    id: 1,
                    source_id: 1,
                    title: "Manga".to_string(),
                    ..Default::default()
                },
                chapter: chapter(),
                pages: None,
            })
            .await
            .expect("enqueue");
        let mut rx = fx.downloads.subscribe();
        timeout(Duration::from_secs(5), rx.wait_for(|tasks| tasks.is_empty()))
            .await
            .expect("download did not finish")
            .expect("status closed");

        let dir = fx.downloads.chapter_dir(1).expect("chapter dir");
        std::fs::write(dir.join(MANIFEST_FILE), b"{ not json").expect("corrupt manifest");
        let listed = fx.source.page_list_requests.load(Ordering::SeqCst);

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");

        assert!(!reader_chapter.is_downloaded());
        assert_eq!(
            fx.source.page_list_requests.load(Ordering::SeqCst),
            listed + 1
        );
        let pages = reader_chapter.pages.expect("pages");
        assert_eq!(pages.len(), 3);
        for page in &pages {
            assert_eq!(settled(page).await, PageStatus::Ready);
        }
    }

    #[tokio::test]
    async fn test_saved_page_list_and_cancellation() {
        let gate = Arc::new(Semaphore::new(0));
        let source = FakeSource {
            image_gate: Some(gate.clone()),
            ..FakeSource::new(1, "fake")
        };
        source
            .saved
            .lock()
            .expect("lock")
            .insert("/chapter/1".to_string(), vec!["https://cdn.example/saved.png".to_string()]);
        let mut fx = fixture(source, 1).await;

        let mut reader_chapter = ReaderChapter::new(chapter());
        fx.loader
            .load_chapter(&mut reader_chapter)
            .await
            .expect("load chapter");
        let pages = reader_chapter.pages.clone().expect("pages");
        assert_eq!(pages.len(), 1);
        assert_eq!(fx.source.page_list_requests.load(Ordering::SeqCst), 0);

        timeout(Duration::from_secs(5), async {
            while fx.source.attempted().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loading never started");

        fx.loader.cleanup();
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_ne!(pages[0].status(), PageStatus::Ready);
        assert!(fx.cache.is_empty());
        assert_eq!(fx.loader.chapter_id(), None);
    }
}
