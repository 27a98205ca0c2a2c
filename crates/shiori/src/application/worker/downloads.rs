use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::anyhow;
use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::Duration,
};
use tokio_stream::wrappers::WatchStream;

use crate::{
    domain::{
        entities::download::{
            ChapterManifest, DownloadRequest, DownloadStatus, DownloadTask, ManifestPage,
        },
        repositories::image_cache::{ImageCacheRepository, key_for_url},
    },
    infrastructure::{
        config::Config,
        source::SourceManager,
        storage::{self, DownloadLayout, MANIFEST_FILE},
        utils::retry_with_backoff,
    },
};

pub type DownloadStatusMap = HashMap<i64, DownloadTask>;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(anyhow::Error),
    #[error("source {0} is not available")]
    SourceUnavailable(i64),
    #[error("chapter {0} has no pages")]
    EmptyChapter(i64),
    #[error("download of chapter {0} cancelled")]
    Cancelled(i64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub workers: usize,
    pub retries: usize,
    pub retry_delay: Duration,
}

impl From<&Config> for DownloadOptions {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.download_workers,
            retries: config.download_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// A chapter waiting in the queue or being downloaded.
struct PendingTask {
    seq: u64,
    request: DownloadRequest,
    cancelled: Arc<AtomicBool>,
}

struct Shared<C>
where
    C: ImageCacheRepository + 'static,
{
    layout: DownloadLayout,
    sources: SourceManager,
    page_cache: C,
    options: DownloadOptions,
    tx: flume::Sender<i64>,
    rx: flume::Receiver<i64>,
    status_tx: watch::Sender<DownloadStatusMap>,
    pending: Mutex<HashMap<i64, PendingTask>>,
    completed: RwLock<HashMap<i64, PathBuf>>,
    seq: AtomicU64,
    persist_lock: tokio::sync::Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Downloads whole chapters to disk with a fixed pool of workers.
///
/// Chapters are taken in the order they were enqueued. Each one moves through
/// `Queued`, `Downloading` and then either leaves the live map once its
/// manifest is written, or stays there as `Error` until retried, cancelled or
/// deleted.
pub struct DownloadManager<C>
where
    C: ImageCacheRepository + 'static,
{
    shared: Arc<Shared<C>>,
}

impl<C> Clone for DownloadManager<C>
where
    C: ImageCacheRepository + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> DownloadManager<C>
where
    C: ImageCacheRepository + 'static,
{
    pub fn new<P: AsRef<Path>>(
        download_path: P,
        sources: SourceManager,
        page_cache: C,
        options: DownloadOptions,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        let (status_tx, _) = watch::channel(HashMap::new());

        Self {
            shared: Arc::new(Shared {
                layout: DownloadLayout::new(download_path),
                sources,
                page_cache,
                options,
                tx,
                rx,
                status_tx,
                pending: Mutex::new(HashMap::new()),
                completed: RwLock::new(HashMap::new()),
                seq: AtomicU64::new(0),
                persist_lock: tokio::sync::Mutex::new(()),
                workers: Mutex::new(vec![]),
            }),
        }
    }

    /// Index finished chapters, spawn the workers and resume the queue left
    /// by a previous run.
    pub async fn start(&self) -> Result<(), DownloadError> {
        let layout = self.shared.layout.clone();
        let (manifests, queue) =
            tokio::task::spawn_blocking(move || (layout.scan_manifests(), layout.read_queue()))
                .await
                .map_err(anyhow::Error::from)?;

        {
            let mut completed = self.shared.completed();
            for (dir, manifest) in manifests {
                completed.insert(manifest.chapter_id, dir);
            }
            info!("{} downloaded chapters", completed.len());
        }

        {
            let mut workers = self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if workers.is_empty() {
                for worker in 0..self.shared.options.workers {
                    workers.push(tokio::spawn(self.shared.clone().run_worker(worker)));
                }
            }
        }

        match queue {
            Ok(queue) => {
                if !queue.is_empty() {
                    info!("resuming {} queued downloads", queue.len());
                }
                for request in queue {
                    self.enqueue(request).await?;
                }
            }
            Err(e) => warn!("ignoring unreadable download queue: {e}"),
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            worker.abort();
        }
    }

    /// Queue a chapter. Enqueueing a chapter that is already queued,
    /// downloading or downloaded does nothing.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadStatus, DownloadError> {
        let chapter_id = request.chapter.id;
        if self.is_downloaded(chapter_id) {
            return Ok(DownloadStatus::Downloaded);
        }

        {
            let mut pending = self.shared.pending();
            if pending.contains_key(&chapter_id) {
                match self.shared.live_state(chapter_id) {
                    Some(DownloadStatus::Error) | None => {}
                    Some(state) => return Ok(state),
                }
            }

            let task = DownloadTask::queued(&request);
            pending.insert(
                chapter_id,
                PendingTask {
                    seq: self.shared.seq.fetch_add(1, Ordering::SeqCst),
                    request,
                    cancelled: Arc::new(AtomicBool::new(false)),
                },
            );
            self.shared.status_tx.send_modify(|tasks| {
                tasks.insert(chapter_id, task);
            });
        }

        debug!("queued chapter {chapter_id}");
        self.shared.persist_queue().await;
        self.shared
            .tx
            .send(chapter_id)
            .map_err(|_| anyhow!("download queue is closed"))?;

        Ok(DownloadStatus::Queued)
    }

    /// Put an errored chapter back in the queue.
    pub async fn retry(&self, chapter_id: i64) -> Result<bool, DownloadError> {
        {
            let mut pending = self.shared.pending();
            let Some(task) = pending.get_mut(&chapter_id) else {
                return Ok(false);
            };
            if self.shared.live_state(chapter_id) != Some(DownloadStatus::Error) {
                return Ok(false);
            }

            task.cancelled = Arc::new(AtomicBool::new(false));
            let queued = DownloadTask::queued(&task.request);
            self.shared.status_tx.send_modify(|tasks| {
                tasks.insert(chapter_id, queued);
            });
        }

        info!("retrying chapter {chapter_id}");
        self.shared
            .tx
            .send(chapter_id)
            .map_err(|_| anyhow!("download queue is closed"))?;

        Ok(true)
    }

    /// Drop a queued or active task. Pages already on disk are kept so a
    /// later enqueue resumes from them.
    pub async fn cancel(&self, chapter_id: i64) -> bool {
        let cancelled = self.shared.cancel(chapter_id).is_some();
        if cancelled {
            info!("cancelled download of chapter {chapter_id}");
            self.shared.persist_queue().await;
        }

        cancelled
    }

    /// Cancel any task for the chapter, remove its directory and evict the
    /// page cache entries it shadowed.
    pub async fn delete(&self, chapter_id: i64) -> Result<(), DownloadError> {
        let request = self.shared.cancel(chapter_id);
        if request.is_some() {
            self.shared.persist_queue().await;
        }

        let dir = self
            .shared
            .completed()
            .remove(&chapter_id)
            .or_else(|| self.shared.layout.find_chapter_dir(chapter_id));
        let Some(dir) = dir else {
            debug!("chapter {chapter_id} has nothing on disk");
            return Ok(());
        };

        let mut urls: Vec<String> = request.and_then(|r| r.pages).unwrap_or_default();
        match storage::load_manifest(&dir).await {
            Ok(Some(manifest)) => urls.extend(manifest.pages.into_iter().map(|page| page.url)),
            Ok(None) => {}
            Err(e) => warn!("unreadable manifest in {}: {e}", dir.display()),
        }
        for url in urls {
            if let Err(e) = self.shared.page_cache.remove(&key_for_url(&url)).await {
                error!("error removing cached page {url}: {e}");
            }
        }

        info!("removing {}", dir.display());
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadStatusMap> {
        self.shared.status_tx.subscribe()
    }

    pub fn status_stream(&self) -> WatchStream<DownloadStatusMap> {
        WatchStream::new(self.subscribe())
    }

    pub fn live_tasks(&self) -> DownloadStatusMap {
        self.shared.status_tx.borrow().clone()
    }

    /// Live task state first, then the manifest on disk.
    pub fn status(&self, chapter_id: i64) -> DownloadStatus {
        match self.shared.live_state(chapter_id) {
            Some(state) => state,
            None if self.is_downloaded(chapter_id) => DownloadStatus::Downloaded,
            None => DownloadStatus::NotDownloaded,
        }
    }

    pub fn is_downloaded(&self, chapter_id: i64) -> bool {
        self.chapter_dir(chapter_id).is_some()
    }

    /// Directory of a complete chapter.
    pub fn chapter_dir(&self, chapter_id: i64) -> Option<PathBuf> {
        self.shared
            .completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chapter_id)
            .filter(|dir| dir.join(MANIFEST_FILE).exists())
            .cloned()
    }

    pub async fn manifest(
        &self,
        chapter_id: i64,
    ) -> Result<Option<(PathBuf, ChapterManifest)>, DownloadError> {
        let Some(dir) = self.chapter_dir(chapter_id) else {
            return Ok(None);
        };

        Ok(storage::load_manifest(&dir)
            .await?
            .map(|manifest| (dir, manifest)))
    }

    pub async fn downloaded_chapters(&self) -> Result<Vec<ChapterManifest>, DownloadError> {
        let layout = self.shared.layout.clone();
        let found = tokio::task::spawn_blocking(move || layout.scan_manifests())
            .await
            .map_err(anyhow::Error::from)?;

        let mut completed = self.shared.completed();
        Ok(found
            .into_iter()
            .map(|(dir, manifest)| {
                completed.insert(manifest.chapter_id, dir);
                manifest
            })
            .collect())
    }
}

impl<C> Shared<C>
where
    C: ImageCacheRepository + 'static,
{
    fn pending(&self) -> MutexGuard<'_, HashMap<i64, PendingTask>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn completed(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, PathBuf>> {
        self.completed.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_state(&self, chapter_id: i64) -> Option<DownloadStatus> {
        self.status_tx.borrow().get(&chapter_id).map(|task| task.state)
    }

    fn cancel(&self, chapter_id: i64) -> Option<DownloadRequest> {
        let task = self.pending().remove(&chapter_id);
        if let Some(task) = &task {
            task.cancelled.store(true, Ordering::SeqCst);
        }
        self.status_tx
            .send_if_modified(|tasks| tasks.remove(&chapter_id).is_some());

        task.map(|task| task.request)
    }

    async fn persist_queue(&self) {
        let _guard = self.persist_lock.lock().await;
        let queue: Vec<DownloadRequest> = {
            let pending = self.pending();
            let mut tasks: Vec<&PendingTask> = pending.values().collect();
            tasks.sort_by_key(|task| task.seq);
            tasks.into_iter().map(|task| task.request.clone()).collect()
        };

        if let Err(e) = self.layout.write_queue(&queue).await {
            error!("failed to persist download queue: {e}");
        }
    }

    /// Claim a queued chapter for a worker.
    fn begin(&self, chapter_id: i64) -> Option<(DownloadRequest, Arc<AtomicBool>)> {
        let pending = self.pending();
        let task = pending.get(&chapter_id)?;
        if task.cancelled.load(Ordering::SeqCst)
            || self.live_state(chapter_id) != Some(DownloadStatus::Queued)
        {
            return None;
        }

        self.status_tx.send_modify(|tasks| {
            if let Some(task) = tasks.get_mut(&chapter_id) {
                task.state = DownloadStatus::Downloading;
            }
        });

        Some((task.request.clone(), task.cancelled.clone()))
    }

    fn is_current(pending: &HashMap<i64, PendingTask>, chapter_id: i64, flag: &Arc<AtomicBool>) -> bool {
        pending
            .get(&chapter_id)
            .is_some_and(|task| Arc::ptr_eq(&task.cancelled, flag))
    }

    async fn finish(&self, chapter_id: i64, dir: PathBuf, flag: &Arc<AtomicBool>) {
        {
            let mut pending = self.pending();
            if !Self::is_current(&pending, chapter_id, flag) {
                return;
            }
            pending.remove(&chapter_id);
            self.completed().insert(chapter_id, dir);
            self.status_tx.send_modify(|tasks| {
                tasks.remove(&chapter_id);
            });
        }

        info!("chapter {chapter_id} downloaded");
        self.persist_queue().await;
    }

    fn fail(&self, chapter_id: i64, flag: &Arc<AtomicBool>) {
        let pending = self.pending();
        if !Self::is_current(&pending, chapter_id, flag) {
            return;
        }
        self.status_tx.send_modify(|tasks| {
            if let Some(task) = tasks.get_mut(&chapter_id) {
                task.state = DownloadStatus::Error;
            }
        });
    }

    fn update_progress(&self, chapter_id: i64, downloaded: usize, total: usize) {
        self.status_tx.send_if_modified(|tasks| match tasks.get_mut(&chapter_id) {
            Some(task) if task.state == DownloadStatus::Downloading => {
                task.pages_downloaded = downloaded;
                task.pages_total = total;
                true
            }
            _ => false,
        });
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!("download worker {worker} started");
        while let Ok(chapter_id) = self.rx.recv_async().await {
            let Some((request, cancelled)) = self.begin(chapter_id) else {
                continue;
            };

            info!("worker {worker} downloading chapter {chapter_id}");
            let result = self.download(&request, &cancelled).await;
            if cancelled.load(Ordering::SeqCst) {
                debug!("download of chapter {chapter_id} cancelled");
                continue;
            }

            match result {
                Ok(dir) => self.finish(chapter_id, dir, &cancelled).await,
                Err(e) => {
                    error!("failed to download chapter {chapter_id}: {e}");
                    self.fail(chapter_id, &cancelled);
                }
            }
        }
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        cancelled: &AtomicBool,
    ) -> Result<PathBuf, DownloadError> {
        let chapter = &request.chapter;
        let source_id = request.manga.source_id;
        let source = self
            .sources
            .get(source_id)
            .map_err(|_| DownloadError::SourceUnavailable(source_id))?;
        let source_name = source.get_source_info().name;

        let dir = self.layout.chapter_dir(
            &source_name,
            &request.manga.title,
            &chapter.title,
            chapter.id,
        );
        if storage::load_manifest(&dir).await?.is_some() {
            debug!("chapter {} already complete in {}", chapter.id, dir.display());
            return Ok(dir);
        }

        let pages = match &request.pages {
            Some(pages) => pages.clone(),
            None => retry_with_backoff(
                self.options.retries,
                self.options.retry_delay,
                &chapter.path,
                || source.get_pages(chapter.path.clone()),
            )
            .await
            .map_err(DownloadError::Network)?,
        };
        if pages.is_empty() {
            return Err(DownloadError::EmptyChapter(chapter.id));
        }

        let published = storage::prepare_chapter_dir(&dir).await?;

        let total = pages.len();
        let mut manifest_pages = Vec::with_capacity(total);
        for (index, url) in pages.iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                return Err(DownloadError::Cancelled(chapter.id));
            }

            let file = match published.get(&index) {
                Some(name) => {
                    trace!("page {index} of chapter {} already on disk", chapter.id);
                    name.clone()
                }
                None => {
                    let data = retry_with_backoff(
                        self.options.retries,
                        self.options.retry_delay,
                        url,
                        || source.get_image_bytes(url.clone()),
                    )
                    .await
                    .map_err(DownloadError::Network)?;

                    if cancelled.load(Ordering::SeqCst) {
                        return Err(DownloadError::Cancelled(chapter.id));
                    }

                    let name = storage::page_file_name(index, url);
                    storage::write_atomic(&dir.join(&name), &data).await?;
                    name
                }
            };

            manifest_pages.push(ManifestPage {
                url: url.clone(),
                file,
            });
            self.update_progress(chapter.id, index + 1, total);
        }

        if cancelled.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled(chapter.id));
        }

        let manifest = ChapterManifest {
            chapter_id: chapter.id,
            manga_id: request.manga.id,
            source_id,
            manga_title: request.manga.title.clone(),
            chapter_title: chapter.title.clone(),
            pages: manifest_pages,
            completed_at: Utc::now().naive_utc(),
        };
        storage::write_manifest(&dir, &manifest).await?;

        Ok(dir)
    }
}
