use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{StreamExt, stream};
use shiori_lib::{models::MangaInfo, traits::Extension};
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::{
    entities::manga::Manga,
    repositories::{
        image_cache::{ImageCacheRepository, key_for_url},
        manga::{MangaRepository, MangaRepositoryError},
    },
    services::source::{SourceError, SourceService},
};

const DETAIL_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("network error: {0}")]
    Network(anyhow::Error),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("repository error: {0}")]
    Repository(#[from] MangaRepositoryError),
    #[error("no active source")]
    NoActiveSource,
}

#[derive(Debug, Default)]
struct PagerState {
    query: String,
    current_page: i64,
    next_page_url: Option<String>,
    has_next_page: bool,
    in_flight: bool,
    mangas: Vec<Manga>,
}

impl PagerState {
    fn new(query: String) -> Self {
        Self {
            query,
            has_next_page: true,
            ..Default::default()
        }
    }
}

/// Clears the in-flight mark when a request ends, including when its future
/// is dropped, unless a restart already replaced the state.
struct InFlight<'a> {
    state: &'a Mutex<PagerState>,
    generation: &'a watch::Sender<u64>,
    started: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *self.generation.borrow() == self.started {
            state.in_flight = false;
        }
    }
}

/// Walks the result pages of one source, popular listing or search.
///
/// At most one page request is in flight. `restart` discards whatever is in
/// flight and goes back to page one.
pub struct Pager<M>
where
    M: MangaRepository,
{
    source: Arc<dyn Extension>,
    source_id: i64,
    repo: M,
    state: Arc<Mutex<PagerState>>,
    generation: Arc<watch::Sender<u64>>,
}

impl<M> Clone for Pager<M>
where
    M: MangaRepository + Clone,
{
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            source_id: self.source_id,
            repo: self.repo.clone(),
            state: self.state.clone(),
            generation: self.generation.clone(),
        }
    }
}

impl<M> Pager<M>
where
    M: MangaRepository,
{
    pub fn new(source: Arc<dyn Extension>, repo: M, query: &str) -> Self {
        let source_id = source.get_source_info().id;
        let (generation, _) = watch::channel(0);

        Self {
            source,
            source_id,
            repo,
            state: Arc::new(Mutex::new(PagerState::new(query.to_string()))),
            generation: Arc::new(generation),
        }
    }

    fn state(&self) -> MutexGuard<'_, PagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    pub fn query(&self) -> String {
        self.state().query.clone()
    }

    pub fn current_page(&self) -> i64 {
        self.state().current_page
    }

    pub fn has_next_page(&self) -> bool {
        self.state().has_next_page
    }

    pub fn mangas(&self) -> Vec<Manga> {
        self.state().mangas.clone()
    }

    /// Fetch the page after the last one received. Returns the manga that
    /// were appended, or `None` when nothing was requested or the result was
    /// discarded by a restart.
    pub async fn request_next(&self) -> Result<Option<Vec<Manga>>, CatalogueError> {
        let mut generation_rx = self.generation.subscribe();
        let (generation, page, url, query) = {
            let mut state = self.state();
            if state.in_flight || !state.has_next_page {
                return Ok(None);
            }
            state.in_flight = true;

            let page = state.current_page + 1;
            let url = if page > 1 {
                state.next_page_url.clone()
            } else {
                None
            };
            (
                *generation_rx.borrow_and_update(),
                page,
                url,
                state.query.clone(),
            )
        };
        let _in_flight = InFlight {
            state: &self.state,
            generation: &self.generation,
            started: generation,
        };

        debug!("request page {page} of source {}", self.source_id);
        let fetch = async {
            if query.is_empty() {
                self.source.get_popular_manga(page, url).await
            } else {
                self.source.search_manga(page, url, &query).await
            }
        };
        let result = tokio::select! {
            result = fetch => result,
            _ = generation_rx.changed() => {
                debug!("request for page {page} discarded");
                return Ok(None);
            }
        };

        let mangas_page = result.map_err(CatalogueError::Network)?;

        let mut resolved = Vec::with_capacity(mangas_page.mangas.len());
        for info in mangas_page.mangas {
            resolved.push(self.network_to_local_manga(info).await?);
        }

        let mut state = self.state();
        if *self.generation.borrow() != generation {
            debug!("result of page {page} discarded");
            return Ok(None);
        }

        state.current_page = page;
        state.has_next_page = mangas_page.next_page_url.is_some();
        state.next_page_url = mangas_page.next_page_url;

        let mut appended = vec![];
        for manga in resolved {
            if !state.mangas.iter().any(|m| m.id == manga.id) {
                state.mangas.push(manga.clone());
                appended.push(manga);
            }
        }

        Ok(Some(appended))
    }

    /// Issue again a request that failed.
    pub async fn retry(&self) -> Result<Option<Vec<Manga>>, CatalogueError> {
        self.request_next().await
    }

    /// Back to page one with a new query, dropping any request in flight.
    pub fn restart(&self, query: &str) {
        let mut state = self.state();
        *state = PagerState::new(query.to_string());
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// The stored record for a manga from a source, inserted if new.
    async fn network_to_local_manga(&self, info: MangaInfo) -> Result<Manga, MangaRepositoryError> {
        if let Some(manga) = self
            .repo
            .get_manga_by_source_path(self.source_id, &info.path)
            .await?
        {
            return Ok(manga);
        }

        let mut manga: Manga = info.into();
        manga.source_id = self.source_id;
        manga.id = self.repo.insert_manga(&manga).await?;

        Ok(manga)
    }
}

/// Browsing state of the catalogue: the active source and its pager.
pub struct CatalogueService<M, C>
where
    M: MangaRepository + Clone,
    C: ImageCacheRepository,
{
    sources: SourceService,
    repo: M,
    cover_cache: C,
    pager: Option<Pager<M>>,
}

impl<M, C> CatalogueService<M, C>
where
    M: MangaRepository + Clone,
    C: ImageCacheRepository,
{
    pub fn new(sources: SourceService, repo: M, cover_cache: C) -> Self {
        Self {
            sources,
            repo,
            cover_cache,
            pager: None,
        }
    }

    /// Start browsing the last used source, or the first valid one.
    pub fn open(&mut self, last_used: Option<i64>) -> Result<i64, CatalogueError> {
        let source = self
            .sources
            .get_last_used_source(last_used)
            .ok_or(CatalogueError::NoActiveSource)?;
        self.set_active_source(source.id)?;

        Ok(source.id)
    }

    pub fn set_active_source(&mut self, source_id: i64) -> Result<(), CatalogueError> {
        let source = self.sources.get_source(source_id)?;
        if !self.sources.is_valid_source(source.as_ref()) {
            return Err(SourceError::LoginRequired(source_id).into());
        }

        info!("browsing source {source_id}");
        if let Some(pager) = &self.pager {
            pager.restart("");
        }
        self.pager = Some(Pager::new(source, self.repo.clone(), ""));

        Ok(())
    }

    pub fn active_source(&self) -> Option<i64> {
        self.pager.as_ref().map(Pager::source_id)
    }

    pub fn pager(&self) -> Option<&Pager<M>> {
        self.pager.as_ref()
    }

    fn active_pager(&self) -> Result<&Pager<M>, CatalogueError> {
        self.pager.as_ref().ok_or(CatalogueError::NoActiveSource)
    }

    pub fn restart(&self, query: &str) -> Result<(), CatalogueError> {
        self.active_pager()?.restart(query);
        Ok(())
    }

    pub async fn request_next(&self) -> Result<Option<Vec<Manga>>, CatalogueError> {
        self.active_pager()?.request_next().await
    }

    pub async fn retry(&self) -> Result<Option<Vec<Manga>>, CatalogueError> {
        self.active_pager()?.retry().await
    }

    /// Fetch details of the manga not initialized yet. A manga whose details
    /// cannot be fetched is returned unchanged.
    pub async fn initialize_mangas(&self, mangas: Vec<Manga>) -> Vec<Manga> {
        stream::iter(mangas)
            .map(|manga| self.initialize_manga(manga))
            .buffered(DETAIL_CONCURRENCY)
            .collect()
            .await
    }

    async fn initialize_manga(&self, mut manga: Manga) -> Manga {
        if manga.initialized {
            return manga;
        }

        let source = match self.sources.get_source(manga.source_id) {
            Ok(source) => source,
            Err(e) => {
                warn!("cannot initialize {}: {e}", manga.title);
                return manga;
            }
        };

        match source.get_manga_detail(manga.path.clone()).await {
            Ok(info) => {
                manga.copy_from(info);
                if let Err(e) = self.repo.update_manga(&manga).await {
                    error!("error saving details of {}: {e}", manga.title);
                }
            }
            Err(e) => error!("error fetching details of {}: {e}", manga.title),
        }

        manga
    }

    /// Add a manga to the library, or remove it and drop its cached cover.
    pub async fn change_manga_favorite(&self, manga: &mut Manga) -> Result<(), CatalogueError> {
        manga.favorite = !manga.favorite;
        if !manga.favorite && !manga.cover_url.is_empty() {
            if let Err(e) = self.cover_cache.remove(&key_for_url(&manga.cover_url)).await {
                warn!("error removing cover of {}: {e}", manga.title);
            }
        }
        self.repo.update_manga(manga).await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::infrastructure::{
        config::Config,
        database::establish_connection,
        domain::repositories::{image_cache::DiskCache, manga::MangaRepositoryImpl},
        source::{SourceManager, fake::FakeSource},
    };
    use tokio::{
        sync::Semaphore,
        time::{Duration, timeout},
    };

    async fn repo(dir: &tempfile::TempDir) -> MangaRepositoryImpl {
        let db_path = dir.path().join("shiori.db");
        let pool = establish_connection(&db_path.display().to_string(), true)
            .await
            .expect("open database");
        MangaRepositoryImpl::new(pool)
    }

    #[tokio::test]
    async fn test_walk_three_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(FakeSource::new(1, "fake"));
        let pager = Pager::new(source.clone(), repo(&dir).await, "");

        let mut total = 0;
        while let Some(appended) = pager.request_next().await.expect("request") {
            total += appended.len();
        }
        assert_eq!(total, 6);
        assert!(pager.request_next().await.expect("request").is_none());

        assert_eq!(
            source.catalogue_requests(),
            vec![
                (1, None, None),
                (2, Some("/popular?page=2".to_string()), None),
                (3, Some("/popular?page=3".to_string()), None),
            ]
        );
        assert_eq!(pager.current_page(), 3);
        assert!(!pager.has_next_page());

        let ids: Vec<i64> = pager.mangas().iter().map(|m| m.id).collect();
        pager.restart("");
        assert_eq!(pager.current_page(), 0);
        assert!(pager.mangas().is_empty());

        let first = pager
            .request_next()
            .await
            .expect("request")
            .expect("page");
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..2].to_vec());
    }

    #[tokio::test]
    async fn test_search_and_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(FakeSource::new(1, "fake"));
        let pager = Pager::new(source.clone(), repo(&dir).await, "");

        pager.restart("one piece");
        source.fail_catalogue(1);
        assert!(matches!(
            pager.request_next().await,
            Err(CatalogueError::Network(_))
        ));
        assert_eq!(pager.current_page(), 0);

        let page = pager.retry().await.expect("retry").expect("page");
        assert_eq!(page.len(), 2);
        assert_eq!(
            source.catalogue_requests(),
            vec![
                (1, None, Some("one piece".to_string())),
                (1, None, Some("one piece".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_discards_request_in_flight() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(FakeSource {
            catalogue_gate: Some(gate.clone()),
            ..FakeSource::new(1, "fake")
        });
        let pager = Pager::new(source.clone(), repo(&dir).await, "");

        let in_flight = {
            let pager = pager.clone();
            tokio::spawn(async move { pager.request_next().await })
        };
        timeout(Duration::from_secs(5), async {
            while source.catalogue_requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("request never started");

        assert!(pager.request_next().await.expect("request").is_none());
        assert_eq!(source.catalogue_requests().len(), 1);

        pager.restart("query");
        let discarded = in_flight.await.expect("join").expect("request");
        assert!(discarded.is_none());
        assert!(pager.mangas().is_empty());

        gate.add_permits(1);
        let page = pager.request_next().await.expect("request").expect("page");
        assert_eq!(page.len(), 2);
        assert_eq!(pager.current_page(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_block_pager() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(FakeSource {
            catalogue_gate: Some(gate.clone()),
            ..FakeSource::new(1, "fake")
        });
        let pager = Pager::new(source.clone(), repo(&dir).await, "");

        assert!(
            timeout(Duration::from_millis(50), pager.request_next())
                .await
                .is_err()
        );
        assert_eq!(source.catalogue_requests().len(), 1);
        assert_eq!(pager.current_page(), 0);
        assert!(pager.has_next_page());

        gate.add_permits(2);
        let page = pager.request_next().await.expect("request").expect("page");
        assert_eq!(page.len(), 2);
        assert_eq!(pager.current_page(), 1);
        assert_eq!(source.catalogue_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_and_favorite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sources = SourceManager::new();
        sources.insert(Arc::new(FakeSource::new(1, "fake")));
        let covers = DiskCache::open(dir.path().join("covers"), 1 << 20).expect("open cache");

        let mut service = CatalogueService::new(
            SourceService::new(sources, &Config::default()),
            repo(&dir).await,
            covers.clone(),
        );
        assert_eq!(service.open(Some(7)).expect("open"), 1);

        let mangas = service
            .request_next()
            .await
            .expect("request")
            .expect("page");
        let mangas = service.initialize_mangas(mangas).await;
        assert!(mangas.iter().all(|m| m.initialized));
        assert_eq!(mangas[0].description.as_deref(), Some("description"));

        let mut manga = mangas[0].clone();
        covers
            .set(&key_for_url(&manga.cover_url), b"cover")
            .await
            .expect("set cover");

        service
            .change_manga_favorite(&mut manga)
            .await
            .expect("favorite");
        assert!(manga.favorite);
        assert_eq!(covers.len(), 1);

        service
            .change_manga_favorite(&mut manga)
            .await
            .expect("unfavorite");
        assert!(!manga.favorite);
        assert!(covers.is_empty());
    }
}
