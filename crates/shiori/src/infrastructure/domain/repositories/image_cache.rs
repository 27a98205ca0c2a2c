use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use crate::domain::repositories::image_cache::{ImageCacheRepository, ImageCacheRepositoryError};

const TEMP_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: u64,
    stored_at: u64,
}

/// In-memory view of a cache directory, ordered by access.
#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    total_size: u64,
    tick: u64,
}

impl CacheIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) -> Option<CacheEntry> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.last_access);
        entry.last_access = tick;
        self.order.insert(tick, key.to_string());
        Some(entry.clone())
    }

    fn insert(&mut self, key: &str, path: PathBuf, size: u64) {
        self.remove(key);
        let tick = self.next_tick();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                path,
                size,
                last_access: tick,
                stored_at: tick,
            },
        );
        self.order.insert(tick, key.to_string());
        self.total_size += size;
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.last_access);
        self.total_size -= entry.size;
        Some(entry)
    }

    fn pop_least_recent(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.total_size -= entry.size;
        Some(entry)
    }
}

/// A size bounded cache region backed by a flat directory.
///
/// Files are named after their key. Writes go to a temporary file first and
/// are renamed into place, so a reader never sees partial content. When the
/// region grows past `max_size` the least recently accessed entries are
/// deleted.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    max_size: u64,
    index: Arc<Mutex<CacheIndex>>,
}

impl DiskCache {
    /// Open a region, indexing whatever a previous run left in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, max_size: u64) -> Result<Self, ImageCacheRepositoryError> {
        let dir = PathBuf::new().join(dir);
        std::fs::create_dir_all(&dir)?;

        let mut found = vec![];
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                debug!("removing leftover temporary file {name}");
                let _ = std::fs::remove_file(entry.path());
                continue;
            }

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, name, entry.path(), metadata.len()));
        }
        found.sort();

        let mut index = CacheIndex::default();
        for (_, key, path, size) in found {
            index.insert(&key, path, size);
        }

        let cache = Self {
            dir,
            max_size,
            index: Arc::new(Mutex::new(index)),
        };
        let mut index = cache.index();
        cache.trim(&mut index);
        drop(index);

        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index().entries.values().cloned().collect()
    }

    pub fn clear(&self) -> Result<(), ImageCacheRepositoryError> {
        let mut index = self.index();
        while let Some(entry) = index.pop_least_recent() {
            remove_file(&entry.path)?;
        }

        Ok(())
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict until the region fits its budget. Runs with the index locked so
    /// a concurrent `set` of an evicted key cannot lose its file.
    fn trim(&self, index: &mut CacheIndex) {
        while index.total_size > self.max_size {
            let Some(entry) = index.pop_least_recent() else {
                break;
            };
            debug!("evict {} ({} bytes)", entry.key, entry.size);
            if let Err(e) = remove_file(&entry.path) {
                error!("error removing cache file {}: {e}", entry.path.display());
            }
        }
    }

    /// Drop an entry whose file no longer matches the index. Returns false
    /// when the key was replaced or removed in the meantime.
    fn evict_corrupted(&self, observed: &CacheEntry) -> bool {
        let mut index = self.index();
        let current = index.entries.get(&observed.key).map(|e| e.stored_at);
        if current != Some(observed.stored_at) {
            return false;
        }

        warn!("cache entry {} is corrupted, evicting", observed.key);
        if let Some(entry) = index.remove(&observed.key) {
            let _ = remove_file(&entry.path);
        }
        true
    }

    async fn verify(&self, entry: &CacheEntry) -> Result<(), ImageCacheRepositoryError> {
        match tokio::fs::metadata(&entry.path).await {
            Ok(metadata) if metadata.len() == entry.size => Ok(()),
            Ok(_) => Err(ImageCacheRepositoryError::Corrupted(entry.key.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImageCacheRepositoryError::Corrupted(entry.key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_file(path: &Path) -> Result<(), std::io::Error> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl ImageCacheRepository for DiskCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ImageCacheRepositoryError> {
        // a file replaced while it was read is read again through the new entry
        loop {
            let Some(entry) = self.index().touch(key) else {
                return Ok(None);
            };

            match tokio::fs::read(&entry.path).await {
                Ok(data) if data.len() as u64 == entry.size => return Ok(Some(Bytes::from(data))),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            if self.evict_corrupted(&entry) {
                return Ok(None);
            }
        }
    }

    async fn set(&self, key: &str, data: &[u8]) -> Result<PathBuf, ImageCacheRepositoryError> {
        let size = data.len() as u64;
        if size > self.max_size {
            return Err(ImageCacheRepositoryError::FileError(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("{size} bytes exceed cache budget of {}", self.max_size),
            )));
        }

        let path = self.dir.join(key);
        let tmp = self
            .dir
            .join(format!(".{key}.{:016x}{TEMP_SUFFIX}", rand::random::<u64>()));

        if let Err(e) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let mut index = self.index();
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        index.insert(key, path.clone(), size);
        self.trim(&mut index);

        Ok(path)
    }

    async fn remove(&self, key: &str) -> Result<(), ImageCacheRepositoryError> {
        let mut index = self.index();
        if let Some(entry) = index.remove(key) {
            remove_file(&entry.path)?;
        }

        Ok(())
    }

    async fn image_path(&self, key: &str) -> Result<Option<PathBuf>, ImageCacheRepositoryError> {
        loop {
            let Some(entry) = self.index().touch(key) else {
                return Ok(None);
            };

            match self.verify(&entry).await {
                Ok(()) => return Ok(Some(entry.path)),
                Err(ImageCacheRepositoryError::Corrupted(_)) => {
                    if self.evict_corrupted(&entry) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn current_size(&self) -> u64 {
        self.index().total_size
    }

    fn len(&self) -> usize {
        self.index().entries.len()
    }
}
