//! On-disk layout of downloaded chapters.
//!
//! ```text
//! <root>/queue.json
//! <root>/<source name>/<manga title>/<chapter title>_<chapter id>/001.jpg
//! <root>/<source name>/<manga title>/<chapter title>_<chapter id>/manifest.json
//! ```

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::domain::entities::download::{ChapterManifest, DownloadRequest};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const QUEUE_FILE: &str = "queue.json";
const TEMP_SUFFIX: &str = ".part";
const DEFAULT_EXTENSION: &str = "jpg";

pub fn sanitize(name: &str) -> String {
    name.replace(&['\\', '/', ':', '*', '?', '\"', '<', '>', '|'][..], "")
        .trim()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct DownloadLayout {
    root: PathBuf,
}

impl DownloadLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: PathBuf::new().join(root),
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.root.join(QUEUE_FILE)
    }

    pub fn chapter_dir(
        &self,
        source_name: &str,
        manga_title: &str,
        chapter_title: &str,
        chapter_id: i64,
    ) -> PathBuf {
        self.root
            .join(sanitize(source_name))
            .join(sanitize(manga_title))
            .join(format!("{}_{chapter_id}", sanitize(chapter_title)))
    }

    /// Every complete chapter under the root, keyed by its directory.
    pub fn scan_manifests(&self) -> Vec<(PathBuf, ChapterManifest)> {
        let mut found = vec![];
        for source_dir in subdirs(&self.root) {
            for manga_dir in subdirs(&source_dir) {
                for chapter_dir in subdirs(&manga_dir) {
                    match read_manifest(&chapter_dir) {
                        Ok(Some(manifest)) => found.push((chapter_dir, manifest)),
                        Ok(None) => {}
                        Err(e) => {
                            warn!("unreadable manifest in {}: {e}", chapter_dir.display())
                        }
                    }
                }
            }
        }

        found
    }

    /// Directory of a chapter found by its id suffix, complete or not.
    pub fn find_chapter_dir(&self, chapter_id: i64) -> Option<PathBuf> {
        let suffix = format!("_{chapter_id}");
        subdirs(&self.root)
            .iter()
            .flat_map(|source_dir| subdirs(source_dir))
            .flat_map(|manga_dir| subdirs(&manga_dir))
            .find(|dir| {
                dir.file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(&suffix))
            })
    }

    pub fn read_queue(&self) -> Result<Vec<DownloadRequest>> {
        match std::fs::read(self.queue_path()) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_queue(&self, queue: &[DownloadRequest]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        write_atomic(&self.queue_path(), &serde_json::to_vec_pretty(queue)?).await
    }
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

/// Image extension taken from the url path, `jpg` when there is none.
pub fn image_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=4).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// File name of the page at zero based `index`.
pub fn page_file_name(index: usize, url: &str) -> String {
    format!("{:03}.{}", index + 1, image_extension(url))
}

/// Zero based page index of a published page file name.
fn page_index(name: &str) -> Option<usize> {
    if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
        return None;
    }
    let (number, _) = name.split_once('.')?;
    number.parse::<usize>().ok()?.checked_sub(1)
}

/// Make `dir` ready for a download to resume in it: create it, drop
/// temporary files of interrupted writes and list the pages already
/// published, by index.
pub async fn prepare_chapter_dir(dir: &Path) -> Result<HashMap<usize, String>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<HashMap<usize, String>> {
        std::fs::create_dir_all(&dir)?;

        let mut published = HashMap::new();
        for entry in std::fs::read_dir(&dir)?.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                let _ = std::fs::remove_file(entry.path());
            } else if let Some(index) = page_index(&name) {
                published.insert(index, name);
            }
        }

        Ok(published)
    })
    .await?
}

/// Write `data` next to `path` and rename it into place.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{name}.{:016x}{TEMP_SUFFIX}",
        rand::random::<u64>()
    ));

    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    Ok(())
}

pub fn read_manifest(dir: &Path) -> Result<Option<ChapterManifest>> {
    match std::fs::read(dir.join(MANIFEST_FILE)) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `read_manifest` for async callers.
pub async fn load_manifest(dir: &Path) -> Result<Option<ChapterManifest>> {
    match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn write_manifest(dir: &Path, manifest: &ChapterManifest) -> Result<()> {
    write_atomic(
        &dir.join(MANIFEST_FILE),
        &serde_json::to_vec_pretty(manifest)?,
    )
    .await
}
