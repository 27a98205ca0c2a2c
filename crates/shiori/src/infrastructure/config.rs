use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCredential {
    pub username: String,
    pub password: String,
}

impl SourceCredential {
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    #[serde(skip)]
    path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_create_database")]
    pub create_database: bool,
    /// Upper bound of the SQLite connection pool.
    #[serde(default = "default_database_connections")]
    pub database_connections: u32,
    #[serde(default = "default_download_path")]
    pub download_path: String,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    /// Budget of the page image cache, in bytes.
    #[serde(default = "default_page_cache_size")]
    pub page_cache_size: u64,
    /// Budget of the cover thumbnail cache, in bytes.
    #[serde(default = "default_cover_cache_size")]
    pub cover_cache_size: u64,
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default = "default_retries")]
    pub download_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_loader_concurrency")]
    pub loader_concurrency: usize,
    #[serde(default = "default_retries")]
    pub page_retries: usize,
    #[serde(default)]
    pub remove_after_read: bool,
    #[serde(default)]
    pub remove_after_read_previous: bool,
    #[serde(default = "default_save_chapter_progress")]
    pub save_chapter_progress: bool,
    #[serde(default)]
    pub auto_update_sync: bool,
    #[serde(default = "default_enabled_languages")]
    pub enabled_languages: Vec<String>,
    #[serde(default)]
    pub last_used_source: Option<i64>,
    #[serde(default)]
    pub source_credentials: HashMap<i64, SourceCredential>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: shiori_home().join("config.yml"),
            database_path: default_database_path(),
            create_database: default_create_database(),
            database_connections: default_database_connections(),
            download_path: default_download_path(),
            cache_path: default_cache_path(),
            page_cache_size: default_page_cache_size(),
            cover_cache_size: default_cover_cache_size(),
            download_workers: default_download_workers(),
            download_retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            loader_concurrency: default_loader_concurrency(),
            page_retries: default_retries(),
            remove_after_read: false,
            remove_after_read_previous: false,
            save_chapter_progress: default_save_chapter_progress(),
            auto_update_sync: false,
            enabled_languages: default_enabled_languages(),
            last_used_source: None,
            source_credentials: HashMap::new(),
        }
    }
}

fn shiori_home() -> PathBuf {
    match std::env::var("SHIORI_HOME") {
        Ok(path) => PathBuf::from(path),
        Err(_) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shiori"),
    }
}

fn default_database_path() -> String {
    let path = shiori_home();
    if !path.exists() {
        let _ = std::fs::create_dir_all(&path);
    }
    path.join("shiori.db").display().to_string()
}

fn default_create_database() -> bool {
    true
}

fn default_database_connections() -> u32 {
    4
}

fn default_download_path() -> String {
    let path = shiori_home().join("downloads");
    if !path.exists() {
        let _ = std::fs::create_dir_all(&path);
    }
    path.display().to_string()
}

fn default_cache_path() -> String {
    let path = shiori_home().join("cache");
    if !path.exists() {
        let _ = std::fs::create_dir_all(&path);
    }
    path.display().to_string()
}

fn default_page_cache_size() -> u64 {
    100 * 1024 * 1024
}

fn default_cover_cache_size() -> u64 {
    15 * 1024 * 1024
}

fn default_download_workers() -> usize {
    2
}

fn default_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_loader_concurrency() -> usize {
    4
}

fn default_save_chapter_progress() -> bool {
    true
}

fn default_enabled_languages() -> Vec<String> {
    vec!["en".to_string()]
}

impl Config {
    pub fn open<P: AsRef<Path>>(path: Option<P>) -> Result<Config, anyhow::Error> {
        let config_path = match path {
            Some(p) => PathBuf::new().join(p),
            None => shiori_home().join("config.yml"),
        };

        match std::fs::File::open(&config_path) {
            Ok(file) => {
                info!("open config from {:?}", config_path);
                let mut cfg: Self = serde_yml::from_reader(file)?;
                cfg.path = config_path;
                Ok(cfg)
            }
            Err(_) => {
                let cfg = Config {
                    path: config_path,
                    ..Default::default()
                };
                cfg.save()?;
                info!("write default config at {:?}", cfg.path);
                Ok(cfg)
            }
        }
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_yml::to_string(&self)?)?;

        Ok(())
    }

    pub fn page_cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_path).join("pages")
    }

    pub fn cover_cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_path).join("covers")
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let cfg: Config = serde_yml::from_str("remove_after_read: true\ndownload_workers: 1\n")
            .expect("parse config");

        assert!(cfg.remove_after_read);
        assert!(!cfg.remove_after_read_previous);
        assert_eq!(cfg.download_workers, 1);
        assert_eq!(cfg.page_cache_size, 100 * 1024 * 1024);
        assert_eq!(cfg.cover_cache_size, 15 * 1024 * 1024);
        assert_eq!(cfg.enabled_languages, vec!["en".to_string()]);
    }

    #[test]
    fn test_open_writes_default_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");

        let cfg = Config::open(Some(&path)).expect("open config");
        assert!(path.exists());

        let reopened = Config::open(Some(&path)).expect("reopen config");
        assert_eq!(cfg.download_workers, reopened.download_workers);
        assert_eq!(cfg.database_path, reopened.database_path);
    }
}
