#[macro_use]
extern crate log;

use clap::{Parser, Subcommand};
use shiori::{
    application::worker::downloads::{DownloadManager, DownloadOptions},
    domain::repositories::image_cache::ImageCacheRepository,
    infrastructure::{
        config::{Config, GLOBAL_CONFIG},
        domain::repositories::image_cache::DiskCache,
        source::SourceManager,
        storage::DownloadLayout,
    },
};

#[derive(Parser)]
struct Opts {
    /// Path to config file
    #[clap(long)]
    config: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show cache usage and download counts
    Status,
    /// List downloaded chapters
    Downloads,
    /// Empty the page cache
    ClearCache {
        /// Empty the cover cache as well
        #[clap(long)]
        covers: bool,
    },
}

fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        if let Ok(level) = std::env::var("SHIORI_LOG") {
            builder.parse_filters(&format!("shiori={level}"));
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logger();

    let opts: Opts = Opts::parse();
    let config = GLOBAL_CONFIG.get_or_try_init(|| Config::open(opts.config))?;
    debug!("config: {:?}", config);

    let page_cache = DiskCache::open(config.page_cache_path(), config.page_cache_size)?;
    let cover_cache = DiskCache::open(config.cover_cache_path(), config.cover_cache_size)?;

    let downloads = DownloadManager::new(
        &config.download_path,
        SourceManager::new(),
        page_cache.clone(),
        DownloadOptions::from(config),
    );

    match opts.command {
        Command::Status => {
            let downloaded = downloads.downloaded_chapters().await?;
            let queued = DownloadLayout::new(&config.download_path).read_queue()?;

            println!(
                "page cache:  {} entries, {} / {} bytes",
                page_cache.len(),
                page_cache.current_size(),
                page_cache.max_size()
            );
            println!(
                "cover cache: {} entries, {} / {} bytes",
                cover_cache.len(),
                cover_cache.current_size(),
                cover_cache.max_size()
            );
            println!("downloaded chapters: {}", downloaded.len());
            println!("queued chapters: {}", queued.len());
        }
        Command::Downloads => {
            let mut downloaded = downloads.downloaded_chapters().await?;
            downloaded.sort_by(|a, b| {
                a.manga_title
                    .cmp(&b.manga_title)
                    .then_with(|| a.chapter_title.cmp(&b.chapter_title))
            });
            for manifest in downloaded {
                println!(
                    "{}\t{}\t{} pages\t{}",
                    manifest.manga_title,
                    manifest.chapter_title,
                    manifest.pages.len(),
                    manifest.completed_at
                );
            }
        }
        Command::ClearCache { covers } => {
            page_cache.clear()?;
            info!("cleared page cache at {}", page_cache.dir().display());
            if covers {
                cover_cache.clear()?;
                info!("cleared cover cache at {}", cover_cache.dir().display());
            }
        }
    }

    Ok(())
}
