pub mod assets;
pub mod cache;
pub mod config;
pub mod database;
pub mod detector;
pub mod errors;
pub mod media_utils;
pub mod metadata;
pub mod model;
pub mod notify;
pub mod query;
pub mod scanner;
pub mod sizes;
pub mod writer;

use assets::AssetPipeline;
use cache::ResponseCache;
use config::Config;
use database::Database;
use errors::AppResult;
use metadata::Extractor;
use notify::Notifier;
use query::QueryEngine;
use scanner::Scanner;
use std::sync::Arc;
use writer::IndexWriter;

/// Upper bound on cached query responses.
const RESPONSE_CACHE_CAPACITY: u64 = 2000;

/// Installs env_logger, reading `RUST_LOG` and defaulting to `info`.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Everything a host needs, wired from one [`Config`].
pub struct Library {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub cache: ResponseCache,
    pub writer: Arc<IndexWriter>,
    pub assets: Arc<AssetPipeline>,
    pub scanner: Arc<Scanner>,
    pub query: QueryEngine,
}

impl Library {
    pub fn open(config: Config, notifier: Notifier) -> AppResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data)?;
        std::fs::create_dir_all(&config.cache)?;
        log::debug!("Using data directory {:?}, cache {:?}", config.data, config.cache);

        let config = Arc::new(config);
        let db = Arc::new(Database::new(config.database_path())?);
        let cache = ResponseCache::new(RESPONSE_CACHE_CAPACITY, config.dev);
        let writer = Arc::new(IndexWriter::new(db.clone(), cache.clone(), config.cache.clone()));
        let assets = Arc::new(AssetPipeline::new(db.clone(), &config));
        let source = Arc::new(Extractor::from_config(&config)?);
        let scanner = Arc::new(Scanner::new(
            db.clone(),
            writer.clone(),
            source,
            assets.clone(),
            config.clone(),
            notifier,
        ));
        let query = QueryEngine::from_config(db.clone(), &config);

        log::info!("Opened library at {:?}", config.media);
        Ok(Self {
            config,
            db,
            cache,
            writer,
            assets,
            scanner,
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FilterParams;

    #[test]
    fn test_open_creates_store() {
        let media = tempfile::tempdir().expect("tempdir");
        let data = tempfile::tempdir().expect("tempdir");
        let config = Config::new(media.path(), data.path().join("lightbox"));

        let library = Library::open(config, notify::log_notifier()).expect("open");

        assert!(library.config.database_path().exists());
        assert!(library.config.cache.is_dir());
        assert!(!library.scanner.is_in_progress());
        assert_eq!(library.query.total(&FilterParams::default()).expect("total"), 0);
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let media = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new(media.path(), media.path().join("data"));
        config.quality = 0;

        assert!(matches!(
            Library::open(config, notify::log_notifier()),
            Err(errors::AppError::Config(_))
        ));
    }
}
