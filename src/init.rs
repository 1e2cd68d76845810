//! Initialization helpers for the application startup.

use crate::config::Config;
use crate::store::{DurableStore, MemoryStore, SqliteStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Sets up the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Opens the configured SQLite store, or an in-memory one if no cache path
/// is set.
pub fn open_store(config: &Config) -> Result<Arc<dyn DurableStore>> {
    match &config.cache {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("Unable to init store '{}'", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            info!("No cache configured, blackhole entries will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
