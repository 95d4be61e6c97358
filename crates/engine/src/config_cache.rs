use std::sync::Arc;
use std::time::{Duration, Instant};

use engram_config::Settings;
use engram_store::{MetadataStore, StoreError};
use tokio::sync::RwLock;
use tracing::warn;

/// Hot-reloadable view over the persisted settings document.
///
/// Reads happen at the top of each operation; the brief in-process cache
/// keeps that cheap.  [`ConfigCache::update`] persists and takes effect on
/// the next operation, with no restart required.
pub struct ConfigCache {
    store: MetadataStore,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<Settings>)>>,
}

impl ConfigCache {
    pub fn new(store: MetadataStore, ttl: Duration) -> Self {
        Self { store, ttl, cached: RwLock::new(None) }
    }

    pub async fn current(&self) -> Arc<Settings> {
        if let Some((loaded_at, settings)) = self.cached.read().await.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return settings.clone();
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some((loaded_at, settings)) = guard.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return settings.clone();
            }
        }

        let settings = match self.store.load_settings().await {
            Ok(stored) => {
                let mut settings = stored.unwrap_or_default();
                settings.apply_env();
                Arc::new(settings)
            }
            Err(err) => {
                warn!(error = %err, "settings reload failed; keeping last known values");
                match guard.as_ref() {
                    Some((_, previous)) => previous.clone(),
                    None => {
                        let mut settings = Settings::default();
                        settings.apply_env();
                        Arc::new(settings)
                    }
                }
            }
        };
        *guard = Some((Instant::now(), settings.clone()));
        settings
    }

    /// Persist new settings and drop the cache so the next operation
    /// observes them.
    pub async fn update(&self, settings: Settings) -> Result<(), StoreError> {
        self.store.save_settings(&settings).await?;
        *self.cached.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn update_is_visible_on_the_next_read() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let cache = ConfigCache::new(store, Duration::from_secs(60));

        assert!(cache.current().await.memory.default_infer);

        let mut settings = Settings::default();
        settings.memory.default_infer = false;
        cache.update(settings).await?;

        assert!(!cache.current().await.memory.default_infer);
        Ok(())
    }

    #[tokio::test]
    async fn cache_serves_within_ttl_without_reload() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let cache = ConfigCache::new(store.clone(), Duration::from_secs(60));
        let first = cache.current().await;

        // A direct store write is not observed until the TTL lapses.
        let mut settings = Settings::default();
        settings.memory.dedup_top_k = 9;
        store.save_settings(&settings).await?;

        assert_eq!(cache.current().await.memory.dedup_top_k, first.memory.dedup_top_k);
        Ok(())
    }
}
