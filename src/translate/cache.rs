//! Translation cache: in-memory LRU in front of the persistent SQLite table.
//! Key: blake3 hash of (target_lang | normalized_text).
//! Every hit is counted through the background `HitRecorder`; the read path
//! never waits for that write.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::hit_recorder::HitRecorder;
use super::normalize::normalize_source;
use super::sqlite_cache::{CacheEntry, CacheStatistics, SqliteCache};
use crate::config::CacheConfig;
use crate::error::StoreError;

/// Identity of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Compute the key; `text` is normalized first.
    pub fn new(text: &str, target_lang: &str) -> Self {
        let normalized = normalize_source(text);
        let mut hasher = blake3::Hasher::new();
        hasher.update(target_lang.as_bytes());
        hasher.update(b"|");
        hasher.update(normalized.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

struct CacheInner {
    memory: Mutex<LruCache<CacheKey, String>>,
    /// Held across every persistent operation that writes `memory`, so the
    /// memory tier always mirrors the last committed row.
    fill: Mutex<()>,
    store: Arc<SqliteCache>,
    recorder: HitRecorder,
}

/// Shared handle to the translation cache. Cheap to clone.
#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<CacheInner>,
}

impl TranslationCache {
    /// Open the persistent cache described by `config`.
    pub fn open(config: &CacheConfig) -> Result<Self, StoreError> {
        let store = Arc::new(SqliteCache::open(&config.path)?);
        Self::with_store(
            store,
            config.memory_capacity,
            Duration::from_millis(config.touch_flush_ms),
        )
    }

    /// Non-persistent cache, for tests and dry runs.
    pub fn in_memory(memory_capacity: usize) -> Result<Self, StoreError> {
        let store = Arc::new(SqliteCache::open_in_memory()?);
        Self::with_store(store, memory_capacity, Duration::from_millis(250))
    }

    pub fn with_store(
        store: Arc<SqliteCache>,
        memory_capacity: usize,
        touch_flush: Duration,
    ) -> Result<Self, StoreError> {
        let capacity = NonZeroUsize::new(memory_capacity).unwrap_or(NonZeroUsize::MIN);
        let recorder = HitRecorder::start(Arc::clone(&store), touch_flush)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                memory: Mutex::new(LruCache::new(capacity)),
                fill: Mutex::new(()),
                store,
                recorder,
            }),
        })
    }

    /// Look up a cached translation.
    /// Storage errors are returned, never swallowed; a miss is `Ok(None)`.
    pub async fn lookup(&self, text: &str, target_lang: &str) -> Result<Option<String>, StoreError> {
        let key = CacheKey::new(text, target_lang);

        let cached = self.inner.memory.lock().get(&key).cloned();
        if let Some(hit) = cached {
            self.inner.recorder.record(key);
            return Ok(Some(hit));
        }

        let inner = Arc::clone(&self.inner);
        let found = tokio::task::spawn_blocking(move || {
            let _fill = inner.fill.lock();
            let found = inner.store.get(&key)?;
            if let Some(translated) = &found {
                inner.memory.lock().put(key, translated.clone());
            }
            Ok::<_, StoreError>(found)
        })
        .await??;

        if found.is_some() {
            debug!("persistent cache hit");
            self.inner.recorder.record(key);
        }
        Ok(found)
    }

    /// Record a translation. An existing entry keeps its text.
    pub async fn store(
        &self,
        text: &str,
        target_lang: &str,
        translated_text: &str,
    ) -> Result<(), StoreError> {
        self.upsert(text, target_lang, translated_text, false).await
    }

    /// Record a translation, replacing any existing text.
    pub async fn refresh(
        &self,
        text: &str,
        target_lang: &str,
        translated_text: &str,
    ) -> Result<(), StoreError> {
        self.upsert(text, target_lang, translated_text, true).await
    }

    async fn upsert(
        &self,
        text: &str,
        target_lang: &str,
        translated_text: &str,
        refresh: bool,
    ) -> Result<(), StoreError> {
        let key = CacheKey::new(text, target_lang);
        let source = normalize_source(text);
        let lang = target_lang.to_string();
        let translated = translated_text.to_string();
        let inner = Arc::clone(&self.inner);

        // Read back the winning text so the memory tier mirrors the table.
        tokio::task::spawn_blocking(move || {
            let _fill = inner.fill.lock();
            inner.store.upsert(&key, &source, &lang, &translated, refresh)?;
            if let Some(current) = inner.store.get(&key)? {
                inner.memory.lock().put(key, current);
            }
            Ok::<_, StoreError>(())
        })
        .await?
    }

    /// Stored row for a (text, language) pair.
    pub async fn entry(&self, text: &str, target_lang: &str) -> Result<Option<CacheEntry>, StoreError> {
        let key = CacheKey::new(text, target_lang);
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || store.entry(&key)).await?
    }

    pub async fn statistics(&self) -> Result<CacheStatistics, StoreError> {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || store.statistics()).await?
    }

    /// Remove all entries, or those of one language.
    pub async fn clear(&self, target_lang: Option<String>) -> Result<usize, StoreError> {
        // Pending hits would only touch rows that are about to go.
        self.flush().await?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let _fill = inner.fill.lock();
            let removed = inner.store.clear(target_lang.as_deref())?;
            inner.memory.lock().clear();
            Ok::<_, StoreError>(removed)
        })
        .await?
    }

    /// Wait until queued hit counters are written.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.recorder.flush()).await?;
        Ok(())
    }
}
