//! Persistent translation cache backed by SQLite.
//! One row per (target language, normalized text); rows are never expired,
//! only removed by an explicit `clear`.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use super::cache::CacheKey;
use crate::error::StoreError;
use crate::now_unix;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS translation_cache (
        cache_key BLOB PRIMARY KEY,
        source_text TEXT NOT NULL,
        target_lang TEXT NOT NULL,
        translated_text TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_used INTEGER NOT NULL,
        hit_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_cache_lang
        ON translation_cache(target_lang);";

/// A full cache row, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub source_text: String,
    pub target_lang: String,
    pub translated_text: String,
    pub last_used: i64,
    pub hit_count: u64,
}

/// Aggregate figures over the whole key space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub total_count: u64,
    pub language_count: u64,
    pub total_hits: u64,
}

impl CacheStatistics {
    /// True when the entry count is past `threshold`.
    pub fn exceeds(&self, threshold: u64) -> bool {
        self.total_count > threshold
    }
}

/// Queued hit-count increment for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    pub key: CacheKey,
    pub hits: u64,
    pub last_used: i64,
}

/// SQLite-backed translation cache.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open (or create) the SQLite cache database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), "SQLite translation cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Look up a translation. Does not touch hit counters.
    pub fn get(&self, key: &CacheKey) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT translated_text FROM translation_cache WHERE cache_key = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Full row for a key.
    pub fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT source_text, target_lang, translated_text, last_used, hit_count
                 FROM translation_cache WHERE cache_key = ?1",
                params![key.as_bytes().as_slice()],
                |row| {
                    Ok(CacheEntry {
                        source_text: row.get(0)?,
                        target_lang: row.get(1)?,
                        translated_text: row.get(2)?,
                        last_used: row.get(3)?,
                        hit_count: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert a translation, or bump `last_used`/`hit_count` on an existing row.
    /// The stored translation is replaced only when `refresh` is set.
    pub fn upsert(
        &self,
        key: &CacheKey,
        source_text: &str,
        target_lang: &str,
        translated_text: &str,
        refresh: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = now_unix();
        conn.execute(
            "INSERT INTO translation_cache
             (cache_key, source_text, target_lang, translated_text, created_at, last_used, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)
             ON CONFLICT(cache_key) DO UPDATE SET
                last_used = excluded.last_used,
                hit_count = hit_count + 1,
                translated_text = CASE WHEN ?6 THEN excluded.translated_text
                                       ELSE translated_text END",
            params![
                key.as_bytes().as_slice(),
                source_text,
                target_lang,
                translated_text,
                now,
                refresh
            ],
        )?;
        Ok(())
    }

    /// Apply queued hit increments in one transaction.
    /// Increments are relative (`hit_count + n`) so concurrent writers never lose counts.
    pub fn apply_touches(&self, touches: &[Touch]) -> Result<usize, StoreError> {
        if touches.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE translation_cache
                 SET hit_count = hit_count + ?2, last_used = MAX(last_used, ?3)
                 WHERE cache_key = ?1",
            )?;
            for touch in touches {
                updated += stmt.execute(params![
                    touch.key.as_bytes().as_slice(),
                    touch.hits as i64,
                    touch.last_used
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = touches.len(), updated, "cache touches applied");
        Ok(updated)
    }

    pub fn statistics(&self) -> Result<CacheStatistics, StoreError> {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT target_lang), COALESCE(SUM(hit_count), 0)
             FROM translation_cache",
            [],
            |row| {
                Ok(CacheStatistics {
                    total_count: row.get::<_, i64>(0)? as u64,
                    language_count: row.get::<_, i64>(1)? as u64,
                    total_hits: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(stats)
    }

    /// Delete every entry, or only those of one target language.
    pub fn clear(&self, target_lang: Option<&str>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = match target_lang {
            Some(lang) => conn.execute(
                "DELETE FROM translation_cache WHERE target_lang = ?1",
                params![lang],
            )?,
            None => conn.execute("DELETE FROM translation_cache", [])?,
        };
        info!(removed, lang = target_lang.unwrap_or("*"), "translation cache cleared");
        Ok(removed)
    }
}
