//! Batch translation engine.
//! Deduplicates the input, resolves what it can from the cache, sends the
//! rest to the remote client in bounded sequential batches, and expands the
//! results back to the caller's positions.
//!
//! Guarantees:
//! - output length equals input length and `output[i]` answers `input[i]`
//! - a failed batch empties only its own positions; the run continues
//! - cancellation is checked before each batch, never mid-batch
//! - per-key storage errors degrade to cache misses or unpersisted results

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError, TranslateError};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::translate::cache::TranslationCache;
use crate::translate::normalize::{is_blank, normalize_source};
use crate::translate::TranslationClient;

/// Per-run figures. Derived, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TranslationStatistics {
    pub total_text_count: usize,
    pub unique_text_count: usize,
    pub success_count: usize,
    /// `total_text_count - success_count`; includes blank inputs.
    pub failure_count: usize,
    /// Blank inputs, which never reach the cache or the client.
    pub skipped_count: usize,
    /// Unique texts answered by the cache.
    pub cache_hit_count: usize,
    pub api_call_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// One entry per input position; empty when blank, failed or not reached.
    pub translations: Vec<String>,
    pub statistics: TranslationStatistics,
    pub cancelled: bool,
}

/// A distinct source text and every input position that carries it.
struct UniqueText {
    normalized: String,
    positions: Vec<usize>,
}

/// Deduplication index in first-seen order.
fn build_index(texts: &[String]) -> Vec<UniqueText> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut uniques: Vec<UniqueText> = Vec::new();

    for (pos, text) in texts.iter().enumerate() {
        if is_blank(text) {
            continue;
        }
        let normalized = normalize_source(text);
        match slots.get(&normalized) {
            Some(&slot) => uniques[slot].positions.push(pos),
            None => {
                slots.insert(normalized.clone(), uniques.len());
                uniques.push(UniqueText {
                    normalized,
                    positions: vec![pos],
                });
            }
        }
    }
    uniques
}

/// Orchestrates cache, client and progress for batch runs.
/// Cheap to clone; concurrent runs share only the cache.
#[derive(Clone)]
pub struct BatchEngine {
    cache: TranslationCache,
    client: Arc<dyn TranslationClient>,
    metrics: Arc<MetricsRegistry>,
    batch_size: usize,
    batch_timeout: Option<Duration>,
}

impl BatchEngine {
    pub fn new(
        cache: TranslationCache,
        client: Arc<dyn TranslationClient>,
        metrics: Arc<MetricsRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache,
            client,
            metrics,
            batch_size: config.effective_batch_size(),
            batch_timeout: config.batch_timeout(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn client(&self) -> &Arc<dyn TranslationClient> {
        &self.client
    }

    /// Translate `texts` into `target_lang`.
    ///
    /// Fails only before any batch is issued: on an empty target language, or
    /// when texts need the remote service and it has no credentials.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        target_lang: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, EngineError> {
        let target_lang = target_lang.trim();
        if target_lang.is_empty() {
            return Err(EngineError::InvalidInput("target language is empty".into()));
        }

        let run_timer = self.metrics.timer(metric_names::RUN_TOTAL);
        let uniques = build_index(texts);
        let mut results: Vec<String> = vec![String::new(); texts.len()];
        let mut stats = TranslationStatistics {
            total_text_count: texts.len(),
            unique_text_count: uniques.len(),
            skipped_count: texts.iter().filter(|t| is_blank(t)).count(),
            ..Default::default()
        };
        let mut tracker = ProgressTracker::new(progress, uniques.len());

        // Cache pass: resolve hits, keep first-seen order for the rest.
        let mut pending: Vec<&UniqueText> = Vec::new();
        for unique in &uniques {
            let timer = self.metrics.timer(metric_names::CACHE_LOOKUP);
            let cached = match self.cache.lookup(&unique.normalized, target_lang).await {
                Ok(hit) => hit,
                // The blocking pool is gone; nothing below can work either.
                Err(e @ StoreError::Task(_)) => return Err(EngineError::StoreUnavailable(e)),
                Err(e) => {
                    warn!(error = %e, "cache lookup failed, treating as miss");
                    None
                }
            };
            timer.stop();

            match cached {
                Some(translated) if !translated.is_empty() => {
                    fill(&mut results, &unique.positions, &translated);
                    stats.cache_hit_count += 1;
                    tracker.advance(1);
                }
                _ => pending.push(unique),
            }
        }
        tracker.emit();

        if !pending.is_empty() && !self.client.has_api_key() {
            return Err(EngineError::UpstreamUnavailable(
                "no API key configured for the translation service".into(),
            ));
        }

        let batches: Vec<&[&UniqueText]> = pending.chunks(self.batch_size).collect();
        let mut cancelled = false;
        info!(
            total = stats.total_text_count,
            unique = stats.unique_text_count,
            cache_hits = stats.cache_hit_count,
            batches = batches.len(),
            target_lang,
            "batch translation started"
        );

        for (index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(completed_batches = index, remaining = batches.len() - index, "translation cancelled");
                cancelled = true;
                break;
            }

            let sources: Vec<String> = batch.iter().map(|u| u.normalized.clone()).collect();
            stats.api_call_count += 1;

            match self.call_client(&sources, target_lang).await {
                Ok(translated) => {
                    for (unique, text) in batch.iter().zip(translated) {
                        if text.trim().is_empty() {
                            debug!(source = %unique.normalized, "empty translation returned");
                            continue;
                        }
                        if let Err(e) = self.cache.store(&unique.normalized, target_lang, &text).await {
                            warn!(error = %e, "cache store failed, result not persisted");
                        }
                        fill(&mut results, &unique.positions, &text);
                    }
                }
                Err(e) => {
                    warn!(
                        batch = index + 1,
                        size = batch.len(),
                        error = %e,
                        "batch failed, positions left empty"
                    );
                }
            }

            tracker.advance(batch.len());
            tracker.emit();
        }

        if !cancelled {
            tracker.advance(uniques.len());
        }
        tracker.emit();

        stats.success_count = results.iter().filter(|r| !r.is_empty()).count();
        stats.failure_count = stats.total_text_count - stats.success_count;
        run_timer.stop();

        info!(
            success = stats.success_count,
            failure = stats.failure_count,
            api_calls = stats.api_call_count,
            cancelled,
            "batch translation finished"
        );

        Ok(BatchOutcome {
            translations: results,
            statistics: stats,
            cancelled,
        })
    }

    /// One remote call, bounded by the optional batch timeout, with a length check.
    async fn call_client(
        &self,
        sources: &[String],
        target_lang: &str,
    ) -> Result<Vec<String>, TranslateError> {
        let timer = self.metrics.timer(metric_names::BATCH_CALL);
        let call = self.client.translate_batch(sources, target_lang);
        let result = match self.batch_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(TranslateError::Timeout),
            },
            None => call.await,
        };
        timer.stop();

        let translated = result?;
        if translated.len() != sources.len() {
            return Err(TranslateError::MalformedResponse(format!(
                "expected {} translations, got {}",
                sources.len(),
                translated.len()
            )));
        }
        Ok(translated)
    }
}

fn fill(results: &mut [String], positions: &[usize], text: &str) {
    for &pos in positions {
        results[pos] = text.to_string();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::progress::{NoProgress, ProgressUpdate};
    use crate::translate::sqlite_cache::SqliteCache;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted client: translates from a dictionary, records every call,
    /// can fail chosen calls and cancel a token after a chosen call.
    pub(crate) struct FakeClient {
        pub dictionary: HashMap<String, String>,
        pub calls: Mutex<Vec<Vec<String>>>,
        pub fail_calls: Vec<usize>,
        pub cancel_after: Option<(usize, CancellationToken)>,
        pub has_key: bool,
    }

    impl FakeClient {
        pub(crate) fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                dictionary: pairs
                    .iter()
                    .map(|(s, t)| (s.to_string(), t.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                fail_calls: Vec::new(),
                cancel_after: None,
                has_key: true,
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl TranslationClient for FakeClient {
        fn has_api_key(&self) -> bool {
            self.has_key
        }

        async fn test_connection(&self) -> bool {
            self.has_key
        }

        async fn translate_batch(
            &self,
            texts: &[String],
            _target_lang: &str,
        ) -> Result<Vec<String>, TranslateError> {
            let call_no = {
                let mut calls = self.calls.lock();
                calls.push(texts.to_vec());
                calls.len()
            };
            if let Some((after, token)) = &self.cancel_after {
                if call_no == *after {
                    token.cancel();
                }
            }
            if self.fail_calls.contains(&call_no) {
                return Err(TranslateError::Api("injected failure".into()));
            }
            Ok(texts
                .iter()
                .map(|t| self.dictionary.get(t).cloned().unwrap_or_default())
                .collect())
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn engine_with(client: Arc<FakeClient>, batch_size: usize) -> BatchEngine {
        let cache = TranslationCache::in_memory(64).unwrap();
        let config = EngineConfig {
            batch_size,
            batch_timeout_secs: None,
        };
        BatchEngine::new(cache, client, Arc::new(MetricsRegistry::new()), &config)
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let client = Arc::new(FakeClient::new(&[("柱", "Column"), ("梁", "Beam")]));
        let engine = engine_with(Arc::clone(&client), 50);
        let input = strings(&["柱", "梁", "柱", ""]);
        let cancel = CancellationToken::new();

        let first = engine
            .translate_batch(&input, "en", &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(first.translations, strings(&["Column", "Beam", "Column", ""]));
        assert_eq!(*client.calls.lock(), vec![strings(&["柱", "梁"])]);
        let s = first.statistics;
        assert_eq!(
            (s.total_text_count, s.unique_text_count, s.success_count, s.failure_count, s.api_call_count),
            (4, 2, 3, 1, 1)
        );
        assert_eq!(s.skipped_count, 1);
        assert_eq!(engine.cache().statistics().await.unwrap().total_count, 2);

        let second = engine
            .translate_batch(&input, "en", &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(second.translations, first.translations);
        assert_eq!(second.statistics.api_call_count, 0);
        assert_eq!(second.statistics.cache_hit_count, 2);
        assert_eq!(client.call_count(), 1);

        let timings = engine.metrics.snapshot();
        assert_eq!(timings[metric_names::RUN_TOTAL].count, 2);
        assert_eq!(timings[metric_names::BATCH_CALL].count, 1);
        assert_eq!(timings[metric_names::CACHE_LOOKUP].count, 4);
    }

    #[tokio::test]
    async fn storage_faults_degrade_to_uncached_translation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = Arc::new(SqliteCache::open(&path).unwrap());
        let cache = TranslationCache::with_store(store, 64, Duration::from_secs(60)).unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE translation_cache")
            .unwrap();

        let client = Arc::new(FakeClient::new(&[("柱", "Column")]));
        let engine = BatchEngine::new(
            cache,
            Arc::clone(&client) as Arc<dyn TranslationClient>,
            Arc::new(MetricsRegistry::new()),
            &EngineConfig::default(),
        );
        let input = strings(&["柱", "柱"]);

        // Reads fail as misses, writes fail silently: every run translates.
        for run in 1..=2 {
            let outcome = engine
                .translate_batch(&input, "en", &NoProgress, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.translations, strings(&["Column", "Column"]));
            assert_eq!(outcome.statistics.success_count, 2);
            assert_eq!(outcome.statistics.cache_hit_count, 0);
            assert_eq!(client.call_count(), run);
        }
        assert!(engine.cache().lookup("柱", "en").await.is_err());
    }

    #[tokio::test]
    async fn duplicates_are_translated_once() {
        let client = Arc::new(FakeClient::new(&[("墙", "Wall")]));
        let engine = engine_with(Arc::clone(&client), 1);
        let input = strings(&["墙", " 墙", "墙 ", "墙"]);

        let outcome = engine
            .translate_batch(&input, "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.translations, strings(&["Wall"; 4]));
        assert_eq!(outcome.statistics.unique_text_count, 1);
        assert_eq!(outcome.statistics.api_call_count, 1);
    }

    #[tokio::test]
    async fn batches_respect_configured_size() {
        let pairs: Vec<(String, String)> =
            (0..7).map(|i| (format!("t{i}"), format!("T{i}"))).collect();
        let refs: Vec<(&str, &str)> = pairs.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let client = Arc::new(FakeClient::new(&refs));
        let engine = engine_with(Arc::clone(&client), 3);
        let input: Vec<String> = pairs.iter().map(|(s, _)| s.clone()).collect();

        let outcome = engine
            .translate_batch(&input, "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        let sizes: Vec<usize> = client.calls.lock().iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(outcome.statistics.api_call_count, 3);
        assert_eq!(outcome.translations[6], "T6");
    }

    #[tokio::test]
    async fn failed_batch_is_isolated() {
        let mut fake = FakeClient::new(&[("a", "A"), ("b", "B"), ("c", "C")]);
        fake.fail_calls = vec![2];
        let client = Arc::new(fake);
        let engine = engine_with(Arc::clone(&client), 1);
        let input = strings(&["a", "b", "c", "b"]);

        let outcome = engine
            .translate_batch(&input, "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.translations, strings(&["A", "", "C", ""]));
        assert_eq!(outcome.statistics.success_count, 2);
        assert_eq!(outcome.statistics.failure_count, 2);
        assert_eq!(outcome.statistics.api_call_count, 3);
        assert!(!outcome.cancelled);
        // The failed text was not cached and is retried next time.
        assert_eq!(engine.cache().lookup("b", "en").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_stops_at_batch_boundary() {
        let cancel = CancellationToken::new();
        let mut fake = FakeClient::new(&[("a", "A"), ("b", "B"), ("c", "C"), ("d", "D")]);
        fake.cancel_after = Some((2, cancel.clone()));
        let client = Arc::new(fake);
        let engine = engine_with(Arc::clone(&client), 1);
        engine.cache().store("d", "en", "D").await.unwrap();

        let input = strings(&["a", "b", "c", "d", ""]);
        let outcome = engine
            .translate_batch(&input, "en", &NoProgress, &cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        // Batch 2 finished even though cancellation arrived during it.
        assert_eq!(outcome.translations, strings(&["A", "B", "", "D", ""]));
        assert_eq!(client.call_count(), 2);
        let s = outcome.statistics;
        assert_eq!(s.success_count + s.failure_count, s.total_text_count);
        assert_eq!(s.api_call_count, 2);
    }

    #[tokio::test]
    async fn all_blank_input_needs_nothing() {
        let mut fake = FakeClient::new(&[]);
        fake.has_key = false;
        let client = Arc::new(fake);
        let engine = engine_with(Arc::clone(&client), 50);
        let input = strings(&["", "  ", "\t"]);

        let outcome = engine
            .translate_batch(&input, "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.translations, strings(&["", "", ""]));
        assert_eq!(outcome.statistics.api_call_count, 0);
        assert_eq!(outcome.statistics.unique_text_count, 0);
        assert_eq!(outcome.statistics.failure_count, 3);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_target_language_fails_fast() {
        let client = Arc::new(FakeClient::new(&[("a", "A")]));
        let engine = engine_with(Arc::clone(&client), 50);
        let result = engine
            .translate_batch(&strings(&["a"]), "  ", &NoProgress, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_key_fails_only_when_remote_work_remains() {
        let mut fake = FakeClient::new(&[]);
        fake.has_key = false;
        let engine = engine_with(Arc::new(fake), 50);
        engine.cache().store("柱", "en", "Column").await.unwrap();

        let cached_only = engine
            .translate_batch(&strings(&["柱"]), "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cached_only.translations, strings(&["Column"]));

        let needs_remote = engine
            .translate_batch(&strings(&["柱", "梁"]), "en", &NoProgress, &CancellationToken::new())
            .await;
        assert!(matches!(needs_remote, Err(EngineError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn short_response_fails_the_batch() {
        struct ShortClient;

        #[async_trait]
        impl TranslationClient for ShortClient {
            fn has_api_key(&self) -> bool {
                true
            }
            async fn test_connection(&self) -> bool {
                true
            }
            async fn translate_batch(
                &self,
                _texts: &[String],
                _target_lang: &str,
            ) -> Result<Vec<String>, TranslateError> {
                Ok(vec!["only one".into()])
            }
        }

        let engine = BatchEngine::new(
            TranslationCache::in_memory(8).unwrap(),
            Arc::new(ShortClient),
            Arc::new(MetricsRegistry::new()),
            &EngineConfig::default(),
        );
        let outcome = engine
            .translate_batch(&strings(&["a", "b"]), "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.translations, strings(&["", ""]));
        assert_eq!(outcome.statistics.api_call_count, 1);
    }

    #[tokio::test]
    async fn slow_batch_times_out() {
        struct SlowClient;

        #[async_trait]
        impl TranslationClient for SlowClient {
            fn has_api_key(&self) -> bool {
                true
            }
            async fn test_connection(&self) -> bool {
                true
            }
            async fn translate_batch(
                &self,
                texts: &[String],
                _target_lang: &str,
            ) -> Result<Vec<String>, TranslateError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(texts.to_vec())
            }
        }

        let config = EngineConfig {
            batch_size: 50,
            batch_timeout_secs: Some(1),
        };
        let engine = BatchEngine::new(
            TranslationCache::in_memory(8).unwrap(),
            Arc::new(SlowClient),
            Arc::new(MetricsRegistry::new()),
            &config,
        );
        let outcome = engine
            .translate_batch(&strings(&["a"]), "en", &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.translations, strings(&[""]));
        assert_eq!(outcome.statistics.failure_count, 1);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_completes() {
        let client = Arc::new(FakeClient::new(&[("a", "A"), ("b", "B"), ("c", "C")]));
        let engine = engine_with(Arc::clone(&client), 1);
        engine.cache().store("a", "en", "A").await.unwrap();

        let seen = Mutex::new(Vec::<ProgressUpdate>::new());
        let sink = |u: ProgressUpdate| seen.lock().push(u);
        engine
            .translate_batch(&strings(&["a", "b", "c"]), "en", &sink, &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.lock();
        let percents: Vec<f64> = seen.iter().map(|u| u.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        // Cache hit counted immediately, then one update per batch, then final.
        assert!((percents[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!(percents.len() >= 3);
        assert_eq!(*percents.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn concurrent_runs_are_independent() {
        let client = Arc::new(FakeClient::new(&[("柱", "Column"), ("梁", "Beam")]));
        let engine = engine_with(Arc::clone(&client), 50);

        let a = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .translate_batch(&strings(&["柱", "梁"]), "en", &NoProgress, &CancellationToken::new())
                    .await
            })
        };
        let b = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .translate_batch(&strings(&["梁"]), "en", &NoProgress, &CancellationToken::new())
                    .await
            })
        };

        assert_eq!(a.await.unwrap().unwrap().translations, strings(&["Column", "Beam"]));
        assert_eq!(b.await.unwrap().unwrap().translations, strings(&["Beam"]));
        assert_eq!(engine.cache().statistics().await.unwrap().total_count, 2);
    }
}
