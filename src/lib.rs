//! cadtrans: cached, deduplicated batch translation of drawing annotations.
//! Library entry: tracing setup and the application context that wires the
//! cache, history store, client and engine together once per process.

pub mod cancellation;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod progress;
pub mod translate;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cancellation::RunCoordinator;
use config::Config;
use engine::BatchEngine;
use error::InitError;
use history::HistoryStore;
use metrics::MetricsRegistry;
use translate::cache::TranslationCache;
use translate::deepseek::DeepSeekClient;
use translate::glossary::Glossary;
use translate::TranslationClient;
use workflow::LayerTranslator;

pub use engine::{BatchOutcome, TranslationStatistics};
pub use error::{EngineError, StoreError, TranslateError};

/// Initialize tracing. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadtrans=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Current time as Unix timestamp (seconds).
pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Shared services, constructed once at startup and passed by handle.
pub struct AppContext {
    pub config: Config,
    pub cache: TranslationCache,
    pub history: Arc<HistoryStore>,
    pub client: Arc<dyn TranslationClient>,
    pub metrics: Arc<MetricsRegistry>,
    pub coordinator: Arc<RunCoordinator>,
    pub engine: BatchEngine,
}

impl AppContext {
    /// Open stores and build the DeepSeek client. Must run inside a Tokio runtime.
    pub fn open(config: Config) -> Result<Self, InitError> {
        let glossary = match &config.glossary_path {
            Some(path) => match Glossary::load_from_file(path) {
                Ok(glossary) => {
                    if glossary.is_empty() {
                        warn!(path = %path.display(), "glossary file has no entries");
                    }
                    info!(
                        version = glossary.version(),
                        terms = glossary.len(),
                        path = %path.display(),
                        "glossary loaded"
                    );
                    glossary
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "glossary load failed, using empty");
                    Glossary::empty()
                }
            },
            None => Glossary::empty(),
        };
        let client: Arc<dyn TranslationClient> =
            Arc::new(DeepSeekClient::new(&config.api, Arc::new(glossary))?);
        if !client.has_api_key() {
            warn!("no API key configured, only cached translations are available");
        }
        Self::with_client(config, client)
    }

    /// Same as `open`, with a caller-supplied client.
    pub fn with_client(config: Config, client: Arc<dyn TranslationClient>) -> Result<Self, InitError> {
        let cache = TranslationCache::open(&config.cache)?;
        let history = HistoryStore::open(
            &config.history.path,
            Duration::from_millis(config.history.flush_interval_ms),
        )?;
        let metrics = Arc::new(MetricsRegistry::new());
        let engine = BatchEngine::new(
            cache.clone(),
            Arc::clone(&client),
            Arc::clone(&metrics),
            &config.engine,
        );

        info!(batch_size = engine.batch_size(), "cadtrans context ready");

        Ok(Self {
            config,
            cache,
            history,
            client,
            metrics,
            coordinator: Arc::new(RunCoordinator::new()),
            engine,
        })
    }

    /// Layer workflow bound to this context's engine, history and coordinator.
    pub fn layer_translator(&self) -> LayerTranslator {
        LayerTranslator::new(
            self.engine.clone(),
            Some(Arc::clone(&self.history)),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.metrics),
        )
    }

    /// Flush pending cache counters and history writes.
    pub async fn shutdown(&self) {
        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "cache flush on shutdown failed");
        }
        self.history.close().await;
        for (stage, summary) in self.metrics.snapshot() {
            debug!(
                stage,
                count = summary.count,
                p50_us = summary.p50_us,
                p95_us = summary.p95_us,
                max_us = summary.max_us,
                "stage timings"
            );
        }
        info!("cadtrans context shut down");
    }
}
