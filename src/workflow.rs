//! Layer translation workflow: text source → engine → entity updater → history.
//! The engine only sees strings; this layer keeps the entity handles and
//! zips results back onto them by position.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancellation::RunCoordinator;
use crate::engine::{BatchEngine, TranslationStatistics};
use crate::error::WorkflowError;
use crate::history::{HistoryRecord, HistoryStore, OP_TRANSLATE};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::now_unix;
use crate::progress::ProgressSink;
use crate::translate::normalize::{detect_language, is_blank};

/// One text-bearing entity from the drawing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    /// Opaque handle, never interpreted here.
    pub handle: String,
    pub text: String,
    pub layer: String,
    /// Entity kind tag (e.g. "TEXT", "MTEXT", "ATTRIB").
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpdate {
    pub handle: String,
    pub original_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub applied: usize,
    pub failed: usize,
}

/// Supplies text entities for a set of layers. Blank items are never returned.
#[async_trait]
pub trait TextSource: Send + Sync {
    async fn collect(&self, layers: &[String]) -> Result<Vec<SourceText>, WorkflowError>;
}

/// Writes translated text back onto entities.
#[async_trait]
pub trait EntityUpdater: Send + Sync {
    async fn apply(&self, updates: Vec<EntityUpdate>) -> UpdateSummary;
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerTranslationReport {
    pub run_id: String,
    pub statistics: TranslationStatistics,
    pub cancelled: bool,
    pub updates: UpdateSummary,
    pub history_written: usize,
    /// Set when the audit append failed; translations stay applied regardless.
    pub history_error: Option<String>,
}

pub struct LayerTranslator {
    engine: BatchEngine,
    history: Option<Arc<HistoryStore>>,
    coordinator: Arc<RunCoordinator>,
    metrics: Arc<MetricsRegistry>,
}

impl LayerTranslator {
    pub fn new(
        engine: BatchEngine,
        history: Option<Arc<HistoryStore>>,
        coordinator: Arc<RunCoordinator>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            engine,
            history,
            coordinator,
            metrics,
        }
    }

    /// Cancel the run in flight, if any.
    pub fn cancel(&self) {
        self.coordinator.cancel_current();
    }

    /// Translate every text entity on `layers` and apply the results.
    /// Starting a run cancels any earlier run still in flight.
    pub async fn translate_layers(
        &self,
        source: &dyn TextSource,
        updater: &dyn EntityUpdater,
        layers: &[String],
        target_lang: &str,
        progress: &dyn ProgressSink,
    ) -> Result<LayerTranslationReport, WorkflowError> {
        let ticket = self.coordinator.begin_run();
        let run_id = uuid::Uuid::new_v4().to_string();

        let items: Vec<SourceText> = source
            .collect(layers)
            .await?
            .into_iter()
            .filter(|item| !is_blank(&item.text))
            .collect();
        let texts: Vec<String> = items.iter().map(|item| item.text.clone()).collect();
        info!(run_id = %run_id, generation = ticket.generation(), items = items.len(), "layer translation started");

        let outcome = self
            .engine
            .translate_batch(&texts, target_lang, progress, ticket.token())
            .await?;

        if ticket.is_cancelled() {
            info!(
                run_id = %run_id,
                superseded = !ticket.is_current(),
                "run cancelled, applying partial results"
            );
        }

        let now = now_unix();
        let mut updates = Vec::new();
        let mut records = Vec::new();
        for (item, translated) in items.iter().zip(&outcome.translations) {
            if translated.is_empty() {
                continue;
            }
            updates.push(EntityUpdate {
                handle: item.handle.clone(),
                original_text: item.text.clone(),
                new_text: translated.clone(),
            });
            records.push(HistoryRecord {
                run_id: run_id.clone(),
                entity_handle: item.handle.clone(),
                original_text: item.text.clone(),
                translated_text: translated.clone(),
                source_lang: detect_language(&item.text).unwrap_or_else(|| "auto".into()),
                target_lang: target_lang.trim().to_string(),
                entity_kind: item.kind.clone(),
                layer: item.layer.clone(),
                operation: OP_TRANSLATE.into(),
                created_at: now,
            });
        }

        let summary = if updates.is_empty() {
            UpdateSummary::default()
        } else {
            updater.apply(updates).await
        };

        let (history_written, history_error) = self.record_history(records).await;

        info!(
            run_id = %run_id,
            applied = summary.applied,
            failed = summary.failed,
            history_written,
            cancelled = outcome.cancelled,
            "layer translation finished"
        );

        Ok(LayerTranslationReport {
            run_id,
            statistics: outcome.statistics,
            cancelled: outcome.cancelled,
            updates: summary,
            history_written,
            history_error,
        })
    }

    /// Best-effort audit append; failure is reported, never propagated.
    async fn record_history(&self, records: Vec<HistoryRecord>) -> (usize, Option<String>) {
        let Some(history) = &self.history else {
            return (0, None);
        };
        if records.is_empty() {
            return (0, None);
        }
        let timer = self.metrics.timer(metric_names::HISTORY_APPEND);
        let result = history.append_records(records).await;
        timer.stop();
        match result {
            Ok(written) => (written, None),
            Err(e) => {
                warn!(error = %e, "history append failed, translations remain applied");
                (0, Some(e.to_string()))
            }
        }
    }
}
