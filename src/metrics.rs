//! Latency histograms for the translation pipeline.
//! Each named stage keeps a bounded window of recent samples; `snapshot`
//! turns them into p50/p95/max figures for reports.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Stage names.
pub mod metric_names {
    pub const CACHE_LOOKUP: &str = "cache_lookup";
    pub const BATCH_CALL: &str = "batch_call";
    pub const RUN_TOTAL: &str = "run_total";
    pub const HISTORY_APPEND: &str = "history_append";
}

/// Measures one stage. Records when stopped, or when dropped unstopped
/// (early returns still count).
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
    recorded: bool,
}

impl StageTimer {
    pub fn stop(mut self) -> Duration {
        self.record()
    }

    fn record(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if !self.recorded {
            self.recorded = true;
            self.registry.record(self.stage, elapsed);
        }
        elapsed
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

/// Recent samples for one stage, oldest overwritten first.
struct Window {
    samples_us: Vec<u64>,
    next: usize,
    total: u64,
}

impl Window {
    fn push(&mut self, value_us: u64, capacity: usize) {
        if self.samples_us.len() < capacity {
            self.samples_us.push(value_us);
        } else {
            self.samples_us[self.next] = value_us;
        }
        self.next = (self.next + 1) % capacity;
        self.total += 1;
    }

    fn summarize(&self) -> MetricSummary {
        let mut sorted = self.samples_us.clone();
        sorted.sort_unstable();
        let at = |p: f64| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        MetricSummary {
            count: self.total,
            p50_us: at(50.0),
            p95_us: at(95.0),
            max_us: sorted.last().copied().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricSummary {
    /// Samples ever recorded, including ones that left the window.
    pub count: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub max_us: u64,
}

pub struct MetricsRegistry {
    stages: Mutex<HashMap<&'static str, Window>>,
    window: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(1024)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            stages: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    pub fn record(&self, stage: &'static str, elapsed: Duration) {
        let value_us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.stages
            .lock()
            .entry(stage)
            .or_insert_with(|| Window {
                samples_us: Vec::new(),
                next: 0,
                total: 0,
            })
            .push(value_us, self.window);
        tracing::trace!(stage, value_us, "stage timed");
    }

    pub fn timer(self: &Arc<Self>, stage: &'static str) -> StageTimer {
        StageTimer {
            stage,
            start: Instant::now(),
            registry: Arc::clone(self),
            recorded: false,
        }
    }

    /// Per-stage summaries, ordered by stage name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, MetricSummary> {
        self.stages
            .lock()
            .iter()
            .map(|(&stage, window)| (stage, window.summarize()))
            .collect()
    }
}
