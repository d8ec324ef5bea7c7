//! Progress reporting for batch runs.
//! Progress counts resolved unique texts; the tracker guarantees the
//! reported percentage never goes backwards.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Unique texts resolved so far (cache hits, translated or failed).
    pub completed: usize,
    /// Unique texts in the run.
    pub total: usize,
    /// 0.0 ..= 100.0
    pub percent: f64,
}

/// Receives progress updates. Implemented for any `Fn(ProgressUpdate)`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        self(update)
    }
}

/// Discards all updates.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: ProgressUpdate) {}
}

/// Wraps a sink and enforces monotonic, bounded updates.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    total: usize,
    completed: usize,
    last_percent: f64,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink, total: usize) -> Self {
        Self {
            sink,
            total,
            completed: 0,
            last_percent: 0.0,
        }
    }

    /// Mark `n` more unique texts as resolved.
    pub fn advance(&mut self, n: usize) {
        self.completed = (self.completed + n).min(self.total);
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Emit the current state.
    pub fn emit(&mut self) {
        let percent = if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        };
        let percent = percent.max(self.last_percent);
        self.last_percent = percent;
        self.sink.report(ProgressUpdate {
            completed: self.completed,
            total: self.total,
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn percentages_are_monotonic_and_bounded() {
        let seen = Mutex::new(Vec::new());
        let sink = |u: ProgressUpdate| seen.lock().push(u.percent);
        let mut tracker = ProgressTracker::new(&sink, 4);

        tracker.emit();
        tracker.advance(1);
        tracker.emit();
        tracker.advance(10);
        tracker.emit();

        assert_eq!(*seen.lock(), vec![0.0, 25.0, 100.0]);
        assert_eq!(tracker.completed(), 4);
    }

    #[test]
    fn empty_run_reports_complete() {
        let seen = Mutex::new(Vec::new());
        let sink = |u: ProgressUpdate| seen.lock().push(u.percent);
        ProgressTracker::new(&sink, 0).emit();
        assert_eq!(*seen.lock(), vec![100.0]);
    }
}
