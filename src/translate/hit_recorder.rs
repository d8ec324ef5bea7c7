//! Background writer for cache hit counters.
//! Lookups enqueue a hit on an unbounded crossbeam channel and return at once;
//! a dedicated OS thread coalesces hits per key and writes them in batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use tracing::{debug, info, warn};

use super::cache::CacheKey;
use super::sqlite_cache::{SqliteCache, Touch};
use crate::error::StoreError;
use crate::now_unix;

/// Pending keys that force a write before the interval elapses.
const MAX_PENDING_KEYS: usize = 1024;

enum TouchMsg {
    Hit(CacheKey),
    Flush(cb::Sender<()>),
}

pub struct HitRecorder {
    tx: Option<cb::Sender<TouchMsg>>,
    handle: Option<JoinHandle<()>>,
}

impl HitRecorder {
    /// Spawn the writer thread.
    pub fn start(store: Arc<SqliteCache>, flush_interval: Duration) -> Result<Self, StoreError> {
        let (tx, rx) = cb::unbounded();
        let handle = std::thread::Builder::new()
            .name("cache-hit-recorder".into())
            .spawn(move || run_loop(rx, store, flush_interval))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue one hit. Never blocks.
    pub fn record(&self, key: CacheKey) {
        if let Some(tx) = &self.tx {
            if tx.send(TouchMsg::Hit(key)).is_err() {
                warn!("hit recorder channel closed, dropping hit");
            }
        }
    }

    /// Block until every hit queued before this call is written.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (ack_tx, ack_rx) = cb::bounded(1);
        if tx.send(TouchMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for HitRecorder {
    fn drop(&mut self) {
        // Closing the channel makes the thread write what is left and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("hit recorder thread panicked");
            }
        }
    }
}

fn run_loop(rx: cb::Receiver<TouchMsg>, store: Arc<SqliteCache>, interval: Duration) {
    let mut pending: HashMap<CacheKey, Touch> = HashMap::new();
    // Fixed cadence: steady traffic must not keep pushing the write back.
    let interval = interval.max(Duration::from_millis(1));
    let mut deadline = Instant::now() + interval;

    loop {
        match rx.recv_deadline(deadline) {
            Ok(TouchMsg::Hit(key)) => {
                let now = now_unix();
                pending
                    .entry(key)
                    .and_modify(|t| {
                        t.hits += 1;
                        t.last_used = now;
                    })
                    .or_insert(Touch {
                        key,
                        hits: 1,
                        last_used: now,
                    });
                if pending.len() >= MAX_PENDING_KEYS {
                    write_pending(&store, &mut pending);
                }
            }
            Ok(TouchMsg::Flush(ack)) => {
                write_pending(&store, &mut pending);
                let _ = ack.send(());
            }
            Err(cb::RecvTimeoutError::Timeout) => {}
            Err(cb::RecvTimeoutError::Disconnected) => {
                write_pending(&store, &mut pending);
                info!("hit recorder exiting (channel closed)");
                return;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            write_pending(&store, &mut pending);
            deadline = now + interval;
        }
    }
}

fn write_pending(store: &SqliteCache, pending: &mut HashMap<CacheKey, Touch>) {
    if pending.is_empty() {
        return;
    }
    let touches: Vec<Touch> = pending.drain().map(|(_, t)| t).collect();
    match store.apply_touches(&touches) {
        Ok(updated) => debug!(keys = touches.len(), updated, "hit counters written"),
        Err(e) => warn!(error = %e, keys = touches.len(), "hit counter write failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_makes_hits_durable() {
        let store = Arc::new(SqliteCache::open_in_memory().unwrap());
        let key = CacheKey::new("柱", "en");
        store.upsert(&key, "柱", "en", "Column", false).unwrap();

        let recorder = HitRecorder::start(Arc::clone(&store), Duration::from_secs(60)).unwrap();
        for _ in 0..4 {
            recorder.record(key);
        }
        recorder.flush();

        assert_eq!(store.entry(&key).unwrap().unwrap().hit_count, 4);
    }

    #[test]
    fn steady_hits_are_written_on_the_interval() {
        let store = Arc::new(SqliteCache::open_in_memory().unwrap());
        let key = CacheKey::new("柱", "en");
        store.upsert(&key, "柱", "en", "Column", false).unwrap();

        let recorder =
            HitRecorder::start(Arc::clone(&store), Duration::from_millis(100)).unwrap();
        for _ in 0..30 {
            recorder.record(key);
            std::thread::sleep(Duration::from_millis(20));
        }
        // No flush: only the interval writes may have run.
        assert!(store.entry(&key).unwrap().unwrap().hit_count > 0);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(store.entry(&key).unwrap().unwrap().hit_count, 30);
    }

    #[test]
    fn drop_drains_queue() {
        let store = Arc::new(SqliteCache::open_in_memory().unwrap());
        let key = CacheKey::new("梁", "en");
        store.upsert(&key, "梁", "en", "Beam", false).unwrap();

        {
            let recorder =
                HitRecorder::start(Arc::clone(&store), Duration::from_secs(60)).unwrap();
            recorder.record(key);
            recorder.record(key);
        }

        assert_eq!(store.entry(&key).unwrap().unwrap().hit_count, 2);
    }
}
