//! Append-only history of applied translations, with async batch writing.
//! Each `append_records` call travels as one message to a background writer
//! task, which inserts it under its own savepoint (all-or-nothing, order
//! preserved) and reports the outcome back through a oneshot channel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Operation tag for records written by a translation run.
pub const OP_TRANSLATE: &str = "translate";

/// One applied translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub run_id: String,
    /// Opaque handle of the entity that received the text.
    pub entity_handle: String,
    pub original_text: String,
    pub translated_text: String,
    /// ISO code, or "auto" when not detected.
    pub source_lang: String,
    pub target_lang: String,
    pub entity_kind: String,
    pub layer: String,
    pub operation: String,
    pub created_at: i64,
}

type AppendAck = oneshot::Sender<Result<usize, StoreError>>;

enum HistoryMsg {
    Append {
        records: Vec<HistoryRecord>,
        ack: AppendAck,
    },
    Close(oneshot::Sender<()>),
}

/// Async history store: appends go through the writer task, reads use their own connection.
pub struct HistoryStore {
    tx: mpsc::UnboundedSender<HistoryMsg>,
    read_conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the history database and start the background writer.
    /// Must be called from within a Tokio runtime.
    pub fn open(db_path: &Path, flush_interval: Duration) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let read_conn = Connection::open(db_path)?;
        read_conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        read_conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                entity_handle TEXT NOT NULL,
                original_text TEXT NOT NULL,
                translated_text TEXT NOT NULL,
                source_lang TEXT NOT NULL,
                target_lang TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                layer TEXT NOT NULL,
                operation TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_created
                ON history(created_at);",
        )?;

        // Separate connection for writes so reads never wait on a flush.
        let write_conn = Connection::open(db_path)?;
        write_conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(rx, write_conn, flush_interval));

        info!(path = %db_path.display(), "history store opened with batch writer");

        Ok(Arc::new(Self {
            tx,
            read_conn: Mutex::new(read_conn),
        }))
    }

    /// Append records atomically. Resolves once they are committed (or rejected).
    pub async fn append_records(&self, records: Vec<HistoryRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let (ack, done) = oneshot::channel();
        self.tx
            .send(HistoryMsg::Append { records, ack })
            .map_err(|_| StoreError::Closed)?;
        done.await.map_err(|_| StoreError::Closed)?
    }

    /// Most recent records, newest first.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, entity_handle, original_text, translated_text, source_lang,
                    target_lang, entity_kind, layer, operation, created_at
             FROM history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(HistoryRecord {
                run_id: row.get(0)?,
                entity_handle: row.get(1)?,
                original_text: row.get(2)?,
                translated_text: row.get(3)?,
                source_lang: row.get(4)?,
                target_lang: row.get(5)?,
                entity_kind: row.get(6)?,
                layer: row.get(7)?,
                operation: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.read_conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Write everything queued and stop the writer. Later appends fail with `Closed`.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(HistoryMsg::Close(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Background writer: collects append requests and commits them every
/// `flush_interval`, or as soon as the channel has been drained.
async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<HistoryMsg>,
    mut conn: Connection,
    flush_interval: Duration,
) {
    let mut buffer: Vec<(Vec<HistoryRecord>, AppendAck)> = Vec::with_capacity(8);

    loop {
        let mut closing = None;

        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            msg = rx.recv() => match msg {
                Some(HistoryMsg::Append { records, ack }) => buffer.push((records, ack)),
                Some(HistoryMsg::Close(ack)) => closing = Some(ack),
                None => {
                    flush_batch(&mut conn, std::mem::take(&mut buffer));
                    info!("history writer exiting (channel closed)");
                    return;
                }
            }
        }

        // Drain all pending requests from the channel
        while closing.is_none() {
            match rx.try_recv() {
                Ok(HistoryMsg::Append { records, ack }) => buffer.push((records, ack)),
                Ok(HistoryMsg::Close(ack)) => closing = Some(ack),
                Err(_) => break,
            }
        }

        if !buffer.is_empty() {
            flush_batch(&mut conn, std::mem::take(&mut buffer));
        }

        if let Some(ack) = closing {
            rx.close();
            // Anything that slipped in before close() took effect is still written.
            while let Ok(msg) = rx.try_recv() {
                if let HistoryMsg::Append { records, ack } = msg {
                    buffer.push((records, ack));
                }
            }
            flush_batch(&mut conn, std::mem::take(&mut buffer));
            let _ = ack.send(());
            info!("history writer closed");
            return;
        }
    }
}

/// Commit queued requests in one transaction, one savepoint per request.
fn flush_batch(conn: &mut Connection, requests: Vec<(Vec<HistoryRecord>, AppendAck)>) {
    if requests.is_empty() {
        return;
    }
    let start = std::time::Instant::now();

    let mut tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            warn!(error = %e, "history batch begin failed");
            let msg = e.to_string();
            for (_, ack) in requests {
                let _ = ack.send(Err(StoreError::Task(msg.clone())));
            }
            return;
        }
    };

    let mut outcomes = Vec::with_capacity(requests.len());
    for (records, ack) in requests {
        let outcome = insert_request(&mut tx, &records);
        if let Err(ref e) = outcome {
            warn!(error = %e, count = records.len(), "history append rejected");
        }
        outcomes.push((outcome, ack));
    }

    match tx.commit() {
        Ok(()) => {
            let written: usize = outcomes.iter().filter_map(|(o, _)| o.as_ref().ok()).sum();
            for (outcome, ack) in outcomes {
                let _ = ack.send(outcome);
            }
            debug!(
                count = written,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "history batch flushed"
            );
        }
        Err(e) => {
            warn!(error = %e, "history batch commit failed");
            let msg = e.to_string();
            for (_, ack) in outcomes {
                let _ = ack.send(Err(StoreError::Task(msg.clone())));
            }
        }
    }
}

fn insert_request(
    tx: &mut rusqlite::Transaction<'_>,
    records: &[HistoryRecord],
) -> Result<usize, StoreError> {
    let sp = tx.savepoint()?;
    {
        let mut stmt = sp.prepare_cached(
            "INSERT INTO history
             (run_id, entity_handle, original_text, translated_text, source_lang,
              target_lang, entity_kind, layer, operation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for record in records {
            stmt.execute(params![
                record.run_id,
                record.entity_handle,
                record.original_text,
                record.translated_text,
                record.source_lang,
                record.target_lang,
                record.entity_kind,
                record.layer,
                record.operation,
                record.created_at,
            ])?;
        }
    }
    // Dropping an uncommitted savepoint rolls it back.
    sp.commit()?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: &str, original: &str, translated: &str) -> HistoryRecord {
        HistoryRecord {
            run_id: "run-1".into(),
            entity_handle: handle.into(),
            original_text: original.into(),
            translated_text: translated.into(),
            source_lang: "zh".into(),
            target_lang: "en".into(),
            entity_kind: "TEXT".into(),
            layer: "ANNO".into(),
            operation: OP_TRANSLATE.into(),
            created_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db"), Duration::from_millis(10))
            .unwrap();

        let written = store
            .append_records(vec![
                record("1A", "柱", "Column"),
                record("1B", "梁", "Beam"),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        store
            .append_records(vec![record("1C", "柱", "Column")])
            .await
            .unwrap();

        assert_eq!(store.count().unwrap(), 3);
        let recent = store.query_recent(10).unwrap();
        let handles: Vec<&str> = recent.iter().map(|r| r.entity_handle.as_str()).collect();
        assert_eq!(handles, vec!["1C", "1B", "1A"]);
        assert_eq!(recent[0].operation, OP_TRANSLATE);
    }

    #[tokio::test]
    async fn empty_append_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db"), Duration::from_millis(10))
            .unwrap();
        assert_eq!(store.append_records(Vec::new()).await.unwrap(), 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db"), Duration::from_millis(10))
            .unwrap();
        store
            .append_records(vec![record("1A", "柱", "Column")])
            .await
            .unwrap();
        store.close().await;

        let result = store.append_records(vec![record("1B", "梁", "Beam")]).await;
        assert!(matches!(result, Err(StoreError::Closed)));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path, Duration::from_millis(10)).unwrap();
            store
                .append_records(vec![record("1A", "柱", "Column")])
                .await
                .unwrap();
            store.close().await;
        }
        let store = HistoryStore::open(&path, Duration::from_millis(10)).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
