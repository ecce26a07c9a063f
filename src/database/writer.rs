// Single-writer task queue.
//
// Exactly one thread owns the write connection. All mutations are funneled
// through a bounded FIFO of `WriteTask`s; the consumer drains up to
// `max_batch` tasks (or waits `max_wait`), applies them in one transaction,
// and fires the post-commit hook before the next batch begins. Commit
// order equals drain order.
//
// Recoverable SQLite errors (busy/locked) retry the whole batch with
// exponential backoff. Unrecoverable errors (malformed schema) stop the
// writer and record a reason that the storage manager's switch guard
// surfaces.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rusqlite::ErrorCode;
use tracing::{debug, error, info, warn};

use crate::engine::EngineDoc;
use crate::utils::unix_timestamp;

use super::overlay::OverlayEntry;
use super::types::{
    ContextRecord, FailedTaskRecord, FileRecord, RelationRecord, RepoMetaRecord, RootRecord,
    SnippetRecord, SymbolRecord,
};
use super::{CommitNotice, SearchDatabase, failed, files, relations, snippets, symbols};

/// One unit of mutation work, applied in drain order.
pub enum WriteTask {
    UpsertRoot(RootRecord),
    UpsertFiles {
        rows: Vec<FileRecord>,
        engine_docs: Vec<EngineDoc>,
    },
    UpsertSymbols(Vec<SymbolRecord>),
    UpsertRelations(Vec<RelationRecord>),
    UpdateLastSeen {
        paths: Vec<String>,
        ts: i64,
    },
    DeletePath(String),
    DeleteUnseen {
        cutoff_ts: i64,
    },
    UpsertRepoMeta(RepoMetaRecord),
    RecordFailed(FailedTaskRecord),
    ResolveFailed {
        task_kind: String,
        path: String,
    },
    SaveSnippet(SnippetRecord),
    ArchiveContext(ContextRecord),
    /// Synchronization point: acked after the batch containing it commits.
    Flush(Sender<()>),
}

const MAX_COMMIT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 50;

/// Bounded FIFO in front of the writer thread.
pub struct WriterQueue {
    tx: Mutex<Option<Sender<WriteTask>>>,
    capacity: usize,
    db: Arc<SearchDatabase>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    fatal_reason: Arc<Mutex<Option<String>>>,
    last_commit_ts: Arc<AtomicI64>,
    depth: Arc<AtomicUsize>,
}

impl WriterQueue {
    /// Spawn the writer thread and return the queue handle.
    pub fn start(
        db: Arc<SearchDatabase>,
        max_batch: usize,
        max_wait: Duration,
        capacity: usize,
    ) -> Arc<Self> {
        let (tx, rx) = bounded::<WriteTask>(capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let fatal_reason = Arc::new(Mutex::new(None));
        let last_commit_ts = Arc::new(AtomicI64::new(0));
        let depth = Arc::new(AtomicUsize::new(0));

        let consumer = WriterConsumer {
            db: db.clone(),
            rx,
            max_batch: max_batch.max(1),
            max_wait,
            running: running.clone(),
            fatal_reason: fatal_reason.clone(),
            last_commit_ts: last_commit_ts.clone(),
            depth: depth.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("deckard-writer".to_string())
            .spawn(move || consumer.run())
            .expect("spawning writer thread");

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            capacity: capacity.max(1),
            db,
            handle: Mutex::new(Some(handle)),
            running,
            fatal_reason,
            last_commit_ts,
            depth,
        })
    }

    /// Enqueue a task; blocks when the queue is full (back-pressure).
    /// File upserts become visible to readers through the overlay before
    /// their commit lands.
    pub fn enqueue(&self, task: WriteTask) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            let reason = self
                .fatal_reason
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "writer stopped".to_string());
            return Err(anyhow!("writer unavailable: {reason}"));
        }
        if let WriteTask::UpsertFiles { rows, .. } = &task {
            for row in rows {
                self.db.overlay().insert(
                    row.path.clone(),
                    OverlayEntry {
                        repo: row.repo.clone(),
                        mtime: row.mtime,
                        size: row.size,
                        content: row.content.clone(),
                    },
                );
            }
        }
        let guard = self.tx.lock().unwrap();
        let tx = guard
            .as_ref()
            .ok_or_else(|| anyhow!("writer queue closed"))?;
        // Counted before the send so the consumer's per-batch decrement
        // can never underflow.
        self.depth.fetch_add(1, Ordering::AcqRel);
        if tx.send(task).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(anyhow!("writer queue closed"));
        }
        Ok(())
    }

    /// Drain synchronously: returns once every task enqueued before the
    /// call has committed.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.enqueue(WriteTask::Flush(ack_tx))?;
        ack_rx
            .recv_timeout(Duration::from_secs(30))
            .map_err(|_| anyhow!("flush timed out"))?;
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Queue pressure in [0, 1]; the indexer throttles the watcher's token
    /// bucket above its threshold.
    pub fn load_ratio(&self) -> f64 {
        self.depth() as f64 / self.capacity as f64
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().unwrap().clone()
    }

    pub fn last_commit_ts(&self) -> i64 {
        self.last_commit_ts.load(Ordering::Acquire)
    }

    /// Clean shutdown: close the queue, let the writer drain, join it.
    /// Returns an error when the writer died on a fatal error instead of
    /// draining.
    pub fn shutdown(&self) -> Result<()> {
        let was_fatal = self.fatal_reason();
        {
            let mut guard = self.tx.lock().unwrap();
            guard.take();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| anyhow!("writer thread panicked"))?;
        }
        self.db.register_writer_thread(None);
        if let Some(reason) = was_fatal {
            return Err(anyhow!("writer stopped on fatal error: {reason}"));
        }
        Ok(())
    }
}

struct WriterConsumer {
    db: Arc<SearchDatabase>,
    rx: Receiver<WriteTask>,
    max_batch: usize,
    max_wait: Duration,
    running: Arc<AtomicBool>,
    fatal_reason: Arc<Mutex<Option<String>>>,
    last_commit_ts: Arc<AtomicI64>,
    depth: Arc<AtomicUsize>,
}

impl WriterConsumer {
    fn run(self) {
        self.db
            .register_writer_thread(Some(std::thread::current().id()));
        info!("Writer thread started");

        loop {
            let first = match self.rx.recv_timeout(self.max_wait) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let mut batch = vec![first];
            while batch.len() < self.max_batch {
                match self.rx.try_recv() {
                    Ok(task) => batch.push(task),
                    Err(_) => break,
                }
            }
            let batch_len = batch.len();
            let committed = self.commit_batch(batch);
            self.depth.fetch_sub(batch_len, Ordering::AcqRel);
            if !committed {
                // Fatal: stop consuming; pending senders observe the
                // stopped flag.
                self.running.store(false, Ordering::Release);
                return;
            }
        }

        self.running.store(false, Ordering::Release);
        info!("Writer thread drained and stopped");
    }

    /// Apply one batch inside a transaction, with backoff on recoverable
    /// errors. Returns false on fatal failure.
    fn commit_batch(&self, batch: Vec<WriteTask>) -> bool {
        let mut flush_acks: Vec<Sender<()>> = Vec::new();
        let mut notice = CommitNotice::default();

        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            flush_acks.clear();
            notice = CommitNotice::default();
            let result = self.apply_batch(&batch, &mut notice, &mut flush_acks);
            match result {
                Ok(()) => {
                    notice.commit_ts = unix_timestamp();
                    self.last_commit_ts.store(notice.commit_ts, Ordering::Release);
                    self.db.notify_post_commit(&notice);
                    for ack in flush_acks.drain(..) {
                        let _ = ack.send(());
                    }
                    return true;
                }
                Err(e) if is_recoverable(&e) => {
                    let backoff = BACKOFF_BASE_MS * (1 << attempt.min(4));
                    warn!(
                        "Writer batch hit recoverable error (attempt {}/{}): {}; backing off {}ms",
                        attempt + 1,
                        MAX_COMMIT_ATTEMPTS,
                        e,
                        backoff
                    );
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(e) => {
                    error!("Writer batch failed fatally: {}", e);
                    *self.fatal_reason.lock().unwrap() = Some(e.to_string());
                    return false;
                }
            }
        }
        let reason = "writer exhausted retries on recoverable errors".to_string();
        error!("{}", reason);
        *self.fatal_reason.lock().unwrap() = Some(reason);
        false
    }

    fn apply_batch(
        &self,
        batch: &[WriteTask],
        notice: &mut CommitNotice,
        flush_acks: &mut Vec<Sender<()>>,
    ) -> Result<()> {
        let mut conn = self.db.write_conn()?;
        let tx = conn.transaction()?;
        for task in batch {
            match task {
                WriteTask::UpsertRoot(root) => files::upsert_root_tx(&tx, root)?,
                WriteTask::UpsertFiles { rows, engine_docs } => {
                    files::upsert_files_tx(&tx, rows)?;
                    notice.paths.extend(rows.iter().map(|r| r.path.clone()));
                    notice.engine_docs.extend(engine_docs.iter().cloned());
                }
                WriteTask::UpsertSymbols(symbols_rows) => {
                    symbols::upsert_symbols_tx(&tx, symbols_rows)?;
                }
                WriteTask::UpsertRelations(rels) => {
                    relations::upsert_relations_tx(&tx, rels)?;
                }
                WriteTask::UpdateLastSeen { paths, ts } => {
                    files::update_last_seen_tx(&tx, paths, *ts)?;
                }
                WriteTask::DeletePath(path) => {
                    files::delete_path_tx(&tx, path)?;
                    notice.paths.push(path.clone());
                    notice.engine_deletes.push(path.clone());
                }
                WriteTask::DeleteUnseen { cutoff_ts } => {
                    let removed = files::delete_unseen_tx(&tx, *cutoff_ts)?;
                    notice.paths.extend(removed.iter().cloned());
                    notice.engine_deletes.extend(removed);
                }
                WriteTask::UpsertRepoMeta(meta) => files::upsert_repo_meta_tx(&tx, meta)?,
                WriteTask::RecordFailed(task) => failed::record_failed_tx(&tx, task)?,
                WriteTask::ResolveFailed { task_kind, path } => {
                    failed::resolve_failed_tx(&tx, task_kind, path)?;
                }
                WriteTask::SaveSnippet(snippet) => {
                    snippets::save_snippet_tx(&tx, snippet)?;
                }
                WriteTask::ArchiveContext(context) => {
                    snippets::archive_context_tx(&tx, context)?;
                }
                WriteTask::Flush(ack) => flush_acks.push(ack.clone()),
            }
        }
        tx.commit()?;
        debug!("Writer committed batch of {} tasks", batch.len());
        Ok(())
    }
}

fn is_recoverable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sqlite_err) = cause.downcast_ref::<rusqlite::Error>() {
            if let rusqlite::Error::SqliteFailure(ffi_err, _) = sqlite_err {
                return matches!(
                    ffi_err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_row(path: &str, content: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            repo: "demo".to_string(),
            mtime: 100,
            size: content.len() as i64,
            content: content.to_string(),
            parse_status: "ok".to_string(),
            ..Default::default()
        }
    }

    fn start_queue(db: &Arc<SearchDatabase>) -> Arc<WriterQueue> {
        WriterQueue::start(db.clone(), 32, Duration::from_millis(20), 256)
    }

    #[test]
    fn writes_flow_through_queue_and_commit_in_order() {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        let queue = start_queue(&db);

        queue
            .enqueue(WriteTask::UpsertFiles {
                rows: vec![file_row("root-a/one.py", "one")],
                engine_docs: Vec::new(),
            })
            .unwrap();
        queue
            .enqueue(WriteTask::UpsertSymbols(vec![SymbolRecord {
                path: "root-a/one.py".to_string(),
                name: "one".to_string(),
                qualname: "one".to_string(),
                kind: "function".to_string(),
                line: 1,
                end_line: 1,
                ..Default::default()
            }]))
            .unwrap();
        queue.flush().unwrap();

        assert_eq!(db.count_files().unwrap(), 1);
        assert_eq!(db.count_symbols().unwrap(), 1);
        queue.shutdown().unwrap();
    }

    #[test]
    fn overlay_holds_rows_until_commit_then_clears() {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        let queue = start_queue(&db);

        queue
            .enqueue(WriteTask::UpsertFiles {
                rows: vec![file_row("root-a/fresh.py", "fresh content")],
                engine_docs: Vec::new(),
            })
            .unwrap();
        // The overlay answers immediately, before the commit is durable.
        assert_eq!(
            db.read_file("root-a/fresh.py").unwrap().unwrap(),
            "fresh content"
        );

        queue.flush().unwrap();
        // Committed: gone from the overlay, served from the store.
        assert!(db.overlay().get("root-a/fresh.py").is_none());
        assert_eq!(
            db.read_file("root-a/fresh.py").unwrap().unwrap(),
            "fresh content"
        );
        queue.shutdown().unwrap();
    }

    #[test]
    fn post_commit_subscribers_see_engine_payloads() {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        let seen: Arc<Mutex<Vec<CommitNotice>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        db.subscribe_post_commit(move |notice| {
            sink.lock().unwrap().push(notice.clone());
        });
        let queue = start_queue(&db);

        queue
            .enqueue(WriteTask::UpsertFiles {
                rows: vec![file_row("root-a/doc.py", "body")],
                engine_docs: vec![EngineDoc {
                    doc_id: "root-a/doc.py".to_string(),
                    ..Default::default()
                }],
            })
            .unwrap();
        queue.enqueue(WriteTask::DeletePath("root-a/doc.py".to_string())).unwrap();
        queue.flush().unwrap();

        let notices = seen.lock().unwrap();
        let docs: usize = notices.iter().map(|n| n.engine_docs.len()).sum();
        let deletes: usize = notices.iter().map(|n| n.engine_deletes.len()).sum();
        assert_eq!(docs, 1);
        assert_eq!(deletes, 1);
        queue.shutdown().unwrap();
    }

    #[test]
    fn direct_write_from_foreign_thread_violates() {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        let queue = start_queue(&db);
        // Queue running: the writer thread is registered, so a direct
        // write from this thread must raise.
        queue.flush().unwrap();
        let err = db
            .upsert_files(&[file_row("root-a/x.py", "x")])
            .expect_err("direct write outside writer thread must fail");
        assert!(err.to_string().contains("WriterThreadViolation"));
        queue.shutdown().unwrap();
    }

    #[test]
    fn concurrent_symbol_writes_all_land() {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        db.upsert_files(&[file_row("root-a/w.py", "w")]).unwrap();
        let queue = start_queue(&db);

        let mut handles = Vec::new();
        for worker in 0..4 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let name = format!("sym_{worker}_{i}");
                    queue
                        .enqueue(WriteTask::UpsertSymbols(vec![SymbolRecord {
                            // Distinct paths so delete-then-insert batches
                            // never clobber sibling workers.
                            path: format!("root-a/w{worker}_{i}.py"),
                            name: name.clone(),
                            qualname: name,
                            kind: "function".to_string(),
                            line: 1,
                            end_line: 1,
                            ..Default::default()
                        }]))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        queue.flush().unwrap();
        assert_eq!(db.count_symbols().unwrap(), 200);
        queue.shutdown().unwrap();
    }
}
