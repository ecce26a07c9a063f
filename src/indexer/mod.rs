// Indexer: orchestrates scanner/watcher → parser pool → storage/engine.
//
// `scan_once` reconciles every root against the store (mtime/size
// comparison, last-seen bookkeeping, tombstone sweep). The event loop
// applies the same per-path logic to watcher tasks without the sweep.
// Failures retry with exponential backoff until `max_attempts`, then park
// in the dead-letter table. Writer-queue pressure throttles the watcher's
// token bucket.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::database::types::{FailedTaskRecord, FileRecord, RootRecord};
use crate::database::writer::{WriteTask, WriterQueue};
use crate::database::SearchDatabase;
use crate::engine::SearchEngineOps;
use crate::parser::{ParseFailure, ParseJob, ParserPool, ResourceGovernor, process_file};
use crate::scanner::Scanner;
use crate::utils::unix_timestamp;
use crate::watcher::{CoalesceTask, DedupQueue, TaskAction, TokenBucket, WatchedRoot};

/// Base delay for the failed-task retry schedule.
const RETRY_BASE_SECS: i64 = 5;

/// Task kind recorded for pipeline failures.
const TASK_KIND_INDEX: &str = "index";

#[derive(Default)]
pub struct IndexerStatus {
    pub index_ready: AtomicBool,
    pub last_scan_ts: AtomicI64,
    pub scanned_files: AtomicU64,
    pub indexed_files: AtomicU64,
    pub errors: AtomicU64,
}

/// Queue depths surfaced by the status tool.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueDepths {
    pub watcher: usize,
    pub db_writer: usize,
    pub load_ratio: f64,
}

pub struct Indexer {
    cfg: Config,
    db: Arc<SearchDatabase>,
    writer: Arc<WriterQueue>,
    scanner: Scanner,
    pool: ParserPool,
    roots: Vec<WatchedRoot>,
    pub status: Arc<IndexerStatus>,
    queue: Arc<DedupQueue>,
    bucket: Arc<TokenBucket>,
    stop: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
}

impl Indexer {
    /// Wire the pipeline. The engine is subscribed to the writer's
    /// post-commit hook here: sync failures record
    /// `engine_sync_error:<reason>` against the failed-task table (legal
    /// from the hook, which runs on the writer thread).
    pub fn new(
        cfg: Config,
        db: Arc<SearchDatabase>,
        writer: Arc<WriterQueue>,
        engine: Arc<dyn SearchEngineOps>,
        roots: Vec<WatchedRoot>,
        queue: Arc<DedupQueue>,
        bucket: Arc<TokenBucket>,
    ) -> Self {
        let governor = Arc::new(ResourceGovernor::new());
        let scanner = Scanner::new(&cfg);
        let pool = ParserPool::start(cfg.clone(), governor);

        let sync_db = db.clone();
        let sync_engine = engine.clone();
        db.subscribe_post_commit(move |notice| {
            if notice.engine_docs.is_empty() && notice.engine_deletes.is_empty() {
                return;
            }
            if let Err(e) = sync_engine.apply_sync(&notice.engine_docs, &notice.engine_deletes) {
                warn!("Engine sync failed: {}", e);
                for doc in &notice.engine_docs {
                    let record = FailedTaskRecord {
                        task_kind: "engine_sync".to_string(),
                        path: doc.doc_id.clone(),
                        attempts: 1,
                        last_error_code: format!("engine_sync_error:{e}"),
                        last_error_message: e.to_string(),
                        next_retry_ts: unix_timestamp() + RETRY_BASE_SECS,
                    };
                    if let Err(db_err) = sync_db.record_failed_task(&record) {
                        warn!("Failed to dead-letter engine sync error: {}", db_err);
                    }
                }
            }
        });

        Self {
            cfg,
            db,
            writer,
            scanner,
            pool,
            roots,
            status: Arc::new(IndexerStatus::default()),
            queue,
            bucket,
            stop: Arc::new(AtomicBool::new(false)),
            event_thread: None,
        }
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            watcher: self.queue.qsize(),
            db_writer: self.writer.depth(),
            load_ratio: self.writer.load_ratio(),
        }
    }

    /// Full reconciliation sweep over every root.
    pub fn scan_once(&self) -> Result<u64> {
        let scan_start_ts = unix_timestamp();
        self.status.last_scan_ts.store(scan_start_ts, Ordering::Release);
        info!("Scan started over {} roots", self.roots.len());

        let mut submitted = 0usize;
        for root in &self.roots {
            self.writer.enqueue(WriteTask::UpsertRoot(RootRecord {
                root_id: root.root_id.clone(),
                abs_path: root.abs_path.to_string_lossy().into_owned(),
                label: repo_for_root(root),
                created_ts: scan_start_ts,
                updated_ts: scan_start_ts,
            }))?;

            let entries = self.scanner.scan_root(&root.abs_path);
            let mut unchanged: Vec<String> = Vec::new();
            for entry in entries {
                if entry.excluded_reason.is_some() {
                    continue;
                }
                self.status.scanned_files.fetch_add(1, Ordering::Relaxed);
                let Some(job) = self.job_for_path(root, &entry.abs_path, entry.mtime, entry.size)
                else {
                    continue;
                };
                match self.db.get_file_meta(&job.path_key) {
                    Some(meta) if meta.mtime == job.mtime && meta.size == job.size => {
                        unchanged.push(job.path_key);
                    }
                    _ => {
                        self.pool.submit(job)?;
                        submitted += 1;
                    }
                }
            }
            if !unchanged.is_empty() {
                self.writer.enqueue(WriteTask::UpdateLastSeen {
                    paths: unchanged,
                    ts: scan_start_ts,
                })?;
            }
        }

        self.drain_parse_results(submitted)?;
        self.writer.flush()?;

        self.writer.enqueue(WriteTask::DeleteUnseen {
            cutoff_ts: scan_start_ts,
        })?;
        self.writer.flush()?;

        self.status.index_ready.store(true, Ordering::Release);
        let indexed = self.status.indexed_files.load(Ordering::Relaxed);
        info!(
            "Scan complete: {} files submitted, {} indexed total",
            submitted, indexed
        );
        Ok(submitted as u64)
    }

    /// Index or delete one path immediately (the `index_file` tool).
    pub fn index_path(&self, root: &WatchedRoot, abs_path: &Path) -> Result<()> {
        if !abs_path.exists() {
            let path_key = self.path_key_for(root, abs_path)?;
            self.writer.enqueue(WriteTask::DeletePath(path_key))?;
            return self.writer.flush();
        }
        let meta = std::fs::metadata(abs_path)
            .with_context(|| format!("stat {abs_path:?}"))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let Some(job) = self.job_for_path(root, abs_path, mtime, meta.len() as i64) else {
            anyhow::bail!("path is outside root {}", root.root_id);
        };
        let indexed = process_file(&job, &self.cfg)?;
        self.enqueue_indexed(indexed)?;
        self.writer.flush()
    }

    /// Start the watcher-event consumer thread.
    pub fn start_event_loop(&mut self) {
        let queue = self.queue.clone();
        let bucket = self.bucket.clone();
        let stop = self.stop.clone();
        let cfg = self.cfg.clone();
        let roots = self.roots.clone();
        let db = self.db.clone();
        let writer = self.writer.clone();
        let status = self.status.clone();
        let pool_submit = self.pool_submitter();
        let base_fill = cfg.bucket_fill_rate;

        let handle = std::thread::Builder::new()
            .name("deckard-indexer".to_string())
            .spawn(move || {
                info!("Indexer event loop started");
                while !stop.load(Ordering::Acquire) {
                    let batch = queue.get_batch(50, Duration::from_millis(200));
                    for task in batch {
                        if !bucket.consume_wait(1.0, Duration::from_secs(5)) {
                            warn!("Token bucket starved; dropping back to queue");
                            queue.put(task);
                            break;
                        }
                        if let Err(e) =
                            handle_event_task(&task, &roots, &db, &writer, &pool_submit)
                        {
                            status.errors.fetch_add(1, Ordering::Relaxed);
                            warn!("Event task failed for {:?}: {}", task.path, e);
                        }
                    }

                    // Back-pressure: writer queue load throttles the bucket.
                    let ratio = writer.load_ratio();
                    if ratio > cfg.backpressure_threshold {
                        bucket.set_fill_rate(base_fill * 0.1);
                    } else {
                        bucket.set_fill_rate(base_fill);
                    }
                }
                info!("Indexer event loop stopped");
            })
            .expect("spawning indexer event loop");
        self.event_thread = Some(handle);
    }

    /// Re-submit failed tasks whose retry window opened; dead-letters stay.
    pub fn retry_due_failures(&self) -> Result<usize> {
        let now = unix_timestamp();
        let due = self
            .db
            .due_failed_tasks(now, self.cfg.max_attempts as i64)?;
        let mut resubmitted = 0;
        for task in due {
            let Some((root, abs_path)) = self.locate(&task.path) else {
                // Target vanished entirely: resolve the failure.
                self.writer.enqueue(WriteTask::ResolveFailed {
                    task_kind: task.task_kind.clone(),
                    path: task.path.clone(),
                })?;
                continue;
            };
            debug!(
                "Retrying {} for {} (attempt {})",
                task.task_kind, task.path, task.attempts + 1
            );
            if self.index_path(&root, &abs_path).is_ok() {
                self.writer.enqueue(WriteTask::ResolveFailed {
                    task_kind: task.task_kind,
                    path: task.path,
                })?;
                resubmitted += 1;
            } else {
                self.record_failure(&task.path, task.attempts + 1, "retry_failed", "retry failed");
            }
        }
        Ok(resubmitted)
    }

    /// Drain expected parse results, converting them into writer tasks.
    fn drain_parse_results(&self, expected: usize) -> Result<()> {
        for _ in 0..expected {
            let output = self
                .pool
                .results()
                .recv_timeout(Duration::from_secs(60))
                .context("parser pool result timeout")?;
            match output {
                Ok(indexed) => {
                    self.enqueue_indexed(*indexed)?;
                    self.status.indexed_files.fetch_add(1, Ordering::Relaxed);
                }
                Err(failure) => {
                    self.status.errors.fetch_add(1, Ordering::Relaxed);
                    self.handle_parse_failure(&failure);
                }
            }
        }
        Ok(())
    }

    fn enqueue_indexed(&self, indexed: crate::parser::IndexedFile) -> Result<()> {
        let path = indexed.file.path.clone();
        self.writer.enqueue(WriteTask::UpsertFiles {
            rows: vec![indexed.file],
            engine_docs: vec![indexed.engine_doc],
        })?;
        if !indexed.symbols.is_empty() {
            self.writer.enqueue(WriteTask::UpsertSymbols(indexed.symbols))?;
        }
        if !indexed.relations.is_empty() {
            self.writer
                .enqueue(WriteTask::UpsertRelations(indexed.relations))?;
        }
        self.writer.enqueue(WriteTask::ResolveFailed {
            task_kind: TASK_KIND_INDEX.to_string(),
            path,
        })?;
        Ok(())
    }

    fn handle_parse_failure(&self, failure: &ParseFailure) {
        let attempts = self
            .db
            .list_failed_tasks(1000)
            .ok()
            .and_then(|tasks| {
                tasks
                    .into_iter()
                    .find(|t| t.path == failure.path_key && t.task_kind == TASK_KIND_INDEX)
                    .map(|t| t.attempts)
            })
            .unwrap_or(0);
        self.record_failure(
            &failure.path_key,
            attempts + 1,
            &failure.error_code,
            &failure.message,
        );
    }

    fn record_failure(&self, path: &str, attempts: i64, code: &str, message: &str) {
        let backoff = RETRY_BASE_SECS * (1i64 << (attempts - 1).clamp(0, 8));
        let record = FailedTaskRecord {
            task_kind: TASK_KIND_INDEX.to_string(),
            path: path.to_string(),
            attempts,
            last_error_code: code.to_string(),
            last_error_message: message.to_string(),
            next_retry_ts: unix_timestamp() + backoff,
        };
        if let Err(e) = self.writer.enqueue(WriteTask::RecordFailed(record)) {
            warn!("Failed to record failure for {}: {}", path, e);
        }
    }

    fn job_for_path(
        &self,
        root: &WatchedRoot,
        abs_path: &Path,
        mtime: i64,
        size: i64,
    ) -> Option<ParseJob> {
        let rel = abs_path.strip_prefix(&root.abs_path).ok()?;
        let rel_path = rel.to_string_lossy().replace('\\', "/");
        Some(ParseJob {
            abs_path: abs_path.to_path_buf(),
            path_key: format!("{}/{}", root.root_id, rel_path),
            root_id: root.root_id.clone(),
            rel_path,
            repo: repo_for_root(root),
            mtime,
            size,
        })
    }

    fn path_key_for(&self, root: &WatchedRoot, abs_path: &Path) -> Result<String> {
        let rel = abs_path
            .strip_prefix(&root.abs_path)
            .with_context(|| format!("{abs_path:?} outside root {}", root.root_id))?;
        Ok(format!(
            "{}/{}",
            root.root_id,
            rel.to_string_lossy().replace('\\', "/")
        ))
    }

    /// Map a stored path key back to `(root, absolute path)`.
    fn locate(&self, path_key: &str) -> Option<(WatchedRoot, std::path::PathBuf)> {
        let (root_id, rel) = path_key.split_once('/')?;
        let root = self.roots.iter().find(|r| r.root_id == root_id)?.clone();
        let abs = root.abs_path.join(rel);
        Some((root, abs))
    }

    fn pool_submitter(&self) -> impl Fn(ParseJob) -> Result<()> + Send + 'static {
        // The event loop parses inline rather than through the pool: the
        // per-event rate is already bounded by the token bucket, and
        // inline parsing keeps result draining trivially ordered.
        let cfg = self.cfg.clone();
        let writer = self.writer.clone();
        move |job: ParseJob| {
            let indexed = process_file(&job, &cfg)?;
            let path = indexed.file.path.clone();
            writer.enqueue(WriteTask::UpsertFiles {
                rows: vec![indexed.file],
                engine_docs: vec![indexed.engine_doc],
            })?;
            if !indexed.symbols.is_empty() {
                writer.enqueue(WriteTask::UpsertSymbols(indexed.symbols))?;
            }
            if !indexed.relations.is_empty() {
                writer.enqueue(WriteTask::UpsertRelations(indexed.relations))?;
            }
            writer.enqueue(WriteTask::ResolveFailed {
                task_kind: TASK_KIND_INDEX.to_string(),
                path,
            })?;
            Ok(())
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
        self.pool.shutdown();
    }
}

/// Per-path logic for one watcher task: DELETE removes the row, INDEX
/// stats and (re)parses. A missing file on INDEX means the path raced a
/// delete; treat it as DELETE.
fn handle_event_task(
    task: &CoalesceTask,
    roots: &[WatchedRoot],
    db: &Arc<SearchDatabase>,
    writer: &Arc<WriterQueue>,
    submit: &(impl Fn(ParseJob) -> Result<()> + Send + 'static),
) -> Result<()> {
    let Some(root) = roots.iter().find(|r| r.root_id == task.root) else {
        anyhow::bail!("unknown root {}", task.root);
    };
    let rel = task
        .path
        .strip_prefix(&root.abs_path)
        .with_context(|| format!("{:?} outside root {}", task.path, task.root))?;
    let rel_path = rel.to_string_lossy().replace('\\', "/");
    let path_key = format!("{}/{}", root.root_id, rel_path);

    match task.action {
        TaskAction::Delete => {
            writer.enqueue(WriteTask::DeletePath(path_key))?;
        }
        TaskAction::Index => {
            let Ok(meta) = std::fs::metadata(&task.path) else {
                writer.enqueue(WriteTask::DeletePath(path_key))?;
                return Ok(());
            };
            if !meta.is_file() {
                return Ok(());
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if let Some(stored) = db.get_file_meta(&path_key) {
                if stored.mtime == mtime && stored.size == meta.len() as i64 {
                    writer.enqueue(WriteTask::UpdateLastSeen {
                        paths: vec![path_key],
                        ts: unix_timestamp(),
                    })?;
                    return Ok(());
                }
            }
            submit(ParseJob {
                abs_path: task.path.clone(),
                path_key,
                root_id: root.root_id.clone(),
                rel_path,
                repo: repo_for_root(root),
                mtime,
                size: meta.len() as i64,
            })?;
        }
    }
    Ok(())
}

fn repo_for_root(root: &WatchedRoot) -> String {
    root.abs_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "__root__".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite::SqliteEngine;
    use crate::workspace::root_id_for_path;

    fn setup(dir: &Path) -> (Arc<SearchDatabase>, Arc<WriterQueue>, Indexer, WatchedRoot) {
        let db = Arc::new(SearchDatabase::new(&dir.join("data").join("index.db")).unwrap());
        let writer = WriterQueue::start(db.clone(), 64, Duration::from_millis(20), 512);
        let engine: Arc<dyn SearchEngineOps> = Arc::new(SqliteEngine::new(db.clone()));
        let workspace = dir.join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        let root = WatchedRoot {
            root_id: root_id_for_path(&workspace),
            abs_path: workspace.canonicalize().unwrap(),
        };
        let cfg = Config::default();
        let queue = Arc::new(DedupQueue::new());
        let bucket = Arc::new(TokenBucket::new(cfg.bucket_capacity, cfg.bucket_fill_rate));
        let indexer = Indexer::new(
            cfg,
            db.clone(),
            writer.clone(),
            engine,
            vec![root.clone()],
            queue,
            bucket,
        );
        (db, writer, indexer, root)
    }

    fn write(root: &WatchedRoot, rel: &str, content: &str) -> std::path::PathBuf {
        let path = root.abs_path.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn scan_once_indexes_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let (db, writer, indexer, root) = setup(dir.path());

        write(&root, "src/app.py", "def find_me():\n    pass\n");
        write(&root, "src/other.py", "def other():\n    pass\n");
        let submitted = indexer.scan_once().unwrap();
        assert_eq!(submitted, 2);
        assert_eq!(db.count_files().unwrap(), 2);
        assert!(db.count_symbols().unwrap() >= 2);

        // Second scan with unchanged files: nothing re-submitted.
        let submitted = indexer.scan_once().unwrap();
        assert_eq!(submitted, 0);
        assert_eq!(db.count_files().unwrap(), 2);

        // Remove a file; the sweep tombstones it.
        std::fs::remove_file(root.abs_path.join("src/other.py")).unwrap();
        indexer.scan_once().unwrap();
        assert_eq!(db.count_files().unwrap(), 1);

        indexer.shutdown();
        writer.shutdown().unwrap();
    }

    #[test]
    fn event_task_index_and_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (db, writer, indexer, root) = setup(dir.path());
        let abs = write(&root, "watched.py", "def watched():\n    pass\n");

        let submit = indexer.pool_submitter();
        let task = CoalesceTask::new(
            TaskAction::Index,
            abs.clone(),
            root.root_id.clone(),
            1.0,
        );
        handle_event_task(&task, &[root.clone()], &db, &writer, &submit).unwrap();
        writer.flush().unwrap();
        let path_key = format!("{}/watched.py", root.root_id);
        assert!(db.read_file(&path_key).unwrap().is_some());

        let task = CoalesceTask::new(TaskAction::Delete, abs, root.root_id.clone(), 2.0);
        handle_event_task(&task, &[root.clone()], &db, &writer, &submit).unwrap();
        writer.flush().unwrap();
        assert!(db.read_file(&path_key).unwrap().is_none());

        indexer.shutdown();
        writer.shutdown().unwrap();
    }

    #[test]
    fn parse_failures_are_dead_lettered() {
        let dir = tempfile::tempdir().unwrap();
        let (db, writer, indexer, _root) = setup(dir.path());

        indexer.handle_parse_failure(&ParseFailure {
            path_key: "root-x/gone.py".to_string(),
            error_code: "parse_error".to_string(),
            message: "no such file".to_string(),
        });
        writer.flush().unwrap();
        let (total, _) = db.count_failed_tasks().unwrap();
        assert_eq!(total, 1);

        indexer.shutdown();
        writer.shutdown().unwrap();
    }
}
