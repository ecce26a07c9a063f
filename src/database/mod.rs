// Storage kernel.
//
// One SQLite database per workspace holds roots, files, symbols, relations,
// failed tasks, repo metadata, snippets, and contexts. Access is split into
// a single designated writer (all mutations funnel through the writer queue
// in `writer.rs`) and a pool of read-only connections. File content is
// zlib-compressed at rest; a `deckard_decompress` SQL function backs the
// `files_view` view that feeds the FTS5 triggers.

pub mod failed;
pub mod files;
pub mod manager;
pub mod overlay;
pub mod relations;
pub mod schema;
pub mod snapshot;
pub mod snippets;
pub mod symbols;
pub mod types;
pub mod writer;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Instant;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use tracing::debug;

use crate::config::Config;
use crate::engine::EngineDoc;
use overlay::Overlay;

pub use types::*;

/// Errors with a stable surface; everything else rides on `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A mutating call arrived from a thread other than the registered
    /// writer. Fatal to the offending caller, harmless to the store.
    #[error("WriterThreadViolation: DB write attempted outside single-writer thread")]
    WriterThreadViolation,

    #[error("storage switch refused: {0}")]
    SwitchRefused(String),
}

/// Payload handed to post-commit subscribers after each writer batch.
#[derive(Debug, Default, Clone)]
pub struct CommitNotice {
    /// Paths committed (upserts and deletes) in this batch.
    pub paths: Vec<String>,
    /// Documents for the embedded engine.
    pub engine_docs: Vec<EngineDoc>,
    /// Doc ids to drop from the embedded engine.
    pub engine_deletes: Vec<String>,
    pub commit_ts: i64,
}

type PostCommitFn = dyn Fn(&CommitNotice) + Send + Sync;

const STATS_CACHE_TTL_SECS: u64 = 60;

#[derive(Default)]
struct StatsCache {
    repo_stats: Option<HashMap<String, i64>>,
    legacy_paths: Option<bool>,
    stamped: Option<Instant>,
}

impl StatsCache {
    fn fresh(&self) -> bool {
        self.stamped
            .map(|t| t.elapsed().as_secs() < STATS_CACHE_TTL_SECS)
            .unwrap_or(false)
    }
}

/// SQLite-backed index store with single-writer discipline.
pub struct SearchDatabase {
    db_path: PathBuf,
    write: Mutex<Connection>,
    primary_read: Mutex<Connection>,
    read_pool: Mutex<Vec<Connection>>,
    reads_created: AtomicUsize,
    read_pool_max: usize,
    writer_thread: Mutex<Option<ThreadId>>,
    overlay: Overlay,
    post_commit: Mutex<Vec<Box<PostCommitFn>>>,
    stats_cache: Mutex<StatsCache>,
    fts_enabled: bool,
}

impl SearchDatabase {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database dir {parent:?}"))?;
        }

        let write = Connection::open(db_path)
            .with_context(|| format!("opening database {db_path:?}"))?;
        Self::apply_pragmas(&write)?;
        Self::register_decompress(&write)?;

        let fts_enabled = Self::probe_fts(&write);
        schema::initialize_schema(&write, fts_enabled)?;

        let primary_read = Self::open_read_connection(db_path)?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            write: Mutex::new(write),
            primary_read: Mutex::new(primary_read),
            read_pool: Mutex::new(Vec::new()),
            reads_created: AtomicUsize::new(1),
            read_pool_max: Config::read_pool_max(),
            writer_thread: Mutex::new(None),
            overlay: Overlay::with_default_capacity(),
            post_commit: Mutex::new(Vec::new()),
            stats_cache: Mutex::new(StatsCache::default()),
            fts_enabled,
        })
    }

    /// Throwaway on-disk database for tests; keeps the full schema (the
    /// decompressing view and FTS triggers need a real file under WAL).
    pub fn in_memory() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("deckard-mem-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Self::new(&dir.join("index.db"))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA busy_timeout=2000;
             PRAGMA cache_size=-20000;",
        )?;
        Ok(())
    }

    fn register_decompress(conn: &Connection) -> Result<()> {
        conn.create_scalar_function(
            "deckard_decompress",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let value = ctx.get_raw(0);
                let text = match value {
                    rusqlite::types::ValueRef::Blob(b) => decompress_bytes(b),
                    rusqlite::types::ValueRef::Text(t) => {
                        String::from_utf8_lossy(t).into_owned()
                    }
                    _ => String::new(),
                };
                Ok(text)
            },
        )?;
        Ok(())
    }

    fn probe_fts(conn: &Connection) -> bool {
        let ok = conn
            .execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS __fts_probe USING fts5(x);
                 DROP TABLE IF EXISTS __fts_probe;",
            )
            .is_ok();
        if !ok {
            debug!("FTS5 unavailable; falling back to LIKE-only search");
        }
        ok
    }

    fn open_read_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        Self::apply_pragmas(&conn)?;
        Self::register_decompress(&conn)?;
        let _ = conn.execute_batch("PRAGMA query_only=ON;");
        Ok(conn)
    }

    /// Acquire a read-only connection. Pool misses open a new connection up
    /// to the configured maximum; past that, readers share the primary read
    /// connection (safe under WAL).
    pub fn read(&self) -> ReadConn<'_> {
        if let Some(conn) = self.read_pool.lock().unwrap().pop() {
            return ReadConn::Pooled {
                conn: Some(conn),
                pool: &self.read_pool,
            };
        }
        if self.reads_created.load(Ordering::Relaxed) < self.read_pool_max {
            if let Ok(conn) = Self::open_read_connection(&self.db_path) {
                self.reads_created.fetch_add(1, Ordering::Relaxed);
                return ReadConn::Pooled {
                    conn: Some(conn),
                    pool: &self.read_pool,
                };
            }
        }
        ReadConn::Primary(self.primary_read.lock().unwrap())
    }

    // ----- single-writer discipline -----

    pub fn register_writer_thread(&self, id: Option<ThreadId>) {
        *self.writer_thread.lock().unwrap() = id;
    }

    /// Mutations must run on the registered writer thread. When no writer
    /// is registered (tests, one-shot scripts) direct writes are allowed.
    pub fn assert_writer_thread(&self) -> Result<()> {
        let registered = *self.writer_thread.lock().unwrap();
        match registered {
            None => Ok(()),
            Some(id) if id == std::thread::current().id() => Ok(()),
            Some(_) => Err(StorageError::WriterThreadViolation.into()),
        }
    }

    /// Lock the writer connection after enforcing writer-thread identity.
    pub(crate) fn write_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.assert_writer_thread()?;
        Ok(self.write.lock().unwrap())
    }

    // ----- post-commit subscription -----

    pub fn subscribe_post_commit<F>(&self, f: F)
    where
        F: Fn(&CommitNotice) + Send + Sync + 'static,
    {
        self.post_commit.lock().unwrap().push(Box::new(f));
    }

    /// Fired by the writer after each batch commit. Committed paths leave
    /// the overlay before any subscriber observes the notice.
    pub(crate) fn notify_post_commit(&self, notice: &CommitNotice) {
        for path in &notice.paths {
            self.overlay.remove(path);
        }
        self.clear_stats_cache();
        let subs = self.post_commit.lock().unwrap();
        for sub in subs.iter() {
            sub(notice);
        }
    }

    // ----- stats TTL cache -----

    pub fn clear_stats_cache(&self) {
        *self.stats_cache.lock().unwrap() = StatsCache::default();
    }

    /// File counts per repo, cached for 60 s.
    pub fn get_repo_stats(&self, root_ids: &[String]) -> HashMap<String, i64> {
        if root_ids.is_empty() {
            let cache = self.stats_cache.lock().unwrap();
            if cache.fresh() {
                if let Some(stats) = &cache.repo_stats {
                    return stats.clone();
                }
            }
        }
        let stats = self.query_repo_stats(root_ids).unwrap_or_default();
        if root_ids.is_empty() {
            let mut cache = self.stats_cache.lock().unwrap();
            cache.repo_stats = Some(stats.clone());
            cache.stamped = Some(Instant::now());
        }
        stats
    }

    fn query_repo_stats(&self, root_ids: &[String]) -> Result<HashMap<String, i64>> {
        let conn = self.read();
        let mut out = HashMap::new();
        if root_ids.is_empty() {
            let mut stmt =
                conn.prepare("SELECT repo, COUNT(1) AS c FROM files GROUP BY repo")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (repo, count) = row?;
                out.insert(repo, count);
            }
        } else {
            let clauses = vec!["path LIKE ?"; root_ids.len()].join(" OR ");
            let sql =
                format!("SELECT repo, COUNT(1) AS c FROM files WHERE {clauses} GROUP BY repo");
            let params: Vec<String> = root_ids.iter().map(|r| format!("{r}/%")).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter()),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?;
            for row in rows {
                let (repo, count) = row?;
                out.insert(repo, count);
            }
        }
        Ok(out)
    }

    /// True if the store still contains pre-root-id paths; cached 60 s.
    pub fn has_legacy_paths(&self) -> bool {
        {
            let cache = self.stats_cache.lock().unwrap();
            if cache.fresh() {
                if let Some(v) = cache.legacy_paths {
                    return v;
                }
            }
        }
        let exists = {
            let conn = self.read();
            conn.query_row(
                "SELECT 1 FROM files WHERE path NOT LIKE 'root-%/%' LIMIT 1",
                [],
                |_| Ok(()),
            )
            .is_ok()
        };
        let mut cache = self.stats_cache.lock().unwrap();
        cache.legacy_paths = Some(exists);
        if cache.stamped.is_none() {
            cache.stamped = Some(Instant::now());
        }
        exists
    }

    /// WAL checkpoint (TRUNCATE); returns (busy, log, checkpointed).
    pub fn checkpoint_wal(&self) -> Result<(i64, i64, i64)> {
        let conn = self.write.lock().unwrap();
        let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(result)
    }

    /// Database file size plus quick counters, for status/doctor.
    pub fn index_status(&self) -> Result<IndexStatus> {
        let conn = self.read();
        let (count, last_mtime): (i64, i64) = conn.query_row(
            "SELECT COUNT(1), COALESCE(MAX(mtime), 0) FROM files",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let db_size = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        Ok(IndexStatus {
            total_files: count,
            last_mtime,
            db_size_bytes: db_size,
        })
    }
}

/// A read-only connection lease.
pub enum ReadConn<'a> {
    Pooled {
        conn: Option<Connection>,
        pool: &'a Mutex<Vec<Connection>>,
    },
    Primary(MutexGuard<'a, Connection>),
}

impl Deref for ReadConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ReadConn::Pooled { conn, .. } => conn.as_ref().expect("pooled connection present"),
            ReadConn::Primary(guard) => guard,
        }
    }
}

impl Drop for ReadConn<'_> {
    fn drop(&mut self) {
        if let ReadConn::Pooled { conn, pool } = self {
            if let Some(conn) = conn.take() {
                pool.lock().unwrap().push(conn);
            }
        }
    }
}

// ----- content compression -----

/// zlib-compress file content (level 6). Empty text compresses to empty.
pub fn compress_text(text: &str) -> Vec<u8> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
    if encoder.write_all(text.as_bytes()).is_err() {
        return Vec::new();
    }
    encoder.finish().unwrap_or_default()
}

/// Inverse of `compress_text`; legacy uncompressed text passes through.
pub fn decompress_bytes(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut decoder = ZlibDecoder::new(data);
    let mut out = String::new();
    match decoder.read_to_string(&mut out) {
        Ok(_) => out,
        Err(_) => String::from_utf8_lossy(data).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_roundtrip() {
        let text = "fn main() { println!(\"hello\"); }\n".repeat(50);
        let packed = compress_text(&text);
        assert!(packed.len() < text.len());
        assert_eq!(decompress_bytes(&packed), text);
        assert_eq!(decompress_bytes(b""), "");
    }

    #[test]
    fn legacy_uncompressed_content_passes_through() {
        assert_eq!(decompress_bytes(b"plain old text"), "plain old text");
    }

    #[test]
    fn writer_thread_enforcement() {
        let db = SearchDatabase::in_memory().unwrap();
        // Unregistered: direct writes allowed.
        assert!(db.assert_writer_thread().is_ok());

        db.register_writer_thread(Some(std::thread::current().id()));
        assert!(db.assert_writer_thread().is_ok());

        let db = std::sync::Arc::new(db);
        let db2 = db.clone();
        let err = std::thread::spawn(move || db2.assert_writer_thread())
            .join()
            .unwrap();
        let err = err.expect_err("write from foreign thread must fail");
        assert!(err.to_string().contains("WriterThreadViolation"));
    }

    #[test]
    fn read_pool_hands_out_connections() {
        let db = SearchDatabase::in_memory().unwrap();
        let c1 = db.read();
        let n: i64 = c1.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
        drop(c1);
        // Returned to the pool and reusable.
        let c2 = db.read();
        let n: i64 = c2.query_row("SELECT 2", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 2);
    }
}
