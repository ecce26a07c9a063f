// File and root operations.
//
// The `*_tx` functions run inside a writer transaction and never
// commit/rollback themselves; the plain methods wrap one transaction for
// direct use (tests, one-shot scripts).

use anyhow::Result;
use rusqlite::{Connection, params, params_from_iter};
use tracing::debug;

use crate::engine::EngineDoc;
use crate::search::ranking::{get_file_extension, glob_to_like};
use crate::utils::unix_timestamp;
use crate::{cjk, workspace};

use super::types::{FileListing, FileMeta, FileRecord, RepoMetaRecord, RootRecord};
use super::{SearchDatabase, compress_text, decompress_bytes};

/// Upsert file rows with the mtime guard: a row with an older mtime never
/// overwrites a newer one and is a complete no-op. Symbols are cleared in
/// the same transaction, but only for paths whose guarded upsert actually
/// applied; the parser output re-inserts them. Returns the applied count.
pub fn upsert_files_tx(conn: &Connection, rows: &[FileRecord]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let now = unix_timestamp();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO files(path, root_id, rel_path, repo, mtime, size, content,
                           content_hash, content_bytes, fts_content, last_seen,
                           parse_status, parse_reason, ast_status, ast_reason,
                           is_binary, is_minified, sampled, updated_ts)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
         ON CONFLICT(path) DO UPDATE SET
           root_id=excluded.root_id,
           rel_path=excluded.rel_path,
           repo=excluded.repo,
           mtime=excluded.mtime,
           size=excluded.size,
           content=excluded.content,
           content_hash=excluded.content_hash,
           content_bytes=excluded.content_bytes,
           fts_content=excluded.fts_content,
           last_seen=excluded.last_seen,
           parse_status=excluded.parse_status,
           parse_reason=excluded.parse_reason,
           ast_status=excluded.ast_status,
           ast_reason=excluded.ast_reason,
           is_binary=excluded.is_binary,
           is_minified=excluded.is_minified,
           sampled=excluded.sampled,
           updated_ts=excluded.updated_ts
         WHERE excluded.mtime >= files.mtime",
    )?;
    let mut applied: Vec<&str> = Vec::new();
    for row in rows {
        let compressed = compress_text(&row.content);
        let changed = stmt.execute(params![
            row.path,
            row.root_id,
            row.rel_path,
            row.repo,
            row.mtime,
            row.size,
            compressed,
            row.content_hash,
            row.content.len() as i64,
            row.fts_content,
            row.last_seen,
            row.parse_status,
            row.parse_reason,
            row.ast_status,
            row.ast_reason,
            row.is_binary as i64,
            row.is_minified as i64,
            row.sampled as i64,
            now,
        ])?;
        // A stale mtime makes the guarded UPDATE a no-op (0 rows); its
        // symbols must survive untouched.
        if changed > 0 {
            applied.push(row.path.as_str());
        }
    }
    drop(stmt);
    let mut clear = conn.prepare_cached("DELETE FROM symbols WHERE path = ?1")?;
    for path in &applied {
        clear.execute(params![path])?;
    }
    Ok(applied.len())
}

pub fn update_last_seen_tx(conn: &Connection, paths: &[String], ts: i64) -> Result<usize> {
    if paths.is_empty() {
        return Ok(0);
    }
    let mut stmt = conn.prepare_cached("UPDATE files SET last_seen=?1 WHERE path=?2")?;
    for path in paths {
        stmt.execute(params![ts, path])?;
    }
    Ok(paths.len())
}

/// Delete a single path with its symbols and relations. Explicit delete
/// order (relations, symbols, files) avoids any FK/cascade dependency.
pub fn delete_path_tx(conn: &Connection, path: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM symbol_relations WHERE from_path = ?1 OR to_path = ?1",
        params![path],
    )?;
    conn.execute("DELETE FROM symbols WHERE path = ?1", params![path])?;
    conn.execute("DELETE FROM files WHERE path = ?1", params![path])?;
    Ok(())
}

/// Tombstone files not observed since `cutoff_ts`; returns the removed
/// paths so the embedded engine can drop their documents.
pub fn delete_unseen_tx(conn: &Connection, cutoff_ts: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM files WHERE last_seen < ?1")?;
    let paths: Vec<String> = stmt
        .query_map(params![cutoff_ts], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    for path in &paths {
        delete_path_tx(conn, path)?;
    }
    Ok(paths)
}

pub fn upsert_root_tx(conn: &Connection, root: &RootRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO roots(root_id, abs_path, label, created_ts, updated_ts)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(root_id) DO UPDATE SET
           abs_path=excluded.abs_path,
           label=excluded.label,
           updated_ts=excluded.updated_ts",
        params![
            root.root_id,
            root.abs_path,
            root.label,
            root.created_ts,
            root.updated_ts
        ],
    )?;
    Ok(())
}

pub fn upsert_repo_meta_tx(conn: &Connection, meta: &RepoMetaRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO repo_meta(repo_name, tags, domain, description, priority)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            meta.repo_name,
            meta.tags,
            meta.domain,
            meta.description,
            meta.priority
        ],
    )?;
    Ok(())
}

impl SearchDatabase {
    pub fn upsert_files(&self, rows: &[FileRecord]) -> Result<usize> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let count = upsert_files_tx(&tx, rows)?;
        tx.commit()?;
        Ok(count)
    }

    pub fn update_last_seen(&self, paths: &[String], ts: i64) -> Result<usize> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let count = update_last_seen_tx(&tx, paths, ts)?;
        tx.commit()?;
        Ok(count)
    }

    pub fn delete_path(&self, path: &str) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        delete_path_tx(&tx, path)?;
        tx.commit()?;
        Ok(())
    }

    /// Tombstone files whose `last_seen` predates the latest scan.
    /// Idempotent: rows with `last_seen >= cutoff` are never touched.
    pub fn delete_unseen_files(&self, cutoff_ts: i64) -> Result<Vec<String>> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let paths = delete_unseen_tx(&tx, cutoff_ts)?;
        tx.commit()?;
        if !paths.is_empty() {
            debug!("Tombstoned {} unseen files", paths.len());
        }
        Ok(paths)
    }

    pub fn upsert_root(&self, root: &RootRecord) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        upsert_root_tx(&tx, root)?;
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_repo_meta(&self, meta: &RepoMetaRecord) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        upsert_repo_meta_tx(&tx, meta)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_all_repo_meta(&self) -> Result<std::collections::HashMap<String, RepoMetaRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT repo_name, tags, domain, description, priority FROM repo_meta",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RepoMetaRecord {
                repo_name: row.get(0)?,
                tags: row.get(1)?,
                domain: row.get(2)?,
                description: row.get(3)?,
                priority: row.get(4)?,
            })
        })?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let meta = row?;
            out.insert(meta.repo_name.clone(), meta);
        }
        Ok(out)
    }

    pub fn list_roots(&self) -> Result<Vec<RootRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT root_id, abs_path, label, created_ts, updated_ts FROM roots ORDER BY root_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RootRecord {
                root_id: row.get(0)?,
                abs_path: row.get(1)?,
                label: row.get(2)?,
                created_ts: row.get(3)?,
                updated_ts: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// File metadata for change detection; consults the overlay first so
    /// just-enqueued rows are already visible.
    pub fn get_file_meta(&self, path: &str) -> Option<FileMeta> {
        if let Some(meta) = self.overlay().meta(path) {
            return Some(meta);
        }
        let conn = self.read();
        conn.query_row(
            "SELECT mtime, size FROM files WHERE path = ?1",
            params![path],
            |row| {
                Ok(FileMeta {
                    mtime: row.get(0)?,
                    size: row.get(1)?,
                })
            },
        )
        .ok()
    }

    /// Read decompressed file content, overlay-aware, clipped to
    /// `DECKARD_READ_MAX_BYTES`.
    pub fn read_file(&self, path: &str) -> Result<Option<String>> {
        let content = if let Some(entry) = self.overlay().get(path) {
            Some(entry.content)
        } else {
            let conn = self.read();
            conn.query_row(
                "SELECT content FROM files WHERE path = ?1",
                params![path],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .map(|blob| decompress_bytes(&blob))
            .ok()
        };
        let Some(content) = content else {
            return Ok(None);
        };

        let max_bytes = crate::utils::file::parse_size(
            std::env::var("DECKARD_READ_MAX_BYTES").ok().as_deref(),
            1 << 20,
        ) as usize;
        if max_bytes > 0 && content.len() > max_bytes {
            let mut cut = max_bytes;
            while cut > 0 && !content.is_char_boundary(cut) {
                cut -= 1;
            }
            let clipped = &content[..cut];
            return Ok(Some(format!(
                "{clipped}\n\n... [CONTENT TRUNCATED (read_file bytes={} max_bytes={max_bytes})] ...",
                content.len()
            )));
        }
        Ok(Some(content))
    }

    pub fn get_all_file_paths(&self) -> Result<Vec<String>> {
        let conn = self.read();
        let mut stmt = conn.prepare("SELECT path FROM files")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn get_unseen_paths(&self, cutoff_ts: i64) -> Result<Vec<String>> {
        let conn = self.read();
        let mut stmt = conn.prepare("SELECT path FROM files WHERE last_seen < ?1")?;
        let rows = stmt.query_map(params![cutoff_ts], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn count_files(&self) -> Result<i64> {
        let conn = self.read();
        Ok(conn.query_row("SELECT COUNT(1) FROM files", [], |row| row.get(0))?)
    }

    /// Remove legacy rows whose path lacks the `root-*/` prefix. Returns
    /// the number of purged paths.
    pub fn purge_legacy_paths(&self) -> Result<usize> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let paths: Vec<String> = {
            let mut stmt = tx.prepare("SELECT path FROM files WHERE path NOT LIKE 'root-%/%'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for path in &paths {
            delete_path_tx(&tx, path)?;
        }
        tx.commit()?;
        Ok(paths.len())
    }

    /// List indexed files with filtering and pagination; returns rows plus
    /// `(total, per-repo counts)`.
    #[allow(clippy::too_many_arguments)]
    pub fn list_files(
        &self,
        repo: Option<&str>,
        path_pattern: Option<&str>,
        file_types: &[String],
        include_hidden: bool,
        limit: usize,
        offset: usize,
        root_ids: &[String],
    ) -> Result<(Vec<FileListing>, i64, Vec<(String, i64)>)> {
        let limit = limit.min(500);
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if !root_ids.is_empty() {
            let root_clauses = vec!["f.path LIKE ?"; root_ids.len()].join(" OR ");
            clauses.push(format!("({root_clauses})"));
            params.extend(root_ids.iter().map(|r| format!("{r}/%")));
        }
        if let Some(repo) = repo {
            clauses.push("f.repo = ?".to_string());
            params.push(repo.to_string());
        }
        if !include_hidden {
            clauses.push("f.path NOT LIKE '%/.%'".to_string());
            clauses.push("f.path NOT LIKE '.%'".to_string());
        }
        if !file_types.is_empty() {
            let type_clauses = vec!["f.path LIKE ?"; file_types.len()].join(" OR ");
            clauses.push(format!("({type_clauses})"));
            params.extend(
                file_types
                    .iter()
                    .map(|ft| format!("%.{}", ft.to_lowercase().trim_start_matches('.'))),
            );
        }
        if let Some(pattern) = path_pattern {
            clauses.push("f.path LIKE ?".to_string());
            params.push(glob_to_like(pattern));
        }

        let where_sql = if clauses.is_empty() {
            "1=1".to_string()
        } else {
            clauses.join(" AND ")
        };

        let conn = self.read();
        let sql = format!(
            "SELECT f.repo, f.path, f.mtime, f.size
             FROM files f WHERE {where_sql}
             ORDER BY f.repo, f.path LIMIT {limit} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut files = Vec::new();
        for row in rows {
            let (repo, path, mtime, size) = row?;
            let file_type = get_file_extension(&path);
            files.push(FileListing {
                repo,
                path,
                mtime,
                size,
                file_type,
            });
        }

        let count_sql = format!("SELECT COUNT(1) FROM files f WHERE {where_sql}");
        let total: i64 =
            conn.query_row(&count_sql, params_from_iter(params.iter()), |row| row.get(0))?;

        let repo_sql = format!(
            "SELECT repo, COUNT(1) AS c FROM files f WHERE {where_sql}
             GROUP BY repo ORDER BY c DESC"
        );
        let mut stmt = conn.prepare(&repo_sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let repos = rows.collect::<std::result::Result<_, _>>()?;

        Ok((files, total, repos))
    }

    /// Rebuild the embedded-engine document set from stored rows.
    pub fn build_engine_documents(
        &self,
        root_ids: &[String],
        max_doc_bytes: usize,
        preview_bytes: usize,
    ) -> Result<Vec<EngineDoc>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT path, repo, mtime, size, content, parse_status FROM files",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (path, repo, mtime, size, blob, parse_status) = row?;
            let Some((root_id, rel_path)) = workspace::split_file_key(&path) else {
                continue;
            };
            if !root_ids.is_empty() && !root_ids.iter().any(|r| r == root_id) {
                continue;
            }
            let body = if parse_status == "ok" {
                decompress_bytes(&blob)
            } else {
                String::new()
            };
            docs.push(EngineDoc::build(
                &path,
                root_id,
                rel_path,
                &repo,
                &body,
                mtime,
                size,
                max_doc_bytes,
                preview_bytes,
            ));
        }
        Ok(docs)
    }
}

/// Build an engine document body out of raw content: normalize, segment
/// CJK, cap at `max_doc_bytes` keeping head half + tail half.
pub fn engine_body_text(raw: &str, max_doc_bytes: usize) -> String {
    let mut norm = cjk::normalize_engine_text(raw);
    if cjk::has_cjk(&norm) {
        norm = cjk::cjk_space(&norm);
    }
    if max_doc_bytes > 0 && norm.len() > max_doc_bytes {
        let head = max_doc_bytes / 2;
        let tail = max_doc_bytes - head;
        let mut head_end = head.min(norm.len());
        while head_end > 0 && !norm.is_char_boundary(head_end) {
            head_end -= 1;
        }
        let mut tail_start = norm.len().saturating_sub(tail);
        while tail_start < norm.len() && !norm.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        norm = format!("{}{}", &norm[..head_end], &norm[tail_start..]);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::super::SearchDatabase;
    use super::*;

    fn sample_row(path: &str, mtime: i64, content: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            root_id: "root-aaaa".to_string(),
            rel_path: path.split_once('/').map(|x| x.1).unwrap_or(path).to_string(),
            repo: "demo".to_string(),
            mtime,
            size: content.len() as i64,
            content: content.to_string(),
            parse_status: "ok".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_respects_mtime_guard() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[sample_row("root-aaaa/a.py", 100, "new content")])
            .unwrap();
        // Stale row: must be a no-op.
        db.upsert_files(&[sample_row("root-aaaa/a.py", 50, "old content")])
            .unwrap();
        let meta = db.get_file_meta("root-aaaa/a.py").unwrap();
        assert_eq!(meta.mtime, 100);
        let content = db.read_file("root-aaaa/a.py").unwrap().unwrap();
        assert_eq!(content, "new content");

        // Equal-or-newer mtime wins.
        db.upsert_files(&[sample_row("root-aaaa/a.py", 100, "updated")])
            .unwrap();
        assert_eq!(db.read_file("root-aaaa/a.py").unwrap().unwrap(), "updated");
    }

    #[test]
    fn stale_upsert_preserves_symbols() {
        use super::super::types::SymbolRecord;

        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[sample_row("root-aaaa/a.py", 100, "def find_me(): pass")])
            .unwrap();
        db.upsert_symbols(&[SymbolRecord {
            path: "root-aaaa/a.py".to_string(),
            name: "find_me".to_string(),
            qualname: "find_me".to_string(),
            kind: "function".to_string(),
            line: 1,
            end_line: 1,
            ..Default::default()
        }])
        .unwrap();
        assert_eq!(db.count_symbols().unwrap(), 1);

        // Out-of-order write: the mtime guard no-ops the row, and the
        // symbols for the path must survive.
        let applied = db
            .upsert_files(&[sample_row("root-aaaa/a.py", 50, "old content")])
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(db.count_symbols().unwrap(), 1);
        assert_eq!(
            db.read_file("root-aaaa/a.py").unwrap().unwrap(),
            "def find_me(): pass"
        );
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let db = SearchDatabase::in_memory().unwrap();
        let rows = vec![
            sample_row("root-aaaa/a.py", 10, "alpha"),
            sample_row("root-aaaa/b.py", 20, "beta"),
        ];
        db.upsert_files(&rows).unwrap();
        db.upsert_files(&rows).unwrap();
        assert_eq!(db.count_files().unwrap(), 2);
        assert_eq!(db.read_file("root-aaaa/a.py").unwrap().unwrap(), "alpha");
    }

    #[test]
    fn delete_unseen_is_idempotent() {
        let db = SearchDatabase::in_memory().unwrap();
        let mut seen = sample_row("root-aaaa/kept.py", 10, "kept");
        seen.last_seen = 200;
        let mut unseen = sample_row("root-aaaa/gone.py", 10, "gone");
        unseen.last_seen = 100;
        db.upsert_files(&[seen, unseen]).unwrap();

        let removed = db.delete_unseen_files(150).unwrap();
        assert_eq!(removed, vec!["root-aaaa/gone.py".to_string()]);
        let removed_again = db.delete_unseen_files(150).unwrap();
        assert!(removed_again.is_empty());
        assert_eq!(db.count_files().unwrap(), 1);
    }

    #[test]
    fn purge_legacy_paths_keeps_rooted_rows() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[
            sample_row("root-aaaa/new.py", 10, "new"),
            sample_row("legacy/old.py", 10, "old"),
        ])
        .unwrap();
        let purged = db.purge_legacy_paths().unwrap();
        assert_eq!(purged, 1);
        assert!(db.read_file("legacy/old.py").unwrap().is_none());
        assert!(db.read_file("root-aaaa/new.py").unwrap().is_some());
    }

    #[test]
    fn list_files_filters_by_type_and_pattern() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[
            sample_row("root-aaaa/src/app.py", 10, "print(1)"),
            sample_row("root-aaaa/styles.css", 10, "body {}"),
        ])
        .unwrap();
        let (files, total, _) = db
            .list_files(None, None, &["py".to_string()], true, 100, 0, &[])
            .unwrap();
        assert_eq!(total, 1);
        assert!(files[0].path.ends_with(".py"));

        let (files, _, _) = db
            .list_files(None, Some("root-aaaa/src/*"), &[], true, 100, 0, &[])
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_type, "py");
    }

    #[test]
    fn engine_body_caps_keep_head_and_tail() {
        let raw = format!("{}{}{}", "h".repeat(600), "MIDDLE", "t".repeat(600));
        let body = engine_body_text(&raw, 100);
        assert_eq!(body.len(), 100);
        assert!(body.starts_with('h'));
        assert!(body.ends_with('t'));
        assert!(!body.contains("middle"));
    }
}
