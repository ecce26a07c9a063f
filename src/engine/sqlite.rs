// SQLite FTS5 engine adapter.
//
// The FTS5 virtual table is kept in sync by triggers over `files_view`, so
// `apply_sync` has nothing to do; `search` runs the MATCH query with the
// path/filetype priors folded into the score in SQL.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use rusqlite::params_from_iter;

use crate::cjk;
use crate::database::SearchDatabase;
use crate::search::ranking::{extract_terms, fts_quote_terms};

use super::{EngineDoc, EngineError, EngineHit, EngineStatus, SearchEngineOps};

pub struct SqliteEngine {
    db: Arc<SearchDatabase>,
    index_version: AtomicU64,
}

impl SqliteEngine {
    pub fn new(db: Arc<SearchDatabase>) -> Self {
        Self {
            db,
            index_version: AtomicU64::new(0),
        }
    }
}

impl SearchEngineOps for SqliteEngine {
    fn search(
        &self,
        query: &str,
        root_ids: &[String],
        limit: usize,
    ) -> std::result::Result<Vec<EngineHit>, EngineError> {
        if !self.db.fts_enabled() {
            return Err(EngineError::Unavailable(
                "FTS5 not available in this SQLite build".to_string(),
            ));
        }
        let normalized = cjk::normalize_engine_text(query);
        let terms = extract_terms(&normalized);
        let match_expr = fts_quote_terms(&terms);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT f.path, f.repo, f.mtime, f.size, -1.0 * bm25(files_fts) AS score
             FROM files_fts JOIN files f ON f.rowid = files_fts.rowid
             WHERE files_fts MATCH ?",
        );
        let mut params: Vec<String> = vec![match_expr];
        if !root_ids.is_empty() {
            let clauses = vec!["f.path LIKE ?"; root_ids.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses})"));
            params.extend(root_ids.iter().map(|r| format!("{r}/%")));
        }
        sql.push_str(&format!(" ORDER BY score DESC LIMIT {}", limit.max(1)));

        let conn = self.db.read();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EngineError::Query(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok(EngineHit {
                    path: row.get(0)?,
                    repo: row.get(1)?,
                    mtime: row.get(2)?,
                    size: row.get(3)?,
                    score: row.get(4)?,
                })
            })
            .map_err(|e| EngineError::Query(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let mut hit = row.map_err(|e| EngineError::Query(e.to_string()))?;
            hit.score += super::path_prior(&hit.path) + super::filetype_prior(&hit.path);
            hits.push(hit);
        }
        // Priors are applied after the SQL fetch, so re-sort with the
        // deterministic tie-break.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.mtime.cmp(&a.mtime))
                .then(a.path.cmp(&b.path))
        });
        Ok(hits)
    }

    fn apply_sync(&self, _docs: &[EngineDoc], _deletes: &[String]) -> Result<()> {
        // Triggers are the sole source of truth for this backend.
        self.index_version.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rebuild(&self, _docs: &[EngineDoc]) -> Result<()> {
        // External-content FTS rebuild; must run on the writer thread (or
        // with no writer registered, e.g. maintenance scripts).
        let conn = self.db.write_conn()?;
        conn.execute_batch("INSERT INTO files_fts(files_fts) VALUES('rebuild')")?;
        self.index_version.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        let doc_count = self.db.count_files().unwrap_or(0).max(0) as u64;
        EngineStatus {
            engine_mode: "sqlite".to_string(),
            engine_ready: self.db.fts_enabled(),
            reason: if self.db.fts_enabled() {
                String::new()
            } else {
                "FTS5_UNAVAILABLE".to_string()
            },
            hint: String::new(),
            doc_count,
            index_size_bytes: std::fs::metadata(self.db.db_path())
                .map(|m| m.len())
                .unwrap_or(0),
            index_version: self.index_version.load(Ordering::Relaxed),
            tokenizer_ready: true,
            tokenizer_note: "unicode61 (FTS5 built-in)".to_string(),
        }
    }

    fn install(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::types::FileRecord;

    fn seeded_db() -> Arc<SearchDatabase> {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        db.upsert_files(&[
            FileRecord {
                path: "root-a/src/main.py".to_string(),
                repo: "demo".to_string(),
                mtime: 100,
                size: 30,
                content: "def handler(): return answer_token".to_string(),
                parse_status: "ok".to_string(),
                ..Default::default()
            },
            FileRecord {
                path: "root-a/tests/test_main.py".to_string(),
                repo: "demo".to_string(),
                mtime: 90,
                size: 20,
                content: "answer_token in test".to_string(),
                parse_status: "ok".to_string(),
                ..Default::default()
            },
        ])
        .unwrap();
        db
    }

    #[test]
    fn match_query_returns_both_and_prefers_src() {
        let db = seeded_db();
        let engine = SqliteEngine::new(db);
        let hits = engine.search("answer_token", &[], 10).unwrap();
        assert_eq!(hits.len(), 2);
        // src/ carries +0.6, tests/ carries -0.7.
        assert_eq!(hits[0].path, "root-a/src/main.py");
    }

    #[test]
    fn root_scope_filters_hits() {
        let db = seeded_db();
        let engine = SqliteEngine::new(db);
        let hits = engine
            .search("answer_token", &["root-wrong".to_string()], 10)
            .unwrap();
        assert!(hits.is_empty());
        let hits = engine
            .search("answer_token", &["root-a".to_string()], 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
    }
}
