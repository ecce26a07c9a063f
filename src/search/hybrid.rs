// Hybrid search pipeline.
//
// Query flow: normalize → intent guard → (regex path | hybrid path).
// The hybrid path layers symbol-name matches (seed score 1000) over
// full-text hits from the active engine, merges by path (+1200 on
// intersection), applies the adapter boosts (filename, definition
// patterns, proximity, repo metadata, recency, enclosing symbol), and
// sorts with the deterministic `(-score, -mtime, path)` tie-break.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use rusqlite::params_from_iter;
use tracing::debug;

use crate::cjk;
use crate::database::SearchDatabase;
use crate::database::types::RepoMetaRecord;
use crate::engine::{EngineError, EngineMode, SearchEngineOps};

use super::ranking::{
    calculate_recency_score, count_matches, definition_patterns, extract_terms, fts_quote_terms,
    get_file_extension, glob_to_like, snippet_around,
};
use super::{SearchHit, SearchMeta, SearchOptions, TotalMode};

/// Symbol-layer seed score.
const SYMBOL_SEED_SCORE: f64 = 1000.0;
/// Bonus when a symbol hit lands on a path the FTS layer also matched.
const SYMBOL_INTERSECTION_BONUS: f64 = 1200.0;
/// Bonus for resolving an enclosing context symbol.
const CONTEXT_SYMBOL_BONUS: f64 = 0.2;
/// Row cap for the regex scan.
const REGEX_SCAN_LIMIT: usize = 5000;

static SQL_KEYWORD_GUARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(select|insert|update|delete|drop|union|exec|alter)\b\s")
        .expect("sql keyword guard pattern")
});

static SNIPPET_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"L(\d+):").expect("snippet line pattern"));

/// A candidate row before boosting: content still raw.
struct RowCandidate {
    path: String,
    repo: String,
    mtime: i64,
    size: i64,
    score: f64,
    content: String,
}

pub struct SearchService {
    db: Arc<SearchDatabase>,
    engine: Arc<dyn SearchEngineOps>,
    mode: EngineMode,
    auto_install: bool,
}

impl SearchService {
    pub fn new(
        db: Arc<SearchDatabase>,
        engine: Arc<dyn SearchEngineOps>,
        mode: EngineMode,
        auto_install: bool,
    ) -> Self {
        Self {
            db,
            engine,
            mode,
            auto_install,
        }
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngineOps> {
        &self.engine
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// The full search pipeline.
    pub fn search_v2(&self, opts: &SearchOptions) -> Result<(Vec<SearchHit>, SearchMeta)> {
        let mut meta = SearchMeta {
            total_mode: match opts.total_mode {
                TotalMode::Exact => "exact".to_string(),
                TotalMode::Approx => "approx".to_string(),
            },
            ..Default::default()
        };

        let query = cjk::normalize_engine_text(&opts.query);
        if query.is_empty() {
            return Ok((Vec::new(), meta));
        }
        meta.intent = Some(infer_intent(&query));

        let terms = extract_terms(&query);

        if opts.use_regex {
            return self.search_regex(opts, &terms, meta);
        }

        // 1. Symbol priority layer (skipped under approx totals).
        let mut symbol_hits: Vec<SearchHit> = Vec::new();
        if opts.total_mode != TotalMode::Approx {
            let rows =
                self.db
                    .search_symbols(&query, opts.repo.as_deref(), 50, &opts.root_ids)?;
            for row in rows {
                if !matches_file_types(&row.path, &opts.file_types)
                    || !matches_path_pattern(&row.path, opts.path_pattern.as_deref())
                    || matches_exclude_patterns(&row.path, &opts.exclude_patterns)
                {
                    continue;
                }
                let mut hit = SearchHit {
                    repo: row.repo,
                    path: row.path.clone(),
                    score: SYMBOL_SEED_SCORE,
                    snippet: row.snippet,
                    mtime: row.mtime,
                    size: row.size,
                    match_count: 1,
                    file_type: get_file_extension(&row.path),
                    hit_reason: format!("Symbol: {} {}", row.kind, row.name),
                    context_symbol: format!("{}: {}", row.kind, row.name),
                    docstring: row.docstring,
                    metadata: row.metadata,
                };
                if opts.recency_boost {
                    hit.score = calculate_recency_score(hit.mtime, hit.score);
                }
                symbol_hits.push(hit);
            }
        }

        // 2. Full-text layer with LIKE fallback.
        let is_ascii = query.is_ascii();
        let fts_eligible = query.len() >= 3 && is_ascii && self.fts_available();
        let mut fts_hits: Vec<SearchHit> = Vec::new();
        let mut fts_success = false;

        if fts_eligible {
            match self.search_fts(opts, &query, &terms, &mut meta) {
                Ok(hits) => {
                    fts_hits = hits;
                    fts_success = true;
                }
                Err(FtsFailure::Engine(engine_err)) => return Err(engine_err.into()),
                Err(FtsFailure::Recoverable(e)) => {
                    debug!("FTS layer failed, falling back to LIKE: {}", e);
                }
            }
        }
        if !fts_success || (fts_hits.is_empty() && !terms.is_empty()) {
            let prefer_path_only =
                (!is_ascii || query.len() < 3) && opts.total_mode != TotalMode::Exact;
            fts_hits = self.search_like(opts, &query, &terms, &mut meta, prefer_path_only)?;
            meta.fallback_used = true;
        }

        // 3. Merge by path: symbol hits on FTS paths stack their evidence.
        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for hit in fts_hits {
            order.push(hit.path.clone());
            merged.insert(hit.path.clone(), hit);
        }
        for sh in symbol_hits {
            match merged.get_mut(&sh.path) {
                Some(existing) => {
                    existing.score += SYMBOL_INTERSECTION_BONUS;
                    existing.hit_reason =
                        format!("{}, {}", sh.hit_reason, existing.hit_reason);
                    if !existing.snippet.contains(sh.snippet.trim()) {
                        existing.snippet =
                            format!("{}\n...\n{}", sh.snippet, existing.snippet);
                    }
                    if !sh.docstring.is_empty() {
                        existing.docstring = sh.docstring;
                    }
                    if !sh.metadata.is_empty() && sh.metadata != "{}" {
                        existing.metadata = sh.metadata;
                    }
                }
                None => {
                    order.push(sh.path.clone());
                    merged.insert(sh.path.clone(), sh);
                }
            }
        }

        let mut final_hits: Vec<SearchHit> = order
            .into_iter()
            .filter_map(|path| merged.remove(&path))
            .collect();
        sort_hits(&mut final_hits);

        // 4. Totals, then the pagination slice.
        if opts.total_mode == TotalMode::Approx {
            meta.total = -1;
        } else if meta.total > 0 {
            meta.total = meta.total.max(final_hits.len() as i64);
        } else {
            meta.total = final_hits.len() as i64;
        }

        let start = opts.offset.min(final_hits.len());
        let end = (opts.offset + opts.limit).min(final_hits.len());
        Ok((final_hits[start..end].to_vec(), meta))
    }

    /// Repos ranked by hit count for a query, with one evidence snippet.
    pub fn repo_candidates(
        &self,
        query: &str,
        limit: usize,
        root_ids: &[String],
    ) -> Result<Vec<(String, i64, String)>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, 5);
        let (hits, _) = self.search_v2(&SearchOptions {
            query: query.to_string(),
            limit: 50,
            root_ids: root_ids.to_vec(),
            ..Default::default()
        })?;
        let mut counts: HashMap<String, (i64, String)> = HashMap::new();
        for hit in hits {
            let entry = counts.entry(hit.repo.clone()).or_insert((0, String::new()));
            entry.0 += 1;
            if entry.1.is_empty() {
                entry.1 = hit.snippet.replace('\n', " ").chars().take(200).collect();
            }
        }
        let mut out: Vec<(String, i64, String)> = counts
            .into_iter()
            .map(|(repo, (count, evidence))| (repo, count, evidence))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out.truncate(limit);
        Ok(out)
    }

    fn fts_available(&self) -> bool {
        match self.mode {
            EngineMode::Sqlite => self.db.fts_enabled(),
            EngineMode::Embedded => true,
        }
    }

    fn search_fts(
        &self,
        opts: &SearchOptions,
        query: &str,
        terms: &[String],
        meta: &mut SearchMeta,
    ) -> std::result::Result<Vec<SearchHit>, FtsFailure> {
        match self.mode {
            EngineMode::Sqlite => self
                .search_fts_sqlite(opts, terms, meta)
                .map_err(FtsFailure::Recoverable),
            EngineMode::Embedded => {
                let result = self.engine.search(query, &opts.root_ids, 50);
                let hits = match result {
                    Ok(hits) => hits,
                    Err(EngineError::NotInstalled(_)) if self.auto_install => {
                        self.engine
                            .install()
                            .map_err(|e| FtsFailure::Engine(EngineError::Unavailable(e.to_string())))?;
                        self.engine
                            .search(query, &opts.root_ids, 50)
                            .map_err(FtsFailure::Engine)?
                    }
                    Err(e) => return Err(FtsFailure::Engine(e)),
                };
                meta.total_scanned += hits.len();
                if opts.total_mode == TotalMode::Approx {
                    meta.total = -1;
                }
                let candidates: Vec<RowCandidate> = hits
                    .into_iter()
                    .map(|h| {
                        let content =
                            self.db.read_file(&h.path).ok().flatten().unwrap_or_default();
                        RowCandidate {
                            path: h.path,
                            repo: h.repo,
                            mtime: h.mtime,
                            size: h.size,
                            score: h.score,
                            content,
                        }
                    })
                    .collect();
                self.process_rows(candidates, opts, terms)
                    .map_err(FtsFailure::Recoverable)
            }
        }
    }

    /// FTS5 MATCH with priors computed in SQL, then the adapter boosts.
    fn search_fts_sqlite(
        &self,
        opts: &SearchOptions,
        terms: &[String],
        meta: &mut SearchMeta,
    ) -> Result<Vec<SearchHit>> {
        let match_expr = fts_quote_terms(terms);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let (filter_clauses, filter_params) = build_filter_clauses(opts);
        let mut where_clauses = vec!["files_fts MATCH ?".to_string()];
        let mut params: Vec<String> = vec![match_expr];
        where_clauses.extend(filter_clauses);
        params.extend(filter_params);
        let where_sql = where_clauses.join(" AND ");

        let conn = self.db.read();
        if opts.total_mode == TotalMode::Exact {
            let count_sql = format!(
                "SELECT COUNT(*) FROM files_fts JOIN files f ON f.rowid = files_fts.rowid
                 WHERE {where_sql}"
            );
            meta.total = conn.query_row(&count_sql, params_from_iter(params.iter()), |row| {
                row.get(0)
            })?;
        } else {
            meta.total = -1;
        }

        let path_prior = "CASE
            WHEN f.path LIKE 'src/%' OR f.path LIKE '%/src/%' OR f.path LIKE 'app/%' OR f.path LIKE '%/app/%' OR f.path LIKE 'core/%' OR f.path LIKE '%/core/%' THEN 0.6
            WHEN f.path LIKE 'config/%' OR f.path LIKE '%/config/%' OR f.path LIKE 'domain/%' OR f.path LIKE '%/domain/%' OR f.path LIKE 'service/%' OR f.path LIKE '%/service/%' THEN 0.4
            WHEN f.path LIKE 'test/%' OR f.path LIKE '%/test/%' OR f.path LIKE 'tests/%' OR f.path LIKE '%/tests/%' OR f.path LIKE 'example/%' OR f.path LIKE '%/example/%' OR f.path LIKE 'dist/%' OR f.path LIKE '%/dist/%' OR f.path LIKE 'build/%' OR f.path LIKE '%/build/%' THEN -0.7
            ELSE 0.0 END";
        let filetype_prior = "CASE
            WHEN f.path LIKE '%.py' OR f.path LIKE '%.ts' OR f.path LIKE '%.go' OR f.path LIKE '%.java' OR f.path LIKE '%.kt' THEN 0.3
            WHEN f.path LIKE '%.yaml' OR f.path LIKE '%.yml' OR f.path LIKE '%.json' THEN 0.15
            WHEN f.path LIKE '%.lock' OR f.path LIKE '%.min.js' OR f.path LIKE '%.map' THEN -0.8
            ELSE 0.0 END";

        let sql = format!(
            "SELECT f.path, f.repo, f.mtime, f.size,
                    (-1.0 * bm25(files_fts) + {path_prior} + {filetype_prior}) AS score,
                    fv.content AS content
             FROM files_fts
             JOIN files f ON f.rowid = files_fts.rowid
             JOIN files_view fv ON fv.rowid = f.rowid
             WHERE {where_sql}
             ORDER BY score DESC
             LIMIT 50"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(RowCandidate {
                path: row.get(0)?,
                repo: row.get(1)?,
                mtime: row.get(2)?,
                size: row.get(3)?,
                score: row.get(4)?,
                content: row.get(5)?,
            })
        })?;
        let candidates: Vec<RowCandidate> = rows.collect::<std::result::Result<_, _>>()?;
        meta.total_scanned += candidates.len();
        drop(stmt);
        drop(conn);
        self.process_rows(candidates, opts, terms)
    }

    /// LIKE fallback: a fast pass over path/repo, then (for exact counts
    /// or lean results) a slow pass joining the decompressing view.
    fn search_like(
        &self,
        opts: &SearchOptions,
        query: &str,
        terms: &[String],
        meta: &mut SearchMeta,
        prefer_path_only: bool,
    ) -> Result<Vec<SearchHit>> {
        let like_q = escape_like(query);
        let (filter_clauses, filter_params) = build_filter_clauses(opts);
        let fetch_limit = ((opts.offset + opts.limit) * 2).max(100);
        let order_sql = if opts.recency_boost {
            "f.mtime DESC, f.path ASC"
        } else {
            "f.path ASC"
        };

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        if prefer_path_only {
            let mut where_clauses =
                vec!["(f.path LIKE ? ESCAPE '^' OR f.repo LIKE ? ESCAPE '^')".to_string()];
            let mut params = vec![format!("%{like_q}%"), format!("%{like_q}%")];
            where_clauses.extend(filter_clauses.clone());
            params.extend(filter_params.clone());
            let sql = format!(
                "SELECT f.path, f.repo, f.mtime, f.size, 1.0 AS score, f.path AS content
                 FROM files f WHERE {} ORDER BY {order_sql} LIMIT {fetch_limit}",
                where_clauses.join(" AND ")
            );
            let conn = self.db.read();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                Ok(RowCandidate {
                    path: row.get(0)?,
                    repo: row.get(1)?,
                    mtime: row.get(2)?,
                    size: row.get(3)?,
                    score: row.get(4)?,
                    content: row.get(5)?,
                })
            })?;
            let candidates: Vec<RowCandidate> = rows.collect::<std::result::Result<_, _>>()?;
            meta.total_scanned += candidates.len();
            drop(stmt);
            drop(conn);
            for hit in self.process_rows(candidates, opts, terms)? {
                seen.insert(hit.path.clone());
                hits.push(hit);
            }
            if opts.total_mode != TotalMode::Exact {
                meta.total = -1;
            }
        }

        let need_full = opts.total_mode == TotalMode::Exact || hits.len() < fetch_limit;
        if !prefer_path_only || need_full {
            let mut where_clauses = vec![
                "(fv.content LIKE ? ESCAPE '^' OR f.path LIKE ? ESCAPE '^' OR f.repo LIKE ? ESCAPE '^')"
                    .to_string(),
            ];
            let mut params = vec![
                format!("%{like_q}%"),
                format!("%{like_q}%"),
                format!("%{like_q}%"),
            ];
            where_clauses.extend(filter_clauses);
            params.extend(filter_params);
            let where_sql = where_clauses.join(" AND ");

            let conn = self.db.read();
            if opts.total_mode == TotalMode::Exact {
                let count_sql = format!(
                    "SELECT COUNT(*) FROM files f JOIN files_view fv ON f.rowid = fv.rowid
                     WHERE {where_sql}"
                );
                meta.total =
                    conn.query_row(&count_sql, params_from_iter(params.iter()), |row| {
                        row.get(0)
                    })?;
            } else {
                meta.total = -1;
            }
            let sql = format!(
                "SELECT f.path, f.repo, f.mtime, f.size, 1.0 AS score, fv.content AS content
                 FROM files f JOIN files_view fv ON f.rowid = fv.rowid
                 WHERE {where_sql} ORDER BY {order_sql} LIMIT {fetch_limit}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                Ok(RowCandidate {
                    path: row.get(0)?,
                    repo: row.get(1)?,
                    mtime: row.get(2)?,
                    size: row.get(3)?,
                    score: row.get(4)?,
                    content: row.get(5)?,
                })
            })?;
            let candidates: Vec<RowCandidate> = rows.collect::<std::result::Result<_, _>>()?;
            meta.total_scanned += candidates.len();
            drop(stmt);
            drop(conn);
            for hit in self.process_rows(candidates, opts, terms)? {
                if seen.insert(hit.path.clone()) {
                    hits.push(hit);
                }
            }
        }
        Ok(hits)
    }

    /// Regex scan path: compiled once, capped fetch, ranked by match
    /// count (+recency). Invalid patterns report a structured error in
    /// the metadata.
    fn search_regex(
        &self,
        opts: &SearchOptions,
        _terms: &[String],
        mut meta: SearchMeta,
    ) -> Result<(Vec<SearchHit>, SearchMeta)> {
        meta.regex_mode = true;
        let pattern = if opts.case_sensitive {
            Regex::new(&opts.query)
        } else {
            Regex::new(&format!("(?i){}", opts.query))
        };
        let pattern = match pattern {
            Ok(p) => p,
            Err(e) => {
                meta.regex_error = Some(e.to_string());
                return Ok((Vec::new(), meta));
            }
        };

        let (filter_clauses, filter_params) = build_filter_clauses(opts);
        let mut where_clauses = vec!["1=1".to_string()];
        let mut params: Vec<String> = Vec::new();
        if let Some(repo) = &opts.repo {
            where_clauses.push("f.repo = ?".to_string());
            params.push(repo.clone());
        }
        where_clauses.extend(filter_clauses);
        params.extend(filter_params);
        let order_sql = if opts.recency_boost {
            "f.mtime DESC"
        } else {
            "f.path"
        };
        let sql = format!(
            "SELECT f.path, f.repo, f.mtime, f.size, fv.content
             FROM files f JOIN files_view fv ON f.rowid = fv.rowid
             WHERE {} ORDER BY {order_sql} LIMIT {REGEX_SCAN_LIMIT}",
            where_clauses.join(" AND ")
        );

        let conn = self.db.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut scanned = 0usize;
        for row in rows {
            let (path, repo, mtime, size, content) = row?;
            scanned += 1;
            if !matches_file_types(&path, &opts.file_types)
                || !matches_path_pattern(&path, opts.path_pattern.as_deref())
                || matches_exclude_patterns(&path, &opts.exclude_patterns)
            {
                continue;
            }
            let match_count = pattern.find_iter(&content).count();
            if match_count == 0 {
                continue;
            }
            let mut score = match_count as f64;
            if opts.recency_boost {
                score = calculate_recency_score(mtime, score);
            }
            let snippet =
                snippet_around(&content, &[opts.query.clone()], opts.snippet_lines);
            hits.push(SearchHit {
                repo,
                file_type: get_file_extension(&path),
                path,
                score,
                snippet,
                mtime,
                size,
                match_count,
                hit_reason: "Regex match".to_string(),
                ..Default::default()
            });
        }
        meta.total_scanned += scanned;
        sort_hits(&mut hits);
        meta.total = hits.len() as i64;
        meta.total_mode = "approx".to_string();

        let start = opts.offset.min(hits.len());
        let end = (opts.offset + opts.limit).min(hits.len());
        Ok((hits[start..end].to_vec(), meta))
    }

    /// Adapter boosts over raw candidates, snippet synthesis, and the
    /// enclosing-symbol lookup.
    fn process_rows(
        &self,
        rows: Vec<RowCandidate>,
        opts: &SearchOptions,
        terms: &[String],
    ) -> Result<Vec<SearchHit>> {
        let repo_meta = self.db.get_all_repo_meta().unwrap_or_default();
        let query_lower = opts.query.to_lowercase();
        let def_patterns = definition_patterns(terms);
        let query_terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();

        let mut hits: Vec<SearchHit> = Vec::new();
        for row in rows {
            if !matches_file_types(&row.path, &opts.file_types)
                || !matches_path_pattern(&row.path, opts.path_pattern.as_deref())
                || matches_exclude_patterns(&row.path, &opts.exclude_patterns)
            {
                continue;
            }

            let mut score = row.score;
            let mut reasons: Vec<String> = Vec::new();
            let path_lower = row.path.to_lowercase();
            let filename = path_lower.rsplit('/').next().unwrap_or(&path_lower);
            let file_stem = filename.rsplit_once('.').map(|x| x.0).unwrap_or(filename);

            if filename == query_lower || file_stem == query_lower {
                score += 2.0;
                reasons.push("Exact filename match".to_string());
            } else if file_stem.contains(&query_lower) {
                score += 1.2;
                reasons.push("Filename stem match".to_string());
            } else if path_lower.ends_with(&query_lower) {
                score += 1.0;
                reasons.push("Path suffix match".to_string());
            }

            for pattern in &def_patterns {
                if pattern.is_match(&row.content) {
                    score += 1.5;
                    reasons.push("Definition found".to_string());
                    break;
                }
            }

            if query_terms.len() > 1 {
                let content_lower = row.content.to_lowercase();
                let mut indices = Vec::new();
                let mut all_found = true;
                for term in &query_terms {
                    match content_lower.find(term.as_str()) {
                        Some(idx) => indices.push(idx),
                        None => {
                            all_found = false;
                            break;
                        }
                    }
                }
                if all_found {
                    let span = indices.iter().max().unwrap() - indices.iter().min().unwrap();
                    if span < 100 {
                        score += 0.5;
                        reasons.push("Proximity boost".to_string());
                    }
                }
            }

            if let Some(meta) = repo_meta.get(&row.repo) {
                apply_repo_meta_boost(meta, &query_terms, &mut score, &mut reasons);
            }

            if [".codex/", "agents.md", "gemini.md", "readme.md"]
                .iter()
                .any(|p| path_lower.contains(p))
            {
                score += 0.2;
                reasons.push("Core file".to_string());
            }

            if opts.recency_boost {
                score = calculate_recency_score(row.mtime, score);
            }

            let match_count = count_matches(&row.content, &opts.query, opts.case_sensitive);
            if opts.case_sensitive && match_count == 0 {
                continue;
            }

            let snippet = snippet_around(&row.content, terms, opts.snippet_lines);
            let mut context_symbol = String::new();
            if let Some(caps) = SNIPPET_LINE.captures(&snippet) {
                if let Ok(line_no) = caps[1].parse::<i64>() {
                    if let Some(ctx) = self.db.enclosing_symbol(&row.path, line_no) {
                        context_symbol = ctx;
                        score += CONTEXT_SYMBOL_BONUS;
                    }
                }
            }

            hits.push(SearchHit {
                repo: row.repo,
                file_type: get_file_extension(&row.path),
                path: row.path,
                score: (score * 1000.0).round() / 1000.0,
                snippet,
                mtime: row.mtime,
                size: row.size,
                match_count,
                hit_reason: if reasons.is_empty() {
                    "Content match".to_string()
                } else {
                    reasons.join(", ")
                },
                context_symbol,
                ..Default::default()
            });
        }
        sort_hits(&mut hits);
        Ok(hits)
    }
}

enum FtsFailure {
    /// Engine lifecycle faults surface to the caller as structured errors.
    Engine(EngineError),
    /// Anything else falls back to the LIKE path.
    Recoverable(anyhow::Error),
}

fn apply_repo_meta_boost(
    meta: &RepoMetaRecord,
    query_terms: &[String],
    score: &mut f64,
    reasons: &mut Vec<String>,
) {
    if meta.priority > 0 {
        *score += meta.priority as f64;
        reasons.push("High priority".to_string());
    }
    let tags: Vec<String> = meta
        .tags
        .to_lowercase()
        .split(',')
        .map(|t| t.trim().to_string())
        .collect();
    let domain = meta.domain.to_lowercase();
    for term in query_terms {
        if tags.iter().any(|t| t == term) || *term == domain {
            *score += 0.5;
            reasons.push(format!("Tag match ({term})"));
            break;
        }
    }
}

/// Deterministic order: score desc, mtime desc, path asc.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.mtime.cmp(&a.mtime))
            .then(a.path.cmp(&b.path))
    });
}

/// Query intent classification. A SQL-keyword guard disables API
/// inference so injection-looking input is treated as literal code text.
pub fn infer_intent(query: &str) -> String {
    if SQL_KEYWORD_GUARD.is_match(query) {
        return "code".to_string();
    }
    let trimmed = query.trim();
    let api_verbs = ["get ", "post ", "put ", "patch ", "delete "];
    if trimmed.contains('/')
        && (api_verbs.iter().any(|v| trimmed.to_lowercase().starts_with(v))
            || trimmed.contains("/api/")
            || trimmed.starts_with("api/"))
    {
        return "api".to_string();
    }
    let single_token = !trimmed.contains(' ');
    if single_token
        && trimmed
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == ':')
    {
        return "symbol".to_string();
    }
    "code".to_string()
}

fn escape_like(text: &str) -> String {
    text.replace('^', "^^").replace('%', "^%").replace('_', "^_")
}

/// Shared WHERE fragments for roots/repo/file-type/path-pattern filters.
/// Legacy rows without a `root-*/` prefix are exempt from root scoping.
fn build_filter_clauses(opts: &SearchOptions) -> (Vec<String>, Vec<String>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if !opts.root_ids.is_empty() {
        let mut root_clauses: Vec<String> = Vec::new();
        for root_id in &opts.root_ids {
            root_clauses.push("f.path LIKE ?".to_string());
            params.push(format!("{root_id}/%"));
        }
        root_clauses.push("f.path NOT LIKE 'root-%/%'".to_string());
        clauses.push(format!("({})", root_clauses.join(" OR ")));
    }
    if let Some(repo) = &opts.repo {
        clauses.push("f.repo = ?".to_string());
        params.push(repo.clone());
    }
    if !opts.file_types.is_empty() {
        let mut type_clauses = Vec::new();
        for ft in &opts.file_types {
            type_clauses.push("f.path LIKE ?".to_string());
            params.push(format!("%.{}", ft.to_lowercase().trim_start_matches('.')));
        }
        clauses.push(format!("({})", type_clauses.join(" OR ")));
    }
    if let Some(pattern) = &opts.path_pattern {
        let rel_pattern = normalize_rel_pattern(pattern);
        let like_pattern = glob_to_like(&rel_pattern);
        clauses.push("(f.path LIKE ? OR f.path LIKE ?)".to_string());
        params.push(format!("root-%/{like_pattern}"));
        params.push(like_pattern);
    }
    (clauses, params)
}

fn matches_file_types(path: &str, file_types: &[String]) -> bool {
    if file_types.is_empty() {
        return true;
    }
    let ext = get_file_extension(path);
    file_types
        .iter()
        .any(|ft| ft.to_lowercase().trim_start_matches('.') == ext)
}

/// Stored key → rel path (strips the `root-*/` prefix).
fn rel_path(path: &str) -> &str {
    match path.strip_prefix("root-") {
        Some(rest) => rest.split_once('/').map(|x| x.1).unwrap_or(path),
        None => path.trim_start_matches('/'),
    }
}

fn normalize_rel_pattern(pattern: &str) -> String {
    let mut pat = pattern.replace('\\', "/");
    if pat.starts_with("root-") {
        if let Some((_, rest)) = pat.split_once('/') {
            pat = rest.to_string();
        }
    }
    pat.trim_start_matches('/').to_string()
}

fn fnmatch(pattern: &str, text: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| {
            p.matches_with(
                text,
                glob::MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            )
        })
        .unwrap_or(false)
}

fn matches_path_pattern(path: &str, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else { return true };
    let path = rel_path(&path.replace('\\', "/")).to_string();
    let pattern = normalize_rel_pattern(pattern);

    if path == pattern || path.ends_with(&format!("/{pattern}")) {
        return true;
    }
    fnmatch(&pattern, &path)
        || fnmatch(&format!("*/{pattern}"), &path)
        || fnmatch(&format!("*/{pattern}/*"), &path)
        || fnmatch(&format!("{pattern}*"), &path)
}

fn matches_exclude_patterns(path: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let rel = rel_path(&path.replace('\\', "/")).to_string();
    patterns.iter().any(|p| {
        let pat = normalize_rel_pattern(p);
        rel.contains(&pat) || fnmatch(&format!("*{pat}*"), &rel)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::types::FileRecord;
    use crate::database::types::SymbolRecord;
    use crate::engine::sqlite::SqliteEngine;

    fn service() -> SearchService {
        let db = Arc::new(SearchDatabase::in_memory().unwrap());
        let engine: Arc<dyn SearchEngineOps> = Arc::new(SqliteEngine::new(db.clone()));
        SearchService::new(db, engine, EngineMode::Sqlite, false)
    }

    fn file(path: &str, content: &str, mtime: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            repo: "demo".to_string(),
            mtime,
            size: content.len() as i64,
            content: content.to_string(),
            parse_status: "ok".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn symbol_hits_rank_above_content_hits() {
        let svc = service();
        svc.db
            .upsert_files(&[
                file("root-1/a.py", "def find_me(): pass", 100),
                file("root-1/b.py", "something else mentioning find_me", 200),
            ])
            .unwrap();
        svc.db
            .upsert_symbols(&[SymbolRecord {
                path: "root-1/a.py".to_string(),
                name: "find_me".to_string(),
                qualname: "find_me".to_string(),
                kind: "function".to_string(),
                line: 1,
                end_line: 1,
                ..Default::default()
            }])
            .unwrap();

        let (hits, _) = svc
            .search_v2(&SearchOptions::with_query("find_me"))
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].path, "root-1/a.py");
        assert!(hits[0].hit_reason.starts_with("Symbol:"));
    }

    #[test]
    fn file_type_filter_selects_only_matching_extension() {
        let svc = service();
        svc.db
            .upsert_files(&[
                file("root-1/app.py", "print(1)", 100),
                file("root-1/styles.css", "body { margin: 1 }", 100),
            ])
            .unwrap();
        let (hits, _) = svc
            .search_v2(&SearchOptions {
                query: "1".to_string(),
                file_types: vec!["py".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].path.ends_with(".py"));
    }

    #[test]
    fn root_scope_enforcement() {
        let svc = service();
        svc.db
            .upsert_files(&[file("root-1/doc.md", "Documentation body here", 100)])
            .unwrap();

        let (hits, _) = svc
            .search_v2(&SearchOptions {
                query: "Documentation".to_string(),
                root_ids: vec!["root-wrong".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert!(hits.is_empty());

        let (hits, _) = svc
            .search_v2(&SearchOptions {
                query: "Documentation".to_string(),
                root_ids: vec!["root-1".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn legacy_paths_are_exempt_from_root_scope() {
        let svc = service();
        svc.db
            .upsert_files(&[file("legacy/doc.md", "legacy body text", 100)])
            .unwrap();
        let (hits, _) = svc
            .search_v2(&SearchOptions {
                query: "legacy body".to_string(),
                root_ids: vec!["root-1".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn results_are_deterministic() {
        let svc = service();
        svc.db
            .upsert_files(&[
                file("root-1/x.py", "shared token body", 100),
                file("root-1/y.py", "shared token body", 100),
                file("root-1/z.py", "shared token body", 100),
            ])
            .unwrap();
        let opts = SearchOptions::with_query("shared token");
        let (first, _) = svc.search_v2(&opts).unwrap();
        for _ in 0..3 {
            let (again, _) = svc.search_v2(&opts).unwrap();
            let a: Vec<&str> = first.iter().map(|h| h.path.as_str()).collect();
            let b: Vec<&str> = again.iter().map(|h| h.path.as_str()).collect();
            assert_eq!(a, b);
        }
        // Identical scores and mtimes: path ascending breaks the tie.
        let paths: Vec<&str> = first.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["root-1/x.py", "root-1/y.py", "root-1/z.py"]);
    }

    #[test]
    fn regex_mode_ranks_by_match_count() {
        let svc = service();
        svc.db
            .upsert_files(&[
                file("root-1/many.py", "alpha alpha alpha", 100),
                file("root-1/one.py", "alpha beta", 100),
            ])
            .unwrap();
        let (hits, meta) = svc
            .search_v2(&SearchOptions {
                query: "alph[a]".to_string(),
                use_regex: true,
                ..Default::default()
            })
            .unwrap();
        assert!(meta.regex_mode);
        assert_eq!(hits[0].path, "root-1/many.py");
        assert_eq!(hits[0].match_count, 3);
    }

    #[test]
    fn invalid_regex_reports_structured_error() {
        let svc = service();
        let (hits, meta) = svc
            .search_v2(&SearchOptions {
                query: "([unclosed".to_string(),
                use_regex: true,
                ..Default::default()
            })
            .unwrap();
        assert!(hits.is_empty());
        assert!(meta.regex_error.is_some());
    }

    #[test]
    fn approx_total_is_minus_one_and_skips_symbols() {
        let svc = service();
        svc.db
            .upsert_files(&[file("root-1/a.py", "token body", 100)])
            .unwrap();
        let (_, meta) = svc
            .search_v2(&SearchOptions {
                query: "token".to_string(),
                total_mode: TotalMode::Approx,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(meta.total, -1);
    }

    #[test]
    fn pagination_slices_deterministically() {
        let svc = service();
        let rows: Vec<FileRecord> = (0..6)
            .map(|i| file(&format!("root-1/f{i}.py"), "paged token", 100))
            .collect();
        svc.db.upsert_files(&rows).unwrap();
        let (page1, _) = svc
            .search_v2(&SearchOptions {
                query: "paged".to_string(),
                limit: 2,
                offset: 0,
                ..Default::default()
            })
            .unwrap();
        let (page2, _) = svc
            .search_v2(&SearchOptions {
                query: "paged".to_string(),
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].path, page2[0].path);
    }

    #[test]
    fn intent_classification() {
        assert_eq!(infer_intent("get /api/users"), "api");
        assert_eq!(infer_intent("UserService"), "symbol");
        assert_eq!(infer_intent("how does auth work"), "code");
        // SQL guard disables API inference.
        assert_eq!(infer_intent("select * from /api/users"), "code");
    }

    #[test]
    fn sql_short_and_unicode_queries_fall_back_to_like() {
        let svc = service();
        svc.db
            .upsert_files(&[file("root-1/kr.md", "한국어 형태소 내용", 100)])
            .unwrap();
        let (hits, meta) = svc
            .search_v2(&SearchOptions::with_query("형태소"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(meta.fallback_used);
    }

    #[test]
    fn context_symbol_comes_from_enclosing_definition() {
        let svc = service();
        let body = "def outer():\n    x = 1\n    needle_here = 2\n";
        svc.db.upsert_files(&[file("root-1/ctx.py", body, 100)]).unwrap();
        svc.db
            .upsert_symbols(&[SymbolRecord {
                path: "root-1/ctx.py".to_string(),
                name: "outer".to_string(),
                qualname: "outer".to_string(),
                kind: "function".to_string(),
                line: 1,
                end_line: 3,
                ..Default::default()
            }])
            .unwrap();
        let (hits, _) = svc
            .search_v2(&SearchOptions::with_query("needle_here"))
            .unwrap();
        let content_hit = hits
            .iter()
            .find(|h| !h.hit_reason.starts_with("Symbol:"))
            .or(hits.first())
            .unwrap();
        assert_eq!(content_hit.context_symbol, "function: outer");
    }
}
