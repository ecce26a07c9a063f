// Symbol operations: upsert, lookup, enclosing-symbol resolution, fuzzy
// fallback, and fan-in statistics for the call-graph service.

use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{Connection, params, params_from_iter};

use super::types::SymbolRecord;
use super::SearchDatabase;

/// A symbol row joined with its file metadata, as returned by symbol
/// search.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SymbolHit {
    pub path: String,
    pub repo: String,
    pub name: String,
    pub qualname: String,
    pub kind: String,
    pub line: i64,
    pub end_line: i64,
    pub snippet: String,
    pub docstring: String,
    pub metadata: String,
    pub symbol_id: String,
    pub mtime: i64,
    pub size: i64,
}

/// Replace the symbol set for every path present in `symbols`
/// (delete-then-insert inside the caller's transaction).
pub fn upsert_symbols_tx(conn: &Connection, symbols: &[SymbolRecord]) -> Result<usize> {
    if symbols.is_empty() {
        return Ok(0);
    }
    let paths: std::collections::HashSet<&str> =
        symbols.iter().map(|s| s.path.as_str()).collect();
    let mut clear = conn.prepare_cached("DELETE FROM symbols WHERE path = ?1")?;
    for path in &paths {
        clear.execute(params![path])?;
    }
    drop(clear);

    let mut insert = conn.prepare_cached(
        "INSERT INTO symbols(symbol_id, path, root_id, name, qualname, kind,
                             line, end_line, content, parent_name, metadata, docstring)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
    )?;
    for s in symbols {
        let symbol_id = if s.symbol_id.is_empty() {
            SymbolRecord::compute_id(&s.path, &s.kind, &s.qualname)
        } else {
            s.symbol_id.clone()
        };
        insert.execute(params![
            symbol_id,
            s.path,
            s.root_id,
            s.name,
            s.qualname,
            s.kind,
            s.line,
            s.end_line,
            s.content,
            s.parent_name,
            s.metadata,
            s.docstring,
        ])?;
    }
    Ok(symbols.len())
}

impl SearchDatabase {
    pub fn upsert_symbols(&self, symbols: &[SymbolRecord]) -> Result<usize> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let count = upsert_symbols_tx(&tx, symbols)?;
        tx.commit()?;
        Ok(count)
    }

    /// LIKE search over symbol names, shortest names first so exact-ish
    /// matches surface ahead of long compounds.
    pub fn search_symbols(
        &self,
        query: &str,
        repo: Option<&str>,
        limit: usize,
        root_ids: &[String],
    ) -> Result<Vec<SymbolHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.min(100);

        let mut sql = String::from(
            "SELECT s.path, s.name, s.qualname, s.kind, s.line, s.end_line, s.content,
                    s.docstring, s.metadata, s.symbol_id, f.repo, f.mtime, f.size
             FROM symbols s JOIN files f ON s.path = f.path
             WHERE s.name LIKE ?",
        );
        let mut params: Vec<String> = vec![format!("%{query}%")];

        if !root_ids.is_empty() {
            let clauses = vec!["f.path LIKE ?"; root_ids.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses})"));
            params.extend(root_ids.iter().map(|r| format!("{r}/%")));
        }
        if let Some(repo) = repo {
            sql.push_str(" AND f.repo = ?");
            params.push(repo.to_string());
        }
        sql.push_str(&format!(
            " ORDER BY length(s.name) ASC, s.path ASC LIMIT {limit}"
        ));

        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(SymbolHit {
                path: row.get(0)?,
                name: row.get(1)?,
                qualname: row.get(2)?,
                kind: row.get(3)?,
                line: row.get(4)?,
                end_line: row.get(5)?,
                snippet: row.get(6)?,
                docstring: row.get(7)?,
                metadata: row.get(8)?,
                symbol_id: row.get(9)?,
                repo: row.get(10)?,
                mtime: row.get(11)?,
                size: row.get(12)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Resolve a symbol by stable id, else by qualname/name, optionally
    /// scoped by path, roots, and repo. Qualname matches sort first; at
    /// most 50 candidates are returned.
    pub fn resolve_symbol(
        &self,
        name: &str,
        path: Option<&str>,
        symbol_id: Option<&str>,
        root_ids: &[String],
        repo: Option<&str>,
    ) -> Result<Vec<SymbolHit>> {
        let mut params: Vec<String> = Vec::new();
        let mut sql = String::from(
            "SELECT path, name, qualname, kind, line, end_line, content,
                    docstring, metadata, symbol_id
             FROM symbols WHERE ",
        );
        if let Some(sid) = symbol_id {
            sql.push_str("symbol_id = ?");
            params.push(sid.to_string());
        } else {
            sql.push_str("(qualname = ? OR name = ?)");
            params.push(name.to_string());
            params.push(name.to_string());
        }
        if let Some(p) = path {
            sql.push_str(" AND path = ?");
            params.push(p.to_string());
        }
        if !root_ids.is_empty() {
            let clauses = vec!["path LIKE ?"; root_ids.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses})"));
            params.extend(root_ids.iter().map(|r| format!("{r}/%")));
        }
        if let Some(repo) = repo {
            sql.push_str(" AND path IN (SELECT path FROM files WHERE repo = ?)");
            params.push(repo.to_string());
        }
        sql.push_str(
            " ORDER BY CASE WHEN qualname = ? THEN 0 ELSE 1 END, path, line LIMIT 50",
        );
        params.push(name.to_string());

        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(SymbolHit {
                path: row.get(0)?,
                name: row.get(1)?,
                qualname: row.get(2)?,
                kind: row.get(3)?,
                line: row.get(4)?,
                end_line: row.get(5)?,
                snippet: row.get(6)?,
                docstring: row.get(7)?,
                metadata: row.get(8)?,
                symbol_id: row.get(9)?,
                ..Default::default()
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Fuzzy symbol lookup: Levenshtein distance ≤ 2 against `name`,
    /// ranked by (distance, name length, path). The candidate pool is
    /// narrowed in SQL by a loose prefix/length heuristic before scoring.
    pub fn fuzzy_search_symbols(
        &self,
        name: &str,
        limit: usize,
        root_ids: &[String],
    ) -> Result<Vec<SymbolHit>> {
        if name.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = String::from(
            "SELECT path, name, qualname, kind, line, end_line, content,
                    docstring, metadata, symbol_id
             FROM symbols WHERE length(name) BETWEEN ? AND ?",
        );
        let mut params: Vec<String> = vec![
            (name.len().saturating_sub(2)).to_string(),
            (name.len() + 2).to_string(),
        ];
        if !root_ids.is_empty() {
            let clauses = vec!["path LIKE ?"; root_ids.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses})"));
            params.extend(root_ids.iter().map(|r| format!("{r}/%")));
        }
        sql.push_str(" LIMIT 2000");

        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(SymbolHit {
                path: row.get(0)?,
                name: row.get(1)?,
                qualname: row.get(2)?,
                kind: row.get(3)?,
                line: row.get(4)?,
                end_line: row.get(5)?,
                snippet: row.get(6)?,
                docstring: row.get(7)?,
                metadata: row.get(8)?,
                symbol_id: row.get(9)?,
                ..Default::default()
            })
        })?;

        let mut scored: Vec<(usize, SymbolHit)> = Vec::new();
        for row in rows {
            let hit = row?;
            let dist = strsim::levenshtein(&hit.name, name);
            if dist <= 2 {
                scored.push((dist, hit));
            }
        }
        scored.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.name.len().cmp(&b.1.name.len()))
                .then(a.1.path.cmp(&b.1.path))
        });
        Ok(scored.into_iter().take(limit).map(|(_, h)| h).collect())
    }

    /// Nearest symbol declared at or above `line`. Overlapping ranges
    /// resolve to the nearest-preceding `line`, ties broken by `end_line`
    /// descending.
    pub fn enclosing_symbol(&self, path: &str, line: i64) -> Option<String> {
        let conn = self.read();
        conn.query_row(
            "SELECT kind, name FROM symbols
             WHERE path = ?1 AND line <= ?2
             ORDER BY line DESC, end_line DESC LIMIT 1",
            params![path, line],
            |row| {
                Ok(format!(
                    "{}: {}",
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?
                ))
            },
        )
        .ok()
    }

    /// True when a symbol with this exact name exists.
    pub fn is_exact_symbol(&self, name: &str) -> bool {
        let conn = self.read();
        conn.query_row(
            "SELECT 1 FROM symbols WHERE name = ?1 LIMIT 1",
            params![name],
            |_| Ok(()),
        )
        .is_ok()
    }

    /// Incoming-call counts per symbol name, for confidence scoring.
    pub fn symbol_fan_in(&self, names: &[String]) -> Result<HashMap<String, i64>> {
        let mut out = HashMap::new();
        if names.is_empty() {
            return Ok(out);
        }
        let placeholders = vec!["?"; names.len()].join(",");
        let sql = format!(
            "SELECT to_symbol, COUNT(1) FROM symbol_relations
             WHERE to_symbol IN ({placeholders}) GROUP BY to_symbol"
        );
        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(names.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (name, count) = row?;
            out.insert(name, count);
        }
        Ok(out)
    }

    /// Unique-name lookup used to enrich relation rows missing symbol ids;
    /// returns a hit only when exactly one symbol matches in scope.
    pub fn lookup_unique_symbol(
        &self,
        name: &str,
        path_prefix: Option<&str>,
    ) -> Option<(String, String)> {
        let conn = self.read();
        let rows: Vec<(String, String)> = if let Some(prefix) = path_prefix {
            let mut stmt = conn
                .prepare("SELECT path, symbol_id FROM symbols WHERE name = ?1 AND path LIKE ?2 LIMIT 5")
                .ok()?;
            let mapped = stmt
                .query_map(params![name, format!("{prefix}%")], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .ok()?;
            mapped.filter_map(|r| r.ok()).collect()
        } else {
            let mut stmt = conn
                .prepare("SELECT path, symbol_id FROM symbols WHERE name = ?1 LIMIT 5")
                .ok()?;
            let mapped = stmt
                .query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))
                .ok()?;
            mapped.filter_map(|r| r.ok()).collect()
        };
        if rows.len() == 1 {
            rows.into_iter().next()
        } else {
            None
        }
    }

    pub fn count_symbols(&self) -> Result<i64> {
        let conn = self.read();
        Ok(conn.query_row("SELECT COUNT(1) FROM symbols", [], |row| row.get(0))?)
    }

    /// All symbols for a path, line order.
    pub fn list_symbols(&self, path: &str) -> Result<Vec<SymbolHit>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT path, name, qualname, kind, line, end_line, content,
                    docstring, metadata, symbol_id
             FROM symbols WHERE path = ?1 ORDER BY line ASC",
        )?;
        let rows = stmt.query_map(params![path], |row| {
            Ok(SymbolHit {
                path: row.get(0)?,
                name: row.get(1)?,
                qualname: row.get(2)?,
                kind: row.get(3)?,
                line: row.get(4)?,
                end_line: row.get(5)?,
                snippet: row.get(6)?,
                docstring: row.get(7)?,
                metadata: row.get(8)?,
                symbol_id: row.get(9)?,
                ..Default::default()
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{FileRecord, SymbolRecord};
    use super::*;

    fn file_row(path: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            repo: "demo".to_string(),
            mtime: 100,
            size: 10,
            content: "def find_me(): pass\n".to_string(),
            parse_status: "ok".to_string(),
            ..Default::default()
        }
    }

    fn symbol(path: &str, name: &str, line: i64, end_line: i64) -> SymbolRecord {
        SymbolRecord {
            path: path.to_string(),
            name: name.to_string(),
            qualname: name.to_string(),
            kind: "function".to_string(),
            line,
            end_line,
            ..Default::default()
        }
    }

    #[test]
    fn deleting_file_deletes_symbols() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_symbols(&[symbol("root-aaaa/a.py", "find_me", 1, 2)])
            .unwrap();
        assert_eq!(db.count_symbols().unwrap(), 1);
        db.delete_path("root-aaaa/a.py").unwrap();
        assert_eq!(db.count_symbols().unwrap(), 0);
    }

    #[test]
    fn symbol_search_orders_short_names_first() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_symbols(&[
            symbol("root-aaaa/a.py", "find_me_everywhere_long", 1, 2),
            symbol("root-aaaa/a.py", "find_me", 5, 6),
        ])
        .unwrap();
        let hits = db.search_symbols("find_me", None, 10, &[]).unwrap();
        assert_eq!(hits[0].name, "find_me");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn enclosing_symbol_prefers_nearest_preceding_line() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_symbols(&[
            symbol("root-aaaa/a.py", "outer", 1, 50),
            symbol("root-aaaa/a.py", "inner", 10, 20),
        ])
        .unwrap();
        let ctx = db.enclosing_symbol("root-aaaa/a.py", 15).unwrap();
        assert_eq!(ctx, "function: inner");
        let ctx = db.enclosing_symbol("root-aaaa/a.py", 5).unwrap();
        assert_eq!(ctx, "function: outer");
        assert!(db.enclosing_symbol("root-aaaa/a.py", 0).is_none());
    }

    #[test]
    fn enclosing_symbol_tie_breaks_on_end_line_desc() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_symbols(&[
            symbol("root-aaaa/a.py", "narrow", 10, 12),
            symbol("root-aaaa/a.py", "wide", 10, 40),
        ])
        .unwrap();
        let ctx = db.enclosing_symbol("root-aaaa/a.py", 11).unwrap();
        assert_eq!(ctx, "function: wide");
    }

    #[test]
    fn fuzzy_matches_within_levenshtein_two() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_symbols(&[
            symbol("root-aaaa/a.py", "handler", 1, 2),
            symbol("root-aaaa/a.py", "unrelated_thing", 5, 6),
        ])
        .unwrap();
        let hits = db.fuzzy_search_symbols("handlr", 3, &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "handler");
        assert!(db.fuzzy_search_symbols("zzzzzz", 3, &[]).unwrap().is_empty());
    }
}
