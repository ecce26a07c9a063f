// Symbol relation (edge) operations.

use anyhow::Result;
use rusqlite::{Connection, params, params_from_iter};

use super::types::RelationRecord;
use super::SearchDatabase;

/// A neighbor row from a caller/callee query, direction-agnostic: `path`,
/// `symbol`, and `symbol_id` refer to the far end of the edge.
#[derive(Debug, Clone, Default)]
pub struct NeighborRow {
    pub path: String,
    pub symbol: String,
    pub symbol_id: String,
    pub line: i64,
    pub rel_type: String,
}

/// Replace outgoing relations for every `from_path` present in the batch.
pub fn upsert_relations_tx(conn: &Connection, relations: &[RelationRecord]) -> Result<usize> {
    if relations.is_empty() {
        return Ok(0);
    }
    let paths: std::collections::HashSet<&str> =
        relations.iter().map(|r| r.from_path.as_str()).collect();
    let mut clear = conn.prepare_cached("DELETE FROM symbol_relations WHERE from_path = ?1")?;
    for path in &paths {
        clear.execute(params![path])?;
    }
    drop(clear);

    let mut insert = conn.prepare_cached(
        "INSERT INTO symbol_relations(from_path, from_symbol, from_symbol_id,
                                      to_path, to_symbol, to_symbol_id, rel_type, line)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
    )?;
    for r in relations {
        insert.execute(params![
            r.from_path,
            r.from_symbol,
            r.from_symbol_id,
            r.to_path,
            r.to_symbol,
            r.to_symbol_id,
            r.rel_type,
            r.line,
        ])?;
    }
    Ok(relations.len())
}

impl SearchDatabase {
    pub fn upsert_relations(&self, relations: &[RelationRecord]) -> Result<usize> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let count = upsert_relations_tx(&tx, relations)?;
        tx.commit()?;
        Ok(count)
    }

    /// Incoming edges (who calls this symbol). Exact symbol-id matches win;
    /// the name path tolerates edges recorded without a target path.
    pub fn callers_for(
        &self,
        name: &str,
        path: Option<&str>,
        symbol_id: Option<&str>,
        root_ids: &[String],
    ) -> Result<Vec<NeighborRow>> {
        if let Some(sid) = symbol_id {
            if !sid.is_empty() {
                let rows = self.neighbor_query(
                    "SELECT from_path, from_symbol, from_symbol_id, line, rel_type
                     FROM symbol_relations WHERE to_symbol_id = ?",
                    sid,
                    None,
                    root_ids,
                    "from_path",
                )?;
                if !rows.is_empty() {
                    return Ok(rows);
                }
            }
        }
        let mut sql = String::from(
            "SELECT from_path, from_symbol, from_symbol_id, line, rel_type
             FROM symbol_relations WHERE to_symbol = ?",
        );
        let mut params: Vec<String> = vec![name.to_string()];
        if let Some(p) = path {
            sql.push_str(" AND (to_path = ? OR to_path = '')");
            params.push(p.to_string());
        }
        self.finish_neighbor_query(sql, params, root_ids, "from_path")
    }

    /// Outgoing edges (what this symbol calls).
    pub fn callees_for(
        &self,
        name: &str,
        path: Option<&str>,
        symbol_id: Option<&str>,
        root_ids: &[String],
    ) -> Result<Vec<NeighborRow>> {
        if let Some(sid) = symbol_id {
            if !sid.is_empty() {
                let rows = self.neighbor_query(
                    "SELECT to_path, to_symbol, to_symbol_id, line, rel_type
                     FROM symbol_relations WHERE from_symbol_id = ?",
                    sid,
                    None,
                    root_ids,
                    "to_path",
                )?;
                if !rows.is_empty() {
                    return Ok(rows);
                }
            }
        }
        let mut sql = String::from(
            "SELECT to_path, to_symbol, to_symbol_id, line, rel_type
             FROM symbol_relations WHERE from_symbol = ?",
        );
        let mut params: Vec<String> = vec![name.to_string()];
        if let Some(p) = path {
            sql.push_str(" AND from_path = ?");
            params.push(p.to_string());
        }
        self.finish_neighbor_query(sql, params, root_ids, "to_path")
    }

    fn neighbor_query(
        &self,
        base_sql: &str,
        key: &str,
        path: Option<&str>,
        root_ids: &[String],
        far_path_col: &str,
    ) -> Result<Vec<NeighborRow>> {
        let mut sql = base_sql.to_string();
        let mut params: Vec<String> = vec![key.to_string()];
        if let Some(p) = path {
            sql.push_str(" AND from_path = ?");
            params.push(p.to_string());
        }
        self.finish_neighbor_query(sql, params, root_ids, far_path_col)
    }

    fn finish_neighbor_query(
        &self,
        mut sql: String,
        mut params: Vec<String>,
        root_ids: &[String],
        far_path_col: &str,
    ) -> Result<Vec<NeighborRow>> {
        if !root_ids.is_empty() {
            let clauses = vec![format!("{far_path_col} LIKE ?"); root_ids.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses} OR {far_path_col} = '')"));
            params.extend(root_ids.iter().map(|r| format!("{r}/%")));
        }
        sql.push_str(&format!(" ORDER BY {far_path_col}, line"));

        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(NeighborRow {
                path: row.get(0)?,
                symbol: row.get(1)?,
                symbol_id: row.get(2)?,
                line: row.get(3)?,
                rel_type: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn count_relations(&self) -> Result<i64> {
        let conn = self.read();
        Ok(conn.query_row("SELECT COUNT(1) FROM symbol_relations", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{FileRecord, RelationRecord};
    use super::*;

    fn file_row(path: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            repo: "demo".to_string(),
            mtime: 1,
            size: 1,
            content: "x".to_string(),
            ..Default::default()
        }
    }

    fn edge(from_path: &str, from: &str, to_path: &str, to: &str, line: i64) -> RelationRecord {
        RelationRecord {
            from_path: from_path.to_string(),
            from_symbol: from.to_string(),
            to_path: to_path.to_string(),
            to_symbol: to.to_string(),
            rel_type: "calls".to_string(),
            line,
            ..Default::default()
        }
    }

    #[test]
    fn callers_and_callees_roundtrip() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py"), file_row("root-aaaa/b.py")])
            .unwrap();
        db.upsert_relations(&[
            edge("root-aaaa/a.py", "main", "root-aaaa/b.py", "helper", 3),
            edge("root-aaaa/a.py", "main", "root-aaaa/b.py", "other", 4),
        ])
        .unwrap();

        let callers = db.callers_for("helper", None, None, &[]).unwrap();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].symbol, "main");

        let callees = db.callees_for("main", None, None, &[]).unwrap();
        assert_eq!(callees.len(), 2);
    }

    #[test]
    fn reupsert_replaces_edges_for_path() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_relations(&[edge("root-aaaa/a.py", "main", "", "gone", 1)])
            .unwrap();
        db.upsert_relations(&[edge("root-aaaa/a.py", "main", "", "kept", 2)])
            .unwrap();
        assert_eq!(db.count_relations().unwrap(), 1);
        assert!(db.callers_for("gone", None, None, &[]).unwrap().is_empty());
        assert_eq!(db.callers_for("kept", None, None, &[]).unwrap().len(), 1);
    }

    #[test]
    fn cyclic_edges_are_allowed() {
        let db = SearchDatabase::in_memory().unwrap();
        db.upsert_files(&[file_row("root-aaaa/a.py")]).unwrap();
        db.upsert_relations(&[
            edge("root-aaaa/a.py", "ping", "root-aaaa/a.py", "pong", 1),
            edge("root-aaaa/a.py", "pong", "root-aaaa/a.py", "ping", 2),
        ])
        .unwrap();
        assert_eq!(db.count_relations().unwrap(), 2);
    }
}
