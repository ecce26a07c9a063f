// Snippets and context notes.
//
// Snippets are tagged saved slices of source; saving under an existing tag
// appends a version. Contexts are free-form notes with an optional
// validity window filtered at read time.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use crate::utils::unix_timestamp;

use super::types::{ContextRecord, SnippetRecord};
use super::SearchDatabase;

pub fn save_snippet_tx(conn: &Connection, snippet: &SnippetRecord) -> Result<SnippetRecord> {
    let now = unix_timestamp();
    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, (SELECT COALESCE(MAX(version), 0) FROM snippet_versions WHERE snippet_id = snippets.id)
             FROM snippets WHERE tag = ?1",
            params![snippet.tag],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let mut stored = snippet.clone();
    stored.created_ts = now;
    match existing {
        Some((id, max_version)) => {
            stored.id = id;
            stored.version = max_version + 1;
            conn.execute(
                "UPDATE snippets SET path=?1, start_line=?2, end_line=?3, content=?4, created_ts=?5
                 WHERE id = ?6",
                params![
                    stored.path,
                    stored.start_line,
                    stored.end_line,
                    stored.content,
                    now,
                    stored.id
                ],
            )?;
        }
        None => {
            stored.id = uuid::Uuid::new_v4().to_string();
            stored.version = 1;
            conn.execute(
                "INSERT INTO snippets(id, tag, path, start_line, end_line, content, created_ts)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    stored.id,
                    stored.tag,
                    stored.path,
                    stored.start_line,
                    stored.end_line,
                    stored.content,
                    now
                ],
            )?;
        }
    }
    conn.execute(
        "INSERT INTO snippet_versions(snippet_id, version, content, created_ts)
         VALUES (?1, ?2, ?3, ?4)",
        params![stored.id, stored.version, stored.content, now],
    )?;
    Ok(stored)
}

pub fn archive_context_tx(conn: &Connection, context: &ContextRecord) -> Result<ContextRecord> {
    let mut stored = context.clone();
    if stored.id.is_empty() {
        stored.id = uuid::Uuid::new_v4().to_string();
    }
    stored.created_ts = unix_timestamp();
    conn.execute(
        "INSERT OR REPLACE INTO contexts(id, tag, content, valid_from, valid_until, created_ts)
         VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            stored.id,
            stored.tag,
            stored.content,
            stored.valid_from,
            stored.valid_until,
            stored.created_ts
        ],
    )?;
    Ok(stored)
}

impl SearchDatabase {
    pub fn save_snippet(&self, snippet: &SnippetRecord) -> Result<SnippetRecord> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let stored = save_snippet_tx(&tx, snippet)?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn get_snippet(&self, tag: &str) -> Result<Option<SnippetRecord>> {
        let conn = self.read();
        Ok(conn
            .query_row(
                "SELECT s.id, s.tag, s.path, s.start_line, s.end_line, s.content, s.created_ts,
                        (SELECT COALESCE(MAX(version), 1) FROM snippet_versions WHERE snippet_id = s.id)
                 FROM snippets s WHERE s.tag = ?1",
                params![tag],
                |row| {
                    Ok(SnippetRecord {
                        id: row.get(0)?,
                        tag: row.get(1)?,
                        path: row.get(2)?,
                        start_line: row.get(3)?,
                        end_line: row.get(4)?,
                        content: row.get(5)?,
                        created_ts: row.get(6)?,
                        version: row.get(7)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn archive_context(&self, context: &ContextRecord) -> Result<ContextRecord> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let stored = archive_context_tx(&tx, context)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Contexts for a tag whose validity window covers `now`; `valid_from`
    /// / `valid_until` of 0 are unbounded.
    pub fn get_contexts(&self, tag: &str, now: i64) -> Result<Vec<ContextRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT id, tag, content, valid_from, valid_until, created_ts
             FROM contexts
             WHERE tag = ?1
               AND (valid_from = 0 OR valid_from <= ?2)
               AND (valid_until = 0 OR valid_until >= ?2)
             ORDER BY created_ts DESC",
        )?;
        let rows = stmt.query_map(params![tag, now], |row| {
            Ok(ContextRecord {
                id: row.get(0)?,
                tag: row.get(1)?,
                content: row.get(2)?,
                valid_from: row.get(3)?,
                valid_until: row.get(4)?,
                created_ts: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_versions_accumulate_per_tag() {
        let db = SearchDatabase::in_memory().unwrap();
        let base = SnippetRecord {
            tag: "auth-check".to_string(),
            path: "root-a/auth.py".to_string(),
            start_line: 10,
            end_line: 20,
            content: "v1".to_string(),
            ..Default::default()
        };
        let first = db.save_snippet(&base).unwrap();
        assert_eq!(first.version, 1);

        let second = db
            .save_snippet(&SnippetRecord {
                content: "v2".to_string(),
                ..base.clone()
            })
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.id, first.id);

        let fetched = db.get_snippet("auth-check").unwrap().unwrap();
        assert_eq!(fetched.content, "v2");
        assert_eq!(fetched.version, 2);
        assert!(db.get_snippet("missing").unwrap().is_none());
    }

    #[test]
    fn context_validity_window_filters() {
        let db = SearchDatabase::in_memory().unwrap();
        db.archive_context(&ContextRecord {
            tag: "deploy".to_string(),
            content: "always valid".to_string(),
            ..Default::default()
        })
        .unwrap();
        db.archive_context(&ContextRecord {
            tag: "deploy".to_string(),
            content: "expired".to_string(),
            valid_until: 100,
            ..Default::default()
        })
        .unwrap();

        let now = 1_000_000;
        let contexts = db.get_contexts("deploy", now).unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].content, "always valid");
    }
}
