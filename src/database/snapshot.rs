// Snapshot merge: atomically copy a snapshot database's tables into the
// main store via ATTACH. Failure rolls back; the snapshot is always
// detached.

use std::path::Path;

use anyhow::Result;
use rusqlite::params;
use tracing::{debug, warn};

use super::SearchDatabase;

const MERGE_TABLES: &[&str] = &[
    "roots",
    "files",
    "symbols",
    "symbol_relations",
    "repo_meta",
    "snippets",
    "snippet_versions",
    "contexts",
    "failed_tasks",
];

impl SearchDatabase {
    /// Bulk-load a snapshot database. Each table is copied with
    /// `INSERT OR REPLACE` inside one immediate transaction.
    pub fn merge_snapshot(&self, snapshot_path: &Path) -> Result<bool> {
        if !snapshot_path.exists() {
            return Ok(false);
        }
        let conn = self.write_conn()?;
        conn.execute(
            "ATTACH DATABASE ?1 AS snapshot",
            params![snapshot_path.to_string_lossy()],
        )?;

        let merge = (|| -> Result<()> {
            conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
            let result = (|| -> Result<()> {
                for table in MERGE_TABLES {
                    conn.execute_batch(&format!(
                        "INSERT OR REPLACE INTO main.{table} SELECT * FROM snapshot.{table}"
                    ))?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })();

        if let Err(e) = conn.execute_batch("DETACH DATABASE snapshot") {
            warn!("Failed to detach snapshot database: {}", e);
        }
        merge?;
        debug!("Merged snapshot from {:?}", snapshot_path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::FileRecord;
    use super::*;

    #[test]
    fn merge_copies_rows_and_detaches() {
        let snapshot = SearchDatabase::in_memory().unwrap();
        snapshot
            .upsert_files(&[FileRecord {
                path: "root-s/a.py".to_string(),
                repo: "snap".to_string(),
                mtime: 5,
                size: 3,
                content: "abc".to_string(),
                ..Default::default()
            }])
            .unwrap();
        let snapshot_path = snapshot.db_path().to_path_buf();
        drop(snapshot);

        let main = SearchDatabase::in_memory().unwrap();
        assert!(main.merge_snapshot(&snapshot_path).unwrap());
        assert_eq!(main.count_files().unwrap(), 1);
        assert_eq!(main.read_file("root-s/a.py").unwrap().unwrap(), "abc");

        // Missing snapshot is a clean no-op.
        assert!(!main
            .merge_snapshot(Path::new("/nonexistent/snap.db"))
            .unwrap());
    }
}
