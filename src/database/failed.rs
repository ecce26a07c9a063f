// Failed-task (dead-letter) bookkeeping.
//
// A recoverable pipeline failure inserts or bumps a row; success removes
// it. Rows whose attempts reach the configured maximum stay put as
// dead-letter diagnostics and are reported by `status`.

use anyhow::Result;
use rusqlite::{Connection, params};

use crate::utils::unix_timestamp;

use super::types::FailedTaskRecord;
use super::SearchDatabase;

/// Attempts at or above this count park the task in the dead-letter set.
pub const DLQ_HIGH_ATTEMPTS: i64 = 3;

pub fn record_failed_tx(conn: &Connection, task: &FailedTaskRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO failed_tasks(task_kind, path, attempts, last_error_code,
                                  last_error_message, next_retry_ts, updated_ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(task_kind, path) DO UPDATE SET
           attempts=excluded.attempts,
           last_error_code=excluded.last_error_code,
           last_error_message=excluded.last_error_message,
           next_retry_ts=excluded.next_retry_ts,
           updated_ts=excluded.updated_ts",
        params![
            task.task_kind,
            task.path,
            task.attempts,
            task.last_error_code,
            task.last_error_message,
            task.next_retry_ts,
            unix_timestamp(),
        ],
    )?;
    Ok(())
}

pub fn resolve_failed_tx(conn: &Connection, task_kind: &str, path: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM failed_tasks WHERE task_kind = ?1 AND path = ?2",
        params![task_kind, path],
    )?;
    Ok(())
}

impl SearchDatabase {
    pub fn record_failed_task(&self, task: &FailedTaskRecord) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        record_failed_tx(&tx, task)?;
        tx.commit()?;
        Ok(())
    }

    pub fn resolve_failed_task(&self, task_kind: &str, path: &str) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        resolve_failed_tx(&tx, task_kind, path)?;
        tx.commit()?;
        Ok(())
    }

    /// `(total, dead-lettered)` failed-task counts.
    pub fn count_failed_tasks(&self) -> Result<(i64, i64)> {
        let conn = self.read();
        let total: i64 =
            conn.query_row("SELECT COUNT(1) FROM failed_tasks", [], |row| row.get(0))?;
        let high: i64 = conn.query_row(
            "SELECT COUNT(1) FROM failed_tasks WHERE attempts >= ?1",
            params![DLQ_HIGH_ATTEMPTS],
            |row| row.get(0),
        )?;
        Ok((total, high))
    }

    /// Tasks whose retry window has opened and which are not dead-lettered.
    pub fn due_failed_tasks(&self, now: i64, max_attempts: i64) -> Result<Vec<FailedTaskRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT task_kind, path, attempts, last_error_code, last_error_message, next_retry_ts
             FROM failed_tasks
             WHERE next_retry_ts <= ?1 AND attempts < ?2
             ORDER BY next_retry_ts ASC LIMIT 100",
        )?;
        let rows = stmt.query_map(params![now, max_attempts], |row| {
            Ok(FailedTaskRecord {
                task_kind: row.get(0)?,
                path: row.get(1)?,
                attempts: row.get(2)?,
                last_error_code: row.get(3)?,
                last_error_message: row.get(4)?,
                next_retry_ts: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn list_failed_tasks(&self, limit: usize) -> Result<Vec<FailedTaskRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT task_kind, path, attempts, last_error_code, last_error_message, next_retry_ts
             FROM failed_tasks ORDER BY updated_ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FailedTaskRecord {
                task_kind: row.get(0)?,
                path: row.get(1)?,
                attempts: row.get(2)?,
                last_error_code: row.get(3)?,
                last_error_message: row.get(4)?,
                next_retry_ts: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: &str, path: &str, attempts: i64) -> FailedTaskRecord {
        FailedTaskRecord {
            task_kind: kind.to_string(),
            path: path.to_string(),
            attempts,
            last_error_code: "engine_sync_error:io".to_string(),
            last_error_message: "disk full".to_string(),
            next_retry_ts: 0,
        }
    }

    #[test]
    fn record_resolve_lifecycle() {
        let db = SearchDatabase::in_memory().unwrap();
        db.record_failed_task(&task("parse", "root-a/x.py", 1)).unwrap();
        assert_eq!(db.count_failed_tasks().unwrap(), (1, 0));

        // Bump to dead-letter.
        db.record_failed_task(&task("parse", "root-a/x.py", 3)).unwrap();
        assert_eq!(db.count_failed_tasks().unwrap(), (1, 1));

        db.resolve_failed_task("parse", "root-a/x.py").unwrap();
        assert_eq!(db.count_failed_tasks().unwrap(), (0, 0));
    }

    #[test]
    fn due_tasks_exclude_dead_letters() {
        let db = SearchDatabase::in_memory().unwrap();
        db.record_failed_task(&task("parse", "root-a/due.py", 1)).unwrap();
        db.record_failed_task(&task("parse", "root-a/dead.py", 5)).unwrap();
        let due = db.due_failed_tasks(unix_timestamp() + 10, 3).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].path, "root-a/due.py");
    }
}
