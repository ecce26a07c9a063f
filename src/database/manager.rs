// Process-wide storage manager.
//
// One database/writer pair is active per process. Switching to a new DB
// path requires a clean shutdown of the previous writer; when that fails
// the switch is refused and the guard reason is surfaced through status
// until the process restarts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;

use super::writer::WriterQueue;
use super::{SearchDatabase, StorageError};

/// An open database with its writer queue.
pub struct StorageHandle {
    pub db: Arc<SearchDatabase>,
    pub writer: Arc<WriterQueue>,
}

#[derive(Default)]
struct ManagerState {
    current: Option<(PathBuf, Arc<StorageHandle>)>,
    switch_guard: Option<String>,
}

/// Explicit service owning the active storage handle; constructed at
/// startup and injected, with a process-wide instance for the daemon path.
pub struct StorageManager {
    state: Mutex<ManagerState>,
    cfg: Config,
}

static GLOBAL: OnceLock<StorageManager> = OnceLock::new();

impl StorageManager {
    pub fn new(cfg: Config) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            cfg,
        }
    }

    /// The process-wide manager (daemon path). Tests construct their own.
    pub fn global() -> &'static StorageManager {
        GLOBAL.get_or_init(|| StorageManager::new(Config::from_env()))
    }

    /// Reason the last switch was refused, if any.
    pub fn switch_guard_reason(&self) -> Option<String> {
        self.state.lock().unwrap().switch_guard.clone()
    }

    /// Open (or return) the storage handle for `db_path`. Switching away
    /// from a previous path shuts its writer down first; a failed shutdown
    /// refuses the swap.
    pub fn get_instance(&self, db_path: &Path) -> Result<Arc<StorageHandle>> {
        let mut state = self.state.lock().unwrap();

        if let Some(reason) = &state.switch_guard {
            return Err(StorageError::SwitchRefused(reason.clone()).into());
        }

        if let Some((current_path, handle)) = &state.current {
            if current_path == db_path {
                return Ok(handle.clone());
            }
            info!(
                "Switching storage from {:?} to {:?}",
                current_path, db_path
            );
            if let Err(e) = handle.writer.shutdown() {
                let reason = format!("previous writer shutdown failed: {e}");
                warn!("{}", reason);
                state.switch_guard = Some(reason.clone());
                return Err(StorageError::SwitchRefused(reason).into());
            }
            state.current = None;
        }

        let db = Arc::new(SearchDatabase::new(db_path)?);
        let writer = WriterQueue::start(
            db.clone(),
            self.cfg.writer_max_batch,
            Duration::from_millis(self.cfg.writer_max_wait_ms),
            self.cfg.writer_queue_capacity,
        );
        let handle = Arc::new(StorageHandle { db, writer });
        state.current = Some((db_path.to_path_buf(), handle.clone()));
        Ok(handle)
    }

    /// Shut down the active writer (process exit path).
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((_, handle)) = state.current.take() {
            handle.writer.shutdown()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_returns_same_handle() {
        let manager = StorageManager::new(Config::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        let h1 = manager.get_instance(&path).unwrap();
        let h2 = manager.get_instance(&path).unwrap();
        assert!(Arc::ptr_eq(&h1, &h2));
        manager.shutdown().unwrap();
    }

    #[test]
    fn switching_paths_shuts_down_previous_writer() {
        let manager = StorageManager::new(Config::default());
        let dir = tempfile::tempdir().unwrap();
        let h1 = manager.get_instance(&dir.path().join("a.db")).unwrap();
        let h2 = manager.get_instance(&dir.path().join("b.db")).unwrap();
        assert!(!Arc::ptr_eq(&h1, &h2));
        assert!(!h1.writer.is_running());
        assert!(h2.writer.is_running());
        manager.shutdown().unwrap();
    }
}
