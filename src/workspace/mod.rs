// Workspace layout and identity.
//
// A workspace is a directory tree marked by `.codex-root`. All daemon state
// lives under `<root>/.codex/tools/deckard/data/` (SQLite database, the
// embedded engine index, and the `server.json` handshake); logs roll under
// an adjacent `logs/` directory. Global per-user directories are opt-in.
//
// Roots are identified by a stable hash of their canonical absolute path so
// file keys (`root-<hash>/rel/path`) survive daemon restarts and DB moves.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Marker file whose presence pins a workspace root.
pub const ROOT_MARKER: &str = ".codex-root";

/// Prefix of every root identifier.
pub const ROOT_ID_PREFIX: &str = "root-";

/// Stable identifier for a workspace root: `root-` plus the first 12 hex
/// chars of the blake3 hash of the canonical absolute path.
pub fn root_id_for_path(abs_path: &Path) -> String {
    let canonical = abs_path
        .canonicalize()
        .unwrap_or_else(|_| abs_path.to_path_buf());
    let hash = blake3::hash(canonical.to_string_lossy().as_bytes());
    format!("{}{}", ROOT_ID_PREFIX, &hash.to_hex().as_str()[..12])
}

/// Split a stored file key into `(root_id, rel_path)`. Legacy keys without
/// the `root-*/` prefix return `None`.
pub fn split_file_key(path: &str) -> Option<(&str, &str)> {
    if !path.starts_with(ROOT_ID_PREFIX) {
        return None;
    }
    path.split_once('/')
}

/// True when the stored key predates root-scoped layouts.
pub fn is_legacy_path(path: &str) -> bool {
    split_file_key(path).is_none()
}

/// Contents of the `server.json` handshake file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandshake {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub version: String,
}

/// Resolved workspace paths.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub root_id: String,
}

impl WorkspaceLayout {
    pub fn new(root: PathBuf) -> Self {
        let root_id = root_id_for_path(&root);
        Self { root, root_id }
    }

    /// Resolve the workspace root: `DECKARD_WORKSPACE_ROOT` wins, else walk
    /// up from the start directory looking for the marker, else the start
    /// directory itself.
    pub fn detect(start: &Path) -> Self {
        if let Ok(env_root) = std::env::var("DECKARD_WORKSPACE_ROOT") {
            let expanded = shellexpand::tilde(env_root.trim()).to_string();
            let path = PathBuf::from(expanded);
            if path.is_dir() {
                let canonical = path.canonicalize().unwrap_or(path);
                debug!("workspace root from DECKARD_WORKSPACE_ROOT: {:?}", canonical);
                return Self::new(canonical);
            }
            warn!(
                "DECKARD_WORKSPACE_ROOT does not exist, falling back to detection: {}",
                env_root
            );
        }

        let mut cursor = Some(start);
        while let Some(dir) = cursor {
            if dir.join(ROOT_MARKER).is_file() {
                let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
                debug!("workspace root via {} marker: {:?}", ROOT_MARKER, canonical);
                return Self::new(canonical);
            }
            cursor = dir.parent();
        }

        let canonical = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
        Self::new(canonical)
    }

    /// `<root>/.codex/tools/deckard/data`
    pub fn data_dir(&self) -> PathBuf {
        self.root
            .join(".codex")
            .join("tools")
            .join("deckard")
            .join("data")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("index.db")
    }

    pub fn engine_index_dir(&self) -> PathBuf {
        self.data_dir().join("engine")
    }

    pub fn server_json_path(&self) -> PathBuf {
        self.data_dir().join("server.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root
            .join(".codex")
            .join("tools")
            .join("deckard")
            .join("logs")
    }

    /// Create the data/log directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.data_dir())
            .with_context(|| format!("creating data dir under {:?}", self.root))?;
        fs::create_dir_all(self.logs_dir())
            .with_context(|| format!("creating logs dir under {:?}", self.root))?;
        Ok(())
    }

    /// Write the `server.json` handshake for local clients.
    pub fn write_handshake(&self, host: &str, port: u16) -> Result<()> {
        let handshake = ServerHandshake {
            host: host.to_string(),
            port,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let body = serde_json::to_string_pretty(&handshake)?;
        fs::write(self.server_json_path(), body).context("writing server.json")?;
        Ok(())
    }

    /// Remove the handshake file on shutdown; missing files are fine.
    pub fn remove_handshake(&self) {
        let _ = fs::remove_file(self.server_json_path());
    }
}

/// Global (per-user) data directory, `~/.local/share/deckard`. Opt-in; the
/// default layout is workspace-local.
pub fn global_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("deckard"))
}

/// Global log directory, `~/.local/share/deckard/logs`.
pub fn global_logs_dir() -> Option<PathBuf> {
    global_data_dir().map(|d| d.join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_ids_are_stable_and_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let a = root_id_for_path(dir.path());
        let b = root_id_for_path(dir.path());
        assert_eq!(a, b);
        assert!(a.starts_with(ROOT_ID_PREFIX));
        assert_eq!(a.len(), ROOT_ID_PREFIX.len() + 12);
    }

    #[test]
    fn marker_detection_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(ROOT_MARKER), "").unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        let layout = WorkspaceLayout::detect(&nested);
        assert_eq!(
            layout.root,
            dir.path().canonicalize().unwrap_or_else(|_| dir.path().to_path_buf())
        );
    }

    #[test]
    fn file_key_splitting() {
        assert_eq!(
            split_file_key("root-abc123/sub/file.py"),
            Some(("root-abc123", "sub/file.py"))
        );
        assert!(is_legacy_path("plain/old/path.py"));
        assert!(!is_legacy_path("root-abc123/file.py"));
    }

    #[test]
    fn handshake_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();
        layout.write_handshake("127.0.0.1", 4533).unwrap();
        let raw = fs::read_to_string(layout.server_json_path()).unwrap();
        let parsed: ServerHandshake = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.port, 4533);
        layout.remove_handshake();
        assert!(!layout.server_json_path().exists());
    }
}
