// Runtime configuration.
//
// Config file loading is an external concern; everything here is assembled
// from defaults plus recognized environment variables so the daemon and the
// tests construct the same shapes.

use std::env;

use serde::{Deserialize, Serialize};

use crate::utils::file::parse_size;

/// Default extensions eligible for indexing.
pub const DEFAULT_INCLUDE_EXT: &[&str] = &[
    "py", "ts", "tsx", "js", "jsx", "go", "java", "kt", "rs", "c", "h", "cpp", "hpp", "cs", "rb",
    "php", "swift", "lua", "sh", "sql", "md", "yaml", "yml", "json", "toml",
];

/// Files indexed regardless of extension.
pub const DEFAULT_INCLUDE_FILES: &[&str] =
    &["Makefile", "Dockerfile", "AGENTS.md", "GEMINI.md", "README.md"];

/// Directory names pruned from every walk.
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
    ".codex",
    ".cache",
];

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64_size(key: &str, default: u64) -> u64 {
    let raw = env::var(key).ok();
    parse_size(raw.as_deref(), default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

/// Daemon configuration, environment-derived with stable defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub include_ext: Vec<String>,
    pub include_files: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub max_file_bytes: u64,
    pub max_depth: usize,
    pub follow_symlinks: bool,

    /// TCP port for the IPC surface; 0 selects an ephemeral port.
    pub port: u16,

    // Writer queue tuning.
    pub writer_max_batch: usize,
    pub writer_max_wait_ms: u64,
    pub writer_queue_capacity: usize,
    pub max_overlay_size: usize,

    // Watcher tuning.
    pub debounce_min_delay_ms: u64,
    pub debounce_max_delay_ms: u64,
    pub bucket_capacity: f64,
    pub bucket_fill_rate: f64,

    // Indexer tuning.
    pub max_attempts: u32,
    pub backpressure_threshold: f64,
    pub parser_workers: usize,

    // Engine tuning.
    pub engine_max_doc_bytes: u64,
    pub engine_preview_bytes: u64,
    pub engine_auto_install: bool,
    pub fts_rebuild_on_start: bool,

    pub read_max_bytes: u64,
    pub test_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            include_ext: DEFAULT_INCLUDE_EXT.iter().map(|s| s.to_string()).collect(),
            include_files: DEFAULT_INCLUDE_FILES.iter().map(|s| s.to_string()).collect(),
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.iter().map(|s| s.to_string()).collect(),
            exclude_globs: Vec::new(),
            max_file_bytes: 2 << 20,
            max_depth: 32,
            follow_symlinks: false,
            port: 0,
            writer_max_batch: 128,
            writer_max_wait_ms: 200,
            writer_queue_capacity: 4096,
            max_overlay_size: 512,
            debounce_min_delay_ms: 500,
            debounce_max_delay_ms: 5000,
            bucket_capacity: 100.0,
            bucket_fill_rate: 50.0,
            max_attempts: 3,
            backpressure_threshold: 0.8,
            parser_workers: 0, // 0 = derive from CPU count
            engine_max_doc_bytes: 4 << 20,
            engine_preview_bytes: 8192,
            engine_auto_install: false,
            fts_rebuild_on_start: false,
            read_max_bytes: 1 << 20,
            test_mode: false,
        }
    }
}

impl Config {
    /// Build configuration from the environment on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(port) = env::var("DECKARD_PORT").or_else(|_| env::var("SARI_DAEMON_PORT")) {
            if let Ok(p) = port.trim().parse::<u16>() {
                cfg.port = p;
            }
        }

        cfg.engine_max_doc_bytes =
            env_u64_size("DECKARD_ENGINE_MAX_DOC_BYTES", cfg.engine_max_doc_bytes);
        cfg.engine_preview_bytes =
            env_u64_size("DECKARD_ENGINE_PREVIEW_BYTES", cfg.engine_preview_bytes);
        cfg.read_max_bytes = env_u64_size("DECKARD_READ_MAX_BYTES", cfg.read_max_bytes);
        cfg.engine_auto_install = env_flag("DECKARD_ENGINE_AUTO_INSTALL");
        cfg.fts_rebuild_on_start = env_flag("SARI_FTS_REBUILD_ON_START");
        cfg.test_mode = env_flag("SARI_TEST_MODE");
        cfg.parser_workers = env_usize("SARI_MCP_WORKERS", cfg.parser_workers);

        cfg
    }

    /// Effective base parser worker count before the governor multiplier.
    pub fn base_parser_workers(&self) -> usize {
        if self.parser_workers > 0 {
            self.parser_workers
        } else {
            (num_cpus::get() / 2).max(1)
        }
    }

    /// Max read-pool connections (`DECKARD_READ_POOL_MAX`, default 32).
    pub fn read_pool_max() -> usize {
        env_usize("DECKARD_READ_POOL_MAX", 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.include_ext.iter().any(|e| e == "py"));
        assert!(cfg.exclude_dirs.iter().any(|d| d == "node_modules"));
        assert_eq!(cfg.writer_max_batch, 128);
        assert!(cfg.base_parser_workers() >= 1);
    }
}
