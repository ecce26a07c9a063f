// Row types for the storage kernel.

use serde::{Deserialize, Serialize};

/// A monitored workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootRecord {
    pub root_id: String,
    pub abs_path: String,
    pub label: String,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// One indexed file. `path` is `root_id + "/" + rel_path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub root_id: String,
    pub rel_path: String,
    pub repo: String,
    pub mtime: i64,
    pub size: i64,
    /// Uncompressed source text; compressed on the way into the store.
    pub content: String,
    pub content_hash: String,
    pub last_seen: i64,
    pub parse_status: String,
    pub parse_reason: String,
    pub ast_status: String,
    pub ast_reason: String,
    pub is_binary: bool,
    pub is_minified: bool,
    pub sampled: bool,
    /// Normalized text for the embedded engine (NFKC, lowercased, CJK
    /// segmented).
    pub fts_content: String,
}

impl FileRecord {
    pub fn status_ok(path: String, root_id: String, rel_path: String, repo: String) -> Self {
        Self {
            path,
            root_id,
            rel_path,
            repo,
            parse_status: "ok".to_string(),
            parse_reason: "none".to_string(),
            ast_status: "ok".to_string(),
            ast_reason: "none".to_string(),
            ..Default::default()
        }
    }
}

/// Lightweight file metadata used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub mtime: i64,
    pub size: i64,
}

/// One extracted program symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub symbol_id: String,
    pub path: String,
    pub root_id: String,
    pub name: String,
    pub qualname: String,
    pub kind: String,
    pub line: i64,
    pub end_line: i64,
    pub content: String,
    pub parent_name: String,
    /// JSON blob.
    pub metadata: String,
    pub docstring: String,
}

impl SymbolRecord {
    /// Stable id over `(path, kind, qualname)`.
    pub fn compute_id(path: &str, kind: &str, qualname: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(kind.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(qualname.as_bytes());
        hasher.finalize().to_hex().as_str()[..16].to_string()
    }
}

/// A directed edge between symbols.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationRecord {
    pub from_path: String,
    pub from_symbol: String,
    pub from_symbol_id: String,
    pub to_path: String,
    pub to_symbol: String,
    pub to_symbol_id: String,
    /// "calls", "implements", "extends", ...
    pub rel_type: String,
    pub line: i64,
}

/// Repository metadata feeding the ranking adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoMetaRecord {
    pub repo_name: String,
    pub tags: String,
    pub domain: String,
    pub description: String,
    pub priority: i64,
}

/// A pipeline failure awaiting retry or parked in the dead-letter set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedTaskRecord {
    pub task_kind: String,
    pub path: String,
    pub attempts: i64,
    pub last_error_code: String,
    pub last_error_message: String,
    pub next_retry_ts: i64,
}

/// A saved source slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnippetRecord {
    pub id: String,
    pub tag: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content: String,
    pub created_ts: i64,
    pub version: i64,
}

/// A free-form context note with an optional validity window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: String,
    pub tag: String,
    pub content: String,
    /// 0 means unbounded on that side.
    pub valid_from: i64,
    pub valid_until: i64,
    pub created_ts: i64,
}

/// Quick counters for status output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatus {
    pub total_files: i64,
    pub last_mtime: i64,
    pub db_size_bytes: u64,
}

/// Row shape returned by `list_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListing {
    pub repo: String,
    pub path: String,
    pub mtime: i64,
    pub size: i64,
    pub file_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_ids_are_stable_and_distinct() {
        let a = SymbolRecord::compute_id("root-1/a.py", "function", "mod.foo");
        let b = SymbolRecord::compute_id("root-1/a.py", "function", "mod.foo");
        let c = SymbolRecord::compute_id("root-1/a.py", "class", "mod.foo");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
