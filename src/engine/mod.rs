// Full-text engine layer.
//
// Two registered backends share one contract: `sqlite` rides the FTS5
// virtual table kept in sync by triggers, `embedded` is a tantivy index
// fed explicitly by the writer's post-commit hook (`engine_docs` /
// `engine_deletes`). The active mode comes from `DECKARD_ENGINE_MODE`.

pub mod embedded;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cjk;
use crate::database::SearchDatabase;
use crate::database::files::engine_body_text;

/// Engine lifecycle/query faults with stable codes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ERR_ENGINE_NOT_INSTALLED: {0}")]
    NotInstalled(String),
    #[error("ERR_ENGINE_UNAVAILABLE: {0}")]
    Unavailable(String),
    #[error("ERR_ENGINE_QUERY: {0}")]
    Query(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotInstalled(_) => "ERR_ENGINE_NOT_INSTALLED",
            EngineError::Unavailable(_) => "ERR_ENGINE_UNAVAILABLE",
            EngineError::Query(_) => "ERR_ENGINE_QUERY",
        }
    }
}

/// Which backend serves full-text queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Sqlite,
    Embedded,
}

impl EngineMode {
    pub fn from_env() -> Self {
        match std::env::var("DECKARD_ENGINE_MODE")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "sqlite" => EngineMode::Sqlite,
            _ => EngineMode::Embedded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Sqlite => "sqlite",
            EngineMode::Embedded => "embedded",
        }
    }
}

/// One document in the external index; `doc_id` equals the file path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineDoc {
    pub doc_id: String,
    pub path: String,
    pub root_id: String,
    pub rel_path: String,
    pub repo: String,
    /// Path with the rel_path appended, CJK-segmented.
    pub path_text: String,
    /// NFKC-normalized, lowercased, whitespace-collapsed body; CJK
    /// segmented; capped head+tail.
    pub body_text: String,
    pub preview: String,
    pub mtime: i64,
    pub size: i64,
}

impl EngineDoc {
    /// Assemble an engine document from raw file content.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        path: &str,
        root_id: &str,
        rel_path: &str,
        repo: &str,
        raw_body: &str,
        mtime: i64,
        size: i64,
        max_doc_bytes: usize,
        preview_bytes: usize,
    ) -> Self {
        let mut path_text = format!("{path} {rel_path}");
        if cjk::has_cjk(&path_text) {
            path_text = cjk::cjk_space(&path_text);
        }
        let body_text = engine_body_text(raw_body, max_doc_bytes);
        let preview = build_preview(raw_body, preview_bytes);
        Self {
            doc_id: path.to_string(),
            path: path.to_string(),
            root_id: root_id.to_string(),
            rel_path: rel_path.to_string(),
            repo: if repo.is_empty() { "__root__" } else { repo }.to_string(),
            path_text,
            body_text,
            preview,
            mtime,
            size,
        }
    }
}

fn build_preview(raw: &str, preview_bytes: usize) -> String {
    if preview_bytes == 0 || raw.is_empty() {
        return String::new();
    }
    if raw.len() <= preview_bytes {
        return raw.to_string();
    }
    let half = preview_bytes / 2;
    let mut head_end = half.min(raw.len());
    while head_end > 0 && !raw.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = raw.len().saturating_sub(half);
    while tail_start < raw.len() && !raw.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!("{}\n...\n{}", &raw[..head_end], &raw[tail_start..])
}

/// A raw engine hit before the search service's adapter boosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineHit {
    pub path: String,
    pub repo: String,
    pub score: f64,
    pub mtime: i64,
    pub size: i64,
}

/// Engine status for the `status` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub engine_mode: String,
    pub engine_ready: bool,
    pub reason: String,
    pub hint: String,
    pub doc_count: u64,
    pub index_size_bytes: u64,
    pub index_version: u64,
    pub tokenizer_ready: bool,
    pub tokenizer_note: String,
}

/// Common engine contract.
pub trait SearchEngineOps: Send + Sync {
    fn search(
        &self,
        query: &str,
        root_ids: &[String],
        limit: usize,
    ) -> std::result::Result<Vec<EngineHit>, EngineError>;

    /// Apply one post-commit sync payload atomically.
    fn apply_sync(&self, docs: &[EngineDoc], deletes: &[String]) -> Result<()>;

    /// Re-feed the whole document set.
    fn rebuild(&self, docs: &[EngineDoc]) -> Result<()>;

    fn status(&self) -> EngineStatus;

    /// Bootstrap an engine whose index is provisioned on demand.
    fn install(&self) -> Result<()>;
}

/// Registry mapping engine mode to a constructed backend.
pub struct EngineRegistry;

impl EngineRegistry {
    pub fn create(
        mode: EngineMode,
        db: Arc<SearchDatabase>,
        index_dir: &std::path::Path,
        auto_install: bool,
    ) -> Result<Arc<dyn SearchEngineOps>> {
        match mode {
            EngineMode::Sqlite => Ok(Arc::new(sqlite::SqliteEngine::new(db))),
            EngineMode::Embedded => Ok(Arc::new(embedded::EmbeddedEngine::open(
                index_dir,
                auto_install,
            )?)),
        }
    }
}

/// Path prior: source trees rank up, tests/build artifacts rank down.
pub fn path_prior(path: &str) -> f64 {
    let p = path.to_lowercase();
    let has_segment = |seg: &str| {
        p.starts_with(&format!("{seg}/")) || p.contains(&format!("/{seg}/"))
    };
    if has_segment("src") || has_segment("app") || has_segment("core") {
        0.6
    } else if has_segment("config") || has_segment("domain") || has_segment("service") {
        0.4
    } else if has_segment("test")
        || has_segment("tests")
        || has_segment("example")
        || has_segment("dist")
        || has_segment("build")
    {
        -0.7
    } else {
        0.0
    }
}

/// Filetype prior: primary languages up, lockfiles/minified noise down.
pub fn filetype_prior(path: &str) -> f64 {
    let p = path.to_lowercase();
    if p.ends_with(".lock") || p.ends_with(".min.js") || p.ends_with(".map") {
        -0.8
    } else if [".py", ".ts", ".go", ".java", ".kt"].iter().any(|e| p.ends_with(e)) {
        0.3
    } else if [".yaml", ".yml", ".json"].iter().any(|e| p.ends_with(e)) {
        0.15
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_build_normalizes_and_caps() {
        let doc = EngineDoc::build(
            "root-a/src/메인.py",
            "root-a",
            "src/메인.py",
            "",
            "DEF Main(): 형태소분석\n",
            5,
            10,
            1024,
            64,
        );
        assert_eq!(doc.repo, "__root__");
        assert!(doc.path_text.contains("메 인"));
        assert!(doc.body_text.contains("형 태 소"));
        assert!(doc.body_text.contains("def main():"));
    }

    #[test]
    fn priors_follow_path_shape() {
        assert_eq!(path_prior("src/app.py"), 0.6);
        assert_eq!(path_prior("root-a/src/app.py"), 0.6);
        assert_eq!(path_prior("tests/test_app.py"), -0.7);
        assert_eq!(path_prior("README.md"), 0.0);
        assert_eq!(filetype_prior("a.py"), 0.3);
        assert_eq!(filetype_prior("b.min.js"), -0.8);
        assert_eq!(filetype_prior("c.yaml"), 0.15);
        assert_eq!(filetype_prior("d.rs"), 0.0);
    }

    #[test]
    fn preview_keeps_head_and_tail() {
        let raw = format!("{}{}", "a".repeat(100), "z".repeat(100));
        let preview = build_preview(&raw, 40);
        assert!(preview.starts_with('a'));
        assert!(preview.ends_with('z'));
        assert!(preview.contains("\n...\n"));
    }
}
