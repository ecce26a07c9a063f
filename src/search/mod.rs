// Search service: hybrid symbol + full-text query pipeline.
//
// `SearchOptions` carries the full query surface (filters, pagination,
// regex mode, total-count semantics); `SearchHit` is the ranked unit every
// backend produces. The pipeline itself lives in `hybrid.rs`, the scoring
// and snippet primitives in `ranking.rs`.

pub mod hybrid;
pub mod ranking;

use serde::{Deserialize, Serialize};

pub use hybrid::SearchService;

/// How the `total` field of search metadata is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TotalMode {
    /// COUNT(*) over the same WHERE clause.
    #[default]
    Exact,
    /// Skip the count; `total` is reported as -1.
    Approx,
}

/// A ranked search result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchHit {
    pub repo: String,
    pub path: String,
    pub score: f64,
    pub snippet: String,
    pub mtime: i64,
    pub size: i64,
    pub match_count: usize,
    pub file_type: String,
    /// Why this hit ranked where it did ("Symbol: function foo", "Content
    /// match", ...). Surfaced to the UI and asserted by tests.
    pub hit_reason: String,
    /// Nearest enclosing symbol above the first matched line.
    pub context_symbol: String,
    pub docstring: String,
    pub metadata: String,
}

/// Search configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub query: String,
    pub repo: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub snippet_lines: usize,
    pub file_types: Vec<String>,
    pub path_pattern: Option<String>,
    pub exclude_patterns: Vec<String>,
    pub recency_boost: bool,
    pub use_regex: bool,
    pub case_sensitive: bool,
    pub root_ids: Vec<String>,
    pub total_mode: TotalMode,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            repo: None,
            limit: 20,
            offset: 0,
            snippet_lines: 5,
            file_types: Vec::new(),
            path_pattern: None,
            exclude_patterns: Vec::new(),
            recency_boost: false,
            use_regex: false,
            case_sensitive: false,
            root_ids: Vec::new(),
            total_mode: TotalMode::Exact,
        }
    }
}

impl SearchOptions {
    pub fn with_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Metadata accompanying a search response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMeta {
    pub fallback_used: bool,
    pub total_scanned: usize,
    /// Exact count, or -1 under approx total mode.
    pub total: i64,
    pub total_mode: String,
    pub regex_mode: bool,
    pub regex_error: Option<String>,
    pub intent: Option<String>,
    pub context_truncated: bool,
}
