// Context budgeting for tool responses.
//
// Search results flow straight into LLM context windows; past a hit-count
// threshold, snippets are collapsed into short summaries.

use crate::search::SearchHit;

/// Hits above this count are summarized instead of returned verbatim.
const SUMMARIZE_THRESHOLD: usize = 20;

/// Max characters retained per summarized snippet.
const SUMMARY_CHARS: usize = 200;

pub struct ContextBudgetEngine {
    pub max_tokens: usize,
}

impl Default for ContextBudgetEngine {
    fn default() -> Self {
        Self { max_tokens: 4000 }
    }
}

impl ContextBudgetEngine {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Reduce verbosity for large result sets. Small result sets pass
    /// through untouched.
    pub fn filter_hits(&self, hits: Vec<SearchHit>) -> (Vec<SearchHit>, bool) {
        if hits.len() <= SUMMARIZE_THRESHOLD {
            return (hits, false);
        }
        let summarized = hits
            .into_iter()
            .map(|mut h| {
                if h.snippet.len() > SUMMARY_CHARS {
                    let cut = h
                        .snippet
                        .char_indices()
                        .map(|(i, _)| i)
                        .take_while(|i| *i <= SUMMARY_CHARS)
                        .last()
                        .unwrap_or(0);
                    h.snippet.truncate(cut);
                    h.snippet.push_str("...");
                }
                h
            })
            .collect();
        (summarized, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, snippet: &str) -> SearchHit {
        SearchHit {
            path: path.to_string(),
            snippet: snippet.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn small_result_sets_pass_through() {
        let hits = vec![hit("a", "full snippet"), hit("b", "another")];
        let (out, truncated) = ContextBudgetEngine::default().filter_hits(hits);
        assert!(!truncated);
        assert_eq!(out[0].snippet, "full snippet");
    }

    #[test]
    fn large_result_sets_are_summarized() {
        let long = "x".repeat(500);
        let hits: Vec<SearchHit> = (0..30).map(|i| hit(&format!("f{i}"), &long)).collect();
        let (out, truncated) = ContextBudgetEngine::default().filter_hits(hits);
        assert!(truncated);
        assert!(out.iter().all(|h| h.snippet.len() <= SUMMARY_CHARS + 4));
    }
}
