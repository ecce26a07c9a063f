// Ranking and snippet primitives shared by every search path.
//
// Term extraction mirrors the engine's query translation rules: hyphenated
// identifiers and prefix sigils survive, control punctuation is dropped,
// and trailing bare operators that would be invalid FTS syntax are
// stripped.

use std::sync::LazyLock;

use regex::Regex;

use crate::utils::unix_timestamp;

/// Upper bound on a synthesized snippet, in bytes. When exceeded the window
/// around the first match is preserved.
pub const SNIPPET_MAX_BYTES: usize = 2048;

/// Highlight markers wrapped around matched terms inside snippets. Callers
/// strip these before display when they render their own emphasis.
pub const HIGHLIGHT_OPEN: &str = ">>>";
pub const HIGHLIGHT_CLOSE: &str = "<<<";

static TERM_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\s,;(){}\[\]<>=+!?'"`|\\]+"#).expect("term split pattern"));

/// Bare operators that are invalid as a trailing FTS token.
const TRAILING_OPERATORS: &[&str] = &["AND", "OR", "NEAR", "NOT"];

/// Split a normalized query into searchable terms.
///
/// Keeps hyphenated identifiers (`kebab-case-name`) and prefix sigils
/// (`$var`, `@decorator`, `#tag`, `::path`) intact; drops empty fragments
/// and trailing bare operators.
pub fn extract_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = TERM_SPLIT
        .split(query)
        .map(|t| t.trim_end_matches('.'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();
    while let Some(last) = terms.last() {
        if TRAILING_OPERATORS.contains(&last.to_ascii_uppercase().as_str()) {
            terms.pop();
        } else {
            break;
        }
    }
    terms
}

/// Quote terms for an FTS5 MATCH expression: each term double-quoted with
/// embedded quotes doubled.
pub fn fts_quote_terms(terms: &[String]) -> String {
    let mut quoted: Vec<String> = Vec::with_capacity(terms.len());
    for t in terms {
        let clean = t.replace('"', "\"\"");
        if !clean.is_empty() {
            quoted.push(format!("\"{clean}\""));
        }
    }
    quoted.join(" ")
}

/// Translate a glob pattern into a SQL LIKE pattern.
///
/// `**` and `*` both become `%` (LIKE has no path-segment awareness) and
/// `?` becomes `_`. Literal `%`/`_` in the pattern are escaped with `^`;
/// pair the result with `ESCAPE '^'` when either appears.
pub fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                // Collapse `**` (and `**/`) into a single `%`.
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                if out.ends_with('%') {
                    continue;
                }
                out.push('%');
            }
            '?' => out.push('_'),
            '%' => out.push_str("^%"),
            '_' => out.push_str("^_"),
            '^' => out.push_str("^^"),
            c => out.push(c),
        }
    }
    out
}

/// Lowercased file extension without the dot; empty when there is none.
pub fn get_file_extension(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

/// Recency boost: recent files get an additive bump on top of their score.
pub fn calculate_recency_score(mtime: i64, score: f64) -> f64 {
    let age_secs = (unix_timestamp() - mtime).max(0);
    let age_days = age_secs as f64 / 86_400.0;
    let boost = if age_days < 7.0 {
        2.0
    } else if age_days < 30.0 {
        1.0
    } else if age_days < 90.0 {
        0.5
    } else {
        0.0
    };
    score + boost
}

/// Count occurrences of the query in the content.
pub fn count_matches(content: &str, query: &str, case_sensitive: bool) -> usize {
    if query.is_empty() || content.is_empty() {
        return 0;
    }
    if case_sensitive {
        content.matches(query).count()
    } else {
        content.to_lowercase().matches(&query.to_lowercase()).count()
    }
}

/// Synthesize a snippet of ±`context_lines` around the first line matching
/// any of the terms. Lines carry a 1-based `L<n>:` prefix; matched terms
/// are wrapped in highlight markers. Bounded by `SNIPPET_MAX_BYTES` with
/// the match window preserved under truncation.
pub fn snippet_around(content: &str, terms: &[String], context_lines: usize) -> String {
    if content.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    let lowered_terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();

    let match_line = lines.iter().position(|line| {
        let lower = line.to_lowercase();
        lowered_terms.iter().any(|t| !t.is_empty() && lower.contains(t))
    });
    let center = match match_line {
        Some(idx) => idx,
        None => 0,
    };

    let start = center.saturating_sub(context_lines);
    let end = (center + context_lines + 1).min(lines.len());

    let mut out = String::new();
    for (offset, line) in lines[start..end].iter().enumerate() {
        let line_no = start + offset + 1;
        let rendered = highlight_terms(line, &lowered_terms);
        out.push_str(&format!("L{line_no}: {rendered}\n"));
    }

    truncate_preserving_window(out, center.saturating_sub(start))
}

fn highlight_terms(line: &str, lowered_terms: &[String]) -> String {
    let mut rendered = line.to_string();
    for term in lowered_terms {
        if term.is_empty() {
            continue;
        }
        let lower = rendered.to_lowercase();
        if let Some(pos) = lower.find(term.as_str()) {
            // Byte offsets from the lowercase copy only apply when the
            // casing transform is length-preserving.
            if rendered.is_char_boundary(pos) && rendered.is_char_boundary(pos + term.len()) {
                let original = rendered[pos..pos + term.len()].to_string();
                rendered.replace_range(
                    pos..pos + term.len(),
                    &format!("{HIGHLIGHT_OPEN}{original}{HIGHLIGHT_CLOSE}"),
                );
            }
        }
    }
    rendered
}

fn truncate_preserving_window(snippet: String, match_offset_lines: usize) -> String {
    if snippet.len() <= SNIPPET_MAX_BYTES {
        return snippet;
    }
    let lines: Vec<&str> = snippet.lines().collect();
    let mut kept: Vec<&str> = Vec::new();
    let mut budget = SNIPPET_MAX_BYTES;
    // Walk outward from the match line so the window survives the cut.
    let mut order: Vec<usize> = Vec::with_capacity(lines.len());
    order.push(match_offset_lines.min(lines.len().saturating_sub(1)));
    for delta in 1..lines.len() {
        let anchor = order[0];
        if anchor + delta < lines.len() {
            order.push(anchor + delta);
        }
        if anchor >= delta {
            order.push(anchor - delta);
        }
    }
    let mut selected = vec![false; lines.len()];
    for idx in order {
        let cost = lines[idx].len() + 1;
        if cost > budget {
            break;
        }
        budget -= cost;
        selected[idx] = true;
    }
    for (idx, line) in lines.iter().enumerate() {
        if selected[idx] {
            kept.push(line);
        }
    }
    let mut out = kept.join("\n");
    out.push('\n');
    out
}

/// Strip highlight markers from a snippet (for callers that render plain
/// text).
pub fn strip_highlights(snippet: &str) -> String {
    snippet.replace(HIGHLIGHT_OPEN, "").replace(HIGHLIGHT_CLOSE, "")
}

/// Definition-pattern regexes for a set of query terms: `class Foo`,
/// `def foo`, `fn foo`, etc. Terms shorter than 3 chars are skipped.
pub fn definition_patterns(terms: &[String]) -> Vec<Regex> {
    let mut patterns = Vec::new();
    for term in terms {
        if term.len() < 3 {
            continue;
        }
        let escaped = regex::escape(term);
        if let Ok(re) = Regex::new(&format!(
            r"(?i)(class|def|function|struct|pub\s+fn|fn|async\s+def|interface|type)\s+{escaped}\b"
        )) {
            patterns.push(re);
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_terms_preserves_identifiers_and_sigils() {
        let terms = extract_terms("find-me $var @decorator ::path #tag");
        assert_eq!(terms, vec!["find-me", "$var", "@decorator", "::path", "#tag"]);
    }

    #[test]
    fn extract_terms_strips_trailing_operators() {
        assert_eq!(extract_terms("foo bar AND"), vec!["foo", "bar"]);
        assert_eq!(extract_terms("foo OR NEAR"), vec!["foo"]);
        // Mid-query operators are legitimate terms.
        assert_eq!(extract_terms("and or gate"), vec!["and", "or", "gate"]);
    }

    #[test]
    fn fts_quoting_doubles_embedded_quotes() {
        let terms = vec!["plain".to_string(), "has\"quote".to_string()];
        assert_eq!(fts_quote_terms(&terms), "\"plain\" \"has\"\"quote\"");
    }

    #[test]
    fn glob_to_like_roundtrip() {
        // matches(P, s) iff LIKE(glob_to_like(P), s) over canonical patterns.
        let cases = [
            ("src/*.py", "src/%.py"),
            ("src/**/*.ts", "src/%.ts"),
            ("a?c.rs", "a_c.rs"),
            ("**/test", "%/test"),
        ];
        for (glob, like) in cases {
            assert_eq!(glob_to_like(glob), like, "pattern {glob}");
        }
    }

    #[test]
    fn file_extension_edge_cases() {
        assert_eq!(get_file_extension("a/b/c.PY"), "py");
        assert_eq!(get_file_extension("Makefile"), "");
        assert_eq!(get_file_extension(".gitignore"), "");
        assert_eq!(get_file_extension("x.min.js"), "js");
    }

    #[test]
    fn snippet_has_line_prefixes_and_highlights() {
        let content = "one\ntwo\nneedle here\nfour\nfive";
        let snippet = snippet_around(content, &["needle".to_string()], 1);
        assert!(snippet.contains("L3: >>>needle<<< here"));
        assert!(snippet.contains("L2: two"));
        assert!(snippet.contains("L4: four"));
        assert!(!snippet.contains("L1:"));
    }

    #[test]
    fn snippet_bounded_by_max_bytes() {
        let long_line = "y".repeat(700);
        let content = (0..20)
            .map(|i| {
                if i == 10 {
                    "the needle line".to_string()
                } else {
                    long_line.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let snippet = snippet_around(&content, &["needle".to_string()], 8);
        assert!(snippet.len() <= SNIPPET_MAX_BYTES + 1);
        assert!(snippet.contains("needle"));
    }

    #[test]
    fn count_matches_case_modes() {
        assert_eq!(count_matches("Foo foo FOO", "foo", false), 3);
        assert_eq!(count_matches("Foo foo FOO", "foo", true), 1);
    }
}
