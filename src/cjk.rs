// CJK-aware text normalization for the full-text engines.
//
// FTS tokenizers built for whitespace-delimited scripts skip over CJK runs
// entirely, so every document body and path goes through `cjk_space` before
// indexing. Segmentation pads each CJK codepoint with spaces; applied to
// both documents and queries, single-character terms always match. A
// dictionary path configured via `DECKARD_LINDERA_DICT_PATH` is recognized
// and surfaced through engine status, but no morphological tokenizer is
// wired in — the status note says so explicitly.

use std::path::PathBuf;

use unicode_normalization::UnicodeNormalization;

/// True if the character falls in one of the CJK ranges we segment:
/// CJK Unified Ideographs, Extension A, Hiragana + Katakana, Hangul
/// syllables, and Hangul Jamo.
pub fn is_cjk_char(ch: char) -> bool {
    let code = ch as u32;
    (0x4E00..=0x9FFF).contains(&code)
        || (0x3400..=0x4DBF).contains(&code)
        || (0x3040..=0x30FF).contains(&code)
        || (0xAC00..=0xD7A3).contains(&code)
        || (0x1100..=0x11FF).contains(&code)
}

/// True if the text contains at least one CJK character.
pub fn has_cjk(text: &str) -> bool {
    text.chars().any(is_cjk_char)
}

/// Insert spaces around each CJK codepoint so the default tokenizer emits
/// one term per character; non-CJK runs are left intact. Whitespace is
/// collapsed afterwards.
fn fallback_cjk_space(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        if is_cjk_char(ch) {
            if !out.ends_with(' ') {
                out.push(' ');
            }
            out.push(ch);
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Segment CJK text for indexing.
///
/// Non-CJK text is only whitespace-collapsed. CJK text is space-padded
/// per codepoint. Coarse, but the same transform runs on the query side,
/// so matching stays consistent.
pub fn cjk_space(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    if !has_cjk(text) {
        return text.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    fallback_cjk_space(text)
}

/// NFKC-normalize, lowercase, and collapse whitespace.
///
/// This is the canonical form for both indexed document bodies and incoming
/// queries; applying the same normalization on both sides keeps matching
/// deterministic.
pub fn normalize_engine_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let norm: String = text.nfkc().collect();
    let lowered = norm.to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve a configured morphological dictionary path, if any.
///
/// Honors `DECKARD_LINDERA_DICT_PATH`; the path must exist to count. Only
/// surfaced through engine status so operators can see the setting was
/// recognized — it does not change segmentation behavior.
pub fn morph_dict_path() -> Option<PathBuf> {
    let raw = std::env::var("DECKARD_LINDERA_DICT_PATH").ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let expanded = shellexpand::tilde(raw).to_string();
    let path = PathBuf::from(expanded);
    if path.exists() { Some(path) } else { None }
}

/// Human-readable note about the active segmentation tier. A configured
/// dictionary is reported as recognized-but-not-loaded so status never
/// claims morphological segmentation that isn't happening.
pub fn tokenizer_note() -> String {
    match morph_dict_path() {
        Some(p) => format!(
            "per-codepoint CJK fallback (morphological dictionary at {} recognized but not loaded)",
            p.display()
        ),
        None => "per-codepoint CJK fallback".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cjk_ranges() {
        assert!(has_cjk("형태소"));
        assert!(has_cjk("日本語のテキスト"));
        assert!(has_cjk("mixed 한국어 text"));
        assert!(!has_cjk("plain ascii text"));
        assert!(!has_cjk("café résumé"));
    }

    #[test]
    fn fallback_pads_each_codepoint() {
        assert_eq!(cjk_space("한국"), "한 국");
        assert_eq!(cjk_space("abc한def"), "abc 한 def");
    }

    #[test]
    fn non_cjk_only_collapses_whitespace() {
        assert_eq!(cjk_space("hello   world"), "hello world");
    }

    #[test]
    fn normalization_is_nfkc_lower_collapsed() {
        // NFKC folds the fullwidth form to ASCII.
        assert_eq!(normalize_engine_text("ＡＢＣ  def"), "abc def");
        assert_eq!(normalize_engine_text("  Hello\n\tWorld "), "hello world");
        assert_eq!(normalize_engine_text(""), "");
    }
}
