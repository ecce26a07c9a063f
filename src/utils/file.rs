// File content heuristics used by the parser pool: binary detection,
// minified-file detection, and head+tail sampling for oversized inputs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Sample size used for both the head and the tail of a file.
pub const TEXT_SAMPLE_BYTES: usize = 8192;

/// Read a head+tail sample of the file: the first `TEXT_SAMPLE_BYTES` and,
/// when the file is larger than one sample, the last `TEXT_SAMPLE_BYTES`.
pub fn sample_file(path: &Path, size: u64) -> Vec<u8> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let mut head = vec![0u8; TEXT_SAMPLE_BYTES];
    let head_len = match f.read(&mut head) {
        Ok(n) => n,
        Err(_) => return Vec::new(),
    };
    head.truncate(head_len);
    if size <= TEXT_SAMPLE_BYTES as u64 {
        return head;
    }
    let tail_start = size.saturating_sub(TEXT_SAMPLE_BYTES as u64);
    if f.seek(SeekFrom::Start(tail_start)).is_err() {
        return head;
    }
    let mut tail = vec![0u8; TEXT_SAMPLE_BYTES];
    let tail_len = f.read(&mut tail).unwrap_or(0);
    tail.truncate(tail_len);
    head.extend_from_slice(&tail);
    head
}

/// Fraction of printable characters in a sample; 0.0 means binary.
///
/// A NUL byte or invalid UTF-8 marks the sample binary outright.
pub fn printable_ratio(sample: &[u8]) -> f64 {
    if sample.is_empty() {
        return 1.0;
    }
    if sample.contains(&0u8) {
        return 0.0;
    }
    let text = match std::str::from_utf8(sample) {
        Ok(t) => t,
        Err(_) => return 0.0,
    };
    let mut printable = 0usize;
    let mut total = 0usize;
    for ch in text.chars() {
        total += 1;
        if matches!(ch, '\t' | '\n' | '\r') || !ch.is_control() {
            printable += 1;
        }
    }
    printable as f64 / total.max(1) as f64
}

/// Minified detection: `.min.` in the filename, or an average line length
/// above 300 in the sampled text.
pub fn is_minified(path: &Path, text_sample: &str) -> bool {
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(".min."))
    {
        return true;
    }
    if text_sample.is_empty() {
        return false;
    }
    let lines: Vec<&str> = text_sample.lines().collect();
    if lines.is_empty() {
        return text_sample.len() > 300;
    }
    let total: usize = lines.iter().map(|l| l.len()).sum();
    let avg = total as f64 / lines.len().max(1) as f64;
    avg > 300.0
}

/// Parse a human-readable size ("4mb", "512kb", "1_000_000") into bytes.
pub fn parse_size(value: Option<&str>, default: u64) -> u64 {
    let Some(raw) = value else { return default };
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return default;
    }
    let (num, mult) = if let Some(stripped) = s.strip_suffix("tb") {
        (stripped, 1u64 << 40)
    } else if let Some(stripped) = s.strip_suffix("gb") {
        (stripped, 1u64 << 30)
    } else if let Some(stripped) = s.strip_suffix("mb") {
        (stripped, 1u64 << 20)
    } else if let Some(stripped) = s.strip_suffix("kb") {
        (stripped, 1u64 << 10)
    } else {
        (s.as_str(), 1u64)
    };
    let cleaned: String = num.chars().filter(|c| *c != ',' && *c != '_').collect();
    match cleaned.trim().parse::<f64>() {
        Ok(v) if v >= 0.0 => (v * mult as f64) as u64,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn printable_ratio_flags_nul_as_binary() {
        assert_eq!(printable_ratio(b"abc\x00def"), 0.0);
        assert!(printable_ratio(b"plain text\n") > 0.9);
        assert_eq!(printable_ratio(b""), 1.0);
    }

    #[test]
    fn minified_by_name_or_line_length() {
        assert!(is_minified(&PathBuf::from("app.min.js"), "short"));
        let long_line = "x".repeat(400);
        assert!(is_minified(&PathBuf::from("bundle.js"), &long_line));
        assert!(!is_minified(
            &PathBuf::from("app.js"),
            "fn main() {}\nlet x = 1;\n"
        ));
    }

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size(Some("4mb"), 0), 4 << 20);
        assert_eq!(parse_size(Some("512kb"), 0), 512 << 10);
        assert_eq!(parse_size(Some("1_000"), 0), 1000);
        assert_eq!(parse_size(Some("bogus"), 77), 77);
        assert_eq!(parse_size(None, 42), 42);
    }

    #[test]
    fn sample_covers_head_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let mut content = vec![b'h'; TEXT_SAMPLE_BYTES];
        content.extend(vec![b'm'; 1000]);
        content.extend(vec![b't'; TEXT_SAMPLE_BYTES]);
        std::fs::write(&path, &content).unwrap();
        let sample = sample_file(&path, content.len() as u64);
        assert_eq!(sample.len(), TEXT_SAMPLE_BYTES * 2);
        assert_eq!(sample[0], b'h');
        assert_eq!(sample[sample.len() - 1], b't');
    }
}
