// Regex-backed language parsers.
//
// Each parser is a pure function over `(path, text)` producing symbol and
// relation rows. Precision is deliberately the "regex tier": definitions
// come from line anchors, nesting from indentation or brace depth, and
// call edges from identifier-call sites inside a definition's span. The
// call-graph service reports this tier through its precision hint.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// A parsed definition before storage enrichment.
#[derive(Debug, Clone)]
pub struct RawSymbol {
    pub name: String,
    pub qualname: String,
    pub kind: String,
    pub line: i64,
    pub end_line: i64,
    pub content: String,
    pub parent_name: String,
    pub docstring: String,
}

/// A parsed reference edge (`from_symbol` calls/implements/extends
/// `to_symbol`).
#[derive(Debug, Clone)]
pub struct RawRelation {
    pub from_symbol: String,
    pub to_symbol: String,
    pub rel_type: String,
    pub line: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    Rust,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "py" => Language::Python,
            "js" | "jsx" | "mjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "kt" | "kts" => Language::Kotlin,
            "rs" => Language::Rust,
            _ => Language::Unknown,
        }
    }

    /// Shebang sniff for extensionless scripts.
    pub fn from_shebang(first_line: &str) -> Self {
        if !first_line.starts_with("#!") {
            return Language::Unknown;
        }
        if first_line.contains("python") {
            Language::Python
        } else if first_line.contains("node") {
            Language::JavaScript
        } else {
            Language::Unknown
        }
    }
}

struct DefPattern {
    kind: &'static str,
    regex: Regex,
}

fn def_patterns(language: Language) -> Vec<DefPattern> {
    let build = |kind: &'static str, pattern: &str| DefPattern {
        kind,
        regex: Regex::new(pattern).expect("definition pattern"),
    };
    match language {
        Language::Python => vec![
            build("class", r"^(\s*)class\s+([A-Za-z_][A-Za-z0-9_]*)"),
            build("function", r"^(\s*)(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)"),
        ],
        Language::JavaScript | Language::TypeScript => vec![
            build("class", r"^(\s*)(?:export\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)"),
            build(
                "function",
                r"^(\s*)(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)",
            ),
            build(
                "function",
                r"^(\s*)(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=\s*(?:async\s*)?\(",
            ),
            build("interface", r"^(\s*)(?:export\s+)?interface\s+([A-Za-z_$][A-Za-z0-9_$]*)"),
        ],
        Language::Go => vec![
            build("function", r"^(\s*)func\s+(?:\([^)]*\)\s+)?([A-Za-z_][A-Za-z0-9_]*)"),
            build("type", r"^(\s*)type\s+([A-Za-z_][A-Za-z0-9_]*)\s+(?:struct|interface)"),
        ],
        Language::Java | Language::Kotlin => vec![
            build(
                "class",
                r"^(\s*)(?:public\s+|private\s+|protected\s+|abstract\s+|final\s+|data\s+|open\s+)*(?:class|interface|enum|object)\s+([A-Za-z_][A-Za-z0-9_]*)",
            ),
            build(
                "method",
                r"^(\s*)(?:public\s+|private\s+|protected\s+|static\s+|final\s+|override\s+|suspend\s+)*(?:fun\s+|[A-Za-z_<>\[\]]+\s+)([a-z][A-Za-z0-9_]*)\s*\(",
            ),
        ],
        Language::Rust => vec![
            build(
                "function",
                r"^(\s*)(?:pub(?:\([a-z]+\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)",
            ),
            build("struct", r"^(\s*)(?:pub(?:\([a-z]+\))?\s+)?struct\s+([A-Za-z_][A-Za-z0-9_]*)"),
            build("enum", r"^(\s*)(?:pub(?:\([a-z]+\))?\s+)?enum\s+([A-Za-z_][A-Za-z0-9_]*)"),
            build("trait", r"^(\s*)(?:pub(?:\([a-z]+\))?\s+)?trait\s+([A-Za-z_][A-Za-z0-9_]*)"),
        ],
        Language::Unknown => Vec::new(),
    }
}

static CALL_SITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("call site pattern"));

static EXTENDS_PY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*class\s+[A-Za-z_][A-Za-z0-9_]*\s*\(\s*([A-Za-z_][A-Za-z0-9_.]*)")
        .expect("python extends pattern")
});

static EXTENDS_BRACED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bclass\s+[A-Za-z_$][A-Za-z0-9_$]*\s+extends\s+([A-Za-z_$][A-Za-z0-9_$.]*)")
        .expect("extends pattern")
});

static IMPLEMENTS_BRACED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bimplements\s+([A-Za-z_$][A-Za-z0-9_$.]*)").expect("implements pattern")
});

const CALL_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "match", "return", "def", "fn", "func", "function", "class",
    "catch", "with", "print", "println", "assert", "super", "new", "typeof", "sizeof", "await",
    "yield", "in", "not", "and", "or", "else", "elif", "try", "raise", "throw", "len", "isinstance",
];

/// Parse one file into symbols plus relations.
pub fn parse_text(language: Language, text: &str) -> (Vec<RawSymbol>, Vec<RawRelation>) {
    let patterns = def_patterns(language);
    if patterns.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let lines: Vec<&str> = text.lines().collect();

    // Pass 1: definitions with their indentation.
    let mut defs: Vec<(usize, usize, RawSymbol)> = Vec::new(); // (line_idx, indent, symbol)
    for (idx, line) in lines.iter().enumerate() {
        for pattern in &patterns {
            if let Some(caps) = pattern.regex.captures(line) {
                let indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
                let name = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                defs.push((
                    idx,
                    indent,
                    RawSymbol {
                        name,
                        qualname: String::new(),
                        kind: pattern.kind.to_string(),
                        line: (idx + 1) as i64,
                        end_line: 0,
                        content: line.trim_end().to_string(),
                        parent_name: String::new(),
                        docstring: String::new(),
                    },
                ));
                break;
            }
        }
    }

    // Pass 2: spans and nesting. A definition ends just before the next
    // definition at the same or lower indentation.
    let total_lines = lines.len();
    for i in 0..defs.len() {
        let (start_idx, indent, _) = (defs[i].0, defs[i].1, ());
        let mut end_idx = total_lines;
        for (next_idx, next_indent, _) in defs.iter().skip(i + 1) {
            if *next_indent <= indent {
                end_idx = *next_idx;
                break;
            }
        }
        defs[i].2.end_line = end_idx as i64;

        let parent = defs[..i]
            .iter()
            .rev()
            .find(|(p_idx, p_indent, sym)| {
                *p_indent < indent && *p_idx < start_idx && sym.end_line as usize >= start_idx
            })
            .map(|(_, _, sym)| sym.name.clone());
        if let Some(parent) = parent {
            defs[i].2.parent_name = parent.clone();
            defs[i].2.qualname = format!("{parent}.{}", defs[i].2.name);
        } else {
            defs[i].2.qualname = defs[i].2.name.clone();
        }

        if language == Language::Python {
            defs[i].2.docstring = python_docstring(&lines, start_idx);
        }
    }

    // Pass 3: relations. Call sites inside a definition's span attribute
    // to the innermost enclosing definition.
    let def_names: HashSet<&str> = defs.iter().map(|(_, _, s)| s.name.as_str()).collect();
    let def_lines: HashSet<usize> = defs.iter().map(|(idx, _, _)| *idx).collect();
    let mut relations: Vec<RawRelation> = Vec::new();
    let mut seen_edges: HashSet<(String, String, &'static str)> = HashSet::new();

    for (idx, line) in lines.iter().enumerate() {
        // Definition headers would read as calls of themselves.
        if def_lines.contains(&idx) {
            continue;
        }
        let enclosing = defs
            .iter()
            .filter(|(d_idx, _, sym)| *d_idx < idx && (sym.end_line as usize) > idx)
            .max_by_key(|(d_idx, _, _)| *d_idx)
            .map(|(_, _, sym)| sym.name.clone());
        let Some(from) = enclosing else { continue };

        for caps in CALL_SITE.captures_iter(line) {
            let callee = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if callee.is_empty()
                || callee == from
                || CALL_KEYWORDS.contains(&callee)
                || (!def_names.contains(callee) && callee.len() < 3)
            {
                continue;
            }
            let key = (from.clone(), callee.to_string(), "calls");
            if seen_edges.insert(key) {
                relations.push(RawRelation {
                    from_symbol: from.clone(),
                    to_symbol: callee.to_string(),
                    rel_type: "calls".to_string(),
                    line: (idx + 1) as i64,
                });
            }
        }
    }

    // Inheritance edges from class headers.
    for (idx, line) in lines.iter().enumerate() {
        let class_name = defs
            .iter()
            .find(|(d_idx, _, sym)| *d_idx == idx && sym.kind == "class")
            .map(|(_, _, sym)| sym.name.clone());
        let Some(class_name) = class_name else { continue };

        if language == Language::Python {
            if let Some(caps) = EXTENDS_PY.captures(line) {
                let base = caps[1].to_string();
                if base != "object" {
                    relations.push(RawRelation {
                        from_symbol: class_name.clone(),
                        to_symbol: base,
                        rel_type: "extends".to_string(),
                        line: (idx + 1) as i64,
                    });
                }
            }
        } else {
            if let Some(caps) = EXTENDS_BRACED.captures(line) {
                relations.push(RawRelation {
                    from_symbol: class_name.clone(),
                    to_symbol: caps[1].to_string(),
                    rel_type: "extends".to_string(),
                    line: (idx + 1) as i64,
                });
            }
            if let Some(caps) = IMPLEMENTS_BRACED.captures(line) {
                relations.push(RawRelation {
                    from_symbol: class_name.clone(),
                    to_symbol: caps[1].to_string(),
                    rel_type: "implements".to_string(),
                    line: (idx + 1) as i64,
                });
            }
        }
    }

    let symbols = defs.into_iter().map(|(_, _, s)| s).collect();
    (symbols, relations)
}

fn python_docstring(lines: &[&str], def_idx: usize) -> String {
    let Some(next) = lines.get(def_idx + 1) else {
        return String::new();
    };
    let trimmed = next.trim();
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = trimmed.strip_prefix(quote) {
            if let Some(inner) = rest.strip_suffix(quote) {
                if !inner.is_empty() || rest.len() >= quote.len() {
                    return inner.to_string();
                }
            }
            // Multi-line docstring: collect until the closing quote.
            let mut parts = vec![rest.to_string()];
            for line in lines.iter().skip(def_idx + 2).take(50) {
                if let Some(end) = line.trim().strip_suffix(quote) {
                    parts.push(end.trim().to_string());
                    return parts.join(" ").trim().to_string();
                }
                parts.push(line.trim().to_string());
            }
            return String::new();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_defs_and_nesting() {
        let src = "class Greeter:\n    \"\"\"Says hello.\"\"\"\n    def greet(self):\n        helper()\n\ndef helper():\n    pass\n";
        let (symbols, relations) = parse_text(Language::Python, src);
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Greeter", "greet", "helper"]);

        let greet = symbols.iter().find(|s| s.name == "greet").unwrap();
        assert_eq!(greet.parent_name, "Greeter");
        assert_eq!(greet.qualname, "Greeter.greet");

        let greeter = symbols.iter().find(|s| s.name == "Greeter").unwrap();
        assert_eq!(greeter.docstring, "Says hello.");

        assert!(relations
            .iter()
            .any(|r| r.from_symbol == "greet" && r.to_symbol == "helper" && r.rel_type == "calls"));
    }

    #[test]
    fn python_extends_edge() {
        let src = "class Base:\n    pass\n\nclass Child(Base):\n    pass\n";
        let (_, relations) = parse_text(Language::Python, src);
        assert!(relations
            .iter()
            .any(|r| r.from_symbol == "Child" && r.to_symbol == "Base" && r.rel_type == "extends"));
    }

    #[test]
    fn typescript_functions_and_implements() {
        let src = "export class AuthService implements TokenProvider {\n}\nexport function login(user: string) {\n  validate(user)\n}\nconst logout = async () => {}\n";
        let (symbols, relations) = parse_text(Language::TypeScript, src);
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"AuthService"));
        assert!(names.contains(&"login"));
        assert!(relations.iter().any(|r| {
            r.from_symbol == "AuthService"
                && r.to_symbol == "TokenProvider"
                && r.rel_type == "implements"
        }));
        assert!(relations
            .iter()
            .any(|r| r.from_symbol == "login" && r.to_symbol == "validate"));
    }

    #[test]
    fn rust_items() {
        let src = "pub struct Engine;\n\nimpl Engine {\n}\n\npub fn start() {\n    run_loop();\n}\n";
        let (symbols, relations) = parse_text(Language::Rust, src);
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"Engine"));
        assert!(names.contains(&"start"));
        assert!(relations
            .iter()
            .any(|r| r.from_symbol == "start" && r.to_symbol == "run_loop"));
    }

    #[test]
    fn unknown_language_yields_nothing() {
        let (symbols, relations) = parse_text(Language::Unknown, "whatever content");
        assert!(symbols.is_empty());
        assert!(relations.is_empty());
    }

    #[test]
    fn shebang_detection() {
        assert_eq!(Language::from_shebang("#!/usr/bin/env python3"), Language::Python);
        assert_eq!(Language::from_shebang("#!/usr/bin/env node"), Language::JavaScript);
        assert_eq!(Language::from_shebang("plain text"), Language::Unknown);
    }
}
