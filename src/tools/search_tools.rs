// Search-facing tools: `search`, `search_symbols`, `grep_and_read`.

use serde_json::{Value, json};

use crate::engine::EngineError;
use crate::search::{SearchOptions, TotalMode};

use super::{
    ToolServices, arg_bool, arg_str, arg_str_list, arg_usize, error_response, json_response,
};

fn options_from_args(services: &ToolServices, args: &Value) -> SearchOptions {
    let requested_roots = arg_str_list(args, "root_ids");
    SearchOptions {
        query: arg_str(args, "query")
            .or_else(|| arg_str(args, "q"))
            .unwrap_or_default(),
        repo: arg_str(args, "repo"),
        limit: arg_usize(args, "limit", 20).min(200),
        offset: arg_usize(args, "offset", 0),
        snippet_lines: arg_usize(args, "snippet_lines", 5).min(50),
        file_types: arg_str_list(args, "file_types"),
        path_pattern: arg_str(args, "path_pattern"),
        exclude_patterns: arg_str_list(args, "exclude_patterns"),
        recency_boost: arg_bool(args, "recency_boost", false),
        use_regex: arg_bool(args, "use_regex", false),
        case_sensitive: arg_bool(args, "case_sensitive", false),
        root_ids: services.resolve_root_ids(&requested_roots),
        total_mode: match arg_str(args, "total_mode").as_deref() {
            Some("approx") => TotalMode::Approx,
            _ => TotalMode::Exact,
        },
    }
}

pub fn execute_search(services: &ToolServices, args: &Value) -> Value {
    let opts = options_from_args(services, args);
    if opts.query.trim().is_empty() {
        return error_response("INVALID_ARGS", "query is required", None);
    }

    match services.search.search_v2(&opts) {
        Ok((hits, meta)) => {
            if let Some(regex_error) = &meta.regex_error {
                return error_response(
                    "INVALID_ARGS",
                    &format!("invalid regex: {regex_error}"),
                    Some("escape special characters or disable use_regex"),
                );
            }
            // Large result sets get their snippets summarized so responses
            // stay inside the caller's context budget.
            let (hits, context_truncated) =
                crate::utils::context::ContextBudgetEngine::default().filter_hits(hits);
            json_response(json!({
                "hits": hits,
                "total": meta.total,
                "total_mode": meta.total_mode,
                "fallback_used": meta.fallback_used,
                "total_scanned": meta.total_scanned,
                "intent": meta.intent,
                "context_truncated": context_truncated,
            }))
        }
        Err(e) => engine_aware_error(&e),
    }
}

pub fn execute_search_symbols(services: &ToolServices, args: &Value) -> Value {
    let Some(query) = arg_str(args, "query").or_else(|| arg_str(args, "q")) else {
        return error_response("INVALID_ARGS", "query is required", None);
    };
    let repo = arg_str(args, "repo");
    let limit = arg_usize(args, "limit", 20).min(100);
    let root_ids = services.resolve_root_ids(&arg_str_list(args, "root_ids"));

    match services
        .db
        .search_symbols(&query, repo.as_deref(), limit, &root_ids)
    {
        Ok(hits) => {
            let rows: Vec<Value> = hits
                .iter()
                .map(|h| {
                    json!({
                        "path": h.path,
                        "repo": h.repo,
                        "name": h.name,
                        "qualname": h.qualname,
                        "kind": h.kind,
                        "line": h.line,
                        "end_line": h.end_line,
                        "snippet": h.snippet,
                        "docstring": h.docstring,
                        "symbol_id": h.symbol_id,
                    })
                })
                .collect();
            let returned = rows.len();
            json_response(json!({"symbols": rows, "returned": returned}))
        }
        Err(e) => error_response("INVALID_ARGS", &e.to_string(), None),
    }
}

/// Search, then read context around the first match of the top hit.
pub fn execute_grep_and_read(services: &ToolServices, args: &Value) -> Value {
    let mut opts = options_from_args(services, args);
    if opts.query.trim().is_empty() {
        return error_response("INVALID_ARGS", "query is required", None);
    }
    opts.limit = opts.limit.min(5);
    let context_lines = arg_usize(args, "context_lines", 20).min(200);

    let (hits, _) = match services.search.search_v2(&opts) {
        Ok(out) => out,
        Err(e) => return engine_aware_error(&e),
    };
    let Some(top_path) = hits.first().map(|h| h.path.clone()) else {
        return json_response(json!({"hits": [], "content": Value::Null}));
    };

    let content = match services.db.read_file(&top_path) {
        Ok(Some(content)) => content,
        Ok(None) => {
            return error_response(
                "NOT_INDEXED",
                &format!("top hit vanished from store: {top_path}"),
                None,
            );
        }
        Err(e) => return error_response("INVALID_ARGS", &e.to_string(), None),
    };

    // Window the content around the first matching line.
    let lines: Vec<&str> = content.lines().collect();
    let needle = opts.query.to_lowercase();
    let center = lines
        .iter()
        .position(|l| l.to_lowercase().contains(&needle))
        .unwrap_or(0);
    let start = center.saturating_sub(context_lines);
    let end = (center + context_lines + 1).min(lines.len());
    let window: Vec<String> = lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, l)| format!("L{}: {}", start + i + 1, l))
        .collect();

    json_response(json!({
        "hits": hits,
        "path": top_path,
        "window_start": start + 1,
        "content": window.join("\n"),
    }))
}

/// Map engine lifecycle faults to their stable codes; everything else is
/// an internal error.
pub fn engine_aware_error(error: &anyhow::Error) -> Value {
    for cause in error.chain() {
        if let Some(engine_err) = cause.downcast_ref::<EngineError>() {
            let hint = match engine_err {
                EngineError::NotInstalled(_) => {
                    Some("set DECKARD_ENGINE_AUTO_INSTALL=1 or run the engine install command")
                }
                _ => None,
            };
            return error_response(engine_err.code(), &engine_err.to_string(), hint);
        }
    }
    error_response("INTERNAL", &error.to_string(), None)
}
