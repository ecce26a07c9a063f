// Tool registry.
//
// Named tools dispatch to handlers over a shared service bundle. Tool
// arguments arrive as a JSON map: every recognized option is coerced with
// a default, unknown options are ignored for forward compatibility.
// Responses are `{content: [...]}` (plus optional `meta`) or a structured
// `{error: {code, message, hint?}, isError: true}`.

pub mod admin_tools;
pub mod file_tools;
pub mod graph_tools;
pub mod middleware;
pub mod search_tools;
pub mod snippet_tools;
pub mod status_tools;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::debug;

use crate::callgraph::CallGraphService;
use crate::config::Config;
use crate::database::SearchDatabase;
use crate::database::manager::StorageManager;
use crate::database::writer::WriterQueue;
use crate::indexer::Indexer;
use crate::search::SearchService;
use crate::watcher::WatchedRoot;
use crate::workspace::WorkspaceLayout;

pub use middleware::{AnalyticsQueue, PolicyEngine, PolicyMiddleware, ToolCallRecord, ToolMiddleware};

/// Everything a tool handler may need; constructed once at startup.
pub struct ToolServices {
    pub cfg: Config,
    pub layout: WorkspaceLayout,
    pub db: Arc<SearchDatabase>,
    pub writer: Arc<WriterQueue>,
    pub search: Arc<SearchService>,
    pub callgraph: Arc<CallGraphService>,
    pub indexer: Arc<Indexer>,
    pub allowed_roots: Vec<WatchedRoot>,
    pub analytics: Arc<AnalyticsQueue>,
    /// Process-wide manager, when running as the daemon (None in tests).
    pub manager: Option<&'static StorageManager>,
}

impl ToolServices {
    /// Clip requested root ids to the allowed set. Unknown ids are
    /// dropped; an empty request means "all allowed roots".
    pub fn resolve_root_ids(&self, requested: &[String]) -> Vec<String> {
        let allowed: Vec<String> = self
            .allowed_roots
            .iter()
            .map(|r| r.root_id.clone())
            .collect();
        if requested.is_empty() {
            return allowed;
        }
        requested
            .iter()
            .filter(|r| allowed.iter().any(|a| a == *r))
            .cloned()
            .collect()
    }

    /// Find the allowed root owning an absolute path.
    pub fn root_for_abs_path(&self, abs: &std::path::Path) -> Option<WatchedRoot> {
        self.allowed_roots
            .iter()
            .find(|r| abs.starts_with(&r.abs_path))
            .cloned()
    }
}

type Handler = fn(&ToolServices, &Value) -> Value;

/// All dispatchable tools, in listing order.
pub const TOOL_NAMES: &[&str] = &[
    "search",
    "search_symbols",
    "read_file",
    "list_files",
    "list_symbols",
    "get_callers",
    "get_implementations",
    "call_graph",
    "status",
    "doctor",
    "grep_and_read",
    "save_snippet",
    "get_snippet",
    "archive_context",
    "get_context",
    "dry_run_diff",
    "index_file",
    "rescan",
    "scan_once",
];

fn handler_for(name: &str) -> Option<Handler> {
    Some(match name {
        "search" => search_tools::execute_search,
        "search_symbols" => search_tools::execute_search_symbols,
        "grep_and_read" => search_tools::execute_grep_and_read,
        "read_file" => file_tools::execute_read_file,
        "list_files" => file_tools::execute_list_files,
        "list_symbols" => file_tools::execute_list_symbols,
        "dry_run_diff" => file_tools::execute_dry_run_diff,
        "get_callers" => graph_tools::execute_get_callers,
        "get_implementations" => graph_tools::execute_get_implementations,
        "call_graph" => graph_tools::execute_call_graph,
        "status" => status_tools::execute_status,
        "doctor" => status_tools::execute_doctor,
        "save_snippet" => snippet_tools::execute_save_snippet,
        "get_snippet" => snippet_tools::execute_get_snippet,
        "archive_context" => snippet_tools::execute_archive_context,
        "get_context" => snippet_tools::execute_get_context,
        "index_file" => admin_tools::execute_index_file,
        "rescan" => admin_tools::execute_rescan,
        "scan_once" => admin_tools::execute_scan_once,
        _ => return None,
    })
}

pub struct ToolRegistry {
    services: Arc<ToolServices>,
    middlewares: Vec<Arc<dyn ToolMiddleware>>,
}

impl ToolRegistry {
    pub fn new(services: Arc<ToolServices>, policy: Arc<PolicyEngine>) -> Self {
        let middlewares: Vec<Arc<dyn ToolMiddleware>> =
            vec![Arc::new(PolicyMiddleware { policy })];
        Self {
            services,
            middlewares,
        }
    }

    pub fn services(&self) -> &Arc<ToolServices> {
        &self.services
    }

    pub fn list_tools(&self) -> Vec<Value> {
        TOOL_NAMES
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "inputSchema": {"type": "object"},
                })
            })
            .collect()
    }

    /// Dispatch one tool call through the middleware chain.
    pub fn dispatch(&self, name: &str, args: &Value) -> Value {
        debug!("Dispatching tool: {}", name);
        let started = Instant::now();

        for mw in &self.middlewares {
            if let Some(short_circuit) = mw.before(name, args) {
                return short_circuit;
            }
        }

        let mut result = match handler_for(name) {
            Some(handler) => handler(&self.services, args),
            None => error_response(
                "INVALID_ARGS",
                &format!("unknown tool: {name}"),
                Some("see tools/list for available tools"),
            ),
        };

        let ok = !result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        for mw in self.middlewares.iter().rev() {
            result = if ok {
                mw.after(name, result)
            } else {
                mw.on_error(name, result)
            };
        }

        self.services.analytics.record(ToolCallRecord {
            tool: name.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            ok,
            ts: crate::utils::unix_timestamp(),
        });
        result
    }
}

// ----- response builders -----

pub fn text_response(text: impl Into<String>) -> Value {
    json!({
        "content": [{"type": "text", "text": text.into()}],
    })
}

pub fn json_response(payload: Value) -> Value {
    let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string());
    json!({
        "content": [{"type": "text", "text": text}],
        "meta": payload,
    })
}

pub fn error_response(code: &str, message: &str, hint: Option<&str>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(hint) = hint {
        error["hint"] = Value::String(hint.to_string());
    }
    json!({
        "error": error,
        "isError": true,
    })
}

// ----- typed argument coercion -----

pub fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn arg_usize(args: &Value, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64().map(|u| u as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(default)
}

pub fn arg_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key)
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(default)
}

pub fn arg_i64(args: &Value, key: &str, default: i64) -> i64 {
    args.get(key)
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(default)
}

pub fn arg_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key)
        .and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            _ => None,
        })
        .unwrap_or(default)
}

/// A list option accepts a JSON array or a comma-separated string.
pub fn arg_str_list(args: &Value, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_coercion_tolerates_types() {
        let args = json!({
            "limit": "25",
            "flag": "yes",
            "types": "py, ts , ",
            "other": [1, 2],
        });
        assert_eq!(arg_usize(&args, "limit", 10), 25);
        assert!(arg_bool(&args, "flag", false));
        assert_eq!(arg_str_list(&args, "types"), vec!["py", "ts"]);
        // Unknown/missing keys fall back to defaults.
        assert_eq!(arg_usize(&args, "missing", 7), 7);
        assert!(!arg_bool(&args, "missing", false));
    }

    #[test]
    fn error_response_shape() {
        let err = error_response("NOT_INDEXED", "path unknown", Some("run scan_once"));
        assert_eq!(err["isError"], true);
        assert_eq!(err["error"]["code"], "NOT_INDEXED");
        assert_eq!(err["error"]["hint"], "run scan_once");
    }
}
