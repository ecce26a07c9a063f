// Graph tools: `get_callers`, `get_implementations`, `call_graph`.

use serde_json::{Value, json};

use crate::callgraph::{CallGraphRequest, SortBy};

use super::{
    ToolServices, arg_str, arg_str_list, arg_u64, arg_usize, error_response, json_response,
};

pub fn execute_get_callers(services: &ToolServices, args: &Value) -> Value {
    let Some(symbol) = arg_str(args, "symbol").or_else(|| arg_str(args, "name")) else {
        return error_response("INVALID_ARGS", "symbol is required", None);
    };
    let path = arg_str(args, "path");
    let symbol_id = arg_str(args, "symbol_id");
    let root_ids = services.resolve_root_ids(&arg_str_list(args, "root_ids"));

    match services
        .db
        .callers_for(&symbol, path.as_deref(), symbol_id.as_deref(), &root_ids)
    {
        Ok(callers) => {
            let rows: Vec<Value> = callers
                .iter()
                .map(|c| {
                    json!({
                        "path": c.path,
                        "symbol": c.symbol,
                        "symbol_id": c.symbol_id,
                        "line": c.line,
                        "rel_type": c.rel_type,
                    })
                })
                .collect();
            let returned = rows.len();
            json_response(json!({"symbol": symbol, "callers": rows, "returned": returned}))
        }
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

/// Incoming `implements`/`extends` edges for a type name.
pub fn execute_get_implementations(services: &ToolServices, args: &Value) -> Value {
    let Some(symbol) = arg_str(args, "symbol").or_else(|| arg_str(args, "name")) else {
        return error_response("INVALID_ARGS", "symbol is required", None);
    };
    let path = arg_str(args, "path");
    let root_ids = services.resolve_root_ids(&arg_str_list(args, "root_ids"));

    match services
        .db
        .callers_for(&symbol, path.as_deref(), None, &root_ids)
    {
        Ok(edges) => {
            let rows: Vec<Value> = edges
                .iter()
                .filter(|e| e.rel_type == "implements" || e.rel_type == "extends")
                .map(|e| {
                    json!({
                        "path": e.path,
                        "symbol": e.symbol,
                        "symbol_id": e.symbol_id,
                        "line": e.line,
                        "rel_type": e.rel_type,
                    })
                })
                .collect();
            let returned = rows.len();
            json_response(json!({
                "symbol": symbol,
                "implementations": rows,
                "returned": returned,
            }))
        }
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

pub fn execute_call_graph(services: &ToolServices, args: &Value) -> Value {
    let symbol = arg_str(args, "symbol")
        .or_else(|| arg_str(args, "name"))
        .unwrap_or_default();
    let symbol_id = arg_str(args, "symbol_id").or_else(|| arg_str(args, "sid"));
    if symbol.trim().is_empty() && symbol_id.is_none() {
        return error_response("INVALID_ARGS", "symbol is required", None);
    }

    let depth = arg_usize(args, "depth", 2);
    let request = CallGraphRequest {
        symbol,
        symbol_id,
        path: arg_str(args, "path"),
        repo: arg_str(args, "repo"),
        root_ids: services.resolve_root_ids(&arg_str_list(args, "root_ids")),
        depth,
        max_nodes: arg_usize(args, "max_nodes", 400),
        max_edges: arg_usize(args, "max_edges", 1200),
        max_depth: arg_usize(args, "max_depth", depth),
        max_time_ms: arg_u64(args, "max_time_ms", 2000),
        include_paths: {
            let mut v = arg_str_list(args, "include_paths");
            v.extend(arg_str_list(args, "include_path"));
            v
        },
        exclude_paths: {
            let mut v = arg_str_list(args, "exclude_paths");
            v.extend(arg_str_list(args, "exclude_path"));
            v
        },
        sort: match arg_str(args, "sort")
            .or_else(|| arg_str(args, "sort_by"))
            .as_deref()
        {
            Some("name") => SortBy::Name,
            _ => SortBy::Line,
        },
    };

    match services.callgraph.build(&request) {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(payload) => json_response(payload),
            Err(e) => error_response("INTERNAL", &e.to_string(), None),
        },
        Err(e) => error_response("INVALID_ARGS", &e.to_string(), None),
    }
}
