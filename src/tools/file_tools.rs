// File-surface tools: `read_file`, `list_files`, `list_symbols`,
// `dry_run_diff`.

use serde_json::{Value, json};

use super::{
    ToolServices, arg_bool, arg_str, arg_str_list, arg_usize, error_response, json_response,
};

pub fn execute_read_file(services: &ToolServices, args: &Value) -> Value {
    let Some(path) = arg_str(args, "path") else {
        return error_response("INVALID_ARGS", "path is required", None);
    };
    let allowed = services.resolve_root_ids(&[]);
    if let Some((root_id, _)) = crate::workspace::split_file_key(&path) {
        if !allowed.iter().any(|a| a == root_id) {
            return error_response(
                "ERR_ROOT_OUT_OF_SCOPE",
                &format!("path is outside allowed roots: {path}"),
                None,
            );
        }
    }
    match services.db.read_file(&path) {
        Ok(Some(content)) => json_response(json!({"path": path, "content": content})),
        Ok(None) => error_response(
            "NOT_INDEXED",
            &format!("path unknown to the store: {path}"),
            Some("run scan_once or index_file first"),
        ),
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

pub fn execute_list_files(services: &ToolServices, args: &Value) -> Value {
    let repo = arg_str(args, "repo");
    let path_pattern = arg_str(args, "path_pattern");
    let file_types = arg_str_list(args, "file_types");
    let include_hidden = arg_bool(args, "include_hidden", false);
    let limit = arg_usize(args, "limit", 100);
    let offset = arg_usize(args, "offset", 0);
    let root_ids = services.resolve_root_ids(&arg_str_list(args, "root_ids"));

    match services.db.list_files(
        repo.as_deref(),
        path_pattern.as_deref(),
        &file_types,
        include_hidden,
        limit,
        offset,
        &root_ids,
    ) {
        Ok((files, total, repos)) => {
            let repo_rows: Vec<Value> = repos
                .iter()
                .map(|(repo, count)| json!({"repo": repo, "file_count": count}))
                .collect();
            let returned = files.len();
            json_response(json!({
                "files": files,
                "total": total,
                "returned": returned,
                "offset": offset,
                "limit": limit.min(500),
                "repos": repo_rows,
                "include_hidden": include_hidden,
            }))
        }
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

pub fn execute_list_symbols(services: &ToolServices, args: &Value) -> Value {
    let Some(path) = arg_str(args, "path") else {
        return error_response("INVALID_ARGS", "path is required", None);
    };
    match services.db.list_symbols(&path) {
        Ok(symbols) => {
            if symbols.is_empty() && services.db.read_file(&path).ok().flatten().is_none() {
                return error_response(
                    "NOT_INDEXED",
                    &format!("path unknown to the store: {path}"),
                    None,
                );
            }
            let rows: Vec<Value> = symbols
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "qualname": s.qualname,
                        "kind": s.kind,
                        "line": s.line,
                        "end_line": s.end_line,
                        "content": s.snippet,
                        "docstring": s.docstring,
                        "symbol_id": s.symbol_id,
                    })
                })
                .collect();
            json_response(json!({"path": path, "symbols": rows}))
        }
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

/// Compare proposed content against the stored copy without writing
/// anything. Reports added/removed line counts and a compact hunk list.
pub fn execute_dry_run_diff(services: &ToolServices, args: &Value) -> Value {
    let Some(path) = arg_str(args, "path") else {
        return error_response("INVALID_ARGS", "path is required", None);
    };
    let Some(new_content) = arg_str(args, "content").or_else(|| arg_str(args, "new_content"))
    else {
        return error_response("INVALID_ARGS", "content is required", None);
    };
    let stored = match services.db.read_file(&path) {
        Ok(Some(content)) => content,
        Ok(None) => {
            return error_response(
                "NOT_INDEXED",
                &format!("path unknown to the store: {path}"),
                None,
            );
        }
        Err(e) => return error_response("INTERNAL", &e.to_string(), None),
    };

    let (added, removed, hunks) = line_diff(&stored, &new_content);
    json_response(json!({
        "path": path,
        "added": added,
        "removed": removed,
        "unchanged": stored.lines().count().saturating_sub(removed),
        "hunks": hunks,
    }))
}

/// Minimal line diff: strip the common prefix/suffix, report the middle
/// as one replace hunk. Cheap and stable, which is all a dry run needs.
fn line_diff(old: &str, new: &str) -> (usize, usize, Vec<Value>) {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed = old_lines.len() - prefix - suffix;
    let added = new_lines.len() - prefix - suffix;
    let mut hunks = Vec::new();
    if removed > 0 || added > 0 {
        hunks.push(json!({
            "start_line": prefix + 1,
            "removed": removed,
            "added": added,
            "preview_old": old_lines[prefix..prefix + removed.min(5)].join("\n"),
            "preview_new": new_lines[prefix..prefix + added.min(5)].join("\n"),
        }));
    }
    (added, removed, hunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_diff_identical_is_empty() {
        let (added, removed, hunks) = line_diff("a\nb\nc", "a\nb\nc");
        assert_eq!((added, removed), (0, 0));
        assert!(hunks.is_empty());
    }

    #[test]
    fn line_diff_reports_middle_change() {
        let (added, removed, hunks) = line_diff("a\nold\nc", "a\nnew1\nnew2\nc");
        assert_eq!(removed, 1);
        assert_eq!(added, 2);
        assert_eq!(hunks[0]["start_line"], 2);
    }
}
