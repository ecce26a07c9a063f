// Snippet and context tools. Writes go through the writer queue (single
// writer discipline) and are flushed before the read-back so responses
// reflect durable state.

use serde_json::{Value, json};

use crate::database::types::{ContextRecord, SnippetRecord};
use crate::database::writer::WriteTask;
use crate::utils::unix_timestamp;

use super::{ToolServices, arg_i64, arg_str, error_response, json_response};

pub fn execute_save_snippet(services: &ToolServices, args: &Value) -> Value {
    let Some(tag) = arg_str(args, "tag") else {
        return error_response("INVALID_ARGS", "tag is required", None);
    };
    let path = arg_str(args, "path").unwrap_or_default();
    let start_line = arg_i64(args, "start_line", 0);
    let end_line = arg_i64(args, "end_line", 0);

    // Content may be given directly or sliced out of an indexed file.
    let content = match arg_str(args, "content") {
        Some(content) => content,
        None => {
            if path.is_empty() {
                return error_response(
                    "INVALID_ARGS",
                    "either content or path with line range is required",
                    None,
                );
            }
            match services.db.read_file(&path) {
                Ok(Some(file_content)) => {
                    let lines: Vec<&str> = file_content.lines().collect();
                    let start = (start_line.max(1) as usize - 1).min(lines.len());
                    let end = if end_line > 0 {
                        (end_line as usize).min(lines.len())
                    } else {
                        lines.len()
                    };
                    lines[start..end.max(start)].join("\n")
                }
                Ok(None) => {
                    return error_response(
                        "NOT_INDEXED",
                        &format!("path unknown to the store: {path}"),
                        None,
                    );
                }
                Err(e) => return error_response("INTERNAL", &e.to_string(), None),
            }
        }
    };

    let snippet = SnippetRecord {
        tag: tag.clone(),
        path,
        start_line,
        end_line,
        content,
        ..Default::default()
    };
    if let Err(e) = services.writer.enqueue(WriteTask::SaveSnippet(snippet)) {
        return error_response("INTERNAL", &e.to_string(), None);
    }
    if let Err(e) = services.writer.flush() {
        return error_response("INTERNAL", &e.to_string(), None);
    }
    match services.db.get_snippet(&tag) {
        Ok(Some(stored)) => json_response(json!({
            "tag": stored.tag,
            "id": stored.id,
            "version": stored.version,
            "path": stored.path,
        })),
        Ok(None) => error_response("INTERNAL", "snippet not visible after flush", None),
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

pub fn execute_get_snippet(services: &ToolServices, args: &Value) -> Value {
    let Some(tag) = arg_str(args, "tag") else {
        return error_response("INVALID_ARGS", "tag is required", None);
    };
    match services.db.get_snippet(&tag) {
        Ok(Some(snippet)) => json_response(json!({
            "tag": snippet.tag,
            "id": snippet.id,
            "path": snippet.path,
            "start_line": snippet.start_line,
            "end_line": snippet.end_line,
            "content": snippet.content,
            "version": snippet.version,
            "created_ts": snippet.created_ts,
        })),
        Ok(None) => error_response("NOT_INDEXED", &format!("no snippet tagged '{tag}'"), None),
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

pub fn execute_archive_context(services: &ToolServices, args: &Value) -> Value {
    let Some(tag) = arg_str(args, "tag") else {
        return error_response("INVALID_ARGS", "tag is required", None);
    };
    let Some(content) = arg_str(args, "content") else {
        return error_response("INVALID_ARGS", "content is required", None);
    };
    let context = ContextRecord {
        tag: tag.clone(),
        content,
        valid_from: arg_i64(args, "valid_from", 0),
        valid_until: arg_i64(args, "valid_until", 0),
        ..Default::default()
    };
    if let Err(e) = services.writer.enqueue(WriteTask::ArchiveContext(context)) {
        return error_response("INTERNAL", &e.to_string(), None);
    }
    if let Err(e) = services.writer.flush() {
        return error_response("INTERNAL", &e.to_string(), None);
    }
    json_response(json!({"tag": tag, "archived": true}))
}

pub fn execute_get_context(services: &ToolServices, args: &Value) -> Value {
    let Some(tag) = arg_str(args, "tag") else {
        return error_response("INVALID_ARGS", "tag is required", None);
    };
    match services.db.get_contexts(&tag, unix_timestamp()) {
        Ok(contexts) => {
            let rows: Vec<Value> = contexts
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "tag": c.tag,
                        "content": c.content,
                        "valid_from": c.valid_from,
                        "valid_until": c.valid_until,
                        "created_ts": c.created_ts,
                    })
                })
                .collect();
            let returned = rows.len();
            json_response(json!({"tag": tag, "contexts": rows, "returned": returned}))
        }
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}
