// Admin tools: `index_file`, `rescan`, `scan_once`.

use std::path::PathBuf;

use serde_json::{Value, json};

use super::{ToolServices, arg_bool, arg_str, error_response, json_response};

/// Index (or delete) one path immediately. Accepts an absolute path under
/// an allowed root, or a stored `root-*/rel` key.
pub fn execute_index_file(services: &ToolServices, args: &Value) -> Value {
    let Some(raw_path) = arg_str(args, "path") else {
        return error_response("INVALID_ARGS", "path is required", None);
    };

    let (root, abs_path) = if let Some((root_id, rel)) = crate::workspace::split_file_key(&raw_path)
    {
        match services
            .allowed_roots
            .iter()
            .find(|r| r.root_id == root_id)
        {
            Some(root) => (root.clone(), root.abs_path.join(rel)),
            None => {
                return error_response(
                    "ERR_ROOT_OUT_OF_SCOPE",
                    &format!("root '{root_id}' is not in scope"),
                    None,
                );
            }
        }
    } else {
        let abs = PathBuf::from(shellexpand::tilde(&raw_path).to_string());
        match services.root_for_abs_path(&abs) {
            Some(root) => (root, abs),
            None => {
                return error_response(
                    "ERR_ROOT_OUT_OF_SCOPE",
                    &format!("path is outside allowed roots: {raw_path}"),
                    None,
                );
            }
        }
    };

    match services.indexer.index_path(&root, &abs_path) {
        Ok(()) => json_response(json!({
            "path": raw_path,
            "root_id": root.root_id,
            "indexed": abs_path.exists(),
            "deleted": !abs_path.exists(),
        })),
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}

/// Full reconciliation sweep; `rescan` optionally purges legacy paths
/// first.
pub fn execute_rescan(services: &ToolServices, args: &Value) -> Value {
    let purge_legacy = arg_bool(args, "purge_legacy", false);
    let mut purged = 0usize;
    if purge_legacy {
        // Deletes are routed through the writer queue; legacy rows are
        // enumerated over a read connection first.
        let legacy: Vec<String> = match services.db.get_all_file_paths() {
            Ok(paths) => paths
                .into_iter()
                .filter(|p| crate::workspace::is_legacy_path(p))
                .collect(),
            Err(e) => return error_response("INTERNAL", &e.to_string(), None),
        };
        purged = legacy.len();
        for path in legacy {
            if let Err(e) = services
                .writer
                .enqueue(crate::database::writer::WriteTask::DeletePath(path))
            {
                return error_response("INTERNAL", &e.to_string(), None);
            }
        }
        if let Err(e) = services.writer.flush() {
            return error_response("INTERNAL", &e.to_string(), None);
        }
    }
    run_scan(services, json!({"purged_legacy": purged}))
}

pub fn execute_scan_once(services: &ToolServices, _args: &Value) -> Value {
    run_scan(services, json!({}))
}

fn run_scan(services: &ToolServices, mut extra: Value) -> Value {
    match services.indexer.scan_once() {
        Ok(submitted) => {
            let depths = services.indexer.queue_depths();
            extra["submitted"] = json!(submitted);
            extra["queue_depths"] = json!({
                "watcher": depths.watcher,
                "db_writer": depths.db_writer,
            });
            extra["total_files"] = json!(services.db.count_files().unwrap_or(0));
            json_response(extra)
        }
        Err(e) => error_response("INTERNAL", &e.to_string(), None),
    }
}
