// Status and doctor tools.

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::{ToolServices, arg_bool, json_response};

/// RFC 3339 rendering for Unix-second timestamps; zero/negative (never
/// happened yet) renders as null.
fn rfc3339(ts: i64) -> Value {
    if ts <= 0 {
        return Value::Null;
    }
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| Value::String(t.to_rfc3339()))
        .unwrap_or(Value::Null)
}

pub fn execute_status(services: &ToolServices, args: &Value) -> Value {
    let details = arg_bool(args, "details", false);
    let status = &services.indexer.status;
    let engine_status = services.search.engine().status();
    let (dlq_total, dlq_high) = services.db.count_failed_tasks().unwrap_or((0, 0));
    let depths = services.indexer.queue_depths();
    let index = services.db.index_status().unwrap_or_default();
    let last_scan_ts = status.last_scan_ts.load(Ordering::Acquire);
    let last_commit_ts = services.writer.last_commit_ts();

    let mut payload = json!({
        "index_ready": status.index_ready.load(Ordering::Acquire),
        "last_scan_ts": last_scan_ts,
        "last_scan_at": rfc3339(last_scan_ts),
        "last_commit_ts": last_commit_ts,
        "last_commit_at": rfc3339(last_commit_ts),
        "scanned_files": status.scanned_files.load(Ordering::Relaxed),
        "indexed_files": index.total_files,
        "errors": status.errors.load(Ordering::Relaxed),
        "fts_enabled": services.db.fts_enabled(),
        "workspace_root": services.layout.root.to_string_lossy(),
        "server_version": env!("CARGO_PKG_VERSION"),
        "db_size_bytes": index.db_size_bytes,
        "engine_mode": engine_status.engine_mode.clone(),
        "engine_ready": engine_status.engine_ready,
        "engine_reason": engine_status.reason.clone(),
        "engine_hint": engine_status.hint.clone(),
        "index_docs": engine_status.doc_count,
        "index_size_bytes": engine_status.index_size_bytes,
        "index_version": engine_status.index_version,
        "engine_tokenizer_ready": engine_status.tokenizer_ready,
        "engine_tokenizer_note": engine_status.tokenizer_note.clone(),
        "dlq_failed_total": dlq_total,
        "dlq_failed_high": dlq_high,
        "writer_running": services.writer.is_running(),
        "queue_depths": {
            "watcher": depths.watcher,
            "db_writer": depths.db_writer,
            "load_ratio": depths.load_ratio,
        },
        "has_legacy_paths": services.db.has_legacy_paths(),
        "config": {
            "include_ext": services.cfg.include_ext.clone(),
            "exclude_dirs": services.cfg.exclude_dirs.clone(),
            "exclude_globs": services.cfg.exclude_globs.clone(),
            "max_file_bytes": services.cfg.max_file_bytes,
            "port": services.cfg.port,
        },
    });

    if let Some(reason) = services.writer.fatal_reason() {
        payload["writer_fatal_reason"] = Value::String(reason);
    }
    if let Some(manager) = services.manager {
        if let Some(reason) = manager.switch_guard_reason() {
            payload["switch_guard"] = Value::String(reason);
        }
    }

    let mut warnings: Vec<String> = Vec::new();
    if engine_status.engine_mode == "embedded" && !engine_status.engine_ready {
        warnings.push(format!(
            "embedded engine not ready: {}",
            if engine_status.reason.is_empty() {
                "unknown"
            } else {
                &engine_status.reason
            }
        ));
    }
    if dlq_high > 0 {
        warnings.push(format!("{dlq_high} dead-lettered task(s); see doctor"));
    }
    // Large workspaces on the trigger-based engine benefit from the
    // embedded one.
    if engine_status.engine_mode == "sqlite" && index.total_files >= 10_000 {
        warnings.push(format!(
            "engine suggestion: large workspace ({} files) on sqlite; consider DECKARD_ENGINE_MODE=embedded",
            index.total_files
        ));
    }
    if !warnings.is_empty() {
        payload["warnings"] = json!(warnings);
    }

    if details {
        let root_ids = services.resolve_root_ids(&[]);
        let repo_stats = services.db.get_repo_stats(&root_ids);
        payload["repo_stats"] = json!(repo_stats);
        let recent: Vec<Value> = services
            .analytics
            .drain()
            .into_iter()
            .map(|r| json!({"tool": r.tool, "duration_ms": r.duration_ms, "ok": r.ok}))
            .collect();
        payload["recent_tool_calls"] = json!(recent);
    }

    json_response(payload)
}

pub fn execute_doctor(services: &ToolServices, _args: &Value) -> Value {
    let mut checks: Vec<Value> = Vec::new();
    let mut check = |name: &str, ok: bool, note: String| {
        checks.push(json!({"check": name, "ok": ok, "note": note}));
    };

    match services.db.count_files() {
        Ok(count) => check("database", true, format!("{count} files indexed")),
        Err(e) => check("database", false, e.to_string()),
    }
    check(
        "fts5",
        services.db.fts_enabled(),
        if services.db.fts_enabled() {
            "FTS5 available".to_string()
        } else {
            "FTS5 missing; LIKE fallback only".to_string()
        },
    );

    let engine_status = services.search.engine().status();
    check(
        "engine",
        engine_status.engine_ready,
        format!(
            "mode={} docs={} version={}",
            engine_status.engine_mode, engine_status.doc_count, engine_status.index_version
        ),
    );

    check(
        "writer",
        services.writer.is_running(),
        services
            .writer
            .fatal_reason()
            .unwrap_or_else(|| "writer thread healthy".to_string()),
    );

    let (dlq_total, dlq_high) = services.db.count_failed_tasks().unwrap_or((0, 0));
    check(
        "dead_letters",
        dlq_high == 0,
        format!("{dlq_total} failed task(s), {dlq_high} dead-lettered"),
    );
    let failed = services.db.list_failed_tasks(10).unwrap_or_default();
    let failed_rows: Vec<Value> = failed
        .iter()
        .map(|f| {
            json!({
                "task_kind": f.task_kind,
                "path": f.path,
                "attempts": f.attempts,
                "last_error_code": f.last_error_code,
            })
        })
        .collect();

    check(
        "data_dir",
        services.layout.data_dir().is_dir(),
        services.layout.data_dir().to_string_lossy().into_owned(),
    );
    check(
        "legacy_paths",
        !services.db.has_legacy_paths(),
        if services.db.has_legacy_paths() {
            "legacy non root-scoped paths present; consider purge".to_string()
        } else {
            "all paths root-scoped".to_string()
        },
    );

    let healthy = checks
        .iter()
        .all(|c| c["ok"].as_bool().unwrap_or(false));
    json_response(json!({
        "healthy": healthy,
        "checks": checks,
        "failed_tasks": failed_rows,
    }))
}
