// Tool middleware: policy checks around every call, plus an analytics
// queue of per-call records. Both are explicit services constructed at
// startup and injected through the registry; tests swap in their own.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{Value, json};

use crate::utils::security::redact;

/// Pre/post hooks around tool execution. `before` may short-circuit with
/// a response; `after` may rewrite the result; `on_error` may rewrite
/// error payloads.
pub trait ToolMiddleware: Send + Sync {
    fn before(&self, _tool: &str, _args: &Value) -> Option<Value> {
        None
    }
    fn after(&self, _tool: &str, result: Value) -> Value {
        result
    }
    fn on_error(&self, _tool: &str, error: Value) -> Value {
        error
    }
}

/// Allow/deny policy over tool names, with output redaction on the way
/// out.
pub struct PolicyEngine {
    denied_tools: HashSet<String>,
    redact_output: bool,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            denied_tools: HashSet::new(),
            redact_output: true,
        }
    }
}

impl PolicyEngine {
    pub fn with_denied(tools: impl IntoIterator<Item = String>) -> Self {
        Self {
            denied_tools: tools.into_iter().collect(),
            redact_output: true,
        }
    }

    pub fn check_pre_call(&self, tool: &str) -> Option<Value> {
        if self.denied_tools.contains(tool) {
            return Some(json!({
                "error": {
                    "code": "INVALID_ARGS",
                    "message": format!("tool '{tool}' is disabled by policy"),
                },
                "isError": true,
            }));
        }
        None
    }

    pub fn apply_post_call(&self, _tool: &str, mut result: Value) -> Value {
        if !self.redact_output {
            return result;
        }
        redact_content_text(&mut result);
        result
    }
}

/// Redact every text block in a `{content: [...]}` payload in place.
fn redact_content_text(result: &mut Value) {
    if let Some(content) = result.get_mut("content").and_then(|c| c.as_array_mut()) {
        for block in content {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                let redacted = redact(text);
                if redacted != text {
                    block["text"] = Value::String(redacted);
                }
            }
        }
    }
}

pub struct PolicyMiddleware {
    pub policy: std::sync::Arc<PolicyEngine>,
}

impl ToolMiddleware for PolicyMiddleware {
    fn before(&self, tool: &str, _args: &Value) -> Option<Value> {
        self.policy.check_pre_call(tool)
    }

    fn after(&self, tool: &str, result: Value) -> Value {
        self.policy.apply_post_call(tool, result)
    }
}

/// One analytics record per tool call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub duration_ms: u64,
    pub ok: bool,
    pub ts: i64,
}

/// Bounded in-memory analytics queue, drained by status/doctor.
pub struct AnalyticsQueue {
    records: Mutex<VecDeque<ToolCallRecord>>,
    capacity: usize,
}

impl Default for AnalyticsQueue {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl AnalyticsQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: ToolCallRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn drain(&self) -> Vec<ToolCallRecord> {
        self.records.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_tools_short_circuit() {
        let policy = PolicyEngine::with_denied(["doctor".to_string()]);
        let blocked = policy.check_pre_call("doctor").unwrap();
        assert_eq!(blocked["isError"], true);
        assert!(policy.check_pre_call("search").is_none());
    }

    #[test]
    fn post_call_redacts_content_blocks() {
        let policy = PolicyEngine::default();
        let result = json!({
            "content": [{"type": "text", "text": "api_key = \"sk-secret\""}]
        });
        let out = policy.apply_post_call("read_file", result);
        let text = out["content"][0]["text"].as_str().unwrap();
        assert!(!text.contains("sk-secret"));
        assert!(text.contains("***"));
    }

    #[test]
    fn analytics_queue_is_bounded() {
        let queue = AnalyticsQueue::new(2);
        for i in 0..5 {
            queue.record(ToolCallRecord {
                tool: format!("t{i}"),
                duration_ms: i,
                ok: true,
                ts: 0,
            });
        }
        let records = queue.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tool, "t3");
        assert!(queue.is_empty());
    }
}
