// IPC surface: JSON-RPC 2.0 over stdio or a local TCP socket.
//
// Methods: initialize, tools/list, tools/call, roots/list, ping,
// sari/identify. Tool calls run on the blocking pool; the protocol loop
// itself stays non-blocking. stdout carries only protocol frames — all
// logging goes to the rolling file appender.

pub mod framing;

use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::tools::ToolRegistry;

use framing::{Framing, read_message, write_message};

pub struct RpcServer {
    registry: Arc<ToolRegistry>,
}

impl RpcServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Serve a single stdio session (the editor-spawned mode).
    pub async fn serve_stdio(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut framing: Option<Framing> = None;

        info!("Serving JSON-RPC over stdio");
        loop {
            let message = match read_message(&mut reader, &mut framing).await {
                Ok(Some(m)) => m,
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed frame on stdio: {}", e);
                    continue;
                }
            };
            if let Some(response) = self.handle_message(message).await {
                let framing = framing.unwrap_or(Framing::ContentLength);
                write_message(&mut stdout, framing, &response).await?;
            }
        }
        info!("stdio session closed");
        Ok(())
    }

    /// Bind the local TCP listener; returns the bound port.
    pub async fn bind_tcp(&self, port: u16) -> Result<(TcpListener, u16)> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let bound = listener.local_addr()?.port();
        info!("Serving JSON-RPC on 127.0.0.1:{}", bound);
        Ok((listener, bound))
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            debug!("Accepted IPC connection from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut reader = BufReader::new(read_half);
                let mut framing: Option<Framing> = None;
                loop {
                    let message = match read_message(&mut reader, &mut framing).await {
                        Ok(Some(m)) => m,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Malformed frame from {}: {}", peer, e);
                            break;
                        }
                    };
                    if let Some(response) = server.handle_message(message).await {
                        let framing = framing.unwrap_or(Framing::Ndjson);
                        if write_message(&mut write_half, framing, &response)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                debug!("IPC connection from {} closed", peer);
            });
        }
    }

    /// Handle one JSON-RPC message; notifications return no response.
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let result = match method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-06-18",
                "serverInfo": {
                    "name": "deckard",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {"tools": {"listChanged": false}},
            })),
            "ping" => Ok(json!({"pong": true})),
            "sari/identify" => Ok(json!({
                "name": "deckard",
                "version": env!("CARGO_PKG_VERSION"),
                "workspace_root": self
                    .registry
                    .services()
                    .layout
                    .root
                    .to_string_lossy(),
                "pid": std::process::id(),
            })),
            "tools/list" => Ok(json!({"tools": self.registry.list_tools()})),
            "roots/list" => {
                let roots: Vec<Value> = self
                    .registry
                    .services()
                    .allowed_roots
                    .iter()
                    .map(|r| {
                        json!({
                            "root_id": r.root_id,
                            "path": r.abs_path.to_string_lossy(),
                        })
                    })
                    .collect();
                Ok(json!({"roots": roots}))
            }
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                if name.is_empty() {
                    Err((-32602, "tools/call requires params.name".to_string()))
                } else {
                    let registry = self.registry.clone();
                    // Tool handlers do blocking DB work.
                    let result = tokio::task::spawn_blocking(move || {
                        registry.dispatch(&name, &arguments)
                    })
                    .await;
                    match result {
                        Ok(value) => Ok(value),
                        Err(e) => Err((-32000, format!("tool task panicked: {e}"))),
                    }
                }
            }
            "" => Err((-32600, "missing method".to_string())),
            other => Err((-32601, format!("method not found: {other}"))),
        };

        // Notifications (no id) never get responses.
        let id = id?;
        Some(match result {
            Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::CallGraphService;
    use crate::config::Config;
    use crate::database::writer::WriterQueue;
    use crate::database::SearchDatabase;
    use crate::engine::sqlite::SqliteEngine;
    use crate::engine::{EngineMode, SearchEngineOps};
    use crate::indexer::Indexer;
    use crate::search::SearchService;
    use crate::tools::{AnalyticsQueue, PolicyEngine, ToolServices};
    use crate::watcher::{DedupQueue, TokenBucket};
    use crate::workspace::WorkspaceLayout;
    use std::time::Duration;

    fn test_server(dir: &std::path::Path) -> Arc<RpcServer> {
        let cfg = Config::default();
        let db = Arc::new(SearchDatabase::new(&dir.join("index.db")).unwrap());
        let writer = WriterQueue::start(db.clone(), 64, Duration::from_millis(20), 256);
        let engine: Arc<dyn SearchEngineOps> = Arc::new(SqliteEngine::new(db.clone()));
        let search = Arc::new(SearchService::new(
            db.clone(),
            engine.clone(),
            EngineMode::Sqlite,
            false,
        ));
        let callgraph = Arc::new(CallGraphService::new(db.clone()));
        let queue = Arc::new(DedupQueue::new());
        let bucket = Arc::new(TokenBucket::new(10.0, 10.0));
        let indexer = Arc::new(Indexer::new(
            cfg.clone(),
            db.clone(),
            writer.clone(),
            engine,
            Vec::new(),
            queue,
            bucket,
        ));
        let services = Arc::new(ToolServices {
            cfg,
            layout: WorkspaceLayout::new(dir.to_path_buf()),
            db,
            writer,
            search,
            callgraph,
            indexer,
            allowed_roots: Vec::new(),
            analytics: Arc::new(AnalyticsQueue::default()),
            manager: None,
        });
        let registry = Arc::new(ToolRegistry::new(
            services,
            Arc::new(PolicyEngine::default()),
        ));
        Arc::new(RpcServer::new(registry))
    }

    #[tokio::test]
    async fn initialize_and_identify() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await
            .unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], "deckard");

        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "sari/identify"}))
            .await
            .unwrap();
        assert_eq!(response["result"]["name"], "deckard");
    }

    #[tokio::test]
    async fn tools_list_contains_core_tools() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());
        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}))
            .await
            .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for required in ["search", "call_graph", "status", "doctor", "scan_once"] {
            assert!(names.contains(&required), "missing tool {required}");
        }
    }

    #[tokio::test]
    async fn tool_call_roundtrip_and_unknown_method() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let response = server
            .handle_message(json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "status", "arguments": {}},
            }))
            .await
            .unwrap();
        assert!(response["result"]["content"].is_array());

        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 5, "method": "nope"}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);

        // Notifications produce no response.
        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "method": "ping"}))
            .await;
        assert!(response.is_none());
    }
}
