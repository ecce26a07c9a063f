// deckard-server entrypoint.
//
// Wires the storage kernel, engine, indexer, watcher, and tool registry,
// then serves JSON-RPC over stdio (default) or a local TCP socket.
// stdout is reserved for protocol frames; all logging rolls into the
// workspace log directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use deckard::callgraph::CallGraphService;
use deckard::config::Config;
use deckard::database::manager::StorageManager;
use deckard::engine::{EngineMode, EngineRegistry};
use deckard::indexer::Indexer;
use deckard::search::SearchService;
use deckard::server::RpcServer;
use deckard::tools::{AnalyticsQueue, PolicyEngine, ToolRegistry, ToolServices};
use deckard::watcher::{WatchService, WatchedRoot};
use deckard::workspace::{WorkspaceLayout, root_id_for_path};

#[derive(Parser, Debug)]
#[command(name = "deckard-server", version, about = "Workspace-local code intelligence server")]
struct Cli {
    /// Workspace root (overrides detection and DECKARD_WORKSPACE_ROOT)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Serve on a local TCP socket instead of stdio
    #[arg(long)]
    tcp: bool,

    /// TCP port (0 = ephemeral); DECKARD_PORT/SARI_DAEMON_PORT also apply
    #[arg(long)]
    port: Option<u16>,

    /// One-shot command instead of serving: scan | health | engine-install
    #[arg(long)]
    cmd: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let start_dir = match &cli.workspace {
        Some(path) => {
            let expanded = shellexpand::tilde(&path.to_string_lossy().into_owned()).to_string();
            PathBuf::from(expanded)
        }
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    if cli.workspace.is_some() && !start_dir.is_dir() {
        eprintln!("workspace does not exist: {start_dir:?}");
        return ExitCode::from(2);
    }
    let layout = WorkspaceLayout::detect(&start_dir);
    if let Err(e) = layout.ensure_dirs() {
        eprintln!("failed to prepare workspace dirs: {e}");
        return ExitCode::from(1);
    }

    // Logging: file only. stdout carries JSON-RPC frames.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("deckard=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let file_appender = rolling::daily(layout.logs_dir(), "deckard.log");
    let (non_blocking_file, _file_guard) = non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_target(true)
                .with_ansi(false),
        )
        .init();

    info!(
        "Starting Deckard v{} for workspace {:?}",
        env!("CARGO_PKG_VERSION"),
        layout.root
    );

    match run(cli, layout) {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {e:#}");
            eprintln!("deckard-server error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli, layout: WorkspaceLayout) -> Result<ExitCode> {
    let cfg = Config::from_env();
    let mode = EngineMode::from_env();

    let handle = StorageManager::global()
        .get_instance(&layout.db_path())
        .context("opening workspace storage")?;
    let db = handle.db.clone();
    let writer = handle.writer.clone();

    let engine = EngineRegistry::create(
        mode,
        db.clone(),
        &layout.engine_index_dir(),
        cfg.engine_auto_install || matches!(cli.cmd.as_deref(), Some("engine-install")),
    )?;

    let roots = vec![WatchedRoot {
        root_id: root_id_for_path(&layout.root),
        abs_path: layout.root.clone(),
    }];

    let search = Arc::new(SearchService::new(
        db.clone(),
        engine.clone(),
        mode,
        cfg.engine_auto_install,
    ));
    let callgraph = Arc::new(CallGraphService::new(db.clone()));

    let mut watch = WatchService::new(&cfg);
    let mut indexer = Indexer::new(
        cfg.clone(),
        db.clone(),
        writer.clone(),
        engine.clone(),
        roots.clone(),
        watch.queue(),
        watch.bucket(),
    );

    // One-shot commands skip the server entirely.
    match cli.cmd.as_deref() {
        Some("scan") => {
            let submitted = indexer.scan_once()?;
            println!("scan complete: {submitted} files submitted");
            indexer.shutdown();
            StorageManager::global().shutdown()?;
            return Ok(ExitCode::SUCCESS);
        }
        Some("engine-install") => {
            engine.install()?;
            println!("engine installed at {:?}", layout.engine_index_dir());
            indexer.shutdown();
            StorageManager::global().shutdown()?;
            return Ok(ExitCode::SUCCESS);
        }
        Some("health") => {
            let ok = db.count_files().is_ok() && writer.is_running();
            println!("{}", if ok { "healthy" } else { "unhealthy" });
            indexer.shutdown();
            let _ = StorageManager::global().shutdown();
            return Ok(if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            });
        }
        Some(other) => {
            eprintln!("unknown --cmd: {other}");
            return Ok(ExitCode::from(2));
        }
        None => {}
    }

    if cfg.fts_rebuild_on_start {
        if mode == EngineMode::Embedded {
            info!("SARI_FTS_REBUILD_ON_START set; rebuilding engine index");
            let docs = db.build_engine_documents(
                &[],
                cfg.engine_max_doc_bytes as usize,
                cfg.engine_preview_bytes as usize,
            )?;
            if let Err(e) = engine.rebuild(&docs) {
                warn!("Engine rebuild failed: {e}");
            }
        } else {
            // The FTS5 table is trigger-maintained; nothing to rebuild
            // from outside the writer thread.
            info!("SARI_FTS_REBUILD_ON_START ignored under sqlite engine (trigger-synced)");
        }
    }

    for root in &roots {
        if let Err(e) = watch.watch_root(root, &cfg) {
            warn!("File watching unavailable for {:?}: {}", root.abs_path, e);
        }
    }
    indexer.start_event_loop();
    let indexer = Arc::new(indexer);

    // Initial reconciliation runs in the background so the IPC handshake
    // is immediate.
    {
        let indexer = indexer.clone();
        std::thread::Builder::new()
            .name("deckard-initial-scan".to_string())
            .spawn(move || {
                if let Err(e) = indexer.scan_once() {
                    warn!("Initial scan failed: {e:#}");
                }
            })
            .expect("spawning initial scan thread");
    }

    let services = Arc::new(ToolServices {
        cfg: cfg.clone(),
        layout: layout.clone(),
        db: db.clone(),
        writer: writer.clone(),
        search,
        callgraph,
        indexer,
        allowed_roots: roots,
        analytics: Arc::new(AnalyticsQueue::default()),
        manager: Some(StorageManager::global()),
    });
    let registry = Arc::new(ToolRegistry::new(
        services,
        Arc::new(PolicyEngine::default()),
    ));
    let server = Arc::new(RpcServer::new(registry));

    let runtime = tokio::runtime::Runtime::new()?;
    let serve_result: Result<()> = runtime.block_on(async {
        if cli.tcp {
            let port = cli.port.unwrap_or(cfg.port);
            let (listener, bound) = server.bind_tcp(port).await?;
            layout.write_handshake("127.0.0.1", bound)?;
            server.serve_tcp(listener).await
        } else {
            server.serve_stdio().await
        }
    });
    layout.remove_handshake();

    info!("Shutting down");
    if let Err(e) = StorageManager::global().shutdown() {
        warn!("Writer shutdown: {e}");
    }
    match db.checkpoint_wal() {
        Ok((busy, log, checkpointed)) => info!(
            "WAL checkpoint complete: busy={busy}, log={log}, checkpointed={checkpointed}"
        ),
        Err(e) => warn!("WAL checkpoint failed: {e}"),
    }
    // Give the non-blocking appender a beat to drain.
    std::thread::sleep(Duration::from_millis(50));

    serve_result?;
    Ok(ExitCode::SUCCESS)
}
