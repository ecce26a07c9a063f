// Parser pool.
//
// A bounded set of worker threads turns scan/watch jobs into storage rows:
// read the file (sampling oversized ones head+tail), classify
// binary/minified, dispatch to the language parser, and assemble the file
// record, symbol rows, relation rows, and the embedded-engine document.
// Worker admission is scaled by the resource governor; a parser failure
// dead-letters the path and never kills a worker.

pub mod governor;
pub mod languages;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::database::types::{FileRecord, RelationRecord, SymbolRecord};
use crate::engine::EngineDoc;
use crate::utils::file::{TEXT_SAMPLE_BYTES, is_minified, printable_ratio, sample_file};

pub use governor::ResourceGovernor;
pub use languages::{Language, parse_text};

/// One file to process.
#[derive(Debug, Clone)]
pub struct ParseJob {
    pub abs_path: PathBuf,
    /// Storage key: `root_id + "/" + rel_path`.
    pub path_key: String,
    pub root_id: String,
    pub rel_path: String,
    pub repo: String,
    pub mtime: i64,
    pub size: i64,
}

/// A fully processed file ready for the writer queue.
#[derive(Debug)]
pub struct IndexedFile {
    pub file: FileRecord,
    pub symbols: Vec<SymbolRecord>,
    pub relations: Vec<RelationRecord>,
    pub engine_doc: EngineDoc,
}

/// A recoverable per-file failure destined for the failed-task table.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub path_key: String,
    pub error_code: String,
    pub message: String,
}

pub type ParseOutput = std::result::Result<Box<IndexedFile>, ParseFailure>;

/// Binary classification threshold over the printable ratio of a sample.
const PRINTABLE_THRESHOLD: f64 = 0.7;

/// Process one job into storage rows. Pure with respect to daemon state:
/// everything it needs arrives in the job and config.
pub fn process_file(job: &ParseJob, cfg: &Config) -> Result<IndexedFile> {
    let sample = sample_file(&job.abs_path, job.size.max(0) as u64);
    let is_binary = printable_ratio(&sample) < PRINTABLE_THRESHOLD;

    let mut record = FileRecord {
        path: job.path_key.clone(),
        root_id: job.root_id.clone(),
        rel_path: job.rel_path.clone(),
        repo: job.repo.clone(),
        mtime: job.mtime,
        size: job.size,
        last_seen: crate::utils::unix_timestamp(),
        ..Default::default()
    };

    if is_binary {
        record.is_binary = true;
        record.parse_status = "skipped".to_string();
        record.parse_reason = "binary".to_string();
        record.ast_status = "skipped".to_string();
        record.ast_reason = "binary".to_string();
        let engine_doc = build_engine_doc(job, "", cfg);
        return Ok(IndexedFile {
            file: record,
            symbols: Vec::new(),
            relations: Vec::new(),
            engine_doc,
        });
    }

    let oversize = cfg.max_file_bytes > 0 && job.size as u64 > cfg.max_file_bytes;
    let content = if oversize {
        record.sampled = true;
        record.parse_reason = "sampled".to_string();
        String::from_utf8_lossy(&sample).into_owned()
    } else {
        std::fs::read_to_string(&job.abs_path)
            .with_context(|| format!("reading {:?}", job.abs_path))?
    };
    record.content_hash = blake3::hash(content.as_bytes()).to_hex().to_string();
    record.parse_status = "ok".to_string();

    let sample_text = {
        let mut end = content.len().min(TEXT_SAMPLE_BYTES);
        while end > 0 && !content.is_char_boundary(end) {
            end -= 1;
        }
        &content[..end]
    };
    record.is_minified = is_minified(&job.abs_path, sample_text);

    let language = detect_language(&job.abs_path, &content);
    let (symbols, relations) = if record.is_minified {
        record.ast_status = "skipped".to_string();
        record.ast_reason = "minified".to_string();
        (Vec::new(), Vec::new())
    } else if language == Language::Unknown {
        record.ast_status = "none".to_string();
        record.ast_reason = "unsupported_language".to_string();
        (Vec::new(), Vec::new())
    } else {
        record.ast_status = "ok".to_string();
        record.ast_reason = "none".to_string();
        parse_text(language, &content)
    };

    let symbol_rows: Vec<SymbolRecord> = symbols
        .iter()
        .map(|s| {
            let symbol_id = SymbolRecord::compute_id(&job.path_key, &s.kind, &s.qualname);
            SymbolRecord {
                symbol_id,
                path: job.path_key.clone(),
                root_id: job.root_id.clone(),
                name: s.name.clone(),
                qualname: s.qualname.clone(),
                kind: s.kind.clone(),
                line: s.line,
                end_line: s.end_line,
                content: s.content.clone(),
                parent_name: s.parent_name.clone(),
                metadata: "{}".to_string(),
                docstring: s.docstring.clone(),
            }
        })
        .collect();

    let relation_rows: Vec<RelationRecord> = relations
        .iter()
        .map(|r| {
            // In-file targets resolve immediately; cross-file targets are
            // left for the call-graph enrichment pass.
            let target = symbol_rows.iter().find(|s| s.name == r.to_symbol);
            let from = symbol_rows.iter().find(|s| s.name == r.from_symbol);
            RelationRecord {
                from_path: job.path_key.clone(),
                from_symbol: r.from_symbol.clone(),
                from_symbol_id: from.map(|s| s.symbol_id.clone()).unwrap_or_default(),
                to_path: target.map(|s| s.path.clone()).unwrap_or_default(),
                to_symbol: r.to_symbol.clone(),
                to_symbol_id: target.map(|s| s.symbol_id.clone()).unwrap_or_default(),
                rel_type: r.rel_type.clone(),
                line: r.line,
            }
        })
        .collect();

    record.content = content;
    let engine_doc = build_engine_doc(job, &record.content, cfg);

    Ok(IndexedFile {
        file: record,
        symbols: symbol_rows,
        relations: relation_rows,
        engine_doc,
    })
}

fn build_engine_doc(job: &ParseJob, body: &str, cfg: &Config) -> EngineDoc {
    EngineDoc::build(
        &job.path_key,
        &job.root_id,
        &job.rel_path,
        &job.repo,
        body,
        job.mtime,
        job.size,
        cfg.engine_max_doc_bytes as usize,
        cfg.engine_preview_bytes as usize,
    )
}

/// Extension dispatch with a shebang fallback for extensionless scripts.
pub fn detect_language(path: &std::path::Path, content: &str) -> Language {
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| Language::from_extension(&e.to_lowercase()))
        .unwrap_or(Language::Unknown);
    if by_ext != Language::Unknown {
        return by_ext;
    }
    content
        .lines()
        .next()
        .map(Language::from_shebang)
        .unwrap_or(Language::Unknown)
}

/// Bounded worker set processing parse jobs.
pub struct ParserPool {
    job_tx: Option<Sender<ParseJob>>,
    result_rx: Receiver<ParseOutput>,
    handles: Vec<JoinHandle<()>>,
}

impl ParserPool {
    pub fn start(cfg: Config, governor: Arc<ResourceGovernor>) -> Self {
        let base = cfg.base_parser_workers();
        // Threads are provisioned for the governor's boost ceiling; the
        // admission gate below decides how many may draw work at once.
        let max_workers = ((base as f64 * 2.5).ceil() as usize).max(1);
        let (job_tx, job_rx) = bounded::<ParseJob>(max_workers * 4);
        let (result_tx, result_rx) = bounded::<ParseOutput>(max_workers * 4);

        let mut handles = Vec::with_capacity(max_workers);
        for worker_idx in 0..max_workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let governor = governor.clone();
            let cfg = cfg.clone();
            let handle = std::thread::Builder::new()
                .name(format!("deckard-parser-{worker_idx}"))
                .spawn(move || {
                    loop {
                        // Admission gate: workers above the governed target
                        // idle instead of drawing jobs.
                        let target = governor.scale_workers(cfg.base_parser_workers());
                        if worker_idx >= target {
                            match job_rx.recv_timeout(Duration::from_millis(250)) {
                                Ok(job) => {
                                    // A gated worker still drains the queue
                                    // (a taken job cannot be returned), but
                                    // pays a throttle delay first.
                                    std::thread::sleep(Duration::from_millis(100));
                                    run_job(&job, &cfg, &result_tx);
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                            }
                            continue;
                        }
                        match job_rx.recv() {
                            Ok(job) => run_job(&job, &cfg, &result_tx),
                            Err(_) => return,
                        }
                    }
                })
                .expect("spawning parser worker");
            handles.push(handle);
        }
        info!(
            "Parser pool started: {} workers (base {})",
            max_workers, base
        );

        Self {
            job_tx: Some(job_tx),
            result_rx,
            handles,
        }
    }

    pub fn submit(&self, job: ParseJob) -> Result<()> {
        self.job_tx
            .as_ref()
            .context("parser pool stopped")?
            .send(job)
            .context("parser pool stopped")?;
        Ok(())
    }

    pub fn results(&self) -> &Receiver<ParseOutput> {
        &self.result_rx
    }

    pub fn shutdown(mut self) {
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("Parser pool stopped");
    }
}

fn run_job(job: &ParseJob, cfg: &Config, result_tx: &Sender<ParseOutput>) {
    let output = match process_file(job, cfg) {
        Ok(indexed) => Ok(Box::new(indexed)),
        Err(e) => {
            warn!("Parse failed for {}: {}", job.path_key, e);
            Err(ParseFailure {
                path_key: job.path_key.clone(),
                error_code: "parse_error".to_string(),
                message: e.to_string(),
            })
        }
    };
    let _ = result_tx.send(output);
}
