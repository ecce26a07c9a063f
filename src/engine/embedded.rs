// Embedded full-text engine backed by tantivy.
//
// One document per file, fed by the writer's post-commit payloads
// (`engine_docs` / `engine_deletes`). `doc_id` (the file path) is the
// delete key, so every sync is delete-then-add and idempotent. Text
// arrives pre-normalized (NFKC, lowercase, CJK-segmented) from the
// document builder; the registered analyzer only needs to split and
// lowercase.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, OwnedValue, Schema, TantivyDocument, TextFieldIndexing, TextOptions,
    Value,
};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, TextAnalyzer};
use tantivy::{Index, IndexReader, IndexWriter, Term};
use tracing::{debug, info, warn};

use crate::cjk;

use super::{EngineDoc, EngineError, EngineHit, EngineStatus, SearchEngineOps};

const WRITER_HEAP_SIZE: usize = 50_000_000;
const ANALYZER_NAME: &str = "engine_text";

#[derive(Clone)]
struct EngineFields {
    doc_id: Field,
    path_text: Field,
    body_text: Field,
    repo: Field,
    root_id: Field,
    mtime: Field,
    size: Field,
}

fn build_schema() -> (Schema, EngineFields) {
    let mut builder = Schema::builder();

    let raw_stored = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("raw")
                .set_index_option(IndexRecordOption::Basic),
        )
        .set_stored();
    let text_options = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(ANALYZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );

    let doc_id = builder.add_text_field("doc_id", raw_stored.clone());
    let path_text = builder.add_text_field("path_text", text_options.clone());
    let body_text = builder.add_text_field("body_text", text_options);
    let repo = builder.add_text_field("repo", raw_stored.clone());
    let root_id = builder.add_text_field("root_id", raw_stored);
    let mtime = builder.add_u64_field("mtime", tantivy::schema::STORED);
    let size = builder.add_u64_field("size", tantivy::schema::STORED);

    let schema = builder.build();
    let fields = EngineFields {
        doc_id,
        path_text,
        body_text,
        repo,
        root_id,
        mtime,
        size,
    };
    (schema, fields)
}

fn register_analyzer(index: &Index) {
    index.tokenizers().register(
        ANALYZER_NAME,
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build(),
    );
}

enum Backend {
    Ready {
        index: Index,
        reader: IndexReader,
        writer: Mutex<IndexWriter>,
    },
    NotInstalled,
}

pub struct EmbeddedEngine {
    backend: Mutex<Backend>,
    fields: EngineFields,
    index_dir: PathBuf,
    index_version: AtomicU64,
    ready: AtomicBool,
    reason: Mutex<String>,
}

impl EmbeddedEngine {
    /// Open the index under `index_dir`. A missing index is created when
    /// `auto_install` is set, else the engine reports `NOT_INSTALLED`
    /// until `install()` runs.
    pub fn open(index_dir: &Path, auto_install: bool) -> Result<Self> {
        let (_, fields) = build_schema();
        let installed = index_dir.join("meta.json").exists();

        let engine = Self {
            backend: Mutex::new(Backend::NotInstalled),
            fields,
            index_dir: index_dir.to_path_buf(),
            index_version: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            reason: Mutex::new("NOT_INSTALLED".to_string()),
        };

        if installed || auto_install {
            engine.install()?;
        } else {
            debug!(
                "Embedded engine index not present at {:?}; waiting for install",
                index_dir
            );
        }
        Ok(engine)
    }

    fn open_backend(&self) -> Result<Backend> {
        std::fs::create_dir_all(&self.index_dir)
            .with_context(|| format!("creating engine index dir {:?}", self.index_dir))?;
        let (schema, _) = build_schema();
        let index = Index::builder()
            .schema(schema)
            .create_in_dir(&self.index_dir)
            .or_else(|_| Index::open_in_dir(&self.index_dir))?;
        register_analyzer(&index);
        let reader = index.reader()?;
        let writer = index.writer(WRITER_HEAP_SIZE)?;
        Ok(Backend::Ready {
            index,
            reader,
            writer: Mutex::new(writer),
        })
    }

    fn to_document(&self, doc: &EngineDoc) -> TantivyDocument {
        let f = &self.fields;
        let mut tdoc = TantivyDocument::new();
        tdoc.add_text(f.doc_id, &doc.doc_id);
        tdoc.add_text(f.path_text, &doc.path_text);
        tdoc.add_text(f.body_text, &doc.body_text);
        tdoc.add_text(f.repo, &doc.repo);
        tdoc.add_text(f.root_id, &doc.root_id);
        tdoc.add_u64(f.mtime, doc.mtime.max(0) as u64);
        tdoc.add_u64(f.size, doc.size.max(0) as u64);
        tdoc
    }

    /// Split a pre-normalized query into index tokens.
    fn query_tokens(query: &str) -> Vec<String> {
        let normalized = {
            let n = cjk::normalize_engine_text(query);
            if cjk::has_cjk(&n) { cjk::cjk_space(&n) } else { n }
        };
        normalized
            .split(|c: char| !c.is_alphanumeric() && !cjk::is_cjk_char(c))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    }

    fn get_text(doc: &TantivyDocument, field: Field) -> String {
        doc.get_first(field)
            .and_then(|v| match v {
                OwnedValue::Str(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn get_u64(doc: &TantivyDocument, field: Field) -> u64 {
        doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
    }
}

impl SearchEngineOps for EmbeddedEngine {
    fn search(
        &self,
        query: &str,
        root_ids: &[String],
        limit: usize,
    ) -> std::result::Result<Vec<EngineHit>, EngineError> {
        let backend = self.backend.lock().unwrap();
        let (reader, _index) = match &*backend {
            Backend::Ready { reader, index, .. } => (reader, index),
            Backend::NotInstalled => {
                return Err(EngineError::NotInstalled(
                    "embedded engine index not installed".to_string(),
                ));
            }
        };
        if !self.ready.load(Ordering::Acquire) {
            return Err(EngineError::Unavailable(
                self.reason.lock().unwrap().clone(),
            ));
        }

        let tokens = Self::query_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let f = &self.fields;

        // Every token must match in either the path or the body; root
        // scope is an additional conjunct over the raw root_id field.
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for token in &tokens {
            let per_field: Vec<(Occur, Box<dyn Query>)> = vec![
                (
                    Occur::Should,
                    Box::new(TermQuery::new(
                        Term::from_field_text(f.path_text, token),
                        IndexRecordOption::WithFreqs,
                    )),
                ),
                (
                    Occur::Should,
                    Box::new(TermQuery::new(
                        Term::from_field_text(f.body_text, token),
                        IndexRecordOption::WithFreqs,
                    )),
                ),
            ];
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(per_field))));
        }
        if !root_ids.is_empty() {
            let roots: Vec<(Occur, Box<dyn Query>)> = root_ids
                .iter()
                .map(|r| {
                    (
                        Occur::Should,
                        Box::new(TermQuery::new(
                            Term::from_field_text(f.root_id, r),
                            IndexRecordOption::Basic,
                        )) as Box<dyn Query>,
                    )
                })
                .collect();
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(roots))));
        }
        let query = BooleanQuery::new(clauses);

        let searcher = reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit.max(1)))
            .map_err(|e| EngineError::Query(e.to_string()))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(addr)
                .map_err(|e| EngineError::Query(e.to_string()))?;
            let path = Self::get_text(&doc, f.doc_id);
            let mut hit = EngineHit {
                repo: Self::get_text(&doc, f.repo),
                mtime: Self::get_u64(&doc, f.mtime) as i64,
                size: Self::get_u64(&doc, f.size) as i64,
                score: score as f64,
                path,
            };
            hit.score += super::path_prior(&hit.path) + super::filetype_prior(&hit.path);
            hits.push(hit);
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.mtime.cmp(&a.mtime))
                .then(a.path.cmp(&b.path))
        });
        Ok(hits)
    }

    fn apply_sync(&self, docs: &[EngineDoc], deletes: &[String]) -> Result<()> {
        let backend = self.backend.lock().unwrap();
        let Backend::Ready { reader, writer, .. } = &*backend else {
            anyhow::bail!("engine_sync_error:not_installed");
        };
        let mut writer = writer.lock().unwrap();
        for path in deletes {
            writer.delete_term(Term::from_field_text(self.fields.doc_id, path));
        }
        for doc in docs {
            // Replace semantics: drop any prior document for the path.
            writer.delete_term(Term::from_field_text(self.fields.doc_id, &doc.doc_id));
            writer.add_document(self.to_document(doc))?;
        }
        writer.commit().context("engine_sync_error:commit")?;
        reader.reload()?;
        self.index_version.fetch_add(1, Ordering::AcqRel);
        debug!(
            "Engine sync applied: {} docs, {} deletes (version {})",
            docs.len(),
            deletes.len(),
            self.index_version.load(Ordering::Acquire)
        );
        Ok(())
    }

    fn rebuild(&self, docs: &[EngineDoc]) -> Result<()> {
        {
            let backend = self.backend.lock().unwrap();
            let Backend::Ready { reader, writer, .. } = &*backend else {
                anyhow::bail!("engine_sync_error:not_installed");
            };
            let mut writer = writer.lock().unwrap();
            writer.delete_all_documents()?;
            for doc in docs {
                writer.add_document(self.to_document(doc))?;
            }
            writer.commit()?;
            reader.reload()?;
        }
        self.index_version.fetch_add(1, Ordering::AcqRel);
        info!("Embedded engine rebuilt with {} documents", docs.len());
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        let backend = self.backend.lock().unwrap();
        let (ready, doc_count) = match &*backend {
            Backend::Ready { reader, .. } => {
                let _ = reader.reload();
                (true, reader.searcher().num_docs())
            }
            Backend::NotInstalled => (false, 0),
        };
        let index_size_bytes = walk_dir_size(&self.index_dir);
        EngineStatus {
            engine_mode: "embedded".to_string(),
            engine_ready: ready && self.ready.load(Ordering::Acquire),
            reason: if ready {
                String::new()
            } else {
                self.reason.lock().unwrap().clone()
            },
            hint: if ready {
                String::new()
            } else {
                "run `deckard-server --cmd engine-install` or set DECKARD_ENGINE_AUTO_INSTALL=1"
                    .to_string()
            },
            doc_count,
            index_size_bytes,
            index_version: self.index_version.load(Ordering::Acquire),
            tokenizer_ready: true,
            tokenizer_note: cjk::tokenizer_note(),
        }
    }

    fn install(&self) -> Result<()> {
        let mut backend = self.backend.lock().unwrap();
        if matches!(&*backend, Backend::Ready { .. }) {
            return Ok(());
        }
        match self.open_backend() {
            Ok(ready) => {
                *backend = ready;
                self.ready.store(true, Ordering::Release);
                self.reason.lock().unwrap().clear();
                info!("Embedded engine installed at {:?}", self.index_dir);
                Ok(())
            }
            Err(e) => {
                warn!("Embedded engine install failed: {}", e);
                *self.reason.lock().unwrap() = e.to_string();
                Err(e)
            }
        }
    }
}

fn walk_dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, body: &str, mtime: i64) -> EngineDoc {
        let (root_id, rel_path) = path.split_once('/').unwrap();
        EngineDoc::build(path, root_id, rel_path, "demo", body, mtime, body.len() as i64, 1 << 20, 256)
    }

    fn fresh_engine() -> EmbeddedEngine {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedEngine::open(&dir.path().join("engine"), true).unwrap();
        // Keep the tempdir alive for the engine's lifetime.
        std::mem::forget(dir);
        engine
    }

    #[test]
    fn not_installed_without_auto_install() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddedEngine::open(&dir.path().join("engine"), false).unwrap();
        let err = engine.search("anything", &[], 10).unwrap_err();
        assert_eq!(err.code(), "ERR_ENGINE_NOT_INSTALLED");
        assert!(!engine.status().engine_ready);

        engine.install().unwrap();
        assert!(engine.status().engine_ready);
    }

    #[test]
    fn sync_then_query_roundtrip() {
        let engine = fresh_engine();
        engine
            .apply_sync(
                &[doc("root-a/src/auth.py", "def validate_token(): pass", 100)],
                &[],
            )
            .unwrap();
        let hits = engine.search("validate_token", &[], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "root-a/src/auth.py");

        // Deletes drop the document.
        engine
            .apply_sync(&[], &["root-a/src/auth.py".to_string()])
            .unwrap();
        assert!(engine.search("validate_token", &[], 10).unwrap().is_empty());
    }

    #[test]
    fn cjk_documents_match_morpheme_query() {
        let engine = fresh_engine();
        let docs: Vec<EngineDoc> = (0..5)
            .map(|i| {
                let body = if i == 0 {
                    "한국어 형태소 분석기 문서".to_string()
                } else {
                    format!("일반 문서 번호 {i}")
                };
                doc(&format!("root-a/docs/doc{i}.md"), &body, 100 + i)
            })
            .collect();
        engine.apply_sync(&docs, &[]).unwrap();

        let hits = engine.search("형태소", &[], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "root-a/docs/doc0.md");
    }

    #[test]
    fn root_scope_is_enforced() {
        let engine = fresh_engine();
        engine
            .apply_sync(&[doc("root-a/x.py", "unique_payload here", 1)], &[])
            .unwrap();
        assert!(
            engine
                .search("unique_payload", &["root-wrong".to_string()], 10)
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            engine
                .search("unique_payload", &["root-a".to_string()], 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn resync_same_doc_is_idempotent() {
        let engine = fresh_engine();
        let d = doc("root-a/y.py", "repeated body", 1);
        engine.apply_sync(&[d.clone()], &[]).unwrap();
        engine.apply_sync(&[d], &[]).unwrap();
        assert_eq!(engine.status().doc_count, 1);
    }
}
