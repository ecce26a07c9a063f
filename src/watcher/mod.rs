// File watcher.
//
// One notify subscription per root. OS callbacks stay light: they
// normalize the event, push a task into the dedup queue, and ping the
// root's adaptive debouncer. Heavy work (parsing, writing) happens on the
// indexer's consumer thread, which drains the queue under the token
// bucket's rate limit.

pub mod debounce;
pub mod dedup;
pub mod events;
pub mod throttle;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::config::Config;

pub use debounce::AdaptiveDebouncer;
pub use dedup::DedupQueue;
pub use events::{CoalesceTask, FsEvent, FsEventKind, TaskAction, split_moved_event};
pub use throttle::TokenBucket;

/// A watched root: its id plus the absolute directory.
#[derive(Debug, Clone)]
pub struct WatchedRoot {
    pub root_id: String,
    pub abs_path: PathBuf,
}

/// Owns the notify subscriptions and per-root debouncers; shares the
/// dedup queue with the indexer.
pub struct WatchService {
    queue: Arc<DedupQueue>,
    bucket: Arc<TokenBucket>,
    // Kept alive for the lifetime of the service; dropping unsubscribes.
    watchers: Vec<RecommendedWatcher>,
    debouncers: Vec<Arc<AdaptiveDebouncer>>,
}

impl WatchService {
    pub fn new(cfg: &Config) -> Self {
        Self {
            queue: Arc::new(DedupQueue::new()),
            bucket: Arc::new(TokenBucket::new(cfg.bucket_capacity, cfg.bucket_fill_rate)),
            watchers: Vec::new(),
            debouncers: Vec::new(),
        }
    }

    pub fn queue(&self) -> Arc<DedupQueue> {
        self.queue.clone()
    }

    pub fn bucket(&self) -> Arc<TokenBucket> {
        self.bucket.clone()
    }

    /// Subscribe to one root. Callbacks normalize and enqueue only.
    pub fn watch_root(&mut self, root: &WatchedRoot, cfg: &Config) -> Result<()> {
        let queue = self.queue.clone();
        let root_id = root.root_id.clone();
        let root_path = root.abs_path.clone();

        let debouncer = Arc::new(AdaptiveDebouncer::new(
            Duration::from_millis(cfg.debounce_min_delay_ms),
            Duration::from_millis(cfg.debounce_max_delay_ms),
            || {},
        ));
        let callback_debouncer = debouncer.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for fs_event in normalize_event(&event, &root_id, &root_path) {
                        enqueue_event(&queue, &fs_event);
                    }
                    callback_debouncer.handle_event();
                }
                Err(e) => {
                    warn!("File watcher error: {}", e);
                }
            },
        )?;
        watcher
            .watch(&root.abs_path, RecursiveMode::Recursive)
            .with_context(|| format!("watching root {:?}", root.abs_path))?;

        info!("Watching root {} at {:?}", root.root_id, root.abs_path);
        self.watchers.push(watcher);
        self.debouncers.push(debouncer);
        Ok(())
    }
}

/// Push an event's task(s) through the coalescing queue.
fn enqueue_event(queue: &DedupQueue, event: &FsEvent) {
    match event.kind {
        FsEventKind::Moved => {
            for task in split_moved_event(event) {
                queue.put(task);
            }
        }
        FsEventKind::Deleted => {
            queue.put(CoalesceTask::new(
                TaskAction::Delete,
                event.path.clone(),
                event.root.clone(),
                event.ts,
            ));
        }
        FsEventKind::Created | FsEventKind::Modified => {
            queue.put(CoalesceTask::new(
                TaskAction::Index,
                event.path.clone(),
                event.root.clone(),
                event.ts,
            ));
        }
    }
}

/// Normalize a notify event into zero or more `FsEvent`s scoped to the
/// watched root.
pub fn normalize_event(event: &Event, root_id: &str, root_path: &Path) -> Vec<FsEvent> {
    let ts = crate::utils::unix_timestamp_ms() as f64 / 1000.0;
    let in_root = |p: &PathBuf| p.starts_with(root_path);

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|p| in_root(p))
            .map(|p| FsEvent {
                kind: FsEventKind::Created,
                path: p.clone(),
                dest_path: None,
                root: root_id.to_string(),
                ts,
            })
            .collect(),
        EventKind::Modify(modify) => {
            use notify::event::{ModifyKind, RenameMode};
            if let ModifyKind::Name(rename) = modify {
                match rename {
                    RenameMode::Both if event.paths.len() >= 2 => {
                        return vec![FsEvent {
                            kind: FsEventKind::Moved,
                            path: event.paths[0].clone(),
                            dest_path: Some(event.paths[1].clone()),
                            root: root_id.to_string(),
                            ts,
                        }];
                    }
                    RenameMode::From => {
                        return event
                            .paths
                            .iter()
                            .map(|p| FsEvent {
                                kind: FsEventKind::Deleted,
                                path: p.clone(),
                                dest_path: None,
                                root: root_id.to_string(),
                                ts,
                            })
                            .collect();
                    }
                    RenameMode::To => {
                        return event
                            .paths
                            .iter()
                            .map(|p| FsEvent {
                                kind: FsEventKind::Created,
                                path: p.clone(),
                                dest_path: None,
                                root: root_id.to_string(),
                                ts,
                            })
                            .collect();
                    }
                    _ => {}
                }
            }
            event
                .paths
                .iter()
                .filter(|p| in_root(p))
                .map(|p| FsEvent {
                    kind: FsEventKind::Modified,
                    path: p.clone(),
                    dest_path: None,
                    root: root_id.to_string(),
                    ts,
                })
                .collect()
        }
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                kind: FsEventKind::Deleted,
                path: p.clone(),
                dest_path: None,
                root: root_id.to_string(),
                ts,
            })
            .collect(),
        _ => {
            debug!("Ignoring event kind {:?}", event.kind);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RenameMode};

    fn root() -> (String, PathBuf) {
        ("root-a".to_string(), PathBuf::from("/w"))
    }

    #[test]
    fn create_normalizes_to_created() {
        let (root_id, root_path) = root();
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/w/a.py"));
        let out = normalize_event(&event, &root_id, &root_path);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FsEventKind::Created);
        assert_eq!(out[0].root, "root-a");
    }

    #[test]
    fn rename_both_normalizes_to_moved() {
        let (root_id, root_path) = root();
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/old.py"))
            .add_path(PathBuf::from("/w/new.py"));
        let out = normalize_event(&event, &root_id, &root_path);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FsEventKind::Moved);
        assert_eq!(out[0].dest_path, Some(PathBuf::from("/w/new.py")));
    }

    #[test]
    fn moved_event_enqueues_delete_and_index() {
        let queue = DedupQueue::new();
        let event = FsEvent {
            kind: FsEventKind::Moved,
            path: PathBuf::from("/w/old.py"),
            dest_path: Some(PathBuf::from("/w/new.py")),
            root: "root-a".to_string(),
            ts: 1.0,
        };
        enqueue_event(&queue, &event);
        let batch = queue.get_batch(10, Duration::from_millis(10));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].action, TaskAction::Delete);
        assert_eq!(batch[1].action, TaskAction::Index);
    }

    #[test]
    fn foreign_paths_are_filtered() {
        let (root_id, root_path) = root();
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/elsewhere/a.py"));
        let out = normalize_event(&event, &root_id, &root_path);
        assert!(out.is_empty());
    }
}
