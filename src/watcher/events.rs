// Filesystem event model.
//
// OS notifications are normalized to `FsEvent`s; MOVED events split into a
// DELETE of the old path plus an INDEX of the destination. Pending work is
// coalesced per path as `CoalesceTask`s with latest-action-wins semantics,
// so a rapid delete/recreate never leaves a stale DELETE dominating.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A normalized filesystem event scoped to a root.
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    pub dest_path: Option<PathBuf>,
    /// Root id of the watched root this event belongs to.
    pub root: String,
    pub ts: f64,
}

/// What the pipeline should do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Index,
    Delete,
}

/// One pending unit of per-path work in the dedup queue.
#[derive(Debug, Clone)]
pub struct CoalesceTask {
    pub action: TaskAction,
    pub path: PathBuf,
    pub root: String,
    pub attempts: u32,
    pub enqueue_ts: f64,
    pub last_seen: f64,
}

impl CoalesceTask {
    pub fn new(action: TaskAction, path: PathBuf, root: String, ts: f64) -> Self {
        Self {
            action,
            path,
            root,
            attempts: 0,
            enqueue_ts: ts,
            last_seen: ts,
        }
    }
}

/// The latest event wins for a path: an INDEX arriving after a DELETE
/// replaces it, and vice versa.
pub fn coalesce_action(existing: Option<TaskAction>, incoming: TaskAction) -> TaskAction {
    match existing {
        None => incoming,
        Some(_) => incoming,
    }
}

/// Split a MOVED event into its DELETE + INDEX pair. Non-move events
/// return an empty list.
pub fn split_moved_event(event: &FsEvent) -> Vec<CoalesceTask> {
    if event.kind != FsEventKind::Moved {
        return Vec::new();
    }
    let mut tasks = Vec::new();
    tasks.push(CoalesceTask::new(
        TaskAction::Delete,
        event.path.clone(),
        event.root.clone(),
        event.ts,
    ));
    if let Some(dest) = &event.dest_path {
        tasks.push(CoalesceTask::new(
            TaskAction::Index,
            dest.clone(),
            event.root.clone(),
            event.ts,
        ));
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_action_wins() {
        assert_eq!(coalesce_action(None, TaskAction::Index), TaskAction::Index);
        assert_eq!(
            coalesce_action(Some(TaskAction::Delete), TaskAction::Index),
            TaskAction::Index
        );
        assert_eq!(
            coalesce_action(Some(TaskAction::Index), TaskAction::Delete),
            TaskAction::Delete
        );
    }

    #[test]
    fn moved_splits_into_delete_plus_index() {
        let event = FsEvent {
            kind: FsEventKind::Moved,
            path: PathBuf::from("/w/old.py"),
            dest_path: Some(PathBuf::from("/w/new.py")),
            root: "root-a".to_string(),
            ts: 1.0,
        };
        let tasks = split_moved_event(&event);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].action, TaskAction::Delete);
        assert_eq!(tasks[0].path, PathBuf::from("/w/old.py"));
        assert_eq!(tasks[1].action, TaskAction::Index);
        assert_eq!(tasks[1].path, PathBuf::from("/w/new.py"));
    }

    #[test]
    fn non_move_events_do_not_split() {
        let event = FsEvent {
            kind: FsEventKind::Modified,
            path: PathBuf::from("/w/a.py"),
            dest_path: None,
            root: "root-a".to_string(),
            ts: 1.0,
        };
        assert!(split_moved_event(&event).is_empty());
    }
}
