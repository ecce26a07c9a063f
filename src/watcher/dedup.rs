// Per-path dedup queue.
//
// At any time at most one task per path is pending. A second event for an
// in-flight path coalesces into the existing task (latest action wins,
// `last_seen` refreshed) instead of growing the queue. Batching consumers
// remove tasks from the pending set as they take them, so a path that
// changes again while being processed re-queues cleanly.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::events::{CoalesceTask, coalesce_action};

#[derive(Default)]
struct Inner {
    order: VecDeque<PathBuf>,
    pending: HashMap<PathBuf, CoalesceTask>,
}

pub struct DedupQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl Default for DedupQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Condvar::new(),
        }
    }

    /// Enqueue or coalesce. Returns true when a new task was queued,
    /// false when an existing pending task absorbed the event.
    pub fn put(&self, task: CoalesceTask) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.pending.get_mut(&task.path) {
            existing.action = coalesce_action(Some(existing.action), task.action);
            existing.last_seen = task.last_seen;
            return false;
        }
        inner.order.push_back(task.path.clone());
        inner.pending.insert(task.path.clone(), task);
        self.available.notify_one();
        true
    }

    /// Take up to `max_size` tasks, blocking up to `timeout` for the
    /// first. Taken tasks leave the pending set immediately so follow-up
    /// events re-queue.
    pub fn get_batch(&self, max_size: usize, timeout: Duration) -> Vec<CoalesceTask> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.order.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let (guard, wait) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if wait.timed_out() && inner.order.is_empty() {
                return Vec::new();
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max_size {
            let Some(path) = inner.order.pop_front() else {
                break;
            };
            if let Some(task) = inner.pending.remove(&path) {
                batch.push(task);
            }
        }
        batch
    }

    pub fn qsize(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::events::TaskAction;
    use super::*;

    fn task(path: &str, action: TaskAction, ts: f64) -> CoalesceTask {
        CoalesceTask::new(action, PathBuf::from(path), "root-a".to_string(), ts)
    }

    #[test]
    fn at_most_one_task_per_path() {
        let queue = DedupQueue::new();
        assert!(queue.put(task("/w/a.py", TaskAction::Index, 1.0)));
        assert!(!queue.put(task("/w/a.py", TaskAction::Index, 2.0)));
        assert!(!queue.put(task("/w/a.py", TaskAction::Index, 3.0)));
        assert_eq!(queue.qsize(), 1);

        let batch = queue.get_batch(10, Duration::from_millis(10));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].last_seen, 3.0);
    }

    #[test]
    fn later_index_beats_pending_delete() {
        let queue = DedupQueue::new();
        queue.put(task("/w/a.py", TaskAction::Delete, 1.0));
        queue.put(task("/w/a.py", TaskAction::Index, 2.0));
        let batch = queue.get_batch(10, Duration::from_millis(10));
        assert_eq!(batch[0].action, TaskAction::Index);
    }

    #[test]
    fn taken_paths_requeue_on_new_events() {
        let queue = DedupQueue::new();
        queue.put(task("/w/a.py", TaskAction::Index, 1.0));
        let _taken = queue.get_batch(10, Duration::from_millis(10));
        // Path changed again while "processing": must queue a new task.
        assert!(queue.put(task("/w/a.py", TaskAction::Index, 2.0)));
    }

    #[test]
    fn ordering_across_paths_is_fifo() {
        let queue = DedupQueue::new();
        queue.put(task("/w/a.py", TaskAction::Index, 1.0));
        queue.put(task("/w/b.py", TaskAction::Index, 2.0));
        queue.put(task("/w/c.py", TaskAction::Index, 3.0));
        let batch = queue.get_batch(10, Duration::from_millis(10));
        let paths: Vec<_> = batch.iter().map(|t| t.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/w/a.py"),
                PathBuf::from("/w/b.py"),
                PathBuf::from("/w/c.py")
            ]
        );
    }

    #[test]
    fn empty_queue_times_out() {
        let queue = DedupQueue::new();
        let start = Instant::now();
        let batch = queue.get_batch(10, Duration::from_millis(30));
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
