// In-memory overlay of recently-upserted file rows.
//
// Between enqueue and commit, readers consult the overlay so queries see
// fresh content before the transaction lands. Bounded LRU; the post-commit
// hook evicts committed paths.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;

use super::types::FileMeta;

/// A pending file row visible to readers before its commit.
#[derive(Debug, Clone)]
pub struct OverlayEntry {
    pub repo: String,
    pub mtime: i64,
    pub size: i64,
    pub content: String,
}

const DEFAULT_OVERLAY_CAPACITY: usize = 512;

/// LRU map path → pending row, guarded by a single RW-lock
/// (read-many, write-one).
pub struct Overlay {
    entries: RwLock<LruCache<String, OverlayEntry>>,
}

impl Overlay {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("non-zero overlay capacity");
        Self {
            entries: RwLock::new(LruCache::new(cap)),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_OVERLAY_CAPACITY)
    }

    pub fn insert(&self, path: String, entry: OverlayEntry) {
        self.entries.write().unwrap().put(path, entry);
    }

    pub fn remove(&self, path: &str) {
        self.entries.write().unwrap().pop(path);
    }

    /// Peek without disturbing LRU order; recency is driven by writes.
    pub fn get(&self, path: &str) -> Option<OverlayEntry> {
        self.entries.read().unwrap().peek(path).cloned()
    }

    pub fn meta(&self, path: &str) -> Option<FileMeta> {
        self.get(path).map(|e| FileMeta {
            mtime: e.mtime,
            size: e.size,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mtime: i64) -> OverlayEntry {
        OverlayEntry {
            repo: "r".to_string(),
            mtime,
            size: 1,
            content: "x".to_string(),
        }
    }

    #[test]
    fn insert_get_remove() {
        let overlay = Overlay::new(4);
        overlay.insert("p1".to_string(), entry(10));
        assert_eq!(overlay.get("p1").unwrap().mtime, 10);
        overlay.remove("p1");
        assert!(overlay.get("p1").is_none());
    }

    #[test]
    fn lru_eviction_respects_capacity() {
        let overlay = Overlay::new(2);
        overlay.insert("a".to_string(), entry(1));
        overlay.insert("b".to_string(), entry(2));
        overlay.insert("c".to_string(), entry(3));
        assert!(overlay.get("a").is_none());
        assert!(overlay.get("b").is_some());
        assert!(overlay.get("c").is_some());
        assert_eq!(overlay.len(), 2);
    }
}
