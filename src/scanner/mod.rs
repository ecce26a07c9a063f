// Filesystem scanner.
//
// Recursive walk of each root with include/exclude filtering, depth and
// symlink policy, and OS junk-file rules. A native fast path delegates the
// walk to an external binary emitting tab-separated lines (path, mtime,
// size); any failure there falls back to the in-process walker.

pub mod external;

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Config;

/// OS metadata files never worth indexing.
const OS_JUNK_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// One walk result. `excluded_reason` is set for entries observed but
/// filtered, so callers can report skip counts.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub abs_path: PathBuf,
    pub mtime: i64,
    pub size: i64,
    pub excluded_reason: Option<&'static str>,
}

pub struct Scanner {
    include_ext: Vec<String>,
    include_files: Vec<String>,
    exclude_dirs: Vec<String>,
    exclude_globs: GlobSet,
    max_depth: usize,
    follow_symlinks: bool,
    max_file_bytes: u64,
}

impl Scanner {
    pub fn new(cfg: &Config) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in &cfg.exclude_globs {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!("Ignoring invalid exclude glob '{}': {}", pattern, e),
            }
        }
        let exclude_globs = builder.build().unwrap_or_else(|e| {
            warn!("Failed to build exclude glob set: {}", e);
            GlobSet::empty()
        });

        Self {
            include_ext: cfg.include_ext.iter().map(|e| e.to_lowercase()).collect(),
            include_files: cfg.include_files.clone(),
            exclude_dirs: cfg.exclude_dirs.clone(),
            exclude_globs,
            max_depth: cfg.max_depth,
            follow_symlinks: cfg.follow_symlinks,
            max_file_bytes: cfg.max_file_bytes,
        }
    }

    /// Enumerate one root. Tries the external fast path first when
    /// configured, else walks in-process.
    pub fn scan_root(&self, root: &Path) -> Vec<ScanEntry> {
        if let Some(entries) = external::try_external_scan(
            root,
            self.max_depth,
            self.follow_symlinks,
            &self.exclude_dirs,
        ) {
            debug!(
                "External scanner produced {} entries for {:?}",
                entries.len(),
                root
            );
            return entries
                .into_iter()
                .map(|(abs_path, mtime, size)| {
                    let excluded_reason = self.exclusion_reason(root, &abs_path, size as u64);
                    ScanEntry {
                        abs_path,
                        mtime,
                        size,
                        excluded_reason,
                    }
                })
                .collect();
        }
        self.walk_in_process(root)
    }

    fn walk_in_process(&self, root: &Path) -> Vec<ScanEntry> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .max_depth(self.max_depth.max(1))
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(|e| {
                if e.file_type().is_dir() {
                    let name = e.file_name().to_string_lossy();
                    !self.exclude_dirs.iter().any(|d| d == name.as_ref())
                } else {
                    true
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Walk error under {:?}: {}", root, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let abs_path = entry.path().to_path_buf();
            let excluded_reason = self.exclusion_reason(root, &abs_path, meta.len());
            entries.push(ScanEntry {
                abs_path,
                mtime,
                size: meta.len() as i64,
                excluded_reason,
            });
        }
        entries
    }

    /// Why a file is filtered, or None when it should be indexed.
    fn exclusion_reason(
        &self,
        root: &Path,
        abs_path: &Path,
        size: u64,
    ) -> Option<&'static str> {
        let file_name = abs_path.file_name()?.to_string_lossy();
        if OS_JUNK_FILES.iter().any(|j| *j == file_name.as_ref()) {
            return Some("os_junk");
        }

        let rel = abs_path.strip_prefix(root).unwrap_or(abs_path);
        for component in rel.components() {
            let name = component.as_os_str().to_string_lossy();
            if self.exclude_dirs.iter().any(|d| d == name.as_ref()) {
                return Some("excluded_dir");
            }
        }
        if self.exclude_globs.is_match(rel) {
            return Some("excluded_glob");
        }

        if self.include_files.iter().any(|f| f == file_name.as_ref()) {
            // Explicit include wins over extension filtering.
        } else {
            let ext = abs_path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !self.include_ext.iter().any(|e| *e == ext) {
                return Some("extension");
            }
        }

        if self.max_file_bytes > 0 && size > self.max_file_bytes {
            return Some("oversize");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn scanned_paths(entries: &[ScanEntry], root: &Path) -> Vec<String> {
        let mut paths: Vec<String> = entries
            .iter()
            .filter(|e| e.excluded_reason.is_none())
            .map(|e| {
                e.abs_path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn walk_applies_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/main.py", "print(1)");
        write(root, "node_modules/pkg/index.js", "x");
        write(root, "binary.dat", "x");
        write(root, "Makefile", "all:");
        write(root, ".DS_Store", "junk");

        let scanner = Scanner::new(&Config::default());
        let entries = scanner.scan_root(root);
        let paths = scanned_paths(&entries, root);
        assert_eq!(paths, vec!["Makefile", "src/main.py"]);

        let reasons: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.excluded_reason)
            .collect();
        assert!(reasons.contains(&"extension"));
        assert!(reasons.contains(&"os_junk"));
    }

    #[test]
    fn exclude_globs_filter_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/keep.py", "keep");
        write(root, "src/generated_pb2.py", "skip");

        let mut cfg = Config::default();
        cfg.exclude_globs = vec!["**/*_pb2.py".to_string()];
        let scanner = Scanner::new(&cfg);
        let paths = scanned_paths(&scanner.scan_root(root), root);
        assert_eq!(paths, vec!["src/keep.py"]);
    }

    #[test]
    fn oversize_files_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "big.py", &"x".repeat(2048));

        let mut cfg = Config::default();
        cfg.max_file_bytes = 1024;
        let scanner = Scanner::new(&cfg);
        let entries = scanner.scan_root(root);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].excluded_reason, Some("oversize"));
    }
}
