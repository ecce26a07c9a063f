// External scanner fast path.
//
// When `DECKARD_SCANNER_BIN` names a binary, the walk is delegated to it:
// the subprocess emits `path\tmtime\tsize` lines on stdout and is killed
// after `SARI_RUST_SCANNER_TIMEOUT_SEC` (default 120 s). Any failure
// returns None so the caller falls back to the in-process walker.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

fn scanner_bin() -> Option<PathBuf> {
    let raw = std::env::var("DECKARD_SCANNER_BIN").ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let path = PathBuf::from(shellexpand::tilde(raw).to_string());
    if path.exists() { Some(path) } else { None }
}

fn scan_timeout() -> Duration {
    let secs = std::env::var("SARI_RUST_SCANNER_TIMEOUT_SEC")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(120);
    Duration::from_secs(secs.max(1))
}

/// Run the external scanner; None means "use the in-process walker".
pub fn try_external_scan(
    root: &Path,
    max_depth: usize,
    follow_symlinks: bool,
    exclude_dirs: &[String],
) -> Option<Vec<(PathBuf, i64, i64)>> {
    let bin = scanner_bin()?;

    let mut cmd = Command::new(&bin);
    cmd.arg("--root")
        .arg(root)
        .arg("--max-depth")
        .arg(max_depth.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if follow_symlinks {
        cmd.arg("--follow-symlinks");
    }
    for dir in exclude_dirs {
        if !dir.trim().is_empty() {
            cmd.arg("--exclude-dir").arg(dir.trim());
        }
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!("External scanner {:?} failed to spawn: {}", bin, e);
            return None;
        }
    };

    let timeout = scan_timeout();
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => break,
            Ok(Some(status)) => {
                warn!("External scanner exited with {}", status);
                return None;
            }
            Ok(None) => {
                if started.elapsed() > timeout {
                    warn!(
                        "External scanner timed out after {:?}; killing and falling back",
                        timeout
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("External scanner wait failed: {}", e);
                return None;
            }
        }
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        if out.read_to_string(&mut stdout).is_err() {
            return None;
        }
    }

    let mut entries = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.split('\t');
        let (Some(path), Some(mtime), Some(size)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if parts.next().is_some() {
            continue;
        }
        let (Ok(mtime), Ok(size)) = (mtime.parse::<i64>(), size.parse::<i64>()) else {
            continue;
        };
        entries.push((PathBuf::from(path), mtime, size));
    }
    debug!("External scanner returned {} entries", entries.len());
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn absent_binary_falls_back() {
        // SAFETY: serialized test; no concurrent env readers.
        unsafe {
            std::env::remove_var("DECKARD_SCANNER_BIN");
        }
        assert!(try_external_scan(Path::new("/tmp"), 4, false, &[]).is_none());
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn parses_tab_separated_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_scanner.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf '/a/b.py\\t100\\t10\\n'\nprintf 'garbage-line\\n'\nprintf '/a/c.py\\t200\\t20\\n'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        // SAFETY: serialized test; no concurrent env readers.
        unsafe {
            std::env::set_var("DECKARD_SCANNER_BIN", &script);
        }
        let entries = try_external_scan(Path::new("/a"), 4, false, &[]).unwrap();
        unsafe {
            std::env::remove_var("DECKARD_SCANNER_BIN");
        }
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, 100);
        assert_eq!(entries[1].2, 20);
    }
}
