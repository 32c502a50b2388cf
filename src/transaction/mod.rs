use crate::codec::EncodedFile;
use crate::error::Result;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Zero-byte marker inside a staging directory. Its existence is the sole
/// oracle of "finalize this staging directory on recovery".
pub const COMMIT_MARKER: &str = ".commit";

/// Prefix of transactional scratch directories. PublicKeys starting with it
/// are rejected, so the cleaner can always tell scratch from user data.
pub const STAGING_PREFIX: char = '~';

/// Records the provider's own recent writes so the watcher can tell them
/// apart from external edits. Entries expire past the threshold, keeping the
/// map bounded.
pub struct SelfWriteLog {
    threshold: Duration,
    entries: Mutex<HashMap<PathBuf, Instant>>,
}

impl SelfWriteLog {
    pub fn new(threshold: Duration) -> Self {
        SelfWriteLog {
            threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, path: &Path) {
        let mut entries = self.entries.lock().unwrap();
        let threshold = self.threshold;
        entries.retain(|_, t| t.elapsed() <= threshold);
        entries.insert(path.to_path_buf(), Instant::now());
    }

    /// Whether the provider wrote this path within the threshold.
    pub fn is_recent(&self, path: &Path) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(path)
            .map(|t| t.elapsed() <= self.threshold)
            .unwrap_or(false)
    }
}

/// Parse a staging directory name: `~~new` for inserts, `~new~old` for
/// updates and renames. Returns `(new, old)`.
pub fn parse_staging_name(name: &str) -> Option<(String, Option<String>)> {
    let rest = name.strip_prefix(STAGING_PREFIX)?;
    if let Some(new) = rest.strip_prefix(STAGING_PREFIX) {
        if new.is_empty() {
            return None;
        }
        return Some((new.to_string(), None));
    }
    let (new, old) = rest.split_once(STAGING_PREFIX)?;
    if new.is_empty() || old.is_empty() {
        return None;
    }
    Some((new.to_string(), Some(old.to_string())))
}

fn staging_name(new_key: &str, old_key: Option<&str>) -> String {
    match old_key {
        Some(old) => format!("~{new_key}~{old}"),
        None => format!("~~{new_key}"),
    }
}

/// Performs the filesystem effects of one mutation as an atomic group
/// commit: stage a sibling directory, write everything, mark it committed,
/// then swap via rename. Interrupted commits are finished or rolled back by
/// `cleanup_set` at startup.
pub struct TransactionEngine {
    root: PathBuf,
    self_writes: Arc<SelfWriteLog>,
}

impl TransactionEngine {
    pub fn new(root: PathBuf, self_writes: Arc<SelfWriteLog>) -> Self {
        TransactionEngine { root, self_writes }
    }

    /// Commit a directory-mode document. `old_key` is the current directory
    /// name for updates and renames, `None` for inserts.
    pub fn commit_directory(
        &self,
        set: &str,
        old_key: Option<&str>,
        new_key: &str,
        files: &[EncodedFile],
    ) -> Result<()> {
        let set_dir = self.root.join(set);
        std::fs::create_dir_all(&set_dir)?;

        let staging = set_dir.join(staging_name(new_key, old_key));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir(&staging)?;
        for file in files {
            std::fs::write(staging.join(&file.name), &file.contents)?;
        }

        // Everything is on disk; the marker makes the commit durable.
        std::fs::write(staging.join(COMMIT_MARKER), b"")?;

        if let Some(old) = old_key {
            let old_dir = set_dir.join(old);
            if old_dir.exists() {
                std::fs::remove_dir_all(&old_dir)?;
            }
        }
        let target = set_dir.join(new_key);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        self.self_writes.record(&target);
        std::fs::rename(&staging, &target)?;
        let _ = std::fs::remove_file(target.join(COMMIT_MARKER));

        log::debug!("Committed {set}/{new_key}");
        Ok(())
    }

    /// Delete a directory-mode document.
    pub fn remove_directory(&self, set: &str, key: &str) -> Result<()> {
        let dir = self.root.join(set).join(key);
        if dir.exists() {
            self.self_writes.record(&dir);
            std::fs::remove_dir_all(&dir)?;
        }
        log::debug!("Removed {set}/{key}");
        Ok(())
    }

    /// Append one record to a flat-mode set file. A single append is its own
    /// commit.
    pub fn append_flat(&self, set: &str, record: &[u8]) -> Result<()> {
        let path = self.root.join(set);
        self.self_writes.record(&path);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(record)?;
        Ok(())
    }

    /// Startup recovery for one directory-mode set: finalize staging entries
    /// carrying a commit marker, delete the rest, and strip stray markers
    /// left in live directories by a crash after the final rename.
    pub fn cleanup_set(&self, set: &str) -> Result<()> {
        let set_dir = self.root.join(set);
        if !set_dir.is_dir() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&set_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            if !name.starts_with(STAGING_PREFIX) {
                let marker = path.join(COMMIT_MARKER);
                if marker.exists() {
                    let _ = std::fs::remove_file(&marker);
                }
                continue;
            }

            let committed = path.join(COMMIT_MARKER).exists();
            match (committed, parse_staging_name(&name)) {
                (true, Some((new_key, old_key))) => {
                    if let Some(old) = old_key {
                        let old_dir = set_dir.join(&old);
                        if old_dir.exists() {
                            std::fs::remove_dir_all(&old_dir)?;
                        }
                    }
                    let target = set_dir.join(&new_key);
                    if target.exists() {
                        std::fs::remove_dir_all(&target)?;
                    }
                    std::fs::rename(&path, &target)?;
                    let _ = std::fs::remove_file(target.join(COMMIT_MARKER));
                    log::info!("Finalized interrupted commit {set}/{name} -> {new_key}");
                }
                _ => {
                    std::fs::remove_dir_all(&path)?;
                    log::info!("Discarded aborted staging directory {set}/{name}");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> TransactionEngine {
        TransactionEngine::new(
            tmp.path().to_path_buf(),
            Arc::new(SelfWriteLog::new(Duration::from_millis(1000))),
        )
    }

    fn file(name: &str, contents: &str) -> EncodedFile {
        EncodedFile {
            name: name.to_string(),
            contents: contents.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parse_staging_name() {
        assert_eq!(parse_staging_name("~~a"), Some(("a".into(), None)));
        assert_eq!(
            parse_staging_name("~new~old"),
            Some(("new".into(), Some("old".into())))
        );
        assert_eq!(parse_staging_name("plain"), None);
        assert_eq!(parse_staging_name("~broken"), None);
        assert_eq!(parse_staging_name("~~"), None);
    }

    #[test]
    fn test_commit_leaves_no_scratch() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        engine
            .commit_directory("templates", None, "a", &[file("config.json", "{}")])
            .unwrap();

        let doc_dir = tmp.path().join("templates/a");
        assert!(doc_dir.join("config.json").exists());
        assert!(!doc_dir.join(COMMIT_MARKER).exists());
        assert!(!tmp.path().join("templates/~~a").exists());
    }

    #[test]
    fn test_commit_rename_replaces_old_directory() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        engine
            .commit_directory("templates", None, "a", &[file("config.json", "{}")])
            .unwrap();
        engine
            .commit_directory("templates", Some("a"), "b", &[file("config.json", "{}")])
            .unwrap();

        assert!(!tmp.path().join("templates/a").exists());
        assert!(tmp.path().join("templates/b/config.json").exists());
    }

    #[test]
    fn test_cleanup_discards_unmarked_staging() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let staging = tmp.path().join("templates/~~a");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("config.json"), b"{}").unwrap();

        engine.cleanup_set("templates").unwrap();
        assert!(!staging.exists());
        assert!(!tmp.path().join("templates/a").exists());
    }

    #[test]
    fn test_cleanup_finalizes_marked_staging() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        // live version that the interrupted commit was replacing
        let live = tmp.path().join("templates/c");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("config.json"), b"{\"v\":1}").unwrap();

        let staging = tmp.path().join("templates/~c~c");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("config.json"), b"{\"v\":2}").unwrap();
        std::fs::write(staging.join(COMMIT_MARKER), b"").unwrap();

        engine.cleanup_set("templates").unwrap();

        assert!(!staging.exists());
        let contents = std::fs::read_to_string(live.join("config.json")).unwrap();
        assert_eq!(contents, "{\"v\":2}");
        assert!(!live.join(COMMIT_MARKER).exists());
    }

    #[test]
    fn test_cleanup_strips_stray_marker_from_live_directory() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let live = tmp.path().join("templates/a");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join(COMMIT_MARKER), b"").unwrap();

        engine.cleanup_set("templates").unwrap();
        assert!(live.exists());
        assert!(!live.join(COMMIT_MARKER).exists());
    }

    #[test]
    fn test_append_flat_accumulates_records() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        engine.append_flat("settings", b"{\"a\":1}\n").unwrap();
        engine.append_flat("settings", b"{\"a\":2}\n").unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("settings")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_self_write_log_expires() {
        let log = SelfWriteLog::new(Duration::from_millis(1));
        let path = Path::new("/tmp/x");
        log.record(path);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!log.is_recent(path));
    }
}
