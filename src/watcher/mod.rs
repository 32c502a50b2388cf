use crate::schema::StorageMode;
use crate::transaction::{SelfWriteLog, STAGING_PREFIX};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An external filesystem change resolved to its entity set. `public_key`
/// identifies the affected document for directory-mode sets and is `None`
/// for flat sets, where the file is the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalChange {
    pub set: String,
    pub public_key: Option<String>,
}

/// Watches the data directory recursively, debounces events, drops anything
/// inside transactional scratch, and suppresses the provider's own writes
/// within the configured threshold.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    _thread: std::thread::JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching. Resolved external changes arrive on the returned
    /// receiver, debounced (100ms) and deduplicated per document.
    pub fn start(
        root: &Path,
        sets: Vec<(String, StorageMode)>,
        self_writes: Arc<SelfWriteLog>,
    ) -> Result<(Self, mpsc::Receiver<ExternalChange>), notify::Error> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();
        let (event_tx, event_rx) = mpsc::channel::<ExternalChange>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let root = root.to_path_buf();
        let modes: HashMap<String, StorageMode> = sets.into_iter().collect();

        // Background thread to process events with debouncing
        let thread = std::thread::spawn(move || {
            let debounce = Duration::from_millis(100);
            let mut pending: Vec<ExternalChange> = Vec::new();
            let mut last_event = Instant::now();

            loop {
                match notify_rx.recv_timeout(debounce) {
                    Ok(Ok(event)) => {
                        if !matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            continue;
                        }
                        for path in &event.paths {
                            let change = match resolve_change(&root, &modes, path) {
                                Some(c) => c,
                                None => continue,
                            };
                            // Skip what we wrote ourselves moments ago.
                            if self_writes.is_recent(&document_path(&root, &change)) {
                                continue;
                            }
                            pending.push(change);
                        }
                        last_event = Instant::now();
                    }
                    Ok(Err(e)) => {
                        log::warn!("File watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        // Debounce: if enough time has passed since the last event, flush
                        if !pending.is_empty() && last_event.elapsed() >= debounce {
                            let mut seen = HashSet::new();
                            for change in pending.drain(..) {
                                if !seen.insert(change.clone()) {
                                    continue;
                                }
                                if event_tx.send(change).is_err() {
                                    return; // Receiver dropped
                                }
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        // Watcher was dropped, exit the thread
                        break;
                    }
                }
            }
        });

        Ok((
            FileWatcher {
                _watcher: watcher,
                _thread: thread,
            },
            event_rx,
        ))
    }
}

/// Resolve an event path to (entity set, publicKey). Paths outside a
/// registered set, inside staging directories, or pointing at dot-files are
/// not external changes.
fn resolve_change(
    root: &Path,
    modes: &HashMap<String, StorageMode>,
    path: &Path,
) -> Option<ExternalChange> {
    let rel = path.strip_prefix(root).ok()?;

    let mut parts = rel.components().filter_map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    });
    let set = parts.next()?.to_string();
    let mode = *modes.get(&set)?;
    let second = parts.next();

    if rel.components().any(|c| {
        matches!(c, Component::Normal(s)
            if s.to_string_lossy().starts_with(STAGING_PREFIX))
    }) {
        return None;
    }

    match mode {
        StorageMode::Flat => second.is_none().then(|| ExternalChange {
            set,
            public_key: None,
        }),
        StorageMode::Directory => {
            let public_key = second?;
            if public_key.starts_with('.') {
                return None;
            }
            Some(ExternalChange {
                set,
                public_key: Some(public_key.to_string()),
            })
        }
    }
}

/// The path the self-write log keys on for a change: the document directory
/// for directory-mode sets, the set file for flat sets.
fn document_path(root: &Path, change: &ExternalChange) -> PathBuf {
    match &change.public_key {
        Some(pk) => root.join(&change.set).join(pk),
        None => root.join(&change.set),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes() -> HashMap<String, StorageMode> {
        HashMap::from([
            ("templates".to_string(), StorageMode::Directory),
            ("settings".to_string(), StorageMode::Flat),
        ])
    }

    #[test]
    fn test_resolve_directory_document() {
        let change = resolve_change(
            Path::new("/data"),
            &modes(),
            Path::new("/data/templates/invoice/config.json"),
        )
        .unwrap();
        assert_eq!(change.set, "templates");
        assert_eq!(change.public_key.as_deref(), Some("invoice"));
    }

    #[test]
    fn test_resolve_flat_set_file() {
        let change = resolve_change(
            Path::new("/data"),
            &modes(),
            Path::new("/data/settings"),
        )
        .unwrap();
        assert_eq!(change.set, "settings");
        assert!(change.public_key.is_none());
    }

    #[test]
    fn test_staging_paths_ignored() {
        assert!(resolve_change(
            Path::new("/data"),
            &modes(),
            Path::new("/data/templates/~a~b/config.json"),
        )
        .is_none());
        assert!(resolve_change(
            Path::new("/data"),
            &modes(),
            Path::new("/data/templates/~~a"),
        )
        .is_none());
    }

    #[test]
    fn test_unregistered_and_bare_paths_ignored() {
        assert!(resolve_change(
            Path::new("/data"),
            &modes(),
            Path::new("/data/schema.yaml"),
        )
        .is_none());
        // the set directory itself is not a document
        assert!(resolve_change(
            Path::new("/data"),
            &modes(),
            Path::new("/data/templates"),
        )
        .is_none());
    }
}
