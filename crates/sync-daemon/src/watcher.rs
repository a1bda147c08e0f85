//! Watches the shared remote directory for writes from other devices.
//!
//! Uses notify-debouncer-mini so a burst of writes to one record (temp file
//! plus rename) arrives as a single change.

use anyhow::Result;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Change observed in the shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    /// A project record was written or removed.
    Project { project_id: String, removed: bool },
    /// The project list watermark moved (a project was created or deleted).
    ProjectList,
}

/// Last seen mtime per record, to drop events for files that did not change
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

pub struct RemoteWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<RemoteChange>,
}

impl RemoteWatcher {
    /// Watch `root` (the directory a `DirectoryRemote` writes to).
    pub fn new(root: PathBuf, debounce: Duration) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        // FSEvents on macOS needs the real path (/private/var/...)
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(change) = Self::classify(&event.path, &root_clone, &mtime_cache) {
                            if event_tx.send(change).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Remote directory watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Map a changed path to a remote change, or `None` for files the
    /// remote does not own (temp files, unrelated files).
    fn classify(path: &Path, root: &Path, mtime_cache: &MtimeCache) -> Option<RemoteChange> {
        let relative = path.strip_prefix(root).ok()?;
        let relative_str = relative.to_str()?;

        if relative_str == "meta.json" {
            return Some(RemoteChange::ProjectList);
        }

        let project_id = relative_str
            .strip_prefix("projects/")?
            .strip_suffix(".json")?;
        if project_id.contains('/') || project_id.starts_with('.') {
            return None;
        }

        let removed = !path.exists();
        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        if removed {
            cache.remove(relative);
        } else if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
            if cache.get(relative) == Some(&mtime) {
                return None;
            }
            cache.insert(relative.to_path_buf(), mtime);
        }

        debug!("Remote change: {} (removed: {})", project_id, removed);
        Some(RemoteChange::Project {
            project_id: project_id.to_string(),
            removed,
        })
    }

    /// Get the receiver for remote changes.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<RemoteChange> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> MtimeCache {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[test]
    fn test_classify_project_record() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("projects")).unwrap();
        let path = root.join("projects/p1.json");
        std::fs::write(&path, b"{}").unwrap();

        let cache = cache();
        assert_eq!(
            RemoteWatcher::classify(&path, root, &cache),
            Some(RemoteChange::Project {
                project_id: "p1".into(),
                removed: false
            })
        );
        // Same mtime again is not a change
        assert_eq!(RemoteWatcher::classify(&path, root, &cache), None);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            RemoteWatcher::classify(&path, root, &cache),
            Some(RemoteChange::Project {
                project_id: "p1".into(),
                removed: true
            })
        );
    }

    #[test]
    fn test_classify_ignores_temp_and_foreign_files() {
        let root = Path::new("/shared");
        let cache = cache();
        assert_eq!(
            RemoteWatcher::classify(Path::new("/shared/projects/p1.json.tmp"), root, &cache),
            None
        );
        assert_eq!(
            RemoteWatcher::classify(Path::new("/shared/notes.txt"), root, &cache),
            None
        );
        assert_eq!(
            RemoteWatcher::classify(Path::new("/shared/meta.json"), root, &cache),
            Some(RemoteChange::ProjectList)
        );
    }
}
