// src/watcher/mod.rs

//! Removal watches on instance files.
//!
//! Each watched file's parent directory is registered with the OS watcher.
//! Debounced change batches are drained on a tokio task, which fires the
//! callbacks of watched files that are gone. Callbacks run after the watch
//! table lock has been released and must not call back into the orchestrator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Invoked once with the removed path
pub type RemovalCallback = Box<dyn FnOnce(&Path) + Send + 'static>;

/// Subscribes callbacks to file removal
pub trait FileWatcher: Send + Sync {
    /// Calls `callback` once `path` no longer exists.
    ///
    /// A second watch on the same path replaces the first.
    fn watch_removal(&self, path: PathBuf, callback: RemovalCallback);

    /// Drops the watch on `path`, returning whether one existed
    fn unwatch(&self, path: &Path) -> bool;
}

/// Watcher errors
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create file watcher: {0}")]
    Init(String),
}

#[derive(Default)]
struct WatchTable {
    /// Watched files
    callbacks: HashMap<PathBuf, RemovalCallback>,

    /// Watched files per registered directory
    directories: HashMap<PathBuf, usize>,
}

/// `FileWatcher` backed by OS file notifications
pub struct NotifyWatcher {
    table: Mutex<WatchTable>,
    debouncer: Mutex<Debouncer<RecommendedWatcher>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<DebounceEventResult>>>,
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

impl NotifyWatcher {
    /// Creates a watcher that settles bursts of changes for `debounce`
    pub fn new(debounce: Duration) -> Result<Self, WatcherError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            table: Mutex::new(WatchTable::default()),
            debouncer: Mutex::new(debouncer),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Number of active watches
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).callbacks.len()
    }

    /// Whether nothing is watched
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires the callbacks of every watched file that no longer exists.
    ///
    /// Returns the number of callbacks fired.
    pub fn sweep(&self) -> usize {
        let (fired, released) = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let removed: Vec<PathBuf> = table
                .callbacks
                .keys()
                .filter(|path| !path.exists())
                .cloned()
                .collect();

            let mut fired = Vec::with_capacity(removed.len());
            let mut released = Vec::new();
            for path in removed {
                if let Some(callback) = table.callbacks.remove(&path) {
                    if let Some(dir) = Self::release(&mut table, &path) {
                        released.push(dir);
                    }
                    fired.push((path, callback));
                }
            }
            (fired, released)
        };

        for dir in released {
            self.unregister(&dir);
        }

        let count = fired.len();
        for (path, callback) in fired {
            debug!(path = %path.display(), "Watched file removed");
            callback(&path);
        }
        count
    }

    /// Starts the event task. It ends once the watcher is dropped.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let watcher: Weak<Self> = Arc::downgrade(self);
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner()).take();

        tokio::spawn(async move {
            let Some(mut events) = events else {
                warn!("File watcher task already running");
                return;
            };

            while let Some(result) = events.recv().await {
                let Some(watcher) = watcher.upgrade() else {
                    break;
                };
                match result {
                    Ok(_) => {
                        watcher.sweep();
                    }
                    Err(e) => warn!("File watch error: {}", e),
                }
            }

            info!("File watcher stopped");
        })
    }

    /// Drops one reference to `path`'s directory; returns it when unused
    fn release(table: &mut WatchTable, path: &Path) -> Option<PathBuf> {
        let dir = parent_dir(path);
        let remaining = match table.directories.get_mut(&dir) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return None,
        };
        if remaining == 0 {
            table.directories.remove(&dir);
            Some(dir)
        } else {
            None
        }
    }

    fn register(&self, dir: &Path) {
        let mut debouncer = self.debouncer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = debouncer.watcher().watch(dir, RecursiveMode::NonRecursive) {
            warn!(dir = %dir.display(), "Failed to watch directory: {}", e);
        }
    }

    fn unregister(&self, dir: &Path) {
        let mut debouncer = self.debouncer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = debouncer.watcher().unwatch(dir) {
            // The directory itself may already be gone
            debug!(dir = %dir.display(), "Failed to unwatch directory: {}", e);
        }
    }
}

impl FileWatcher for NotifyWatcher {
    fn watch_removal(&self, path: PathBuf, callback: RemovalCallback) {
        debug!(path = %path.display(), "Watching for removal");
        let dir = parent_dir(&path);

        let first = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if table.callbacks.insert(path, callback).is_some() {
                false
            } else {
                let count = table.directories.entry(dir.clone()).or_insert(0);
                *count += 1;
                *count == 1
            }
        };

        if first {
            self.register(&dir);
        }
    }

    fn unwatch(&self, path: &Path) -> bool {
        let released = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if table.callbacks.remove(path).is_none() {
                return false;
            }
            Self::release(&mut table, path)
        };

        if let Some(dir) = released {
            self.unregister(&dir);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn watcher() -> Arc<NotifyWatcher> {
        Arc::new(NotifyWatcher::new(Duration::from_millis(20)).unwrap())
    }

    #[tokio::test]
    async fn fires_once_when_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("disk.info");
        std::fs::write(&file, b"{}").unwrap();

        let watcher = watcher();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        watcher.watch_removal(file.clone(), Box::new(move |path: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(path.to_path_buf());
        }));
        let _task = watcher.spawn();

        std::fs::remove_file(&file).unwrap();
        let removed = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

        assert_eq!(removed, file);
        assert_eq!(watcher.sweep(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watcher.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_sibling_leaves_other_watches_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("disk.info");
        let other = dir.path().join("other.info");
        std::fs::write(&kept, b"{}").unwrap();
        std::fs::write(&other, b"{}").unwrap();

        let watcher = watcher();
        watcher.watch_removal(kept.clone(), Box::new(|_: &Path| panic!("should not fire")));
        let (tx, rx) = tokio::sync::oneshot::channel();
        watcher.watch_removal(other.clone(), Box::new(move |_: &Path| {
            let _ = tx.send(());
        }));
        let _task = watcher.spawn();

        std::fs::write(dir.path().join("scratch"), b"noise").unwrap();
        std::fs::remove_file(&other).unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

        assert_eq!(watcher.len(), 1);
        assert!(watcher.unwatch(&kept));
    }

    #[test]
    fn callback_may_rewatch_without_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone");
        let watcher = watcher();

        let inner = watcher.clone();
        let next = dir.path().join("next");
        watcher.watch_removal(gone, Box::new(move |_: &Path| {
            inner.watch_removal(next, Box::new(|_: &Path| {}));
        }));

        assert_eq!(watcher.sweep(), 1);
        assert_eq!(watcher.len(), 1);
    }

    #[test]
    fn unwatch_drops_callback() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher();
        let path = dir.path().join("disk.info");
        watcher.watch_removal(path.clone(), Box::new(|_: &Path| panic!("should not fire")));

        assert!(watcher.unwatch(&path));
        assert!(!watcher.unwatch(&path));
        assert_eq!(watcher.sweep(), 0);
    }

    #[tokio::test]
    async fn event_task_stops_with_watcher() {
        let watcher = watcher();
        let handle = watcher.spawn();

        drop(watcher);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
