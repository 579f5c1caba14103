//! Folder watching for an active upload.
//!
//! The watcher only records the order in which files were touched. The file
//! to upload is picked on `stop` by scanning the folder: newest creation time
//! (modification time where the filesystem has none), ties broken by the most
//! recent watcher event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, mpsc};
use std::time::SystemTime;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::error::DeviceError;

pub struct FolderWatcher {
    folder: PathBuf,
    watcher: RecommendedWatcher,
    // Mutex keeps `FolderWatcher` Sync.
    events: Mutex<mpsc::Receiver<Event>>,
    order: HashMap<PathBuf, u64>,
    next_seq: u64,
}

impl FolderWatcher {
    /// Create `folder` if needed and start watching it recursively.
    pub fn start(folder: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let folder = folder.into();
        std::fs::create_dir_all(&folder).map_err(DeviceError::io(&folder))?;
        // Events carry absolute paths.
        let folder = folder.canonicalize().map_err(DeviceError::io(&folder))?;

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "folder watcher error"),
            }
        })
        .map_err(|source| DeviceError::Watch {
            path: folder.clone(),
            source,
        })?;
        watcher
            .watch(&folder, RecursiveMode::Recursive)
            .map_err(|source| DeviceError::Watch {
                path: folder.clone(),
                source,
            })?;

        tracing::info!(folder = %folder.display(), "watching folder");
        Ok(Self {
            folder,
            watcher,
            events: Mutex::new(rx),
            order: HashMap::new(),
            next_seq: 1,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Record pending create/modify events.
    pub fn drain(&mut self) {
        let Ok(events) = self.events.get_mut() else {
            tracing::warn!("watcher event channel poisoned");
            return;
        };
        while let Ok(event) = events.try_recv() {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            for path in event.paths {
                self.order.insert(path, self.next_seq);
                self.next_seq += 1;
            }
        }
    }

    /// Stop watching and return the newest file in the folder, if any.
    pub fn stop(mut self) -> Option<PathBuf> {
        self.drain();
        if let Err(e) = self.watcher.unwatch(&self.folder) {
            tracing::debug!(error = %e, "unwatch failed");
        }
        latest_file(&self.folder, &self.order)
    }
}

/// Newest regular file under `folder`.
pub fn latest_file(folder: &Path, order: &HashMap<PathBuf, u64>) -> Option<PathBuf> {
    let candidates = WalkDir::new(folder)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            let stamp = meta.created().or_else(|_| meta.modified()).ok()?;
            let seq = order.get(entry.path()).copied().unwrap_or(0);
            Some((entry.into_path(), stamp, seq))
        })
        .collect();
    pick_latest(candidates)
}

fn pick_latest(candidates: Vec<(PathBuf, SystemTime, u64)>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .max_by_key(|(_, stamp, seq)| (*stamp, *seq))
        .map(|(path, _, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn newest_stamp_wins() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let picked = pick_latest(vec![
            (PathBuf::from("a"), t0 + Duration::from_secs(5), 0),
            (PathBuf::from("b"), t0, 9),
        ]);
        assert_eq!(picked, Some(PathBuf::from("a")));
    }

    #[test]
    fn ties_go_to_latest_event() {
        let t0 = SystemTime::UNIX_EPOCH;
        let picked = pick_latest(vec![
            (PathBuf::from("a"), t0, 2),
            (PathBuf::from("b"), t0, 5),
            (PathBuf::from("c"), t0, 0),
        ]);
        assert_eq!(picked, Some(PathBuf::from("b")));
        assert_eq!(pick_latest(Vec::new()), None);
    }

    #[test]
    fn scans_nested_files_only() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run/sub")).unwrap();
        assert_eq!(latest_file(dir.path(), &HashMap::new()), None);

        std::fs::write(dir.path().join("run/first.csv"), "1").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(dir.path().join("run/sub/second.csv"), "2").unwrap();

        assert_eq!(
            latest_file(dir.path(), &HashMap::new()),
            Some(dir.path().join("run/sub/second.csv"))
        );
    }

    #[test]
    fn stop_returns_file_written_while_watching() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("measurements");
        let watcher = FolderWatcher::start(&folder).unwrap();
        assert!(folder.is_dir());

        std::fs::write(folder.join("result.bin"), [1u8, 2, 3]).unwrap();
        let picked = watcher.stop().unwrap();
        assert_eq!(picked.file_name().unwrap(), "result.bin");
    }

    #[test]
    fn watcher_can_move_between_threads() {
        fn assert_send_sync<T: Send + Sync>(_: &T) {}
        let dir = tempdir().unwrap();
        let watcher = FolderWatcher::start(dir.path()).unwrap();
        assert_send_sync(&watcher);

        let folder = watcher.folder().to_path_buf();
        let handle = std::thread::spawn(move || {
            std::fs::write(folder.join("late.csv"), "x").unwrap();
            watcher.stop()
        });
        let picked = handle.join().unwrap().unwrap();
        assert_eq!(picked.file_name().unwrap(), "late.csv");
    }
}
