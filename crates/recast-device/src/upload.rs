//! Upload state machine.
//!
//! An `upload` row with `active = true` starts a watcher on
//! `data_dir/local_folder_name`; the update that sets `active = false` stops
//! it and pushes the newest file to `bucket` at `prefix/<file name>`. One
//! watcher at a time, no retries, no queueing.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use recast_common::{
    Binding, ChangeFeed, ChangeKind, ChannelConfig, Database, ObjectStore, PostgresChange,
    RowChange, RowFilter, Table, UploadOptions,
};
use serde::Deserialize;

use crate::error::DeviceError;
use crate::watcher::FolderWatcher;

pub const CHANNEL: &str = "upload";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadRow {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub local_folder_name: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRow {
    device_id: String,
}

pub enum UploadState {
    Idle,
    Watching {
        upload_id: Option<i64>,
        watcher: FolderWatcher,
    },
}

/// What handling one change did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ignored,
    DeviceChanged(String),
    Started { folder: PathBuf },
    Uploaded { bucket: String, key: String },
    NothingToUpload,
    Failed(String),
}

pub struct UploadManager {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    data_dir: PathBuf,
    device_id: Option<String>,
    state: UploadState,
}

impl UploadManager {
    pub fn new(
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        data_dir: impl Into<PathBuf>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            db,
            store,
            data_dir: data_dir.into(),
            device_id,
            state: UploadState::Idle,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_watching(&self) -> bool {
        matches!(self.state, UploadState::Watching { .. })
    }

    /// All upload events plus device inserts and updates.
    pub fn channel() -> ChannelConfig {
        ChannelConfig::new(CHANNEL)
            .on(Binding::all(Table::Upload))
            .on(Binding::on(ChangeKind::Insert, Table::Devices))
            .on(Binding::on(ChangeKind::Update, Table::Devices))
    }

    /// Clear the data directory, resolve the device id and resume an upload
    /// that is already active. Query failures are logged and leave the
    /// manager idle; only a data directory that cannot be reset is fatal.
    pub async fn startup(&mut self) -> Result<(), DeviceError> {
        self.clear_data_dir()?;
        if let Err(e) = self.resume_active_upload().await {
            tracing::error!(error = %e, "startup check failed");
        }
        Ok(())
    }

    async fn resume_active_upload(&mut self) -> Result<(), DeviceError> {
        if self.device_id.is_none() {
            self.device_id = self.lookup_device_id().await?;
        }
        let Some(device_id) = self.device_id.clone() else {
            tracing::warn!("no device id found, waiting for one");
            return Ok(());
        };
        tracing::info!(device_id = %device_id, "using device id");

        let rows = self
            .db
            .select(
                Table::Upload,
                &[RowFilter::eq("device_id", &device_id), RowFilter::is("active", true)],
            )
            .await?;
        let active = rows
            .into_iter()
            .find_map(|row| serde_json::from_value::<UploadRow>(row).ok());
        match active {
            Some(row) => {
                tracing::info!(prefix = %row.prefix, "active upload found on startup");
                self.open(&row);
            }
            None => tracing::info!("no active upload on startup, waiting"),
        }
        Ok(())
    }

    async fn lookup_device_id(&self) -> Result<Option<String>, DeviceError> {
        let rows = self.db.select(Table::Devices, &[]).await?;
        Ok(rows
            .into_iter()
            .find_map(|row| serde_json::from_value::<DeviceRow>(row).ok())
            .map(|d| d.device_id))
    }

    pub async fn handle_change(&mut self, change: &PostgresChange) -> Outcome {
        match change.table.parse::<Table>() {
            Ok(Table::Devices) => self.handle_device(change),
            Ok(Table::Upload) => self.handle_upload(change).await,
            _ => Outcome::Ignored,
        }
    }

    fn handle_device(&mut self, change: &PostgresChange) -> Outcome {
        match change.decode::<DeviceRow>() {
            Ok(RowChange::Insert(device) | RowChange::Update(device)) => {
                tracing::info!(device_id = %device.device_id, "device id updated");
                self.device_id = Some(device.device_id.clone());
                Outcome::DeviceChanged(device.device_id)
            }
            Ok(RowChange::Delete(_)) => Outcome::Ignored,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable device change");
                Outcome::Ignored
            }
        }
    }

    async fn handle_upload(&mut self, change: &PostgresChange) -> Outcome {
        let (row, is_update) = match change.decode::<UploadRow>() {
            Ok(RowChange::Insert(row)) => (row, false),
            Ok(RowChange::Update(row)) => (row, true),
            Ok(RowChange::Delete(_)) => return Outcome::Ignored,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable upload change");
                return Outcome::Ignored;
            }
        };

        if let (Some(mine), Some(theirs)) = (&self.device_id, &row.device_id)
            && mine != theirs
        {
            tracing::debug!(device_id = %theirs, "upload for another device");
            return Outcome::Ignored;
        }

        if row.active {
            return self.open(&row);
        }
        if is_update {
            return self.close(&row).await;
        }
        Outcome::Ignored
    }

    /// Start watching the upload's folder, replacing any current watcher.
    fn open(&mut self, row: &UploadRow) -> Outcome {
        let Some(folder) = folder_for(&self.data_dir, &row.local_folder_name) else {
            tracing::warn!(folder = %row.local_folder_name, "rejecting upload folder outside the data directory");
            return Outcome::Failed(format!("invalid folder '{}'", row.local_folder_name));
        };
        if let UploadState::Watching { upload_id, .. } = &self.state {
            tracing::info!(?upload_id, "replacing active watcher");
        }
        self.state = UploadState::Idle;

        tracing::info!(prefix = %row.prefix, "active upload");
        match FolderWatcher::start(&folder) {
            Ok(watcher) => {
                self.state = UploadState::Watching {
                    upload_id: row.id,
                    watcher,
                };
                Outcome::Started { folder }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start watcher");
                Outcome::Failed(e.to_string())
            }
        }
    }

    /// Stop the watcher and upload the newest file. A close for a different
    /// upload than the one being watched leaves the watcher running.
    async fn close(&mut self, row: &UploadRow) -> Outcome {
        let state = std::mem::replace(&mut self.state, UploadState::Idle);
        let watcher = match state {
            UploadState::Idle => {
                tracing::info!("nothing to upload");
                return Outcome::NothingToUpload;
            }
            UploadState::Watching { upload_id, watcher } => {
                if let (Some(watching), Some(closing)) = (upload_id, row.id)
                    && watching != closing
                {
                    self.state = UploadState::Watching { upload_id, watcher };
                    return Outcome::Ignored;
                }
                watcher
            }
        };

        let Some(path) = watcher.stop() else {
            tracing::info!("nothing to upload");
            return Outcome::NothingToUpload;
        };

        match self.upload(&row.bucket, &row.prefix, &path).await {
            Ok(key) => {
                if let Err(e) = self.clear_data_dir() {
                    tracing::warn!(error = %e, "failed to clear data directory");
                }
                tracing::info!("waiting for upload");
                Outcome::Uploaded {
                    bucket: row.bucket.clone(),
                    key,
                }
            }
            Err(e) => {
                // Data stays on disk for inspection.
                tracing::error!(error = %e, path = %path.display(), "upload failed");
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn upload(&self, bucket: &str, prefix: &str, path: &Path) -> Result<String, DeviceError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = object_key(prefix, &file_name);
        let body = tokio::fs::read(path).await.map_err(DeviceError::io(path))?;

        tracing::debug!(bucket, key = %key, bytes = body.len(), "uploading");
        self.store
            .upload(bucket, &key, body, &UploadOptions::default())
            .await
            .map_err(|source| DeviceError::Upload {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(bucket, key = %key, "uploaded");
        Ok(key)
    }

    fn clear_data_dir(&self) -> Result<(), DeviceError> {
        tracing::debug!(path = %self.data_dir.display(), "clearing data directory");
        if self.data_dir.exists() {
            std::fs::remove_dir_all(&self.data_dir).map_err(DeviceError::io(&self.data_dir))?;
        }
        std::fs::create_dir_all(&self.data_dir).map_err(DeviceError::io(&self.data_dir))?;
        Ok(())
    }

    /// Subscribe, run startup and handle changes until the feed closes.
    pub async fn run(mut self, feed: Arc<dyn ChangeFeed>) -> Result<(), DeviceError> {
        let mut subscription = feed.subscribe(Self::channel()).await?;
        self.startup().await?;

        while let Some(change) = subscription.recv().await {
            let outcome = self.handle_change(&change).await;
            tracing::debug!(?outcome, "handled {} on {}", change.kind.as_str(), change.table);
        }
        tracing::info!("change feed closed");
        Ok(())
    }
}

fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// `data_dir/name`, or `None` when `name` would leave the data directory.
fn folder_for(data_dir: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| data_dir.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recast_common::memory::MemoryBackend;
    use serde_json::{Value, json};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        data_dir: PathBuf,
        db: Arc<MemoryBackend>,
        manager: UploadManager,
    }

    fn fixture(device_id: Option<&str>) -> Fixture {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let db = Arc::new(MemoryBackend::new());
        let manager = UploadManager::new(
            db.clone(),
            db.clone(),
            &data_dir,
            device_id.map(str::to_string),
        );
        Fixture {
            _dir: dir,
            data_dir,
            db,
            manager,
        }
    }

    fn upload_row(id: i64, active: bool) -> Value {
        json!({
            "id": id,
            "device_id": "dev-1",
            "active": active,
            "bucket": "measurements",
            "prefix": "line-3/run-7",
            "local_folder_name": "scope"
        })
    }

    fn change(kind: ChangeKind, table: Table, record: Value) -> PostgresChange {
        PostgresChange::new(kind, table, record, Value::Null)
    }

    #[tokio::test]
    async fn open_then_close_uploads_newest_file() {
        let mut f = fixture(Some("dev-1"));
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Insert, Table::Upload, upload_row(1, true)))
            .await;
        assert!(matches!(outcome, Outcome::Started { .. }));
        assert!(f.manager.is_watching());

        let folder = f.data_dir.join("scope");
        std::fs::write(folder.join("old.csv"), "old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::write(folder.join("new.csv"), "new").unwrap();

        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Update, Table::Upload, upload_row(1, false)))
            .await;
        assert_eq!(
            outcome,
            Outcome::Uploaded {
                bucket: "measurements".into(),
                key: "line-3/run-7/new.csv".into()
            }
        );
        assert!(!f.manager.is_watching());

        let stored = f.db.object("measurements", "line-3/run-7/new.csv").unwrap();
        assert_eq!(stored.body, b"new");
        assert_eq!(stored.options, UploadOptions::default());
        assert_eq!(f.db.object_keys().len(), 1);
        // Cleared after a successful upload.
        assert!(f.data_dir.is_dir());
        assert!(!folder.exists());
    }

    #[tokio::test]
    async fn close_without_files_uploads_nothing() {
        let mut f = fixture(Some("dev-1"));
        f.manager
            .handle_change(&change(ChangeKind::Insert, Table::Upload, upload_row(1, true)))
            .await;
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Update, Table::Upload, upload_row(1, false)))
            .await;
        assert_eq!(outcome, Outcome::NothingToUpload);
        assert!(f.db.object_keys().is_empty());

        // Closing again while idle is harmless.
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Update, Table::Upload, upload_row(1, false)))
            .await;
        assert_eq!(outcome, Outcome::NothingToUpload);
    }

    #[tokio::test]
    async fn failed_upload_keeps_data() {
        let mut f = fixture(Some("dev-1"));
        f.manager
            .handle_change(&change(ChangeKind::Insert, Table::Upload, upload_row(1, true)))
            .await;
        let file = f.data_dir.join("scope").join("trace.bin");
        std::fs::write(&file, [0u8; 4]).unwrap();

        f.db.set_failing(true);
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Update, Table::Upload, upload_row(1, false)))
            .await;
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(!f.manager.is_watching());
        assert!(file.exists());
    }

    #[tokio::test]
    async fn other_devices_and_other_uploads_are_ignored() {
        let mut f = fixture(Some("dev-1"));
        let mut foreign = upload_row(1, true);
        foreign["device_id"] = json!("dev-2");
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Insert, Table::Upload, foreign))
            .await;
        assert_eq!(outcome, Outcome::Ignored);
        assert!(!f.manager.is_watching());

        f.manager
            .handle_change(&change(ChangeKind::Insert, Table::Upload, upload_row(1, true)))
            .await;
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Update, Table::Upload, upload_row(2, false)))
            .await;
        assert_eq!(outcome, Outcome::Ignored);
        assert!(f.manager.is_watching());
    }

    #[tokio::test]
    async fn device_rows_update_device_id() {
        let mut f = fixture(None);
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Insert, Table::Devices, json!({"device_id": "dev-9"})))
            .await;
        assert_eq!(outcome, Outcome::DeviceChanged("dev-9".into()));
        assert_eq!(f.manager.device_id(), Some("dev-9"));
    }

    #[tokio::test]
    async fn startup_clears_data_and_resumes_active_upload() {
        let mut f = fixture(None);
        std::fs::create_dir_all(f.data_dir.join("stale")).unwrap();
        std::fs::write(f.data_dir.join("stale/left.csv"), "x").unwrap();
        f.db.seed(Table::Devices, vec![json!({"device_id": "dev-1"})]);
        f.db.seed(Table::Upload, vec![upload_row(4, false), upload_row(5, true)]);

        f.manager.startup().await.unwrap();
        assert_eq!(f.manager.device_id(), Some("dev-1"));
        assert!(!f.data_dir.join("stale").exists());
        assert!(f.manager.is_watching());
        assert!(f.data_dir.join("scope").is_dir());
    }

    #[tokio::test]
    async fn startup_without_device_waits() {
        let mut f = fixture(None);
        f.manager.startup().await.unwrap();
        assert!(f.manager.device_id().is_none());
        assert!(!f.manager.is_watching());
        assert!(f.data_dir.is_dir());
    }

    #[tokio::test]
    async fn startup_survives_backend_errors() {
        let mut f = fixture(None);
        f.db.seed(Table::Devices, vec![json!({"device_id": "dev-1"})]);
        f.db.seed(Table::Upload, vec![upload_row(5, true)]);
        f.db.set_failing(true);

        f.manager.startup().await.unwrap();
        assert!(f.manager.device_id().is_none());
        assert!(!f.manager.is_watching());
        assert!(f.data_dir.is_dir());

        // Still reacts to upload rows once the backend recovers.
        f.db.set_failing(false);
        let outcome = f
            .manager
            .handle_change(&change(ChangeKind::Insert, Table::Upload, upload_row(5, true)))
            .await;
        assert!(matches!(outcome, Outcome::Started { .. }));
    }

    #[tokio::test]
    async fn run_handles_feed_events() {
        let f = fixture(Some("dev-1"));
        let db = f.db.clone();
        let data_dir = f.data_dir.clone();
        let task = tokio::spawn(f.manager.run(db.clone()));

        while db.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        db.write_external(Table::Upload, upload_row(1, true));
        let folder = data_dir.join("scope");
        for _ in 0..200 {
            if folder.is_dir() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        std::fs::write(folder.join("capture.dat"), "data").unwrap();
        db.write_external(Table::Upload, upload_row(1, false));

        for _ in 0..200 {
            if !db.object_keys().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            db.object_keys(),
            vec![("measurements".to_string(), "line-3/run-7/capture.dat".to_string())]
        );
        task.abort();
    }

    #[test]
    fn keys_and_folders() {
        assert_eq!(object_key("a/b/", "f.csv"), "a/b/f.csv");
        assert_eq!(object_key("", "f.csv"), "f.csv");
        let data = Path::new("/data");
        assert_eq!(folder_for(data, "scope/run"), Some(PathBuf::from("/data/scope/run")));
        assert_eq!(folder_for(data, "../etc"), None);
        assert_eq!(folder_for(data, "/etc"), None);
    }
}
