//! Recast device daemon.
//!
//! Watches a local data folder while an `upload` row is active and pushes the
//! newest file to object storage when the upload is closed.
//!
//! | Module    | Purpose                                      |
//! |-----------|----------------------------------------------|
//! | `config`  | CLI flags with environment fallbacks         |
//! | `error`   | `DeviceError`                                |
//! | `watcher` | Folder watching and newest-file selection    |
//! | `upload`  | The `Idle`/`Watching` upload state machine   |

pub mod config;
pub mod error;
pub mod upload;
pub mod watcher;

pub use config::DeviceConfig;
pub use error::DeviceError;
pub use upload::{Outcome, UploadManager, UploadRow};
pub use watcher::FolderWatcher;
