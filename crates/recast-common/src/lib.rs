//! Shared backend client for Recast.
//!
//! The hosted backend exposes four surfaces, each behind its own module:
//!
//! | Module     | Surface                         | Trait          |
//! |------------|---------------------------------|----------------|
//! | `rest`     | PostgREST tables                | `Database`     |
//! | `realtime` | Phoenix websocket change feeds  | `ChangeFeed`   |
//! | `storage`  | Object storage buckets          | `ObjectStore`  |
//! | `auth`     | GoTrue sessions                 | (inherent)     |
//!
//! `Backend` implements all three traits over a single HTTP client and a
//! single realtime socket. With the `memory` feature, `MemoryBackend`
//! implements the same traits in-process for tests.

pub mod auth;
pub mod backend;
pub mod change;
pub mod error;
pub mod filter;
#[cfg(feature = "memory")]
pub mod memory;
pub mod realtime;
pub mod rest;
pub mod storage;
pub mod table;

pub use auth::{Session, User};
pub use backend::{Backend, BackendConfig};
pub use change::{Binding, ChangeKind, EventFilter, PostgresChange, RowChange};
pub use error::BackendError;
pub use filter::{FilterOp, RowFilter};
pub use realtime::{ChangeFeed, ChannelConfig, Subscription};
pub use rest::Database;
pub use storage::{ObjectStore, UploadOptions};
pub use table::Table;
