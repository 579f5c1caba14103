//! Recast client library.
//!
//! Realtime-synced caches of processes, steps, elements and their properties,
//! the view models derived from them, and the session and configuration
//! plumbing used by the `recast` CLI.

pub mod config;
pub mod errors;
pub mod facade;
pub mod import;
pub mod logging;
pub mod models;
pub mod session;
pub mod view_model;

pub use config::{RecastConfig, RecastToml};
pub use errors::RecastError;
pub use facade::Facades;
pub use session::SessionBridge;
pub use view_model::{ElementViewModel, ViewModelService};
