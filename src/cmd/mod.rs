//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                     |
//! |-----------|--------------------------------------|
//! | `auth`    | `Login`, `Logout`, `Profile`         |
//! | `process` | `Processes`, `Bundles`               |
//! | `element` | `Elements`, `Element`                |
//! | `bundle`  | `Bundle`                             |
//! | `watch`   | `Watch`                              |
//! | `config`  | `Config`                             |
//!
//! `client` builds the configured backend, session and caches they share.

pub mod auth;
pub mod bundle;
pub mod client;
pub mod config;
pub mod element;
pub mod process;
pub mod watch;

pub use auth::{cmd_login, cmd_logout, cmd_profile};
pub use bundle::cmd_bundle;
pub use config::cmd_config;
pub use element::{cmd_element, cmd_elements};
pub use process::{cmd_bundles, cmd_processes};
pub use watch::cmd_watch;
