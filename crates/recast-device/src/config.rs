use std::path::PathBuf;

use clap::Parser;
use recast_common::BackendConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "recast-device")]
#[command(version, about = "Upload the newest data file whenever an upload is closed")]
pub struct DeviceConfig {
    /// Backend base url
    #[arg(long, env = "RECAST_URL")]
    pub url: String,

    /// Public (anon) API key
    #[arg(long, env = "RECAST_ANON_KEY", hide_env_values = true)]
    pub anon_key: String,

    /// Device account email; the daemon signs in when set together with a password
    #[arg(long, env = "RECAST_DEVICE_EMAIL")]
    pub email: Option<String>,

    #[arg(long, env = "RECAST_DEVICE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Skip the `devices` lookup and use this id
    #[arg(long, env = "RECAST_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Local folder that upload folders live in. Cleared on start.
    #[arg(long, env = "RECAST_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Log filter, e.g. `info` or `recast_device=debug`. Falls back to
    /// `RUST_LOG`, then `info`.
    #[arg(long, env = "RECAST_LOG")]
    pub log: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json: bool,
}

impl DeviceConfig {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.url, &self.anon_key)
    }

    pub fn log_filter(&self) -> String {
        resolve_log_filter(self.log.as_deref(), std::env::var("RUST_LOG").ok().as_deref())
    }

    /// Email and password, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.email, &self.password) {
            (Some(email), Some(password)) if !email.is_empty() => Some((email, password)),
            _ => None,
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "info";

fn resolve_log_filter(flag: Option<&str>, rust_log: Option<&str>) -> String {
    [flag, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}
