//! Shared setup for commands that talk to the backend.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use recast::config::RecastConfig;
use recast::facade::Facades;
use recast::logging::{self, LogOptions};
use recast::models::Process;
use recast::session::SessionBridge;
use recast_common::{Backend, Session};
use tracing_appender::non_blocking::WorkerGuard;

pub struct Client {
    pub config: RecastConfig,
    pub session: SessionBridge,
    pub facades: Facades,
    _log_guard: Option<WorkerGuard>,
}

impl Client {
    /// Load configuration, install logging and restore any stored session.
    pub async fn connect(project_dir: &Path, verbose: bool) -> Result<Self> {
        let config = RecastConfig::with_cli_args(project_dir.to_path_buf(), verbose)?;
        let log_guard = logging::init(&LogOptions::from_config(&config))?;

        let backend = Arc::new(Backend::new(config.backend_config()?).context("Failed to create backend client")?);
        let session = SessionBridge::new(Arc::clone(&backend), Some(config.session_file()));
        session.restore().await?;
        let facades = Facades::new(backend.clone(), backend);

        Ok(Self {
            config,
            session,
            facades,
            _log_guard: log_guard,
        })
    }

    /// Like `connect`, but requires a session and loads every table once.
    pub async fn signed_in(project_dir: &Path, verbose: bool) -> Result<Self> {
        let client = Self::connect(project_dir, verbose).await?;
        client.session.require()?;
        client.facades.refresh().await;
        Ok(client)
    }

    pub fn current_session(&self) -> Result<Session> {
        Ok(self.session.require()?)
    }

    /// Find a process by numeric id or by exact name.
    pub fn resolve_process(&self, key: &str) -> Result<Process> {
        let processes = &self.facades.processes;
        let found = match key.parse::<i64>() {
            Ok(id) => processes.by_id(id).or_else(|| processes.by_name(key)),
            Err(_) => processes.by_name(key),
        };
        match found {
            Some(process) => Ok(process),
            None => bail!("Process '{}' not found", key),
        }
    }
}
