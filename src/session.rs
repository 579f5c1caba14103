//! Authentication session bridge.
//!
//! Wraps the shared `Backend` and keeps its session alive across CLI
//! invocations: the session is persisted to `.recast/session.json`, restored
//! (and refreshed when close to expiry) on start, and refreshed in the
//! background for long-running commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use recast_common::auth::REFRESH_MARGIN_SECS;
use recast_common::{Backend, Session};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::RecastError;

pub struct SessionBridge {
    backend: Arc<Backend>,
    store: Option<PathBuf>,
}

impl SessionBridge {
    /// `store` is where the session is persisted; `None` keeps it in memory.
    pub fn new(backend: Arc<Backend>, store: Option<PathBuf>) -> Self {
        Self { backend, store }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn current(&self) -> Option<Session> {
        self.backend.session()
    }

    /// Observe sign-in, refresh and sign-out.
    pub fn sessions(&self) -> watch::Receiver<Option<Session>> {
        self.backend.sessions()
    }

    pub fn require(&self) -> Result<Session, RecastError> {
        self.current().ok_or(RecastError::NotAuthenticated)
    }

    /// Load the persisted session, refreshing it when it is about to expire.
    /// A session that can no longer be refreshed is discarded.
    pub async fn restore(&self) -> Result<Option<Session>, RecastError> {
        let Some(path) = &self.store else {
            return Ok(self.current());
        };
        let Some(session) = read_session(path)? else {
            return Ok(None);
        };

        let now = chrono::Utc::now().timestamp();
        if !session.is_expired(now, REFRESH_MARGIN_SECS) {
            self.backend.set_session(Some(session.clone()));
            return Ok(Some(session));
        }

        match self.backend.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => {
                let refreshed = keep_user(refreshed, &session);
                self.backend.set_session(Some(refreshed.clone()));
                self.persist(&refreshed)?;
                Ok(Some(refreshed))
            }
            Err(e) => {
                tracing::warn!(error = %e, "stored session could not be refreshed, signing out");
                self.forget()?;
                Ok(None)
            }
        }
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RecastError> {
        let session = self.backend.sign_in_with_password(email, password).await?;
        self.persist(&session)?;
        Ok(session)
    }

    /// URL that starts an OAuth sign-in in the browser.
    pub fn authorize_url(&self, provider: &str, redirect_to: &str) -> Result<String, RecastError> {
        Ok(self.backend.authorize_url(provider, redirect_to)?.to_string())
    }

    /// Finish an OAuth sign-in from the URL the browser landed on.
    pub async fn complete_redirect(&self, redirect: &str) -> Result<Session, RecastError> {
        let session = self.backend.complete_redirect(redirect).await?;
        self.persist(&session)?;
        Ok(session)
    }

    /// Revoke the session and remove the persisted copy. The local session
    /// is dropped even when the server cannot be reached.
    pub async fn sign_out(&self) -> Result<(), RecastError> {
        let result = self.backend.sign_out().await;
        self.forget()?;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "server-side sign-out failed");
        }
        Ok(result?)
    }

    /// Refresh the session shortly before each expiry until aborted,
    /// persisting every refreshed session.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        self.backend.spawn_session_refresh(move |session| {
            if let Some(path) = &store
                && let Err(e) = write_session(path, session)
            {
                tracing::warn!(error = %e, "failed to persist refreshed session");
            }
        })
    }

    fn persist(&self, session: &Session) -> Result<(), RecastError> {
        match &self.store {
            Some(path) => write_session(path, session),
            None => Ok(()),
        }
    }

    fn forget(&self) -> Result<(), RecastError> {
        self.backend.set_session(None);
        if let Some(path) = &self.store
            && path.exists()
        {
            std::fs::remove_file(path).map_err(|source| RecastError::Write {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Refresh responses may omit the user; keep the one we already know.
fn keep_user(mut refreshed: Session, previous: &Session) -> Session {
    if refreshed.user.is_none() {
        refreshed.user = previous.user.clone();
    }
    refreshed
}

pub fn read_session(path: &Path) -> Result<Option<Session>, RecastError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| RecastError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_str(&content) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
            Ok(None)
        }
    }
}

pub fn write_session(path: &Path, session: &Session) -> Result<(), RecastError> {
    let write_err = |source| RecastError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let content = serde_json::to_string_pretty(session)
        .map_err(|e| RecastError::Other(anyhow::Error::new(e).context("Failed to serialize session")))?;
    std::fs::write(path, content).map_err(write_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(write_err)?;
    }
    Ok(())
}
