//! GoTrue-style authentication: password grant, refresh, OAuth redirect.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{Backend, check_status};
use crate::error::BackendError;

/// Refresh this long before the access token expires.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Wait before retrying a failed background refresh.
const REFRESH_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    /// Unix seconds. Filled from `expires_in` when the server omits it.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub user: Option<User>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn user_id(&self) -> Option<Uuid> {
        self.user.as_ref().map(|u| u.id)
    }

    /// Whether the token expires within `margin_secs` of `now`.
    /// Sessions without a known expiry never count as expired.
    pub fn is_expired(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at.is_some_and(|at| at - margin_secs <= now)
    }

    fn with_expiry(mut self, now: i64) -> Self {
        if self.expires_at.is_none() && self.expires_in > 0 {
            self.expires_at = Some(now + self.expires_in);
        }
        self
    }

    /// Parse the session the auth server appends to the redirect URL after
    /// an OAuth sign-in (`#access_token=..&refresh_token=..&expires_in=..`).
    pub fn from_redirect_url(redirect: &str) -> Result<Self, BackendError> {
        let url = Url::parse(redirect).map_err(|e| BackendError::InvalidUrl {
            url: redirect.to_string(),
            message: e.to_string(),
        })?;
        let params = url.fragment().or(url.query()).unwrap_or_default();
        // Reuse the query parser for the fragment.
        let parsed = Url::parse(&format!("http://localhost/?{}", params)).map_err(|e| {
            BackendError::InvalidUrl {
                url: redirect.to_string(),
                message: e.to_string(),
            }
        })?;
        let get = |key: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        };

        if let Some(error) = get("error_description").or_else(|| get("error")) {
            return Err(BackendError::Auth(error));
        }
        let access_token = get("access_token")
            .ok_or_else(|| BackendError::Auth("redirect URL carries no access_token".into()))?;
        let refresh_token = get("refresh_token")
            .ok_or_else(|| BackendError::Auth("redirect URL carries no refresh_token".into()))?;

        let session = Self {
            access_token,
            refresh_token,
            token_type: get("token_type").unwrap_or_else(default_token_type),
            expires_in: get("expires_in").and_then(|v| v.parse().ok()).unwrap_or(0),
            expires_at: get("expires_at").and_then(|v| v.parse().ok()),
            user: None,
        };
        Ok(session.with_expiry(chrono::Utc::now().timestamp()))
    }
}

impl Backend {
    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<Session, BackendError> {
        let url = self.config().endpoint("auth/v1/token")?;
        let resp = self
            .http()
            .post(url)
            .header("apikey", &self.config().anon_key)
            .query(&[("grant_type", grant_type)])
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await.map_err(|e| match e {
            BackendError::Status { message, .. } => BackendError::Auth(message),
            other => other,
        })?;
        let session = resp.json::<Session>().await?;
        Ok(session.with_expiry(chrono::Utc::now().timestamp()))
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        tracing::info!(email, "signed in with password");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, BackendError> {
        let session = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        tracing::debug!(expires_at = ?session.expires_at, "session refreshed");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    /// Refresh the session shortly before each expiry until the task is
    /// aborted or the backend is dropped. `on_refresh` sees every new session.
    pub fn spawn_session_refresh<F>(self: &Arc<Self>, on_refresh: F) -> JoinHandle<()>
    where
        F: Fn(&Session) + Send + 'static,
    {
        let backend = Arc::downgrade(self);
        let mut sessions = self.sessions();
        tokio::spawn(async move {
            loop {
                let current = sessions.borrow_and_update().clone();
                let Some((session, expires_at)) =
                    current.and_then(|s| s.expires_at.map(|at| (s, at)))
                else {
                    if sessions.changed().await.is_err() {
                        break;
                    }
                    continue;
                };

                let now = chrono::Utc::now().timestamp();
                let wait = (expires_at - REFRESH_MARGIN_SECS - now).max(0) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                    changed = sessions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(backend) = backend.upgrade() else { break };
                match backend.refresh_session(&session.refresh_token).await {
                    Ok(mut refreshed) => {
                        // Refresh responses may omit the user.
                        if refreshed.user.is_none() && session.user.is_some() {
                            refreshed.user = session.user.clone();
                            backend.set_session(Some(refreshed.clone()));
                        }
                        on_refresh(&refreshed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "session refresh failed, retrying");
                        tokio::time::sleep(REFRESH_RETRY).await;
                    }
                }
            }
        })
    }

    /// URL that starts the OAuth flow for `provider` in a browser.
    pub fn authorize_url(&self, provider: &str, redirect_to: &str) -> Result<Url, BackendError> {
        let mut url = self.config().endpoint("auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to);
        Ok(url)
    }

    pub async fn fetch_user(&self, access_token: &str) -> Result<User, BackendError> {
        let url = self.config().endpoint("auth/v1/user")?;
        let resp = self
            .http()
            .get(url)
            .header("apikey", &self.config().anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        Ok(check_status(resp).await?.json::<User>().await?)
    }

    /// Finish an OAuth sign-in from the URL the browser was redirected to.
    pub async fn complete_redirect(&self, redirect: &str) -> Result<Session, BackendError> {
        let mut session = Session::from_redirect_url(redirect)?;
        if session.user.is_none() {
            session.user = Some(self.fetch_user(&session.access_token).await?);
        }
        tracing::info!(user = ?session.user_id(), "signed in via redirect");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    /// Revoke the current session server-side and drop it locally. The local
    /// session is cleared even when the server call fails.
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        if self.session().is_none() {
            return Ok(());
        }
        let result = async {
            let url = self.config().endpoint("auth/v1/logout")?;
            // `request` authenticates with the session being revoked.
            let resp = self.request(Method::POST, url).send().await?;
            check_status(resp).await.map(|_| ())
        }
        .await;
        self.set_session(None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;

    #[test]
    fn parses_session_from_fragment() {
        let session = Session::from_redirect_url(
            "http://localhost:4200/#access_token=abc&refresh_token=def&expires_in=3600&token_type=bearer",
        )
        .unwrap();
        assert_eq!(session.access_token, "abc");
        assert_eq!(session.refresh_token, "def");
        assert_eq!(session.expires_in, 3600);
        assert!(session.expires_at.is_some());
        assert!(session.user.is_none());
    }

    #[test]
    fn redirect_error_is_reported() {
        let err = Session::from_redirect_url(
            "http://localhost:4200/#error=access_denied&error_description=User+cancelled",
        )
        .unwrap_err();
        match err {
            BackendError::Auth(msg) => assert_eq!(msg, "User cancelled"),
            other => panic!("Expected Auth error, got {other}"),
        }
    }

    #[test]
    fn redirect_without_tokens_is_rejected() {
        assert!(Session::from_redirect_url("http://localhost:4200/").is_err());
    }

    #[test]
    fn expiry_respects_margin() {
        let session = Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            expires_at: Some(1_000),
            user: None,
        };
        assert!(!session.is_expired(900, 60));
        assert!(session.is_expired(950, 60));
        assert!(session.is_expired(1_001, 0));

        let no_expiry = Session { expires_at: None, ..session };
        assert!(!no_expiry.is_expired(i64::MAX, 0));
    }

    #[test]
    fn authorize_url_carries_provider_and_redirect() {
        let backend = Backend::new(BackendConfig::new("https://abc.supabase.co", "anon")).unwrap();
        let url = backend
            .authorize_url("keycloak", "http://localhost:4200")
            .unwrap();
        assert_eq!(url.path(), "/auth/v1/authorize");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("provider".into(), "keycloak".into())));
        assert!(pairs.contains(&("redirect_to".into(), "http://localhost:4200".into())));
    }

    #[tokio::test]
    async fn sign_out_without_session_is_a_no_op() {
        let backend = Backend::new(BackendConfig::new("http://127.0.0.1:9", "anon")).unwrap();
        backend.sign_out().await.unwrap();
        assert!(backend.session().is_none());
    }
}
