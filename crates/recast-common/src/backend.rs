use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, Url};
use tokio::sync::watch;

use crate::auth::Session;
use crate::change::DEFAULT_SCHEMA;
use crate::error::BackendError;
use crate::realtime::RealtimeClient;

/// How often the realtime socket sends a Phoenix heartbeat.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Pause between realtime reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    pub schema: String,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            anon_key: anon_key.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            heartbeat: DEFAULT_HEARTBEAT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Absolute URL for a path below the project base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        let raw = format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&raw).map_err(|e| BackendError::InvalidUrl {
            url: raw,
            message: e.to_string(),
        })
    }

    /// Websocket URL of the realtime service.
    pub fn realtime_url(&self) -> Result<Url, BackendError> {
        let mut url = self.endpoint("realtime/v1/websocket")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(BackendError::InvalidUrl {
                    url: self.url.clone(),
                    message: format!("unsupported scheme '{}'", other),
                });
            }
        };
        url.set_scheme(scheme).map_err(|_| BackendError::InvalidUrl {
            url: self.url.clone(),
            message: "cannot derive websocket scheme".to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

/// Client for the hosted backend.
///
/// Holds the current auth session in a `watch` channel so REST requests,
/// the realtime socket and any number of observers all see the same token.
pub struct Backend {
    config: BackendConfig,
    http: reqwest::Client,
    session: watch::Sender<Option<Session>>,
    pub(crate) realtime: RealtimeClient,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let realtime = RealtimeClient::new(
            config.realtime_url()?,
            config.heartbeat,
            config.reconnect_delay,
        );
        let (session, _rx) = watch::channel(None);
        Ok(Self {
            config,
            http: reqwest::Client::new(),
            session,
            realtime,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    /// Observe session changes (sign-in, refresh, sign-out).
    pub fn sessions(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    pub fn set_session(&self, session: Option<Session>) {
        let token = session.as_ref().map(|s| s.access_token.clone());
        self.session.send_replace(session);
        self.realtime.set_access_token(token);
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn bearer(&self) -> String {
        self.session
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.config.anon_key.clone())
    }

    /// Request builder carrying the API key and the current bearer token.
    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(self.bearer())
    }
}

/// Turn a non-success response into `BackendError::Status` with the body
/// message (PostgREST and GoTrue both return JSON with a `message` field).
pub(crate) async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or(body);
    Err(BackendError::Status {
        status: status.as_u16(),
        message,
    })
}
