//! Project configuration read from `.recast/recast.toml`.
//!
//! Values are layered file → environment → CLI:
//!
//! ```toml
//! [backend]
//! url = "https://abc.supabase.co"
//! anon_key = "eyJ..."
//! schema = "public"
//!
//! [auth]
//! provider = "keycloak"
//! redirect_url = "http://localhost:4200"
//! logout_url = "https://login.example.com/logout"
//!
//! [logging]
//! level = "info"
//! json = false
//! file = false
//! ```
//!
//! `RECAST_URL` and `RECAST_ANON_KEY` override the backend section,
//! `RECAST_LOG` (then `RUST_LOG`) overrides the log filter. A `.env` file in
//! the project directory is loaded first.

use anyhow::{Context, Result, bail};
use recast_common::BackendConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "recast.toml";
pub const SESSION_FILE: &str = "session.json";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// The `.recast` directory of a project.
pub fn get_recast_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".recast")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub anon_key: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            schema: default_schema(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    /// OAuth provider used by `recast login --oauth`
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Where the auth server redirects after an OAuth sign-in
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
    /// Identity-provider logout page shown after `recast logout`
    #[serde(default)]
    pub logout_url: Option<String>,
}

fn default_provider() -> String {
    "keycloak".to_string()
}

fn default_redirect_url() -> String {
    "http://localhost:4200".to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            redirect_url: default_redirect_url(),
            logout_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write a daily log file under `.recast/logs`
    #[serde(default)]
    pub file: bool,
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecastToml {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl RecastToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse recast.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(recast_dir: &Path) -> Result<Self> {
        let config_path = recast_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize recast.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match &self.backend.url {
            None => warnings.push(
                "No backend url configured: set [backend] url or RECAST_URL".to_string(),
            ),
            Some(url) if !is_http_url(url) => warnings.push(format!(
                "Invalid backend url '{}': expected http:// or https://",
                url
            )),
            Some(_) => {}
        }

        if self.backend.anon_key.as_deref().is_none_or(str::is_empty) {
            warnings.push(
                "No anon key configured: set [backend] anon_key or RECAST_ANON_KEY".to_string(),
            );
        }

        if self.backend.schema.trim().is_empty() {
            warnings.push("Empty backend schema".to_string());
        }

        if !is_http_url(&self.auth.redirect_url) {
            warnings.push(format!(
                "Invalid redirect_url '{}': expected http:// or https://",
                self.auth.redirect_url
            ));
        }

        if let Some(url) = &self.auth.logout_url
            && !is_http_url(url)
        {
            warnings.push(format!("Invalid logout_url '{}'", url));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            warnings.push(format!(
                "Invalid log level '{}'. Valid values: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        warnings
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Effective configuration: `recast.toml` plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct RecastConfig {
    pub project_dir: PathBuf,
    pub recast_dir: PathBuf,
    pub toml: RecastToml,
    /// CLI override: debug logging
    pub verbose: bool,
}

impl RecastConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let _ = dotenvy::from_path(project_dir.join(".env"));
        let recast_dir = get_recast_dir(&project_dir);
        let toml = RecastToml::load_or_default(&recast_dir)?;

        Ok(Self {
            project_dir,
            recast_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    /// Backend url (env → file).
    pub fn url(&self) -> Option<String> {
        env_non_empty("RECAST_URL").or_else(|| self.toml.backend.url.clone())
    }

    /// Anon key (env → file).
    pub fn anon_key(&self) -> Option<String> {
        env_non_empty("RECAST_ANON_KEY").or_else(|| self.toml.backend.anon_key.clone())
    }

    /// Log filter (CLI → env → file).
    pub fn log_filter(&self) -> String {
        if self.verbose {
            return "debug".to_string();
        }
        env_non_empty("RECAST_LOG")
            .or_else(|| env_non_empty("RUST_LOG"))
            .unwrap_or_else(|| self.toml.logging.level.clone())
    }

    pub fn backend_config(&self) -> Result<BackendConfig> {
        let Some(url) = self.url() else {
            bail!("No backend url configured. Set RECAST_URL or run 'recast config init'.");
        };
        let Some(anon_key) = self.anon_key() else {
            bail!("No anon key configured. Set RECAST_ANON_KEY or edit .recast/recast.toml.");
        };
        let mut config = BackendConfig::new(url, anon_key);
        config.schema = self.toml.backend.schema.clone();
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.recast_dir.join(CONFIG_FILE)
    }

    pub fn session_file(&self) -> PathBuf {
        self.recast_dir.join(SESSION_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.recast_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.log_dir()).with_context(|| {
            format!("Failed to create directory: {}", self.log_dir().display())
        })?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        // Environment fills in what the file leaves out.
        if self.url().is_some() {
            warnings.retain(|w| !w.starts_with("No backend url"));
        }
        if self.anon_key().is_some() {
            warnings.retain(|w| !w.starts_with("No anon key"));
        }
        warnings
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
