use anyhow::{Context, Result};
use nicolive::{AuthContext, Endpoints, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [session]
//                    backlog = 50
//
//   env var:         RELAY_SESSION__BACKLOG=50   (double underscore = nesting)
//
//   (single underscore stays within field names: RELAY_SESSION__HEARTBEAT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub account: AccountFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub upstream: UpstreamFileConfig,
}

/// Listener knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Comments buffered per websocket client before drops start
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

/// Upstream account (lives under `[account]` in config.toml).
///
/// `cookie_file` wins over `mail`/`password` when both are set.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountFileConfig {
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
}

impl std::fmt::Debug for AccountFileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountFileConfig")
            .field("mail", &self.mail)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cookie_file", &self.cookie_file)
            .finish()
    }
}

/// Session tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_backlog")]
    pub backlog: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            backlog: default_backlog(),
            connect_timeout_secs: default_connect_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

/// Service URLs (lives under `[upstream]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamFileConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_logout_url")]
    pub logout_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for UpstreamFileConfig {
    fn default() -> Self {
        let endpoints = Endpoints::default();
        Self {
            login_url: endpoints.login_url,
            logout_url: endpoints.logout_url,
            api_base: endpoints.api_base,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_subscriber_queue() -> usize {
    256
}
fn default_heartbeat_secs() -> u64 {
    45
}
fn default_backlog() -> u64 {
    100
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_login_url() -> String {
    Endpoints::default().login_url
}
fn default_logout_url() -> String {
    Endpoints::default().logout_url
}
fn default_api_base() -> String {
    Endpoints::default().api_base
}

/// Build a figment that layers: defaults → config.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_ACCOUNT__COOKIE_FILE=/tmp/cookies.txt`  →  `account.cookie_file = ...`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime views (derived from FileConfig)
// =============================================================================

impl SessionFileConfig {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            backlog: self.backlog,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        }
    }
}

impl UpstreamFileConfig {
    pub fn to_endpoints(&self) -> Endpoints {
        Endpoints {
            login_url: self.login_url.clone(),
            logout_url: self.logout_url.clone(),
            api_base: self.api_base.clone(),
        }
    }
}

/// Where credentials for new sessions come from.
#[derive(Clone)]
pub enum AccountSource {
    Credentials { mail: String, password: String },
    CookieFile(PathBuf),
}

impl AccountSource {
    pub fn from_file(fc: &AccountFileConfig) -> Result<Self> {
        if let Some(path) = &fc.cookie_file {
            return Ok(Self::CookieFile(path.clone()));
        }
        match (&fc.mail, &fc.password) {
            (Some(mail), Some(password)) => Ok(Self::Credentials {
                mail: mail.clone(),
                password: password.clone(),
            }),
            _ => anyhow::bail!(
                "No upstream account configured: set [account] cookie_file, or mail and password"
            ),
        }
    }

    /// A fresh context for one new session.
    pub async fn auth_context(&self) -> Result<AuthContext, nicolive::LiveError> {
        match self {
            Self::Credentials { mail, password } => {
                Ok(AuthContext::credentials(mail.clone(), password.clone()))
            }
            Self::CookieFile(path) => AuthContext::from_cookie_file(path).await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Credentials { mail, .. } => format!("login as {}", mail),
            Self::CookieFile(path) => format!("cookies from {}", path.display()),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayDirs {
    pub data_dir: PathBuf,
}

impl RelayDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".comment-relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
