//! Authenticated HTTP channel to the live service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use tracing::{debug, info};

use crate::auth::AuthContext;
use crate::error::LiveError;
use crate::types::LiveId;

/// Substring the login page renders when the credentials are rejected.
pub const LOGIN_ERROR_MARKER: &str = "エラーメッセージ";

/// Base URLs of the service's HTTP endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub login_url: String,
    pub logout_url: String,
    pub api_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login_url: "https://secure.nicovideo.jp/secure/login?site=niconico".to_string(),
            logout_url: "https://secure.nicovideo.jp/secure/logout".to_string(),
            api_base: "http://live.nicovideo.jp/api/".to_string(),
        }
    }
}

impl Endpoints {
    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    pub fn player_status(&self, live_id: &LiveId) -> String {
        self.api(&format!("getplayerstatus?v={}", live_id))
    }

    pub fn heartbeat(&self, live_id: &LiveId) -> String {
        self.api(&format!("heartbeat?v={}", live_id))
    }

    pub fn post_key(&self, thread: u64, block_no: u64) -> String {
        self.api(&format!("getpostkey?thread={}&block_no={}", thread, block_no))
    }

    pub fn owner_post(&self, live_id: &LiveId) -> String {
        self.api(&format!("broadcast/{}", live_id))
    }
}

/// Requests a session makes over its authenticated channel.
///
/// Methods return raw bodies; decoding belongs to [`crate::codec`].
#[async_trait]
pub trait LiveApi: Send + Sync {
    async fn player_status(&self, live_id: &LiveId) -> Result<String, LiveError>;

    async fn heartbeat(&self, live_id: &LiveId) -> Result<String, LiveError>;

    async fn post_key(&self, thread: u64, block_no: u64) -> Result<String, LiveError>;

    /// Broadcast-management post, only permitted for the broadcaster.
    async fn owner_post(
        &self,
        live_id: &LiveId,
        mail: &str,
        body: &str,
        name: &str,
    ) -> Result<String, LiveError>;

    async fn logout(&self) -> Result<(), LiveError>;
}

/// Turns an [`AuthContext`] into an authenticated channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, auth: AuthContext) -> Result<Arc<dyn LiveApi>, LiveError>;
}

/// [`LiveApi`] over HTTP with a per-session cookie jar.
pub struct HttpLiveApi {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpLiveApi {
    async fn get_text(&self, url: String) -> Result<String, LiveError> {
        debug!("GET {}", url);
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl LiveApi for HttpLiveApi {
    async fn player_status(&self, live_id: &LiveId) -> Result<String, LiveError> {
        self.get_text(self.endpoints.player_status(live_id)).await
    }

    async fn heartbeat(&self, live_id: &LiveId) -> Result<String, LiveError> {
        self.get_text(self.endpoints.heartbeat(live_id)).await
    }

    async fn post_key(&self, thread: u64, block_no: u64) -> Result<String, LiveError> {
        self.get_text(self.endpoints.post_key(thread, block_no)).await
    }

    async fn owner_post(
        &self,
        live_id: &LiveId,
        mail: &str,
        body: &str,
        name: &str,
    ) -> Result<String, LiveError> {
        let body = self
            .client
            .post(self.endpoints.owner_post(live_id))
            .form(&[("mail", mail), ("body", body), ("name", name)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    async fn logout(&self) -> Result<(), LiveError> {
        self.client
            .get(&self.endpoints.logout_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Builds [`HttpLiveApi`] channels, logging in when given credentials.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    endpoints: Endpoints,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(endpoints: Endpoints, timeout: Duration) -> Self {
        Self { endpoints, timeout }
    }

    fn client(&self, jar: Arc<Jar>) -> Result<reqwest::Client, LiveError> {
        Ok(reqwest::Client::builder()
            .cookie_provider(jar)
            .timeout(self.timeout)
            .user_agent(concat!("nicolive/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, auth: AuthContext) -> Result<Arc<dyn LiveApi>, LiveError> {
        let client = match auth {
            AuthContext::Credentials { mail, password } => {
                let client = self.client(Arc::new(Jar::default()))?;
                let page = client
                    .post(&self.endpoints.login_url)
                    .form(&[("mail", mail.as_str()), ("password", password.as_str())])
                    .send()
                    .await?
                    .text()
                    .await?;
                if page.contains(LOGIN_ERROR_MARKER) {
                    return Err(LiveError::Login);
                }
                info!("Logged in as {}", mail);
                client
            }
            AuthContext::Cookies(jar) => self.client(jar)?,
        };

        Ok(Arc::new(HttpLiveApi {
            client,
            endpoints: self.endpoints.clone(),
        }))
    }
}
