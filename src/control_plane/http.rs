//! HTTP control plane
//!
//! Talks JSON to a management API. Every request carries the gateway's
//! access key as a bearer token.
//!
//! | Operation              | Request                              |
//! |------------------------|--------------------------------------|
//! | resolve_token          | `GET /api/v1/tokens/{token}`         |
//! | create_session         | `POST /api/v1/sessions`              |
//! | mark_* (lifecycle)     | `PATCH /api/v1/sessions/{id}`        |
//! | audit_storage_config   | `GET /api/v1/terminal/config`        |
//! | heartbeat              | `POST /api/v1/terminal/heartbeat`    |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{ControlPlane, ControlTask, TokenGrant};
use crate::config::{HttpControlPlaneConfig, StorageConfig};
use crate::error::{ProxyError, Result};
use crate::session::{Session, SessionLifecycle};

/// Control plane reached over HTTP(S).
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: Url,
    access_key: Zeroizing<String>,
}

#[derive(Deserialize)]
struct GrantResponse {
    username: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    password: String,
    host: String,
    port: u16,
    #[serde(default)]
    database: Option<String>,
    #[serde(default = "default_permitted")]
    permitted: bool,
    #[serde(default)]
    user: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    asset: String,
    #[serde(default)]
    org_id: String,
}

fn default_permitted() -> bool {
    true
}

impl From<GrantResponse> for TokenGrant {
    fn from(r: GrantResponse) -> Self {
        TokenGrant {
            username: r.username,
            secret: Zeroizing::new(r.secret),
            password: Zeroizing::new(r.password),
            host: r.host,
            port: r.port,
            database: r.database,
            permitted: r.permitted,
            user: r.user,
            user_id: r.user_id,
            asset: r.asset,
            org_id: r.org_id,
        }
    }
}

#[derive(Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Deserialize)]
struct TerminalConfig {
    #[serde(default)]
    storage: StorageConfig,
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    sessions: &'a [Uuid],
}

#[derive(Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    tasks: Vec<serde_json::Value>,
}

impl HttpControlPlane {
    pub fn new(config: &HttpControlPlaneConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ProxyError::Config(format!("Invalid control plane URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ProxyError::Config(format!(
                "Control plane URL cannot be a base: {}",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            base_url,
            access_key: Zeroizing::new(config.access_key.clone()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProxyError::Config("Control plane URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.access_key.as_str())
    }

    async fn update_status(&self, session_id: Uuid, status: &str, reason: Option<&str>) -> Result<()> {
        let id = session_id.to_string();
        let url = self.endpoint(&["api", "v1", "sessions", &id])?;
        let response = self
            .request(reqwest::Method::PATCH, url)
            .json(&StatusUpdate { status, reason })
            .send()
            .await?;
        check_status(response, "session update").await?;
        Ok(())
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::ControlPlane(format!(
        "{} failed with {}: {}",
        what, status, body
    )))
}

#[async_trait]
impl SessionLifecycle for HttpControlPlane {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let url = self.endpoint(&["api", "v1", "sessions"])?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(session)
            .send()
            .await?;
        check_status(response, "session create").await?;
        Ok(())
    }

    async fn mark_connected(&self, session_id: Uuid) -> Result<()> {
        self.update_status(session_id, "connected", None).await
    }

    async fn mark_failed(&self, session_id: Uuid, reason: &str) -> Result<()> {
        self.update_status(session_id, "failed", Some(reason)).await
    }

    async fn mark_disconnected(&self, session_id: Uuid) -> Result<()> {
        self.update_status(session_id, "disconnected", None).await
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn resolve_token(&self, token: &str) -> Result<TokenGrant> {
        let url = self.endpoint(&["api", "v1", "tokens", token])?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ProxyError::Auth("unknown token".into())),
            StatusCode::FORBIDDEN => Err(ProxyError::Auth("token not permitted".into())),
            _ => {
                let response = check_status(response, "token lookup").await?;
                let grant: GrantResponse = response.json().await?;
                Ok(grant.into())
            }
        }
    }

    async fn audit_storage_config(&self) -> Result<StorageConfig> {
        let url = self.endpoint(&["api", "v1", "terminal", "config"])?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let response = check_status(response, "terminal config").await?;
        let config: TerminalConfig = response.json().await?;
        Ok(config.storage)
    }

    async fn heartbeat(&self, active: &[Uuid]) -> Result<Vec<ControlTask>> {
        let url = self.endpoint(&["api", "v1", "terminal", "heartbeat"])?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&HeartbeatRequest { sessions: active })
            .send()
            .await?;
        let response = check_status(response, "heartbeat").await?;
        let body: HeartbeatResponse = response.json().await?;

        let mut tasks = Vec::with_capacity(body.tasks.len());
        for raw in body.tasks {
            match serde_json::from_value::<ControlTask>(raw.clone()) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Ignoring unsupported control task {}: {}", raw, e),
            }
        }
        Ok(tasks)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
