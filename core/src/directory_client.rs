//! Directory service REST client (§6): login, JWT validation, agent
//! registration/heartbeat/offline, listing, and group/name updates.
//!
//! The directory's own endpoint internals are an opaque collaborator; this
//! module only speaks the contract in spec.md §6. Grounded on the teacher's
//! `auth.rs` HTTP client setup (timeouts, `reqwest`, `anyhow::Context`-style
//! error messages), adapted from device-code polling to direct
//! username/password login since the directory here has no device-code
//! endpoint.

use crate::error::{CoreError, CoreResult};
use crate::identity::CapabilityDescriptor;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct MeResponse {
    pub username: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    agent_id: &'a str,
    hostname: &'a str,
    capability: &'a CapabilityDescriptor,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    agent_id: &'a str,
}

#[derive(Debug, Serialize)]
struct OfflineRequest<'a> {
    agent_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct AgentListEntry {
    pub agent_id: String,
    pub hostname: String,
    pub online: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum FieldUpdate<'a> {
    Group { group: &'a str },
    Name { name: &'a str },
}

/// Thin HTTP client for the directory service's REST surface.
///
/// Holds no connection state of its own; every call is a single request.
/// The caller is responsible for the 401 (re-login) and 429 (backoff)
/// policy described in §6 and §7.
pub struct DirectoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DirectoryClient {
    pub fn new(base_url: impl Into<String>) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Network(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    pub async fn login(&self, username: &str, password: &str) -> CoreResult<LoginResponse> {
        let resp = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("login request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::Auth(format!(
                "login rejected: {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| CoreError::Network(format!("invalid login response: {e}")))
    }

    /// Validate a JWT by calling `GET /api/auth/me` (§4.6 step 1).
    pub async fn validate_token(&self, token: &str) -> CoreResult<MeResponse> {
        let resp = self
            .http
            .get(self.url("/api/auth/me"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("validate_token request failed: {e}")))?;

        match resp.status().as_u16() {
            200 => resp
                .json()
                .await
                .map_err(|e| CoreError::Network(format!("invalid /auth/me response: {e}"))),
            401 => Err(CoreError::Auth("token rejected by directory".into())),
            other => Err(CoreError::Network(format!(
                "unexpected /auth/me status {other}"
            ))),
        }
    }

    pub async fn register(
        &self,
        token: &str,
        agent_id: &str,
        hostname: &str,
        capability: &CapabilityDescriptor,
    ) -> CoreResult<()> {
        let resp = self
            .http
            .post(self.url("/api/agents/register"))
            .bearer_auth(token)
            .json(&RegisterRequest {
                agent_id,
                hostname,
                capability,
            })
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("register request failed: {e}")))?;
        Self::expect_success(resp).await
    }

    pub async fn heartbeat(&self, token: &str, agent_id: &str) -> CoreResult<()> {
        let resp = self
            .http
            .post(self.url("/api/agents/heartbeat"))
            .bearer_auth(token)
            .json(&HeartbeatRequest { agent_id })
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("heartbeat request failed: {e}")))?;
        Self::expect_success(resp).await
    }

    pub async fn offline(&self, token: &str, agent_id: &str) -> CoreResult<()> {
        let resp = self
            .http
            .post(self.url("/api/agents/offline"))
            .bearer_auth(token)
            .json(&OfflineRequest { agent_id })
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("offline request failed: {e}")))?;
        Self::expect_success(resp).await
    }

    pub async fn list_agents(&self, token: &str) -> CoreResult<Vec<AgentListEntry>> {
        let resp = self
            .http
            .get(self.url("/api/agents"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("list request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::status_to_error(resp.status()));
        }
        resp.json()
            .await
            .map_err(|e| CoreError::Network(format!("invalid agent list response: {e}")))
    }

    pub async fn update_group(&self, token: &str, agent_id: &str, group: &str) -> CoreResult<()> {
        let resp = self
            .http
            .put(self.url(&format!("/api/agents/{agent_id}/group")))
            .bearer_auth(token)
            .json(&FieldUpdate::Group { group })
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("update_group request failed: {e}")))?;
        Self::expect_success(resp).await
    }

    pub async fn update_name(&self, token: &str, agent_id: &str, name: &str) -> CoreResult<()> {
        let resp = self
            .http
            .put(self.url(&format!("/api/agents/{agent_id}/name")))
            .bearer_auth(token)
            .json(&FieldUpdate::Name { name })
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("update_name request failed: {e}")))?;
        Self::expect_success(resp).await
    }

    async fn expect_success(resp: reqwest::Response) -> CoreResult<()> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_to_error(resp.status()))
        }
    }

    fn status_to_error(status: reqwest::StatusCode) -> CoreError {
        match status.as_u16() {
            401 => CoreError::Auth("token rejected by directory".into()),
            429 => CoreError::Network("directory rate-limited us (429)".into()),
            other => CoreError::Network(format!("directory returned {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn login_parses_token_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "jwt-abc",
                "user": {"username": "alice"}
            })))
            .mount(&server)
            .await;

        let client = DirectoryClient::new(server.uri()).unwrap();
        let login = client.login("alice", "hunter2").await.unwrap();
        assert_eq!(login.token, "jwt-abc");
    }

    #[tokio::test]
    async fn validate_token_maps_401_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = DirectoryClient::new(server.uri()).unwrap();
        let err = client.validate_token("bad-token").await.unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }

    #[tokio::test]
    async fn heartbeat_maps_429_to_network_error_for_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agents/heartbeat"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = DirectoryClient::new(server.uri()).unwrap();
        let err = client.heartbeat("tok", "agent-1").await.unwrap_err();
        assert!(matches!(err, CoreError::Network(_)));
    }
}
