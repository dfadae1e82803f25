//! Signed client for the knowledge-base service.
//!
//! Every call follows the same exchange:
//!
//! 1. Serialize the operation's parameters as JSON.
//! 2. Capture "now" once, seal the JSON with [`envelope::seal`], and send it as
//!    `{"data": …}` (or as the `data` part of a multipart upload) together
//!    with the `date` and `App-Id` headers. Every call except the token
//!    fetch also carries `Authorization: bearer <token>`.
//! 3. Require a 2xx status and `"code": "bizSuccess"` in the body.
//! 4. Open the response `data` with the same timestamp as the request.
//!
//! # Endpoints
//!
//! | Operation | Path | Decrypted response |
//! |-----------|------|--------------------|
//! | [`KnowledgeApi::fetch_token`] | `POST /appKey/getToken` | `{"token": …}` |
//! | [`KnowledgeApi::create_knowledge_base`] | `POST /knowledge/knowledgeAdd` | `{"id": …}` |
//! | [`KnowledgeApi::upload_file`] | `POST /knowledge/uploadFileCreateUnit` | opaque |
//!
//! # Tokens
//!
//! A token is fetched for each knowledge-base or upload call. When that
//! fails and `remote.fallback_token` is configured, the fallback is used and
//! the client reports itself as degraded until a token fetch succeeds again.
//! Without a fallback the failure surfaces as [`ApiError::Auth`]. The client
//! never retries; that is left to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::envelope::{self, CipherError};

/// Business code the service returns on success.
pub const SUCCESS_CODE: &str = "bizSuccess";

pub const TOKEN_PATH: &str = "/appKey/getToken";
pub const CREATE_KB_PATH: &str = "/knowledge/knowledgeAdd";
pub const UPLOAD_PATH: &str = "/knowledge/uploadFileCreateUnit";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("could not obtain a token: {0}")]
    Auth(String),
    #[error("{endpoint} rejected the credentials (HTTP {status})")]
    Unauthorized { endpoint: String, status: u16 },
    #[error("request to {endpoint} failed: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned business code {code:?}: {message}")]
    Business {
        endpoint: String,
        code: Option<String>,
        message: String,
    },
    #[error("{endpoint} returned an unusable payload: {detail}")]
    Payload { endpoint: String, detail: String },
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    /// Authentication problems: no usable token, or the token was refused.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_) | ApiError::Unauthorized { .. })
    }
}

/// Operations the orchestrator needs from the remote service.
#[async_trait]
pub trait KnowledgeApi: Send + Sync {
    /// Fetches a fresh bearer token.
    async fn fetch_token(&self) -> Result<String, ApiError>;

    /// Creates a knowledge base and returns its id.
    async fn create_knowledge_base(&self, name: &str, description: &str)
        -> Result<String, ApiError>;

    /// Uploads `file_path` into `knowledge_id` under `remote_file_name`.
    async fn upload_file(
        &self,
        knowledge_id: &str,
        group_name: &str,
        file_path: &Path,
        remote_file_name: &str,
    ) -> Result<(), ApiError>;

    /// Whether calls currently run on a fallback credential.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Response body shared by all endpoints.
#[derive(Debug, Deserialize)]
struct EnvelopeResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// [`KnowledgeApi`] over HTTP with the encrypted envelope.
pub struct SignedClient {
    http: reqwest::Client,
    remote: RemoteConfig,
    degraded: AtomicBool,
}

impl SignedClient {
    pub fn new(remote: RemoteConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(remote.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            remote,
            degraded: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.remote.base_url.trim_end_matches('/'), path)
    }

    fn signed_post(&self, path: &str, at: DateTime<Utc>) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .header("date", envelope::http_date(at))
            .header("App-Id", &self.remote.access_key)
    }

    /// Token for one operation, falling back to the configured token.
    async fn bearer(&self) -> Result<String, ApiError> {
        match self.fetch_token().await {
            Ok(token) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("token fetch recovered, leaving degraded mode");
                }
                Ok(token)
            }
            Err(e) => match &self.remote.fallback_token {
                Some(fallback) => {
                    self.degraded.store(true, Ordering::Relaxed);
                    tracing::warn!(error = %e, "token fetch failed, using fallback token (degraded)");
                    Ok(fallback.clone())
                }
                None => Err(ApiError::Auth(e.to_string())),
            },
        }
    }

    /// Sends a prepared request and opens the response envelope.
    async fn exchange(
        &self,
        endpoint: &str,
        at: DateTime<Utc>,
        request: reqwest::RequestBuilder,
    ) -> Result<String, ApiError> {
        let response = request.send().await.map_err(|source| ApiError::Network {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::Unauthorized {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body: EnvelopeResponse =
            response.json().await.map_err(|e| ApiError::Payload {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })?;

        if body.code.as_deref() != Some(SUCCESS_CODE) {
            return Err(ApiError::Business {
                endpoint: endpoint.to_string(),
                code: body.code,
                message: body.message.unwrap_or_default(),
            });
        }

        match body.data {
            Some(Value::String(data)) => Ok(envelope::open(&self.remote.secret, at, &data)?),
            None | Some(Value::Null) => Ok(String::new()),
            Some(other) => Err(ApiError::Payload {
                endpoint: endpoint.to_string(),
                detail: format!("data is not a string: {}", other),
            }),
        }
    }
}

/// Reads a string field out of a decrypted JSON payload.
fn payload_field(endpoint: &str, payload: &str, field: &str) -> Result<String, ApiError> {
    let value: Value = serde_json::from_str(payload).map_err(|e| ApiError::Payload {
        endpoint: endpoint.to_string(),
        detail: e.to_string(),
    })?;
    match value.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ApiError::Payload {
            endpoint: endpoint.to_string(),
            detail: format!("missing '{}'", field),
        }),
    }
}

#[async_trait]
impl KnowledgeApi for SignedClient {
    async fn fetch_token(&self) -> Result<String, ApiError> {
        let at = Utc::now();
        let params = json!({
            "appkey": self.remote.access_key,
            "secret": self.remote.secret,
        });
        let data = envelope::seal(&self.remote.secret, at, &params.to_string())?;
        let request = self
            .signed_post(TOKEN_PATH, at)
            .json(&json!({ "data": data }));

        let payload = self.exchange(TOKEN_PATH, at, request).await?;
        let token = payload_field(TOKEN_PATH, &payload, "token")?;
        tracing::debug!("fetched token");
        Ok(token)
    }

    async fn create_knowledge_base(
        &self,
        name: &str,
        description: &str,
    ) -> Result<String, ApiError> {
        let token = self.bearer().await?;
        let at = Utc::now();
        let mut params = json!({
            "name": name,
            "description": description,
            "workspaceId": self.remote.workspace_id,
        });
        if let Some(workspace) = &self.remote.workspace {
            params["workspace"] = json!(workspace);
        }
        let data = envelope::seal(&self.remote.secret, at, &params.to_string())?;
        let request = self
            .signed_post(CREATE_KB_PATH, at)
            .header("Authorization", format!("bearer {}", token))
            .json(&json!({ "data": data }));

        let payload = self.exchange(CREATE_KB_PATH, at, request).await?;
        let id = payload_field(CREATE_KB_PATH, &payload, "id")?;
        tracing::info!(name, knowledge_id = %id, "created knowledge base");
        Ok(id)
    }

    async fn upload_file(
        &self,
        knowledge_id: &str,
        group_name: &str,
        file_path: &Path,
        remote_file_name: &str,
    ) -> Result<(), ApiError> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|source| ApiError::Io {
                path: file_path.to_path_buf(),
                source,
            })?;
        let size = bytes.len();

        let token = self.bearer().await?;
        let at = Utc::now();
        let params = json!({
            "userId": self.remote.user_id,
            "tenantId": self.remote.tenant_id,
            "knowledgeId": knowledge_id,
            "knowledgeName": group_name,
        });
        let data = envelope::seal(&self.remote.secret, at, &params.to_string())?;
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(remote_file_name.to_string()),
            )
            .text("data", data);
        let request = self
            .signed_post(UPLOAD_PATH, at)
            .header("Authorization", format!("bearer {}", token))
            .multipart(form);

        let confirmation = self.exchange(UPLOAD_PATH, at, request).await?;
        tracing::info!(
            knowledge_id,
            file = %file_path.display(),
            remote_name = remote_file_name,
            bytes = size,
            "uploaded file"
        );
        tracing::debug!(confirmation = %confirmation, "upload confirmation");
        Ok(())
    }

    /// True while calls run on the fallback token.
    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}
