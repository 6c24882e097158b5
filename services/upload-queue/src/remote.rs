//! Remote protocol client: presign, raw transfer and session finalization.
//!
//! The queue engine only depends on the [`RemoteClient`] trait. [`HttpRemoteClient`]
//! is the production implementation over HTTP.

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// One file the client wants to write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresignFile {
    pub path: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Batch request for one-time write targets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresignRequest {
    pub files: Vec<PresignFile>,
}

/// A one-time write target for a remote object path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadTarget {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
}

fn default_method() -> String {
    "PUT".to_string()
}

/// Presign response. Paths the server cannot service are simply absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresignResponse {
    pub uploads: Vec<UploadTarget>,
    #[serde(default)]
    pub expires_in_seconds: u64,
}

impl PresignResponse {
    pub fn target_for(&self, path: &str) -> Option<&UploadTarget> {
        self.uploads.iter().find(|u| u.path == path)
    }
}

/// Finalize request, issued once the manifest is stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteRequest {
    pub event_id: String,
    pub session_id: String,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteResponse {
    pub status: String,
}

/// Contract with the remote storage and finalize endpoints
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Request write targets for a batch of files
    async fn presign(&self, request: PresignRequest) -> Result<PresignResponse, RemoteError>;

    /// Transfer raw bytes to a previously obtained target. Non-2xx is a failure.
    async fn upload_bytes(
        &self,
        target: &UploadTarget,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), RemoteError>;

    /// Finalize a session server-side. Assumed idempotent.
    async fn complete(&self, request: CompleteRequest) -> Result<CompleteResponse, RemoteError>;
}

/// Authentication strategy for the presign/complete endpoints
#[derive(Clone, Debug)]
pub enum Auth {
    None,
    /// `Authorization: Bearer {token}`
    Bearer(String),
    /// `X-API-Key: {key}`
    XApiKey(String),
}

/// HTTP implementation of [`RemoteClient`]
#[derive(Clone, Debug)]
pub struct HttpRemoteClient {
    client: Client,
    base_url: String,
    presign_path: String,
    complete_path: String,
    auth: Auth,
    upload_timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        let auth = match (&config.api_key, config.auth_scheme.as_str()) {
            (None, _) => Auth::None,
            (Some(key), "x-api-key") => Auth::XApiKey(key.clone()),
            (Some(token), _) => Auth::Bearer(token.clone()),
        };

        info!(
            base_url = %config.base_url,
            presign_path = %config.presign_path,
            complete_path = %config.complete_path,
            "Remote client initialized"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            presign_path: config.presign_path.clone(),
            complete_path: config.complete_path.clone(),
            auth,
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
        })
    }

    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Bearer(token) => request.header("Authorization", format!("Bearer {}", token)),
            Auth::XApiKey(key) => request.header("X-API-Key", key.as_str()),
        }
    }

    /// POST a JSON body and deserialize the JSON response
    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let url = self.build_url(path);
        let request = self.apply_auth(self.client.post(&url).json(body));

        let response = request.send().await?;
        let response = check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    #[instrument(skip(self, request), fields(files = request.files.len()))]
    async fn presign(&self, request: PresignRequest) -> Result<PresignResponse, RemoteError> {
        let response: PresignResponse = self.post_json(&self.presign_path, &request).await?;

        debug!(
            requested = request.files.len(),
            returned = response.uploads.len(),
            expires_in_seconds = response.expires_in_seconds,
            "Presign response received"
        );

        Ok(response)
    }

    #[instrument(skip(self, target, body), fields(path = %target.path, size_bytes = body.len()))]
    async fn upload_bytes(
        &self,
        target: &UploadTarget,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), RemoteError> {
        let method = Method::from_bytes(target.method.to_uppercase().as_bytes())
            .map_err(|_| RemoteError::InvalidTarget(format!("unsupported method {}", target.method)))?;

        // Presigned targets carry their own credentials; no auth header here
        let response = self
            .client
            .request(method, &target.url)
            .timeout(self.upload_timeout)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    async fn complete(&self, request: CompleteRequest) -> Result<CompleteResponse, RemoteError> {
        self.post_json(&self.complete_path, &request).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}
