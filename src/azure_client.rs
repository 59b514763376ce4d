//! Azure Resource Manager REST client.
//!
//! Unique responsibility: send authenticated JSON requests to the ARM control plane
//! and turn failures into typed errors.
//!
//! API endpoint:
//! - <https://management.azure.com>{resource path}?api-version={version}
//! - Header: Authorization: Bearer <token>
//!
//! This module encapsulates:
//! - Retry with exponential backoff on transient statuses and connection errors
//! - `nextLink` pagination for list operations
//! - Decoding of the ARM error envelope (`{"error": {"code", "message"}}`)

use std::{sync::Arc, time::Duration};

use reqwest::{Method, StatusCode, Url, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::azure_auth::{ARM_SCOPE, AuthError, TokenCredential};
use crate::env_config::{self, EnvError};

/// Configuration for the ARM client.
#[derive(Clone, Debug)]
pub struct ArmClientConfig {
    /// Subscription that scoped calls run against.
    /// Env: `AZURE_SUBSCRIPTION_ID` (required)
    pub subscription_id: String,

    /// Resource Manager endpoint.
    /// Env: `AZURE_RESOURCE_MANAGER_URL` (default: "<https://management.azure.com>")
    pub resource_manager_url: String,

    /// HTTP request timeout in milliseconds.
    /// Env: `AZURE_HTTP_TIMEOUT_MS` (default: 30000)
    pub timeout_ms: u64,

    /// Maximum number of retry attempts.
    /// Env: `AZURE_HTTP_RETRY_MAX` (default: 3)
    pub retry_max: u32,

    /// Backoff time between retries in milliseconds.
    /// Env: `AZURE_HTTP_RETRY_BACKOFF_MS` (default: 500)
    pub retry_backoff_ms: u64,

    /// User agent for HTTP requests.
    /// Env: `AZURE_USER_AGENT` (default: "azure-mgmt-starter/0.1")
    pub user_agent: String,
}

impl ArmClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ArmError> {
        env_config::load_dotenv();

        Ok(Self {
            subscription_id: env_config::must_env("AZURE_SUBSCRIPTION_ID")?,
            resource_manager_url: env_config::string_env(
                "AZURE_RESOURCE_MANAGER_URL",
                "https://management.azure.com",
            ),
            timeout_ms: env_config::parse_u64_env("AZURE_HTTP_TIMEOUT_MS", 30_000)?,
            retry_max: env_config::parse_u32_env("AZURE_HTTP_RETRY_MAX", 3)?,
            retry_backoff_ms: env_config::parse_u64_env("AZURE_HTTP_RETRY_BACKOFF_MS", 500)?,
            user_agent: env_config::string_env("AZURE_USER_AGENT", "azure-mgmt-starter/0.1"),
        })
    }
}

/// Client for the Azure Resource Manager REST API.
pub struct ArmClient {
    cfg: ArmClientConfig,
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
}

impl ArmClient {
    /// Create a new ARM client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: ArmClientConfig, credential: Arc<dyn TokenCredential>) -> Result<Self, ArmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()?;

        Ok(Self {
            cfg,
            http,
            credential,
        })
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &ArmClientConfig {
        &self.cfg
    }

    /// The subscription this client is bound to.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.cfg.subscription_id
    }

    /// Build the absolute URL for a resource path.
    ///
    /// `path` is an ARM path such as a resource id; it must start with `/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting URL is invalid.
    pub fn resource_url(
        &self,
        path: &str,
        api_version: &str,
        extra_query: &[(&str, &str)],
    ) -> Result<Url, ArmError> {
        build_url(&self.cfg.resource_manager_url, path, api_version, extra_query)
    }

    /// GET a resource and decode it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, api_version: &str) -> Result<T, ArmError> {
        self.get_optional_json(path, api_version)
            .await?
            .ok_or_else(|| ArmError::NotFound(path.to_string()))
    }

    /// GET a resource, mapping 404 to `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_optional_json<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
    ) -> Result<Option<T>, ArmError> {
        let url = self.resource_url(path, api_version, &[])?;
        let (status, body) = self.send(Method::GET, url, None).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }

        decode(&body).map(Some)
    }

    /// PUT a JSON body and decode the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn put_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        body: &B,
    ) -> Result<T, ArmError> {
        let url = self.resource_url(path, api_version, &[])?;
        let bytes = serde_json::to_vec(body).map_err(|e| ArmError::Json(e.to_string()))?;
        let (status, text) = self.send(Method::PUT, url, Some(bytes)).await?;

        if !status.is_success() {
            return Err(error_from_response(status, &text));
        }

        decode(&text)
    }

    /// DELETE a resource.
    ///
    /// Returns `false` when there was nothing to delete (204/404).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn delete(&self, path: &str, api_version: &str) -> Result<bool, ArmError> {
        let url = self.resource_url(path, api_version, &[])?;
        let (status, body) = self.send(Method::DELETE, url, None).await?;

        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(error_from_response(s, &body)),
        }
    }

    /// List a collection, following `nextLink` until exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails or cannot be decoded.
    pub async fn list_json<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        filter: Option<&str>,
    ) -> Result<Vec<T>, ArmError> {
        let extra: Vec<(&str, &str)> = filter.map(|f| vec![("$filter", f)]).unwrap_or_default();
        let mut next = Some(self.resource_url(path, api_version, &extra)?);
        let mut items = Vec::new();

        while let Some(url) = next.take() {
            let (status, body) = self.send(Method::GET, url, None).await?;
            if !status.is_success() {
                return Err(error_from_response(status, &body));
            }

            let page: ArmPage<T> = decode(&body)?;
            items.extend(page.value);

            next = match page.next_link {
                Some(link) if !link.is_empty() => {
                    Some(Url::parse(&link).map_err(|e| ArmError::Url(e.to_string()))?)
                }
                _ => None,
            };
        }

        Ok(items)
    }

    /// Send a request with retry logic. Returns status and body text.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, String), ArmError> {
        let token = self.credential.token(ARM_SCOPE).await?;
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_millis(self.cfg.retry_backoff_ms);

        loop {
            attempt = attempt.saturating_add(1);

            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&token.token);
            if let Some(bytes) = &body {
                req = req.header(CONTENT_TYPE, "application/json").body(bytes.clone());
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();

                    if !status.is_success()
                        && attempt <= self.cfg.retry_max
                        && is_retryable_status(status)
                    {
                        tracing::warn!(%method, %url, %status, attempt, "transient ARM failure, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    tracing::debug!(%method, %url, %status, "ARM request completed");
                    return Ok((status, text));
                }
                Err(e) => {
                    if attempt <= self.cfg.retry_max && is_retryable_reqwest(&e) {
                        tracing::warn!(%method, %url, error = %e, attempt, "ARM request failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(ArmError::Http(e));
                }
            }
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudErrorEnvelope {
    error: Option<CloudErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct CloudErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

// ============================================================================
// Error type
// ============================================================================

/// Error type for ARM client operations.
#[derive(Debug, Error)]
pub enum ArmError {
    /// Configuration could not be read.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// Token acquisition failed.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// URL could not be built.
    #[error("invalid url: {0}")]
    Url(String),
    /// JSON encoding/decoding error.
    #[error("json error: {0}")]
    Json(String),
    /// Resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// ARM error envelope.
    #[error("cloud error: status={status}, code={code}, message={message}")]
    Cloud {
        /// HTTP status code.
        status: StatusCode,
        /// ARM error code (e.g. `RoleAssignmentExists`).
        code: String,
        /// Human readable message.
        message: String,
    },
    /// Non-ARM error response.
    #[error("api error: status={status}, body={body}")]
    Api {
        /// HTTP status code.
        status: StatusCode,
        /// Response body.
        body: String,
    },
}

impl ArmError {
    /// ARM error code, when the server sent one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Cloud { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Whether the ARM error code equals `code` (case-insensitive).
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        self.code().is_some_and(|c| c.eq_ignore_ascii_case(code))
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn build_url(
    base: &str,
    path: &str,
    api_version: &str,
    extra_query: &[(&str, &str)],
) -> Result<Url, ArmError> {
    let raw = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let mut url = Url::parse(&raw).map_err(|e| ArmError::Url(e.to_string()))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("api-version", api_version);
        for (k, v) in extra_query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ArmError> {
    serde_json::from_str(body).map_err(|e| ArmError::Json(e.to_string()))
}

fn error_from_response(status: StatusCode, body: &str) -> ArmError {
    match serde_json::from_str::<CloudErrorEnvelope>(body) {
        Ok(CloudErrorEnvelope {
            error: Some(detail),
        }) => ArmError::Cloud {
            status,
            code: detail.code,
            message: detail.message,
        },
        _ => ArmError::Api {
            status,
            body: body.to_string(),
        },
    }
}

#[inline]
pub(crate) const fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

#[inline]
pub(crate) fn is_retryable_reqwest(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

#[inline]
pub(crate) fn next_backoff(current: Duration) -> Duration {
    let next = current.saturating_mul(2);
    next.min(Duration::from_secs(10))
}
