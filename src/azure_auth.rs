//! Azure AD client-secret credential.
//!
//! Unique responsibility: obtain and cache bearer tokens for the management and
//! data-lake planes using the OAuth2 client-credentials grant.
//!
//! Token endpoint:
//! - POST <https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token>
//! - Body (form): `grant_type`, `client_id`, `client_secret`, `scope`
//!
//! Tokens are cached per scope and refreshed five minutes before expiry.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::env_config::{self, EnvError};

/// Scope for Azure Resource Manager calls.
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Scope for Data Lake Store data-plane calls.
pub const DATA_LAKE_SCOPE: &str = "https://datalake.azure.net/.default";

/// Tokens closer than this to their expiry are refreshed.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Configuration for the client-secret credential.
#[derive(Clone)]
pub struct CredentialConfig {
    /// Azure AD tenant.
    /// Env: `AZURE_TENANT_ID` (required)
    pub tenant_id: String,

    /// Application (client) id of the service principal.
    /// Env: `AZURE_CLIENT_ID` (required)
    pub client_id: String,

    /// Client secret of the service principal.
    /// Env: `AZURE_CLIENT_SECRET` (required)
    pub client_secret: String,

    /// Authority host.
    /// Env: `AZURE_AUTHORITY_HOST` (default: "<https://login.microsoftonline.com>")
    pub authority_host: String,

    /// HTTP request timeout in milliseconds.
    /// Env: `AZURE_HTTP_TIMEOUT_MS` (default: 30000)
    pub timeout_ms: u64,
}

impl CredentialConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        env_config::load_dotenv();

        Ok(Self {
            tenant_id: env_config::must_env("AZURE_TENANT_ID")?,
            client_id: env_config::must_env("AZURE_CLIENT_ID")?,
            client_secret: env_config::must_env("AZURE_CLIENT_SECRET")?,
            authority_host: env_config::string_env(
                "AZURE_AUTHORITY_HOST",
                "https://login.microsoftonline.com",
            ),
            timeout_ms: env_config::parse_u64_env("AZURE_HTTP_TIMEOUT_MS", 30_000)?,
        })
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authority_host", &self.authority_host)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    /// Raw token value.
    pub token: String,
    /// Absolute expiry, if the server reported one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Whether the token can still be used at `now` (with the refresh margin applied).
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| {
            exp - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > now
        })
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Get a token valid for `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if no token can be obtained.
    async fn token(&self, scope: &str) -> Result<AccessToken, AuthError>;
}

/// Service-principal credential using a client secret.
pub struct ClientSecretCredential {
    cfg: CredentialConfig,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl ClientSecretCredential {
    /// Create a new credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the config is incomplete.
    pub fn new(cfg: CredentialConfig) -> Result<Self, AuthError> {
        if cfg.tenant_id.is_empty() || cfg.client_id.is_empty() || cfg.client_secret.is_empty() {
            return Err(AuthError::Incomplete);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;

        Ok(Self {
            cfg,
            http,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn request_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let url = self.cfg.token_url();
        tracing::debug!(%url, scope, "requesting access token");

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("client_secret", &self.cfg.client_secret)
            .append_pair("scope", scope)
            .finish();

        let resp = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::Token { status, body: text });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::Json(e.to_string()))?;
        Ok(token_from_response(parsed, Utc::now()))
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(scope)
            && cached.is_fresh(Utc::now())
        {
            return Ok(cached.clone());
        }

        let fresh = self.request_token(scope).await?;
        cache.insert(scope.to_string(), fresh.clone());
        Ok(fresh)
    }
}

/// Credential returning a fixed token, for tests and pre-authenticated callers.
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    /// Wrap an already-acquired token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn token(&self, _scope: &str) -> Result<AccessToken, AuthError> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

fn token_from_response(resp: TokenResponse, now: DateTime<Utc>) -> AccessToken {
    AccessToken {
        token: resp.access_token,
        expires_at: resp
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs)),
    }
}

/// Error type for credential operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Configuration could not be read.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// Tenant, client id or secret is empty.
    #[error("tenant_id, client_id and client_secret are all required")]
    Incomplete,
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Token endpoint rejected the request.
    #[error("token request failed: status={status}, body={body}")]
    Token {
        /// HTTP status code.
        status: reqwest::StatusCode,
        /// Response body.
        body: String,
    },
    /// Token response could not be decoded.
    #[error("json error: {0}")]
    Json(String),
}
