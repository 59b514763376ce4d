//! Data Lake Store data plane (WebHDFS).
//!
//! Unique responsibility: stream-level operations the uploader needs, behind the
//! `FrontEndAdapter` trait so the upload logic can run against any store.
//!
//! API endpoint:
//! - <https://{account}.azuredatalakestore.net/webhdfs/v1>{path}?op={OP}&api-version=2016-11-01
//! - Header: Authorization: Bearer <token> (scope `https://datalake.azure.net/.default`)
//!
//! Operations used:
//! - CREATE (PUT), APPEND (POST), DELETE, GETFILESTATUS (GET)
//! - MSCONCAT (POST, JSON body `{"sources": [...]}`), RENAME (PUT)
//!
//! APPEND is never retried here: a lost response may hide an applied append, so
//! the segment uploader decides after checking the remote length.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    azure_auth::{AuthError, DATA_LAKE_SCOPE, TokenCredential},
    azure_client::{is_retryable_reqwest, is_retryable_status, next_backoff},
    env_config::{self, EnvError},
};

/// WebHDFS API version of the store.
pub const WEBHDFS_API_VERSION: &str = "2016-11-01";

/// Stream operations needed by the uploader.
#[async_trait]
pub trait FrontEndAdapter: Send + Sync {
    /// Create a stream holding `data`.
    async fn create_stream(&self, path: &str, overwrite: bool, data: &[u8], is_last: bool) -> Result<(), FrontEndError>;

    /// Append `data` at `offset`, which must be the current stream length.
    async fn append_to_stream(&self, path: &str, data: &[u8], offset: u64, is_last: bool) -> Result<(), FrontEndError>;

    /// Delete a stream or directory. Deleting a missing path is not an error.
    async fn delete_stream(&self, path: &str, recursive: bool) -> Result<(), FrontEndError>;

    /// Whether a stream or directory exists at `path`.
    async fn stream_exists(&self, path: &str) -> Result<bool, FrontEndError>;

    /// Length of the stream at `path`.
    async fn stream_length(&self, path: &str) -> Result<u64, FrontEndError>;

    /// Concatenate `inputs` into the new stream `target`, removing their directory.
    async fn concatenate(&self, target: &str, inputs: &[String]) -> Result<(), FrontEndError>;

    /// Move `source` to `target`.
    async fn rename(&self, source: &str, target: &str) -> Result<(), FrontEndError>;
}

// ============================================================================
// WebHDFS implementation
// ============================================================================

/// Configuration for the store front end.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Data Lake Store account.
    /// Env: `ADLS_ACCOUNT_NAME` (required)
    pub account_name: String,

    /// DNS suffix of the store endpoint.
    /// Env: `ADLS_DNS_SUFFIX` (default: "azuredatalakestore.net")
    pub dns_suffix: String,

    /// HTTP request timeout in milliseconds.
    /// Env: `AZURE_HTTP_TIMEOUT_MS` (default: 30000)
    pub timeout_ms: u64,

    /// Maximum number of retry attempts for idempotent operations.
    /// Env: `AZURE_HTTP_RETRY_MAX` (default: 3)
    pub retry_max: u32,

    /// Backoff time between retries in milliseconds.
    /// Env: `AZURE_HTTP_RETRY_BACKOFF_MS` (default: 500)
    pub retry_backoff_ms: u64,

    /// User agent for HTTP requests.
    /// Env: `AZURE_USER_AGENT` (default: "azure-mgmt-starter/0.1")
    pub user_agent: String,
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, FrontEndError> {
        env_config::load_dotenv();

        Ok(Self {
            account_name: env_config::must_env("ADLS_ACCOUNT_NAME")?,
            dns_suffix: env_config::string_env("ADLS_DNS_SUFFIX", "azuredatalakestore.net"),
            timeout_ms: env_config::parse_u64_env("AZURE_HTTP_TIMEOUT_MS", 30_000)?,
            retry_max: env_config::parse_u32_env("AZURE_HTTP_RETRY_MAX", 3)?,
            retry_backoff_ms: env_config::parse_u64_env("AZURE_HTTP_RETRY_BACKOFF_MS", 500)?,
            user_agent: env_config::string_env("AZURE_USER_AGENT", "azure-mgmt-starter/0.1"),
        })
    }

    fn base_url(&self) -> String {
        format!(
            "https://{}.{}/webhdfs/v1",
            self.account_name,
            self.dns_suffix.trim_matches('.')
        )
    }
}

/// WebHDFS client for one Data Lake Store account.
pub struct DataLakeStoreFrontEnd {
    cfg: StoreConfig,
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
}

enum Payload {
    Octets(Vec<u8>),
    Json(Vec<u8>),
}

impl DataLakeStoreFrontEnd {
    /// Create a new front end.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: StoreConfig, credential: Arc<dyn TokenCredential>) -> Result<Self, FrontEndError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()?;

        Ok(Self { cfg, http, credential })
    }

    /// URL of `op` on `path`.
    ///
    /// # Errors
    ///
    /// Returns `FrontEndError::Url` if the account or path do not form a valid URL.
    pub fn operation_url(&self, path: &str, op: &str, extra_query: &[(&str, &str)]) -> Result<Url, FrontEndError> {
        build_url(&self.cfg.base_url(), path, op, extra_query)
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        payload: Option<Payload>,
        retry: bool,
    ) -> Result<(StatusCode, String), FrontEndError> {
        let token = self.credential.token(DATA_LAKE_SCOPE).await?;
        let retry_max = if retry { self.cfg.retry_max } else { 0 };
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_millis(self.cfg.retry_backoff_ms);

        loop {
            attempt = attempt.saturating_add(1);

            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&token.token);
            req = match &payload {
                Some(Payload::Octets(bytes)) => req
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(bytes.clone()),
                Some(Payload::Json(bytes)) => req.header(CONTENT_TYPE, "application/json").body(bytes.clone()),
                None => req,
            };

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();

                    if !status.is_success() && attempt <= retry_max && is_retryable_status(status) {
                        tracing::warn!(%method, %url, %status, attempt, "transient store failure, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    tracing::debug!(%method, %url, %status, "store request completed");
                    return Ok((status, text));
                }
                Err(e) => {
                    if attempt <= retry_max && is_retryable_reqwest(&e) {
                        tracing::warn!(%method, %url, error = %e, attempt, "store request failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }
                    return Err(FrontEndError::Http(e));
                }
            }
        }
    }

    async fn expect_success(
        &self,
        method: Method,
        url: Url,
        payload: Option<Payload>,
        retry: bool,
    ) -> Result<String, FrontEndError> {
        let (status, body) = self.call(method, url, payload, retry).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(error_from_response(status, &body))
        }
    }

    async fn expect_true(&self, op: &str, method: Method, url: Url) -> Result<(), FrontEndError> {
        let body = self.expect_success(method, url, None, true).await?;
        let parsed: BooleanResponse = serde_json::from_str(&body).map_err(|e| FrontEndError::Json(e.to_string()))?;
        if parsed.boolean {
            Ok(())
        } else {
            Err(FrontEndError::Rejected(op.to_string()))
        }
    }

    async fn file_status(&self, path: &str) -> Result<Option<FileStatus>, FrontEndError> {
        let url = self.operation_url(path, "GETFILESTATUS", &[])?;
        let (status, body) = self.call(Method::GET, url, None, true).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }
        let parsed: FileStatusResponse =
            serde_json::from_str(&body).map_err(|e| FrontEndError::Json(e.to_string()))?;
        Ok(Some(parsed.file_status))
    }
}

const fn sync_flag(is_last: bool) -> &'static str {
    if is_last { "CLOSE" } else { "DATA" }
}

#[async_trait]
impl FrontEndAdapter for DataLakeStoreFrontEnd {
    async fn create_stream(&self, path: &str, overwrite: bool, data: &[u8], is_last: bool) -> Result<(), FrontEndError> {
        let url = self.operation_url(
            path,
            "CREATE",
            &[
                ("overwrite", if overwrite { "true" } else { "false" }),
                ("write", "true"),
                ("syncFlag", sync_flag(is_last)),
            ],
        )?;
        self.expect_success(Method::PUT, url, Some(Payload::Octets(data.to_vec())), overwrite)
            .await
            .map(drop)
    }

    async fn append_to_stream(&self, path: &str, data: &[u8], offset: u64, is_last: bool) -> Result<(), FrontEndError> {
        let offset = offset.to_string();
        let url = self.operation_url(
            path,
            "APPEND",
            &[("append", "true"), ("offset", &offset), ("syncFlag", sync_flag(is_last))],
        )?;
        self.expect_success(Method::POST, url, Some(Payload::Octets(data.to_vec())), false)
            .await
            .map(drop)
    }

    async fn delete_stream(&self, path: &str, recursive: bool) -> Result<(), FrontEndError> {
        let url = self.operation_url(path, "DELETE", &[("recursive", if recursive { "true" } else { "false" })])?;
        let (status, body) = self.call(Method::DELETE, url, None, true).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(error_from_response(status, &body))
    }

    async fn stream_exists(&self, path: &str) -> Result<bool, FrontEndError> {
        Ok(self.file_status(path).await?.is_some())
    }

    async fn stream_length(&self, path: &str) -> Result<u64, FrontEndError> {
        self.file_status(path)
            .await?
            .map(|s| s.length)
            .ok_or_else(|| FrontEndError::NotFound(path.to_string()))
    }

    async fn concatenate(&self, target: &str, inputs: &[String]) -> Result<(), FrontEndError> {
        let url = self.operation_url(target, "MSCONCAT", &[("deleteSourceDirectory", "true")])?;
        let body = serde_json::to_vec(&ConcatRequest { sources: inputs })
            .map_err(|e| FrontEndError::Json(e.to_string()))?;
        self.expect_success(Method::POST, url, Some(Payload::Json(body)), false)
            .await
            .map(drop)
    }

    async fn rename(&self, source: &str, target: &str) -> Result<(), FrontEndError> {
        let url = self.operation_url(source, "RENAME", &[("destination", target)])?;
        self.expect_true("RENAME", Method::PUT, url).await
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ConcatRequest<'a> {
    sources: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BooleanResponse {
    boolean: bool,
}

#[derive(Debug, Deserialize)]
struct FileStatusResponse {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

/// Status of a stream or directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    /// Length in bytes.
    #[serde(default)]
    pub length: u64,
    /// `FILE` or `DIRECTORY`.
    #[serde(rename = "type", default)]
    pub file_type: String,
    /// Last modification, ms since epoch.
    #[serde(default)]
    pub modification_time: u64,
}

#[derive(Debug, Deserialize)]
struct RemoteExceptionEnvelope {
    #[serde(rename = "RemoteException")]
    remote_exception: Option<RemoteException>,
}

#[derive(Debug, Deserialize)]
struct RemoteException {
    #[serde(default)]
    exception: String,
    #[serde(default)]
    message: String,
}

// ============================================================================
// Error type
// ============================================================================

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum FrontEndError {
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
    /// Stream does not exist.
    #[error("stream not found: {0}")]
    NotFound(String),
    /// `RemoteException` returned by the store.
    #[error("remote exception: status={status}, exception={exception}, message={message}")]
    Remote {
        /// HTTP status code.
        status: StatusCode,
        /// Exception name (e.g. `FileAlreadyExistsException`).
        exception: String,
        /// Human readable message.
        message: String,
    },
    /// Error response without a `RemoteException`.
    #[error("api error: status={status}, body={body}")]
    Api {
        /// HTTP status code.
        status: StatusCode,
        /// Response body.
        body: String,
    },
    /// The store answered `{"boolean": false}`.
    #[error("{0} was rejected by the store")]
    Rejected(String),
}

impl FrontEndError {
    /// Whether the error means the stream does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Remote { status, .. } | Self::Api { status, .. } => *status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }
}

fn build_url(base: &str, path: &str, op: &str, extra_query: &[(&str, &str)]) -> Result<Url, FrontEndError> {
    let mut url = Url::parse(base).map_err(|e| FrontEndError::Url(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| FrontEndError::Url(format!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(path.split('/').filter(|s| !s.is_empty()));
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("op", op);
        for (k, v) in extra_query {
            pairs.append_pair(k, v);
        }
        pairs.append_pair("api-version", WEBHDFS_API_VERSION);
    }
    Ok(url)
}

fn error_from_response(status: StatusCode, body: &str) -> FrontEndError {
    match serde_json::from_str::<RemoteExceptionEnvelope>(body) {
        Ok(RemoteExceptionEnvelope {
            remote_exception: Some(e),
        }) => FrontEndError::Remote {
            status,
            exception: e.exception,
            message: e.message,
        },
        _ if status == StatusCode::NOT_FOUND => FrontEndError::NotFound(body.to_string()),
        _ => FrontEndError::Api {
            status,
            body: body.to_string(),
        },
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    streams: BTreeMap<String, Vec<u8>>,
    failing_appends: usize,
    apply_failing_appends: bool,
    append_calls: usize,
}

/// Store kept in memory, for tests and local dry runs.
///
/// Directories are implicit: a path exists as a directory while any stream lives
/// below it.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFrontEnd {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryFrontEnd {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with a 503. When `applied` is set the
    /// data is still written, as if only the response was lost.
    pub async fn fail_next_appends(&self, count: usize, applied: bool) {
        let mut state = self.state.lock().await;
        state.failing_appends = count;
        state.apply_failing_appends = applied;
    }

    /// Contents of the stream at `path`.
    pub async fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().await.streams.get(path).cloned()
    }

    /// All stream paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.streams.keys().cloned().collect()
    }

    /// Number of append calls received.
    pub async fn append_calls(&self) -> usize {
        self.state.lock().await.append_calls
    }

    /// Store `data` at `path` directly.
    pub async fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.state.lock().await.streams.insert(path.to_string(), data.into());
    }
}

fn conflict(exception: &str, path: &str) -> FrontEndError {
    FrontEndError::Remote {
        status: StatusCode::CONFLICT,
        exception: exception.to_string(),
        message: format!("{path} already exists"),
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

impl MemoryState {
    fn exists(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.streams.contains_key(path) || self.streams.keys().any(|k| k.starts_with(&prefix))
    }
}

#[async_trait]
impl FrontEndAdapter for InMemoryFrontEnd {
    async fn create_stream(&self, path: &str, overwrite: bool, data: &[u8], _is_last: bool) -> Result<(), FrontEndError> {
        let mut state = self.state.lock().await;
        if !overwrite && state.streams.contains_key(path) {
            return Err(conflict("FileAlreadyExistsException", path));
        }
        state.streams.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn append_to_stream(&self, path: &str, data: &[u8], offset: u64, _is_last: bool) -> Result<(), FrontEndError> {
        let mut state = self.state.lock().await;
        state.append_calls += 1;

        let fail = state.failing_appends > 0;
        if fail {
            state.failing_appends -= 1;
            if !state.apply_failing_appends {
                return Err(FrontEndError::Remote {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    exception: "ServiceUnavailableException".into(),
                    message: "injected failure".into(),
                });
            }
        }

        let stream = state
            .streams
            .get_mut(path)
            .ok_or_else(|| FrontEndError::NotFound(path.to_string()))?;
        if stream.len() as u64 != offset {
            return Err(FrontEndError::Remote {
                status: StatusCode::BAD_REQUEST,
                exception: "BadOffsetException".into(),
                message: format!("offset {offset} does not match stream length {}", stream.len()),
            });
        }
        stream.extend_from_slice(data);

        if fail {
            return Err(FrontEndError::Remote {
                status: StatusCode::GATEWAY_TIMEOUT,
                exception: "GatewayTimeoutException".into(),
                message: "injected failure after append".into(),
            });
        }
        Ok(())
    }

    async fn delete_stream(&self, path: &str, recursive: bool) -> Result<(), FrontEndError> {
        let mut state = self.state.lock().await;
        state.streams.remove(path);
        if recursive {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            state.streams.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }

    async fn stream_exists(&self, path: &str) -> Result<bool, FrontEndError> {
        Ok(self.state.lock().await.exists(path))
    }

    async fn stream_length(&self, path: &str) -> Result<u64, FrontEndError> {
        self.state
            .lock()
            .await
            .streams
            .get(path)
            .map(|s| s.len() as u64)
            .ok_or_else(|| FrontEndError::NotFound(path.to_string()))
    }

    async fn concatenate(&self, target: &str, inputs: &[String]) -> Result<(), FrontEndError> {
        let mut state = self.state.lock().await;
        if state.streams.contains_key(target) {
            return Err(conflict("FileAlreadyExistsException", target));
        }

        let mut joined = Vec::new();
        for input in inputs {
            let part = state
                .streams
                .get(input)
                .ok_or_else(|| FrontEndError::NotFound(input.clone()))?;
            joined.extend_from_slice(part);
        }

        for input in inputs {
            state.streams.remove(input);
            let prefix = format!("{}/", parent_dir(input));
            state.streams.retain(|k, _| !k.starts_with(&prefix));
        }
        state.streams.insert(target.to_string(), joined);
        Ok(())
    }

    async fn rename(&self, source: &str, target: &str) -> Result<(), FrontEndError> {
        let mut state = self.state.lock().await;
        if state.streams.contains_key(target) {
            return Err(FrontEndError::Rejected("RENAME".into()));
        }
        let data = state
            .streams
            .remove(source)
            .ok_or_else(|| FrontEndError::NotFound(source.to_string()))?;
        state.streams.insert(target.to_string(), data);
        Ok(())
    }
}
