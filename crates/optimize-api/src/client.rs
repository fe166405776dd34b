//! HTTP transport for the Optimize API
//!
//! All resource bindings share one [`ApiClient`]. It owns the connection
//! pool, the bearer token and the retry policy for rate limited and
//! temporarily unavailable responses. Nothing above this layer retries.

use crate::auth;
use optimize_core::{ApiError, ErrorType, Metadata, OptimizeConfig, OptimizeError, Result};
use reqwest::header::{HeaderMap, LAST_MODIFIED, LINK, LOCATION, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const USER_AGENT: &str = concat!("optimize-rs/", env!("CARGO_PKG_VERSION"));
const TITLE_HEADER: &str = "title";

// Retry configuration
const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MILLIS: u64 = 500;
const MAX_BACKOFF_SECS: u64 = 60;

/// A response that made it back from the server
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub metadata: Metadata,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ApiResponse {
    /// Decode the JSON body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Build the typed error for an unsuccessful response
    ///
    /// The error type in the body wins; otherwise `404` maps to `not_found`
    /// and authorization failures map to `unauthorized`.
    pub fn api_error(&self, not_found: ErrorType) -> ApiError {
        let body: ErrorBody = serde_json::from_str(&self.body).unwrap_or_default();

        let error_type = match body.error_type {
            Some(t) if !t.is_empty() => ErrorType::from(t.as_str()),
            _ => match self.status {
                StatusCode::NOT_FOUND => not_found,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorType::Unauthorized,
                status => ErrorType::Unexpected(format!("http-{}", status.as_u16())),
            },
        };

        let message = body
            .message
            .unwrap_or_else(|| self.status.canonical_reason().unwrap_or("").to_string());

        let mut err = ApiError::new(error_type, message);
        if let Some(retry_after) = self.retry_after {
            err = err.with_retry_after(retry_after);
        }
        if let Some(location) = self.metadata.location() {
            err = err.with_location(location);
        }
        err
    }

    /// Pass successful responses through, convert everything else
    pub fn success_or(self, not_found: ErrorType) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(self.api_error(not_found).into())
        }
    }
}

/// Error document returned by the server
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default, rename = "type", alias = "error")]
    error_type: Option<String>,
    #[serde(default, alias = "error_description")]
    message: Option<String>,
}

/// Shared HTTP client for all Optimize endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    address: Url,
    token: Option<String>,
    max_retries: u32,
}

impl ApiClient {
    /// Create a client for the server at `address`
    pub fn new(address: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(address, token, Duration::from_secs(30))
    }

    fn with_timeout(address: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let address = Url::parse(address)
            .map_err(|e| OptimizeError::Config(format!("invalid address {:?}: {}", address, e)))?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| OptimizeError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            address,
            token,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Create a client from configuration, resolving the token from the environment
    pub fn from_config(config: &OptimizeConfig) -> Result<Self> {
        let token = auth::resolve_token(&config.token_env);
        Ok(Self::with_timeout(&config.address, token, config.timeout())?
            .with_max_retries(config.client.max_retries))
    }

    /// Set the retry budget for rate limited or unavailable responses
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Resolve a (possibly relative) link against the server address
    pub fn resolve(&self, link: &str) -> Result<Url> {
        self.address
            .join(link)
            .map_err(|e| OptimizeError::MalformedResponse(format!("invalid link {:?}: {}", link, e)))
    }

    /// Send a request, retrying rate limited and unavailable responses
    #[instrument(skip(self, body))]
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        let mut retries = 0;
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MILLIS);

        loop {
            debug!("Sending request (attempt {})", retries + 1);

            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| OptimizeError::Transport(format!("Failed to send request: {}", e)))?;

            let status = response.status();
            let metadata = metadata_from_headers(response.headers());
            let retry_after = retry_after(response.headers());
            let body_text = response
                .text()
                .await
                .map_err(|e| OptimizeError::Transport(format!("Failed to read response: {}", e)))?;

            if is_retryable(&method, status, &body_text) && retries < self.max_retries {
                retries += 1;
                let wait = retry_delay(retry_after, backoff);
                warn!(
                    "Server responded {}. Waiting {:?} before retry {}/{}",
                    status, wait, retries, self.max_retries
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                continue;
            }

            if status.is_server_error() && !has_error_type(&body_text) {
                return Err(OptimizeError::Transport(format!(
                    "{} {} failed with {}: {}",
                    method,
                    url,
                    status,
                    body_text.trim()
                )));
            }

            return Ok(ApiResponse {
                status,
                metadata,
                retry_after,
                body: body_text,
            });
        }
    }

    /// Fetch a JSON document along with its metadata
    pub async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        not_found: ErrorType,
    ) -> Result<(T, Metadata)> {
        let url = self.resolve(url)?;
        let response = self.send(Method::GET, url, None).await?.success_or(not_found)?;
        let value = response.json()?;
        Ok((value, response.metadata))
    }

    /// Fetch only the metadata of an endpoint
    pub async fn head(&self, url: &str, not_found: ErrorType) -> Result<Metadata> {
        let url = self.resolve(url)?;
        let response = self.send(Method::HEAD, url, None).await?.success_or(not_found)?;
        Ok(response.metadata)
    }

    /// POST a JSON document
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        not_found: ErrorType,
    ) -> Result<ApiResponse> {
        let url = self.resolve(url)?;
        let body = serde_json::to_value(body)?;
        self.send(Method::POST, url, Some(body)).await?.success_or(not_found)
    }

    /// PUT a JSON document
    pub async fn put<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        not_found: ErrorType,
    ) -> Result<ApiResponse> {
        let url = self.resolve(url)?;
        let body = serde_json::to_value(body)?;
        self.send(Method::PUT, url, Some(body)).await?.success_or(not_found)
    }

    /// DELETE a resource
    pub async fn delete(&self, url: &str, not_found: ErrorType) -> Result<()> {
        let url = self.resolve(url)?;
        self.send(Method::DELETE, url, None).await?.success_or(not_found)?;
        Ok(())
    }
}

fn has_error_type(body: &str) -> bool {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error_type.is_some_and(|t| !t.is_empty()))
        .unwrap_or(false)
}

/// Rate limits and untyped `503`s were never processed and are always
/// retried. A gateway failure may hide a request the server already handled,
/// so it is only retried for idempotent methods. A typed `503` is an answer.
fn is_retryable(method: &Method, status: StatusCode, body: &str) -> bool {
    match status {
        StatusCode::TOO_MANY_REQUESTS => true,
        StatusCode::SERVICE_UNAVAILABLE => !has_error_type(body),
        StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => is_idempotent(method),
        _ => false,
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE
    )
}

/// Delay before the next attempt, never longer than `MAX_BACKOFF_SECS`
pub(crate) fn retry_delay(retry_after: Option<Duration>, backoff: Duration) -> Duration {
    retry_after
        .unwrap_or(backoff)
        .min(Duration::from_secs(MAX_BACKOFF_SECS))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Collect the metadata headers of a response
pub fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, canonical) in [
        (LOCATION.as_str(), "Location"),
        (LINK.as_str(), "Link"),
        (LAST_MODIFIED.as_str(), "Last-Modified"),
        (TITLE_HEADER, "Title"),
    ] {
        for value in headers.get_all(name) {
            if let Ok(value) = value.to_str() {
                metadata.insert(canonical, value);
            }
        }
    }
    metadata
}
