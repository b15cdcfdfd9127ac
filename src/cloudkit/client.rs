//! HTTP transport for CloudKit web service calls.
//!
//! The dispatcher talks to the network only through `HttpTransport`, so the
//! transport can be swapped for a fake in tests. `ReqwestTransport` is the
//! production implementation.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::info;
use url::Url;

use crate::config::Environment;
use crate::error::ImportError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Public CloudKit web services host.
pub const DEFAULT_API_BASE: &str = "https://api.apple-cloudkit.com";

/// User agent string for all CloudKit requests.
const CLIENT_USER_AGENT: &str = "cloudkit-import/0.1.0";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub const KEY_ID_HEADER: &str = "X-Apple-CloudKit-Request-KeyID";
pub const DATE_HEADER: &str = "X-Apple-CloudKit-Request-ISO8601Date";
pub const SIGNATURE_HEADER: &str = "X-Apple-CloudKit-Request-SignatureV1";
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Response header CloudKit uses to identify a request.
const REQUEST_ID_HEADER: &str = "x-apple-request-uuid";

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response
// ─────────────────────────────────────────────────────────────────────────────

/// One outbound POST.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Parsed `Retry-After` seconds, if the server sent one.
    pub retry_after_secs: Option<u64>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text for error messages.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport trait
// ─────────────────────────────────────────────────────────────────────────────

/// Sends a request and returns status and body.
///
/// Implementations return `ImportError::Transport` only when no response was
/// received; any HTTP status, successful or not, is an `Ok` response.
pub trait HttpTransport: Send + Sync {
    fn post<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, ImportError>> + Send + 'a>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// ReqwestTransport
// ─────────────────────────────────────────────────────────────────────────────

/// `HttpTransport` backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// # Errors
    ///
    /// Returns `ImportError::Internal` if the HTTP client fails to initialize.
    pub fn new() -> Result<Self, ImportError> {
        Ok(Self {
            http: build_http_client()?,
        })
    }

    /// Wraps an existing client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ImportError> {
        let start = Instant::now();
        let path = request.url.path().to_string();

        let mut builder = self.http.post(request.url.as_str()).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                info!(
                    "[CLOUDKIT] POST {} FAILED {}ms",
                    path,
                    start.elapsed().as_millis()
                );
                let kind = if e.is_timeout() {
                    "request timed out"
                } else if e.is_connect() {
                    "could not connect"
                } else {
                    "request failed"
                };
                // The raw reqwest error embeds the full URL; keep it out.
                return Err(ImportError::Transport(format!(
                    "Connection to CloudKit failed: {}",
                    kind
                )));
            }
        };

        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());

        let body = response
            .bytes()
            .await
            .map_err(|_| ImportError::Transport("Failed to read CloudKit response body".into()))?;

        info!(
            "[CLOUDKIT] POST {} {} {}ms {}",
            path,
            status.as_u16(),
            start.elapsed().as_millis(),
            request_id
        );

        Ok(HttpResponse {
            status: status.as_u16(),
            body: body.to_vec(),
            retry_after_secs,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, ImportError>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

/// Builds the configured HTTP client.
fn build_http_client() -> Result<reqwest::Client, ImportError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(|e| ImportError::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Path of the public database `records/modify` endpoint. This exact string is
/// part of the signed message.
pub fn modify_path(container: &str, environment: Environment) -> String {
    format!(
        "/database/1/{}/{}/public/records/modify",
        container, environment
    )
}

/// Joins an endpoint path onto the API base.
pub fn build_url(api_base: &Url, path: &str) -> Result<Url, ImportError> {
    api_base
        .join(path)
        .map_err(|_| ImportError::Config(format!("Invalid path: {}", path)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
