//! Access to the source system.
//!
//! The destination pulls everything over the source's HTTP API. The
//! transport is hidden behind [`SourceClient`] so the pipeline can be
//! driven by canned responses in tests.

pub mod relation;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error as AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use displaydoc::Display;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT},
    Client as HttpClient, StatusCode, Url,
};
use sea_orm::DatabaseConnection;

use crate::config::RetryConfig;
use crate::database::PipelineDatabase;
use crate::error::{ServerError, ServerResult};
use crate::secret::EncryptionKey;

/// The User-Agent string of Ferry.
const FERRY_USER_AGENT: &str = concat!("Ferry/", env!("CARGO_PKG_VERSION"));

/// Timeout of a single request to the source.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A response from the source.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A request to the source, relative to its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    /// Path segments, not percent-encoded.
    pub segments: Vec<String>,

    /// Query parameters, not percent-encoded.
    pub query: Vec<(String, String)>,
}

/// An error talking to the source.
#[derive(Debug, Display)]
pub enum SourceError {
    /// Transport error: {0}
    Transport(AnyError),

    /// The source responded with HTTP {0}: {1}
    Status(StatusCode, String),

    /// The source sent a malformed response: {0}
    Malformed(String),

    /// Invalid source URL: {0}
    InvalidUrl(String),
}

/// An HTTP client for the source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Performs a GET request.
    ///
    /// Only transport failures are errors. Responses with any status
    /// code are returned as-is.
    async fn get(&self, request: &SourceRequest) -> Result<HttpResponse, SourceError>;
}

/// Builds source clients for migration jobs.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Returns a client for the source of a job.
    async fn connect(&self, job_id: i64) -> ServerResult<Arc<dyn SourceClient>>;
}

/// A source client backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestSourceClient {
    /// Base URL of the source.
    base: Url,

    /// An initialized HTTP client.
    client: HttpClient,
}

/// Connects to the source with the credentials stored for the job.
pub struct ConfiguredConnector {
    database: DatabaseConnection,
    key: EncryptionKey,
}

impl SourceRequest {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
        }
    }

    /// Appends a path segment.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Appends a query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Resolves the request against a base URL.
    pub fn to_url(&self, base: &Url) -> Result<Url, SourceError> {
        let mut url = base.clone();

        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl("URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(&self.segments);

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }

        Ok(url)
    }
}

impl fmt::Display for SourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))?;

        for (i, (k, v)) in self.query.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, k, v)?;
        }

        Ok(())
    }
}

impl SourceError {
    /// Returns whether the request may succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(status, _) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Malformed(_) | Self::InvalidUrl(_) => false,
        }
    }
}

impl std::error::Error for SourceError {}

impl HttpResponse {
    /// Turns non-success responses into errors.
    pub fn error_for_status(self) -> Result<Self, SourceError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            let body = String::from_utf8_lossy(&self.body);
            let excerpt: String = body.chars().take(200).collect();
            Err(SourceError::Status(self.status, excerpt))
        }
    }

    /// Returns a header as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl ReqwestSourceClient {
    pub fn new(url: &str, access_token: &str) -> Result<Self, SourceError> {
        let mut base = Url::parse(url).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;

        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(SourceError::InvalidUrl(
                "URL must be an http or https URL".to_string(),
            ));
        }

        base.set_query(None);
        base.set_fragment(None);

        let mut headers = HeaderMap::new();
        let auth_header =
            HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
                SourceError::InvalidUrl("access token is not a valid header".to_string())
            })?;
        headers.insert(AUTHORIZATION, auth_header);
        headers.insert(USER_AGENT, HeaderValue::from_static(FERRY_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let client = HttpClient::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Transport(e.into()))?;

        Ok(Self { base, client })
    }
}

#[async_trait]
impl SourceClient for ReqwestSourceClient {
    async fn get(&self, request: &SourceRequest) -> Result<HttpResponse, SourceError> {
        let url = request.to_url(&self.base)?;

        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.into()))?;

        let status = res.status();
        let headers = res.headers().clone();
        let body = res
            .bytes()
            .await
            .map_err(|e| SourceError::Transport(e.into()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl ConfiguredConnector {
    pub fn new(database: DatabaseConnection, key: EncryptionKey) -> Self {
        Self { database, key }
    }
}

#[async_trait]
impl SourceConnector for ConfiguredConnector {
    async fn connect(&self, job_id: i64) -> ServerResult<Arc<dyn SourceClient>> {
        let config = self.database.find_configuration(job_id).await?;
        let url = config.url(&self.key)?;
        let access_token = config.access_token(&self.key)?;

        tracing::debug!(
            "Connecting to source {} for job {}",
            config.safe_url(&self.key)?,
            job_id
        );

        let client =
            ReqwestSourceClient::new(&url, &access_token).map_err(ServerError::request_error)?;

        Ok(Arc::new(client))
    }
}

/// Returns the delay before the given retry.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    retry
        .initial_backoff
        .saturating_mul(factor)
        .min(retry.max_backoff)
}

/// Runs an operation, retrying transient failures with bounded
/// exponential backoff.
pub async fn with_backoff<T, F, Fut>(retry: &RetryConfig, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(retry, attempt);
                tracing::warn!(
                    "Transient source error (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    max_attempts,
                    delay,
                    e
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_to_url() {
        let base = Url::parse("https://source.example.com/gitlab").unwrap();
        let request = SourceRequest::new(["api", "v4", "projects", "a/b", "export_relations"])
            .segment("download")
            .param("relation", "issues")
            .param("batch_number", "2");

        assert_eq!(
            "https://source.example.com/gitlab/api/v4/projects/a%2Fb/export_relations/download?relation=issues&batch_number=2",
            request.to_url(&base).unwrap().as_str()
        );

        let base = Url::parse("https://source.example.com/").unwrap();
        assert_eq!(
            "https://source.example.com/api/v4/projects/a%2Fb/export_relations/download?relation=issues&batch_number=2",
            request.to_url(&base).unwrap().as_str()
        );

        assert_eq!(
            "/api/v4/projects/a/b/export_relations/download?relation=issues&batch_number=2",
            request.to_string()
        );
    }

    #[test]
    fn test_client() {
        ReqwestSourceClient::new("https://source.example.com", "token").unwrap();
        ReqwestSourceClient::new("mailto:someone@example.com", "token").unwrap_err();
        ReqwestSourceClient::new("not a url", "token").unwrap_err();
        ReqwestSourceClient::new("https://source.example.com", "bad\ntoken").unwrap_err();
    }

    #[test]
    fn test_is_transient() {
        assert!(SourceError::Transport(anyhow::anyhow!("reset")).is_transient());
        assert!(SourceError::Status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(SourceError::Status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!SourceError::Status(StatusCode::FORBIDDEN, String::new()).is_transient());
        assert!(!SourceError::Malformed("eh".to_string()).is_transient());
    }

    #[test]
    fn test_backoff_delay() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        };

        assert_eq!(Duration::from_secs(1), backoff_delay(&retry, 1));
        assert_eq!(Duration::from_secs(2), backoff_delay(&retry, 2));
        assert_eq!(Duration::from_secs(16), backoff_delay(&retry, 5));
        assert_eq!(Duration::from_secs(30), backoff_delay(&retry, 6));
        assert_eq!(Duration::from_secs(30), backoff_delay(&retry, 100));
    }

    #[tokio::test]
    async fn test_with_backoff() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_backoff(&retry(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SourceError::Status(StatusCode::SERVICE_UNAVAILABLE, String::new()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(42, result);
        assert_eq!(3, calls.load(Ordering::SeqCst));

        // Gives up after the maximum number of attempts
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&retry(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Transport(anyhow::anyhow!("reset")))
        })
        .await;
        assert!(matches!(result, Err(SourceError::Transport(_))));
        assert_eq!(3, calls.load(Ordering::SeqCst));

        // Permanent errors are not retried
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&retry(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Status(StatusCode::FORBIDDEN, String::new()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
