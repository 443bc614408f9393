//! Fetching manifests and packages, with bounded retries.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::IndexerConfig;
use crate::error::Error as CatalogError;
use crate::types::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Worth retrying: connection failures, timeouts, 5xx and 429.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("fetch failed: {0}")]
    Permanent(String),
    #[error("fetch failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("fetch cancelled")]
    Cancelled,
}

impl From<FetchError> for CatalogError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Cancelled => CatalogError::Cancelled("fetch cancelled".into()),
            other => CatalogError::Internal(other.to_string()),
        }
    }
}

/// Source of repository manifests and package archives.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Returns the raw manifest page at `url`.
    async fn fetch_page(&self, repo: &Repository, url: &str) -> Result<String, FetchError>;

    /// Returns the package archive at `url`.
    async fn fetch_package(&self, repo: &Repository, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// `<url>/index.yaml`, or the URL itself when it already names a YAML file.
#[must_use]
pub fn manifest_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/');
    if trimmed.ends_with(".yaml") || trimmed.ends_with(".yml") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/index.yaml")
    }
}

/// Resolves a manifest-relative reference against the page it came from.
#[must_use]
pub fn resolve_url(base: &str, reference: &str) -> String {
    if reference.contains("://") {
        return reference.to_string();
    }
    if let Some(path) = reference.strip_prefix('/') {
        // Absolute path: keep scheme and authority of the base.
        let origin_end = base
            .find("://")
            .and_then(|scheme| base[scheme + 3..].find('/').map(|i| scheme + 3 + i))
            .unwrap_or(base.len());
        return format!("{}/{path}", &base[..origin_end]);
    }
    let dir = match base.rfind('/') {
        Some(i) if !base[..i].ends_with('/') => &base[..i],
        _ => base,
    };
    format!("{dir}/{}", reference.trim_start_matches("./"))
}

/// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(32) as i32);
        let secs = self.initial.as_secs_f64() * exp;
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Bound on a single attempt; a timed-out attempt counts as failed.
    pub timeout: Duration,
}

impl From<&IndexerConfig> for RetryPolicy {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::new(config.initial_backoff(), config.max_backoff()),
            timeout: config.fetch_timeout(),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
/// Cancellation is observed during backoff sleeps.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt: u32 = 1;
    loop {
        let last = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(FetchError::Transient(message))) => message,
            Ok(Err(e)) => return Err(e),
            Err(_) => format!("timed out after {}ms", policy.timeout.as_millis()),
        };

        if attempt >= policy.max_attempts {
            return Err(FetchError::Exhausted {
                attempts: attempt,
                last,
            });
        }

        let delay = policy.backoff.delay_for_attempt(attempt);
        tracing::warn!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %last,
            "fetch failed, retrying"
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Fetches over HTTP(S), or from disk for `file://` repositories.
pub struct HttpFetcher {
    client: reqwest::Client,
    /// Bearer tokens keyed by repository `credential_ref`.
    credentials: HashMap<String, String>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("appshelf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            credentials: HashMap::new(),
        })
    }

    #[must_use]
    pub fn with_credential(mut self, credential_ref: impl Into<String>, token: impl Into<String>) -> Self {
        self.credentials.insert(credential_ref.into(), token.into());
        self
    }

    async fn get_bytes(&self, repo: &Repository, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return match tokio::fs::read(path).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(FetchError::Permanent(format!("{url}: not found")))
                }
                Err(e) => Err(FetchError::Transient(format!("{url}: {e}"))),
            };
        }

        let mut request = self.client.get(url);
        if let Some(token) = repo
            .credential_ref
            .as_ref()
            .and_then(|r| self.credentials.get(r))
        {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("{url}: HTTP {status}")));
        }

        let body = response.bytes().await.map_err(classify)?;
        Ok(body.to_vec())
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Permanent(e.to_string())
    }
}

#[async_trait]
impl ManifestFetcher for HttpFetcher {
    async fn fetch_page(&self, repo: &Repository, url: &str) -> Result<String, FetchError> {
        let bytes = self.get_bytes(repo, url).await?;
        String::from_utf8(bytes)
            .map_err(|_| FetchError::Permanent(format!("{url}: manifest is not UTF-8")))
    }

    async fn fetch_package(&self, repo: &Repository, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get_bytes(repo, url).await
    }
}
