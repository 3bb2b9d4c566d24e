//! Paced, retrying HTTP fetches.
//!
//! Every outbound request issued by the process passes through one shared
//! [`Pacer`], so the number of concurrent callers does not change the
//! effective request rate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// How a failed attempt should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another paced attempt.
    Transient,
    Permanent,
}

impl FailureKind {
    /// Server errors, 429 and 408 are transient; any other non-success status
    /// is final for this URL.
    pub fn of_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Transient,
            status if status.is_server_error() => Self::Transient,
            _ => Self::Permanent,
        }
    }

    pub fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

/// Retry budget for one URL. The pause before retry `n` (0-based) doubles
/// from `base_delay` and never exceeds `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn pause_before_retry(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Minimum spacing between any two outbound fetches, plus symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub min_delay: Duration,
    pub jitter: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1200),
            jitter: Duration::from_millis(400),
        }
    }
}

/// Process-wide request gate. Holds the single "next allowed instant"; callers
/// queue on the lock, sleep until that instant and push it forward by one
/// randomized spacing before releasing.
#[derive(Debug)]
pub struct Pacer {
    enabled: bool,
    next_allowed: Mutex<Instant>,
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    /// A pacer that never sleeps.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    /// `min_delay` shifted by a uniform offset in `[-jitter, +jitter]`, floored at zero.
    pub fn spacing(min_delay: Duration, jitter: Duration) -> Duration {
        let jitter_ms = jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return min_delay;
        }
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let spacing = min_delay.as_millis() as i64 + offset;
        Duration::from_millis(spacing.max(0) as u64)
    }

    pub async fn wait(&self, min_delay: Duration, jitter: Duration) {
        if !self.enabled {
            return;
        }
        let mut next_allowed = self.next_allowed.lock().await;
        if *next_allowed > Instant::now() {
            tokio::time::sleep_until(*next_allowed).await;
        }
        *next_allowed = Instant::now() + Self::spacing(min_delay, jitter);
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub pacing: PacingPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            pacing: PacingPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Anything that can turn a URL into page text. The crawl driver only talks to
/// this seam, so tests can serve canned HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, site: &str, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    pacing: PacingPolicy,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, pacer: Arc<Pacer>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer,
            pacing: config.pacing,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, site: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", site, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            self.pacer
                .wait(self.pacing.min_delay, self.pacing.jitter)
                .await;
            let can_retry = attempt < self.backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if FailureKind::of_status(status) == FailureKind::Permanent || !can_retry {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(status = status.as_u16(), attempt, "retrying");
                }
                Err(err) => {
                    if FailureKind::of_error(&err) == FailureKind::Permanent || !can_retry {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying");
                }
            }

            tokio::time::sleep(self.backoff.pause_before_retry(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, site: &str, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(site, url).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_up_to_eight_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.pause_before_retry(0), Duration::from_millis(500));
        assert_eq!(policy.pause_before_retry(1), Duration::from_secs(1));
        assert_eq!(policy.pause_before_retry(3), Duration::from_secs(4));
        assert_eq!(policy.pause_before_retry(4), Duration::from_secs(8));
        assert_eq!(policy.pause_before_retry(10), Duration::from_secs(8));
        assert_eq!(policy.pause_before_retry(usize::MAX), Duration::from_secs(8));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert_eq!(FailureKind::of_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::Transient);
        assert_eq!(FailureKind::of_status(StatusCode::REQUEST_TIMEOUT), FailureKind::Transient);
        assert_eq!(FailureKind::of_status(StatusCode::BAD_GATEWAY), FailureKind::Transient);
        assert_eq!(FailureKind::of_status(StatusCode::NOT_FOUND), FailureKind::Permanent);
        assert_eq!(FailureKind::of_status(StatusCode::FORBIDDEN), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn sequential_waits_are_spaced_by_min_delay() {
        let pacer = Pacer::new();
        let started = std::time::Instant::now();
        pacer.wait(Duration::from_millis(120), Duration::ZERO).await;
        pacer.wait(Duration::from_millis(120), Duration::ZERO).await;
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn concurrent_waits_share_one_gate() {
        let pacer = Arc::new(Pacer::new());
        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let pacer = pacer.clone();
            handles.push(tokio::spawn(async move {
                pacer.wait(Duration::from_millis(60), Duration::ZERO).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Three callers: the first passes immediately, the next two each wait one spacing.
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn jitter_spreads_around_min_delay() {
        let min = Duration::from_millis(60);
        let jitter = Duration::from_millis(30);
        let samples: Vec<Duration> = (0..500).map(|_| Pacer::spacing(min, jitter)).collect();

        assert!(samples.iter().any(|s| *s < min));
        assert!(samples.iter().any(|s| *s > min));
        assert!(samples
            .iter()
            .all(|s| *s >= Duration::from_millis(30) && *s <= Duration::from_millis(90)));
    }

    #[tokio::test]
    async fn disabled_pacer_never_sleeps() {
        let pacer = Pacer::disabled();
        let started = std::time::Instant::now();
        for _ in 0..5 {
            pacer.wait(Duration::from_secs(5), Duration::ZERO).await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
