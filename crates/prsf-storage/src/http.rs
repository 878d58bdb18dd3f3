use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// 5xx and 429 are worth another attempt; every other status is final.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_error(err: &reqwest::Error) -> bool {
    (err.is_connect() || err.is_request()) && !err.is_timeout()
}

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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_site_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_site_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Politeness limiter shared by every site: `capacity` requests, one token back
/// every `refill_every`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            let elapsed = last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                *tokens = tokens.saturating_add(refills).min(self.capacity);
                *last_refill = Instant::now();
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Pooled HTTP client shared by every plain-HTTP source adapter.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_site_limit: usize,
    per_site: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_site_limit: config.per_site_concurrency.max(1),
            per_site: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(TokenBucket::new),
            backoff: config.backoff,
        })
    }

    async fn site_semaphore(&self, site: &str) -> Arc<Semaphore> {
        let mut map = self.per_site.lock().await;
        map.entry(site.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_site_limit)))
            .clone()
    }

    /// GET `url` as text, retrying transient failures. Timeouts are never retried:
    /// the caller's fetch budget is already spent by then.
    pub async fn fetch_text(&self, run_id: Uuid, site: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, site, url);
        self.fetch_text_inner(site, url).instrument(span).await
    }

    async fn fetch_text_inner(&self, site: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_site = self.site_semaphore(site).await;
        let _site = per_site.acquire().await.expect("semaphore not closed");

        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await.map_err(|e| to_fetch_error(e, url))?;
                        return Ok(FetchedPage { status, final_url, body });
                    }
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    if !retryable_status(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => {
                    if !retryable_error(&e) {
                        return Err(to_fetch_error(e, url));
                    }
                    FetchError::Request(e)
                }
            };
            if attempt >= self.backoff.max_retries {
                return Err(err);
            }
            debug!(attempt, error = %err, "retrying fetch");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

fn to_fetch_error(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else {
        FetchError::Request(err)
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("renderer api error (status {status}): {message}")]
    Api { status: u16, message: String },
}

/// Client for a Browserless-style `/content` endpoint that returns the fully
/// rendered HTML of a script-driven page.
#[derive(Debug, Clone)]
pub struct BrowserRenderer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserRenderer {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building renderer client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    pub fn endpoint(&self) -> String {
        match &self.token {
            Some(token) => format!("{}/content?token={token}", self.base_url),
            None => format!("{}/content", self.base_url),
        }
    }

    pub async fn content(&self, url: &str) -> Result<String, RenderError> {
        let resp = self
            .client
            .post(self.endpoint())
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RenderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.text().await?)
    }
}
