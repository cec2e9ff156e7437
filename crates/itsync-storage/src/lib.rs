//! JSON-over-HTTP transport used by the tracker and store adapters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "itsync-storage";

/// Longest error body kept in [`FetchError::HttpStatus`].
const MAX_ERROR_BODY: usize = 2048;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing `requests_per_second` calls per second; `None` when zero (unthrottled).
    pub fn per_second(requests_per_second: u32) -> Option<Self> {
        if requests_per_second == 0 {
            return None;
        }
        Some(Self {
            capacity: requests_per_second,
            refill_every: Duration::from_millis(1000 / u64::from(requests_per_second)),
        })
    }
}

/// Token bucket shared by every request sent through one [`HttpClient`].
#[derive(Debug)]
pub struct RequestThrottle {
    config: TokenBucketConfig,
    state: Mutex<ThrottleState>,
}

#[derive(Debug)]
struct ThrottleState {
    available: u32,
    refilled_at: Instant,
}

impl ThrottleState {
    fn refill(&mut self, config: &TokenBucketConfig) {
        let step = config.refill_every.as_nanos();
        if step == 0 {
            self.available = config.capacity;
            return;
        }
        let earned = self.refilled_at.elapsed().as_nanos() / step;
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.available = self.available.saturating_add(earned).min(config.capacity);
        if self.available == config.capacity {
            self.refilled_at = Instant::now();
        } else {
            // Keep the unspent fraction of the current interval.
            self.refilled_at += config.refill_every * earned;
        }
    }
}

impl RequestThrottle {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ThrottleState {
                available: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request slot is free, then claims it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(&self.config);
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                self.config
                    .refill_every
                    .saturating_sub(state.refilled_at.elapsed())
            };
            debug!(wait_ms = wait.as_millis() as u64, "request throttled");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin reqwest wrapper: bearer auth, optional throttling, JSON in and out.
///
/// No retries are attempted; every failure is handed back to the caller.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    bearer_token: Option<String>,
    throttle: Option<Arc<RequestThrottle>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let throttle = config.token_bucket.map(|c| Arc::new(RequestThrottle::new(c)));

        Ok(Self {
            client,
            bearer_token: None,
            throttle,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let request = self.client.get(url).query(query);
        self.send_json(Method::GET, url, request).await
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.client.post(url).json(body);
        self.send_json(Method::POST, url, request).await
    }

    pub async fn put_json<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.client.put(url).json(body);
        self.send_json(Method::PUT, url, request).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        mut request: RequestBuilder,
    ) -> Result<T, FetchError> {
        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let span = info_span!("http_request", %method, url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if !status.is_success() {
                let mut text = String::from_utf8_lossy(&body).into_owned();
                if text.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: text,
                });
            }

            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}
