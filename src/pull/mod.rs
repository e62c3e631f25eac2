//! Pull Fallback (REST Orderbook) — on-demand, rate-limited fetch of a
//! single token's book, normalized and written into the Store.
//!
//! Grounded on the donor's `scrapers::polymarket_api::PolymarketScraper`
//! (reqwest client, retry/backoff, status-code classification) generalized
//! to the design's single-primitive rate limiter and diagnostic record
//! instead of the donor's ad hoc windowed limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clock::TokenId;
use crate::diagnostics::{PullDiagnostic, PullOutcomeClass};
use crate::error::PullError;
use crate::normalize::{self, RawLevel};
use crate::ratelimit::RateLimiter;
use crate::store::MarketDataStore;

#[derive(Default)]
struct PullMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    empty_book: AtomicU64,
    market_closed: AtomicU64,
    rate_limited: AtomicU64,
    parse_fail: AtomicU64,
    timeout: AtomicU64,
    http_error: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct PullMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub empty_book: u64,
    pub market_closed: u64,
    pub rate_limited: u64,
    pub parse_fail: u64,
    pub timeout: u64,
    pub http_error: u64,
    pub avg_latency_ms: u64,
}

pub struct PullClientConfig {
    pub rest_base_url: String,
    pub http_timeout: Duration,
}

impl Default for PullClientConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://clob.example.com".to_string(),
            http_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBookResponse {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

pub struct PullClient {
    config: PullClientConfig,
    http: Client,
    limiter: Arc<RateLimiter>,
    store: Arc<MarketDataStore>,
    metrics: PullMetrics,
}

impl PullClient {
    pub fn new(config: PullClientConfig, limiter: Arc<RateLimiter>, store: Arc<MarketDataStore>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self { config, http, limiter, store, metrics: PullMetrics::default() })
    }

    /// `true` iff the limiter refused the attempt outright — the caller
    /// (the Facade) distinguishes this from a fetch failure.
    pub fn try_acquire(&self, token: &TokenId) -> bool {
        self.limiter.try_acquire(token)
    }

    pub fn metrics(&self) -> PullMetricsSnapshot {
        let successes = self.metrics.successes.load(Ordering::Relaxed);
        let total_latency_ms = self.metrics.total_latency_ms.load(Ordering::Relaxed);
        PullMetricsSnapshot {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            successes,
            empty_book: self.metrics.empty_book.load(Ordering::Relaxed),
            market_closed: self.metrics.market_closed.load(Ordering::Relaxed),
            rate_limited: self.metrics.rate_limited.load(Ordering::Relaxed),
            parse_fail: self.metrics.parse_fail.load(Ordering::Relaxed),
            timeout: self.metrics.timeout.load(Ordering::Relaxed),
            http_error: self.metrics.http_error.load(Ordering::Relaxed),
            avg_latency_ms: if successes > 0 { total_latency_ms / successes } else { 0 },
        }
    }

    /// Fetches and writes to the Store. Caller must have already called
    /// `try_acquire` successfully; this always releases the limiter lock on
    /// exit, success or error.
    pub async fn fetch_and_store(&self, token: &TokenId) -> Result<PullDiagnostic, PullError> {
        let result = self.fetch_and_store_inner(token).await;
        self.limiter.release(token);
        result
    }

    async fn fetch_and_store_inner(&self, token: &TokenId) -> Result<PullDiagnostic, PullError> {
        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/book", self.config.rest_base_url);
        let redacted_url = format!("{url}?token_id=***");
        let start = Instant::now();

        let response = self
            .http
            .get(&url)
            .query(&[("token_id", token.as_str())])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                self.metrics.timeout.fetch_add(1, Ordering::Relaxed);
                return Err(PullError::Timeout);
            }
            Err(e) => {
                self.metrics.http_error.fetch_add(1, Ordering::Relaxed);
                return Err(PullError::Http(e));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(token = %token, "pull: market closed (404)");
            self.metrics.market_closed.fetch_add(1, Ordering::Relaxed);
            return Err(PullError::MarketClosed);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(token = %token, "pull: rate limited by upstream (429)");
            self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(PullError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            self.metrics.http_error.fetch_add(1, Ordering::Relaxed);
            return Err(PullError::ParseFail(format!("http {status}: {text}")));
        }

        let body: RawBookResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                self.metrics.parse_fail.fetch_add(1, Ordering::Relaxed);
                return Err(PullError::ParseFail(e.to_string()));
            }
        };

        let latency = start.elapsed();
        let raw_bid_count = body.bids.len();
        let raw_ask_count = body.asks.len();
        let (bids, asks) = normalize::normalize(&body.bids, &body.asks);

        if bids.is_empty() || asks.is_empty() {
            self.metrics.empty_book.fetch_add(1, Ordering::Relaxed);
            let diag = PullDiagnostic::new(
                token.clone(),
                redacted_url,
                Some(status.as_u16()),
                latency,
                raw_bid_count,
                raw_ask_count,
                &bids,
                &asks,
                PullOutcomeClass::EmptyBook,
            );
            if diag.dust_book {
                warn!(token = %token, "pull: dust book cross-check against store state");
            }
            return Err(PullError::EmptyBook);
        }

        self.store.update_from_pull(token, bids.clone(), asks.clone());
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_latency_ms.fetch_add(latency.as_millis() as u64, Ordering::Relaxed);

        Ok(PullDiagnostic::new(
            token.clone(),
            redacted_url,
            Some(status.as_u16()),
            latency,
            raw_bid_count,
            raw_ask_count,
            &bids,
            &asks,
            PullOutcomeClass::Success,
        ))
    }
}
