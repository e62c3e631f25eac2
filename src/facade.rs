//! Market Data Facade — the single read API that composes the Store and
//! the Pull Fallback, hiding the fresh/refresh/stale decision from callers.
//!
//! Grounded on the donor's `vault::book_access` (the thin read-through layer
//! sitting in front of `BookStore` that the execution path calls), adapted
//! to the three-way fresh/refresh/stale algorithm and the error-never-
//! surfaces contract of §4.4.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::clock::TokenId;
use crate::normalize::PriceLevel;
use crate::pull::PullClient;
use crate::store::{DataSource, MarketDataStore, Mode, TokenMarketSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Push,
    Pull,
    StaleCache,
}

#[derive(Debug, Clone)]
pub struct OrderbookView {
    pub summary: TokenMarketSummary,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
pub struct OrderbookDetail {
    pub summary: TokenMarketSummary,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub age: std::time::Duration,
}

#[derive(Default)]
struct FacadeCounters {
    push_hits: AtomicU64,
    pull_fallbacks: AtomicU64,
    rate_limit_hits: AtomicU64,
    stale_cache_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct FacadeMetricsSnapshot {
    pub push_hits: u64,
    pub pull_fallbacks: u64,
    pub rate_limit_hits: u64,
    pub stale_cache_hits: u64,
    pub mode: Mode,
}

pub struct MarketDataFacade {
    store: Arc<MarketDataStore>,
    pull: Arc<PullClient>,
    counters: FacadeCounters,
}

impl MarketDataFacade {
    pub fn new(store: Arc<MarketDataStore>, pull: Arc<PullClient>) -> Arc<Self> {
        Arc::new(Self { store, pull, counters: FacadeCounters::default() })
    }

    /// Total contract: always returns `Some` with a source tag, or `None`.
    /// Never raises to the caller — failures of the underlying pull client
    /// are absorbed and represented as `None` or a stale-cache hit.
    pub async fn get_orderbook(&self, token: &TokenId) -> Option<OrderbookView> {
        if !self.store.is_stale(token) {
            if let Some(summary) = self.store.get(token) {
                self.counters.push_hits.fetch_add(1, Ordering::Relaxed);
                let origin = match summary.source {
                    DataSource::Push => Origin::Push,
                    DataSource::Pull => Origin::Pull,
                };
                return Some(OrderbookView { summary, origin });
            }
        }

        if !self.pull.try_acquire(token) {
            self.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            return self.stale_cache(token);
        }

        match self.pull.fetch_and_store(token).await {
            Ok(_) => {
                self.counters.pull_fallbacks.fetch_add(1, Ordering::Relaxed);
                self.store.get(token).map(|summary| OrderbookView { summary, origin: Origin::Pull })
            }
            Err(e) => {
                debug!(token = %token, error = %e, "pull fallback failed; falling back to stale cache");
                self.stale_cache(token)
            }
        }
    }

    fn stale_cache(&self, token: &TokenId) -> Option<OrderbookView> {
        let summary = self.store.get(token)?;
        self.counters.stale_cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(OrderbookView { summary, origin: Origin::StaleCache })
    }

    pub async fn get_orderbook_detailed(&self, token: &TokenId) -> Option<OrderbookDetail> {
        let view = self.get_orderbook(token).await?;
        let book = self.store.get_book(token)?;
        let age = self.store.age(token);
        Some(OrderbookDetail { summary: view.summary, bids: book.bids, asks: book.asks, age })
    }

    pub async fn best_bid(&self, token: &TokenId) -> Option<Decimal> {
        self.get_orderbook(token).await.map(|v| v.summary.best_bid)
    }

    pub async fn best_ask(&self, token: &TokenId) -> Option<Decimal> {
        self.get_orderbook(token).await.map(|v| v.summary.best_ask)
    }

    pub async fn mid(&self, token: &TokenId) -> Option<Decimal> {
        self.get_orderbook(token).await.map(|v| v.summary.mid)
    }

    /// Runs per-token lookups concurrently; returns only the tokens that
    /// resolved to a summary.
    pub async fn get_orderbook_bulk(&self, tokens: &[TokenId]) -> HashMap<TokenId, OrderbookView> {
        let futures = tokens.iter().map(|t| async move { (t.clone(), self.get_orderbook(t).await) });
        let results = futures_util::future::join_all(futures).await;
        results.into_iter().filter_map(|(t, v)| v.map(|v| (t, v))).collect()
    }

    pub fn metrics(&self) -> FacadeMetricsSnapshot {
        FacadeMetricsSnapshot {
            push_hits: self.counters.push_hits.load(Ordering::Relaxed),
            pull_fallbacks: self.counters.pull_fallbacks.load(Ordering::Relaxed),
            rate_limit_hits: self.counters.rate_limit_hits.load(Ordering::Relaxed),
            stale_cache_hits: self.counters.stale_cache_hits.load(Ordering::Relaxed),
            mode: self.store.mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimiter, RateLimiterConfig};
    use crate::pull::PullClientConfig;
    use crate::store::StoreConfig;

    fn facade() -> Arc<MarketDataFacade> {
        let store = MarketDataStore::new(StoreConfig::default());
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let pull = Arc::new(
            PullClient::new(PullClientConfig::default(), limiter, store.clone()).unwrap(),
        );
        MarketDataFacade::new(store, pull)
    }

    #[tokio::test]
    async fn fresh_push_summary_returns_without_touching_pull() {
        let facade = facade();
        let t = TokenId::from("T1");
        facade.store.update_from_push(
            &t,
            vec![crate::normalize::PriceLevel { price: rust_decimal_macros::dec!(0.50), size: rust_decimal_macros::dec!(10) }],
            vec![crate::normalize::PriceLevel { price: rust_decimal_macros::dec!(0.52), size: rust_decimal_macros::dec!(10) }],
        );
        let view = facade.get_orderbook(&t).await.unwrap();
        assert_eq!(view.origin, Origin::Push);
        assert_eq!(facade.metrics().pull_fallbacks, 0);
    }

    #[tokio::test]
    async fn absent_token_with_no_cache_returns_none() {
        let facade = facade();
        let t = TokenId::from("ghost");
        // Pull will fail (no real HTTP endpoint in tests); absence is total.
        let view = facade.get_orderbook(&t).await;
        assert!(view.is_none());
    }
}
