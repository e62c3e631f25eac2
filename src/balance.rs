//! Balance Cache — throttled, single-flight view of the owner's collateral
//! and gas balances (§4.7).
//!
//! Grounded on the donor's `vault::execution::PolymarketClobAdapter::
//! get_account_info` (independent sub-reads, zero-on-failure) and on the
//! rate limiter's single-flight pattern, generalized here into an explicit
//! "fetch in progress" `Notify` so concurrent callers coalesce onto one RPC
//! pair rather than each adapter call doing its own internal fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BalanceSnapshot {
    pub collateral: Decimal,
    pub native_gas: Decimal,
    pub fetched_at: Instant,
    pub last_fetch_succeeded: bool,
    pub last_error: Option<String>,
}

/// On-chain read port. Each sub-read independently signals failure with
/// `None` (network error, RPC timeout, decode failure) — distinct from a
/// legitimate `Some(Decimal::ZERO)` balance. The cache, not the port, turns
/// a failed sub-read into "keep the prior value" or "report zero and flag."
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn read_collateral(&self, address: &str) -> Option<Decimal>;
    async fn read_native_gas(&self, address: &str) -> Option<Decimal>;
}

struct Inner {
    last: Option<BalanceSnapshot>,
    fetching: bool,
}

#[derive(Default)]
struct BalanceMetrics {
    fetches: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct BalanceMetricsSnapshot {
    pub fetches: u64,
    pub failures: u64,
    pub coalesced: u64,
}

pub struct BalanceCache<R: BalanceReader> {
    reader: Arc<R>,
    address: String,
    refresh_interval: Duration,
    inner: Mutex<Inner>,
    fetch_done: Notify,
    metrics: BalanceMetrics,
}

impl<R: BalanceReader> BalanceCache<R> {
    pub fn new(reader: Arc<R>, address: String, refresh_interval: Duration) -> Self {
        Self {
            reader,
            address,
            refresh_interval,
            inner: Mutex::new(Inner { last: None, fetching: false }),
            fetch_done: Notify::new(),
            metrics: BalanceMetrics::default(),
        }
    }

    pub fn metrics(&self) -> BalanceMetricsSnapshot {
        BalanceMetricsSnapshot {
            fetches: self.metrics.fetches.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            coalesced: self.metrics.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Pure cache read, no I/O.
    pub fn last(&self) -> Option<BalanceSnapshot> {
        self.inner.lock().last.clone()
    }

    /// Returns the cached snapshot if still fresh; otherwise coalesces with
    /// any in-flight fetch, or starts a new one. At most one outstanding RPC
    /// pair at any time.
    pub async fn get(&self) -> BalanceSnapshot {
        loop {
            {
                let mut guard = self.inner.lock();
                if let Some(snap) = &guard.last {
                    if snap.fetched_at.elapsed() < self.refresh_interval {
                        return snap.clone();
                    }
                }
                if !guard.fetching {
                    guard.fetching = true;
                    drop(guard);
                    return self.do_fetch().await;
                }
            }
            self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
            self.fetch_done.notified().await;
            let guard = self.inner.lock();
            if let Some(snap) = &guard.last {
                if snap.fetched_at.elapsed() < self.refresh_interval {
                    return snap.clone();
                }
            }
            // The fetch that just completed was already stale by the time
            // we woke up (rare); loop to either read a fresher one or start
            // our own.
        }
    }

    /// Waits for any in-flight fetch, invalidates, then performs a fresh
    /// fetch unconditionally.
    pub async fn force_refresh(&self) -> BalanceSnapshot {
        loop {
            let mut guard = self.inner.lock();
            if guard.fetching {
                drop(guard);
                self.fetch_done.notified().await;
                continue;
            }
            guard.fetching = true;
            guard.last = None;
            break;
        }
        self.do_fetch().await
    }

    async fn do_fetch(&self) -> BalanceSnapshot {
        self.metrics.fetches.fetch_add(1, Ordering::Relaxed);
        let collateral_result = self.reader.read_collateral(&self.address).await;
        let gas_result = self.reader.read_native_gas(&self.address).await;

        let prior = self.inner.lock().last.clone();
        let prior_collateral = prior.as_ref().map(|p| p.collateral).unwrap_or(Decimal::ZERO);
        let prior_gas = prior.as_ref().map(|p| p.native_gas).unwrap_or(Decimal::ZERO);

        // Each sub-read is evaluated independently: a failed leg falls back
        // to its own prior value (or zero if there is none) without
        // touching the other leg's fresh result.
        let collateral = collateral_result.unwrap_or(prior_collateral);
        let native_gas = gas_result.unwrap_or(prior_gas);
        let any_leg_failed = collateral_result.is_none() || gas_result.is_none();

        let (succeeded, last_error) = if any_leg_failed {
            let failed_leg = match (collateral_result.is_none(), gas_result.is_none()) {
                (true, true) => "collateral and native_gas",
                (true, false) => "collateral",
                (false, true) => "native_gas",
                (false, false) => unreachable!(),
            };
            warn!(leg = failed_leg, "balance sub-read failed; keeping prior value for that leg");
            (false, Some(format!("sub-read failed: {failed_leg}")))
        } else {
            (true, None)
        };

        if !succeeded {
            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        }

        let snapshot = BalanceSnapshot {
            collateral,
            native_gas,
            fetched_at: Instant::now(),
            last_fetch_succeeded: succeeded,
            last_error,
        };

        let mut guard = self.inner.lock();
        guard.last = Some(snapshot.clone());
        guard.fetching = false;
        drop(guard);
        self.fetch_done.notify_waiters();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use rust_decimal_macros::dec;

    struct CountingReader {
        calls: AtomicU64,
        collateral: Option<Decimal>,
        gas: Option<Decimal>,
    }

    #[async_trait]
    impl BalanceReader for CountingReader {
        async fn read_collateral(&self, _address: &str) -> Option<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.collateral
        }
        async fn read_native_gas(&self, _address: &str) -> Option<Decimal> {
            self.gas
        }
    }

    #[tokio::test]
    async fn concurrent_gets_while_stale_issue_exactly_one_rpc_pair() {
        let reader = Arc::new(CountingReader { calls: AtomicU64::new(0), collateral: Some(dec!(100)), gas: Some(dec!(1)) });
        let cache = Arc::new(BalanceCache::new(reader.clone(), "0xabc".to_string(), Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get().await }));
        }
        for h in handles {
            let snap = h.await.unwrap();
            assert_eq!(snap.collateral, dec!(100));
        }
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        assert!(cache.metrics().coalesced >= 1);
    }

    #[tokio::test]
    async fn fresh_cache_is_returned_without_refetch() {
        let reader = Arc::new(CountingReader { calls: AtomicU64::new(0), collateral: Some(dec!(50)), gas: Some(dec!(2)) });
        let cache = BalanceCache::new(reader.clone(), "0xabc".to_string(), Duration::from_secs(60));
        let _ = cache.get().await;
        let _ = cache.get().await;
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().fetches, 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_prior_value_and_flags_failure() {
        let reader = Arc::new(CountingReader { calls: AtomicU64::new(0), collateral: Some(dec!(75)), gas: Some(dec!(3)) });
        let cache = BalanceCache::new(reader, "0xabc".to_string(), Duration::from_millis(1));
        let first = cache.get().await;
        assert!(first.last_fetch_succeeded);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let failing_reader = Arc::new(CountingReader { calls: AtomicU64::new(0), collateral: None, gas: None });
        let cache2 = BalanceCache::new(failing_reader, "0xabc".to_string(), Duration::from_millis(1));
        {
            let mut guard = cache2.inner.lock();
            guard.last = Some(first.clone());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache2.get().await;
        assert!(!second.last_fetch_succeeded);
        assert_eq!(second.collateral, dec!(75));
        assert_eq!(cache2.metrics().failures, 1);
    }

    #[tokio::test]
    async fn single_leg_failure_keeps_that_legs_prior_value_but_applies_the_other() {
        // Collateral sub-read fails (returns None per the port contract);
        // gas succeeds with a new, different value. The collateral leg
        // must keep its prior value and the whole fetch must be flagged
        // failed, even though gas alone would look like full success.
        let reader = Arc::new(CountingReader { calls: AtomicU64::new(0), collateral: Some(dec!(75)), gas: Some(dec!(3)) });
        let cache = BalanceCache::new(reader, "0xabc".to_string(), Duration::from_millis(1));
        let first = cache.get().await;
        assert!(first.last_fetch_succeeded);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let partial_reader = Arc::new(CountingReader { calls: AtomicU64::new(0), collateral: None, gas: Some(dec!(9)) });
        let cache2 = BalanceCache::new(partial_reader, "0xabc".to_string(), Duration::from_millis(1));
        {
            let mut guard = cache2.inner.lock();
            guard.last = Some(first.clone());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache2.get().await;
        assert!(!second.last_fetch_succeeded);
        assert_eq!(second.collateral, dec!(75));
        assert_eq!(second.native_gas, dec!(9));
    }
}
