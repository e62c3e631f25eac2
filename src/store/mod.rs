//! Market Data Store — the authoritative, concurrency-safe, in-memory view
//! of per-token best bid/ask, depth, and full L2 levels.
//!
//! Grounded on the donor's `BookStore` (`scrapers/polymarket_book_store.rs`):
//! one `RwLock`-guarded map, atomic swap of an immutable book per token, a
//! staleness predicate computed from a monotonic clock. Generalized here to
//! add the LRU capacity bound and the push/pull dedup rule the design calls
//! for, which the donor's unbounded HFT cache doesn't need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::clock::{Clock, TokenId};
use crate::normalize::{self, PriceLevel};

/// Which channel most recently wrote a token's summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Push,
    Pull,
}

/// Derived projection of the L2 book, recomputed on every write (§3).
#[derive(Debug, Clone)]
pub struct TokenMarketSummary {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid: Decimal,
    pub spread_cents: Decimal,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub updated_at: Instant,
    pub source: DataSource,
}

/// Full L2 book for a token.
#[derive(Debug, Clone)]
pub struct L2Book {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Pure function of connection state and staleness, per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    PushOk,
    PushStaleFallback,
    PullOnly,
}

pub struct StoreConfig {
    pub max_tokens: usize,
    pub stale_threshold: Duration,
    /// Depth window, in cents, around mid.
    pub depth_window_cents: Decimal,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            stale_threshold: Duration::from_millis(3000),
            depth_window_cents: Decimal::from(200), // ±$2.00
        }
    }
}

struct Entry {
    summary: TokenMarketSummary,
    book: L2Book,
}

#[derive(Default)]
struct Counters {
    push_writes: AtomicU64,
    pull_writes: AtomicU64,
    dedup_hits: AtomicU64,
    evictions: AtomicU64,
}

/// Authoritative per-token book store. Single writer per critical section
/// (the `RwLock`'s write half); LRU bookkeeping lives inside the same lock
/// so capacity eviction can never race with a concurrent read/write on the
/// entry it is about to remove.
pub struct MarketDataStore {
    config: StoreConfig,
    clock: Clock,
    inner: RwLock<Inner>,
    push_connected: AtomicBool,
    counters: Counters,
}

struct Inner {
    entries: HashMap<TokenId, Entry>,
    /// LRU recency: a monotonically increasing touch counter per token, and
    /// the reverse index (touch tick -> token) used to find the eviction
    /// candidate in O(log n). Both are mutated under the same write lock as
    /// `entries`, so they can never fall out of lockstep.
    touch_of: HashMap<TokenId, u64>,
    recency: std::collections::BTreeMap<u64, TokenId>,
    next_touch: u64,
}

impl Inner {
    fn touch(&mut self, token: &TokenId) {
        if let Some(old) = self.touch_of.remove(token) {
            self.recency.remove(&old);
        }
        let tick = self.next_touch;
        self.next_touch += 1;
        self.touch_of.insert(token.clone(), tick);
        self.recency.insert(tick, token.clone());
    }

    fn forget(&mut self, token: &TokenId) {
        if let Some(old) = self.touch_of.remove(token) {
            self.recency.remove(&old);
        }
        self.entries.remove(token);
    }

    fn evict_lru_if_over_capacity(&mut self, max_tokens: usize, counters: &Counters) {
        while self.entries.len() > max_tokens {
            let Some((&tick, victim)) = self.recency.iter().next() else { break };
            let victim = victim.clone();
            self.recency.remove(&tick);
            self.touch_of.remove(&victim);
            self.entries.remove(&victim);
            counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl MarketDataStore {
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock: Clock::new(),
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                touch_of: HashMap::new(),
                recency: std::collections::BTreeMap::new(),
                next_touch: 0,
            }),
            push_connected: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// O(1); touches LRU; never blocks on network.
    pub fn get(&self, token: &TokenId) -> Option<TokenMarketSummary> {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(token) {
            inner.touch(token);
        }
        inner.entries.get(token).map(|e| e.summary.clone())
    }

    /// O(1) view of the L2 book.
    pub fn get_book(&self, token: &TokenId) -> Option<L2Book> {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(token) {
            inner.touch(token);
        }
        inner.entries.get(token).map(|e| e.book.clone())
    }

    pub fn has(&self, token: &TokenId) -> bool {
        self.inner.read().entries.contains_key(token)
    }

    /// Age since last write, or `Duration::MAX` if absent.
    pub fn age(&self, token: &TokenId) -> Duration {
        match self.inner.read().entries.get(token) {
            Some(e) => self.clock.elapsed(e.summary.updated_at),
            None => Duration::MAX,
        }
    }

    pub fn is_stale(&self, token: &TokenId) -> bool {
        self.age(token) >= self.config.stale_threshold
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn remove(&self, token: &TokenId) {
        self.inner.write().forget(token);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.touch_of.clear();
        inner.recency.clear();
    }

    pub fn set_push_connected(&self, connected: bool) {
        self.push_connected.store(connected, Ordering::Release);
    }

    /// Mode is a pure function of the connection flag and how many tracked
    /// tokens are currently stale.
    pub fn mode(&self) -> Mode {
        if !self.push_connected.load(Ordering::Acquire) {
            return Mode::PullOnly;
        }
        let inner = self.inner.read();
        let now = Instant::now();
        let any_stale = inner.entries.values().any(|e| {
            now.saturating_duration_since(e.summary.updated_at) >= self.config.stale_threshold
        });
        if any_stale {
            Mode::PushStaleFallback
        } else {
            Mode::PushOk
        }
    }

    pub fn update_from_push(&self, token: &TokenId, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> bool {
        self.update(token, bids, asks, DataSource::Push)
    }

    pub fn update_from_pull(&self, token: &TokenId, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> bool {
        self.update(token, bids, asks, DataSource::Pull)
    }

    fn update(&self, token: &TokenId, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, source: DataSource) -> bool {
        if bids.is_empty() || asks.is_empty() {
            return false;
        }
        if !normalize::is_valid_book(&bids, &asks) {
            return false;
        }

        let best_bid = bids[0].price;
        let best_ask = asks[0].price;
        let now = self.clock.now();

        let mut inner = self.inner.write();

        if let Some(existing) = inner.entries.get(token) {
            if existing.summary.best_bid == best_bid
                && existing.summary.best_ask == best_ask
                && existing.summary.source == source
            {
                // Dedup: identical best-of-book from the same source — only
                // the timestamp (and LRU position) move.
                inner.touch(token);
                if let Some(e) = inner.entries.get_mut(token) {
                    e.summary.updated_at = now;
                }
                self.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let mid = (best_bid + best_ask) / Decimal::TWO;
        let spread_cents = (best_ask - best_bid) * Decimal::from(100);
        let (bid_depth, ask_depth) = depth_within_window(&bids, &asks, mid, self.config.depth_window_cents);

        let summary = TokenMarketSummary {
            best_bid,
            best_ask,
            mid,
            spread_cents,
            bid_depth,
            ask_depth,
            updated_at: now,
            source,
        };
        let book = L2Book { bids, asks };

        inner.entries.insert(token.clone(), Entry { summary, book });
        inner.touch(token);
        inner.evict_lru_if_over_capacity(self.config.max_tokens, &self.counters);

        match source {
            DataSource::Push => self.counters.push_writes.fetch_add(1, Ordering::Relaxed),
            DataSource::Pull => self.counters.pull_writes.fetch_add(1, Ordering::Relaxed),
        };

        true
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            push_writes: self.counters.push_writes.load(Ordering::Relaxed),
            pull_writes: self.counters.pull_writes.load(Ordering::Relaxed),
            dedup_hits: self.counters.dedup_hits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size: self.size(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreMetricsSnapshot {
    pub push_writes: u64,
    pub pull_writes: u64,
    pub dedup_hits: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Depth within `window_cents` of `mid`, iterating from best price on each
/// side and stopping at the first level outside the window — sound because
/// bids are descending and asks ascending, so once one level falls outside
/// the window every subsequent level on that side does too.
fn depth_within_window(
    bids: &[PriceLevel],
    asks: &[PriceLevel],
    mid: Decimal,
    window_cents: Decimal,
) -> (Decimal, Decimal) {
    let window = window_cents / Decimal::from(100);

    let mut bid_depth = Decimal::ZERO;
    for lvl in bids {
        if mid - lvl.price > window {
            break;
        }
        bid_depth += lvl.size * lvl.price;
    }

    let mut ask_depth = Decimal::ZERO;
    for lvl in asks {
        if lvl.price - mid > window {
            break;
        }
        ask_depth += lvl.size * lvl.price;
    }

    (bid_depth, ask_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(pairs: &[(&str, &str)]) -> Vec<PriceLevel> {
        pairs
            .iter()
            .map(|(p, s)| PriceLevel { price: p.parse().unwrap(), size: s.parse().unwrap() })
            .collect()
    }

    #[test]
    fn update_from_push_computes_summary() {
        let store = MarketDataStore::new(StoreConfig::default());
        let t = TokenId::from("T1");
        let bids = levels(&[("0.50", "50"), ("0.48", "100")]);
        let asks = levels(&[("0.52", "80"), ("0.53", "200")]);
        assert!(store.update_from_push(&t, bids, asks));

        let summary = store.get(&t).unwrap();
        assert_eq!(summary.best_bid, dec!(0.50));
        assert_eq!(summary.best_ask, dec!(0.52));
        assert_eq!(summary.mid, dec!(0.51));
        assert_eq!(summary.spread_cents, dec!(2.00));
        assert_eq!(summary.source, DataSource::Push);
    }

    #[test]
    fn rejects_empty_side() {
        let store = MarketDataStore::new(StoreConfig::default());
        let t = TokenId::from("T1");
        assert!(!store.update_from_push(&t, vec![], levels(&[("0.52", "1")])));
        assert!(store.get(&t).is_none());
    }

    #[test]
    fn dedup_returns_false_and_only_touches_timestamp() {
        let store = MarketDataStore::new(StoreConfig::default());
        let t = TokenId::from("T1");
        let bids = levels(&[("0.50", "50")]);
        let asks = levels(&[("0.52", "80")]);
        assert!(store.update_from_push(&t, bids.clone(), asks.clone()));
        assert!(!store.update_from_push(&t, bids, asks));
    }

    #[test]
    fn lru_evicts_least_recently_touched() {
        let store = MarketDataStore::new(StoreConfig {
            max_tokens: 2,
            ..StoreConfig::default()
        });
        let (t1, t2, t3) = (TokenId::from("T1"), TokenId::from("T2"), TokenId::from("T3"));
        store.update_from_push(&t1, levels(&[("0.10", "1")]), levels(&[("0.20", "1")]));
        store.update_from_push(&t2, levels(&[("0.10", "1")]), levels(&[("0.20", "1")]));
        // Touch t1 so t2 becomes the LRU victim when t3 is inserted.
        let _ = store.get(&t1);
        store.update_from_push(&t3, levels(&[("0.10", "1")]), levels(&[("0.20", "1")]));

        assert_eq!(store.size(), 2);
        assert!(store.has(&t1));
        assert!(!store.has(&t2));
        assert!(store.has(&t3));
    }

    #[test]
    fn size_never_exceeds_max_tokens() {
        let store = MarketDataStore::new(StoreConfig {
            max_tokens: 3,
            ..StoreConfig::default()
        });
        for i in 0..10 {
            let t = TokenId::from(format!("T{i}"));
            store.update_from_push(&t, levels(&[("0.10", "1")]), levels(&[("0.20", "1")]));
            assert!(store.size() <= 3);
        }
    }

    #[test]
    fn remove_clears_entry_from_map_and_lru() {
        let store = MarketDataStore::new(StoreConfig::default());
        let t = TokenId::from("T1");
        store.update_from_push(&t, levels(&[("0.10", "1")]), levels(&[("0.20", "1")]));
        store.remove(&t);
        assert!(!store.has(&t));
        assert_eq!(store.size(), 0);
        // Re-inserting under capacity must not trip eviction bookkeeping.
        store.update_from_push(&t, levels(&[("0.10", "1")]), levels(&[("0.20", "1")]));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn mode_reflects_connection_flag() {
        let store = MarketDataStore::new(StoreConfig::default());
        assert_eq!(store.mode(), Mode::PullOnly);
        store.set_push_connected(true);
        assert_eq!(store.mode(), Mode::PushOk);
    }

    #[test]
    fn depth_window_stops_at_first_out_of_range_level() {
        let bids = levels(&[("0.50", "10"), ("0.40", "10")]);
        let asks = levels(&[("0.52", "10"), ("0.80", "10")]);
        let mid = dec!(0.51);
        // window_cents = 5 -> window = 0.05: 0.50 and 0.52 qualify, 0.40 and 0.80 do not.
        let (bid_depth, ask_depth) = depth_within_window(&bids, &asks, mid, dec!(5));
        assert_eq!(bid_depth, dec!(0.50) * dec!(10));
        assert_eq!(ask_depth, dec!(0.52) * dec!(10));
    }
}
