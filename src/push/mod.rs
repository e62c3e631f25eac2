//! Push Client (Market Channel) — a single persistent streaming connection
//! that reconstructs L2 books from snapshot + delta messages and writes
//! them into the [`MarketDataStore`].
//!
//! Grounded on the donor's `scrapers::polymarket_ws::PolymarketMarketWsCache`
//! (connect loop, "PING" keepalive text frame, reconnect-with-backoff) and
//! `scrapers::polymarket_book_store`'s subscription bookkeeping, generalized
//! to the explicit state machine, single-flight reconnect guard, and
//! delta-reconstruction maps the design calls for.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::clock::TokenId;
use crate::normalize::{self, PriceLevel, Side};
use crate::store::MarketDataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub struct PushClientConfig {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub stable_connection_duration: Duration,
}

impl Default for PushClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.example.com/ws/market".to_string(),
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            stable_connection_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct PushMetrics {
    books_applied: AtomicU64,
    deltas_applied: AtomicU64,
    deltas_dropped_uninitialized: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct PushMetricsSnapshot {
    pub books_applied: u64,
    pub deltas_applied: u64,
    pub deltas_dropped_uninitialized: u64,
    pub reconnects: u64,
}

enum Command {
    Subscribe(Vec<TokenId>),
    Unsubscribe(Vec<TokenId>),
    Disconnect,
}

/// Per-token delta-reconstruction maps, keyed by string price (the wire
/// representation) to preserve exact round-tripping of the upstream's price
/// formatting until it is parsed for sorting.
#[derive(Default)]
struct DeltaMaps {
    bids: HashMap<String, Decimal>,
    asks: HashMap<String, Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type")]
enum InboundEvent {
    #[serde(rename = "book")]
    Book {
        asset_id: String,
        bids: Vec<normalize::RawLevel>,
        asks: Vec<normalize::RawLevel>,
    },
    #[serde(rename = "price_change")]
    PriceChange { asset_id: String, changes: Vec<ChangeEntry> },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ChangeEntry {
    price: String,
    size: String,
    side: String,
}

/// Streaming market-data client. One instance owns exactly one logical
/// connection; reconnect state lives behind `state` and `reconnect_guard`.
pub struct PushClient {
    config: PushClientConfig,
    store: Arc<MarketDataStore>,
    state: RwLock<ClientState>,
    subscriptions: RwLock<HashSet<TokenId>>,
    pending_subscriptions: RwLock<HashSet<TokenId>>,
    delta_maps: Mutex<HashMap<TokenId, DeltaMaps>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    reconnect_guard: Mutex<bool>,
    attempt: AtomicUsize,
    metrics: PushMetrics,
    shutdown: Notify,
}

impl PushClient {
    pub fn new(config: PushClientConfig, store: Arc<MarketDataStore>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            config,
            store,
            state: RwLock::new(ClientState::Disconnected),
            subscriptions: RwLock::new(HashSet::new()),
            pending_subscriptions: RwLock::new(HashSet::new()),
            delta_maps: Mutex::new(HashMap::new()),
            cmd_tx,
            reconnect_guard: Mutex::new(false),
            attempt: AtomicUsize::new(0),
            metrics: PushMetrics::default(),
            shutdown: Notify::new(),
        });
        let worker = client.clone();
        tokio::spawn(async move { worker.run(cmd_rx).await });
        client
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn subscriptions(&self) -> Vec<TokenId> {
        self.subscriptions.read().iter().cloned().collect()
    }

    pub fn metrics(&self) -> PushMetricsSnapshot {
        PushMetricsSnapshot {
            books_applied: self.metrics.books_applied.load(Ordering::Relaxed),
            deltas_applied: self.metrics.deltas_applied.load(Ordering::Relaxed),
            deltas_dropped_uninitialized: self.metrics.deltas_dropped_uninitialized.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Idempotent: a no-op if already `connected`/`connecting`.
    pub fn connect(&self) {
        let mut guard = self.reconnect_guard.lock();
        if *guard {
            return;
        }
        let state = self.state();
        if state == ClientState::Connected || state == ClientState::Connecting {
            return;
        }
        *guard = true;
        drop(guard);
        self.shutdown.notify_one();
    }

    /// Safe to call from any state. Cancels the run loop's timers by
    /// sending `Command::Disconnect`, which the loop processes before its
    /// next socket operation.
    pub fn disconnect(&self) {
        *self.state.write() = ClientState::Disconnected;
        self.store.set_push_connected(false);
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub fn subscribe(&self, tokens: Vec<TokenId>) {
        if self.is_connected() {
            let _ = self.cmd_tx.send(Command::Subscribe(tokens));
        } else {
            let mut pending = self.pending_subscriptions.write();
            for t in tokens {
                pending.insert(t);
            }
        }
    }

    pub fn unsubscribe(&self, tokens: Vec<TokenId>) {
        let _ = self.cmd_tx.send(Command::Unsubscribe(tokens));
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            // Sit disconnected and idle until an explicit connect() call
            // flips the reconnect guard and notifies us. Automatic
            // reconnect-on-drop below does not re-wait here.
            self.shutdown.notified().await;
            loop {
                *self.state.write() = ClientState::Connecting;
                match self.connect_and_stream(&mut cmd_rx).await {
                    Ok(CloseReason::Clean) => {
                        *self.state.write() = ClientState::Disconnected;
                        self.store.set_push_connected(false);
                        *self.reconnect_guard.lock() = false;
                        break;
                    }
                    Ok(CloseReason::Dropped) | Err(_) => {
                        *self.state.write() = ClientState::Reconnecting;
                        self.store.set_push_connected(false);
                        self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
                        let delay = backoff_delay(
                            self.config.reconnect_base,
                            self.config.reconnect_max,
                            attempt,
                        );
                        warn!(?delay, attempt, "market ws disconnected; reconnecting");
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> anyhow::Result<CloseReason> {
        let (ws_stream, _resp) = connect_async(&self.config.ws_url).await?;
        info!(url = %self.config.ws_url, "market ws connected");
        *self.state.write() = ClientState::Connected;

        let (mut write, mut read) = ws_stream.split();

        // Re-subscribe contract: exactly one initial-format message, union
        // of current subscriptions and any pending ones, sent once.
        {
            let mut subs = self.subscriptions.write();
            let mut pending = self.pending_subscriptions.write();
            for t in pending.drain() {
                subs.insert(t);
            }
            let ids: Vec<String> = subs.iter().map(|t| t.as_str().to_string()).collect();
            let msg = serde_json::json!({ "type": "market", "assets_ids": ids });
            write.send(Message::Text(msg.to_string())).await?;
        }

        let stable_sleep = sleep(self.config.stable_connection_duration);
        tokio::pin!(stable_sleep);

        let mut ping_timer = interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pong_deadline: Option<tokio::time::Instant> = None;

        loop {
            let pong_wait = async {
                match pong_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut stable_sleep => {
                    self.attempt.store(0, Ordering::Relaxed);
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(tokio::time::Instant::now() + self.config.pong_timeout);
                    }
                }
                _ = pong_wait => {
                    warn!("market ws pong timeout; treating socket as dead");
                    return Ok(CloseReason::Dropped);
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Disconnect) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(CloseReason::Clean);
                        }
                        Some(Command::Subscribe(tokens)) => {
                            let mut subs = self.subscriptions.write();
                            let new: Vec<String> = tokens.iter()
                                .filter(|t| subs.insert((*t).clone()))
                                .map(|t| t.as_str().to_string())
                                .collect();
                            drop(subs);
                            if !new.is_empty() {
                                let msg = serde_json::json!({ "operation": "subscribe", "assets_ids": new });
                                write.send(Message::Text(msg.to_string())).await?;
                            }
                        }
                        Some(Command::Unsubscribe(tokens)) => {
                            let mut subs = self.subscriptions.write();
                            let removed: Vec<String> = tokens.iter()
                                .filter(|t| subs.remove(*t))
                                .map(|t| t.as_str().to_string())
                                .collect();
                            drop(subs);
                            if !removed.is_empty() {
                                let msg = serde_json::json!({ "operation": "unsubscribe", "assets_ids": removed });
                                write.send(Message::Text(msg.to_string())).await?;
                            }
                        }
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(CloseReason::Dropped);
                    };
                    match msg? {
                        Message::Text(text) => {
                            if text.eq_ignore_ascii_case("PONG") {
                                pong_deadline = None;
                                continue;
                            }
                            self.handle_text(&text);
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Close(frame) => {
                            debug!(?frame, "market ws close frame");
                            return Ok(CloseReason::Dropped);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let event: InboundEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "failed to parse market ws message");
                return;
            }
        };

        match event {
            InboundEvent::Book { asset_id, bids, asks } => {
                let token = TokenId::from(asset_id);
                let mut bid_map = HashMap::new();
                let mut ask_map = HashMap::new();
                for lvl in &bids {
                    if let Some(p) = normalize::parse_level(lvl) {
                        bid_map.insert(lvl.price.clone(), p.size);
                    }
                }
                for lvl in &asks {
                    if let Some(p) = normalize::parse_level(lvl) {
                        ask_map.insert(lvl.price.clone(), p.size);
                    }
                }
                self.delta_maps.lock().insert(
                    token.clone(),
                    DeltaMaps { bids: bid_map, asks: ask_map },
                );
                self.write_from_maps(&token);
                self.metrics.books_applied.fetch_add(1, Ordering::Relaxed);
            }
            InboundEvent::PriceChange { asset_id, changes } => {
                let token = TokenId::from(asset_id);
                let mut maps = self.delta_maps.lock();
                let Some(entry) = maps.get_mut(&token) else {
                    self.metrics.deltas_dropped_uninitialized.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                for change in &changes {
                    let Ok(size) = change.size.parse::<Decimal>() else { continue };
                    let map = match change.side.to_ascii_uppercase().as_str() {
                        "BUY" => &mut entry.bids,
                        "SELL" => &mut entry.asks,
                        _ => continue,
                    };
                    if size <= Decimal::ZERO {
                        map.remove(&change.price);
                    } else {
                        map.insert(change.price.clone(), size);
                    }
                }
                let side_emptied = entry.bids.is_empty() || entry.asks.is_empty();
                drop(maps);
                self.write_from_maps(&token);
                if side_emptied {
                    self.delta_maps.lock().remove(&token);
                }
                self.metrics.deltas_applied.fetch_add(1, Ordering::Relaxed);
            }
            InboundEvent::Other => {}
        }
    }

    fn write_from_maps(&self, token: &TokenId) {
        let maps = self.delta_maps.lock();
        let Some(entry) = maps.get(token) else { return };
        if entry.bids.is_empty() || entry.asks.is_empty() {
            return;
        }
        let bid_levels: Vec<PriceLevel> = entry
            .bids
            .iter()
            .filter_map(|(p, s)| Some(PriceLevel { price: p.parse().ok()?, size: *s }))
            .collect();
        let ask_levels: Vec<PriceLevel> = entry
            .asks
            .iter()
            .filter_map(|(p, s)| Some(PriceLevel { price: p.parse().ok()?, size: *s }))
            .collect();
        drop(maps);

        let bids = normalize::normalize_levels(&bid_levels, Side::Bid);
        let asks = normalize::normalize_levels(&ask_levels, Side::Ask);
        if bids.is_empty() || asks.is_empty() {
            return;
        }
        self.store.update_from_push(token, bids, asks);
    }
}

enum CloseReason {
    Clean,
    Dropped,
}

pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(20).saturating_sub(1).min(16) as u32);
    let capped = exp.min(max);
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.3);
    capped.mul_f64(1.0 + jitter_frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    fn store() -> Arc<MarketDataStore> {
        MarketDataStore::new(StoreConfig::default())
    }

    #[test]
    fn backoff_grows_and_caps_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let d1 = backoff_delay(base, max, 1);
        let d5 = backoff_delay(base, max, 5);
        let d20 = backoff_delay(base, max, 20);
        assert!(d1 >= base && d1 <= base.mul_f64(1.3));
        assert!(d5 > d1);
        assert!(d20 <= max.mul_f64(1.3));
    }

    #[test]
    fn handle_book_then_read_matches_scenario_one() {
        let store = store();
        let client = Arc::new(PushClient {
            config: PushClientConfig::default(),
            store: store.clone(),
            state: RwLock::new(ClientState::Connected),
            subscriptions: RwLock::new(HashSet::new()),
            pending_subscriptions: RwLock::new(HashSet::new()),
            delta_maps: Mutex::new(HashMap::new()),
            cmd_tx: mpsc::unbounded_channel().0,
            reconnect_guard: Mutex::new(false),
            attempt: AtomicUsize::new(0),
            metrics: PushMetrics::default(),
            shutdown: Notify::new(),
        });

        let text = r#"{"event_type":"book","asset_id":"T1","bids":[{"price":"0.48","size":"100"},{"price":"0.50","size":"50"}],"asks":[{"price":"0.52","size":"80"},{"price":"0.53","size":"200"}]}"#;
        client.handle_text(text);

        let summary = store.get(&TokenId::from("T1")).unwrap();
        assert_eq!(summary.best_bid.to_string(), "0.50");
        assert_eq!(summary.best_ask.to_string(), "0.52");
    }

    #[test]
    fn delta_then_read_matches_scenario_two() {
        let store = store();
        let client = Arc::new(PushClient {
            config: PushClientConfig::default(),
            store: store.clone(),
            state: RwLock::new(ClientState::Connected),
            subscriptions: RwLock::new(HashSet::new()),
            pending_subscriptions: RwLock::new(HashSet::new()),
            delta_maps: Mutex::new(HashMap::new()),
            cmd_tx: mpsc::unbounded_channel().0,
            reconnect_guard: Mutex::new(false),
            attempt: AtomicUsize::new(0),
            metrics: PushMetrics::default(),
            shutdown: Notify::new(),
        });

        let book = r#"{"event_type":"book","asset_id":"T1","bids":[{"price":"0.48","size":"100"},{"price":"0.50","size":"50"}],"asks":[{"price":"0.52","size":"80"},{"price":"0.53","size":"200"}]}"#;
        client.handle_text(book);

        let delta = r#"{"event_type":"price_change","asset_id":"T1","changes":[{"price":"0.50","size":"0","side":"BUY"},{"price":"0.51","size":"25","side":"BUY"}]}"#;
        client.handle_text(delta);

        let summary = store.get(&TokenId::from("T1")).unwrap();
        assert_eq!(summary.best_bid.to_string(), "0.51");
        assert_eq!(summary.spread_cents.to_string(), "1.00");
    }

    #[test]
    fn delta_before_book_is_dropped() {
        let store = store();
        let client = Arc::new(PushClient {
            config: PushClientConfig::default(),
            store: store.clone(),
            state: RwLock::new(ClientState::Connected),
            subscriptions: RwLock::new(HashSet::new()),
            pending_subscriptions: RwLock::new(HashSet::new()),
            delta_maps: Mutex::new(HashMap::new()),
            cmd_tx: mpsc::unbounded_channel().0,
            reconnect_guard: Mutex::new(false),
            attempt: AtomicUsize::new(0),
            metrics: PushMetrics::default(),
            shutdown: Notify::new(),
        });

        let delta = r#"{"event_type":"price_change","asset_id":"T1","changes":[{"price":"0.50","size":"25","side":"BUY"}]}"#;
        client.handle_text(delta);

        assert!(store.get(&TokenId::from("T1")).is_none());
        assert_eq!(client.metrics().deltas_dropped_uninitialized, 1);
    }

    #[test]
    fn side_emptying_drops_delta_maps_and_does_not_write_one_sided_book() {
        let store = store();
        let client = Arc::new(PushClient {
            config: PushClientConfig::default(),
            store: store.clone(),
            state: RwLock::new(ClientState::Connected),
            subscriptions: RwLock::new(HashSet::new()),
            pending_subscriptions: RwLock::new(HashSet::new()),
            delta_maps: Mutex::new(HashMap::new()),
            cmd_tx: mpsc::unbounded_channel().0,
            reconnect_guard: Mutex::new(false),
            attempt: AtomicUsize::new(0),
            metrics: PushMetrics::default(),
            shutdown: Notify::new(),
        });

        let book = r#"{"event_type":"book","asset_id":"T1","bids":[{"price":"0.50","size":"50"}],"asks":[{"price":"0.52","size":"80"}]}"#;
        client.handle_text(book);

        let wipe_bids = r#"{"event_type":"price_change","asset_id":"T1","changes":[{"price":"0.50","size":"0","side":"BUY"}]}"#;
        client.handle_text(wipe_bids);

        // Book unchanged from before the wipe (one-sided update rejected).
        let summary = store.get(&TokenId::from("T1")).unwrap();
        assert_eq!(summary.best_bid.to_string(), "0.50");

        // Next delta for this token is dropped: the maps were discarded.
        let stray = r#"{"event_type":"price_change","asset_id":"T1","changes":[{"price":"0.49","size":"10","side":"BUY"}]}"#;
        client.handle_text(stray);
        assert_eq!(client.metrics().deltas_dropped_uninitialized, 1);
    }
}
