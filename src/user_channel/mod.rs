//! User Channel Client — authenticated streaming connection tracking
//! own-order lifecycle, fills, and balance pushes (§4.5).
//!
//! Grounded on the same connect/reconnect/keepalive skeleton as
//! [`crate::push`], itself grounded on the donor's
//! `scrapers::polymarket_ws::PolymarketMarketWsCache`; the HMAC credential
//! shape is grounded on `vault::execution::PolymarketClobCredentials`.

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::clock::TokenId;
use crate::error::UserChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    PermanentlyDisabled,
}

/// Credentials obtained from the execution adapter at connect time, already
/// resolved to these three fields regardless of which spelling the caller's
/// own config source used. The outbound subscribe payload always emits the
/// documented `apiKey` field name.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn from_fields(
        api_key: Option<String>,
        secret: Option<String>,
        passphrase: Option<String>,
    ) -> Result<Self, UserChannelError> {
        let api_key = api_key
            .filter(|s| !s.is_empty())
            .ok_or(UserChannelError::MissingCredential("api_key"))?;
        let secret = secret
            .filter(|s| !s.is_empty())
            .ok_or(UserChannelError::MissingCredential("secret"))?;
        let passphrase = passphrase
            .filter(|s| !s.is_empty())
            .ok_or(UserChannelError::MissingCredential("passphrase"))?;
        Ok(Self { api_key, secret, passphrase })
    }

    /// Loads credentials from the process environment, accepting either of
    /// two historical spellings per field (§6). The documented name is
    /// checked first; the legacy unprefixed alternate is the fallback.
    pub fn from_env() -> Result<Self, UserChannelError> {
        let api_key = env::var("CLOB_API_KEY").ok().or_else(|| env::var("CLOB_APIKEY").ok());
        let secret = env::var("CLOB_API_SECRET").ok().or_else(|| env::var("CLOB_SECRET").ok());
        let passphrase = env::var("CLOB_API_PASSPHRASE").ok().or_else(|| env::var("CLOB_PASSPHRASE").ok());
        Self::from_fields(api_key, secret, passphrase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Delayed,
    Live,
    Matched,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: String,
    pub token_id: TokenId,
    pub side: OrderSide,
    pub price: Decimal,
    pub original_size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OwnTrade {
    pub trade_id: String,
    pub order_id: String,
    pub token_id: TokenId,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl OwnTrade {
    pub fn fill_value(&self) -> Decimal {
        self.price * self.size
    }
}

#[derive(Debug, Clone)]
pub struct BalanceEvent {
    pub collateral: Option<Decimal>,
    pub native_gas: Option<Decimal>,
}

#[derive(Debug, Deserialize, Default)]
struct WireOrderEvent {
    order_id: String,
    asset_id: String,
    side: String,
    price: String,
    original_size: String,
    size_matched: String,
    status: String,
    /// Server-assigned epoch milliseconds (§4.5, §6); the authoritative
    /// ordering key. Absent on upstreams that predate the field — those
    /// fall back to local receipt time, which cannot detect genuine
    /// out-of-order delivery.
    #[serde(default)]
    updated_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireTradeEvent {
    trade_id: String,
    order_id: String,
    asset_id: String,
    side: String,
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct WireBalanceEvent {
    #[serde(default)]
    collateral: Option<String>,
    #[serde(default)]
    native_gas: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundEvent {
    #[serde(rename = "order")]
    Order(WireOrderEvent),
    #[serde(rename = "trade")]
    Trade(WireTradeEvent),
    #[serde(rename = "balance")]
    Balance(WireBalanceEvent),
    #[serde(rename = "subscribed")]
    Subscribed,
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(other)]
    Other,
}

fn parse_side(s: &str) -> Option<OrderSide> {
    match s.to_ascii_uppercase().as_str() {
        "BUY" => Some(OrderSide::Buy),
        "SELL" => Some(OrderSide::Sell),
        _ => None,
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s.to_ascii_lowercase().as_str() {
        "delayed" => OrderStatus::Delayed,
        "matched" => OrderStatus::Matched,
        "cancelled" | "canceled" => OrderStatus::Cancelled,
        "expired" => OrderStatus::Expired,
        _ => OrderStatus::Live,
    }
}

pub struct UserChannelConfig {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub prune_horizon: Duration,
}

impl Default for UserChannelConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.example.com/ws/user".to_string(),
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            prune_horizon: Duration::from_secs(24 * 3600),
        }
    }
}

type BalanceCallback = Arc<dyn Fn(BalanceEvent) + Send + Sync>;

struct TrackedOrdersInner {
    orders: HashMap<String, TrackedOrder>,
    /// Fills indexed by token id, per the data model's authoritative index;
    /// each record also carries its own `order_id` for per-order lookups.
    trades_by_token: HashMap<TokenId, Vec<OwnTrade>>,
}

enum Command {
    Disconnect,
}

pub struct UserChannelClient {
    config: UserChannelConfig,
    creds: Result<Credentials, UserChannelError>,
    state: RwLock<ClientState>,
    inner: RwLock<TrackedOrdersInner>,
    balance_callback: RwLock<Option<BalanceCallback>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    attempt: AtomicUsize,
    disabled_reported: AtomicBool,
}

impl UserChannelClient {
    pub fn new(config: UserChannelConfig, creds: Result<Credentials, UserChannelError>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let permanently_disabled = creds.is_err();
        let client = Arc::new(Self {
            config,
            creds,
            state: RwLock::new(if permanently_disabled {
                ClientState::PermanentlyDisabled
            } else {
                ClientState::Disconnected
            }),
            inner: RwLock::new(TrackedOrdersInner {
                orders: HashMap::new(),
                trades_by_token: HashMap::new(),
            }),
            balance_callback: RwLock::new(None),
            cmd_tx,
            attempt: AtomicUsize::new(0),
            disabled_reported: AtomicBool::new(false),
        });

        if !permanently_disabled {
            let worker = client.clone();
            tokio::spawn(async move { worker.run(cmd_rx).await });
        }
        client
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn set_balance_callback(&self, cb: BalanceCallback) {
        *self.balance_callback.write() = Some(cb);
    }

    pub fn tracked_order(&self, order_id: &str) -> Option<TrackedOrder> {
        self.inner.read().orders.get(order_id).cloned()
    }

    pub fn trades_for_token(&self, token: &TokenId) -> Vec<OwnTrade> {
        self.inner.read().trades_by_token.get(token).cloned().unwrap_or_default()
    }

    pub fn disconnect(&self) {
        *self.state.write() = ClientState::Disconnected;
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Drop non-live orders and trades older than `prune_horizon`.
    pub fn prune(&self, now: DateTime<Utc>) {
        let horizon = chrono::Duration::from_std(self.config.prune_horizon).unwrap_or(chrono::Duration::hours(24));
        let mut inner = self.inner.write();
        inner.orders.retain(|_, o| {
            o.status == OrderStatus::Live || now.signed_duration_since(o.updated_at) < horizon
        });
        for trades in inner.trades_by_token.values_mut() {
            trades.retain(|t| now.signed_duration_since(t.timestamp) < horizon);
        }
        inner.trades_by_token.retain(|_, v| !v.is_empty());
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let Ok(creds) = &self.creds else { return };
        loop {
            *self.state.write() = ClientState::Connecting;
            match self.connect_and_stream(&mut cmd_rx, creds).await {
                Ok(Outcome::Clean) => {
                    *self.state.write() = ClientState::Disconnected;
                    return;
                }
                Ok(Outcome::AuthRejected(msg)) => {
                    *self.state.write() = ClientState::PermanentlyDisabled;
                    if !self.disabled_reported.swap(true, Ordering::Relaxed) {
                        warn!(error = %msg, "user channel permanently disabled after auth rejection");
                    }
                    return;
                }
                Ok(Outcome::Dropped) | Err(_) => {
                    *self.state.write() = ClientState::Reconnecting;
                    let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
                    let delay = crate::push::backoff_delay(
                        self.config.reconnect_base,
                        self.config.reconnect_max,
                        attempt,
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        creds: &Credentials,
    ) -> anyhow::Result<Outcome> {
        let (ws_stream, _resp) = connect_async(&self.config.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let sub_msg = serde_json::json!({
            "type": "user",
            "markets": [],
            "auth": {
                "apiKey": creds.api_key,
                "secret": creds.secret,
                "passphrase": creds.passphrase,
            }
        });
        *self.state.write() = ClientState::Authenticating;
        write.send(Message::Text(sub_msg.to_string())).await?;

        let mut ping_timer = interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pong_deadline: Option<tokio::time::Instant> = None;

        loop {
            let pong_wait = async {
                match pong_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(tokio::time::Instant::now() + self.config.pong_timeout);
                    }
                }
                _ = pong_wait => {
                    return Ok(Outcome::Dropped);
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Disconnect) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(Outcome::Clean);
                        }
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(Outcome::Dropped) };
                    match msg? {
                        Message::Text(text) => {
                            if text.eq_ignore_ascii_case("PONG") {
                                pong_deadline = None;
                                continue;
                            }
                            if let Some(outcome) = self.handle_text(&text) {
                                return Ok(outcome);
                            }
                        }
                        Message::Close(_) => return Ok(Outcome::Dropped),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Returns `Some(outcome)` only when the loop must exit (auth settled
    /// or auth rejected); `None` means "keep streaming".
    fn handle_text(&self, text: &str) -> Option<Outcome> {
        let event: InboundEvent = serde_json::from_str(text).ok()?;
        match event {
            InboundEvent::Subscribed => {
                *self.state.write() = ClientState::Connected;
                self.attempt.store(0, Ordering::Relaxed);
                None
            }
            InboundEvent::Error { message } => {
                if message.to_ascii_lowercase().contains("auth") {
                    return Some(Outcome::AuthRejected(message));
                }
                warn!(error = %message, "user channel non-auth error");
                None
            }
            InboundEvent::Order(ev) => {
                self.apply_order_event(ev);
                None
            }
            InboundEvent::Trade(ev) => {
                self.apply_trade_event(ev);
                None
            }
            InboundEvent::Balance(ev) => {
                let collateral = ev.collateral.and_then(|s| s.parse().ok());
                let native_gas = ev.native_gas.and_then(|s| s.parse().ok());
                if let Some(cb) = self.balance_callback.read().as_ref() {
                    cb(BalanceEvent { collateral, native_gas });
                }
                None
            }
            InboundEvent::Other => None,
        }
    }

    fn apply_order_event(&self, ev: WireOrderEvent) {
        let (Some(side), Ok(price), Ok(original_size), Ok(filled_size)) = (
            parse_side(&ev.side),
            ev.price.parse::<Decimal>(),
            ev.original_size.parse::<Decimal>(),
            ev.size_matched.parse::<Decimal>(),
        ) else {
            return;
        };
        let received_at = Utc::now();
        // The wire timestamp, not local receipt time, is the authoritative
        // ordering key (§4.5) — only it can distinguish a genuinely
        // out-of-order delivery from normal in-order delivery, since
        // local receipt time is monotonic by construction.
        let event_ts = ev
            .updated_at
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
            .unwrap_or(received_at);
        let status = parse_status(&ev.status);
        let token_id = TokenId::from(ev.asset_id);

        let mut inner = self.inner.write();
        match inner.orders.get_mut(&ev.order_id) {
            Some(existing) if existing.updated_at > event_ts => {
                // Later-arriving timestamp is authoritative; an out-of-order
                // delivery of a stale event is ignored.
            }
            Some(existing) => {
                existing.filled_size = filled_size;
                existing.status = status;
                existing.updated_at = event_ts;
            }
            None => {
                inner.orders.insert(
                    ev.order_id.clone(),
                    TrackedOrder {
                        order_id: ev.order_id,
                        token_id,
                        side,
                        price,
                        original_size,
                        filled_size,
                        status,
                        created_at: event_ts,
                        updated_at: event_ts,
                    },
                );
            }
        }
    }

    fn apply_trade_event(&self, ev: WireTradeEvent) {
        let (Some(side), Ok(price), Ok(size)) =
            (parse_side(&ev.side), ev.price.parse::<Decimal>(), ev.size.parse::<Decimal>())
        else {
            return;
        };
        let token_id = TokenId::from(ev.asset_id);
        let trade = OwnTrade {
            trade_id: ev.trade_id,
            order_id: ev.order_id,
            token_id: token_id.clone(),
            side,
            price,
            size,
            timestamp: Utc::now(),
        };
        self.inner.write().trades_by_token.entry(token_id).or_default().push(trade);
    }
}

enum Outcome {
    Clean,
    Dropped,
    AuthRejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_client() -> Arc<UserChannelClient> {
        UserChannelClient::new(
            UserChannelConfig::default(),
            Credentials::from_fields(None, Some("s".into()), Some("p".into())),
        )
    }

    #[test]
    fn missing_credential_permanently_disables_without_connecting() {
        let client = disabled_client();
        assert_eq!(client.state(), ClientState::PermanentlyDisabled);
    }

    #[test]
    fn from_fields_rejects_empty_strings_too() {
        let result = Credentials::from_fields(Some(String::new()), Some("s".into()), Some("p".into()));
        assert!(matches!(result, Err(UserChannelError::MissingCredential("api_key"))));
    }

    #[test]
    fn order_event_upsert_and_monotonic_timestamp() {
        let creds = Credentials::from_fields(Some("k".into()), Some("s".into()), Some("p".into())).unwrap();
        let client = Arc::new(UserChannelClient {
            config: UserChannelConfig::default(),
            creds: Ok(creds),
            state: RwLock::new(ClientState::Connected),
            inner: RwLock::new(TrackedOrdersInner { orders: HashMap::new(), trades_by_token: HashMap::new() }),
            balance_callback: RwLock::new(None),
            cmd_tx: mpsc::unbounded_channel().0,
            attempt: AtomicUsize::new(0),
            disabled_reported: AtomicBool::new(false),
        });

        client.apply_order_event(WireOrderEvent {
            order_id: "O1".into(),
            asset_id: "T1".into(),
            side: "BUY".into(),
            price: "0.55".into(),
            original_size: "100".into(),
            size_matched: "0".into(),
            status: "live".into(),
            updated_at: Some(1_000),
        });
        client.apply_order_event(WireOrderEvent {
            order_id: "O1".into(),
            asset_id: "T1".into(),
            side: "BUY".into(),
            price: "0.55".into(),
            original_size: "100".into(),
            size_matched: "40".into(),
            status: "live".into(),
            updated_at: Some(2_000),
        });

        let order = client.tracked_order("O1").unwrap();
        assert_eq!(order.filled_size.to_string(), "40");
    }

    #[test]
    fn out_of_order_wire_timestamp_is_dropped() {
        let creds = Credentials::from_fields(Some("k".into()), Some("s".into()), Some("p".into())).unwrap();
        let client = Arc::new(UserChannelClient {
            config: UserChannelConfig::default(),
            creds: Ok(creds),
            state: RwLock::new(ClientState::Connected),
            inner: RwLock::new(TrackedOrdersInner { orders: HashMap::new(), trades_by_token: HashMap::new() }),
            balance_callback: RwLock::new(None),
            cmd_tx: mpsc::unbounded_channel().0,
            attempt: AtomicUsize::new(0),
            disabled_reported: AtomicBool::new(false),
        });

        client.apply_order_event(WireOrderEvent {
            order_id: "O1".into(),
            asset_id: "T1".into(),
            side: "BUY".into(),
            price: "0.55".into(),
            original_size: "100".into(),
            size_matched: "40".into(),
            status: "live".into(),
            updated_at: Some(2_000),
        });
        // Arrives after the above in receive order but carries an earlier
        // wire timestamp: a genuine out-of-order delivery.
        client.apply_order_event(WireOrderEvent {
            order_id: "O1".into(),
            asset_id: "T1".into(),
            side: "BUY".into(),
            price: "0.55".into(),
            original_size: "100".into(),
            size_matched: "10".into(),
            status: "live".into(),
            updated_at: Some(1_000),
        });

        let order = client.tracked_order("O1").unwrap();
        assert_eq!(order.filled_size.to_string(), "40");
    }

    #[test]
    fn trade_event_indexed_by_token_with_fill_value() {
        let creds = Credentials::from_fields(Some("k".into()), Some("s".into()), Some("p".into())).unwrap();
        let client = Arc::new(UserChannelClient {
            config: UserChannelConfig::default(),
            creds: Ok(creds),
            state: RwLock::new(ClientState::Connected),
            inner: RwLock::new(TrackedOrdersInner { orders: HashMap::new(), trades_by_token: HashMap::new() }),
            balance_callback: RwLock::new(None),
            cmd_tx: mpsc::unbounded_channel().0,
            attempt: AtomicUsize::new(0),
            disabled_reported: AtomicBool::new(false),
        });

        client.apply_trade_event(WireTradeEvent {
            trade_id: "TR1".into(),
            order_id: "O1".into(),
            asset_id: "T1".into(),
            side: "BUY".into(),
            price: "0.50".into(),
            size: "10".into(),
        });

        let trades = client.trades_for_token(&TokenId::from("T1"));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].fill_value().to_string(), "5.00");
    }
}
