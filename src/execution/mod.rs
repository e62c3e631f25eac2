//! Execution Engine — turns a desired trade into a submitted order that
//! either fills immediately or rests at a book-respecting price (§4.6).
//!
//! Grounded on the donor's `vault::execution::{ExecutionAdapter, OrderSide,
//! TimeInForce, PolymarketClobAdapter}`: the external submit port keeps the
//! donor's trait-object shape, generalized from one-shot `place_order` to
//! the explicit IOC-then-resting two-step protocol and the HARD/STRATEGY
//! bounds machinery the design specifies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::warn;

use crate::clock::TokenId;
use crate::diagnostics::RejectionDiagnostic;
use crate::error::RejectReason;
use crate::facade::MarketDataFacade;
use crate::user_channel::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundDirection {
    Ceil,
    Floor,
}

fn round_to_tick(value: Decimal, tick: Decimal, direction: RoundDirection) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    let ratio = value / tick;
    let rounded_ratio = match direction {
        RoundDirection::Ceil => ratio.ceil(),
        RoundDirection::Floor => ratio.floor(),
    };
    rounded_ratio * tick
}

fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.max(min).min(max)
}

/// External port supplying the per-token tick size. A missing lookup falls
/// back to the engine's configured default, with a diagnostic flag.
pub trait TickSizePort: Send + Sync {
    fn tick_size(&self, token: &TokenId) -> Option<Decimal>;
}

#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub success: bool,
    pub order_id: Option<String>,
    pub error_message: Option<String>,
}

/// External order-submission adapter. The spec fixes the inputs (price in
/// collateral units) and leaves the wire format to the adapter.
#[async_trait]
pub trait SubmitPort: Send + Sync {
    async fn submit_ioc(&self, token: &TokenId, side: OrderSide, shares: Decimal, price: Decimal) -> SubmitOutcome;
    async fn submit_resting(&self, token: &TokenId, side: OrderSide, shares: Decimal, price: Decimal) -> SubmitOutcome;
}

pub struct ExecutionConfig {
    pub hard_min: Decimal,
    pub hard_max: Decimal,
    pub strategy_min: Decimal,
    pub strategy_max: Decimal,
    pub default_tick_size: Decimal,
    pub slippage_frac: Decimal,
    pub max_spread_cents: Decimal,
    pub buy_cooldown: Duration,
    pub fallback_to_resting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Ioc,
    Resting,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub pending: bool,
    pub filled: Option<Decimal>,
    pub price: Option<Decimal>,
    pub order_type: Option<OrderType>,
    pub order_id: Option<String>,
    pub reason: Option<RejectReason>,
    pub diagnostic: Option<RejectionDiagnostic>,
}

impl ExecutionResult {
    fn rejected(reason: RejectReason, diagnostic: RejectionDiagnostic) -> Self {
        Self {
            success: false,
            pending: false,
            filled: None,
            price: None,
            order_type: None,
            order_id: None,
            reason: Some(reason),
            diagnostic: Some(diagnostic),
        }
    }
}

#[derive(Default)]
struct ExecutionMetrics {
    ioc_submitted: AtomicU64,
    ioc_fills: AtomicU64,
    resting_submitted: AtomicU64,
    resting_fills: AtomicU64,
    rejections: AtomicU64,
    cooldown_rejections: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionMetricsSnapshot {
    pub ioc_submitted: u64,
    pub ioc_fills: u64,
    pub resting_submitted: u64,
    pub resting_fills: u64,
    pub rejections: u64,
    pub cooldown_rejections: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DesiredTrade {
    pub token: TokenId,
    pub side: OrderSide,
    pub notional: Decimal,
}

struct BookSnapshot {
    best_bid: Decimal,
    best_ask: Decimal,
    spread_cents: Decimal,
}

// The Normalizer rejects any non-positive price before a level ever reaches
// the Store (`normalize::parse_level`), so a book read from the facade can
// never have `best_bid <= 0` or `best_ask <= 0` — crossed, dust, and
// too-wide-spread are the reachable unhealthy states.
fn is_book_unhealthy(book: &BookSnapshot, max_spread_cents: Decimal, hard_min: Decimal, hard_max: Decimal) -> bool {
    let crossed = book.best_bid >= book.best_ask;
    let dust = crate::diagnostics::is_dust(book.best_bid, book.best_ask);
    crossed || dust || book.spread_cents > max_spread_cents || book.best_bid < hard_min || book.best_ask > hard_max
}

/// Execution Engine. Holds no book or balance state of its own; reads both
/// through the injected facade/balance handles at submission time.
pub struct ExecutionEngine<S: SubmitPort, T: TickSizePort> {
    config: ExecutionConfig,
    facade: Arc<MarketDataFacade>,
    submit: Arc<S>,
    tick_size: Arc<T>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    metrics: ExecutionMetrics,
}

impl<S: SubmitPort, T: TickSizePort> ExecutionEngine<S, T> {
    pub fn new(config: ExecutionConfig, facade: Arc<MarketDataFacade>, submit: Arc<S>, tick_size: Arc<T>) -> Self {
        Self {
            config,
            facade,
            submit,
            tick_size,
            cooldowns: Mutex::new(HashMap::new()),
            metrics: ExecutionMetrics::default(),
        }
    }

    pub fn metrics(&self) -> ExecutionMetricsSnapshot {
        ExecutionMetricsSnapshot {
            ioc_submitted: self.metrics.ioc_submitted.load(Ordering::Relaxed),
            ioc_fills: self.metrics.ioc_fills.load(Ordering::Relaxed),
            resting_submitted: self.metrics.resting_submitted.load(Ordering::Relaxed),
            resting_fills: self.metrics.resting_fills.load(Ordering::Relaxed),
            rejections: self.metrics.rejections.load(Ordering::Relaxed),
            cooldown_rejections: self.metrics.cooldown_rejections.load(Ordering::Relaxed),
        }
    }

    /// Builds the full submission context for a rejection (§4.6 point 6):
    /// token, side, notional, the attempted limit, and the book read at
    /// reject time where one was available.
    fn diagnostic_for(
        trade: &DesiredTrade,
        reason: &RejectReason,
        attempted_limit: Decimal,
        book: Option<&BookSnapshot>,
        order_type: &'static str,
    ) -> RejectionDiagnostic {
        RejectionDiagnostic {
            token: trade.token.clone(),
            side: format!("{:?}", trade.side),
            notional: trade.notional,
            attempted_limit,
            best_bid: book.map(|b| b.best_bid).unwrap_or(Decimal::ZERO),
            best_ask: book.map(|b| b.best_ask).unwrap_or(Decimal::ZERO),
            reason: reason.clone(),
            order_type,
        }
    }

    fn cooldown_key(token: &TokenId) -> String {
        format!("buy:{}", token.as_str())
    }

    fn cooldown_active(&self, token: &TokenId) -> bool {
        let cooldowns = self.cooldowns.lock();
        match cooldowns.get(&Self::cooldown_key(token)) {
            Some(started) => started.elapsed() < self.config.buy_cooldown,
            None => false,
        }
    }

    fn arm_cooldown(&self, token: &TokenId) {
        self.cooldowns.lock().insert(Self::cooldown_key(token), Instant::now());
    }

    /// Cleared by any successful fill on that key.
    fn clear_cooldown(&self, token: &TokenId) {
        self.cooldowns.lock().remove(&Self::cooldown_key(token));
    }

    fn tick_for(&self, token: &TokenId) -> Decimal {
        self.tick_size.tick_size(token).unwrap_or_else(|| {
            warn!(token = %token, "tick size lookup missed; using configured default");
            self.config.default_tick_size
        })
    }

    fn compute_ioc_limit(&self, side: OrderSide, book: &BookSnapshot, tick: Decimal) -> Decimal {
        let base = match side {
            OrderSide::Buy => book.best_ask,
            OrderSide::Sell => book.best_bid,
        };
        let raw = match side {
            OrderSide::Buy => base * (Decimal::ONE + self.config.slippage_frac),
            OrderSide::Sell => base * (Decimal::ONE - self.config.slippage_frac),
        };
        let clamped = clamp(raw, self.config.hard_min, self.config.hard_max);
        let direction = match side {
            OrderSide::Buy => RoundDirection::Ceil,
            OrderSide::Sell => RoundDirection::Floor,
        };
        let rounded = round_to_tick(clamped, tick, direction);
        self.must_not_cross(side, rounded, book, tick)
    }

    /// For buy, bump up to the next tick at or above `best_ask` if rounding
    /// left the limit crossing the book; symmetric for sell.
    fn must_not_cross(&self, side: OrderSide, limit: Decimal, book: &BookSnapshot, tick: Decimal) -> Decimal {
        match side {
            OrderSide::Buy if limit < book.best_ask => {
                let bumped = round_to_tick(book.best_ask, tick, RoundDirection::Ceil);
                clamp(bumped, self.config.hard_min, self.config.hard_max)
            }
            OrderSide::Sell if limit > book.best_bid => {
                let bumped = round_to_tick(book.best_bid, tick, RoundDirection::Floor);
                clamp(bumped, self.config.hard_min, self.config.hard_max)
            }
            _ => limit,
        }
    }

    fn validate(&self, side: OrderSide, limit: Decimal, book: &BookSnapshot) -> Option<RejectReason> {
        if is_book_unhealthy(book, self.config.max_spread_cents, self.config.hard_min, self.config.hard_max) {
            return Some(RejectReason::BookUnhealthy);
        }
        if book.spread_cents > self.config.max_spread_cents {
            return Some(RejectReason::SpreadTooWide);
        }
        match side {
            OrderSide::Buy if book.best_ask > self.config.strategy_max => {
                return Some(RejectReason::OutsideStrategyBounds)
            }
            OrderSide::Sell if book.best_bid < self.config.strategy_min => {
                return Some(RejectReason::OutsideStrategyBounds)
            }
            _ => {}
        }
        if limit < self.config.hard_min || limit > self.config.hard_max {
            return Some(RejectReason::OutsideHardBounds);
        }
        None
    }

    pub async fn execute(&self, trade: DesiredTrade) -> ExecutionResult {
        if trade.side == OrderSide::Buy && self.cooldown_active(&trade.token) {
            let reason = RejectReason::CooldownActive;
            let diagnostic = Self::diagnostic_for(&trade, &reason, Decimal::ZERO, None, "ioc");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            self.metrics.cooldown_rejections.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::rejected(reason, diagnostic);
        }

        let Some(view) = self.facade.get_orderbook(&trade.token).await else {
            let reason = RejectReason::BookUnhealthy;
            let diagnostic = Self::diagnostic_for(&trade, &reason, Decimal::ZERO, None, "ioc");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::rejected(reason, diagnostic);
        };
        let book = BookSnapshot {
            best_bid: view.summary.best_bid,
            best_ask: view.summary.best_ask,
            spread_cents: view.summary.spread_cents,
        };
        let tick = self.tick_for(&trade.token);

        let ioc_limit = self.compute_ioc_limit(trade.side, &book, tick);
        if let Some(reason) = self.validate(trade.side, ioc_limit, &book) {
            let diagnostic = Self::diagnostic_for(&trade, &reason, ioc_limit, Some(&book), "ioc");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::rejected(reason, diagnostic);
        }

        let shares = trade.notional / ioc_limit;
        self.metrics.ioc_submitted.fetch_add(1, Ordering::Relaxed);
        let ioc_outcome = self.submit.submit_ioc(&trade.token, trade.side, shares, ioc_limit).await;

        if ioc_outcome.success {
            if trade.side == OrderSide::Buy {
                self.clear_cooldown(&trade.token);
            }
            self.metrics.ioc_fills.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult {
                success: true,
                pending: false,
                filled: Some(trade.notional),
                price: Some(match trade.side {
                    OrderSide::Buy => book.best_ask,
                    OrderSide::Sell => book.best_bid,
                }),
                order_type: Some(OrderType::Ioc),
                order_id: ioc_outcome.order_id,
                reason: None,
                diagnostic: None,
            };
        }

        if trade.side == OrderSide::Buy {
            self.arm_cooldown(&trade.token);
        }

        if !self.config.fallback_to_resting {
            let reason = ioc_outcome
                .error_message
                .as_deref()
                .map(RejectReason::classify)
                .unwrap_or(RejectReason::Unknown("ioc failed, no fallback".to_string()));
            let diagnostic = Self::diagnostic_for(&trade, &reason, ioc_limit, Some(&book), "ioc");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::rejected(reason, diagnostic);
        }

        // Re-read the book: it may have moved since the IOC reject.
        let Some(fresh_view) = self.facade.get_orderbook(&trade.token).await else {
            let reason = RejectReason::BookUnhealthy;
            let diagnostic = Self::diagnostic_for(&trade, &reason, ioc_limit, Some(&book), "resting");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::rejected(reason, diagnostic);
        };
        let fresh_book = BookSnapshot {
            best_bid: fresh_view.summary.best_bid,
            best_ask: fresh_view.summary.best_ask,
            spread_cents: fresh_view.summary.spread_cents,
        };

        let pre_clamp = match trade.side {
            OrderSide::Buy => self.config.strategy_max.min(fresh_book.best_ask.max(ioc_limit)),
            OrderSide::Sell => self.config.strategy_min.max(fresh_book.best_bid.min(ioc_limit)),
        };
        let direction = match trade.side {
            OrderSide::Buy => RoundDirection::Ceil,
            OrderSide::Sell => RoundDirection::Floor,
        };
        let clamped = clamp(pre_clamp, self.config.hard_min, self.config.hard_max);
        let rounded = round_to_tick(clamped, tick, direction);
        let resting_limit = self.must_not_cross(trade.side, rounded, &fresh_book, tick);

        let moved_outside_bounds = match trade.side {
            OrderSide::Buy => resting_limit > self.config.strategy_max,
            OrderSide::Sell => resting_limit < self.config.strategy_min,
        };
        if moved_outside_bounds {
            let reason = RejectReason::MarketMovedOutsideBounds;
            let diagnostic = Self::diagnostic_for(&trade, &reason, resting_limit, Some(&fresh_book), "resting");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::rejected(reason, diagnostic);
        }

        let resting_shares = trade.notional / resting_limit;
        self.metrics.resting_submitted.fetch_add(1, Ordering::Relaxed);
        let resting_outcome = self
            .submit
            .submit_resting(&trade.token, trade.side, resting_shares, resting_limit)
            .await;

        if resting_outcome.success {
            self.metrics.resting_fills.fetch_add(1, Ordering::Relaxed);
            ExecutionResult {
                success: true,
                pending: true,
                filled: None,
                price: Some(resting_limit),
                order_type: Some(OrderType::Resting),
                order_id: resting_outcome.order_id,
                reason: None,
                diagnostic: None,
            }
        } else {
            let reason = resting_outcome
                .error_message
                .as_deref()
                .map(RejectReason::classify)
                .unwrap_or(RejectReason::Unknown("resting order failed".to_string()));
            let diagnostic = Self::diagnostic_for(&trade, &reason, resting_limit, Some(&fresh_book), "resting");
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
            ExecutionResult::rejected(reason, diagnostic)
        }
    }
}
