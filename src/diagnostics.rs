//! Structured diagnostic records emitted alongside `tracing` events for the
//! pull fetch path and execution rejections (§4.3, §4.6). These are values,
//! not logs: callers that want them can inspect the fields; `tracing::debug!`
//! calls elsewhere cover the log-line side.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::clock::TokenId;
use crate::normalize::PriceLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcomeClass {
    Success,
    EmptyBook,
    ParseFail,
    MarketClosed,
    RateLimited,
    HttpError,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct PullDiagnostic {
    pub token: TokenId,
    pub redacted_url: String,
    pub http_status: Option<u16>,
    pub latency: Duration,
    pub raw_bid_count: usize,
    pub raw_ask_count: usize,
    pub valid_bid_count: usize,
    pub valid_ask_count: usize,
    pub top_bids: Vec<PriceLevel>,
    pub top_asks: Vec<PriceLevel>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub dust_book: bool,
    pub outcome: PullOutcomeClass,
}

const DUST_FLOOR: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
const DUST_CEILING: Decimal = Decimal::from_parts(99, 0, 0, false, 2); // 0.99

/// `true` iff both sides sit pinned against the extreme protocol bounds —
/// the boundary case from §8: `best_bid = 0.01, best_ask = 0.99`.
pub fn is_dust(best_bid: Decimal, best_ask: Decimal) -> bool {
    best_bid <= DUST_FLOOR && best_ask >= DUST_CEILING
}

fn top_n(levels: &[PriceLevel], n: usize) -> Vec<PriceLevel> {
    levels.iter().take(n).copied().collect()
}

impl PullDiagnostic {
    pub fn new(
        token: TokenId,
        redacted_url: String,
        http_status: Option<u16>,
        latency: Duration,
        raw_bid_count: usize,
        raw_ask_count: usize,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        outcome: PullOutcomeClass,
    ) -> Self {
        let best_bid = bids.first().map(|l| l.price);
        let best_ask = asks.first().map(|l| l.price);
        let dust_book = matches!((best_bid, best_ask), (Some(b), Some(a)) if is_dust(b, a));
        Self {
            token,
            redacted_url,
            http_status,
            latency,
            raw_bid_count,
            raw_ask_count,
            valid_bid_count: bids.len(),
            valid_ask_count: asks.len(),
            top_bids: top_n(bids, 3),
            top_asks: top_n(asks, 3),
            best_bid,
            best_ask,
            dust_book,
            outcome,
        }
    }
}

/// Rejection diagnostic for a failed order submission attempt (§4.6, §7).
#[derive(Debug, Clone)]
pub struct RejectionDiagnostic {
    pub token: TokenId,
    pub side: String,
    pub notional: Decimal,
    pub attempted_limit: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub reason: crate::error::RejectReason,
    pub order_type: &'static str,
}
