//! The error taxonomy from the design's error-handling section.
//!
//! These are the types callers actually branch on. Internal plumbing (HTTP
//! connects, JSON decoding) still propagates through `anyhow::Result` with
//! `.context(...)`, the donor's style; these enums exist at the seams where
//! a caller needs to distinguish outcomes rather than just log-and-move-on.

use thiserror::Error;

/// Outcome of a single pull-fallback fetch attempt.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("rate limited: refused by local limiter or upstream 429")]
    RateLimited,
    #[error("market closed (404)")]
    MarketClosed,
    #[error("book empty after parsing (no tradeable liquidity)")]
    EmptyBook,
    #[error("failed to parse orderbook response: {0}")]
    ParseFail(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
}

/// Reasons the user channel can never come up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UserChannelError {
    #[error("missing credential field: {0}")]
    MissingCredential(&'static str),
    #[error("authentication rejected by server: {0}")]
    AuthRejected(String),
}

/// Classified reasons an order submission (or pre-submission validation)
/// did not result in a resting/filled order. Mirrors §4.6/§7 of the design.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("book unhealthy (empty, dust, dead, or crossed)")]
    BookUnhealthy,
    #[error("spread exceeds configured threshold")]
    SpreadTooWide,
    #[error("price outside strategy bounds")]
    OutsideStrategyBounds,
    #[error("price outside hard protocol bounds")]
    OutsideHardBounds,
    #[error("market moved outside bounds between IOC reject and resting compute")]
    MarketMovedOutsideBounds,
    #[error("duplicate submission within cooldown window")]
    CooldownActive,
    #[error("upstream price too low")]
    PriceTooLow,
    #[error("upstream price too high")]
    PriceTooHigh,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("tick size violation")]
    TickViolation,
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("unclassified rejection: {0}")]
    Unknown(String),
}

impl RejectReason {
    /// Heuristic classification of an upstream error message, the same way
    /// the pull client classifies HTTP status substrings.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("too low") || lower.contains("below minimum") {
            RejectReason::PriceTooLow
        } else if lower.contains("too high") || lower.contains("above maximum") {
            RejectReason::PriceTooHigh
        } else if lower.contains("insufficient") || lower.contains("balance") {
            RejectReason::InsufficientBalance
        } else if lower.contains("tick") {
            RejectReason::TickViolation
        } else if lower.contains("rate limit") || lower.contains("429") {
            RejectReason::RateLimited
        } else {
            RejectReason::Unknown(message.to_string())
        }
    }
}
