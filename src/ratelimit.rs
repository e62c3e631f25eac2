//! Global + per-key rate limiter with single-flight in-flight locking and
//! stale-lock recovery (§4.3).
//!
//! Grounded on the donor's `middleware::rate_limit::RateLimitLayer` (sliding
//! window over a `parking_lot::Mutex<HashMap<..>>`) and
//! `scrapers::polymarket_api::RateLimiter` (single fixed-window limiter per
//! upstream). This generalizes both into the one primitive the design
//! specifies: `try_acquire`/`release` as a single atomic check-and-update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::TokenId;

pub struct RateLimiterConfig {
    pub global_min_interval: Duration,
    pub per_token_min_interval: Duration,
    pub lock_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(50),
            per_token_min_interval: Duration::from_millis(1000),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

struct TokenState {
    last_call: Option<Instant>,
    lock_acquired_at: Option<Instant>,
}

struct State {
    last_call_global: Option<Instant>,
    tokens: HashMap<TokenId, TokenState>,
}

/// Global + per-key rate limiter. All fields guarded by a single mutex;
/// `try_acquire`/`release` are atomic check-and-update as required by §5.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<State>,
    rate_limit_hits: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State { last_call_global: None, tokens: HashMap::new() }),
            rate_limit_hits: AtomicU64::new(0),
        }
    }

    /// Atomically: recover a stale in-flight lock, check global/per-token
    /// cadence, and — only if all checks pass — record the call and mark
    /// the token's lock held. Returns `true` iff the caller may proceed.
    pub fn try_acquire(&self, token: &TokenId) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let entry = state.tokens.entry(token.clone()).or_insert(TokenState {
            last_call: None,
            lock_acquired_at: None,
        });

        if let Some(acquired_at) = entry.lock_acquired_at {
            if now.saturating_duration_since(acquired_at) < self.config.lock_timeout {
                self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            // Stale-lock recovery: fall through and continue checking.
            entry.lock_acquired_at = None;
        }

        if let Some(last_global) = state.last_call_global {
            if now.saturating_duration_since(last_global) < self.config.global_min_interval {
                self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let entry = state.tokens.get_mut(token).expect("entry inserted above");
        if let Some(last) = entry.last_call {
            if now.saturating_duration_since(last) < self.config.per_token_min_interval {
                self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        state.last_call_global = Some(now);
        let entry = state.tokens.get_mut(token).expect("entry inserted above");
        entry.last_call = Some(now);
        entry.lock_acquired_at = Some(now);
        true
    }

    pub fn release(&self, token: &TokenId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.tokens.get_mut(token) {
            entry.lock_acquired_at = None;
        }
    }

    /// Drop bookkeeping for tokens untouched for over an hour.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let horizon = Duration::from_secs(3600);
        state.tokens.retain(|_, entry| {
            entry
                .last_call
                .map(|last| now.saturating_duration_since(last) < horizon)
                .unwrap_or(true)
        });
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }
}
