//! Monotonic time source and opaque token identifiers.
//!
//! All staleness and backoff math in this crate is done against a monotonic
//! clock (`Instant`), never `SystemTime` — wall-clock jumps must not be able
//! to make a fresh book look stale or a stale lock look fresh.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque token (asset) identifier. Cheap to clone; equality is exact.
///
/// `Display`/`Debug` show only a short prefix — token ids are long opaque
/// strings upstream and full values are never worth putting in a log line.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TokenId(Arc<str>);

impl TokenId {
    pub fn new(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines. Never logs the full id.
    pub fn short(&self) -> &str {
        let n = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..n]
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.short())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}…)", self.short())
    }
}

/// Monotonic millisecond clock, process-epoch relative.
///
/// Using `Instant` directly as a map value is fine within a process, but
/// callers that need an integer millisecond age (e.g. diagnostics payloads)
/// go through here so there is exactly one place that does the conversion.
#[derive(Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    #[inline]
    pub fn elapsed_ms(&self, since: Instant) -> u64 {
        self.now().saturating_duration_since(since).as_millis() as u64
    }

    #[inline]
    pub fn elapsed(&self, since: Instant) -> Duration {
        self.now().saturating_duration_since(since)
    }
}
