//! Environment-driven configuration, read once at startup and immutable
//! thereafter (§6). Follows the donor's `BookStoreConfig::from_env()` /
//! `PaperExecutionConfig::from_env()` pattern: start from documented
//! defaults, override field-by-field from env vars that parse cleanly.

use std::env;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_tokens: usize,
    pub stale_threshold: Duration,
    pub depth_window_cents: Decimal,
}

impl StoreSettings {
    fn from_env() -> Self {
        Self {
            max_tokens: env_parse("STORE_MAX_TOKENS", 2048),
            stale_threshold: env_ms("STORE_STALE_THRESHOLD_MS", 3000),
            depth_window_cents: env_parse("STORE_DEPTH_WINDOW_CENTS", dec!(200)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub stable_connection_duration: Duration,
}

impl PushSettings {
    fn from_env() -> Self {
        Self {
            ws_url: env::var("MARKET_WS_URL")
                .unwrap_or_else(|_| "wss://ws-subscriptions-clob.example.com/ws/market".to_string()),
            ping_interval: env_ms("MARKET_WS_PING_INTERVAL_MS", 5000),
            pong_timeout: env_ms("MARKET_WS_PONG_TIMEOUT_MS", 10_000),
            reconnect_base: env_ms("MARKET_WS_RECONNECT_BASE_MS", 1000),
            reconnect_max: env_ms("MARKET_WS_RECONNECT_MAX_MS", 30_000),
            stable_connection_duration: env_ms("MARKET_WS_STABLE_CONN_MS", 60_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserChannelSettings {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub prune_horizon: Duration,
}

impl UserChannelSettings {
    fn from_env() -> Self {
        Self {
            ws_url: env::var("USER_WS_URL")
                .unwrap_or_else(|_| "wss://ws-subscriptions-clob.example.com/ws/user".to_string()),
            ping_interval: env_ms("USER_WS_PING_INTERVAL_MS", 5000),
            pong_timeout: env_ms("USER_WS_PONG_TIMEOUT_MS", 10_000),
            reconnect_base: env_ms("USER_WS_RECONNECT_BASE_MS", 1000),
            reconnect_max: env_ms("USER_WS_RECONNECT_MAX_MS", 30_000),
            prune_horizon: env_ms("USER_PRUNE_HORIZON_MS", 24 * 3600 * 1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullSettings {
    pub rest_base_url: String,
    pub global_min_interval: Duration,
    pub per_token_min_interval: Duration,
    pub lock_timeout: Duration,
    pub http_timeout: Duration,
}

impl PullSettings {
    fn from_env() -> Self {
        Self {
            rest_base_url: env::var("CLOB_REST_BASE_URL")
                .unwrap_or_else(|_| "https://clob.example.com".to_string()),
            global_min_interval: env_ms("PULL_GLOBAL_MIN_INTERVAL_MS", 50),
            per_token_min_interval: env_ms("PULL_PER_TOKEN_MIN_INTERVAL_MS", 1000),
            lock_timeout: env_ms("PULL_LOCK_TIMEOUT_MS", 5000),
            http_timeout: env_ms("PULL_HTTP_TIMEOUT_MS", 5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
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

impl ExecutionSettings {
    fn from_env() -> Self {
        Self {
            hard_min: env_parse("EXEC_HARD_MIN", dec!(0.01)),
            hard_max: env_parse("EXEC_HARD_MAX", dec!(0.99)),
            strategy_min: env_parse("EXEC_STRATEGY_MIN", dec!(0.10)),
            strategy_max: env_parse("EXEC_STRATEGY_MAX", dec!(0.95)),
            default_tick_size: env_parse("EXEC_DEFAULT_TICK_SIZE", dec!(0.01)),
            slippage_frac: env_parse("EXEC_SLIPPAGE_FRAC", dec!(0.06)),
            max_spread_cents: env_parse("EXEC_MAX_SPREAD_CENTS", dec!(10)),
            buy_cooldown: env_ms("EXEC_BUY_COOLDOWN_MS", 5000),
            fallback_to_resting: env_parse("EXEC_FALLBACK_TO_RESTING", true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalanceSettings {
    pub address: String,
    pub refresh_interval: Duration,
}

impl BalanceSettings {
    fn from_env() -> Self {
        Self {
            address: env::var("OWNER_ADDRESS").unwrap_or_default(),
            refresh_interval: env_ms("BALANCE_REFRESH_INTERVAL_MS", 10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreSettings,
    pub push: PushSettings,
    pub pull: PullSettings,
    pub user_channel: UserChannelSettings,
    pub execution: ExecutionSettings,
    pub balance: BalanceSettings,
}

impl Config {
    /// Read all tunables from the environment once. Unknown/unparsable
    /// values fall back to the documented defaults; nothing here is
    /// re-read after process startup.
    pub fn from_env() -> Self {
        Self {
            store: StoreSettings::from_env(),
            push: PushSettings::from_env(),
            pull: PullSettings::from_env(),
            user_channel: UserChannelSettings::from_env(),
            execution: ExecutionSettings::from_env(),
            balance: BalanceSettings::from_env(),
        }
    }
}
