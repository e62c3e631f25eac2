//! Construction-site binary: wires the market-data plane and execution
//! engine together once at startup, per §9's singleton guidance, and logs
//! readiness. Carries no strategy logic — CLI/process bootstrap is out of
//! scope; this exists only so the library's pieces have somewhere to be
//! instantiated together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clob_trading_core::balance::{BalanceCache, BalanceReader};
use clob_trading_core::clock::TokenId;
use clob_trading_core::config::Config;
use clob_trading_core::execution::{ExecutionConfig, ExecutionEngine, SubmitOutcome, SubmitPort, TickSizePort};
use clob_trading_core::facade::MarketDataFacade;
use clob_trading_core::pull::{PullClient, PullClientConfig};
use clob_trading_core::push::{PushClient, PushClientConfig};
use clob_trading_core::ratelimit::{RateLimiter, RateLimiterConfig};
use clob_trading_core::store::{MarketDataStore, StoreConfig};
use clob_trading_core::user_channel::{Credentials, UserChannelClient, UserChannelConfig};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Placeholder on-chain reads. A real deployment wires this to the
/// collateral/gas RPC adapters, which are out of core scope (§6).
struct NullBalanceReader;

#[async_trait]
impl BalanceReader for NullBalanceReader {
    async fn read_collateral(&self, _address: &str) -> Option<Decimal> {
        None
    }
    async fn read_native_gas(&self, _address: &str) -> Option<Decimal> {
        None
    }
}

/// Placeholder submit port. The wire format of order submission is left to
/// the adapter by design (§6); this stub always reports failure so the
/// engine's IOC→resting fallback is visibly exercised without a live CLOB.
struct UnwiredSubmitter;

#[async_trait]
impl SubmitPort for UnwiredSubmitter {
    async fn submit_ioc(&self, _token: &TokenId, _side: clob_trading_core::user_channel::OrderSide, _shares: Decimal, _price: Decimal) -> SubmitOutcome {
        SubmitOutcome { success: false, order_id: None, error_message: Some("no submit adapter configured".to_string()) }
    }
    async fn submit_resting(&self, _token: &TokenId, _side: clob_trading_core::user_channel::OrderSide, _shares: Decimal, _price: Decimal) -> SubmitOutcome {
        SubmitOutcome { success: false, order_id: None, error_message: Some("no submit adapter configured".to_string()) }
    }
}

struct DefaultTickSize(Decimal);

impl TickSizePort for DefaultTickSize {
    fn tick_size(&self, _token: &TokenId) -> Option<Decimal> {
        Some(self.0)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::from_env();

    let store = MarketDataStore::new(StoreConfig {
        max_tokens: config.store.max_tokens,
        stale_threshold: config.store.stale_threshold,
        depth_window_cents: config.store.depth_window_cents,
    });

    let push = PushClient::new(
        PushClientConfig {
            ws_url: config.push.ws_url.clone(),
            ping_interval: config.push.ping_interval,
            pong_timeout: config.push.pong_timeout,
            reconnect_base: config.push.reconnect_base,
            reconnect_max: config.push.reconnect_max,
            stable_connection_duration: config.push.stable_connection_duration,
        },
        store.clone(),
    );
    push.connect();

    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        global_min_interval: config.pull.global_min_interval,
        per_token_min_interval: config.pull.per_token_min_interval,
        lock_timeout: config.pull.lock_timeout,
    }));
    let pull = Arc::new(PullClient::new(
        PullClientConfig { rest_base_url: config.pull.rest_base_url.clone(), http_timeout: config.pull.http_timeout },
        limiter.clone(),
        store.clone(),
    )?);

    let facade = MarketDataFacade::new(store.clone(), pull);

    let user_channel = UserChannelClient::new(
        UserChannelConfig {
            ws_url: config.user_channel.ws_url.clone(),
            ping_interval: config.user_channel.ping_interval,
            pong_timeout: config.user_channel.pong_timeout,
            reconnect_base: config.user_channel.reconnect_base,
            reconnect_max: config.user_channel.reconnect_max,
            prune_horizon: config.user_channel.prune_horizon,
        },
        Credentials::from_env(),
    );

    let balance = Arc::new(BalanceCache::new(
        Arc::new(NullBalanceReader),
        config.balance.address.clone(),
        config.balance.refresh_interval,
    ));

    let execution = Arc::new(ExecutionEngine::new(
        ExecutionConfig {
            hard_min: config.execution.hard_min,
            hard_max: config.execution.hard_max,
            strategy_min: config.execution.strategy_min,
            strategy_max: config.execution.strategy_max,
            default_tick_size: config.execution.default_tick_size,
            slippage_frac: config.execution.slippage_frac,
            max_spread_cents: config.execution.max_spread_cents,
            buy_cooldown: config.execution.buy_cooldown,
            fallback_to_resting: config.execution.fallback_to_resting,
        },
        facade.clone(),
        Arc::new(UnwiredSubmitter),
        Arc::new(DefaultTickSize(config.execution.default_tick_size)),
    ));

    let _ = balance.last();
    let _ = execution;
    let _ = user_channel.state();

    // Periodic maintenance (§4.3, §4.5): evict rate-limiter entries that
    // have gone quiet and prune terminal order/trade history beyond the
    // configured horizon. Neither is load-bearing for correctness on any
    // single call; both bound unbounded memory growth over a long run.
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }
    {
        let user_channel = user_channel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                user_channel.prune(Utc::now());
            }
        });
    }

    info!(
        push_connected = push.is_connected(),
        facade_mode = ?facade.metrics().mode,
        "clob-core-demo: components wired and ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    push.disconnect();
    user_channel.disconnect();
    Ok(())
}
