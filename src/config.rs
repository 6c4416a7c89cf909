//! Configuration for the subscription manager and its components.

use std::num::NonZeroU32;
use std::time::Duration;

/// Fixed market-channel WebSocket endpoint.
pub const MARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Fixed user-channel WebSocket endpoint.
pub const USER_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/user";

/// Configuration for the rate limiter gating outbound connect attempts.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Tokens replenished per `period`.
    pub tokens_per_period: NonZeroU32,
    /// Replenishment period.
    pub period: Duration,
    /// Maximum number of in-flight acquisitions (burst size).
    pub burst: NonZeroU32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_period: NonZeroU32::new(5).expect("5 is nonzero"),
            period: Duration::from_millis(1000),
            burst: NonZeroU32::new(5).expect("5 is nonzero"),
        }
    }
}

/// Top-level configuration for `SubscriptionManager`.
#[derive(Debug, Clone)]
pub struct SubscriptionManagerConfig {
    /// Maximum number of asset ids a single market group may carry.
    pub max_markets_per_ws: usize,
    /// Period of the reconnect/cleanup tick.
    pub reconnect_and_cleanup_interval: Duration,
    /// Rate limiter configuration for outbound connect attempts.
    pub limiter: LimiterConfig,
    /// Market-channel WebSocket URL (overridable for tests).
    pub market_ws_url: String,
    /// User-channel WebSocket URL (overridable for tests).
    pub user_ws_url: String,
    /// Keepalive ping interval lower bound, inclusive.
    pub keepalive_min: Duration,
    /// Keepalive ping interval upper bound, exclusive.
    pub keepalive_max: Duration,
}

impl Default for SubscriptionManagerConfig {
    fn default() -> Self {
        Self {
            max_markets_per_ws: 100,
            reconnect_and_cleanup_interval: Duration::from_millis(10_000),
            limiter: LimiterConfig::default(),
            market_ws_url: MARKET_WS_URL.to_string(),
            user_ws_url: USER_WS_URL.to_string(),
            keepalive_min: Duration::from_millis(15_000),
            keepalive_max: Duration::from_millis(25_000),
        }
    }
}

impl SubscriptionManagerConfig {
    /// Validate that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_markets_per_ws == 0 {
            return Err("max_markets_per_ws must be greater than zero".to_string());
        }
        if self.keepalive_min >= self.keepalive_max {
            return Err("keepalive_min must be strictly less than keepalive_max".to_string());
        }
        Ok(())
    }
}
