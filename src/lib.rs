//! Subscription and connection manager for Polymarket's CLOB WebSocket
//! channels.
//!
//! This crate is the CORE of a client library that maintains many
//! long-lived WebSocket subscriptions on behalf of a user program: a
//! **market channel** streaming order-book snapshots, incremental price
//! changes, tick-size changes, and last-trade-price ticks keyed by asset
//! id, and a **user channel** streaming one authenticated user's trade and
//! order events.
//!
//! The crate allocates a dynamic set of asset ids (and a dynamic set of
//! authenticated users) onto WebSocket connections under a per-connection
//! capacity limit, keeps those connections healthy with automatic
//! reconnection and cleanup, decodes the raw message stream into typed
//! events, and derives a synthetic "displayed price" event per asset by
//! fusing order-book and last-trade state.
//!
//! # Modules
//!
//! - [`config`]: manager and rate-limiter configuration
//! - [`error`]: unified error types
//! - [`limiter`]: token-bucket pacing of outbound connect attempts
//! - [`orderbook`]: per-asset book cache and the derived-price rule
//! - [`registry`]: the market and user group registries
//! - [`transport`]: the raw WebSocket seam (production + mock)
//! - [`socket`]: per-group connection state machines
//! - [`events`]: typed market/user events and handler traits
//! - [`manager`]: the public `SubscriptionManager` surface
//! - [`metrics`]: connection health and throughput metrics

pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod orderbook;
pub mod registry;
pub mod socket;
pub mod transport;

pub use config::SubscriptionManagerConfig;
pub use error::{CoreError, Result};
pub use manager::SubscriptionManager;

/// Opaque per-outcome asset identifier (a.k.a. clob-token id).
pub type AssetId = String;

/// Opaque identifier for a whole market (multiple outcomes).
pub type MarketId = String;

/// Credentials for a single authenticated user of the user channel.
///
/// `key` doubles as the user's identity across both registries and the
/// user-channel handler surface.
#[derive(Clone, PartialEq, Eq)]
pub struct UserAuth {
    /// API key; also the user's identity.
    pub key: String,
    /// API secret.
    pub secret: String,
    /// API passphrase.
    pub passphrase: String,
}

impl UserAuth {
    /// Build a credential triple.
    pub fn new(key: impl Into<String>, secret: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
        }
    }
}

// Secrets must never land in a log line: redact everything but the key.
impl std::fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAuth")
            .field("key", &self.key)
            .field("secret", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}
