//! The raw WebSocket transport seam.
//!
//! The raw connect / send-text / send-ping / receive-text / receive-pong /
//! close operations are treated as an external collaborator. This module
//! defines that collaborator as a trait so the socket state machines in
//! [`crate::socket`] can be driven by a real connection
//! ([`tungstenite::TungsteniteConnector`]) in production or an in-memory
//! double ([`mock::MockConnector`]) in tests, without either caring which.

pub mod mock;
pub mod tungstenite;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use mock::{MockConnection, MockConnector, MockTransport, SentFrame};
pub use tungstenite::TungsteniteConnector;

/// An event delivered from an open transport to its owning socket.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A text frame was received.
    Text(String),
    /// A pong frame was received (protocol-level keepalive response).
    Pong,
    /// The transport closed, with an optional close code and reason.
    Closed {
        /// Close code, if supplied.
        code: Option<u16>,
        /// Close reason text.
        reason: String,
    },
    /// The transport errored.
    Error(String),
}

/// Errors a transport or connector can report.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The connect attempt itself failed (DNS, TCP, TLS, handshake, ...).
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// A send (text or ping) failed on an already-open transport.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// A single open WebSocket connection.
///
/// Every method call is cheap to issue against a transport that has
/// already closed: `send_text`/`send_ping` return `Err`, `close` is a
/// no-op. A group's socket is closed exactly once; subsequent closes
/// are no-ops.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text frame.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    /// Send a protocol-level ping frame.
    async fn send_ping(&self) -> Result<(), TransportError>;
    /// Close the connection with the given code and reason. Idempotent.
    async fn close(&self, code: u16, reason: String);
    /// Whether the transport is currently open.
    fn is_open(&self) -> bool;
    /// Opaque, monotonically increasing identity assigned at connect time.
    ///
    /// Handlers capture this value when they attach and compare it against
    /// the group's *current* transport's epoch before acting — the core
    /// race protection against stale callbacks delivered after a
    /// reconnect.
    fn epoch(&self) -> u64;
}

/// Opens new [`Transport`]s against a URL.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a connection, returning the transport handle and a channel of
    /// inbound events.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError>;
}

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Allocate the next globally unique transport epoch.
pub fn next_transport_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}
