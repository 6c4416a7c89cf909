//! User group socket: the per-user connection state machine described in
//! the user channel's connection.
//!
//! Mirrors [`super::market::MarketGroupSocket`]'s structure (same
//! connect/attach/keepalive/event-loop shape, same stale-transport-epoch
//! guard) but strips out everything that depended on a group multiplexing
//! several asset ids: there is no capacity check, no regrouping, and the
//! subscription frame carries one user's credentials instead of a set of
//! asset ids.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CoreError, SocketError};
use crate::events::{parse_user_frame, UserFrameElement, UserHandlers};
use crate::limiter::{schedule, ConnectLimiter};
use crate::metrics;
use crate::registry::{GroupId, GroupStatus, UserRegistry};
use crate::transport::{Transport, TransportConnector, TransportEvent};

use super::random_keepalive_period;

/// One authenticated user's connection.
pub struct UserGroupSocket {
    id: GroupId,
    registry: Arc<UserRegistry>,
    connector: Arc<dyn TransportConnector>,
    limiter: Arc<dyn ConnectLimiter>,
    handlers: Arc<dyn UserHandlers>,
    ws_url: String,
    keepalive_min: Duration,
    keepalive_max: Duration,
    current: Mutex<Option<Arc<dyn Transport>>>,
}

impl UserGroupSocket {
    /// Build a socket for `id`. Does not connect.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GroupId,
        registry: Arc<UserRegistry>,
        connector: Arc<dyn TransportConnector>,
        limiter: Arc<dyn ConnectLimiter>,
        handlers: Arc<dyn UserHandlers>,
        ws_url: String,
        keepalive_min: Duration,
        keepalive_max: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            registry,
            connector,
            limiter,
            handlers,
            ws_url,
            keepalive_min,
            keepalive_max,
            current: Mutex::new(None),
        })
    }

    fn current_epoch(&self) -> Option<u64> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|t| t.epoch())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == Some(epoch)
    }

    /// Close the current transport, if any. Idempotent.
    pub async fn close(&self, code: u16, reason: String) {
        let transport = self.current.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(transport) = transport {
            transport.close(code, reason).await;
        }
    }

    /// Connect this user's socket. A no-op if the group has already been
    /// removed (race with `disconnect_user_socket`/`clear_state`).
    pub async fn connect(self: Arc<Self>) {
        let Some(group) = self.registry.group_of(self.id) else {
            return;
        };

        metrics::inc_connect_attempts("user");

        let connector = self.connector.clone();
        let url = self.ws_url.clone();
        let scheduled = schedule(self.limiter.as_ref(), || async move { connector.connect(&url).await }).await;

        let connect_result = match scheduled {
            Ok(inner) => inner,
            Err(limiter_err) => {
                self.registry.set_status(self.id, GroupStatus::Dead);
                self.handlers
                    .on_error(&group.api_key, CoreError::RateLimiter(limiter_err))
                    .await;
                return;
            }
        };

        let (transport, event_rx) = match connect_result {
            Ok(pair) => pair,
            Err(transport_err) => {
                self.registry.set_status(self.id, GroupStatus::Dead);
                self.handlers
                    .on_error(&group.api_key, CoreError::Socket(SocketError::ConnectFailed(transport_err)))
                    .await;
                return;
            }
        };

        metrics::inc_connect_success("user");
        self.attach(group.api_key, transport, event_rx).await;
    }

    async fn attach(
        self: Arc<Self>,
        api_key: String,
        transport: Arc<dyn Transport>,
        event_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let epoch = transport.epoch();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(transport.clone());

        let group = match self.registry.group_of(self.id) {
            Some(group) => group,
            None => {
                self.registry.set_status(self.id, GroupStatus::Cleanup);
                return;
            }
        };

        if !self.is_current(epoch) {
            // Lost the attach race to a newer connect() that already
            // overwrote `self.current`; that attach owns this group's
            // status now, so exit silently without touching it.
            return;
        }

        if !transport.is_open() {
            self.registry.set_status(self.id, GroupStatus::Dead);
            return;
        }

        let frame = serde_json::json!({
            "markets": [],
            "type": "user",
            "auth": {
                "apiKey": group.auth.key,
                "secret": group.auth.secret,
                "passphrase": group.auth.passphrase,
            },
        })
        .to_string();

        if let Err(err) = transport.send_text(frame).await {
            self.registry.set_status(self.id, GroupStatus::Dead);
            self.handlers
                .on_error(&api_key, CoreError::Socket(SocketError::SendFailed(err.to_string())))
                .await;
            return;
        }

        self.registry.set_status(self.id, GroupStatus::Alive);
        self.handlers.on_ws_open(&api_key).await;

        let keepalive_period = random_keepalive_period(self.keepalive_min, self.keepalive_max);
        let keepalive = tokio::spawn(self.clone().keepalive_loop(transport.clone(), epoch, keepalive_period));
        self.clone().event_loop(event_rx, epoch, api_key).await;
        keepalive.abort();
    }

    async fn keepalive_loop(self: Arc<Self>, transport: Arc<dyn Transport>, epoch: u64, period: Duration) {
        loop {
            tokio::time::sleep(period).await;

            if !self.is_current(epoch) {
                return;
            }

            if self.registry.group_of(self.id).is_none() {
                return;
            }

            if !transport.is_open() {
                self.registry.set_status(self.id, GroupStatus::Dead);
                return;
            }

            if let Err(err) = transport.send_ping().await {
                debug!(group_id = self.id, error = %err, "keepalive ping failed");
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut event_rx: mpsc::Receiver<TransportEvent>, epoch: u64, api_key: String) {
        while let Some(event) = event_rx.recv().await {
            if !self.is_current(epoch) {
                return;
            }

            match event {
                TransportEvent::Text(text) => self.handle_text(&text, &api_key).await,
                TransportEvent::Pong => {}
                TransportEvent::Closed { code, reason } => {
                    self.registry.set_status(self.id, GroupStatus::Dead);
                    self.handlers.on_ws_close(&api_key, code, reason).await;
                    return;
                }
                TransportEvent::Error(message) => {
                    self.registry.set_status(self.id, GroupStatus::Dead);
                    self.handlers
                        .on_error(&api_key, CoreError::Socket(SocketError::TransportFailed(message)))
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, api_key: &str) {
        if text == "PONG" {
            return;
        }

        let _timer = metrics::LatencyTimer::new("user");

        let elements = match parse_user_frame(text) {
            Ok(elements) => elements,
            Err(source) => {
                metrics::inc_parse_errors("user");
                self.handlers
                    .on_error(
                        api_key,
                        CoreError::Socket(SocketError::ParseError { raw: text.to_string(), source }),
                    )
                    .await;
                return;
            }
        };

        metrics::inc_messages_processed("user");

        let mut trades = Vec::new();
        let mut orders = Vec::new();

        for element in elements {
            match element {
                UserFrameElement::Trade(trade) => trades.push(trade),
                UserFrameElement::Order(order) => orders.push(order),
            }
        }

        if !trades.is_empty() {
            self.handlers.on_trade(api_key, trades).await;
        }
        if !orders.is_empty() {
            self.handlers.on_order(api_key, orders).await;
        }
    }
}

impl std::fmt::Debug for UserGroupSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserGroupSocket").field("id", &self.id).finish()
    }
}
