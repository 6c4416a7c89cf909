//! Market group socket: the per-group connection state machine for the
//! market channel.
//!
//! Split sink/stream, a `tokio::spawn`ed task forwarding decoded events
//! back out over an `mpsc` channel, a *group*-scoped connection whose
//! reconnection is driven externally by the market registry's cleanup
//! tick; nothing is retried by internal counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CoreError, SocketError};
use crate::events::{parse_market_frame, MarketFrameElement, PriceChangeEvent};
use crate::limiter::{schedule, ConnectLimiter};
use crate::metrics;
use crate::orderbook::{OrderBookCache, PriceChangeLevel};
use crate::registry::{GroupId, GroupStatus, MarketRegistry};
use crate::transport::{Transport, TransportConnector, TransportEvent};
use crate::events::MarketHandlers;
use crate::AssetId;

use super::random_keepalive_period;

/// One market group's connection. Holds no socket-owning cycle back to
/// its [`crate::registry::MarketGroup`] record: it only
/// knows its `id` and reaches the group's current asset ids and status
/// through the registry.
pub struct MarketGroupSocket {
    id: GroupId,
    registry: Arc<MarketRegistry>,
    cache: Arc<OrderBookCache>,
    connector: Arc<dyn TransportConnector>,
    limiter: Arc<dyn ConnectLimiter>,
    handlers: Arc<dyn MarketHandlers>,
    ws_url: String,
    keepalive_min: Duration,
    keepalive_max: Duration,
    current: Mutex<Option<Arc<dyn Transport>>>,
}

impl MarketGroupSocket {
    /// Build a socket for `id`. Does not connect; call
    /// [`MarketGroupSocket::connect`] (typically via `tokio::spawn`) to
    /// open it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GroupId,
        registry: Arc<MarketRegistry>,
        cache: Arc<OrderBookCache>,
        connector: Arc<dyn TransportConnector>,
        limiter: Arc<dyn ConnectLimiter>,
        handlers: Arc<dyn MarketHandlers>,
        ws_url: String,
        keepalive_min: Duration,
        keepalive_max: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            registry,
            cache,
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

    /// Close the current transport, if any. Idempotent — a second close
    /// after the transport is already closed is a no-op.
    pub async fn close(&self, code: u16, reason: String) {
        let transport = self.current.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(transport) = transport {
            transport.close(code, reason).await;
        }
    }

    /// Connect this group's socket: if it has no asset ids, mark it
    /// `CLEANUP` and return immediately. Otherwise acquire a limiter
    /// permit, open the transport, and attach handlers.
    pub async fn connect(self: Arc<Self>) {
        let Some(asset_ids) = self.registry.asset_ids_of(self.id) else {
            return;
        };
        if asset_ids.is_empty() {
            self.registry.set_status(self.id, GroupStatus::Cleanup);
            return;
        }

        metrics::inc_connect_attempts("market");

        let connector = self.connector.clone();
        let url = self.ws_url.clone();
        let scheduled = schedule(self.limiter.as_ref(), || async move { connector.connect(&url).await }).await;

        let connect_result = match scheduled {
            Ok(inner) => inner,
            Err(limiter_err) => {
                self.registry.set_status(self.id, GroupStatus::Dead);
                self.handlers.on_error(CoreError::RateLimiter(limiter_err)).await;
                return;
            }
        };

        let (transport, event_rx) = match connect_result {
            Ok(pair) => pair,
            Err(transport_err) => {
                self.registry.set_status(self.id, GroupStatus::Dead);
                self.handlers
                    .on_error(CoreError::Socket(SocketError::ConnectFailed(transport_err)))
                    .await;
                return;
            }
        };

        metrics::inc_connect_success("market");
        self.attach(transport, event_rx).await;
    }

    async fn attach(self: Arc<Self>, transport: Arc<dyn Transport>, event_rx: mpsc::Receiver<TransportEvent>) {
        let epoch = transport.epoch();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(transport.clone());

        let asset_ids = self.registry.asset_ids_of(self.id);
        if asset_ids.as_ref().map_or(true, |ids| ids.is_empty()) {
            self.registry.set_status(self.id, GroupStatus::Cleanup);
            return;
        }

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

        let mut ordered_ids: Vec<AssetId> = asset_ids.unwrap().into_iter().collect();
        ordered_ids.sort();

        let frame = serde_json::json!({
            "assets_ids": ordered_ids,
            "type": "market",
        })
        .to_string();

        if let Err(err) = transport.send_text(frame).await {
            self.registry.set_status(self.id, GroupStatus::Dead);
            self.handlers
                .on_error(CoreError::Socket(SocketError::SendFailed(err.to_string())))
                .await;
            return;
        }

        self.registry.set_status(self.id, GroupStatus::Alive);
        self.handlers.on_ws_open(self.id, ordered_ids).await;

        let keepalive_period = random_keepalive_period(self.keepalive_min, self.keepalive_max);
        let keepalive = tokio::spawn(self.clone().keepalive_loop(transport.clone(), epoch, keepalive_period));
        self.clone().event_loop(event_rx, epoch).await;
        keepalive.abort();
    }

    async fn keepalive_loop(self: Arc<Self>, transport: Arc<dyn Transport>, epoch: u64, period: Duration) {
        loop {
            tokio::time::sleep(period).await;

            if !self.is_current(epoch) {
                return;
            }

            match self.registry.asset_ids_of(self.id) {
                None => return,
                Some(ids) if ids.is_empty() => {
                    self.registry.set_status(self.id, GroupStatus::Cleanup);
                    return;
                }
                Some(_) => {}
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

    async fn event_loop(self: Arc<Self>, mut event_rx: mpsc::Receiver<TransportEvent>, epoch: u64) {
        while let Some(event) = event_rx.recv().await {
            if !self.is_current(epoch) {
                return;
            }

            match event {
                TransportEvent::Text(text) => self.handle_text(&text).await,
                TransportEvent::Pong => {}
                TransportEvent::Closed { code, reason } => {
                    self.registry.set_status(self.id, GroupStatus::Dead);
                    self.handlers.on_ws_close(self.id, code, reason).await;
                    return;
                }
                TransportEvent::Error(message) => {
                    self.registry.set_status(self.id, GroupStatus::Dead);
                    self.handlers
                        .on_error(CoreError::Socket(SocketError::TransportFailed(message)))
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        if text == "PONG" {
            return;
        }

        let _timer = metrics::LatencyTimer::new("market");

        let elements = match parse_market_frame(text) {
            Ok(elements) => elements,
            Err(source) => {
                metrics::inc_parse_errors("market");
                self.handlers
                    .on_error(CoreError::Socket(SocketError::ParseError {
                        raw: text.to_string(),
                        source,
                    }))
                    .await;
                return;
            }
        };

        metrics::inc_messages_processed("market");

        let mut books = Vec::new();
        let mut price_changes: Vec<PriceChangeEvent> = Vec::new();
        let mut tick_changes = Vec::new();
        let mut last_trades = Vec::new();
        let mut touched_assets: Vec<AssetId> = Vec::new();

        let touch = |asset_id: &AssetId, touched: &mut Vec<AssetId>| {
            if !touched.contains(asset_id) {
                touched.push(asset_id.clone());
            }
        };

        for element in elements {
            match element {
                MarketFrameElement::Book(book) => {
                    self.cache.apply_book(&book.asset_id, book.bids.clone(), book.asks.clone());
                    touch(&book.asset_id, &mut touched_assets);
                    books.push(book);
                }
                MarketFrameElement::PriceChange(pc) => {
                    let mut per_asset: HashMap<AssetId, Vec<PriceChangeLevel>> = HashMap::new();
                    for item in &pc.changes {
                        per_asset.entry(item.asset_id.clone()).or_default().push(item.as_level());
                    }
                    for (asset_id, levels) in &per_asset {
                        self.cache.apply_price_change(asset_id, levels);
                        touch(asset_id, &mut touched_assets);
                    }
                    price_changes.push(pc);
                }
                MarketFrameElement::TickSizeChange(change) => {
                    tick_changes.push(change);
                }
                MarketFrameElement::LastTradePrice(ltp) => {
                    self.cache.apply_last_trade_price(&ltp.asset_id, ltp.price);
                    touch(&ltp.asset_id, &mut touched_assets);
                    last_trades.push(ltp);
                }
            }
        }

        if !books.is_empty() {
            self.handlers.on_book(books).await;
        }
        if !price_changes.is_empty() {
            self.handlers.on_price_change(price_changes).await;
        }
        if !tick_changes.is_empty() {
            self.handlers.on_tick_size_change(tick_changes).await;
        }
        if !last_trades.is_empty() {
            self.handlers.on_last_trade_price(last_trades).await;
        }

        if !touched_assets.is_empty() {
            let mut derived = Vec::with_capacity(touched_assets.len());
            for asset_id in &touched_assets {
                if let Some(update) = self.cache.derive_price(asset_id) {
                    derived.push(update);
                }
            }
            if !derived.is_empty() {
                for _ in 0..derived.len() {
                    metrics::inc_price_updates();
                }
                self.handlers.on_polymarket_price_update(derived).await;
            }
        }
    }
}

impl std::fmt::Debug for MarketGroupSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketGroupSocket").field("id", &self.id).finish()
    }
}
