//! The public `SubscriptionManager` surface: composes the rate limiter,
//! order-book cache, both registries, and the two socket state machines,
//! and runs the periodic reconnect/cleanup tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::SubscriptionManagerConfig;
use crate::error::{CoreError, Result};
use crate::events::{
    BookEvent, LastTradePriceEvent, MarketHandlers, PriceChangeEvent, TickSizeChangeEvent, UserHandlers,
};
use crate::limiter::{ConnectLimiter, TokenBucketLimiter};
use crate::metrics;
use crate::orderbook::{OrderBookCache, PriceUpdateEvent};
use crate::registry::{GroupId, MarketRegistry, UserRegistry};
use crate::socket::{MarketGroupSocket, UserGroupSocket};
use crate::transport::{TransportConnector, TungsteniteConnector};
use crate::{AssetId, UserAuth};

/// Wraps the caller's [`MarketHandlers`] to enforce event filtering: a
/// market handler never sees an event for an asset id that isn't currently
/// present in at least one non-CLEANUP group, even if the event already
/// left the socket that produced it.
/// `onWSOpen`/`onWSClose`/`onError` are group-level, not asset-level, and
/// pass straight through.
struct FilteringMarketHandlers {
    inner: Arc<dyn MarketHandlers>,
    registry: Arc<MarketRegistry>,
}

#[async_trait]
impl MarketHandlers for FilteringMarketHandlers {
    async fn on_book(&self, batch: Vec<BookEvent>) {
        let filtered: Vec<BookEvent> = batch
            .into_iter()
            .filter(|event| self.registry.is_subscribed(&event.asset_id))
            .collect();
        if !filtered.is_empty() {
            self.inner.on_book(filtered).await;
        }
    }

    async fn on_price_change(&self, batch: Vec<PriceChangeEvent>) {
        let filtered: Vec<PriceChangeEvent> = batch
            .into_iter()
            .filter_map(|mut event| {
                event.changes.retain(|change| self.registry.is_subscribed(&change.asset_id));
                if event.changes.is_empty() {
                    None
                } else {
                    Some(event)
                }
            })
            .collect();
        if !filtered.is_empty() {
            self.inner.on_price_change(filtered).await;
        }
    }

    async fn on_tick_size_change(&self, batch: Vec<TickSizeChangeEvent>) {
        let filtered: Vec<TickSizeChangeEvent> = batch
            .into_iter()
            .filter(|event| self.registry.is_subscribed(&event.asset_id))
            .collect();
        if !filtered.is_empty() {
            self.inner.on_tick_size_change(filtered).await;
        }
    }

    async fn on_last_trade_price(&self, batch: Vec<LastTradePriceEvent>) {
        let filtered: Vec<LastTradePriceEvent> = batch
            .into_iter()
            .filter(|event| self.registry.is_subscribed(&event.asset_id))
            .collect();
        if !filtered.is_empty() {
            self.inner.on_last_trade_price(filtered).await;
        }
    }

    async fn on_polymarket_price_update(&self, batch: Vec<PriceUpdateEvent>) {
        let filtered: Vec<PriceUpdateEvent> = batch
            .into_iter()
            .filter(|event| self.registry.is_subscribed(&event.asset_id))
            .collect();
        if !filtered.is_empty() {
            self.inner.on_polymarket_price_update(filtered).await;
        }
    }

    async fn on_ws_open(&self, group_id: GroupId, asset_ids: Vec<AssetId>) {
        self.inner.on_ws_open(group_id, asset_ids).await;
    }

    async fn on_ws_close(&self, group_id: GroupId, code: Option<u16>, reason: String) {
        self.inner.on_ws_close(group_id, code, reason).await;
    }

    async fn on_error(&self, err: CoreError) {
        self.inner.on_error(err).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subscription and connection manager: the public surface of this crate.
///
/// One struct owns every collaborator and drives connection lifecycle for
/// a dynamic set of market and user groups, each with its own socket task.
pub struct SubscriptionManager {
    config: SubscriptionManagerConfig,
    market_registry: Arc<MarketRegistry>,
    user_registry: Arc<UserRegistry>,
    cache: Arc<OrderBookCache>,
    connector: Arc<dyn TransportConnector>,
    limiter: Arc<dyn ConnectLimiter>,
    market_handlers: Arc<dyn MarketHandlers>,
    user_handlers: Mutex<Option<Arc<dyn UserHandlers>>>,
    market_sockets: Mutex<HashMap<GroupId, Arc<MarketGroupSocket>>>,
    user_sockets: Mutex<HashMap<GroupId, Arc<UserGroupSocket>>>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    /// Build a manager backed by the real `tokio-tungstenite` transport
    /// and the default token-bucket limiter, and start its reconnect/
    /// cleanup tick.
    pub fn new(market_handlers: Arc<dyn MarketHandlers>, config: SubscriptionManagerConfig) -> Result<Arc<Self>> {
        config.validate().map_err(CoreError::Misuse)?;
        let connector = Arc::new(TungsteniteConnector) as Arc<dyn TransportConnector>;
        let limiter = TokenBucketLimiter::shared(&config.limiter);
        Ok(Self::with_collaborators(market_handlers, config, connector, limiter))
    }

    /// Build a manager with injected transport and limiter collaborators,
    /// for tests (and for callers who want to override either one).
    pub fn with_collaborators(
        market_handlers: Arc<dyn MarketHandlers>,
        config: SubscriptionManagerConfig,
        connector: Arc<dyn TransportConnector>,
        limiter: Arc<dyn ConnectLimiter>,
    ) -> Arc<Self> {
        metrics::init_metrics();

        let market_registry = Arc::new(MarketRegistry::new());
        let filtering_handlers = Arc::new(FilteringMarketHandlers {
            inner: market_handlers,
            registry: market_registry.clone(),
        });

        let manager = Arc::new(Self {
            config,
            market_registry,
            user_registry: Arc::new(UserRegistry::new()),
            cache: Arc::new(OrderBookCache::new()),
            connector,
            limiter,
            market_handlers: filtering_handlers,
            user_handlers: Mutex::new(None),
            market_sockets: Mutex::new(HashMap::new()),
            user_sockets: Mutex::new(HashMap::new()),
            tick_handle: Mutex::new(None),
        });

        manager.spawn_tick();
        manager
    }

    fn spawn_tick(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.config.reconnect_and_cleanup_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.run_tick().await;
            }
        });
        *lock(&self.tick_handle) = Some(handle);
    }

    async fn run_tick(&self) {
        let (market_reconnect, market_removed) = self.market_registry.get_groups_to_reconnect_and_cleanup();

        let removed: Vec<Arc<MarketGroupSocket>> = {
            let mut sockets = lock(&self.market_sockets);
            market_removed.iter().filter_map(|group| sockets.remove(&group.id)).collect()
        };
        for socket in removed {
            socket.close(1000, "group removed by cleanup tick".to_string()).await;
        }

        // A DEAD group being reconnected still has its old (now-broken)
        // socket sitting in the map; close it before `spawn_market_socket`
        // overwrites the entry, or its transport leaks with a live sink.
        let superseded: Vec<Arc<MarketGroupSocket>> = {
            let mut sockets = lock(&self.market_sockets);
            market_reconnect.iter().filter_map(|id| sockets.remove(id)).collect()
        };
        for socket in superseded {
            socket.close(1000, "superseded by reconnect".to_string()).await;
        }
        for group_id in market_reconnect {
            metrics::inc_reconnects("market");
            self.spawn_market_socket(group_id);
        }

        let user_reconnect = self.user_registry.get_groups_to_reconnect();
        let superseded_user: Vec<Arc<UserGroupSocket>> = {
            let mut sockets = lock(&self.user_sockets);
            user_reconnect.iter().filter_map(|id| sockets.remove(id)).collect()
        };
        for socket in superseded_user {
            socket.close(1000, "superseded by reconnect".to_string()).await;
        }
        for group_id in user_reconnect {
            metrics::inc_reconnects("user");
            self.spawn_user_socket(group_id);
        }
    }

    fn spawn_market_socket(&self, group_id: GroupId) {
        let socket = MarketGroupSocket::new(
            group_id,
            self.market_registry.clone(),
            self.cache.clone(),
            self.connector.clone(),
            self.limiter.clone(),
            self.market_handlers.clone(),
            self.config.market_ws_url.clone(),
            self.config.keepalive_min,
            self.config.keepalive_max,
        );
        lock(&self.market_sockets).insert(group_id, socket.clone());
        tokio::spawn(socket.connect());
    }

    fn spawn_user_socket(&self, group_id: GroupId) {
        let Some(user_handlers) = lock(&self.user_handlers).clone() else {
            return;
        };
        let socket = UserGroupSocket::new(
            group_id,
            self.user_registry.clone(),
            self.connector.clone(),
            self.limiter.clone(),
            user_handlers,
            self.config.user_ws_url.clone(),
            self.config.keepalive_min,
            self.config.keepalive_max,
        );
        lock(&self.user_sockets).insert(group_id, socket.clone());
        tokio::spawn(socket.connect());
    }

    /// Add asset ids to the market subscription set, connecting any new
    /// or regrouped market group it creates.
    pub async fn add_subscriptions(&self, asset_ids: &[AssetId]) {
        let to_connect = self.market_registry.add_assets(asset_ids, self.config.max_markets_per_ws);
        for group_id in to_connect {
            self.spawn_market_socket(group_id);
        }
    }

    /// Remove asset ids from the market subscription set. Groups that
    /// become empty are garbage-collected on the next cleanup tick, not
    /// immediately — their sockets may still be mid-flight on other
    /// asset ids.
    pub async fn remove_subscriptions(&self, asset_ids: &[AssetId]) {
        self.market_registry.remove_assets(asset_ids, &self.cache);
    }

    /// Register the user-channel handler set. Must be called before
    /// [`SubscriptionManager::connect_user_socket`]; calling
    /// `connect_user_socket` first is reported through the market
    /// `onError` handler (there is no user handler yet to deliver to).
    pub fn set_user_handlers(&self, handlers: Arc<dyn UserHandlers>) {
        *lock(&self.user_handlers) = Some(handlers);
    }

    /// Subscribe a user's trade/order channel. A no-op if `auth.key` is
    /// already subscribed.
    pub async fn connect_user_socket(&self, auth: UserAuth) {
        if lock(&self.user_handlers).is_none() {
            self.market_handlers
                .on_error(CoreError::Misuse(
                    "connect_user_socket called before set_user_handlers".to_string(),
                ))
                .await;
            return;
        }

        if let Some(group_id) = self.user_registry.add_user_subscription(auth) {
            self.spawn_user_socket(group_id);
        }
    }

    /// Disconnect and remove a user's subscription. Closes only that
    /// user's socket; other users are unaffected.
    pub async fn disconnect_user_socket(&self, api_key: &str) {
        let Some(group_id) = self.user_registry.remove_user_subscription(api_key) else {
            return;
        };
        let socket = lock(&self.user_sockets).remove(&group_id);
        if let Some(socket) = socket {
            socket.close(1000, "disconnect requested".to_string()).await;
        }
    }

    /// Tear down every group and socket and clear the order-book cache.
    /// The only external cancellation lever.
    pub async fn clear_state(&self) {
        let market_ids = self.market_registry.clear();
        let user_ids = self.user_registry.clear();

        let market_closed: Vec<Arc<MarketGroupSocket>> = {
            let mut sockets = lock(&self.market_sockets);
            market_ids.iter().filter_map(|id| sockets.remove(id)).collect()
        };
        let user_closed: Vec<Arc<UserGroupSocket>> = {
            let mut sockets = lock(&self.user_sockets);
            user_ids.iter().filter_map(|id| sockets.remove(id)).collect()
        };

        for socket in market_closed {
            socket.close(1000, "clear_state".to_string()).await;
        }
        for socket in user_closed {
            socket.close(1000, "clear_state".to_string()).await;
        }

        self.cache.clear();
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.tick_handle).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OrderEvent, TradeEvent};
    use crate::transport::MockConnector;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingMarketHandlers {
        books: AsyncMutex<Vec<Vec<BookEvent>>>,
        price_updates: AsyncMutex<Vec<Vec<PriceUpdateEvent>>>,
        errors: AsyncMutex<Vec<String>>,
        opens: AsyncMutex<Vec<(GroupId, Vec<AssetId>)>>,
    }

    #[async_trait::async_trait]
    impl MarketHandlers for RecordingMarketHandlers {
        async fn on_book(&self, batch: Vec<BookEvent>) {
            self.books.lock().await.push(batch);
        }
        async fn on_polymarket_price_update(&self, batch: Vec<PriceUpdateEvent>) {
            self.price_updates.lock().await.push(batch);
        }
        async fn on_ws_open(&self, group_id: GroupId, asset_ids: Vec<AssetId>) {
            self.opens.lock().await.push((group_id, asset_ids));
        }
        async fn on_error(&self, err: CoreError) {
            self.errors.lock().await.push(err.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingUserHandlers {
        trades: AsyncMutex<Vec<(String, Vec<TradeEvent>)>>,
        #[allow(dead_code)]
        orders: AsyncMutex<Vec<(String, Vec<OrderEvent>)>>,
    }

    #[async_trait::async_trait]
    impl UserHandlers for RecordingUserHandlers {
        async fn on_trade(&self, api_key: &str, batch: Vec<TradeEvent>) {
            self.trades.lock().await.push((api_key.to_string(), batch));
        }
    }

    fn test_config() -> SubscriptionManagerConfig {
        let mut config = SubscriptionManagerConfig::default();
        config.reconnect_and_cleanup_interval = Duration::from_millis(30);
        config
    }

    #[tokio::test]
    async fn reconnect_tick_closes_the_superseded_dead_socket_before_replacing_it() {
        let (connector, mut connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers,
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.add_subscriptions(&["a".to_string()]).await;
        let mut first = connections.recv().await.unwrap();
        let _ = first.sent_rx.recv().await;

        // Simulate a remote-initiated close the socket never called
        // `.close()` for itself: the group flips to DEAD but the old
        // transport's `is_open()` stays true until something closes it.
        first
            .event_tx
            .send(crate::transport::TransportEvent::Closed { code: Some(1006), reason: "dropped".to_string() })
            .await
            .unwrap();

        // give the event loop a moment to mark the group DEAD
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(first.transport.is_open(), "transport is not yet told to close");

        // the next reconnect/cleanup tick must close the superseded
        // transport before handing the group a brand-new socket.
        let mut second = connections.recv().await.expect("DEAD group is reconnected by the tick");
        let _ = second.sent_rx.recv().await;

        assert!(!first.transport.is_open(), "superseded DEAD socket must be closed, not leaked");
        assert!(second.transport.is_open());
    }

    #[tokio::test]
    async fn e1_add_subscriptions_creates_one_group_and_connects_once() {
        let (connector, mut connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers,
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.add_subscriptions(&["a".to_string(), "b".to_string()]).await;

        let mut conn = connections.recv().await.expect("exactly one connect attempt");
        let _ = conn.sent_rx.recv().await;
        assert!(connections.try_recv().is_err(), "no second connect attempt for a single group");
    }

    #[tokio::test]
    async fn e4_filtered_book_and_derived_price_reach_the_caller() {
        let (connector, mut connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers.clone(),
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.add_subscriptions(&["a".to_string(), "b".to_string()]).await;
        let mut conn = connections.recv().await.unwrap();
        let _ = conn.sent_rx.recv().await;

        conn.event_tx
            .send(crate::transport::TransportEvent::Text(
                r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]}"#
                    .to_string(),
            ))
            .await
            .unwrap();

        for _ in 0..40 {
            if !market_handlers.books.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let books = market_handlers.books.lock().await;
        assert_eq!(books.len(), 1);
        assert_eq!(books[0][0].asset_id, "a");

        let updates = market_handlers.price_updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0][0].price, dec!(0.525));
    }

    #[tokio::test]
    async fn filter_drops_events_for_unsubscribed_assets() {
        let (connector, mut connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers.clone(),
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.add_subscriptions(&["a".to_string()]).await;
        let mut conn = connections.recv().await.unwrap();
        let _ = conn.sent_rx.recv().await;

        manager.remove_subscriptions(&["a".to_string()]).await;

        conn.event_tx
            .send(crate::transport::TransportEvent::Text(
                r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]}"#
                    .to_string(),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(market_handlers.books.lock().await.is_empty(), "unsubscribed asset must be filtered out");
    }

    #[tokio::test]
    async fn e5_connect_user_socket_before_handlers_reports_via_market_error() {
        let (connector, _connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers.clone(),
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.connect_user_socket(UserAuth::new("alice", "s", "p")).await;

        let errors = market_handlers.errors.lock().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("misuse"));
    }

    #[tokio::test]
    async fn e6_disconnect_user_socket_closes_only_that_user() {
        let (connector, mut connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers,
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.set_user_handlers(Arc::new(RecordingUserHandlers::default()));
        manager.connect_user_socket(UserAuth::new("alice", "s", "p")).await;
        manager.connect_user_socket(UserAuth::new("bob", "s", "p")).await;

        let conn_a = connections.recv().await.unwrap();
        let conn_b = connections.recv().await.unwrap();

        manager.disconnect_user_socket("alice").await;
        assert!(!conn_a.transport.is_open());
        assert!(conn_b.transport.is_open());
    }

    #[tokio::test]
    async fn clear_state_empties_both_registries_and_closes_all_sockets() {
        let (connector, mut connections) = MockConnector::new();
        let market_handlers = Arc::new(RecordingMarketHandlers::default());
        let manager = SubscriptionManager::with_collaborators(
            market_handlers,
            test_config(),
            connector,
            Arc::new(crate::limiter::NoopLimiter) as Arc<dyn ConnectLimiter>,
        );

        manager.set_user_handlers(Arc::new(RecordingUserHandlers::default()));
        manager.add_subscriptions(&["a".to_string()]).await;
        manager.connect_user_socket(UserAuth::new("alice", "s", "p")).await;

        let market_conn = connections.recv().await.unwrap();
        let user_conn = connections.recv().await.unwrap();

        manager.clear_state().await;

        assert!(!market_conn.transport.is_open());
        assert!(!user_conn.transport.is_open());
    }
}
