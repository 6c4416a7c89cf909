//! End-to-end tests driving `SubscriptionManager` through the mock
//! transport, covering the regrouping and capacity scenarios and the
//! no-loss-during-regroup guarantee that unit tests at the registry/socket
//! level can't exercise on their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex as AsyncMutex;

use polymarket_ws_core::events::{BookEvent, MarketHandlers};
use polymarket_ws_core::limiter::{ConnectLimiter, NoopLimiter};
use polymarket_ws_core::registry::GroupId;
use polymarket_ws_core::transport::{MockConnector, TransportEvent};
use polymarket_ws_core::{AssetId, CoreError, SubscriptionManager, SubscriptionManagerConfig};

#[derive(Default)]
struct RecordingHandlers {
    books: AsyncMutex<Vec<BookEvent>>,
    opens: AsyncMutex<Vec<(GroupId, Vec<AssetId>)>>,
    errors: AsyncMutex<Vec<String>>,
}

#[async_trait]
impl MarketHandlers for RecordingHandlers {
    async fn on_book(&self, batch: Vec<BookEvent>) {
        self.books.lock().await.extend(batch);
    }
    async fn on_ws_open(&self, group_id: GroupId, asset_ids: Vec<AssetId>) {
        self.opens.lock().await.push((group_id, asset_ids));
    }
    async fn on_error(&self, err: CoreError) {
        self.errors.lock().await.push(err.to_string());
    }
}

fn config(max_markets_per_ws: usize, tick_ms: u64) -> SubscriptionManagerConfig {
    let mut cfg = SubscriptionManagerConfig::default();
    cfg.max_markets_per_ws = max_markets_per_ws;
    cfg.reconnect_and_cleanup_interval = Duration::from_millis(tick_ms);
    cfg
}

fn noop_limiter() -> Arc<dyn ConnectLimiter> {
    Arc::new(NoopLimiter) as Arc<dyn ConnectLimiter>
}

/// E2: a full group is left alone and a second group is opened for the
/// overflow, with no regrouping of the first.
#[tokio::test]
async fn e2_capacity_exhausted_opens_a_second_socket_without_touching_the_first() {
    let (connector, mut connections) = MockConnector::new();
    let handlers = Arc::new(RecordingHandlers::default());
    let manager = SubscriptionManager::with_collaborators(handlers, config(2, 5_000), connector, noop_limiter());

    manager.add_subscriptions(&["a".to_string(), "b".to_string()]).await;
    let mut first = connections.recv().await.expect("first group connects");
    let _ = first.sent_rx.recv().await;

    manager.add_subscriptions(&["c".to_string()]).await;
    let mut second = connections.recv().await.expect("overflow group connects");
    let _ = second.sent_rx.recv().await;

    assert!(connections.try_recv().is_err(), "no third connect attempt");
    assert!(first.transport.is_open(), "the first group's socket is untouched by the overflow");
}

/// E3 + property 3: a regroup replaces the old socket with a new one
/// carrying the union, but the old socket is left open across the window
/// so events already in flight on it are not lost; only the next tick
/// retires it.
#[tokio::test]
async fn e3_regroup_keeps_old_socket_open_until_the_next_tick_and_loses_no_events() {
    let (connector, mut connections) = MockConnector::new();
    let handlers = Arc::new(RecordingHandlers::default());
    let manager = SubscriptionManager::with_collaborators(handlers.clone(), config(3, 40), connector, noop_limiter());

    manager.add_subscriptions(&["a".to_string(), "b".to_string()]).await;
    let mut old = connections.recv().await.expect("initial group connects");
    let _ = old.sent_rx.recv().await;

    for _ in 0..40 {
        if handlers.opens.lock().await.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.add_subscriptions(&["c".to_string()]).await;
    let mut new = connections.recv().await.expect("regrouped socket connects");
    let _ = new.sent_rx.recv().await;

    // the old transport is still open and still serving "a" — a message
    // racing the regroup must still reach the caller.
    assert!(old.transport.is_open(), "old socket must stay open across the regrouping window");
    old.event_tx
        .send(TransportEvent::Text(
            r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]}"#
                .to_string(),
        ))
        .await
        .unwrap();

    for _ in 0..40 {
        if !handlers.books.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(handlers.books.lock().await.len(), 1, "in-flight event on the old socket must not be dropped");

    // after a cleanup tick the old (CLEANUP) socket is torn down and the
    // new group is the only one carrying {a,b,c}.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!old.transport.is_open(), "cleanup tick retires the superseded socket");
    assert!(new.transport.is_open());
}

/// Property 4 end-to-end: once an asset is removed, an event for it
/// arriving before the socket is torn down is filtered out, never
/// reaching the caller.
#[tokio::test]
async fn unsubscribed_asset_event_is_filtered_even_while_its_socket_is_still_open() {
    let (connector, mut connections) = MockConnector::new();
    let handlers = Arc::new(RecordingHandlers::default());
    let manager = SubscriptionManager::with_collaborators(handlers.clone(), config(100, 5_000), connector, noop_limiter());

    manager.add_subscriptions(&["a".to_string(), "b".to_string()]).await;
    let mut conn = connections.recv().await.unwrap();
    let _ = conn.sent_rx.recv().await;

    manager.remove_subscriptions(&["a".to_string()]).await;
    assert!(conn.transport.is_open(), "removal alone does not tear the socket down");

    conn.event_tx
        .send(TransportEvent::Text(
            r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]}"#
                .to_string(),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handlers.books.lock().await.is_empty(), "event for a removed asset must never reach the handler");
}
