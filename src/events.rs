//! Decoded market/user events and the handler surfaces callers implement.
//!
//! Wire frames are JSON, either a single object or an array of objects,
//! each carrying an `event_type` discriminant. Prices and
//! sizes travel as strings on the wire and are parsed into [`Decimal`] so
//! equality with the upstream's representation is exact.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::CoreError;
use crate::orderbook::{PriceChangeLevel, PriceLevel, PriceUpdateEvent, Side};
use crate::registry::GroupId;
use crate::AssetId;

/// A full order-book snapshot for one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEvent {
    /// Asset the snapshot applies to.
    pub asset_id: AssetId,
    /// Bid levels as received (unsorted on the wire, sorted by the cache).
    pub bids: Vec<PriceLevel>,
    /// Ask levels as received.
    pub asks: Vec<PriceLevel>,
}

/// One level mutation carried by a `price_change` frame element. Unlike
/// [`PriceChangeLevel`], this also carries the asset id it applies to —
/// a single frame element's changes can span several assets, and the
/// cache applies them one asset at a time.
#[derive(Debug, Clone)]
pub struct PriceChangeItem {
    /// Asset this level mutation applies to.
    pub asset_id: AssetId,
    /// Price of the level being changed.
    pub price: Decimal,
    /// Which side the level is on.
    pub side: Side,
    /// New size at this price. Zero means "remove this level".
    pub size: Decimal,
}

impl PriceChangeItem {
    /// Drop the asset id, yielding the level mutation the cache expects.
    pub fn as_level(&self) -> PriceChangeLevel {
        PriceChangeLevel { price: self.price, side: self.side, size: self.size }
    }
}

/// One inbound `price_change` frame element, carrying a batch of level
/// mutations potentially spanning several assets.
#[derive(Debug, Clone)]
pub struct PriceChangeEvent {
    /// The level mutations in this frame element, in wire order.
    pub changes: Vec<PriceChangeItem>,
}

impl PriceChangeEvent {
    /// Distinct asset ids touched by this event's changes, in wire order
    /// with duplicates.
    pub fn asset_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.changes.iter().map(|c| &c.asset_id)
    }
}

/// A tick-size change notification. The upstream shape beyond `asset_id`
/// is not pinned down further, so the remaining fields are kept
/// as raw JSON rather than guessed at.
#[derive(Debug, Clone)]
pub struct TickSizeChangeEvent {
    /// Asset the change applies to.
    pub asset_id: AssetId,
    /// Everything else in the frame, verbatim.
    pub raw: serde_json::Value,
}

/// A last-trade-price tick for one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastTradePriceEvent {
    /// Asset the trade applies to.
    pub asset_id: AssetId,
    /// Traded price.
    pub price: Decimal,
}

/// A user-channel trade event. The upstream shape is not specified beyond
/// `event_type`, so it is dispatched to handlers verbatim.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    /// The full decoded frame element.
    pub raw: serde_json::Value,
}

/// A user-channel order event, dispatched verbatim like [`TradeEvent`].
#[derive(Debug, Clone)]
pub struct OrderEvent {
    /// The full decoded frame element.
    pub raw: serde_json::Value,
}

/// One decoded element of a market-channel frame.
#[derive(Debug, Clone)]
pub enum MarketFrameElement {
    /// `event_type: "book"`.
    Book(BookEvent),
    /// `event_type: "price_change"`.
    PriceChange(PriceChangeEvent),
    /// `event_type: "tick_size_change"`.
    TickSizeChange(TickSizeChangeEvent),
    /// `event_type: "last_trade_price"`.
    LastTradePrice(LastTradePriceEvent),
}

/// One decoded element of a user-channel frame.
#[derive(Debug, Clone)]
pub enum UserFrameElement {
    /// `event_type: "trade"`.
    Trade(TradeEvent),
    /// `event_type: "order"`.
    Order(OrderEvent),
}

/// A price/size level travels as a string on the wire. Parse it to
/// `Decimal` right here rather than carrying the raw string forward: a
/// malformed numeric must fail the whole frame's deserialization (the
/// one malformed-frame error path this crate defines) instead of being
/// silently coerced into a fabricated value that could flip the spread
/// rule or inject a phantom zero-price level.
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse::<Decimal>()
        .map_err(|e| serde::de::Error::custom(format!("invalid decimal {raw:?}: {e}")))
}

fn deserialize_decimal_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|r| {
        r.parse::<Decimal>()
            .map_err(|e| serde::de::Error::custom(format!("invalid decimal {r:?}: {e}")))
    })
    .transpose()
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct WirePriceChangeLevel {
    asset_id: String,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    side: Side,
    #[serde(deserialize_with = "deserialize_decimal")]
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireElement {
    event_type: String,
    asset_id: Option<String>,
    bids: Option<Vec<WireLevel>>,
    asks: Option<Vec<WireLevel>>,
    price_changes: Option<Vec<WirePriceChangeLevel>>,
    #[serde(default, deserialize_with = "deserialize_decimal_opt")]
    price: Option<Decimal>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// Parse one inbound market-channel text frame into its elements.
///
/// The literal text `PONG` is not JSON and must be
/// filtered out by the caller before this is invoked. The frame's JSON
/// value may be a single object or an array; both are normalized to a
/// list of elements here. Unknown `event_type` values are silently
/// dropped, matching the market channel's tolerate-and-ignore policy
/// (the market channel's tolerate-and-ignore policy).
pub fn parse_market_frame(text: &str) -> Result<Vec<MarketFrameElement>, serde_json::Error> {
    let elements: Vec<WireElement> = parse_as_array(text)?;

    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        match element.event_type.as_str() {
            "book" => {
                let Some(asset_id) = element.asset_id else { continue };
                let bids = element
                    .bids
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| PriceLevel::new(l.price, l.size))
                    .collect();
                let asks = element
                    .asks
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| PriceLevel::new(l.price, l.size))
                    .collect();
                out.push(MarketFrameElement::Book(BookEvent { asset_id, bids, asks }));
            }
            "price_change" => {
                let changes = element
                    .price_changes
                    .unwrap_or_default()
                    .into_iter()
                    .map(|c| PriceChangeItem {
                        asset_id: c.asset_id,
                        price: c.price,
                        side: c.side,
                        size: c.size,
                    })
                    .collect();
                out.push(MarketFrameElement::PriceChange(PriceChangeEvent { changes }));
            }
            "tick_size_change" => {
                let Some(asset_id) = element.asset_id else { continue };
                out.push(MarketFrameElement::TickSizeChange(TickSizeChangeEvent {
                    asset_id,
                    raw: element.rest,
                }));
            }
            "last_trade_price" => {
                let (Some(asset_id), Some(price)) = (element.asset_id, element.price) else { continue };
                out.push(MarketFrameElement::LastTradePrice(LastTradePriceEvent {
                    asset_id,
                    price,
                }));
            }
            _ => {}
        }
    }

    Ok(out)
}

/// Parse one inbound user-channel text frame. `trade`/`order` elements are
/// kept verbatim; everything else is dropped.
pub fn parse_user_frame(text: &str) -> Result<Vec<UserFrameElement>, serde_json::Error> {
    let elements: Vec<WireElement> = parse_as_array(text)?;

    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        match element.event_type.as_str() {
            "trade" => out.push(UserFrameElement::Trade(TradeEvent { raw: element.rest })),
            "order" => out.push(UserFrameElement::Order(OrderEvent { raw: element.rest })),
            _ => {}
        }
    }

    Ok(out)
}

fn parse_as_array<T: for<'de> Deserialize<'de>>(text: &str) -> Result<Vec<T>, serde_json::Error> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        serde_json::from_str(text)
    } else {
        Ok(vec![serde_json::from_str(text)?])
    }
}

/// Market-channel handler surface. Every method is optional:
/// implement only the ones relevant to the caller, the rest no-op.
#[async_trait]
#[allow(unused_variables)]
pub trait MarketHandlers: Send + Sync {
    /// A batch of `book` events decoded from one frame.
    async fn on_book(&self, batch: Vec<BookEvent>) {}
    /// A batch of `price_change` events decoded from one frame.
    async fn on_price_change(&self, batch: Vec<PriceChangeEvent>) {}
    /// A batch of `tick_size_change` events decoded from one frame.
    async fn on_tick_size_change(&self, batch: Vec<TickSizeChangeEvent>) {}
    /// A batch of `last_trade_price` events decoded from one frame.
    async fn on_last_trade_price(&self, batch: Vec<LastTradePriceEvent>) {}
    /// A batch of derived displayed-price events, coalesced at most once
    /// per asset per inbound frame.
    async fn on_polymarket_price_update(&self, batch: Vec<PriceUpdateEvent>) {}
    /// The group's socket finished its open handshake and subscribed.
    async fn on_ws_open(&self, group_id: GroupId, asset_ids: Vec<AssetId>) {}
    /// The group's socket closed.
    async fn on_ws_close(&self, group_id: GroupId, code: Option<u16>, reason: String) {}
    /// An error occurred that does not map to a close (connect failure,
    /// parse failure, rate-limiter failure, caller misuse).
    async fn on_error(&self, err: CoreError) {}
}

/// User-channel handler surface. Every callback carries the
/// `apiKey` identifying which user's socket produced it.
#[async_trait]
#[allow(unused_variables)]
pub trait UserHandlers: Send + Sync {
    /// A batch of `trade` events for this user.
    async fn on_trade(&self, api_key: &str, batch: Vec<TradeEvent>) {}
    /// A batch of `order` events for this user.
    async fn on_order(&self, api_key: &str, batch: Vec<OrderEvent>) {}
    /// This user's socket finished its open handshake and subscribed.
    async fn on_ws_open(&self, api_key: &str) {}
    /// This user's socket closed.
    async fn on_ws_close(&self, api_key: &str, code: Option<u16>, reason: String) {}
    /// An error occurred on this user's socket.
    async fn on_error(&self, api_key: &str, err: CoreError) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_single_object_book_frame() {
        let text = r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]}"#;
        let elements = parse_market_frame(text).unwrap();
        assert_eq!(elements.len(), 1);
        match &elements[0] {
            MarketFrameElement::Book(book) => {
                assert_eq!(book.asset_id, "a");
                assert_eq!(book.bids[0].price, dec!(0.50));
            }
            other => panic!("expected Book, got {other:?}"),
        }
    }

    #[test]
    fn parses_array_frame_with_mixed_event_types() {
        let text = r#"[
            {"event_type":"last_trade_price","asset_id":"a","price":"0.62"},
            {"event_type":"tick_size_change","asset_id":"a","min_tick_size":"0.01"},
            {"event_type":"unknown_future_type","asset_id":"a"}
        ]"#;
        let elements = parse_market_frame(text).unwrap();
        assert_eq!(elements.len(), 2, "unknown event_type must be dropped, not error");
        assert!(matches!(elements[0], MarketFrameElement::LastTradePrice(_)));
        assert!(matches!(elements[1], MarketFrameElement::TickSizeChange(_)));
    }

    #[test]
    fn parses_price_change_with_multiple_assets() {
        let text = r#"{"event_type":"price_change","price_changes":[
            {"asset_id":"a","price":"0.50","side":"BUY","size":"10"},
            {"asset_id":"b","price":"0.60","side":"SELL","size":"0"}
        ]}"#;
        let elements = parse_market_frame(text).unwrap();
        match &elements[0] {
            MarketFrameElement::PriceChange(pc) => {
                assert_eq!(pc.changes.len(), 2);
                let ids: Vec<&AssetId> = pc.asset_ids().collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("expected PriceChange, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error_not_a_panic() {
        assert!(parse_market_frame("not json").is_err());
    }

    #[test]
    fn malformed_numeric_in_an_otherwise_well_formed_frame_is_a_parse_error() {
        let text = r#"{"event_type":"book","asset_id":"a","bids":[{"price":"not-a-number","size":"10"}],"asks":[]}"#;
        assert!(
            parse_market_frame(text).is_err(),
            "a malformed price must fail the frame instead of silently becoming zero"
        );
    }

    #[test]
    fn malformed_last_trade_price_is_a_parse_error() {
        let text = r#"{"event_type":"last_trade_price","asset_id":"a","price":"NaN-ish"}"#;
        assert!(parse_market_frame(text).is_err());
    }

    #[test]
    fn user_frame_drops_non_trade_order_elements() {
        let text = r#"[
            {"event_type":"trade","id":"1"},
            {"event_type":"order","id":"2"},
            {"event_type":"something_else"}
        ]"#;
        let elements = parse_user_frame(text).unwrap();
        assert_eq!(elements.len(), 2);
        assert!(matches!(elements[0], UserFrameElement::Trade(_)));
        assert!(matches!(elements[1], UserFrameElement::Order(_)));
    }
}
