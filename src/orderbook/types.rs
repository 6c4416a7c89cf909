//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::AssetId;

/// Single price level in an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total size available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Which side of the book a price-change level applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Side {
    /// Bid side.
    #[serde(rename = "BUY")]
    Buy,
    /// Ask side.
    #[serde(rename = "SELL")]
    Sell,
}

/// One level mutation carried by a `price_change` event.
#[derive(Debug, Clone)]
pub struct PriceChangeLevel {
    /// Price of the level being changed.
    pub price: Decimal,
    /// Which side the level is on.
    pub side: Side,
    /// New size at this price. Zero means "remove this level".
    pub size: Decimal,
}

/// Per-asset order book entry maintained by [`crate::orderbook::cache::OrderBookCache`].
///
/// `bids` stay sorted descending by price, `asks` ascending, at all times —
/// every mutating operation re-sorts before returning.
#[derive(Debug, Clone, Default)]
pub struct OrderBookEntry {
    /// Bid levels, descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, ascending by price.
    pub asks: Vec<PriceLevel>,
    /// Last known trade price for this asset, if any.
    pub last_trade_price: Option<Decimal>,
    /// Monotonic counter bumped on every mutation, for staleness checks.
    pub last_update: u64,
}

impl OrderBookEntry {
    /// Best (highest) bid price, if the book has any bids.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best (lowest) ask price, if the book has any asks.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// The synthetic "displayed price" event fusing order-book and
/// last-trade state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdateEvent {
    /// Asset the price applies to.
    pub asset_id: AssetId,
    /// The derived displayed price.
    pub price: Decimal,
    /// Full bid snapshot at the time of derivation.
    pub bids: Vec<PriceLevel>,
    /// Full ask snapshot at the time of derivation.
    pub asks: Vec<PriceLevel>,
    /// Last trade price, if known, regardless of which branch of the
    /// derivation rule produced `price`.
    pub last_trade_price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn price_level_creation() {
        let level = PriceLevel::new(dec!(0.50), dec!(100));
        assert_eq!(level.price, dec!(0.50));
        assert_eq!(level.size, dec!(100));
    }

    #[test]
    fn entry_best_prices() {
        let entry = OrderBookEntry {
            bids: vec![PriceLevel::new(dec!(0.48), dec!(50)), PriceLevel::new(dec!(0.47), dec!(100))],
            asks: vec![PriceLevel::new(dec!(0.50), dec!(50)), PriceLevel::new(dec!(0.51), dec!(100))],
            last_trade_price: None,
            last_update: 1,
        };

        assert_eq!(entry.best_bid(), Some(dec!(0.48)));
        assert_eq!(entry.best_ask(), Some(dec!(0.50)));
    }
}
