//! Per-asset order-book cache and the derived displayed-price rule.
//!
//! This is the crate's sole stateful fusion point: it emits no events on
//! its own, but `derive_price` is called by the group socket after every
//! market update that could change the result.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use dashmap::DashMap;

use super::types::{OrderBookEntry, PriceChangeLevel, PriceLevel, PriceUpdateEvent, Side};
use crate::AssetId;

/// Maximum allowed bid/ask spread for the midpoint branch of the
/// displayed-price rule, inclusive.
const MAX_MIDPOINT_SPREAD: Decimal = dec!(0.10);

/// Per-asset best-bid/best-ask/last-trade store.
///
/// A `DashMap<AssetId, OrderBookEntry>` keyed by asset id, each entry
/// holding an explicit sorted `Vec` of levels per side so top-of-book
/// reads never have to sort.
#[derive(Debug, Default)]
pub struct OrderBookCache {
    entries: DashMap<AssetId, OrderBookEntry>,
}

impl OrderBookCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides of `asset_id`'s book wholesale. A `book` event is
    /// authoritative: `last_trade_price` is preserved, `last_update` bumps.
    pub fn apply_book(&self, asset_id: &str, mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>) {
        sort_bids(&mut bids);
        sort_asks(&mut asks);

        let mut entry = self.entries.entry(asset_id.to_string()).or_default();
        entry.bids = bids;
        entry.asks = asks;
        entry.last_update += 1;
    }

    /// Apply a batch of incremental price-level changes to `asset_id`'s book.
    ///
    /// `size == 0` removes the level at `price`, otherwise
    /// the level is upserted. Both sides are re-sorted once after the whole
    /// batch is applied, not per level.
    pub fn apply_price_change(&self, asset_id: &str, changes: &[PriceChangeLevel]) {
        let mut entry = self.entries.entry(asset_id.to_string()).or_default();

        for change in changes {
            let side = match change.side {
                Side::Buy => &mut entry.bids,
                Side::Sell => &mut entry.asks,
            };

            if let Some(pos) = side.iter().position(|l| l.price == change.price) {
                if change.size.is_zero() {
                    side.remove(pos);
                } else {
                    side[pos].size = change.size;
                }
            } else if !change.size.is_zero() {
                side.push(PriceLevel::new(change.price, change.size));
            }
        }

        sort_bids(&mut entry.bids);
        sort_asks(&mut entry.asks);
        entry.last_update += 1;
    }

    /// Record the latest known trade price for `asset_id`.
    pub fn apply_last_trade_price(&self, asset_id: &str, price: Decimal) {
        let mut entry = self.entries.entry(asset_id.to_string()).or_default();
        entry.last_trade_price = Some(price);
        entry.last_update += 1;
    }

    /// Compute the derived displayed-price event for `asset_id`, per
    /// the displayed-price rule:
    ///
    /// - both best bid and best ask exist and `spread <= 0.10`: midpoint.
    /// - else if a last trade price is known: that price.
    /// - else: no event can be derived.
    pub fn derive_price(&self, asset_id: &str) -> Option<PriceUpdateEvent> {
        let entry = self.entries.get(asset_id)?;

        let best_bid = entry.best_bid();
        let best_ask = entry.best_ask();

        let price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) if ask - bid <= MAX_MIDPOINT_SPREAD => (bid + ask) / dec!(2),
            _ => entry.last_trade_price?,
        };

        Some(PriceUpdateEvent {
            asset_id: asset_id.to_string(),
            price,
            bids: entry.bids.clone(),
            asks: entry.asks.clone(),
            last_trade_price: entry.last_trade_price,
        })
    }

    /// Remove cache entries for the given asset ids.
    pub fn drop_assets(&self, asset_ids: &[AssetId]) {
        for id in asset_ids {
            self.entries.remove(id);
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Snapshot an entry's bids/asks for inspection (tests, diagnostics).
    pub fn snapshot(&self, asset_id: &str) -> Option<OrderBookEntry> {
        self.entries.get(asset_id).map(|e| e.clone())
    }
}

fn sort_bids(bids: &mut [PriceLevel]) {
    bids.sort_by(|a, b| b.price.cmp(&a.price));
}

fn sort_asks(asks: &mut [PriceLevel]) {
    asks.sort_by(|a, b| a.price.cmp(&b.price));
}
