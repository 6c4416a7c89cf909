//! Order-book state: types and the per-asset cache that derives the
//! synthetic displayed-price event.

pub mod cache;
pub mod types;

pub use cache::OrderBookCache;
pub use types::{OrderBookEntry, PriceChangeLevel, PriceLevel, PriceUpdateEvent, Side};
