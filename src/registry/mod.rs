//! Group bookkeeping: which asset ids and which authenticated users are
//! assigned to which socket, and what state that socket is in.

pub mod group;
pub mod market;
pub mod user;

pub use group::{next_group_id, GroupId, GroupStatus, MarketGroup, UserGroup};
pub use market::MarketRegistry;
pub use user::UserRegistry;
