//! Shared group types used by both the market and user registries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{AssetId, UserAuth};

/// Opaque, unique identifier for a group.
pub type GroupId = u64;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next globally unique group id.
pub fn next_group_id() -> GroupId {
    NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle status of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Created, not yet connected.
    Pending,
    /// Connected and subscribed.
    Alive,
    /// Connection lost or failed; awaiting the next cleanup tick.
    Dead,
    /// Superseded by a regroup, or emptied; awaiting teardown.
    Cleanup,
}

/// One market group: a set of asset ids multiplexed onto a single socket.
///
/// Deliberately holds no reference to its socket: the socket is owned
/// separately by the manager and addressed by `id` through the registry,
/// so the group itself stays a plain, cheaply-cloned record.
#[derive(Debug, Clone)]
pub struct MarketGroup {
    /// Unique group id.
    pub id: GroupId,
    /// Asset ids currently assigned to this group.
    pub asset_ids: HashSet<AssetId>,
    /// Current lifecycle status.
    pub status: GroupStatus,
}

impl MarketGroup {
    /// Create a new `PENDING` group with the given asset ids.
    pub fn new(asset_ids: HashSet<AssetId>) -> Self {
        Self {
            id: next_group_id(),
            asset_ids,
            status: GroupStatus::Pending,
        }
    }
}

/// One user group: a single authenticated user's socket.
#[derive(Debug, Clone)]
pub struct UserGroup {
    /// Unique group id.
    pub id: GroupId,
    /// The user's API key (also their identity).
    pub api_key: String,
    /// Full credential triple.
    pub auth: UserAuth,
    /// Current lifecycle status.
    pub status: GroupStatus,
}

impl UserGroup {
    /// Create a new `PENDING` group for `auth`.
    pub fn new(auth: UserAuth) -> Self {
        Self {
            id: next_group_id(),
            api_key: auth.key.clone(),
            auth,
            status: GroupStatus::Pending,
        }
    }
}
