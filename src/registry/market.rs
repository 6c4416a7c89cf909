//! Atomic store of market groups.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::group::{GroupId, GroupStatus, MarketGroup};
use crate::orderbook::OrderBookCache;
use crate::AssetId;

/// Atomic store of market groups behind a single mutex.
///
/// All mutation goes through [`MarketRegistry::mutate`], which runs a
/// closure to completion synchronously with the lock held; callers perform
/// any I/O (connecting new sockets, etc.) outside the lock using the ids
/// the closure returns.
#[derive(Default)]
pub struct MarketRegistry {
    groups: Mutex<Vec<MarketGroup>>,
}

impl MarketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the group list with the lock held, returning its
    /// result. A poisoned lock (a prior holder panicked) is recovered
    /// rather than propagated — there is no partial-mutation state a
    /// caller could meaningfully react to here.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vec<MarketGroup>) -> R) -> R {
        let mut guard = self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Snapshot the current groups (for diagnostics and tests).
    pub fn snapshot(&self) -> Vec<MarketGroup> {
        self.mutate(|groups| groups.clone())
    }

    /// First non-empty group with room for `n` more asset ids under `max`.
    pub fn find_group_with_capacity(groups: &[MarketGroup], n: usize, max: usize) -> Option<usize> {
        groups
            .iter()
            .position(|g| !g.asset_ids.is_empty() && g.asset_ids.len() + n <= max)
    }

    /// Add `ids` to the registry, returning the group ids the caller should
    /// connect:
    ///
    /// 1. ids already present anywhere are filtered out.
    /// 2. if nothing residual remains, nothing to do.
    /// 3. if no existing group has room for the whole residual, split it
    ///    into `max`-sized chunks and push one new `PENDING` group each.
    /// 4. otherwise regroup: replace the first group with capacity by a
    ///    new group holding the union, marking the old one `CLEANUP` with
    ///    its asset ids emptied (but its socket deliberately left open
    ///    until the cleanup tick replaces it, so in-flight events aren't
    ///    lost mid-regroup).
    pub fn add_assets(&self, ids: &[AssetId], max: usize) -> Vec<GroupId> {
        self.mutate(|groups| {
            let already_present: HashSet<&AssetId> = groups
                .iter()
                .flat_map(|g| g.asset_ids.iter())
                .collect();

            let residual: Vec<AssetId> = ids
                .iter()
                .filter(|id| !already_present.contains(id))
                .cloned()
                .collect();

            if residual.is_empty() {
                return Vec::new();
            }

            if let Some(idx) = Self::find_group_with_capacity(groups, residual.len(), max) {
                let mut union = groups[idx].asset_ids.clone();
                union.extend(residual);

                groups[idx].status = GroupStatus::Cleanup;
                groups[idx].asset_ids.clear();

                let new_group = MarketGroup::new(union);
                let new_id = new_group.id;
                groups.push(new_group);
                vec![new_id]
            } else {
                let mut new_ids = Vec::new();
                for chunk in residual.chunks(max) {
                    let group = MarketGroup::new(chunk.iter().cloned().collect());
                    new_ids.push(group.id);
                    groups.push(group);
                }
                new_ids
            }
        })
    }

    /// Remove `ids` from every group that holds them and drop their cache
    /// entries. A group that becomes smaller is not torn down: its socket
    /// keeps serving the remaining ids until something else triggers
    /// reconnection.
    pub fn remove_assets(&self, ids: &[AssetId], cache: &OrderBookCache) {
        let removed = self.mutate(|groups| {
            let mut removed = Vec::new();
            for group in groups.iter_mut() {
                for id in ids {
                    if group.asset_ids.remove(id) {
                        removed.push(id.clone());
                    }
                }
            }
            removed
        });

        if !removed.is_empty() {
            cache.drop_assets(&removed);
        }
    }

    /// Scan for groups needing reconnect or cleanup:
    ///
    /// - empty `asset_ids`: marked for removal.
    /// - `ALIVE`: left alone.
    /// - `DEAD`: added to the reconnect list.
    /// - `CLEANUP`: marked for removal.
    /// - `PENDING`: added to the reconnect list.
    ///
    /// Returns the ids of groups the caller should (re)connect. Groups
    /// marked for removal are spliced out of the list; the caller is
    /// responsible for closing their sockets (this method does not touch
    /// transports — it only mutates registry state).
    pub fn get_groups_to_reconnect_and_cleanup(&self) -> (Vec<GroupId>, Vec<MarketGroup>) {
        self.mutate(|groups| {
            let mut to_reconnect = Vec::new();
            let mut to_remove_ids = HashSet::new();

            for group in groups.iter() {
                match group.status {
                    _ if group.asset_ids.is_empty() => {
                        to_remove_ids.insert(group.id);
                    }
                    GroupStatus::Alive => {}
                    GroupStatus::Dead => to_reconnect.push(group.id),
                    GroupStatus::Cleanup => {
                        to_remove_ids.insert(group.id);
                    }
                    GroupStatus::Pending => to_reconnect.push(group.id),
                }
            }

            let removed: Vec<MarketGroup> = groups
                .iter()
                .filter(|g| to_remove_ids.contains(&g.id))
                .cloned()
                .collect();

            groups.retain(|g| !to_remove_ids.contains(&g.id));

            if !removed.is_empty() {
                debug!(count = removed.len(), "market groups removed by cleanup tick");
            }

            (to_reconnect, removed)
        })
    }

    /// Indices of groups currently holding `asset_id`. Normally 0 or 1;
    /// more than one indicates a regrouping window and is tolerated.
    pub fn find_group_indices_for_asset(&self, asset_id: &str) -> Vec<usize> {
        self.mutate(|groups| {
            let indices: Vec<usize> = groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.status != GroupStatus::Cleanup && g.asset_ids.contains(asset_id))
                .map(|(i, _)| i)
                .collect();

            if indices.len() > 1 {
                warn!(asset_id, count = indices.len(), "asset present in multiple live groups (regrouping window)");
            }

            indices
        })
    }

    /// Current asset ids of the group with id `id`, if it still exists.
    pub fn asset_ids_of(&self, id: GroupId) -> Option<HashSet<AssetId>> {
        self.mutate(|groups| groups.iter().find(|g| g.id == id).map(|g| g.asset_ids.clone()))
    }

    /// Whether `asset_id` is currently present in any non-CLEANUP group.
    pub fn is_subscribed(&self, asset_id: &str) -> bool {
        self.mutate(|groups| {
            groups
                .iter()
                .any(|g| g.status != GroupStatus::Cleanup && g.asset_ids.contains(asset_id))
        })
    }

    /// Update the status of the group with id `id`, if it still exists.
    pub fn set_status(&self, id: GroupId, status: GroupStatus) {
        self.mutate(|groups| {
            if let Some(group) = groups.iter_mut().find(|g| g.id == id) {
                group.status = status;
            }
        });
    }

    /// Remove every group, returning the ids removed (for socket teardown).
    pub fn clear(&self) -> Vec<GroupId> {
        self.mutate(|groups| groups.drain(..).map(|g| g.id).collect())
    }
}
