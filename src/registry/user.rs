//! Atomic store of user groups.

use std::sync::Mutex;

use super::group::{GroupId, GroupStatus, UserGroup};
use crate::UserAuth;

/// One group per authenticated user: unlike [`MarketRegistry`](super::market::MarketRegistry),
/// users are never multiplexed onto a shared socket, so there is no
/// capacity/regrouping logic here — only add, remove, and status bookkeeping.
#[derive(Default)]
pub struct UserRegistry {
    groups: Mutex<Vec<UserGroup>>,
}

impl UserRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the group list with the lock held.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vec<UserGroup>) -> R) -> R {
        let mut guard = self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Snapshot the current groups (for diagnostics and tests).
    pub fn snapshot(&self) -> Vec<UserGroup> {
        self.mutate(|groups| groups.clone())
    }

    /// Add (or replace) the subscription for `auth.key`.
    ///
    /// If a group already exists for this key, its credentials are
    /// replaced in place and its status is left untouched — a caller that
    /// re-subscribes the same user with a rotated secret should not pay
    /// for a full reconnect unless the socket itself demands one. A
    /// brand-new key gets a fresh `PENDING` group, whose id is returned so
    /// the caller knows to connect it.
    pub fn add_user_subscription(&self, auth: UserAuth) -> Option<GroupId> {
        self.mutate(|groups| {
            if let Some(existing) = groups.iter_mut().find(|g| g.api_key == auth.key) {
                existing.auth = auth;
                None
            } else {
                let group = UserGroup::new(auth);
                let id = group.id;
                groups.push(group);
                Some(id)
            }
        })
    }

    /// Remove the group for `api_key`, if present, returning its id.
    pub fn remove_user_subscription(&self, api_key: &str) -> Option<GroupId> {
        self.mutate(|groups| {
            let idx = groups.iter().position(|g| g.api_key == api_key)?;
            Some(groups.remove(idx).id)
        })
    }

    /// Full group record for `id`, if it still exists.
    pub fn group_of(&self, id: GroupId) -> Option<UserGroup> {
        self.mutate(|groups| groups.iter().find(|g| g.id == id).cloned())
    }

    /// Look up the group id for `api_key`, if subscribed.
    pub fn find_group_for_user(&self, api_key: &str) -> Option<GroupId> {
        self.mutate(|groups| groups.iter().find(|g| g.api_key == api_key).map(|g| g.id))
    }

    /// Groups needing (re)connection: `PENDING` and `DEAD`. Unlike the
    /// market registry, a user group is never emptied or superseded, so
    /// there is no cleanup/removal pass here.
    pub fn get_groups_to_reconnect(&self) -> Vec<GroupId> {
        self.mutate(|groups| {
            groups
                .iter()
                .filter(|g| matches!(g.status, GroupStatus::Pending | GroupStatus::Dead))
                .map(|g| g.id)
                .collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn auth(key: &str) -> UserAuth {
        UserAuth::new(key, "secret", "pass")
    }

    #[test]
    fn first_subscription_creates_pending_group() {
        let registry = UserRegistry::new();
        let id = registry.add_user_subscription(auth("alice"));
        assert!(id.is_some());
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.snapshot()[0].status, GroupStatus::Pending);
    }

    #[test]
    fn resubscribing_same_key_replaces_credentials_without_new_group() {
        let registry = UserRegistry::new();
        let first = registry.add_user_subscription(auth("alice")).unwrap();
        registry.set_status(first, GroupStatus::Alive);

        let second = registry.add_user_subscription(UserAuth::new("alice", "rotated", "pass"));
        assert!(second.is_none(), "re-subscribing an existing user must not allocate a new group");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, GroupStatus::Alive, "status is untouched by a credential refresh");
        assert_eq!(snapshot[0].auth.secret, "rotated");
    }

    #[test]
    fn remove_user_subscription_drops_the_group() {
        let registry = UserRegistry::new();
        registry.add_user_subscription(auth("alice"));
        let removed = registry.remove_user_subscription("alice");
        assert!(removed.is_some());
        assert!(registry.snapshot().is_empty());
        assert!(registry.remove_user_subscription("alice").is_none());
    }

    #[test]
    fn reconnect_list_includes_pending_and_dead_only() {
        let registry = UserRegistry::new();
        let pending = registry.add_user_subscription(auth("alice")).unwrap();
        let to_be_alive = registry.add_user_subscription(auth("bob")).unwrap();
        registry.set_status(to_be_alive, GroupStatus::Alive);
        let dead = registry.add_user_subscription(auth("carol")).unwrap();
        registry.set_status(dead, GroupStatus::Dead);

        let mut reconnect = registry.get_groups_to_reconnect();
        reconnect.sort();
        let mut expected = vec![pending, dead];
        expected.sort();
        assert_eq!(reconnect, expected);
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = UserRegistry::new();
        registry.add_user_subscription(auth("alice"));
        registry.add_user_subscription(auth("bob"));
        let removed = registry.clear();
        assert_eq!(removed.len(), 2);
        assert!(registry.snapshot().is_empty());
    }
}
