//! Conversation groups: persisted identity plus the live set of attached
//! connections.
//!
//! Every change to a group's membership, and every broadcast that depends on
//! it, happens while holding that group's [`GroupGuard`]. Guards are striped
//! by key; a task must never hold two guards at once.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Result, bail};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use tandem_types::models::{Connection, ConnectionId, Group, GroupKey};

use crate::store::{ChatStore, blocking};

const LOCK_STRIPES: usize = 64;

pub struct GroupRegistry {
    store: Arc<dyn ChatStore>,
    live: RwLock<LiveGroups>,
    stripes: Vec<Mutex<()>>,
}

#[derive(Default)]
struct LiveGroups {
    members: HashMap<GroupKey, Vec<Connection>>,
    by_connection: HashMap<ConnectionId, GroupKey>,
}

impl GroupRegistry {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            live: RwLock::new(LiveGroups::default()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Serialize on `key`. Held across the persistence step and the
    /// broadcast of whatever transition the caller runs.
    pub async fn lock(&self, key: &GroupKey) -> GroupGuard<'_> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();

        GroupGuard {
            registry: self,
            key: key.clone(),
            _stripe: self.stripes[stripe].lock().await,
        }
    }

    /// Live snapshot of a group. Empty when nobody is attached.
    pub fn group(&self, key: &GroupKey) -> Group {
        let live = self.read();
        Group {
            name: key.clone(),
            connections: live.members.get(key).cloned().unwrap_or_default(),
        }
    }

    pub fn find_by_connection(&self, connection_id: ConnectionId) -> Option<Group> {
        let key = self.read().by_connection.get(&connection_id).cloned()?;
        Some(self.group(&key))
    }

    /// Detach a connection from whatever group it is in. Returns `None` when
    /// it is not attached. On success the group's guard is still held, so the
    /// caller can tell the remaining members before anyone else touches the
    /// group.
    pub async fn detach(&self, connection_id: ConnectionId) -> Result<Option<(GroupGuard<'_>, Group)>> {
        let Some(key) = self.read().by_connection.get(&connection_id).cloned() else {
            return Ok(None);
        };

        let guard = self.lock(&key).await;
        match guard.detach(connection_id).await? {
            Some(group) => Ok(Some((guard, group))),
            None => Ok(None),
        }
    }

    /// Drop a connection from the live view only. Used when the socket is
    /// gone but the persisted row could not be removed; the row is purged at
    /// next startup.
    pub async fn evict(&self, connection_id: ConnectionId) -> Option<(GroupGuard<'_>, Group)> {
        let key = self.read().by_connection.get(&connection_id).cloned()?;
        let guard = self.lock(&key).await;
        let group = guard.remove_live(connection_id)?;
        Some((guard, group))
    }

    fn read(&self) -> RwLockReadGuard<'_, LiveGroups> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LiveGroups> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to one group's membership.
pub struct GroupGuard<'a> {
    registry: &'a GroupRegistry,
    key: GroupKey,
    _stripe: MutexGuard<'a, ()>,
}

impl GroupGuard<'_> {
    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn group(&self) -> Group {
        self.registry.group(&self.key)
    }

    /// Persist the group if it does not exist yet.
    pub async fn get_or_create(&self) -> Result<Group> {
        let key = self.key.clone();
        blocking(&self.registry.store, move |store| store.get_or_create_group(&key)).await?;
        Ok(self.group())
    }

    /// Attach a connection. The live view changes only after the store
    /// commits.
    pub async fn attach(&self, connection: &Connection) -> Result<Group> {
        if let Some(existing) = self.registry.read().by_connection.get(&connection.connection_id) {
            bail!(
                "connection {} is already attached to {}",
                connection.connection_id,
                existing
            );
        }

        let key = self.key.clone();
        let persisted = connection.clone();
        blocking(&self.registry.store, move |store| store.add_connection(&key, &persisted)).await?;

        {
            let mut live = self.registry.write();
            live.members
                .entry(self.key.clone())
                .or_default()
                .push(connection.clone());
            live.by_connection
                .insert(connection.connection_id, self.key.clone());
        }

        debug!("{} attached to {}", connection.connection_id, self.key);
        Ok(self.group())
    }

    /// Detach a connection from this group. `None` if it is not attached
    /// here.
    pub async fn detach(&self, connection_id: ConnectionId) -> Result<Option<Group>> {
        if self.registry.read().by_connection.get(&connection_id) != Some(&self.key) {
            return Ok(None);
        }

        blocking(&self.registry.store, move |store| store.remove_connection(connection_id)).await?;

        Ok(self.remove_live(connection_id))
    }

    fn remove_live(&self, connection_id: ConnectionId) -> Option<Group> {
        {
            let mut live = self.registry.write();
            if live.by_connection.get(&connection_id) != Some(&self.key) {
                return None;
            }
            live.by_connection.remove(&connection_id);
            let now_empty = match live.members.get_mut(&self.key) {
                Some(members) => {
                    members.retain(|c| c.connection_id != connection_id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                live.members.remove(&self.key);
            }
        }

        debug!("{} detached from {}", connection_id, self.key);
        Some(self.group())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_db::Database;
    use uuid::Uuid;

    fn registry() -> (Arc<Database>, GroupRegistry) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store: Arc<dyn ChatStore> = db.clone();
        (db, GroupRegistry::new(store))
    }

    #[tokio::test]
    async fn attach_and_detach_track_membership() {
        let (db, groups) = registry();
        let key = GroupKey::for_pair("alice", "bob");
        let alice = Connection::new(Uuid::new_v4(), "alice");
        let bob = Connection::new(Uuid::new_v4(), "bob");

        {
            let guard = groups.lock(&key).await;
            guard.attach(&alice).await.unwrap();
            let group = guard.attach(&bob).await.unwrap();
            assert_eq!(group.connections.len(), 2);
            assert!(group.has_user("bob"));
        }

        assert_eq!(groups.find_by_connection(alice.connection_id).unwrap().name, key);

        let (_guard, group) = groups.detach(bob.connection_id).await.unwrap().unwrap();
        assert_eq!(group.connections, vec![alice.clone()]);

        // Only alice's row is left behind in the store
        assert_eq!(db.clear_connections().unwrap(), 1);
    }

    #[tokio::test]
    async fn detaching_unknown_connection_is_benign() {
        let (_db, groups) = registry();
        assert!(groups.detach(Uuid::new_v4()).await.unwrap().is_none());
        assert!(groups.evict(Uuid::new_v4()).await.is_none());
        assert!(groups.find_by_connection(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn connection_belongs_to_one_group() {
        let (_db, groups) = registry();
        let alice = Connection::new(Uuid::new_v4(), "alice");

        groups
            .lock(&GroupKey::for_pair("alice", "bob"))
            .await
            .attach(&alice)
            .await
            .unwrap();

        let second = groups
            .lock(&GroupKey::for_pair("alice", "carol"))
            .await
            .attach(&alice)
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn concurrent_first_joins_create_one_group() {
        let (db, groups) = registry();
        let groups = Arc::new(groups);
        let key = GroupKey::for_pair("alice", "bob");

        let mut tasks = Vec::new();
        for name in ["alice", "bob", "alice", "bob"] {
            let groups = groups.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let conn = Connection::new(Uuid::new_v4(), name);
                let guard = groups.lock(&key).await;
                guard.get_or_create().await.unwrap();
                guard.attach(&conn).await.unwrap();
                conn.connection_id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        assert_eq!(groups.group(&key).connections.len(), 4);
        for id in ids {
            assert_eq!(
                db.remove_connection(&id.to_string()).unwrap().as_deref(),
                Some(key.as_str())
            );
        }
    }

    #[tokio::test]
    async fn group_outlives_its_connections() {
        let (db, groups) = registry();
        let key = GroupKey::for_pair("alice", "bob");
        let alice = Connection::new(Uuid::new_v4(), "alice");

        groups.lock(&key).await.attach(&alice).await.unwrap();
        groups.detach(alice.connection_id).await.unwrap();
        assert!(groups.group(&key).connections.is_empty());

        // Re-creating an existing group is a no-op, and it can be joined again
        let guard = groups.lock(&key).await;
        guard.get_or_create().await.unwrap();
        let bob = Connection::new(Uuid::new_v4(), "bob");
        assert_eq!(guard.attach(&bob).await.unwrap().connections, vec![bob.clone()]);
        assert_eq!(db.clear_connections().unwrap(), 1);
    }
}
