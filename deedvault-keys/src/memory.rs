//! In-memory directories for tests and single-process embedding.

use crate::directory::{ActiveGrant, DirectoryError, Relation, RelationDirectory, UserDirectory};
use async_trait::async_trait;
use deedvault_crypto::Salt;
use deedvault_types::{ItemId, RelationId, RelationStatus, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Clone, Debug)]
struct UserRecord {
    salt: Vec<u8>,
    iterations: u32,
}

/// User directory backed by a map.
#[derive(Clone, Default)]
pub struct MemoryUserDirectory {
    users: Arc<RwLock<HashMap<UserId, UserRecord>>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user with a fresh random salt.
    pub fn register(&self, user: UserId, iterations: u32) -> Result<(), DirectoryError> {
        let salt = Salt::random();
        self.register_with_salt(user, salt.as_bytes().to_vec(), iterations)
    }

    /// Registers a user with a caller-chosen salt. No length check here; a
    /// bad salt surfaces when a key is derived.
    pub fn register_with_salt(
        &self,
        user: UserId,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<(), DirectoryError> {
        let mut users = self.users.write().map_err(poisoned)?;
        users.insert(user, UserRecord { salt, iterations });
        Ok(())
    }

    /// Changes the stored iteration count. The salt is immutable.
    pub fn set_iteration_count(&self, user: UserId, iterations: u32) -> Result<(), DirectoryError> {
        let mut users = self.users.write().map_err(poisoned)?;
        let record = users.get_mut(&user).ok_or(DirectoryError::UnknownUser(user))?;
        record.iterations = iterations;
        Ok(())
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn salt(&self, user: UserId) -> Result<Vec<u8>, DirectoryError> {
        let users = self.users.read().map_err(poisoned)?;
        users
            .get(&user)
            .map(|r| r.salt.clone())
            .ok_or(DirectoryError::UnknownUser(user))
    }

    fn iteration_count(&self, user: UserId) -> Result<u32, DirectoryError> {
        let users = self.users.read().map_err(poisoned)?;
        users
            .get(&user)
            .map(|r| r.iterations)
            .ok_or(DirectoryError::UnknownUser(user))
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> DirectoryError {
    DirectoryError::Unavailable("directory lock poisoned".into())
}

// ── Relations ──

#[derive(Default)]
struct RelationState {
    relations: HashMap<RelationId, Relation>,
    grants: HashMap<(RelationId, ItemId), ActiveGrant>,
}

/// Relation/grant directory backed by maps, with knobs to simulate a slow
/// or failing remote.
#[derive(Clone, Default)]
pub struct MemoryRelationDirectory {
    state: Arc<tokio::sync::RwLock<RelationState>>,
    latency: Arc<Mutex<Option<Duration>>>,
    fail_lookups: Arc<AtomicBool>,
    fail_grant_creation: Arc<AtomicBool>,
}

impl MemoryRelationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a relation and returns its id.
    pub async fn connect(&self, requester: UserId, requestee: UserId, status: RelationStatus) -> RelationId {
        let id = RelationId::new();
        let relation = Relation {
            id,
            requester,
            requestee,
            status,
        };
        self.state.write().await.relations.insert(id, relation);
        id
    }

    pub async fn set_status(&self, id: RelationId, status: RelationStatus) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        let relation = state
            .relations
            .get_mut(&id)
            .ok_or(DirectoryError::UnknownRelation(id))?;
        relation.status = status;
        Ok(())
    }

    /// Delay applied to every trait call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Makes `relation` and `active_grant` return `Unavailable`.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Makes `create_grant` return `Unavailable`.
    pub fn fail_grant_creation(&self, fail: bool) {
        self.fail_grant_creation.store(fail, Ordering::SeqCst);
    }

    pub async fn grant_count(&self) -> usize {
        self.state.read().await.grants.len()
    }

    async fn simulate_remote(&self) {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_lookups(&self) -> Result<(), DirectoryError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("lookups disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationDirectory for MemoryRelationDirectory {
    async fn relation(&self, a: UserId, b: UserId) -> Result<Option<Relation>, DirectoryError> {
        self.simulate_remote().await;
        self.check_lookups()?;
        let state = self.state.read().await;
        Ok(state
            .relations
            .values()
            .find(|r| r.involves(a) && r.involves(b) && a != b)
            .cloned())
    }

    async fn active_grant(
        &self,
        relation: RelationId,
        item: ItemId,
    ) -> Result<Option<ActiveGrant>, DirectoryError> {
        self.simulate_remote().await;
        self.check_lookups()?;
        Ok(self.state.read().await.grants.get(&(relation, item)).cloned())
    }

    async fn create_grant(&self, grant: ActiveGrant) -> Result<(), DirectoryError> {
        self.simulate_remote().await;
        if self.fail_grant_creation.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("grant creation disabled".into()));
        }
        let mut state = self.state.write().await;
        if !state.relations.contains_key(&grant.relation) {
            return Err(DirectoryError::UnknownRelation(grant.relation));
        }
        state.grants.insert((grant.relation, grant.item), grant);
        Ok(())
    }

    async fn deactivate_grant(
        &self,
        relation: RelationId,
        item: ItemId,
    ) -> Result<bool, DirectoryError> {
        self.simulate_remote().await;
        Ok(self.state.write().await.grants.remove(&(relation, item)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relation_lookup_is_symmetric() {
        let dir = MemoryRelationDirectory::new();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let id = dir.connect(a, b, RelationStatus::Accepted).await;

        assert_eq!(dir.relation(b, a).await.unwrap().unwrap().id, id);
        assert!(dir.relation(a, c).await.unwrap().is_none());
        assert!(dir.relation(a, a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grant_needs_known_relation() {
        let dir = MemoryRelationDirectory::new();
        let err = dir
            .create_grant(ActiveGrant {
                relation: RelationId::new(),
                item: ItemId::new(),
                grantee: UserId::new(),
                permission: deedvault_types::Permission::Read,
                can_reshare: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownRelation(_)));
    }

    #[test]
    fn user_directory_keeps_salt_on_iteration_change() {
        let dir = MemoryUserDirectory::new();
        let user = UserId::new();
        dir.register(user, 3).unwrap();
        let salt = dir.salt(user).unwrap();

        dir.set_iteration_count(user, 9).unwrap();
        assert_eq!(dir.salt(user).unwrap(), salt);
        assert_eq!(dir.iteration_count(user).unwrap(), 9);
        assert_eq!(salt.len(), deedvault_crypto::SALT_SIZE);
    }
}
