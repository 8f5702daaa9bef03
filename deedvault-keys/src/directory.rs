//! Collaborators the key service consults but does not own: the user
//! directory (salt and iteration count) and the relation/grant store.

use async_trait::async_trait;
use deedvault_types::{ItemId, Permission, RelationId, RelationStatus, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("unknown relation: {0}")]
    UnknownRelation(RelationId),

    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("directory lookup timed out")]
    Timeout,
}

/// A link between two users in the social graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub requester: UserId,
    pub requestee: UserId,
    pub status: RelationStatus,
}

impl Relation {
    pub fn involves(&self, user: UserId) -> bool {
        self.requester == user || self.requestee == user
    }
}

/// An active grant of one item over one relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveGrant {
    pub relation: RelationId,
    pub item: ItemId,
    pub grantee: UserId,
    pub permission: Permission,
    pub can_reshare: bool,
}

/// Where user derivation parameters live.
pub trait UserDirectory: Send + Sync {
    /// The user's derivation salt, as stored. Length is checked by the caller.
    fn salt(&self, user: UserId) -> Result<Vec<u8>, DirectoryError>;

    fn iteration_count(&self, user: UserId) -> Result<u32, DirectoryError>;
}

/// Relation and grant bookkeeping.
///
/// Calls may be remote; the gate bounds each one with a timeout.
#[async_trait]
pub trait RelationDirectory: Send + Sync {
    /// The relation between `a` and `b`, in either direction.
    async fn relation(&self, a: UserId, b: UserId) -> Result<Option<Relation>, DirectoryError>;

    async fn active_grant(
        &self,
        relation: RelationId,
        item: ItemId,
    ) -> Result<Option<ActiveGrant>, DirectoryError>;

    /// Creates or replaces the grant for `(grant.relation, grant.item)`.
    async fn create_grant(&self, grant: ActiveGrant) -> Result<(), DirectoryError>;

    /// Returns whether an active grant was switched off.
    async fn deactivate_grant(
        &self,
        relation: RelationId,
        item: ItemId,
    ) -> Result<bool, DirectoryError>;
}
