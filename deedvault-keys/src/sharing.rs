//! Share workflow: grant and revoke.
//!
//! A grant unwraps the sharer's copy of the DEK and seals it to the
//! grantee's public key; the grantee's credential is never involved. The
//! wrapped row is written before the grant is created, and removed again if
//! grant creation fails.

use crate::audit::AccessAuditLog;
use crate::directory::{ActiveGrant, DirectoryError, RelationDirectory};
use crate::error::{DenyReason, KeyError, KeyResult};
use crate::gate::AccessControlGate;
use crate::session::UserSession;
use crate::wrapping::KeyWrappingStore;
use deedvault_crypto::PublicKey;
use deedvault_storage::{AuditAction, AuditOutcome, KeyringRepository, WrappedKey};
use deedvault_types::{AccessAction, ItemId, Permission, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Orchestrates grants and revocations.
#[derive(Clone)]
pub struct SharingCoordinator {
    keyrings: Arc<dyn KeyringRepository>,
    relations: Arc<dyn RelationDirectory>,
    wrapping: KeyWrappingStore,
    gate: AccessControlGate,
    audit: AccessAuditLog,
    lookup_timeout: Duration,
}

/// What a grant should allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrantOptions {
    pub permission: Permission,
    pub can_reshare: bool,
}

impl GrantOptions {
    pub fn read() -> Self {
        Self {
            permission: Permission::Read,
            can_reshare: false,
        }
    }

    pub fn write() -> Self {
        Self {
            permission: Permission::Write,
            can_reshare: false,
        }
    }

    pub fn with_reshare(mut self) -> Self {
        self.can_reshare = true;
        self
    }
}

impl SharingCoordinator {
    pub fn new(
        keyrings: Arc<dyn KeyringRepository>,
        relations: Arc<dyn RelationDirectory>,
        wrapping: KeyWrappingStore,
        gate: AccessControlGate,
        audit: AccessAuditLog,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            keyrings,
            relations,
            wrapping,
            gate,
            audit,
            lookup_timeout,
        }
    }

    /// Gives `grantee` access to `item`. Granting again replaces the
    /// grantee's row and grant; there is never more than one of each.
    pub async fn grant(
        &self,
        session: &UserSession,
        item: ItemId,
        grantee: UserId,
        options: GrantOptions,
    ) -> KeyResult<()> {
        session.ensure_current(self.keyrings.as_ref())?;
        let sharer = session.user();
        self.gate.require(sharer, item, AccessAction::Share).await?;

        let owner = self.gate.owner_of(item)?;
        let relation = self
            .gate
            .accepted_relation(sharer, owner, grantee, item)
            .await?;

        let sharer_row = if sharer == owner {
            self.wrapping.get(item, sharer)?
        } else {
            self.granted_row(item, owner, sharer, AuditAction::Share).await?
        };
        let dek = self.wrapping.unwrap(&sharer_row, session, AuditAction::Share)?;

        let keyring = self
            .keyrings
            .get_keyring(grantee)?
            .ok_or(KeyError::NotEnrolled(grantee))?;
        let sealed = KeyWrappingStore::seal_for(&dek, &PublicKey::from(keyring.public_key))?;
        drop(dek);

        let previous = self.wrapping.find(item, grantee)?;
        self.wrapping
            .put(&WrappedKey::new(item, grantee, sealed, keyring.generation))?;

        let grant = ActiveGrant {
            relation: relation.id,
            item,
            grantee,
            permission: options.permission,
            can_reshare: options.can_reshare,
        };
        if let Err(err) = self.call(self.relations.create_grant(grant)).await {
            warn!(%item, %grantee, error = %err, "grant creation failed, withdrawing wrapped key");
            match previous {
                Some(row) => self.wrapping.put(&row)?,
                None => {
                    self.wrapping.delete(item, grantee)?;
                }
            }
            return Err(err);
        }

        self.audit
            .record(sharer, item, AuditAction::Share, AuditOutcome::Succeeded)?;
        info!(%item, %sharer, %grantee, permission = ?options.permission, "granted item access");
        Ok(())
    }

    /// Withdraws `grantee`'s access: the grant is deactivated, then their
    /// wrapped key deleted. Plaintext they already read is out of reach.
    ///
    /// Returns whether a wrapped key was removed.
    pub async fn revoke(&self, session: &UserSession, item: ItemId, grantee: UserId) -> KeyResult<bool> {
        session.ensure_current(self.keyrings.as_ref())?;
        let caller = session.user();
        let owner = self.gate.owner_of(item)?;

        let refusal = if caller != owner {
            Some(DenyReason::NotOwner)
        } else if grantee == owner {
            Some(DenyReason::OwnerKey)
        } else {
            None
        };
        if let Some(reason) = refusal {
            self.audit.record(
                caller,
                item,
                AuditAction::Revoke,
                AuditOutcome::Denied(reason.to_string()),
            )?;
            return Err(KeyError::PermissionDenied(reason));
        }

        if let Some(relation) = self.call(self.relations.relation(owner, grantee)).await? {
            self.call(self.relations.deactivate_grant(relation.id, item))
                .await?;
        }
        let removed = self.wrapping.delete(item, grantee)?;

        self.audit
            .record(caller, item, AuditAction::Revoke, AuditOutcome::Succeeded)?;
        info!(%item, %grantee, removed, "revoked item access");
        Ok(removed)
    }

    /// Deactivates every grant on `item` and drops all of its wrapped keys.
    /// Used when the owner deletes the item; returns the rows removed.
    pub(crate) async fn withdraw_all(&self, owner: UserId, item: ItemId) -> KeyResult<usize> {
        for holder in self.holders(item)? {
            if holder == owner {
                continue;
            }
            if let Some(relation) = self.call(self.relations.relation(owner, holder)).await? {
                self.call(self.relations.deactivate_grant(relation.id, item))
                    .await?;
            }
        }
        self.wrapping.delete_item(item)
    }

    /// The wrapped key behind a grant the gate just honoured.
    ///
    /// A revoke that lands after the gate check deactivates the grant before
    /// deleting the key, so a missing key with no grant left is `KeyNotFound`.
    /// Only a missing key under a live grant is an invariant violation.
    pub(crate) async fn granted_row(
        &self,
        item: ItemId,
        owner: UserId,
        user: UserId,
        action: AuditAction,
    ) -> KeyResult<WrappedKey> {
        if let Some(row) = self.wrapping.find(item, user)? {
            return Ok(row);
        }
        if !self.gate.has_grant(user, owner, item).await {
            return Err(KeyError::KeyNotFound { item, user });
        }
        self.wrapping.get_granted(item, user, action)
    }

    /// Users holding a wrapped key for `item`, owner included.
    pub fn holders(&self, item: ItemId) -> KeyResult<Vec<UserId>> {
        Ok(self
            .wrapping
            .list_for_item(item)?
            .into_iter()
            .map(|row| row.user_id)
            .collect())
    }

    async fn call<T, F>(&self, call: F) -> KeyResult<T>
    where
        F: Future<Output = Result<T, DirectoryError>>,
    {
        match tokio::time::timeout(self.lookup_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DirectoryError::Timeout.into()),
        }
    }
}
