//! Access control gate.
//!
//! Consulted before any wrapped key is touched. Owners are always allowed;
//! everyone else needs an accepted relation with the owner and an active
//! grant that covers the action. Lookups that time out or fail deny.

use crate::audit::AccessAuditLog;
use crate::directory::{ActiveGrant, DirectoryError, Relation, RelationDirectory};
use crate::error::{DenyReason, KeyError, KeyResult};
use deedvault_storage::{AuditAction, AuditOutcome, ItemRepository};
use deedvault_types::{AccessAction, ItemId, Permission, RelationStatus, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Where a non-owner stands with respect to one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessState {
    /// No relation with the owner, or a rejected one.
    NoRelation,
    Pending,
    AcceptedNoGrant,
    AcceptedRead,
    AcceptedWrite,
    Blocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Clone)]
pub struct AccessControlGate {
    items: Arc<dyn ItemRepository>,
    relations: Arc<dyn RelationDirectory>,
    audit: AccessAuditLog,
    lookup_timeout: Duration,
    allow_reshare: bool,
}

impl AccessControlGate {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        relations: Arc<dyn RelationDirectory>,
        audit: AccessAuditLog,
        lookup_timeout: Duration,
        allow_reshare: bool,
    ) -> Self {
        Self {
            items,
            relations,
            audit,
            lookup_timeout,
            allow_reshare,
        }
    }

    /// Decides whether `requester` may perform `action` on `item`, and
    /// audits the decision.
    pub async fn authorize(
        &self,
        requester: UserId,
        item: ItemId,
        action: AccessAction,
    ) -> KeyResult<Decision> {
        let owner = self.owner_of(item)?;
        let decision = self.decide(requester, owner, item, action).await;

        let outcome = match decision {
            Decision::Allow => AuditOutcome::Allowed,
            Decision::Deny(reason) => AuditOutcome::Denied(reason.to_string()),
        };
        self.audit
            .record(requester, item, audit_action(action), outcome)?;
        Ok(decision)
    }

    /// Like [`authorize`](Self::authorize), but a denial is an error.
    pub async fn require(&self, requester: UserId, item: ItemId, action: AccessAction) -> KeyResult<()> {
        match self.authorize(requester, item, action).await? {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(KeyError::PermissionDenied(reason)),
        }
    }

    /// Classifies a non-owner's standing on an item. Lookup failures come
    /// back as the deny reason they cause.
    pub async fn classify(
        &self,
        requester: UserId,
        owner: UserId,
        item: ItemId,
    ) -> Result<(AccessState, Option<ActiveGrant>), DenyReason> {
        let relation = self.lookup(self.relations.relation(requester, owner)).await?;
        let Some(relation) = relation else {
            return Ok((AccessState::NoRelation, None));
        };

        match relation.status {
            RelationStatus::Rejected => Ok((AccessState::NoRelation, None)),
            RelationStatus::Pending => Ok((AccessState::Pending, None)),
            RelationStatus::Blocked => Ok((AccessState::Blocked, None)),
            RelationStatus::Accepted => {
                let grant = self
                    .lookup(self.relations.active_grant(relation.id, item))
                    .await?
                    .filter(|g| g.grantee == requester);
                let state = match grant.as_ref().map(|g| g.permission) {
                    None => AccessState::AcceptedNoGrant,
                    Some(Permission::Read) => AccessState::AcceptedRead,
                    Some(Permission::Write) => AccessState::AcceptedWrite,
                };
                Ok((state, grant))
            }
        }
    }

    /// Whether `requester` still holds an active grant on `item`. Not
    /// audited; a failed lookup counts as no grant.
    pub(crate) async fn has_grant(&self, requester: UserId, owner: UserId, item: ItemId) -> bool {
        matches!(
            self.classify(requester, owner, item).await,
            Ok((AccessState::AcceptedRead | AccessState::AcceptedWrite, _))
        )
    }

    /// Confirms `grantee` has an accepted relation with the item's owner,
    /// returning it. A refusal is audited against `sharer`.
    pub async fn accepted_relation(
        &self,
        sharer: UserId,
        owner: UserId,
        grantee: UserId,
        item: ItemId,
    ) -> KeyResult<Relation> {
        let looked_up = self.lookup(self.relations.relation(owner, grantee)).await;
        let reason = match looked_up {
            Ok(Some(relation)) if relation.status == RelationStatus::Accepted => {
                return Ok(relation);
            }
            Ok(_) => DenyReason::GranteeNotConnected,
            Err(reason) => reason,
        };

        self.audit.record(
            sharer,
            item,
            AuditAction::Share,
            AuditOutcome::Denied(reason.to_string()),
        )?;
        Err(KeyError::PermissionDenied(reason))
    }

    /// Runs a directory call under the configured timeout.
    pub(crate) async fn lookup<T, F>(&self, call: F) -> Result<T, DenyReason>
    where
        F: Future<Output = Result<T, DirectoryError>>,
    {
        match tokio::time::timeout(self.lookup_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!(error = %err, "permission lookup failed");
                Err(DenyReason::LookupFailed)
            }
            Err(_) => {
                warn!(timeout_ms = self.lookup_timeout.as_millis() as u64, "permission lookup timed out");
                Err(DenyReason::LookupTimeout)
            }
        }
    }

    pub(crate) fn owner_of(&self, item: ItemId) -> KeyResult<UserId> {
        self.items
            .get_item(item)?
            .map(|i| i.owner)
            .ok_or(KeyError::ItemNotFound(item))
    }

    async fn decide(&self, requester: UserId, owner: UserId, item: ItemId, action: AccessAction) -> Decision {
        if requester == owner {
            return Decision::Allow;
        }
        if action == AccessAction::Share && !self.allow_reshare {
            return Decision::Deny(DenyReason::NotOwner);
        }

        let (state, grant) = match self.classify(requester, owner, item).await {
            Ok(classified) => classified,
            Err(reason) => return Decision::Deny(reason),
        };

        let permission = match (state, grant) {
            (AccessState::NoRelation, _) => return Decision::Deny(DenyReason::NoRelation),
            (AccessState::Pending, _) => return Decision::Deny(DenyReason::RelationPending),
            (AccessState::Blocked, _) => return Decision::Deny(DenyReason::Blocked),
            (_, None) => return Decision::Deny(DenyReason::NoGrant),
            (_, Some(grant)) => grant,
        };

        match action {
            AccessAction::Share if permission.can_reshare => Decision::Allow,
            AccessAction::Share => Decision::Deny(DenyReason::ReshareNotPermitted),
            _ if permission.permission.permits(action) => Decision::Allow,
            _ => Decision::Deny(DenyReason::InsufficientPermission),
        }
    }
}

fn audit_action(action: AccessAction) -> AuditAction {
    match action {
        AccessAction::Read => AuditAction::Read,
        AccessAction::Write => AuditAction::Write,
        AccessAction::Share => AuditAction::Share,
    }
}
