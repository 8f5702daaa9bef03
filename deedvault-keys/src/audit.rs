//! Access audit log.
//!
//! Every gate decision and every failed unwrap, decrypt or unlock lands here
//! exactly once, and is mirrored to `tracing` so operators see it without querying
//! the sink.

use crate::error::KeyResult;
use chrono::Utc;
use deedvault_storage::{AuditAction, AuditEntry, AuditOutcome, AuditRecord, AuditSink};
use deedvault_types::{ItemId, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AccessAuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AccessAuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Appends one record and returns its sequence number.
    pub fn record(
        &self,
        user: UserId,
        item: ItemId,
        action: AuditAction,
        outcome: AuditOutcome,
    ) -> KeyResult<u64> {
        self.append(user, Some(item), action, outcome)
    }

    /// Records an event tied to a user rather than an item: unlocks,
    /// rotations and recoveries.
    pub fn record_for_user(
        &self,
        user: UserId,
        action: AuditAction,
        outcome: AuditOutcome,
    ) -> KeyResult<u64> {
        self.append(user, None, action, outcome)
    }

    fn append(
        &self,
        user: UserId,
        item: Option<ItemId>,
        action: AuditAction,
        outcome: AuditOutcome,
    ) -> KeyResult<u64> {
        let entry = AuditEntry {
            user_id: user,
            item_id: item,
            action,
            outcome,
            at: Utc::now(),
        };
        emit(&entry);
        Ok(self.sink.append(entry)?)
    }

    pub fn records(&self) -> KeyResult<Vec<AuditRecord>> {
        Ok(self.sink.records()?)
    }

    pub fn records_for_item(&self, item: ItemId) -> KeyResult<Vec<AuditRecord>> {
        Ok(self.sink.records_for_item(item)?)
    }

    pub fn records_for_user(&self, user: UserId) -> KeyResult<Vec<AuditRecord>> {
        Ok(self.sink.records_for_user(user)?)
    }
}

fn emit(entry: &AuditEntry) {
    let (user, action) = (entry.user_id, entry.action);
    let item = entry
        .item_id
        .map_or_else(|| "-".to_owned(), |id| id.to_string());
    match &entry.outcome {
        AuditOutcome::Allowed | AuditOutcome::Succeeded => {
            debug!(%user, %item, %action, outcome = %entry.outcome, "access audit");
        }
        AuditOutcome::Denied(reason) => {
            info!(%user, %item, %action, %reason, "access denied");
        }
        AuditOutcome::AuthenticationFailure => {
            warn!(%user, %item, %action, "authentication failure");
        }
        AuditOutcome::InvariantViolation(detail) => {
            warn!(%user, %item, %action, %detail, "key invariant violated");
        }
    }
}
