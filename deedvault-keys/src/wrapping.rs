//! Per-(item, user) wrapped DEKs.
//!
//! The store never holds an unwrapped DEK: rows go in wrapped and come out
//! wrapped, and unwrapping needs key material only a session carries.

use crate::audit::AccessAuditLog;
use crate::error::{KeyError, KeyResult};
use crate::session::UserSession;
use deedvault_crypto::{open_dek, seal_dek, unwrap_key, wrap_key, DerivedKey, PublicKey, UserKeyPair};
use deedvault_storage::{AuditAction, AuditOutcome, WrappedDek, WrappedKey, WrappedKeyRepository};
use deedvault_types::{ItemId, UserId};
use std::sync::Arc;

#[derive(Clone)]
pub struct KeyWrappingStore {
    rows: Arc<dyn WrappedKeyRepository>,
    audit: AccessAuditLog,
}

impl KeyWrappingStore {
    pub fn new(rows: Arc<dyn WrappedKeyRepository>, audit: AccessAuditLog) -> Self {
        Self { rows, audit }
    }

    /// Wraps `dek` under a KEK.
    pub fn wrap(dek: &DerivedKey, kek: &DerivedKey) -> KeyResult<WrappedDek> {
        Ok(WrappedDek::Kek {
            sealed: wrap_key(kek, dek.as_bytes())?,
        })
    }

    /// Seals `dek` to a recipient's public key. Needs nothing secret from
    /// the recipient.
    pub fn seal_for(dek: &DerivedKey, recipient: &PublicKey) -> KeyResult<WrappedDek> {
        Ok(WrappedDek::Sealed {
            envelope: seal_dek(dek.as_bytes(), recipient)?,
        })
    }

    /// Opens a wrapped DEK with explicit key material.
    pub fn open(dek: &WrappedDek, kek: &DerivedKey, keypair: &UserKeyPair) -> KeyResult<DerivedKey> {
        let opened = match dek {
            WrappedDek::Kek { sealed } => unwrap_key(kek, sealed),
            WrappedDek::Sealed { envelope } => open_dek(envelope, &keypair.secret),
        };
        Ok(opened?)
    }

    /// Unwraps a row with the holder's session. A failed tag check is
    /// audited before it is returned.
    ///
    /// A KEK row newer than the session was moved by a rotation that has
    /// not finished; it is refused without touching the cipher.
    pub fn unwrap(&self, row: &WrappedKey, session: &UserSession, action: AuditAction) -> KeyResult<DerivedKey> {
        if matches!(row.dek, WrappedDek::Kek { .. }) && row.generation > session.generation() {
            return Err(KeyError::RotationInProgress(row.user_id));
        }
        self.unwrap_with(row, session.kek(), session.keypair(), action)
    }

    pub(crate) fn unwrap_with(
        &self,
        row: &WrappedKey,
        kek: &DerivedKey,
        keypair: &UserKeyPair,
        action: AuditAction,
    ) -> KeyResult<DerivedKey> {
        match Self::open(&row.dek, kek, keypair) {
            Err(KeyError::AuthenticationFailure) => {
                self.audit.record(
                    row.user_id,
                    row.item_id,
                    action,
                    AuditOutcome::AuthenticationFailure,
                )?;
                Err(KeyError::AuthenticationFailure)
            }
            other => other,
        }
    }

    /// Inserts or replaces the row for `(row.item_id, row.user_id)`.
    pub fn put(&self, row: &WrappedKey) -> KeyResult<()> {
        Ok(self.rows.put_wrapped(row)?)
    }

    pub fn get(&self, item: ItemId, user: UserId) -> KeyResult<WrappedKey> {
        self.find(item, user)?
            .ok_or(KeyError::KeyNotFound { item, user })
    }

    pub fn find(&self, item: ItemId, user: UserId) -> KeyResult<Option<WrappedKey>> {
        Ok(self.rows.get_wrapped(item, user)?)
    }

    /// The row backing a grant the gate just honoured. A grant without a
    /// wrapped key is never repaired here: it is audited and refused.
    pub fn get_granted(&self, item: ItemId, user: UserId, action: AuditAction) -> KeyResult<WrappedKey> {
        if let Some(row) = self.find(item, user)? {
            return Ok(row);
        }
        let detail = format!("active grant for user {user} on item {item} has no wrapped key");
        self.audit.record(
            user,
            item,
            action,
            AuditOutcome::InvariantViolation(detail.clone()),
        )?;
        Err(KeyError::InvariantViolation(detail))
    }

    pub fn delete(&self, item: ItemId, user: UserId) -> KeyResult<bool> {
        Ok(self.rows.delete_wrapped(item, user)?)
    }

    pub fn list_for_item(&self, item: ItemId) -> KeyResult<Vec<WrappedKey>> {
        Ok(self.rows.list_for_item(item)?)
    }

    pub fn list_for_user(
        &self,
        user: UserId,
        after: Option<ItemId>,
        limit: usize,
    ) -> KeyResult<Vec<WrappedKey>> {
        Ok(self.rows.list_for_user(user, after, limit)?)
    }

    /// Removes every row for `item`.
    pub fn delete_item(&self, item: ItemId) -> KeyResult<usize> {
        Ok(self.rows.delete_for_item(item)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deedvault_crypto::{generate_keypair, generate_random_key};
    use deedvault_storage::{AuditSink, MemoryStore};

    fn store() -> (KeyWrappingStore, MemoryStore) {
        let mem = MemoryStore::new();
        let audit = AccessAuditLog::new(Arc::new(mem.clone()));
        (KeyWrappingStore::new(Arc::new(mem.clone()), audit), mem)
    }

    #[test]
    fn kek_and_sealed_rows_open_to_same_dek() {
        let dek = generate_random_key();
        let kek = generate_random_key();
        let keypair = generate_keypair();

        let by_kek = KeyWrappingStore::wrap(&dek, &kek).unwrap();
        let by_seal = KeyWrappingStore::seal_for(&dek, &keypair.public).unwrap();

        let a = KeyWrappingStore::open(&by_kek, &kek, &keypair).unwrap();
        let b = KeyWrappingStore::open(&by_seal, &kek, &keypair).unwrap();
        assert_eq!(a.as_bytes(), dek.as_bytes());
        assert_eq!(b.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn failed_unwrap_is_audited_once() {
        let (wrapping, mem) = store();
        let (item, user) = (ItemId::new(), UserId::new());
        let dek = generate_random_key();
        let row = WrappedKey::new(
            item,
            user,
            KeyWrappingStore::wrap(&dek, &generate_random_key()).unwrap(),
            0,
        );

        let err = wrapping
            .unwrap_with(&row, &generate_random_key(), &generate_keypair(), AuditAction::Read)
            .unwrap_err();
        assert!(matches!(err, KeyError::AuthenticationFailure));

        let records = mem.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.outcome, AuditOutcome::AuthenticationFailure);
    }

    #[test]
    fn get_missing_is_key_not_found() {
        let (wrapping, _) = store();
        let err = wrapping.get(ItemId::new(), UserId::new()).unwrap_err();
        assert!(matches!(err, KeyError::KeyNotFound { .. }));
    }
}
