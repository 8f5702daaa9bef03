//! In-memory backend. Used by tests and by embedders that keep their own
//! persistence elsewhere.

use crate::error::{StorageError, StorageResult};
use crate::model::{AuditEntry, AuditRecord, EncryptedItem, RotationCursor, UserKeyring, WrappedKey};
use crate::repository::{
    AuditSink, ItemRepository, KeyringRepository, RotationCursorRepository, WrappedKeyRepository,
};
use deedvault_types::{ItemId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    items: HashMap<ItemId, EncryptedItem>,
    // Keyed user-first so one user's rows form a contiguous, item-ordered range.
    wrapped: BTreeMap<(UserId, ItemId), WrappedKey>,
    keyrings: HashMap<UserId, UserKeyring>,
    cursors: HashMap<UserId, RotationCursor>,
    audit: Vec<AuditRecord>,
}

/// Every repository trait over one mutex-guarded set of maps.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Number of wrapped-key rows across all users.
    pub fn wrapped_key_count(&self) -> StorageResult<usize> {
        Ok(self.lock()?.wrapped.len())
    }
}

impl ItemRepository for MemoryStore {
    fn put_item(&self, item: &EncryptedItem) -> StorageResult<()> {
        self.lock()?.items.insert(item.id, item.clone());
        Ok(())
    }

    fn get_item(&self, id: ItemId) -> StorageResult<Option<EncryptedItem>> {
        Ok(self.lock()?.items.get(&id).cloned())
    }

    fn delete_item(&self, id: ItemId) -> StorageResult<bool> {
        Ok(self.lock()?.items.remove(&id).is_some())
    }
}

impl WrappedKeyRepository for MemoryStore {
    fn put_wrapped(&self, key: &WrappedKey) -> StorageResult<()> {
        self.lock()?
            .wrapped
            .insert((key.user_id, key.item_id), key.clone());
        Ok(())
    }

    fn get_wrapped(&self, item: ItemId, user: UserId) -> StorageResult<Option<WrappedKey>> {
        Ok(self.lock()?.wrapped.get(&(user, item)).cloned())
    }

    fn delete_wrapped(&self, item: ItemId, user: UserId) -> StorageResult<bool> {
        Ok(self.lock()?.wrapped.remove(&(user, item)).is_some())
    }

    fn list_for_item(&self, item: ItemId) -> StorageResult<Vec<WrappedKey>> {
        Ok(self
            .lock()?
            .wrapped
            .values()
            .filter(|k| k.item_id == item)
            .cloned()
            .collect())
    }

    fn list_for_user(
        &self,
        user: UserId,
        after: Option<ItemId>,
        limit: usize,
    ) -> StorageResult<Vec<WrappedKey>> {
        let lower = match after {
            Some(item) => Bound::Excluded((user, item)),
            None => Bound::Included((user, ItemId::from_uuid(Uuid::nil()))),
        };
        Ok(self
            .lock()?
            .wrapped
            .range((lower, Bound::Unbounded))
            .take_while(|((owner, _), _)| *owner == user)
            .take(limit)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn delete_for_item(&self, item: ItemId) -> StorageResult<usize> {
        let mut tables = self.lock()?;
        let before = tables.wrapped.len();
        tables.wrapped.retain(|(_, row_item), _| *row_item != item);
        Ok(before - tables.wrapped.len())
    }
}

impl KeyringRepository for MemoryStore {
    fn put_keyring(&self, keyring: &UserKeyring) -> StorageResult<()> {
        self.lock()?.keyrings.insert(keyring.user_id, keyring.clone());
        Ok(())
    }

    fn get_keyring(&self, user: UserId) -> StorageResult<Option<UserKeyring>> {
        Ok(self.lock()?.keyrings.get(&user).cloned())
    }
}

impl RotationCursorRepository for MemoryStore {
    fn put_cursor(&self, cursor: &RotationCursor) -> StorageResult<()> {
        self.lock()?.cursors.insert(cursor.user_id, cursor.clone());
        Ok(())
    }

    fn get_cursor(&self, user: UserId) -> StorageResult<Option<RotationCursor>> {
        Ok(self.lock()?.cursors.get(&user).cloned())
    }

    fn clear_cursor(&self, user: UserId) -> StorageResult<()> {
        self.lock()?.cursors.remove(&user);
        Ok(())
    }
}

impl AuditSink for MemoryStore {
    fn append(&self, entry: AuditEntry) -> StorageResult<u64> {
        let mut tables = self.lock()?;
        let seq = tables.audit.last().map_or(1, |r| r.seq + 1);
        tables.audit.push(AuditRecord { seq, entry });
        Ok(seq)
    }

    fn records(&self) -> StorageResult<Vec<AuditRecord>> {
        Ok(self.lock()?.audit.clone())
    }
}
