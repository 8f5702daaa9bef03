//! Repository traits the key service is written against.
//!
//! All methods are synchronous and every single-row operation is atomic, so
//! a reader racing a delete sees either the whole row or nothing.

use crate::error::StorageResult;
use crate::model::{AuditEntry, AuditRecord, EncryptedItem, RotationCursor, UserKeyring, WrappedKey};
use deedvault_types::{ItemId, UserId};

pub trait ItemRepository: Send + Sync {
    fn put_item(&self, item: &EncryptedItem) -> StorageResult<()>;

    fn get_item(&self, id: ItemId) -> StorageResult<Option<EncryptedItem>>;

    /// Returns whether a row was removed.
    fn delete_item(&self, id: ItemId) -> StorageResult<bool>;
}

pub trait WrappedKeyRepository: Send + Sync {
    /// Inserts or replaces the row for `(key.item_id, key.user_id)`.
    fn put_wrapped(&self, key: &WrappedKey) -> StorageResult<()>;

    fn get_wrapped(&self, item: ItemId, user: UserId) -> StorageResult<Option<WrappedKey>>;

    /// Returns whether a row was removed.
    fn delete_wrapped(&self, item: ItemId, user: UserId) -> StorageResult<bool>;

    fn list_for_item(&self, item: ItemId) -> StorageResult<Vec<WrappedKey>>;

    /// Rows held by `user` ordered by item id, starting strictly after
    /// `after`. Used to page through a user's keys during rotation.
    fn list_for_user(
        &self,
        user: UserId,
        after: Option<ItemId>,
        limit: usize,
    ) -> StorageResult<Vec<WrappedKey>>;

    /// Removes every row for `item`, returning how many went.
    fn delete_for_item(&self, item: ItemId) -> StorageResult<usize>;
}

pub trait KeyringRepository: Send + Sync {
    fn put_keyring(&self, keyring: &UserKeyring) -> StorageResult<()>;

    fn get_keyring(&self, user: UserId) -> StorageResult<Option<UserKeyring>>;
}

pub trait RotationCursorRepository: Send + Sync {
    fn put_cursor(&self, cursor: &RotationCursor) -> StorageResult<()>;

    fn get_cursor(&self, user: UserId) -> StorageResult<Option<RotationCursor>>;

    fn clear_cursor(&self, user: UserId) -> StorageResult<()>;
}

/// Append-only audit destination.
pub trait AuditSink: Send + Sync {
    /// Appends an entry and returns the sequence number it was given.
    fn append(&self, entry: AuditEntry) -> StorageResult<u64>;

    /// All records in sequence order.
    fn records(&self) -> StorageResult<Vec<AuditRecord>>;

    fn records_for_item(&self, item: ItemId) -> StorageResult<Vec<AuditRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.entry.item_id == Some(item))
            .collect())
    }

    fn records_for_user(&self, user: UserId) -> StorageResult<Vec<AuditRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.entry.user_id == user)
            .collect())
    }
}

/// Everything the key service persists, behind one handle.
pub trait KeyStore:
    ItemRepository + WrappedKeyRepository + KeyringRepository + RotationCursorRepository + AuditSink
{
}

impl<T> KeyStore for T where
    T: ItemRepository
        + WrappedKeyRepository
        + KeyringRepository
        + RotationCursorRepository
        + AuditSink
{
}
