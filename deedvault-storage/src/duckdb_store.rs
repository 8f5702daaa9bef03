//! DuckDB backend.
//!
//! One connection behind a mutex; every trait method is a single statement,
//! which is what makes per-row operations atomic here. Wrapped DEKs and
//! keyring extras are stored as serde JSON in BLOB columns, item contents as
//! separate nonce, body and tag columns.

use crate::error::{StorageError, StorageResult};
use crate::model::{
    AuditAction, AuditEntry, AuditOutcome, AuditRecord, EncryptedItem, RecoveryKit,
    RotationCursor, UserKeyring, WrappedDek, WrappedKey,
};
use crate::repository::{
    AuditSink, ItemRepository, KeyringRepository, RotationCursorRepository, WrappedKeyRepository,
};
use chrono::{DateTime, Utc};
use deedvault_crypto::{EncryptedData, NONCE_SIZE, TAG_SIZE, X25519_KEY_SIZE};
use deedvault_types::{ItemId, UserId};
use duckdb::{params, Connection, OptionalExt};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

const ITEM_COLUMNS: &str = "id, owner_id, data_class, nonce, ciphertext, tag, created_at";
const WRAPPED_COLUMNS: &str = "item_id, user_id, payload, generation, created_at";
const KEYRING_COLUMNS: &str =
    "user_id, public_key, wrapped_private_key, generation, recovery_kit, created_at, updated_at";
const CURSOR_COLUMNS: &str =
    "user_id, target_generation, last_item_id, rewrapped, skipped, started_at, pending";
const AUDIT_COLUMNS: &str = "seq, user_id, item_id, action, outcome, detail, \"at\"";

/// Persistent key store backed by DuckDB.
#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_duckdb_with_wal_recovery(path, "128MB", 1)?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

// ── Items ──

type ItemRow = (String, String, String, Vec<u8>, Vec<u8>, Vec<u8>, i64);

fn read_item_row(row: &duckdb::Row<'_>) -> duckdb::Result<ItemRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn item_from_row(row: ItemRow) -> StorageResult<EncryptedItem> {
    const TABLE: &str = "encrypted_items";
    let (id, owner, class, nonce, body, tag, created_at) = row;
    let nonce: [u8; NONCE_SIZE] = fixed(TABLE, "nonce", &nonce)?;
    let tag: [u8; TAG_SIZE] = fixed(TABLE, "tag", &tag)?;

    Ok(EncryptedItem {
        id: parse_id(TABLE, &id)?,
        owner: parse_id(TABLE, &owner)?,
        class: class
            .parse()
            .map_err(|e| StorageError::corrupt(TABLE, format!("{e}")))?,
        content: EncryptedData::from_parts(nonce, &body, &tag),
        created_at: from_millis(TABLE, created_at)?,
    })
}

impl ItemRepository for DuckDbStore {
    fn put_item(&self, item: &EncryptedItem) -> StorageResult<()> {
        let tag = item
            .content
            .tag()
            .ok_or_else(|| StorageError::corrupt("encrypted_items", "ciphertext shorter than tag"))?;

        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO encrypted_items ({ITEM_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                item.id.to_string(),
                item.owner.to_string(),
                item.class.as_str(),
                item.content.nonce.to_vec(),
                item.content.body().to_vec(),
                tag.to_vec(),
                item.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get_item(&self, id: ItemId) -> StorageResult<Option<EncryptedItem>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM encrypted_items WHERE id = ?"),
                params![id.to_string()],
                read_item_row,
            )
            .optional()?;
        row.map(item_from_row).transpose()
    }

    fn delete_item(&self, id: ItemId) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM encrypted_items WHERE id = ?",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }
}

// ── Wrapped keys ──

type WrappedRow = (String, String, Vec<u8>, i64, i64);

fn read_wrapped_row(row: &duckdb::Row<'_>) -> duckdb::Result<WrappedRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn wrapped_from_row(row: WrappedRow) -> StorageResult<WrappedKey> {
    const TABLE: &str = "wrapped_keys";
    let (item_id, user_id, payload, generation, created_at) = row;
    let dek: WrappedDek = serde_json::from_slice(&payload)?;
    Ok(WrappedKey {
        item_id: parse_id(TABLE, &item_id)?,
        user_id: parse_id(TABLE, &user_id)?,
        dek,
        generation: generation as u64,
        created_at: from_millis(TABLE, created_at)?,
    })
}

impl DuckDbStore {
    fn query_wrapped(
        &self,
        sql: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> StorageResult<Vec<WrappedKey>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, read_wrapped_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(wrapped_from_row).collect()
    }
}

impl WrappedKeyRepository for DuckDbStore {
    fn put_wrapped(&self, key: &WrappedKey) -> StorageResult<()> {
        let payload = serde_json::to_vec(&key.dek)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO wrapped_keys ({WRAPPED_COLUMNS}, scheme) VALUES (?, ?, ?, ?, ?, ?)"
            ),
            params![
                key.item_id.to_string(),
                key.user_id.to_string(),
                payload,
                key.generation as i64,
                key.created_at.timestamp_millis(),
                key.dek.scheme().as_str(),
            ],
        )?;
        Ok(())
    }

    fn get_wrapped(&self, item: ItemId, user: UserId) -> StorageResult<Option<WrappedKey>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {WRAPPED_COLUMNS} FROM wrapped_keys WHERE item_id = ? AND user_id = ?"
                ),
                params![item.to_string(), user.to_string()],
                read_wrapped_row,
            )
            .optional()?;
        row.map(wrapped_from_row).transpose()
    }

    fn delete_wrapped(&self, item: ItemId, user: UserId) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM wrapped_keys WHERE item_id = ? AND user_id = ?",
            params![item.to_string(), user.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn list_for_item(&self, item: ItemId) -> StorageResult<Vec<WrappedKey>> {
        self.query_wrapped(
            &format!("SELECT {WRAPPED_COLUMNS} FROM wrapped_keys WHERE item_id = ? ORDER BY user_id"),
            params![item.to_string()],
        )
    }

    fn list_for_user(
        &self,
        user: UserId,
        after: Option<ItemId>,
        limit: usize,
    ) -> StorageResult<Vec<WrappedKey>> {
        // Hyphenated lowercase UUIDs sort the same as their bytes, so string
        // order matches `ItemId` order.
        let limit = limit as i64;
        match after {
            Some(after) => self.query_wrapped(
                &format!(
                    "SELECT {WRAPPED_COLUMNS} FROM wrapped_keys \
                     WHERE user_id = ? AND item_id > ? ORDER BY item_id LIMIT ?"
                ),
                params![user.to_string(), after.to_string(), limit],
            ),
            None => self.query_wrapped(
                &format!(
                    "SELECT {WRAPPED_COLUMNS} FROM wrapped_keys \
                     WHERE user_id = ? ORDER BY item_id LIMIT ?"
                ),
                params![user.to_string(), limit],
            ),
        }
    }

    fn delete_for_item(&self, item: ItemId) -> StorageResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM wrapped_keys WHERE item_id = ?",
            params![item.to_string()],
        )?;
        Ok(removed)
    }
}

// ── Keyrings ──

type KeyringRow = (String, Vec<u8>, Vec<u8>, i64, Option<Vec<u8>>, i64, i64);

fn keyring_from_row(row: KeyringRow) -> StorageResult<UserKeyring> {
    const TABLE: &str = "user_keyrings";
    let (user_id, public_key, wrapped_private_key, generation, recovery_kit, created, updated) =
        row;
    let recovery_kit: Option<RecoveryKit> = recovery_kit
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?;

    Ok(UserKeyring {
        user_id: parse_id(TABLE, &user_id)?,
        public_key: fixed::<X25519_KEY_SIZE>(TABLE, "public_key", &public_key)?,
        wrapped_private_key: serde_json::from_slice(&wrapped_private_key)?,
        generation: generation as u64,
        recovery_kit,
        created_at: from_millis(TABLE, created)?,
        updated_at: from_millis(TABLE, updated)?,
    })
}

impl KeyringRepository for DuckDbStore {
    fn put_keyring(&self, keyring: &UserKeyring) -> StorageResult<()> {
        let wrapped_private_key = serde_json::to_vec(&keyring.wrapped_private_key)?;
        let recovery_kit = keyring
            .recovery_kit
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO user_keyrings ({KEYRING_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                keyring.user_id.to_string(),
                keyring.public_key.to_vec(),
                wrapped_private_key,
                keyring.generation as i64,
                recovery_kit,
                keyring.created_at.timestamp_millis(),
                keyring.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get_keyring(&self, user: UserId) -> StorageResult<Option<UserKeyring>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {KEYRING_COLUMNS} FROM user_keyrings WHERE user_id = ?"),
                params![user.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        row.map(keyring_from_row).transpose()
    }
}

// ── Rotation cursors ──

impl RotationCursorRepository for DuckDbStore {
    fn put_cursor(&self, cursor: &RotationCursor) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO rotation_cursors ({CURSOR_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                cursor.user_id.to_string(),
                cursor.target_generation as i64,
                cursor.last_item.map(|id| id.to_string()),
                cursor.rewrapped as i64,
                cursor.skipped as i64,
                cursor.started_at.timestamp_millis(),
                serde_json::to_vec(&cursor.pending)?,
            ],
        )?;
        Ok(())
    }

    fn get_cursor(&self, user: UserId) -> StorageResult<Option<RotationCursor>> {
        const TABLE: &str = "rotation_cursors";
        let conn = self.lock()?;
        let row: Option<(String, i64, Option<String>, i64, i64, i64, Vec<u8>)> = conn
            .query_row(
                &format!("SELECT {CURSOR_COLUMNS} FROM rotation_cursors WHERE user_id = ?"),
                params![user.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(user_id, target, last_item, rewrapped, skipped, started, pending)| {
            Ok(RotationCursor {
                user_id: parse_id(TABLE, &user_id)?,
                target_generation: target as u64,
                pending: serde_json::from_slice(&pending)?,
                last_item: last_item.map(|id| parse_id(TABLE, &id)).transpose()?,
                rewrapped: rewrapped as u64,
                skipped: skipped as u64,
                started_at: from_millis(TABLE, started)?,
            })
        })
        .transpose()
    }

    fn clear_cursor(&self, user: UserId) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM rotation_cursors WHERE user_id = ?",
            params![user.to_string()],
        )?;
        Ok(())
    }
}

// ── Audit log ──

type AuditRow = (i64, String, Option<String>, String, String, Option<String>, i64);

fn audit_from_row(row: AuditRow) -> StorageResult<AuditRecord> {
    const TABLE: &str = "audit_log";
    let (seq, user_id, item_id, action, outcome, detail, at) = row;
    Ok(AuditRecord {
        seq: seq as u64,
        entry: AuditEntry {
            user_id: parse_id(TABLE, &user_id)?,
            item_id: item_id.map(|id| parse_id(TABLE, &id)).transpose()?,
            action: AuditAction::parse(&action)
                .ok_or_else(|| StorageError::corrupt(TABLE, format!("unknown action {action}")))?,
            outcome: AuditOutcome::from_parts(&outcome, detail)
                .ok_or_else(|| StorageError::corrupt(TABLE, format!("unknown outcome {outcome}")))?,
            at: from_millis(TABLE, at)?,
        },
    })
}

impl AuditSink for DuckDbStore {
    fn append(&self, entry: AuditEntry) -> StorageResult<u64> {
        let conn = self.lock()?;
        // Sequence assignment and insert happen under the same lock.
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log",
            [],
            |row| row.get(0),
        )?;
        conn.execute(
            &format!("INSERT INTO audit_log ({AUDIT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                seq,
                entry.user_id.to_string(),
                entry.item_id.map(|id| id.to_string()),
                entry.action.as_str(),
                entry.outcome.tag(),
                entry.outcome.detail(),
                entry.at.timestamp_millis(),
            ],
        )?;
        Ok(seq as u64)
    }

    fn records(&self) -> StorageResult<Vec<AuditRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY seq"))?;
        let rows = stmt
            .query_map([], read_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(audit_from_row).collect()
    }

    fn records_for_item(&self, item: ItemId) -> StorageResult<Vec<AuditRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE item_id = ? ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![item.to_string()], read_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(audit_from_row).collect()
    }

    fn records_for_user(&self, user: UserId) -> StorageResult<Vec<AuditRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE user_id = ? ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![user.to_string()], read_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(audit_from_row).collect()
    }
}

fn read_audit_row(row: &duckdb::Row<'_>) -> duckdb::Result<AuditRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

// ── Helpers ──

fn parse_id<T: FromStr>(table: &'static str, raw: &str) -> StorageResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StorageError::corrupt(table, format!("bad id {raw:?}: {e}")))
}

fn fixed<const N: usize>(
    table: &'static str,
    column: &str,
    bytes: &[u8],
) -> StorageResult<[u8; N]> {
    bytes.try_into().map_err(|_| {
        StorageError::corrupt(
            table,
            format!("{column} is {} bytes, expected {N}", bytes.len()),
        )
    })
}

fn from_millis(table: &'static str, millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::corrupt(table, format!("timestamp out of range: {millis}")))
}

fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS encrypted_items (
            id VARCHAR PRIMARY KEY,
            owner_id VARCHAR NOT NULL,
            data_class VARCHAR NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            tag BLOB NOT NULL,
            created_at BIGINT NOT NULL
        );

        -- One wrapped DEK per (item, user). INSERT OR REPLACE makes a repeat
        -- grant overwrite instead of duplicating.
        CREATE TABLE IF NOT EXISTS wrapped_keys (
            item_id VARCHAR NOT NULL,
            user_id VARCHAR NOT NULL,
            payload BLOB NOT NULL,
            generation BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            scheme VARCHAR NOT NULL,
            PRIMARY KEY (item_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS user_keyrings (
            user_id VARCHAR PRIMARY KEY,
            public_key BLOB NOT NULL,
            wrapped_private_key BLOB NOT NULL,
            generation BIGINT NOT NULL,
            recovery_kit BLOB,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rotation_cursors (
            user_id VARCHAR PRIMARY KEY,
            target_generation BIGINT NOT NULL,
            last_item_id VARCHAR,
            rewrapped BIGINT NOT NULL,
            skipped BIGINT NOT NULL,
            started_at BIGINT NOT NULL,
            pending BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            seq BIGINT PRIMARY KEY,
            user_id VARCHAR NOT NULL,
            item_id VARCHAR,
            action VARCHAR NOT NULL,
            outcome VARCHAR NOT NULL,
            detail VARCHAR,
            "at" BIGINT NOT NULL
        );
        "#,
    )?;
    tracing::debug!("key store schema ready");
    Ok(())
}
