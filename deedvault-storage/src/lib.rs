//! Persistence for DeedVault key material.
//!
//! Holds the at-rest layout of encrypted items, wrapped data keys, user
//! keyrings, rotation cursors and the access audit log, plus the repository
//! traits the key service is written against.
//!
//! # Backends
//!
//! - [`MemoryStore`]: mutex-guarded maps, for tests and embedding
//! - [`DuckDbStore`]: a single DuckDB file, one statement per operation
//!
//! No backend can decrypt anything it stores: DEKs are only ever present
//! wrapped, and private keys only under their owner's KEK.

mod duckdb_store;
mod error;
mod memory;
mod model;
mod repository;

pub use duckdb_store::DuckDbStore;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use model::{
    AuditAction, AuditEntry, AuditOutcome, AuditRecord, EncryptedItem, RecoveryKit,
    PendingKek, RotationCursor, UserKeyring, WrapScheme, WrappedDek, WrappedKey,
};
pub use repository::{
    AuditSink, ItemRepository, KeyStore, KeyringRepository, RotationCursorRepository,
    WrappedKeyRepository,
};

/// Open a DuckDB connection with stale WAL recovery and resource limits.
///
/// If the initial open fails and a `.wal` file exists alongside the database,
/// it is removed and the open is retried once. An unclean shutdown can leave
/// a WAL behind that prevents reopening.
pub fn open_duckdb_with_wal_recovery(
    path: &std::path::Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<duckdb::Connection> {
    let conn = match duckdb::Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                tracing::warn!(
                    wal = %wal_path.display(),
                    error = %first_err,
                    "DuckDB open failed, removing stale WAL and retrying"
                );
                if std::fs::remove_file(&wal_path).is_ok() {
                    let c = duckdb::Connection::open(path)?;
                    apply_resource_limits(&c, memory_limit, threads)?;
                    return Ok(c);
                }
            }
            return Err(first_err.into());
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

fn apply_resource_limits(
    conn: &duckdb::Connection,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{memory_limit}'; PRAGMA threads={threads};"
    ))?;
    Ok(())
}
