//! Credential rotation.
//!
//! When a user's credential changes, every wrapped DEK they hold is moved
//! from the old KEK to the new one. Work is chunked and the position is
//! persisted after every chunk, so a crashed rotation resumes where it
//! stopped. Rows already at the target generation are skipped.
//!
//! The cursor also keeps each new KEK wrapped under the old one. A resume
//! that names a different new credential can therefore still open rows an
//! earlier run moved, and carries them over to the credential it was given.

use crate::audit::AccessAuditLog;
use crate::directory::UserDirectory;
use crate::error::{KeyError, KeyResult};
use crate::kdf::KdfPool;
use crate::session::UserSession;
use crate::wrapping::KeyWrappingStore;
use chrono::Utc;
use deedvault_crypto::{
    decrypt_private_key, encrypt_private_key, unwrap_key, wrap_key, DerivedKey, UserKeyPair,
    X25519_KEY_SIZE,
};
use deedvault_storage::{
    AuditAction, AuditOutcome, KeyringRepository, PendingKek, RotationCursor,
    RotationCursorRepository, WrappedDek, WrappedKey,
};
use deedvault_types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of a rotation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationReport {
    /// Keyring generation after the run.
    pub generation: u64,
    pub rewrapped: u64,
    pub skipped: u64,
    /// Picked up a cursor left by an earlier run.
    pub resumed: bool,
}

#[derive(Clone)]
pub struct KeyRotationManager {
    keyrings: Arc<dyn KeyringRepository>,
    cursors: Arc<dyn RotationCursorRepository>,
    users: Arc<dyn UserDirectory>,
    wrapping: KeyWrappingStore,
    audit: AccessAuditLog,
    kdf: KdfPool,
    batch_size: usize,
    locks: Arc<Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyRotationManager {
    pub fn new(
        keyrings: Arc<dyn KeyringRepository>,
        cursors: Arc<dyn RotationCursorRepository>,
        users: Arc<dyn UserDirectory>,
        wrapping: KeyWrappingStore,
        audit: AccessAuditLog,
        kdf: KdfPool,
        batch_size: usize,
    ) -> Self {
        Self {
            keyrings,
            cursors,
            users,
            wrapping,
            audit,
            kdf,
            batch_size,
            locks: Arc::default(),
        }
    }

    /// Re-wraps all of `user`'s keys from the old credential's KEK to the
    /// new one's. Calling it again after an interruption finishes the job.
    pub async fn rotate(
        &self,
        user: UserId,
        old_credential: &str,
        new_credential: &str,
    ) -> KeyResult<RotationReport> {
        let salt = self.users.salt(user)?;
        let iterations = self.users.iteration_count(user)?;

        let old_kek = self.kdf.derive_kek(old_credential, &salt, iterations).await?;
        let new_kek = self.kdf.derive_kek(new_credential, &salt, iterations).await?;
        self.rotate_with_keys(user, &old_kek, &new_kek).await
    }

    /// Rotation once both KEKs are in hand. Recovery enters here with the
    /// KEK taken from the recovery kit.
    pub(crate) async fn rotate_with_keys(
        &self,
        user: UserId,
        old_kek: &DerivedKey,
        new_kek: &DerivedKey,
    ) -> KeyResult<RotationReport> {
        let lock = self.user_lock(user)?;
        let _guard = lock.lock().await;

        let mut keyring = self
            .keyrings
            .get_keyring(user)?
            .ok_or(KeyError::NotEnrolled(user))?;

        let keypair = match decrypt_private_key(&keyring.wrapped_private_key, old_kek) {
            Ok(keypair) => keypair,
            Err(err) => {
                // A run that stored the new keyring but died before clearing
                // its cursor has already finished.
                if decrypt_private_key(&keyring.wrapped_private_key, new_kek).is_ok() {
                    self.cursors.clear_cursor(user)?;
                    debug!(%user, generation = keyring.generation, "rotation already complete");
                    return Ok(RotationReport {
                        generation: keyring.generation,
                        rewrapped: 0,
                        skipped: 0,
                        resumed: true,
                    });
                }
                warn!(%user, "rotation refused: old credential does not open keyring");
                self.audit
                    .record_for_user(user, AuditAction::Rotate, AuditOutcome::AuthenticationFailure)?;
                return Err(err.into());
            }
        };

        let pending = PendingKek {
            wrapped: wrap_key(old_kek, new_kek.as_bytes())?,
            check: wrap_key(new_kek, &keyring.public_key)?,
        };
        let (mut cursor, resumed) = match self.cursors.get_cursor(user)? {
            Some(mut cursor) if cursor.target_generation > keyring.generation => {
                let same_credential = cursor
                    .pending
                    .last()
                    .is_some_and(|p| opens_check(&p.check, new_kek, &keyring.public_key));
                if !same_credential {
                    // Start the pass over; rows moved so far stay reachable
                    // through the earlier pending KEKs.
                    info!(%user, "rotation resumed with a different new credential");
                    cursor.pending.push(pending);
                    cursor.last_item = None;
                }
                (cursor, true)
            }
            _ => (
                RotationCursor::start(user, keyring.generation + 1, pending),
                false,
            ),
        };
        self.cursors.put_cursor(&cursor)?;

        let superseded = cursor
            .pending
            .split_last()
            .map_or(&[][..], |(_, earlier)| earlier)
            .iter()
            .map(|p| unwrap_key(old_kek, &p.wrapped))
            .collect::<Result<Vec<_>, _>>()?;
        let keys = RewrapKeys {
            old: old_kek,
            new: new_kek,
            superseded: &superseded,
            keypair: &keypair,
        };
        info!(
            %user,
            target = cursor.target_generation,
            resumed,
            "rotation started"
        );

        loop {
            let page = self
                .wrapping
                .list_for_user(user, cursor.last_item, self.batch_size)?;
            let Some(last) = page.last().map(|row| row.item_id) else {
                break;
            };

            for row in &page {
                if self.rewrap(row, &keys, cursor.target_generation)? {
                    cursor.rewrapped += 1;
                } else {
                    cursor.skipped += 1;
                }
            }

            cursor.last_item = Some(last);
            self.cursors.put_cursor(&cursor)?;
            debug!(%user, chunk = page.len(), rewrapped = cursor.rewrapped, "rotation chunk done");
            tokio::task::yield_now().await;
        }

        keyring.wrapped_private_key = encrypt_private_key(&keypair.secret, new_kek)?;
        keyring.generation = cursor.target_generation;
        keyring.updated_at = Utc::now();
        self.keyrings.put_keyring(&keyring)?;
        self.cursors.clear_cursor(user)?;

        info!(
            %user,
            generation = keyring.generation,
            rewrapped = cursor.rewrapped,
            skipped = cursor.skipped,
            "rotation finished"
        );
        Ok(RotationReport {
            generation: keyring.generation,
            rewrapped: cursor.rewrapped,
            skipped: cursor.skipped,
            resumed,
        })
    }

    /// Converts rows sealed to the session's user into KEK rows, without a
    /// credential change. Returns how many were converted.
    pub async fn claim_sealed(&self, session: &UserSession) -> KeyResult<u64> {
        let user = session.user();
        let lock = self.user_lock(user)?;
        let _guard = lock.lock().await;
        session.ensure_current(self.keyrings.as_ref())?;
        self.ensure_idle(user)?;

        let mut claimed = 0;
        let mut after = None;
        loop {
            let page = self.wrapping.list_for_user(user, after, self.batch_size)?;
            let Some(last) = page.last().map(|row| row.item_id) else {
                break;
            };
            for row in page.iter().filter(|r| matches!(r.dek, WrappedDek::Sealed { .. })) {
                let dek = self.wrapping.unwrap(row, session, AuditAction::Unwrap)?;
                self.wrapping.put(&WrappedKey {
                    dek: KeyWrappingStore::wrap(&dek, session.kek())?,
                    generation: session.generation(),
                    ..row.clone()
                })?;
                claimed += 1;
            }
            after = Some(last);
        }

        debug!(%user, claimed, "claimed sealed keys");
        Ok(claimed)
    }

    /// Refuses new KEK rows while a rotation for `user` is unfinished. A row
    /// written behind the cursor would be missed by the resumed run.
    pub(crate) fn ensure_idle(&self, user: UserId) -> KeyResult<()> {
        match self.cursors.get_cursor(user)? {
            Some(_) => Err(KeyError::RotationInProgress(user)),
            None => Ok(()),
        }
    }

    /// True when `kek` is the new KEK of an unfinished rotation for `user`.
    pub(crate) fn is_pending_kek(
        &self,
        user: UserId,
        kek: &DerivedKey,
        public_key: &[u8; X25519_KEY_SIZE],
    ) -> KeyResult<bool> {
        Ok(self.cursors.get_cursor(user)?.is_some_and(|cursor| {
            cursor
                .pending
                .iter()
                .any(|p| opens_check(&p.check, kek, public_key))
        }))
    }

    /// Serializes everything that writes KEK rows for `user`.
    pub(crate) fn user_lock(&self, user: UserId) -> KeyResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| KeyError::Worker("rotation lock table poisoned".into()))?;
        Ok(locks.entry(user).or_default().clone())
    }

    /// Moves one row to `target`. Returns false when it was already there.
    fn rewrap(&self, row: &WrappedKey, keys: &RewrapKeys<'_>, target: u64) -> KeyResult<bool> {
        let at_target = matches!(row.dek, WrappedDek::Kek { .. }) && row.generation >= target;
        let dek = if at_target {
            if KeyWrappingStore::open(&row.dek, keys.new, keys.keypair).is_ok() {
                return Ok(false);
            }
            // Moved by an earlier run under a credential since abandoned.
            let earlier = keys
                .superseded
                .iter()
                .find_map(|kek| KeyWrappingStore::open(&row.dek, kek, keys.keypair).ok());
            match earlier {
                Some(dek) => dek,
                None => self
                    .wrapping
                    .unwrap_with(row, keys.new, keys.keypair, AuditAction::Rotate)?,
            }
        } else {
            self.wrapping
                .unwrap_with(row, keys.old, keys.keypair, AuditAction::Rotate)?
        };

        self.wrapping.put(&WrappedKey {
            dek: KeyWrappingStore::wrap(&dek, keys.new)?,
            generation: target,
            ..row.clone()
        })?;
        Ok(true)
    }
}

/// Key material one rotation run works with.
struct RewrapKeys<'a> {
    old: &'a DerivedKey,
    new: &'a DerivedKey,
    /// New KEKs of earlier runs of the same rotation.
    superseded: &'a [DerivedKey],
    keypair: &'a UserKeyPair,
}

fn opens_check(
    check: &deedvault_crypto::EncryptedData,
    kek: &DerivedKey,
    public_key: &[u8; X25519_KEY_SIZE],
) -> bool {
    unwrap_key(kek, check).is_ok_and(|opened| opened.as_bytes() == public_key)
}
