//! Recovery kits.
//!
//! A kit is the user's current KEK encrypted under a key derived from a
//! 12-word mnemonic. With the mnemonic a user who lost their credential
//! can set a new one; everything they hold is re-wrapped through the
//! normal rotation path. The kit is tied to the keyring generation it was
//! made at and is refreshed after every recovery.

use crate::audit::AccessAuditLog;
use crate::directory::UserDirectory;
use crate::error::{KeyError, KeyResult};
use crate::kdf::KdfPool;
use crate::rotation::{KeyRotationManager, RotationReport};
use crate::session::UserSession;
use chrono::Utc;
use deedvault_crypto::{
    create_recovery_blob, open_recovery_blob, reencrypt_recovery_blob, RecoveryBlob,
};
use deedvault_storage::{AuditAction, AuditOutcome, KeyringRepository, RecoveryKit, UserKeyring};
use deedvault_types::UserId;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

#[derive(Clone)]
pub struct RecoveryKits {
    keyrings: Arc<dyn KeyringRepository>,
    users: Arc<dyn UserDirectory>,
    kdf: KdfPool,
    rotation: KeyRotationManager,
    audit: AccessAuditLog,
}

impl RecoveryKits {
    pub fn new(
        keyrings: Arc<dyn KeyringRepository>,
        users: Arc<dyn UserDirectory>,
        kdf: KdfPool,
        rotation: KeyRotationManager,
        audit: AccessAuditLog,
    ) -> Self {
        Self {
            keyrings,
            users,
            kdf,
            rotation,
            audit,
        }
    }

    /// Creates a kit for the session's KEK, replacing any earlier one.
    ///
    /// Returns the mnemonic. It is shown to the user once and never stored.
    pub async fn create(&self, session: &UserSession) -> KeyResult<Zeroizing<String>> {
        session.ensure_current(self.keyrings.as_ref())?;
        let kek = session.kek().clone();
        let (mnemonic, blob) = self
            .kdf
            .run(move || Ok(create_recovery_blob(&kek)?))
            .await?;

        self.store(session.user(), blob, session.generation())?;
        info!(user = %session.user(), generation = session.generation(), "recovery kit created");
        Ok(Zeroizing::new(mnemonic))
    }

    /// Re-encrypts the existing kit for the session's KEK, keeping the
    /// same mnemonic. Fails if `mnemonic` does not open the current kit.
    pub async fn refresh(&self, session: &UserSession, mnemonic: &str) -> KeyResult<()> {
        session.ensure_current(self.keyrings.as_ref())?;
        let user = session.user();
        let kit = self.kit(&self.keyring(user)?)?;

        let kek = session.kek().clone();
        let phrase = Zeroizing::new(mnemonic.to_owned());
        let blob = self
            .kdf
            .run(move || Ok(reencrypt_recovery_blob(&kit.blob, &phrase, &kek)?))
            .await
            .or_else(|err| self.rejected(user, err))?;

        self.store(user, blob, session.generation())?;
        info!(%user, generation = session.generation(), "recovery kit refreshed");
        Ok(())
    }

    /// Sets a new credential for `user` using their mnemonic.
    ///
    /// Existing sessions for the user stop working, as after any rotation.
    /// The kit is re-encrypted so the same mnemonic keeps working.
    pub async fn recover(
        &self,
        user: UserId,
        mnemonic: &str,
        new_credential: &str,
    ) -> KeyResult<RotationReport> {
        let keyring = self.keyring(user)?;
        let kit = self.kit(&keyring)?;
        if kit.generation != keyring.generation {
            warn!(%user, kit = kit.generation, current = keyring.generation, "stale recovery kit");
            return Err(KeyError::RecoveryKitStale {
                kit: kit.generation,
                current: keyring.generation,
            });
        }

        let phrase = Zeroizing::new(mnemonic.to_owned());
        let blob = kit.blob.clone();
        let old_kek = self
            .kdf
            .run(move || Ok(open_recovery_blob(&blob, &phrase)?))
            .await
            .or_else(|err| self.rejected(user, err))?;

        let salt = self.users.salt(user)?;
        let iterations = self.users.iteration_count(user)?;
        let new_kek = self.kdf.derive_kek(new_credential, &salt, iterations).await?;

        let report = self
            .rotation
            .rotate_with_keys(user, &old_kek, &new_kek)
            .await?;

        let phrase = Zeroizing::new(mnemonic.to_owned());
        let blob = self
            .kdf
            .run(move || Ok(reencrypt_recovery_blob(&kit.blob, &phrase, &new_kek)?))
            .await?;
        self.store(user, blob, report.generation)?;

        info!(%user, generation = report.generation, "credential recovered");
        Ok(report)
    }

    /// Generation the user's kit was made at, if they have one.
    pub fn kit_generation(&self, user: UserId) -> KeyResult<Option<u64>> {
        Ok(self
            .keyring(user)?
            .recovery_kit
            .map(|kit| kit.generation))
    }

    /// Audits a mnemonic that failed to open the kit, then passes the
    /// error on.
    fn rejected<T>(&self, user: UserId, err: KeyError) -> KeyResult<T> {
        warn!(%user, error = %err, "recovery mnemonic rejected");
        if matches!(err, KeyError::AuthenticationFailure) {
            self.audit.record_for_user(
                user,
                AuditAction::Recover,
                AuditOutcome::AuthenticationFailure,
            )?;
        }
        Err(err)
    }

    fn keyring(&self, user: UserId) -> KeyResult<UserKeyring> {
        self.keyrings
            .get_keyring(user)?
            .ok_or(KeyError::NotEnrolled(user))
    }

    fn kit(&self, keyring: &UserKeyring) -> KeyResult<RecoveryKit> {
        keyring
            .recovery_kit
            .clone()
            .ok_or(KeyError::RecoveryKitMissing(keyring.user_id))
    }

    /// Writes the kit onto the freshest keyring, so a rotation that
    /// finished in between is not overwritten.
    fn store(&self, user: UserId, blob: RecoveryBlob, generation: u64) -> KeyResult<()> {
        let mut keyring = self.keyring(user)?;
        keyring.recovery_kit = Some(RecoveryKit { blob, generation });
        keyring.updated_at = Utc::now();
        Ok(self.keyrings.put_keyring(&keyring)?)
    }
}
