//! The key service: one handle over enrollment, sessions, items, sharing,
//! rotation and recovery.

use crate::audit::AccessAuditLog;
use crate::config::KeyServiceConfig;
use crate::directory::{RelationDirectory, UserDirectory};
use crate::error::{DenyReason, KeyError, KeyResult};
use crate::gate::{AccessControlGate, Decision};
use crate::kdf::KdfPool;
use crate::recovery::RecoveryKits;
use crate::rotation::{KeyRotationManager, RotationReport};
use crate::session::UserSession;
use crate::sharing::{GrantOptions, SharingCoordinator};
use crate::wrapping::KeyWrappingStore;
use chrono::Utc;
use deedvault_crypto::{
    decrypt, decrypt_private_key, encrypt, encrypt_private_key, generate_keypair,
    generate_random_key, public_key_fingerprint,
};
use deedvault_storage::{
    AuditAction, AuditOutcome, AuditRecord, EncryptedItem, ItemRepository, KeyStore,
    KeyringRepository, UserKeyring, WrappedKey,
};
use deedvault_types::{AccessAction, DataClass, ItemId, UserId};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Entry point for callers.
///
/// Cheap to clone; clones share storage, directories and the KDF pool.
#[derive(Clone)]
pub struct KeyService {
    config: KeyServiceConfig,
    items: Arc<dyn ItemRepository>,
    keyrings: Arc<dyn KeyringRepository>,
    users: Arc<dyn UserDirectory>,
    kdf: KdfPool,
    audit: AccessAuditLog,
    wrapping: KeyWrappingStore,
    gate: AccessControlGate,
    sharing: SharingCoordinator,
    rotation: KeyRotationManager,
    recovery: RecoveryKits,
}

impl KeyService {
    /// Wires the components over one store. Fails on an invalid config.
    pub fn new(
        config: KeyServiceConfig,
        store: Arc<dyn KeyStore>,
        users: Arc<dyn UserDirectory>,
        relations: Arc<dyn RelationDirectory>,
    ) -> KeyResult<Self> {
        config.validate()?;

        let items: Arc<dyn ItemRepository> = store.clone();
        let keyrings: Arc<dyn KeyringRepository> = store.clone();
        let kdf = KdfPool::new(
            config.kdf.clone(),
            config.min_kdf_iterations,
            config.kdf_max_concurrency,
        );
        let audit = AccessAuditLog::new(store.clone());
        let wrapping = KeyWrappingStore::new(store.clone(), audit.clone());
        let gate = AccessControlGate::new(
            items.clone(),
            relations.clone(),
            audit.clone(),
            config.permission_lookup_timeout(),
            config.allow_reshare,
        );
        let sharing = SharingCoordinator::new(
            keyrings.clone(),
            relations,
            wrapping.clone(),
            gate.clone(),
            audit.clone(),
            config.permission_lookup_timeout(),
        );
        let rotation = KeyRotationManager::new(
            keyrings.clone(),
            store,
            users.clone(),
            wrapping.clone(),
            audit.clone(),
            kdf.clone(),
            config.rotation_batch_size,
        );
        let recovery = RecoveryKits::new(
            keyrings.clone(),
            users.clone(),
            kdf.clone(),
            rotation.clone(),
            audit.clone(),
        );

        Ok(Self {
            config,
            items,
            keyrings,
            users,
            kdf,
            audit,
            wrapping,
            gate,
            sharing,
            rotation,
            recovery,
        })
    }

    pub fn config(&self) -> &KeyServiceConfig {
        &self.config
    }

    // =====================================================================
    // Enrollment and sessions
    // =====================================================================

    /// Creates `user`'s keyring: a fresh X25519 keypair whose private half
    /// is wrapped under the KEK derived from `credential`.
    pub async fn enroll(&self, user: UserId, credential: &str) -> KeyResult<()> {
        let lock = self.rotation.user_lock(user)?;
        let _guard = lock.lock().await;

        if self.keyrings.get_keyring(user)?.is_some() {
            return Err(KeyError::AlreadyEnrolled(user));
        }

        let kek = self.derive_kek(user, credential).await?;
        let keypair = generate_keypair();
        let now = Utc::now();
        let keyring = UserKeyring {
            user_id: user,
            public_key: keypair.public_bytes(),
            wrapped_private_key: encrypt_private_key(&keypair.secret, &kek)?,
            generation: 0,
            recovery_kit: None,
            created_at: now,
            updated_at: now,
        };
        self.keyrings.put_keyring(&keyring)?;

        info!(
            %user,
            fingerprint = %public_key_fingerprint(&keyring.public_key),
            "user enrolled"
        );
        Ok(())
    }

    /// Derives the KEK and unlocks the private key. A wrong credential is
    /// audited and returned as `AuthenticationFailure`; the new credential
    /// of an unfinished rotation is `RotationInProgress`.
    pub async fn unlock(&self, user: UserId, credential: &str) -> KeyResult<UserSession> {
        let keyring = self
            .keyrings
            .get_keyring(user)?
            .ok_or(KeyError::NotEnrolled(user))?;
        let kek = self.derive_kek(user, credential).await?;

        let keypair = match decrypt_private_key(&keyring.wrapped_private_key, &kek) {
            Ok(keypair) => keypair,
            Err(err) => {
                if self.rotation.is_pending_kek(user, &kek, &keyring.public_key)? {
                    info!(%user, "unlock refused: rotation to this credential unfinished");
                    return Err(KeyError::RotationInProgress(user));
                }
                warn!(%user, "unlock failed");
                self.audit.record_for_user(
                    user,
                    AuditAction::Unlock,
                    AuditOutcome::AuthenticationFailure,
                )?;
                return Err(err.into());
            }
        };

        Ok(UserSession::new(
            user,
            kek,
            keypair,
            keyring.generation,
            self.config.session_ttl(),
        ))
    }

    // =====================================================================
    // Items
    // =====================================================================

    /// Encrypts `plaintext` under a fresh DEK owned by the session's user.
    pub async fn create_item(
        &self,
        session: &UserSession,
        class: DataClass,
        plaintext: &[u8],
    ) -> KeyResult<ItemId> {
        let owner = session.user();
        let lock = self.rotation.user_lock(owner)?;
        let _guard = lock.lock().await;
        session.ensure_current(self.keyrings.as_ref())?;
        self.rotation.ensure_idle(owner)?;

        let dek = generate_random_key();
        let item = EncryptedItem::new(ItemId::new(), owner, class, encrypt(&dek, plaintext)?);
        let row = WrappedKey::new(
            item.id,
            owner,
            KeyWrappingStore::wrap(&dek, session.kek())?,
            session.generation(),
        );

        // Key first: an item must never exist that its owner cannot open.
        self.wrapping.put(&row)?;
        if let Err(err) = self.items.put_item(&item) {
            self.wrapping.delete(item.id, owner)?;
            return Err(err.into());
        }

        self.audit
            .record(owner, item.id, AuditAction::Write, AuditOutcome::Succeeded)?;
        info!(item = %item.id, %owner, class = class.as_str(), "item created");
        Ok(item.id)
    }

    /// Decrypts an item for the session's user, who must be its owner or
    /// hold a grant.
    pub async fn read_item(&self, session: &UserSession, item: ItemId) -> KeyResult<Zeroizing<Vec<u8>>> {
        session.ensure_current(self.keyrings.as_ref())?;
        let user = session.user();
        self.gate.require(user, item, AccessAction::Read).await?;

        let stored = self.load(item)?;
        let row = self.row_for(&stored, user, AuditAction::Read).await?;
        let dek = self.wrapping.unwrap(&row, session, AuditAction::Read)?;

        match decrypt(&dek, &stored.content) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => self.content_failure(user, item, AuditAction::Read, err.into()),
        }
    }

    /// Deletes an item, its grants and every wrapped key for it. Owner only.
    pub async fn delete_item(&self, session: &UserSession, item: ItemId) -> KeyResult<()> {
        session.ensure_current(self.keyrings.as_ref())?;
        let user = session.user();
        let stored = self.load(item)?;

        if stored.owner != user {
            let reason = DenyReason::NotOwner;
            self.audit.record(
                user,
                item,
                AuditAction::Delete,
                AuditOutcome::Denied(reason.to_string()),
            )?;
            return Err(KeyError::PermissionDenied(reason));
        }

        let removed = self.sharing.withdraw_all(user, item).await?;
        self.items.delete_item(item)?;
        self.audit
            .record(user, item, AuditAction::Delete, AuditOutcome::Succeeded)?;
        info!(%item, removed_keys = removed, "item deleted");
        Ok(())
    }

    // =====================================================================
    // Access and sharing
    // =====================================================================

    pub async fn authorize(&self, requester: UserId, item: ItemId, action: AccessAction) -> KeyResult<Decision> {
        self.gate.authorize(requester, item, action).await
    }

    pub async fn grant(
        &self,
        session: &UserSession,
        item: ItemId,
        grantee: UserId,
        options: GrantOptions,
    ) -> KeyResult<()> {
        self.sharing.grant(session, item, grantee, options).await
    }

    pub async fn revoke(&self, session: &UserSession, item: ItemId, grantee: UserId) -> KeyResult<bool> {
        self.sharing.revoke(session, item, grantee).await
    }

    pub fn holders(&self, item: ItemId) -> KeyResult<Vec<UserId>> {
        self.sharing.holders(item)
    }

    // =====================================================================
    // Rotation and recovery
    // =====================================================================

    pub async fn rotate_credential(
        &self,
        user: UserId,
        old_credential: &str,
        new_credential: &str,
    ) -> KeyResult<RotationReport> {
        self.rotation
            .rotate(user, old_credential, new_credential)
            .await
    }

    pub async fn claim_sealed(&self, session: &UserSession) -> KeyResult<u64> {
        self.rotation.claim_sealed(session).await
    }

    pub async fn create_recovery_kit(&self, session: &UserSession) -> KeyResult<Zeroizing<String>> {
        self.recovery.create(session).await
    }

    pub async fn refresh_recovery_kit(&self, session: &UserSession, mnemonic: &str) -> KeyResult<()> {
        self.recovery.refresh(session, mnemonic).await
    }

    pub async fn recover(&self, user: UserId, mnemonic: &str, new_credential: &str) -> KeyResult<RotationReport> {
        self.recovery.recover(user, mnemonic, new_credential).await
    }

    pub fn recovery_kit_generation(&self, user: UserId) -> KeyResult<Option<u64>> {
        self.recovery.kit_generation(user)
    }

    // =====================================================================
    // Audit
    // =====================================================================

    pub fn audit_records(&self) -> KeyResult<Vec<AuditRecord>> {
        self.audit.records()
    }

    pub fn audit_records_for_item(&self, item: ItemId) -> KeyResult<Vec<AuditRecord>> {
        self.audit.records_for_item(item)
    }

    pub fn audit_records_for_user(&self, user: UserId) -> KeyResult<Vec<AuditRecord>> {
        self.audit.records_for_user(user)
    }

    // =====================================================================
    // Internals
    // =====================================================================

    async fn derive_kek(&self, user: UserId, credential: &str) -> KeyResult<deedvault_crypto::DerivedKey> {
        let salt = self.users.salt(user)?;
        let iterations = self.users.iteration_count(user)?;
        self.kdf.derive_kek(credential, &salt, iterations).await
    }

    fn load(&self, item: ItemId) -> KeyResult<EncryptedItem> {
        self.items.get_item(item)?.ok_or(KeyError::ItemNotFound(item))
    }

    /// The owner's own row, or the row behind the grant the gate honoured.
    async fn row_for(&self, item: &EncryptedItem, user: UserId, action: AuditAction) -> KeyResult<WrappedKey> {
        if item.owner == user {
            self.wrapping.get(item.id, user)
        } else {
            self.sharing
                .granted_row(item.id, item.owner, user, action)
                .await
        }
    }

    fn content_failure<T>(&self, user: UserId, item: ItemId, action: AuditAction, err: KeyError) -> KeyResult<T> {
        if matches!(err, KeyError::AuthenticationFailure) {
            self.audit
                .record(user, item, action, AuditOutcome::AuthenticationFailure)?;
        }
        Err(err)
    }
}
