//! Shared helpers for key service integration tests.

#![allow(dead_code)]

use deedvault_crypto::KdfParams;
use deedvault_keys::{KeyService, KeyServiceConfig, MemoryRelationDirectory, MemoryUserDirectory, UserSession};
use deedvault_storage::{AuditOutcome, AuditRecord, KeyStore, MemoryStore};
use deedvault_types::{RelationId, RelationStatus, UserId};
use std::sync::Arc;

pub const OWNER_CREDENTIAL: &str = "owner-credential-1";
pub const FRIEND_CREDENTIAL: &str = "friend-credential-1";
pub const STRANGER_CREDENTIAL: &str = "stranger-credential-1";

/// Argon2 at its floor so tests stay fast.
pub fn test_config() -> KeyServiceConfig {
    KeyServiceConfig {
        kdf: KdfParams {
            memory_cost_kib: 8,
            iterations: 1,
            parallelism: 1,
        },
        min_kdf_iterations: 1,
        kdf_max_concurrency: 4,
        permission_lookup_timeout_ms: 500,
        session_ttl_secs: 60,
        rotation_batch_size: 2,
        allow_reshare: false,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("deedvault_keys=debug"))
        .with_test_writer()
        .try_init();
}

/// A service over in-memory storage and directories, with handles on all
/// three for inspection.
pub struct Harness {
    pub service: KeyService,
    pub store: MemoryStore,
    pub users: MemoryUserDirectory,
    pub relations: MemoryRelationDirectory,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: KeyServiceConfig) -> Self {
        let store = MemoryStore::new();
        Self::over(config, store.clone(), Arc::new(store))
    }

    /// Builds the service over an arbitrary store; `store` is still the
    /// memory handle tests inspect, so pass a shared one when it matters.
    pub fn over(config: KeyServiceConfig, store: MemoryStore, backend: Arc<dyn KeyStore>) -> Self {
        init_tracing();
        let users = MemoryUserDirectory::new();
        let relations = MemoryRelationDirectory::new();
        let service = KeyService::new(
            config,
            backend,
            Arc::new(users.clone()),
            Arc::new(relations.clone()),
        )
        .expect("test config is valid");
        Self {
            service,
            store,
            users,
            relations,
        }
    }

    /// Registers and enrolls a fresh user.
    pub async fn enrolled(&self, credential: &str) -> UserId {
        let user = UserId::new();
        self.users.register(user, 1).expect("register");
        self.service
            .enroll(user, credential)
            .await
            .expect("enroll");
        user
    }

    pub async fn session(&self, user: UserId, credential: &str) -> UserSession {
        self.service
            .unlock(user, credential)
            .await
            .expect("unlock")
    }

    pub async fn connect(&self, a: UserId, b: UserId) -> RelationId {
        self.relations
            .connect(a, b, RelationStatus::Accepted)
            .await
    }
}

/// Audit records with the given outcome tag.
pub fn with_outcome<'a>(records: &'a [AuditRecord], tag: &str) -> Vec<&'a AuditRecord> {
    records
        .iter()
        .filter(|r| r.entry.outcome.tag() == tag)
        .collect()
}

pub fn is_denied(outcome: &AuditOutcome) -> bool {
    matches!(outcome, AuditOutcome::Denied(_))
}
