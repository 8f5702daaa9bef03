//! Key management error types.

use crate::directory::DirectoryError;
use deedvault_crypto::CryptoError;
use deedvault_storage::StorageError;
use deedvault_types::{ItemId, UserId};
use std::fmt;
use thiserror::Error;

/// Result type for key management operations.
pub type KeyResult<T> = Result<T, KeyError>;

/// Why the access gate refused a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    /// No relation with the owner, or the relation was rejected.
    NoRelation,
    RelationPending,
    Blocked,
    /// Accepted relation, but no active grant for this item.
    NoGrant,
    /// A read grant asked to write.
    InsufficientPermission,
    /// Only the owner may do this.
    NotOwner,
    /// Re-sharing is disabled or the grant carries no re-share right.
    ReshareNotPermitted,
    /// Grantee has no accepted relation with the item owner.
    GranteeNotConnected,
    /// The owner's own key cannot be revoked.
    OwnerKey,
    LookupTimeout,
    LookupFailed,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRelation => "no relation",
            Self::RelationPending => "relation pending",
            Self::Blocked => "blocked",
            Self::NoGrant => "no active grant",
            Self::InsufficientPermission => "insufficient permission",
            Self::NotOwner => "not the owner",
            Self::ReshareNotPermitted => "re-share not permitted",
            Self::GranteeNotConnected => "grantee has no accepted relation with owner",
            Self::OwnerKey => "owner key cannot be revoked",
            Self::LookupTimeout => "permission lookup timed out",
            Self::LookupFailed => "permission lookup failed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the key service.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid salt length: expected {expected} bytes, got {actual}")]
    InvalidSalt { expected: usize, actual: usize },

    #[error("iteration count {actual} is below the minimum of {minimum}")]
    InvalidIterationCount { minimum: u32, actual: u32 },

    #[error("key derivation failed: {0}")]
    KeyDerivationFailure(String),

    /// Wrong credential and tampered data are reported identically.
    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("permission denied: {0}")]
    PermissionDenied(DenyReason),

    #[error("no wrapped key for item {item} and user {user}")]
    KeyNotFound { item: ItemId, user: UserId },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("user {0} has no keyring")]
    NotEnrolled(UserId),

    #[error("user {0} is already enrolled")]
    AlreadyEnrolled(UserId),

    #[error("session expired")]
    SessionExpired,

    /// A credential rotation for this user stopped part way. Rerun it to
    /// finish before using the new credential.
    #[error("credential rotation for user {0} has not finished")]
    RotationInProgress(UserId),

    #[error("no recovery kit for user {0}")]
    RecoveryKitMissing(UserId),

    #[error("recovery kit is for key generation {kit}, keyring is at {current}")]
    RecoveryKitStale { kit: u64, current: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("worker error: {0}")]
    Worker(String),
}

impl From<CryptoError> for KeyError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailure => Self::AuthenticationFailure,
            CryptoError::InvalidSalt { expected, actual } => Self::InvalidSalt { expected, actual },
            CryptoError::InvalidIterationCount { minimum, actual } => {
                Self::InvalidIterationCount { minimum, actual }
            }
            CryptoError::KeyDerivation(msg) => Self::KeyDerivationFailure(msg),
            other => Self::Crypto(other),
        }
    }
}

impl From<tokio::task::JoinError> for KeyError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}
