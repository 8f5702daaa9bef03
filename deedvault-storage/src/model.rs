//! Persisted records.
//!
//! Nothing in here is ever plaintext key material: DEKs and private keys
//! only appear wrapped, and item contents only as ciphertext.

use chrono::{DateTime, Utc};
use deedvault_crypto::recovery::RecoveryBlob;
use deedvault_crypto::{EncryptedData, SealedEnvelope, X25519_KEY_SIZE};
use deedvault_types::{DataClass, ItemId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An encrypted field value. Its ciphertext and nonce never change after
/// creation; sharing adds wrapped keys instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedItem {
    pub id: ItemId,
    pub owner: UserId,
    pub class: DataClass,
    /// Nonce, body and tag as produced by the cipher.
    pub content: EncryptedData,
    pub created_at: DateTime<Utc>,
}

impl EncryptedItem {
    pub fn new(id: ItemId, owner: UserId, class: DataClass, content: EncryptedData) -> Self {
        Self {
            id,
            owner,
            class,
            content,
            created_at: Utc::now(),
        }
    }
}

/// How a DEK is protected inside a [`WrappedKey`] row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum WrappedDek {
    /// ChaCha20-Poly1305 under the holder's credential-derived KEK.
    Kek { sealed: EncryptedData },
    /// Sealed to the holder's X25519 public key by someone else.
    Sealed { envelope: SealedEnvelope },
}

impl WrappedDek {
    pub fn scheme(&self) -> WrapScheme {
        match self {
            Self::Kek { .. } => WrapScheme::Kek,
            Self::Sealed { .. } => WrapScheme::Sealed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapScheme {
    Kek,
    Sealed,
}

impl WrapScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kek => "kek",
            Self::Sealed => "sealed",
        }
    }
}

impl fmt::Display for WrapScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's copy of one item's DEK. Unique per (item, user).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub item_id: ItemId,
    pub user_id: UserId,
    pub dek: WrappedDek,
    /// Keyring generation this row was wrapped for. Sealed rows carry the
    /// generation current when they were sealed.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl WrappedKey {
    pub fn new(item_id: ItemId, user_id: UserId, dek: WrappedDek, generation: u64) -> Self {
        Self {
            item_id,
            user_id,
            dek,
            generation,
            created_at: Utc::now(),
        }
    }
}

/// Mnemonic-encrypted copy of a user's KEK.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryKit {
    pub blob: RecoveryBlob,
    /// Keyring generation whose KEK the blob holds.
    pub generation: u64,
}

/// A user's asymmetric identity plus the bookkeeping rotation needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyring {
    pub user_id: UserId,
    pub public_key: [u8; X25519_KEY_SIZE],
    /// X25519 secret key under the current KEK.
    pub wrapped_private_key: EncryptedData,
    /// Bumped on every credential rotation.
    pub generation: u64,
    pub recovery_kit: Option<RecoveryKit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Read,
    Write,
    Share,
    Revoke,
    Unwrap,
    Rotate,
    Delete,
    Unlock,
    Recover,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Share => "share",
            Self::Revoke => "revoke",
            Self::Unwrap => "unwrap",
            Self::Rotate => "rotate",
            Self::Delete => "delete",
            Self::Unlock => "unlock",
            Self::Recover => "recover",
        }
    }

    pub(crate) fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "read" => Self::Read,
            "write" => Self::Write,
            "share" => Self::Share,
            "revoke" => Self::Revoke,
            "unwrap" => Self::Unwrap,
            "rotate" => Self::Rotate,
            "delete" => Self::Delete,
            "unlock" => Self::Unlock,
            "recover" => Self::Recover,
            _ => return None,
        })
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied(String),
    Succeeded,
    AuthenticationFailure,
    InvariantViolation(String),
}

impl AuditOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied(_) => "denied",
            Self::Succeeded => "succeeded",
            Self::AuthenticationFailure => "authentication_failure",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Denied(d) | Self::InvariantViolation(d) => Some(d),
            _ => None,
        }
    }

    pub(crate) fn from_parts(tag: &str, detail: Option<String>) -> Option<Self> {
        Some(match tag {
            "allowed" => Self::Allowed,
            "denied" => Self::Denied(detail.unwrap_or_default()),
            "succeeded" => Self::Succeeded,
            "authentication_failure" => Self::AuthenticationFailure,
            "invariant_violation" => Self::InvariantViolation(detail.unwrap_or_default()),
            _ => return None,
        })
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {detail}", self.tag()),
            None => f.write_str(self.tag()),
        }
    }
}

/// An audit entry before the sink numbers it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: UserId,
    /// `None` for user-scoped events such as a failed unlock.
    pub item_id: Option<ItemId>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub at: DateTime<Utc>,
}

/// An appended audit entry. `seq` is strictly increasing per sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// A new KEK picked by a rotation that has not finished yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKek {
    /// The new KEK, wrapped under the KEK being retired.
    pub wrapped: EncryptedData,
    /// The holder's public key encrypted under the new KEK. Lets an unlock
    /// recognise the new credential before the keyring has moved.
    pub check: EncryptedData,
}

/// Progress of an interrupted or running rotation for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationCursor {
    pub user_id: UserId,
    /// Generation every row is being moved to.
    pub target_generation: u64,
    /// Every KEK this rotation has moved rows to, oldest first. The last one
    /// is the KEK of the run in progress.
    pub pending: Vec<PendingKek>,
    /// Last item fully processed; paging resumes after it.
    pub last_item: Option<ItemId>,
    pub rewrapped: u64,
    pub skipped: u64,
    pub started_at: DateTime<Utc>,
}

impl RotationCursor {
    pub fn start(user_id: UserId, target_generation: u64, pending: PendingKek) -> Self {
        Self {
            user_id,
            target_generation,
            pending: vec![pending],
            last_item: None,
            rewrapped: 0,
            skipped: 0,
            started_at: Utc::now(),
        }
    }
}
