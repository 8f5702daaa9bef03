//! Envelope key management for DeedVault.
//!
//! Every item is encrypted once under its own data key (DEK). The DEK is
//! then wrapped once per user who may read the item:
//!
//! - the owner's copy is wrapped under a KEK derived from their credential
//! - a grantee's copy is sealed to their X25519 public key at grant time,
//!   and moved under their own KEK the next time they rotate or claim it
//!
//! An [`AccessControlGate`] is consulted before any wrapped key is touched,
//! and every decision and failed unwrap lands in the [`AccessAuditLog`].
//! Credential changes re-wrap keys in resumable chunks
//! ([`KeyRotationManager`]); item ciphertext never changes.
//!
//! [`KeyService`] wires it all together over a [`deedvault_storage::KeyStore`]
//! and the two external directories.

pub mod audit;
pub mod config;
pub mod directory;
pub mod error;
pub mod gate;
pub mod kdf;
pub mod memory;
pub mod recovery;
pub mod rotation;
pub mod service;
pub mod session;
pub mod sharing;
pub mod wrapping;

pub use audit::AccessAuditLog;
pub use config::KeyServiceConfig;
pub use directory::{ActiveGrant, DirectoryError, Relation, RelationDirectory, UserDirectory};
pub use error::{DenyReason, KeyError, KeyResult};
pub use gate::{AccessControlGate, AccessState, Decision};
pub use kdf::KdfPool;
pub use memory::{MemoryRelationDirectory, MemoryUserDirectory};
pub use recovery::RecoveryKits;
pub use rotation::{KeyRotationManager, RotationReport};
pub use service::KeyService;
pub use session::UserSession;
pub use sharing::{GrantOptions, SharingCoordinator};
pub use wrapping::KeyWrappingStore;
