//! Encryption layer for DeedVault.
//!
//! Provides per-item envelope encryption using:
//! - Argon2id for deriving a key-encryption key (KEK) from a credential
//! - ChaCha20-Poly1305 for authenticated encryption of item contents
//! - X25519 sealed boxes for handing a data key to another user
//! - Secure key handling with zeroization
//!
//! # Architecture
//!
//! 1. **KEK**: Derived from the user's credential and per-user salt using
//!    Argon2id. Never stored; derived each time the user unlocks.
//!
//! 2. **DEK**: A random key generated for each item. The item is encrypted
//!    once under its DEK; the DEK is then wrapped once per authorized user.
//!
//! 3. **User keypair**: An X25519 keypair per user, its private half
//!    wrapped under the KEK. Sharing seals the DEK to the grantee's public
//!    key, so the grantee's credential is never needed by the sharer.
//!
//! This allows:
//! - Changing a credential without re-encrypting any item
//! - Sharing an item by adding a wrapped key, never new ciphertext
//! - Revoking one user without touching anyone else's wrap

mod cipher;
pub mod envelope;
mod error;
mod key;
pub mod recovery;

pub use cipher::{decrypt, encrypt, unwrap_key, wrap_key, EncryptedData, NONCE_SIZE, TAG_SIZE};
pub use envelope::{
    decrypt_private_key, encrypt_private_key, generate_keypair, open_dek,
    public_key_fingerprint, seal_dek, SealedEnvelope, UserKeyPair, X25519_KEY_SIZE,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, generate_random_key, DerivedKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
pub use recovery::{
    create_recovery_blob, create_recovery_blob_with_mnemonic, open_recovery_blob,
    reencrypt_recovery_blob, RecoveryBlob,
};

/// Re-exported so callers can name the X25519 public key type.
pub use crypto_box::PublicKey;
