//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Every call to [`encrypt`] draws a fresh random 96-bit nonce. There is no
//! entry point that takes a caller-supplied nonce, so nonce reuse under one
//! key cannot be expressed through this API.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Ciphertext produced by [`encrypt`].
///
/// `ciphertext` holds the encrypted body with the 16-byte tag appended, the
/// layout the AEAD crate produces and consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Reassembles sealed data from separately stored body, tag and nonce.
    pub fn from_parts(nonce: [u8; NONCE_SIZE], body: &[u8], tag: &[u8; TAG_SIZE]) -> Self {
        let mut ciphertext = Vec::with_capacity(body.len() + TAG_SIZE);
        ciphertext.extend_from_slice(body);
        ciphertext.extend_from_slice(tag);
        Self { nonce, ciphertext }
    }

    /// Encrypted body without the tag. Empty if the data is malformed.
    pub fn body(&self) -> &[u8] {
        self.ciphertext
            .len()
            .checked_sub(TAG_SIZE)
            .map(|end| &self.ciphertext[..end])
            .unwrap_or_default()
    }

    /// The trailing authentication tag, if the data is long enough to carry one.
    pub fn tag(&self) -> Option<[u8; TAG_SIZE]> {
        let start = self.ciphertext.len().checked_sub(TAG_SIZE)?;
        self.ciphertext[start..].try_into().ok()
    }

    /// Total encrypted size in bytes (body + tag).
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

fn cipher_for(key: &DerivedKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Seals `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let cipher = cipher_for(key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);

    Ok(EncryptedData {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens data sealed by [`encrypt`].
///
/// Fails with [`CryptoError::AuthenticationFailure`] on any tag mismatch;
/// no plaintext is ever returned in that case. The plaintext is zeroized
/// when the caller drops it.
pub fn decrypt(key: &DerivedKey, encrypted: &EncryptedData) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if encrypted.ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::AuthenticationFailure);
    }

    let cipher = cipher_for(key);
    cipher
        .decrypt(Nonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// Wraps one key under another (KEK wraps DEK, or KEK wraps a private key).
pub fn wrap_key(wrapping_key: &DerivedKey, key_bytes: &[u8]) -> CryptoResult<EncryptedData> {
    encrypt(wrapping_key, key_bytes)
}

/// Unwraps a 256-bit key sealed by [`wrap_key`].
pub fn unwrap_key(wrapping_key: &DerivedKey, wrapped: &EncryptedData) -> CryptoResult<DerivedKey> {
    let plaintext = decrypt(wrapping_key, wrapped)?;
    DerivedKey::try_from_slice(&plaintext)
}
