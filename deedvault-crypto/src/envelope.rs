//! Envelope encryption for sharing.
//!
//! Uses X25519 key exchange + XSalsa20-Poly1305 for sealing item DEKs to a
//! grantee's public key. Each seal uses a fresh ephemeral keypair, so the
//! sharer never needs the grantee's credential and the grantee need not be
//! online when access is granted.
//!
//! The user's own X25519 private key is stored wrapped under their
//! credential-derived KEK.

use crate::cipher::{decrypt, encrypt, EncryptedData};
use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Size of an X25519 public or secret key.
pub const X25519_KEY_SIZE: usize = 32;

/// XSalsa20 nonce size.
pub const BOX_NONCE_SIZE: usize = 24;

/// X25519 keypair held by each user.
///
/// The secret key implements `ZeroizeOnDrop` automatically (from crypto_box).
pub struct UserKeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl UserKeyPair {
    /// Returns the public key as raw 32-byte array.
    pub fn public_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Reconstructs a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl std::fmt::Debug for UserKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeyPair")
            .field("public", &public_key_fingerprint(&self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// DEK sealed to a recipient's X25519 public key.
///
/// The ephemeral public key is included so the recipient can reconstruct
/// the shared secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Ephemeral X25519 public key (sender side of DH).
    pub ephemeral_public_key: [u8; X25519_KEY_SIZE],
    /// XSalsa20 nonce (24 bytes).
    pub nonce: [u8; BOX_NONCE_SIZE],
    /// Encrypted DEK (XSalsa20-Poly1305 ciphertext + Poly1305 tag).
    pub ciphertext: Vec<u8>,
}

/// Generates a new X25519 keypair.
pub fn generate_keypair() -> UserKeyPair {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    UserKeyPair { secret, public }
}

/// Seals a DEK for a recipient using anonymous envelope encryption.
pub fn seal_dek(dek: &[u8], recipient_pk: &PublicKey) -> CryptoResult<SealedEnvelope> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let ephemeral_pk = ephemeral.public_key();

    let salsa_box = SalsaBox::new(recipient_pk, &ephemeral);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);

    let ciphertext = salsa_box
        .encrypt(&nonce, dek)
        .map_err(|e| CryptoError::Encryption(format!("envelope seal failed: {e}")))?;

    let mut nonce_bytes = [0u8; BOX_NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);

    Ok(SealedEnvelope {
        ephemeral_public_key: *ephemeral_pk.as_bytes(),
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens a sealed DEK envelope using the recipient's secret key.
pub fn open_dek(envelope: &SealedEnvelope, recipient_sk: &SecretKey) -> CryptoResult<DerivedKey> {
    let ephemeral_pk = PublicKey::from(envelope.ephemeral_public_key);
    let salsa_box = SalsaBox::new(&ephemeral_pk, recipient_sk);

    let plaintext = salsa_box
        .decrypt(
            crypto_box::Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_ref(),
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    DerivedKey::try_from_slice(&plaintext)
}

/// Wraps a user's private key under their KEK.
pub fn encrypt_private_key(sk: &SecretKey, kek: &DerivedKey) -> CryptoResult<EncryptedData> {
    let bytes = Zeroizing::new(sk.to_bytes());
    encrypt(kek, &bytes[..])
}

/// Unwraps a private key sealed by [`encrypt_private_key`].
pub fn decrypt_private_key(wrapped: &EncryptedData, kek: &DerivedKey) -> CryptoResult<UserKeyPair> {
    let plaintext = decrypt(kek, wrapped)?;

    if plaintext.len() != X25519_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: X25519_KEY_SIZE,
            actual: plaintext.len(),
        });
    }

    let mut bytes = [0u8; X25519_KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    let keypair = UserKeyPair::from_secret_bytes(bytes);
    bytes.zeroize();
    Ok(keypair)
}

/// Short hex fingerprint of a public key, safe to log.
pub fn public_key_fingerprint(public_key: &[u8; X25519_KEY_SIZE]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}
