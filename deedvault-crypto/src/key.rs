//! Key material: derived KEKs, random DEKs, salts and Argon2id parameters.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every symmetric key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of a per-user derivation salt in bytes.
pub const SALT_SIZE: usize = 16;

/// A 256-bit symmetric key. Zeroized on drop; never printed.
///
/// Used both for credential-derived KEKs and for random per-item DEKs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, checking its length.
    pub fn try_from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Per-user derivation salt. Generated once at registration, never changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Draws a fresh random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a salt from untrusted input. Anything but 16 bytes is rejected.
    pub fn try_from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; SALT_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidSalt {
            expected: SALT_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Argon2id cost parameters.
///
/// `iterations` is the Argon2 time cost; the user directory stores it per
/// user so it can be raised for new registrations without touching old ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost_kib: u32,
    /// Number of passes over memory.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// OWASP baseline for Argon2id: 19 MiB, 2 passes, 1 lane.
    fn default() -> Self {
        Self {
            memory_cost_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Same memory and lane settings with a different time cost.
    pub fn with_iterations(&self, iterations: u32) -> Self {
        Self {
            iterations,
            ..self.clone()
        }
    }
}

/// Derives a 256-bit key from a credential with Argon2id.
///
/// Deterministic: the same credential, salt and parameters always produce
/// the same key. Slow on purpose; callers on an async runtime must run it
/// on a blocking thread.
pub fn derive_key(credential: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
    if params.iterations == 0 {
        return Err(CryptoError::InvalidIterationCount {
            minimum: 1,
            actual: 0,
        });
    }

    let argon_params = Params::new(
        params.memory_cost_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("invalid Argon2 parameters: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut output = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(credential.as_bytes(), salt.as_bytes(), &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = DerivedKey::from_bytes(output);
    output.zeroize();
    Ok(key)
}

/// Generates a random 256-bit key from the OS CSPRNG (used for DEKs).
pub fn generate_random_key() -> DerivedKey {
    let mut generated = ChaCha20Poly1305::generate_key(&mut OsRng);
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&generated);
    generated.as_mut_slice().zeroize();
    DerivedKey::from_bytes(bytes)
}
