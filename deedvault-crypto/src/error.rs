//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in the crypto layer.
///
/// `AuthenticationFailure` deliberately carries no detail: a wrong key and
/// tampered ciphertext must look the same to the caller.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("authentication failed (wrong key or tampered data)")]
    AuthenticationFailure,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid salt length: expected {expected} bytes, got {actual}")]
    InvalidSalt { expected: usize, actual: usize },

    #[error("iteration count {actual} is below the minimum of {minimum}")]
    InvalidIterationCount { minimum: u32, actual: u32 },

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
}
