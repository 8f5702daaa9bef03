//! Credential recovery via BIP39 mnemonic.
//!
//! Stores a user's KEK encrypted with a mnemonic-derived key so a user who
//! loses their credential can still re-wrap their keys under a new one.

use crate::cipher::{encrypt, unwrap_key, EncryptedData};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, DerivedKey, KdfParams, Salt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Domain-separated fixed salt for mnemonic key derivation.
///
/// Safe because the mnemonic itself carries 128 bits of entropy.
const MNEMONIC_SALT: [u8; 16] = *b"deedvault-mnemo\0";

/// KEK encrypted with a mnemonic-derived key for offline recovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryBlob {
    /// KEK bytes encrypted with the mnemonic-derived key.
    pub encrypted_key: EncryptedData,
    /// Unix timestamp when this blob was created.
    pub created_at: i64,
}

/// Generates a 12-word BIP39 mnemonic.
pub fn generate_recovery_mnemonic() -> CryptoResult<String> {
    let mut entropy = [0u8; 16];
    rand::rng().fill_bytes(&mut entropy);

    let mnemonic = bip39::Mnemonic::from_entropy(&entropy)
        .map_err(|e| CryptoError::InvalidMnemonic(format!("mnemonic generation failed: {e}")));
    entropy.zeroize();

    Ok(mnemonic?.to_string())
}

/// Derives a 32-byte key from a BIP39 mnemonic phrase.
pub fn mnemonic_to_key(mnemonic: &str) -> CryptoResult<DerivedKey> {
    let _: bip39::Mnemonic = mnemonic
        .parse()
        .map_err(|e| CryptoError::InvalidMnemonic(format!("{e}")))?;

    derive_key(mnemonic, &Salt::from_bytes(MNEMONIC_SALT), &KdfParams::default())
}

/// Generates a new mnemonic and encrypts `key` with it.
///
/// Returns `(mnemonic, blob)`. The mnemonic must be shown to the user once
/// and never stored digitally.
pub fn create_recovery_blob(key: &DerivedKey) -> CryptoResult<(String, RecoveryBlob)> {
    let mnemonic = generate_recovery_mnemonic()?;
    let blob = create_recovery_blob_with_mnemonic(key, &mnemonic)?;
    Ok((mnemonic, blob))
}

/// Encrypts `key` with a caller-provided mnemonic.
pub fn create_recovery_blob_with_mnemonic(
    key: &DerivedKey,
    mnemonic: &str,
) -> CryptoResult<RecoveryBlob> {
    let recovery_key = mnemonic_to_key(mnemonic)?;
    let encrypted_key = encrypt(&recovery_key, key.as_bytes())?;

    Ok(RecoveryBlob {
        encrypted_key,
        created_at: chrono::Utc::now().timestamp(),
    })
}

/// Decrypts the key held in a recovery blob.
pub fn open_recovery_blob(blob: &RecoveryBlob, mnemonic: &str) -> CryptoResult<DerivedKey> {
    let recovery_key = mnemonic_to_key(mnemonic)?;
    unwrap_key(&recovery_key, &blob.encrypted_key)
}

/// Re-encrypts a recovery blob for a new key using the same mnemonic.
///
/// Keeps the user's written-down mnemonic valid after a credential change.
pub fn reencrypt_recovery_blob(
    blob: &RecoveryBlob,
    mnemonic: &str,
    new_key: &DerivedKey,
) -> CryptoResult<RecoveryBlob> {
    // Proves the mnemonic belongs to this blob before replacing it.
    let _ = open_recovery_blob(blob, mnemonic)?;

    let recovery_key = mnemonic_to_key(mnemonic)?;
    let encrypted_key = encrypt(&recovery_key, new_key.as_bytes())?;

    Ok(RecoveryBlob {
        encrypted_key,
        created_at: blob.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::wrap_key;
    use crate::key::generate_random_key;

    #[test]
    fn kit_hands_back_a_kek_that_still_unwraps_its_deks() {
        let kek = generate_random_key();
        let dek = generate_random_key();
        let wrapped_dek = wrap_key(&kek, dek.as_bytes()).unwrap();

        let phrase = generate_recovery_mnemonic().unwrap();
        let kit = create_recovery_blob_with_mnemonic(&kek, &phrase).unwrap();
        let recovered = open_recovery_blob(&kit, &phrase).unwrap();

        let unwrapped = unwrap_key(&recovered, &wrapped_dek).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn foreign_phrase_and_malformed_phrase_fail_differently() {
        let (_, kit) = create_recovery_blob(&generate_random_key()).unwrap();

        let foreign = generate_recovery_mnemonic().unwrap();
        assert!(matches!(
            open_recovery_blob(&kit, &foreign),
            Err(CryptoError::AuthenticationFailure)
        ));

        // Right word count, words outside the list.
        let malformed = ["vaultword"; 12].join(" ");
        assert!(matches!(
            open_recovery_blob(&kit, &malformed),
            Err(CryptoError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn rewrapping_for_a_new_kek_keeps_the_kit_creation_time() {
        let (phrase, mut kit) = create_recovery_blob(&generate_random_key()).unwrap();
        kit.created_at = 1_700_000_000;

        let rotated = generate_random_key();
        let refreshed = reencrypt_recovery_blob(&kit, &phrase, &rotated).unwrap();

        assert_eq!(refreshed.created_at, 1_700_000_000);
        assert_ne!(refreshed.encrypted_key, kit.encrypted_key);
        let opened = open_recovery_blob(&refreshed, &phrase).unwrap();
        assert_eq!(opened.as_bytes(), rotated.as_bytes());
    }

    #[test]
    fn refresh_refuses_a_phrase_that_does_not_open_the_kit() {
        let (_, kit) = create_recovery_blob(&generate_random_key()).unwrap();
        let foreign = generate_recovery_mnemonic().unwrap();

        let err = reencrypt_recovery_blob(&kit, &foreign, &generate_random_key()).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailure));
    }

    #[test]
    fn recovery_key_depends_only_on_the_phrase() {
        let phrase = generate_recovery_mnemonic().unwrap();
        let other = generate_recovery_mnemonic().unwrap();

        let a = mnemonic_to_key(&phrase).unwrap();
        let b = mnemonic_to_key(&phrase).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), mnemonic_to_key(&other).unwrap().as_bytes());
        assert_eq!(phrase.split_whitespace().count(), 12);
    }
}
