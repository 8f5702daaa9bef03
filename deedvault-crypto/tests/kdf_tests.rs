//! Key derivation behaviour at the boundaries callers care about.

use deedvault_crypto::{
    decrypt, derive_key, encrypt, unwrap_key, wrap_key, generate_random_key, CryptoError,
    KdfParams, Salt, SALT_SIZE,
};

const FIXED_SALT: [u8; SALT_SIZE] = [
    0x9a, 0x14, 0x3c, 0x07, 0xe2, 0x51, 0x88, 0x6d, 0x30, 0xbf, 0x42, 0x19, 0xc4, 0x7e, 0x05, 0xd3,
];

/// Argon2's floor on memory with a high pass count, so the large
/// iteration value stays usable in tests.
fn registration_params() -> KdfParams {
    KdfParams {
        memory_cost_kib: 8,
        iterations: 100_000,
        parallelism: 1,
    }
}

// ── Determinism ──

#[test]
fn same_inputs_derive_same_kek() {
    let salt = Salt::from_bytes(FIXED_SALT);
    let a = derive_key("userPassword123!", &salt, &registration_params()).unwrap();
    let b = derive_key("userPassword123!", &salt, &registration_params()).unwrap();
    assert_eq!(a.as_bytes(), b.as_bytes());
}

#[test]
fn kek_round_trips_a_wrapped_dek_and_item() {
    let kek = derive_key(
        "userPassword123!",
        &Salt::from_bytes(FIXED_SALT),
        &registration_params(),
    )
    .unwrap();
    let dek = generate_random_key();

    let item = encrypt(&dek, b"Gave charity secretly").unwrap();
    let wrapped = wrap_key(&kek, dek.as_bytes()).unwrap();

    let unwrapped = unwrap_key(&kek, &wrapped).unwrap();
    let plaintext = decrypt(&unwrapped, &item).unwrap();
    assert_eq!(plaintext.as_slice(), b"Gave charity secretly");
}

#[test]
fn wrong_credential_cannot_unwrap() {
    let salt = Salt::from_bytes(FIXED_SALT);
    let params = registration_params().with_iterations(3);
    let kek = derive_key("userPassword123!", &salt, &params).unwrap();
    let wrong = derive_key("userPassword124!", &salt, &params).unwrap();

    let wrapped = wrap_key(&kek, generate_random_key().as_bytes()).unwrap();
    assert!(matches!(
        unwrap_key(&wrong, &wrapped),
        Err(CryptoError::AuthenticationFailure)
    ));
}

// ── Parameter validation ──

#[test]
fn zero_iterations_is_rejected_before_hashing() {
    let err = derive_key(
        "userPassword123!",
        &Salt::from_bytes(FIXED_SALT),
        &registration_params().with_iterations(0),
    )
    .unwrap_err();
    assert!(matches!(err, CryptoError::InvalidIterationCount { .. }));
}

#[test]
fn short_salt_never_reaches_the_kdf() {
    let err = Salt::try_from_slice(&FIXED_SALT[..8]).unwrap_err();
    assert_eq!(err.to_string(), CryptoError::InvalidSalt { expected: 16, actual: 8 }.to_string());
}

#[test]
fn empty_credential_still_derives() {
    let params = registration_params().with_iterations(1);
    let key = derive_key("", &Salt::from_bytes(FIXED_SALT), &params).unwrap();
    let other = derive_key("x", &Salt::from_bytes(FIXED_SALT), &params).unwrap();
    assert_ne!(key.as_bytes(), other.as_bytes());
}
