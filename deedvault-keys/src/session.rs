//! Unlocked key material for one user.

use crate::error::{KeyError, KeyResult};
use deedvault_crypto::{DerivedKey, UserKeyPair};
use deedvault_storage::KeyringRepository;
use deedvault_types::UserId;
use std::fmt;
use tokio::time::{Duration, Instant};

/// A user's KEK and private key, held in memory for a bounded time.
///
/// Both are zeroized when the session is dropped or [`ended`](Self::end).
/// A session is tied to the keyring generation it was opened at; once the
/// user rotates, older sessions are refused.
pub struct UserSession {
    user: UserId,
    kek: DerivedKey,
    keypair: UserKeyPair,
    generation: u64,
    expires_at: Instant,
}

impl UserSession {
    pub(crate) fn new(user: UserId, kek: DerivedKey, keypair: UserKeyPair, generation: u64, ttl: Duration) -> Self {
        Self {
            user,
            kek,
            keypair,
            generation,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Keyring generation the KEK belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn public_key_bytes(&self) -> [u8; deedvault_crypto::X25519_KEY_SIZE] {
        self.keypair.public_bytes()
    }

    /// Discards the session and its key material now.
    pub fn end(self) {
        tracing::debug!(user = %self.user, "session ended");
    }

    pub(crate) fn ensure_live(&self) -> KeyResult<()> {
        if self.is_expired() {
            return Err(KeyError::SessionExpired);
        }
        Ok(())
    }

    /// Live, and still at the generation the user's keyring is at.
    pub(crate) fn ensure_current(&self, keyrings: &dyn KeyringRepository) -> KeyResult<()> {
        self.ensure_live()?;
        let keyring = keyrings
            .get_keyring(self.user)?
            .ok_or(KeyError::NotEnrolled(self.user))?;
        if keyring.generation != self.generation {
            tracing::debug!(
                user = %self.user,
                session = self.generation,
                keyring = keyring.generation,
                "session predates a rotation"
            );
            return Err(KeyError::SessionExpired);
        }
        Ok(())
    }

    pub(crate) fn kek(&self) -> &DerivedKey {
        &self.kek
    }

    pub(crate) fn keypair(&self) -> &UserKeyPair {
        &self.keypair
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("user", &self.user)
            .field("generation", &self.generation)
            .field("keypair", &self.keypair)
            .finish_non_exhaustive()
    }
}
