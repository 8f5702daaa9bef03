//! Credential → KEK derivation, off the async executor.
//!
//! Argon2id deliberately burns CPU and memory, so every derivation runs on
//! tokio's blocking pool and a semaphore caps how many run at once.

use crate::error::{KeyError, KeyResult};
use deedvault_crypto::{derive_key, DerivedKey, KdfParams, Salt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;
use zeroize::Zeroizing;

/// Bounded worker pool for key derivation and other slow crypto.
#[derive(Clone)]
pub struct KdfPool {
    permits: Arc<Semaphore>,
    params: KdfParams,
    min_iterations: u32,
}

impl KdfPool {
    pub fn new(params: KdfParams, min_iterations: u32, max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            params,
            min_iterations,
        }
    }

    /// Derives a user's KEK. Deterministic for a given credential, salt and
    /// iteration count; the configured memory and lane settings apply.
    pub async fn derive_kek(
        &self,
        credential: &str,
        salt: &[u8],
        iterations: u32,
    ) -> KeyResult<DerivedKey> {
        let salt = Salt::try_from_slice(salt)?;
        if iterations < self.min_iterations {
            return Err(KeyError::InvalidIterationCount {
                minimum: self.min_iterations,
                actual: iterations,
            });
        }

        let params = self.params.with_iterations(iterations);
        let credential = Zeroizing::new(credential.to_owned());
        let started = std::time::Instant::now();

        let key = self
            .run(move || derive_key(&credential, &salt, &params).map_err(KeyError::from))
            .await?;

        debug!(
            iterations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "derived KEK"
        );
        Ok(key)
    }

    /// Runs `job` on the blocking pool once a permit is free.
    pub async fn run<T, F>(&self, job: F) -> KeyResult<T>
    where
        F: FnOnce() -> KeyResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KeyError::Worker("KDF pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await?
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
