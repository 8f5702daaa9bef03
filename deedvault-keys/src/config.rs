//! Key service configuration.

use crate::error::{KeyError, KeyResult};
use deedvault_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Argon2 refuses less than 8 KiB of memory per lane.
const ARGON2_MIN_KIB_PER_LANE: u32 = 8;

/// Configuration for the key service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyServiceConfig {
    /// Argon2id memory and lane settings. `kdf.iterations` is the time cost
    /// handed to newly registered users; existing users keep theirs.
    pub kdf: KdfParams,

    /// Lowest per-user iteration count accepted at derivation time.
    pub min_kdf_iterations: u32,

    /// Derivations allowed to run at once on the blocking pool.
    pub kdf_max_concurrency: usize,

    /// Upper bound on any relation/grant lookup, in milliseconds.
    pub permission_lookup_timeout_ms: u64,

    /// How long an unlocked session stays usable (seconds).
    pub session_ttl_secs: u64,

    /// Wrapped keys processed per rotation chunk.
    pub rotation_batch_size: usize,

    /// Lets a grantee with an explicit re-share right share onwards.
    pub allow_reshare: bool,
}

impl Default for KeyServiceConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            min_kdf_iterations: 2,
            kdf_max_concurrency: 2,
            permission_lookup_timeout_ms: 2_000,
            session_ttl_secs: 15 * 60,
            rotation_batch_size: 256,
            allow_reshare: false,
        }
    }
}

impl KeyServiceConfig {
    /// Parses a JSON config. Missing fields fall back to defaults.
    pub fn from_json_str(json: &str) -> KeyResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KeyError::InvalidConfig(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn from_json_file(path: &Path) -> KeyResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KeyError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> KeyResult<()> {
        let invalid = |msg: String| Err(KeyError::InvalidConfig(msg));

        if self.kdf.parallelism == 0 {
            return invalid("kdf.parallelism must be at least 1".into());
        }
        let min_memory = ARGON2_MIN_KIB_PER_LANE * self.kdf.parallelism;
        if self.kdf.memory_cost_kib < min_memory {
            return invalid(format!(
                "kdf.memory_cost_kib must be at least {min_memory} for {} lane(s)",
                self.kdf.parallelism
            ));
        }
        if self.min_kdf_iterations == 0 {
            return invalid("min_kdf_iterations must be at least 1".into());
        }
        if self.kdf.iterations < self.min_kdf_iterations {
            return invalid(format!(
                "kdf.iterations ({}) is below min_kdf_iterations ({})",
                self.kdf.iterations, self.min_kdf_iterations
            ));
        }
        if self.kdf_max_concurrency == 0 {
            return invalid("kdf_max_concurrency must be at least 1".into());
        }
        if self.permission_lookup_timeout_ms == 0 {
            return invalid("permission_lookup_timeout_ms must be positive".into());
        }
        if self.session_ttl_secs == 0 {
            return invalid("session_ttl_secs must be positive".into());
        }
        if self.rotation_batch_size == 0 {
            return invalid("rotation_batch_size must be at least 1".into());
        }
        Ok(())
    }

    pub fn permission_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_lookup_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
