//! Password-based key derivation (Argon2id)

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("Invalid KDF parameters: {0}")]
    InvalidParams(String),
    #[error("Password hashing failed: {0}")]
    HashFailed(String),
}

/// Argon2id work factor.
///
/// Stored next to the locked seed so a record can always be reopened with the
/// parameters it was sealed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_kib: 19 * 1024,
            iterations: 2,
            lanes: 1,
        }
    }
}

impl KdfParams {
    /// Minimal work factor. Only suitable for tests and throwaway accounts.
    pub fn light() -> Self {
        Self {
            mem_kib: 64,
            iterations: 1,
            lanes: 1,
        }
    }
}

/// Stretch a password into a 32-byte unlocking key.
///
/// `salt` is the account's public key-agreement key, so two accounts with the
/// same password never share an unlocking key.
pub fn password_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, KdfError> {
    let params = Params::new(params.mem_kib, params.iterations, params.lanes, Some(32))
        .map_err(|e| KdfError::InvalidParams(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| KdfError::HashFailed(e.to_string()))?;
    Ok(out)
}
