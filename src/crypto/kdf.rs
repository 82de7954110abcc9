//! Memory-hard key derivation.
//!
//! Keys are derived with Argon2id. The cost parameters travel with every
//! sealed record so they can be raised later without breaking old records.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::CipherError;

/// Derived key length in bytes.
pub const KEY_LEN: usize = 32;

/// Salt length generated for new records.
pub const SALT_LEN: usize = 16;

/// Minimum salt length accepted when reading records.
const MIN_SALT_LEN: usize = 8;

/// Algorithm identifier stored in records.
pub const KDF_ALGORITHM: &str = "argon2id";

/// Upper bound on memory cost accepted from a record (1 GiB).
const MAX_MEMORY_KIB: u32 = 1024 * 1024;

/// Upper bound on iterations accepted from a record.
const MAX_ITERATIONS: u32 = 64;

/// Upper bound on lanes accepted from a record.
const MAX_PARALLELISM: u32 = 16;

/// Key derivation parameters, persisted beside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Algorithm name (only `argon2id`).
    pub algorithm: String,
    /// Argon2 version number (0x13 or 0x10).
    pub version: u32,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id(19 * 1024, 2, 1)
    }
}

impl KdfParams {
    /// Creates Argon2id parameters with the given costs.
    #[must_use]
    pub fn argon2id(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KDF_ALGORITHM.to_string(),
            version: 0x13,
            memory_kib,
            iterations,
            parallelism,
        }
    }

    /// Returns true if a record sealed with `self` is weaker than `current`.
    #[must_use]
    pub fn needs_upgrade(&self, current: &KdfParams) -> bool {
        self.algorithm != current.algorithm
            || self.version < current.version
            || self.memory_kib < current.memory_kib
            || self.iterations < current.iterations
    }

    /// Validates the parameters and converts them for the argon2 crate.
    fn to_argon2(&self) -> Result<Argon2<'static>, CipherError> {
        if self.algorithm != KDF_ALGORITHM {
            return Err(CipherError::Key(format!(
                "unsupported kdf algorithm '{}'",
                self.algorithm
            )));
        }

        let version = match self.version {
            0x13 => Version::V0x13,
            0x10 => Version::V0x10,
            other => {
                return Err(CipherError::Key(format!(
                    "unsupported argon2 version {other:#x}"
                )));
            }
        };

        if self.memory_kib > MAX_MEMORY_KIB
            || self.iterations > MAX_ITERATIONS
            || self.parallelism > MAX_PARALLELISM
        {
            return Err(CipherError::Key("kdf cost parameters out of range".to_string()));
        }

        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CipherError::Key(format!("invalid kdf parameters: {e}")))?;

        Ok(Argon2::new(Algorithm::Argon2id, version, params))
    }
}

/// A derived symmetric key, remembering how it was derived.
///
/// The key bytes are zeroed on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
    salt: Vec<u8>,
    params: KdfParams,
}

impl DerivedKey {
    /// Wraps raw key bytes. Used for keys not produced by [`derive_key`].
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN], salt: Vec<u8>, params: KdfParams) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            salt,
            params,
        }
    }

    /// Returns the raw key bytes.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Returns the salt used during derivation.
    #[must_use]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Returns the derivation parameters.
    #[must_use]
    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[redacted]")
            .field("params", &self.params)
            .finish()
    }
}

/// Derives a key from a secret with Argon2id.
///
/// # Errors
/// Returns [`CipherError::Key`] if the parameters or salt are invalid.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedKey, CipherError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CipherError::Key(format!(
            "salt too short ({} bytes, need {MIN_SALT_LEN})",
            salt.len()
        )));
    }

    let argon = params.to_argon2()?;
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(secret, salt, &mut *bytes)
        .map_err(|e| CipherError::Key(format!("key derivation failed: {e}")))?;

    Ok(DerivedKey {
        bytes,
        salt: salt.to_vec(),
        params: params.clone(),
    })
}

/// Generates a fresh random salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
