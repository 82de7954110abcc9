//! Unlock-secret sources.
//!
//! A [`KeySource`] hands the store the secret every credential key is
//! derived from. When the secret is unavailable the store reports
//! `AuthRequired` instead of touching any record.

use std::env;
use std::fmt;
use std::sync::RwLock;

use zeroize::Zeroizing;

use super::StoreError;

/// Environment variable read by [`EnvKeySource`].
pub const MASTER_PASSWORD_ENV: &str = "RATSSH_MASTER_PASSWORD";

/// Unlock secret handed to the key derivation function.
pub struct MasterKey(Zeroizing<Vec<u8>>);

impl MasterKey {
    /// Wraps secret bytes.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// Returns the secret bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

/// Platform secret-unlock collaborator.
pub trait KeySource: Send + Sync {
    /// Returns the unlock secret.
    ///
    /// # Errors
    /// Returns [`StoreError::AuthRequired`] when the secret is unavailable.
    fn unlock(&self) -> Result<MasterKey, StoreError>;
}

/// An in-memory master password that can be locked again.
#[derive(Default)]
pub struct MasterPassword {
    secret: RwLock<Option<Zeroizing<String>>>,
}

impl MasterPassword {
    /// Creates an unlocked source.
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            secret: RwLock::new(Some(Zeroizing::new(password.into()))),
        }
    }

    /// Creates a locked source.
    #[must_use]
    pub fn locked() -> Self {
        Self::default()
    }

    /// Sets the password, unlocking the source.
    pub fn set(&self, password: impl Into<String>) {
        if let Ok(mut guard) = self.secret.write() {
            *guard = Some(Zeroizing::new(password.into()));
        }
    }

    /// Forgets the password.
    pub fn lock(&self) {
        if let Ok(mut guard) = self.secret.write() {
            *guard = None;
        }
    }

    /// Returns true if a password is held.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.secret.read().map(|g| g.is_some()).unwrap_or(false)
    }
}

impl KeySource for MasterPassword {
    fn unlock(&self) -> Result<MasterKey, StoreError> {
        let guard = self.secret.read().map_err(|_| StoreError::AuthRequired)?;
        match guard.as_ref() {
            Some(password) if !password.is_empty() => Ok(MasterKey::new(password.as_bytes())),
            _ => Err(StoreError::AuthRequired),
        }
    }
}

impl fmt::Debug for MasterPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterPassword")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

/// Reads the master password from an environment variable on each unlock.
#[derive(Debug, Clone)]
pub struct EnvKeySource {
    var: String,
}

impl Default for EnvKeySource {
    fn default() -> Self {
        Self::with_var(MASTER_PASSWORD_ENV)
    }
}

impl EnvKeySource {
    /// Reads from a custom variable.
    #[must_use]
    pub fn with_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl KeySource for EnvKeySource {
    fn unlock(&self) -> Result<MasterKey, StoreError> {
        match env::var(&self.var) {
            Ok(value) if !value.is_empty() => Ok(MasterKey::new(Zeroizing::new(value).as_bytes())),
            _ => Err(StoreError::AuthRequired),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_master_password_lock_cycle() {
        let source = MasterPassword::new("correct horse");
        assert_eq!(source.unlock().unwrap().expose(), b"correct horse");

        source.lock();
        assert!(!source.is_unlocked());
        assert_eq!(source.unlock().unwrap_err().kind(), ErrorKind::AuthRequired);

        source.set("battery staple");
        assert_eq!(source.unlock().unwrap().expose(), b"battery staple");
    }

    #[test]
    fn test_empty_password_is_locked() {
        let source = MasterPassword::new("");
        assert_eq!(source.unlock().unwrap_err().kind(), ErrorKind::AuthRequired);
    }

    #[test]
    fn test_env_source_missing_var() {
        let source = EnvKeySource::with_var("RATSSH_TEST_VAR_THAT_IS_NEVER_SET_9F2C");
        assert_eq!(source.unlock().unwrap_err().kind(), ErrorKind::AuthRequired);
    }

    #[test]
    fn test_debug_redacts() {
        let key = MasterKey::new(b"secret".to_vec());
        assert!(!format!("{:?}", key).contains("secret"));
        assert!(!format!("{:?}", MasterPassword::new("pw")).contains("pw\""));
    }
}
