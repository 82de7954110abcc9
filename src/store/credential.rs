//! Credential payloads and their sealed on-disk records.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::StoreError;
use super::profile::ProfileId;
use crate::crypto::{EncryptedCredential, KdfParams};

/// Record format version written by this build.
const RECORD_VERSION: u32 = 1;

/// AEAD identifier written into records.
const AEAD_ALGORITHM: &str = "xchacha20poly1305";

/// Decrypted authentication material.
///
/// Every secret field zeroes itself on drop; `Debug` never prints them.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Account password.
    Password {
        /// The password.
        password: Zeroizing<String>,
    },
    /// PEM-encoded private key.
    PrivateKey {
        /// Key material.
        pem: Zeroizing<String>,
        /// Passphrase protecting the key, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<Zeroizing<String>>,
    },
    /// Authentication through the local agent.
    Agent,
}

impl Credential {
    /// Password credential.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Zeroizing::new(password.into()),
        }
    }

    /// Private-key credential.
    #[must_use]
    pub fn private_key(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKey {
            pem: Zeroizing::new(pem.into()),
            passphrase: passphrase.map(Zeroizing::new),
        }
    }

    /// Returns the method name without exposing secrets.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::PrivateKey { .. } => "private_key",
            Self::Agent => "agent",
        }
    }

    /// Serializes into a scoped secret buffer.
    pub(crate) fn to_secret(&self) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| StoreError::Invalid(format!("credential encoding failed: {e}")))
    }

    /// Parses a decrypted secret buffer.
    pub(crate) fn from_secret(secret: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(secret)
            .map_err(|e| StoreError::Integrity(format!("credential payload malformed: {e}")))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.debug_struct("Password").field("password", &"[redacted]").finish(),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("pem", &"[redacted]")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Metadata about a stored credential. Holds no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialMeta {
    /// Owning profile.
    pub profile_id: ProfileId,
    /// Derivation parameters of the sealing key, if readable.
    pub kdf: Option<KdfParams>,
    /// When the record was first written.
    pub created_at: Option<DateTime<Utc>>,
    /// When the record was last re-sealed.
    pub updated_at: Option<DateTime<Utc>>,
}

/// On-disk form of a sealed credential (`credentials/<id>.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CredentialRecord {
    pub version: u32,
    pub profile_id: String,
    pub aead: String,
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub kdf: Option<KdfParams>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Encodes a sealed credential for `profile_id`.
    pub fn from_sealed(
        profile_id: &ProfileId,
        sealed: &EncryptedCredential,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: RECORD_VERSION,
            profile_id: profile_id.to_string(),
            aead: AEAD_ALGORITHM.to_string(),
            ciphertext: STANDARD.encode(&sealed.ciphertext),
            nonce: STANDARD.encode(&sealed.nonce),
            tag: STANDARD.encode(&sealed.tag),
            salt: Some(STANDARD.encode(&sealed.salt)),
            kdf: Some(sealed.kdf.clone()),
            created_at: Some(created_at.unwrap_or(now)),
            updated_at: Some(now),
        }
    }

    /// Decodes the sealed credential.
    ///
    /// Missing or undecodable derivation data is a key error; anything wrong
    /// with the ciphertext, nonce, or tag is an integrity error.
    pub fn to_sealed(&self) -> Result<EncryptedCredential, StoreError> {
        if self.aead != AEAD_ALGORITHM {
            return Err(StoreError::Key(format!("unsupported cipher '{}'", self.aead)));
        }

        let kdf = self
            .kdf
            .clone()
            .ok_or_else(|| StoreError::Key("key derivation parameters missing".to_string()))?;
        let salt = self
            .salt
            .as_deref()
            .ok_or_else(|| StoreError::Key("key derivation salt missing".to_string()))?;
        let salt = STANDARD
            .decode(salt)
            .map_err(|e| StoreError::Key(format!("key derivation salt malformed: {e}")))?;

        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| StoreError::Integrity(format!("{field} malformed: {e}")))
        };

        Ok(EncryptedCredential {
            ciphertext: decode("ciphertext", &self.ciphertext)?,
            nonce: decode("nonce", &self.nonce)?,
            tag: decode("tag", &self.tag)?,
            kdf,
            salt,
        })
    }

    /// Metadata view.
    pub fn meta(&self, profile_id: ProfileId) -> CredentialMeta {
        CredentialMeta {
            profile_id,
            kdf: self.kdf.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::error::ErrorKind;

    fn sealed() -> EncryptedCredential {
        crypto::seal(b"secret", b"master", &KdfParams::argon2id(8, 1, 1), b"web").unwrap()
    }

    #[test]
    fn test_credential_secret_roundtrip() {
        let cred = Credential::private_key("-----BEGIN KEY-----", Some("pp".to_string()));
        let bytes = cred.to_secret().unwrap();
        match Credential::from_secret(&bytes).unwrap() {
            Credential::PrivateKey { pem, passphrase } => {
                assert_eq!(pem.as_str(), "-----BEGIN KEY-----");
                assert_eq!(passphrase.unwrap().as_str(), "pp");
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn test_debug_redacts() {
        let printed = format!("{:?}", Credential::password("hunter2"));
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_record_roundtrip() {
        let id = ProfileId::new("web").unwrap();
        let sealed = sealed();
        let record = CredentialRecord::from_sealed(&id, &sealed, None);
        let text = toml::to_string_pretty(&record).unwrap();
        let parsed: CredentialRecord = toml::from_str(&text).unwrap();
        assert_eq!(parsed.to_sealed().unwrap(), sealed);
    }

    #[test]
    fn test_record_missing_kdf_is_key_error() {
        let id = ProfileId::new("web").unwrap();
        let mut record = CredentialRecord::from_sealed(&id, &sealed(), None);
        record.kdf = None;
        assert_eq!(record.to_sealed().unwrap_err().kind(), ErrorKind::Key);

        let mut record = CredentialRecord::from_sealed(&id, &sealed(), None);
        record.salt = Some("***".to_string());
        assert_eq!(record.to_sealed().unwrap_err().kind(), ErrorKind::Key);
    }

    #[test]
    fn test_record_bad_tag_encoding_is_integrity_error() {
        let id = ProfileId::new("web").unwrap();
        let mut record = CredentialRecord::from_sealed(&id, &sealed(), None);
        record.tag = "not base64!".to_string();
        assert_eq!(record.to_sealed().unwrap_err().kind(), ErrorKind::Integrity);
    }
}
