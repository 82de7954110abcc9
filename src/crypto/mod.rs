//! Credential cipher.
//!
//! Seals secrets with XChaCha20-Poly1305 under a key derived by
//! [`kdf::derive_key`]. Decrypted plaintext is always returned inside
//! [`Zeroizing`] so it is scrubbed when the caller drops it, including on
//! error paths.
//!
//! The cipher holds no shared state; every function is safe to call from
//! any number of threads at once.

pub mod kdf;

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

pub use kdf::{DerivedKey, KEY_LEN, KdfParams, SALT_LEN, derive_key, generate_salt};

use crate::error::ErrorKind;

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Cipher failures.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Tag did not verify: wrong key or tampered record.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Key derivation parameters missing or corrupted.
    #[error("Key error: {0}")]
    Key(String),
}

impl CipherError {
    /// Returns the stable error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Key(_) => ErrorKind::Key,
        }
    }
}

/// A sealed secret: ciphertext plus everything needed to open it
/// except the unlock secret itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCredential {
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Random nonce.
    pub nonce: Vec<u8>,
    /// Detached authentication tag.
    pub tag: Vec<u8>,
    /// Derivation parameters of the sealing key.
    pub kdf: KdfParams,
    /// Derivation salt of the sealing key.
    pub salt: Vec<u8>,
}

/// Encrypts `plaintext` under an already derived key.
///
/// # Errors
/// Returns [`CipherError::Key`] if the AEAD refuses the input.
pub fn encrypt(plaintext: &[u8], key: &DerivedKey) -> Result<EncryptedCredential, CipherError> {
    encrypt_with_aad(plaintext, key, &[])
}

/// Encrypts `plaintext`, authenticating `aad` alongside it.
///
/// # Errors
/// Returns [`CipherError::Key`] if the AEAD refuses the input.
pub fn encrypt_with_aad(
    plaintext: &[u8],
    key: &DerivedKey,
    aad: &[u8],
) -> Result<EncryptedCredential, CipherError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    // Holds plaintext until encryption succeeds.
    let mut buffer = Zeroizing::new(plaintext.to_vec());
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, buffer.as_mut_slice())
        .map_err(|_| CipherError::Key("encryption rejected input".to_string()))?;

    Ok(EncryptedCredential {
        ciphertext: buffer.to_vec(),
        nonce: nonce.to_vec(),
        tag: tag.to_vec(),
        kdf: key.params().clone(),
        salt: key.salt().to_vec(),
    })
}

/// Decrypts a credential with an already derived key.
///
/// # Errors
/// Returns [`CipherError::Integrity`] if the key is wrong or the record was
/// tampered with.
pub fn decrypt(cred: &EncryptedCredential, key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    decrypt_with_aad(cred, key, &[])
}

/// Decrypts a credential, verifying `aad`.
///
/// # Errors
/// Returns [`CipherError::Integrity`] if the key, the associated data, or
/// any part of the record does not verify.
pub fn decrypt_with_aad(
    cred: &EncryptedCredential,
    key: &DerivedKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    if cred.nonce.len() != NONCE_LEN {
        return Err(CipherError::Integrity(format!(
            "nonce has {} bytes, expected {NONCE_LEN}",
            cred.nonce.len()
        )));
    }
    if cred.tag.len() != TAG_LEN {
        return Err(CipherError::Integrity(format!(
            "tag has {} bytes, expected {TAG_LEN}",
            cred.tag.len()
        )));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut buffer = Zeroizing::new(cred.ciphertext.clone());

    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&cred.nonce),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(&cred.tag),
        )
        .map_err(|_| CipherError::Integrity("tag verification failed".to_string()))?;

    Ok(buffer)
}

/// Derives a fresh key from `secret` and seals `plaintext` with it.
///
/// # Errors
/// Returns [`CipherError::Key`] if the parameters are invalid.
pub fn seal(
    plaintext: &[u8],
    secret: &[u8],
    params: &KdfParams,
    aad: &[u8],
) -> Result<EncryptedCredential, CipherError> {
    let salt = generate_salt();
    let key = derive_key(secret, &salt, params)?;
    encrypt_with_aad(plaintext, &key, aad)
}

/// Re-derives the record's key from `secret` and opens it.
///
/// # Errors
/// Returns [`CipherError::Key`] for corrupted derivation parameters and
/// [`CipherError::Integrity`] for a wrong secret or a tampered record.
pub fn open(
    cred: &EncryptedCredential,
    secret: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let key = derive_key(secret, &cred.salt, &cred.kdf)?;
    decrypt_with_aad(cred, &key, aad)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cheap() -> KdfParams {
        KdfParams::argon2id(8, 1, 1)
    }

    fn key(secret: &[u8]) -> DerivedKey {
        derive_key(secret, &[9u8; SALT_LEN], &cheap()).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let k = key(b"master");
        let cred = encrypt(b"hunter2", &k).unwrap();
        assert_ne!(cred.ciphertext.as_slice(), b"hunter2");
        assert_eq!(cred.nonce.len(), NONCE_LEN);
        assert_eq!(cred.tag.len(), TAG_LEN);
        assert_eq!(cred.kdf, cheap());

        let plain = decrypt(&cred, &k).unwrap();
        assert_eq!(plain.as_slice(), b"hunter2");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let k = key(b"master");
        let a = encrypt(b"same", &k).unwrap();
        let b = encrypt(b"same", &k).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let cred = encrypt(b"hunter2", &key(b"master")).unwrap();
        let err = decrypt(&cred, &key(b"wrong")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_tampering_is_integrity_error() {
        let k = key(b"master");
        let cred = encrypt(b"hunter2", &k).unwrap();

        let mut flipped = cred.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert_eq!(decrypt(&flipped, &k).unwrap_err().kind(), ErrorKind::Integrity);

        let mut bad_tag = cred.clone();
        bad_tag.tag[3] ^= 0x80;
        assert_eq!(decrypt(&bad_tag, &k).unwrap_err().kind(), ErrorKind::Integrity);

        let mut bad_nonce = cred.clone();
        bad_nonce.nonce[0] ^= 0x01;
        assert_eq!(decrypt(&bad_nonce, &k).unwrap_err().kind(), ErrorKind::Integrity);

        let mut short_nonce = cred;
        short_nonce.nonce.truncate(12);
        assert_eq!(decrypt(&short_nonce, &k).unwrap_err().kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_aad_binding() {
        let k = key(b"master");
        let cred = encrypt_with_aad(b"secret", &k, b"profile-a").unwrap();
        assert!(decrypt_with_aad(&cred, &k, b"profile-a").is_ok());
        assert_eq!(
            decrypt_with_aad(&cred, &k, b"profile-b").unwrap_err().kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_seal_open() {
        let cred = seal(b"pem-bytes", b"master", &cheap(), b"id").unwrap();
        assert_eq!(cred.salt.len(), SALT_LEN);
        assert_eq!(open(&cred, b"master", b"id").unwrap().as_slice(), b"pem-bytes");
        assert_eq!(open(&cred, b"nope", b"id").unwrap_err().kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_open_with_corrupted_kdf_is_key_error() {
        let mut cred = seal(b"pem-bytes", b"master", &cheap(), b"").unwrap();
        cred.kdf.algorithm.clear();
        assert_eq!(open(&cred, b"master", b"").unwrap_err().kind(), ErrorKind::Key);

        let mut cred = seal(b"pem-bytes", b"master", &cheap(), b"").unwrap();
        cred.salt.clear();
        assert_eq!(open(&cred, b"master", b"").unwrap_err().kind(), ErrorKind::Key);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_decrypt_inverts_encrypt(secret in proptest::collection::vec(any::<u8>(), 0..512)) {
            let k = key(b"master");
            let cred = encrypt(&secret, &k).unwrap();
            let plain = decrypt(&cred, &k).unwrap();
            prop_assert_eq!(plain.as_slice(), secret.as_slice());
        }

        #[test]
        fn prop_single_bit_flip_never_decrypts(
            secret in proptest::collection::vec(any::<u8>(), 1..128),
            bit in 0usize..1024,
        ) {
            let k = key(b"master");
            let mut cred = encrypt(&secret, &k).unwrap();
            let idx = (bit / 8) % cred.ciphertext.len();
            cred.ciphertext[idx] ^= 1 << (bit % 8);
            prop_assert_eq!(decrypt(&cred, &k).unwrap_err().kind(), ErrorKind::Integrity);
        }
    }
}
