//! Secure credential store.
//!
//! Layout under the storage directory:
//!
//! ```text
//! profiles.toml              host profiles (no secrets)
//! credentials/<id>.toml      one sealed credential per profile
//! ```
//!
//! Every file is replaced atomically (temp file, fsync, rename) and is
//! readable by the owner only. Operations on different profile ids never
//! contend; writes to the same id are serialized by a per-id lock.

pub mod credential;
pub mod profile;
pub mod unlock;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use credential::{Credential, CredentialMeta};
pub use profile::{AuthMethod, HostProfile, ProfileId};
pub use unlock::{EnvKeySource, KeySource, MASTER_PASSWORD_ENV, MasterKey, MasterPassword};

use crate::crypto::{self, CipherError, KdfParams};
use crate::error::ErrorKind;
use credential::CredentialRecord;

/// Maximum size of any store file (1MB).
const MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Profiles file name.
const PROFILES_FILE: &str = "profiles.toml";

/// Credential directory name.
const CREDENTIALS_DIR: &str = "credentials";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// File too large.
    #[error("File too large (max {MAX_FILE_SIZE} bytes)")]
    FileTooLarge,

    /// No record for the id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record failed verification.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Record's key derivation data is unusable.
    #[error("Key error: {0}")]
    Key(String),

    /// Unlock secret unavailable.
    #[error("Master password required")]
    AuthRequired,

    /// Caller supplied an invalid value.
    #[error("Invalid: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Returns the stable error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Parse(_) | Self::Serialize(_) | Self::FileTooLarge => ErrorKind::Storage,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Key(_) => ErrorKind::Key,
            Self::AuthRequired => ErrorKind::AuthRequired,
            Self::Invalid(_) => ErrorKind::InvalidState,
        }
    }
}

impl From<CipherError> for StoreError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Integrity(detail) => Self::Integrity(detail),
            CipherError::Key(detail) => Self::Key(detail),
        }
    }
}

/// Profiles file structure.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: Vec<HostProfile>,
}

/// Persistent store of host profiles and sealed credentials.
#[derive(Debug)]
pub struct CredentialStore {
    /// Storage directory.
    dir: PathBuf,
    /// Parameters used when sealing new records.
    kdf: KdfParams,
    /// Profiles, loaded at open.
    profiles: RwLock<BTreeMap<ProfileId, HostProfile>>,
    /// Serializes writers of `profiles.toml`.
    profiles_write: Mutex<()>,
    /// Per-id record locks.
    locks: Mutex<HashMap<ProfileId, Arc<RwLock<()>>>>,
}

impl CredentialStore {
    /// Returns the default storage directory: `~/.ratssh`.
    #[must_use]
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ratssh")
    }

    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, kdf: KdfParams) -> Result<Self, StoreError> {
        let dir = dir.into();
        assert!(!dir.as_os_str().is_empty(), "dir must not be empty");

        create_private_dir(&dir)?;
        create_private_dir(&dir.join(CREDENTIALS_DIR))?;

        let profiles_path = dir.join(PROFILES_FILE);
        let file: ProfilesFile = match read_bounded(&profiles_path)? {
            Some(content) => toml::from_str(&content)?,
            None => ProfilesFile::default(),
        };

        let profiles: BTreeMap<_, _> = file
            .profiles
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        info!(dir = %dir.display(), profiles = profiles.len(), "Credential store opened");

        Ok(Self {
            dir,
            kdf,
            profiles: RwLock::new(profiles),
            profiles_write: Mutex::new(()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the parameters used for new records.
    #[must_use]
    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf
    }

    // ------------------------------------------------------------------
    // Opaque secrets
    // ------------------------------------------------------------------

    /// Seals `secret` for `id` and persists it before returning.
    pub fn put(&self, id: &ProfileId, secret: &[u8], keys: &dyn KeySource) -> Result<(), StoreError> {
        let master = keys.unlock()?;
        let lock = self.lock_for(id);
        let _guard = lock.write().map_err(|_| poisoned())?;

        self.seal_locked(id, secret, master.expose())?;
        debug!(profile = %id, "Credential sealed");
        Ok(())
    }

    /// Opens the secret stored for `id`.
    pub fn get(&self, id: &ProfileId, keys: &dyn KeySource) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let master = keys.unlock()?;
        let lock = self.lock_for(id);
        let _guard = lock.read().map_err(|_| poisoned())?;

        self.open_locked(id, master.expose())
    }

    /// Removes the credential for `id`.
    pub fn delete(&self, id: &ProfileId) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.write().map_err(|_| poisoned())?;

        let path = self.credential_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(profile = %id, "Credential deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("credential '{id}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists stored credentials without decrypting anything.
    pub fn list(&self) -> Result<Vec<CredentialMeta>, StoreError> {
        let mut metas = Vec::new();

        for entry in fs::read_dir(self.dir.join(CREDENTIALS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| ProfileId::new(s).ok())
            else {
                continue;
            };

            let meta = match self.read_record(&path) {
                Ok(Some(record)) => record.meta(id),
                Ok(None) => continue,
                Err(e) => {
                    // Listed, never removed.
                    warn!(profile = %id, error = %e, "Unreadable credential record");
                    CredentialMeta {
                        profile_id: id,
                        kdf: None,
                        created_at: None,
                        updated_at: None,
                    }
                }
            };
            metas.push(meta);
        }

        metas.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        Ok(metas)
    }

    /// Returns true if the record for `id` was sealed with weaker costs
    /// than the configured ones.
    pub fn needs_rekey(&self, id: &ProfileId) -> Result<bool, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.read().map_err(|_| poisoned())?;

        let record = self
            .read_record(&self.credential_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("credential '{id}'")))?;
        let kdf = record
            .kdf
            .ok_or_else(|| StoreError::Key("key derivation parameters missing".to_string()))?;
        Ok(kdf.needs_upgrade(&self.kdf))
    }

    /// Re-seals the record for `id` with the configured costs. Holds the
    /// record's write lock from decryption to rewrite, so a concurrent
    /// [`Self::put`] lands either before or after, never in between.
    pub fn rekey(&self, id: &ProfileId, keys: &dyn KeySource) -> Result<(), StoreError> {
        let master = keys.unlock()?;
        let lock = self.lock_for(id);
        let _guard = lock.write().map_err(|_| poisoned())?;

        let secret = self.open_locked(id, master.expose())?;
        self.seal_locked(id, &secret, master.expose())?;
        info!(profile = %id, "Credential re-sealed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed credentials
    // ------------------------------------------------------------------

    /// Seals a typed credential for `id`.
    pub fn put_credential(
        &self,
        id: &ProfileId,
        credential: &Credential,
        keys: &dyn KeySource,
    ) -> Result<(), StoreError> {
        if matches!(credential, Credential::Agent) {
            return Err(StoreError::Invalid("agent credentials are not stored".to_string()));
        }
        let secret = credential.to_secret()?;
        self.put(id, &secret, keys)
    }

    /// Opens the typed credential for `id`.
    pub fn get_credential(&self, id: &ProfileId, keys: &dyn KeySource) -> Result<Credential, StoreError> {
        let secret = self.get(id, keys)?;
        Credential::from_secret(&secret)
    }

    /// Returns the credential a profile authenticates with.
    pub fn credential_for(&self, profile: &HostProfile, keys: &dyn KeySource) -> Result<Credential, StoreError> {
        match (profile.auth, &profile.credential_id) {
            (AuthMethod::Agent, _) => Ok(Credential::Agent),
            (_, Some(cred_id)) => self.get_credential(cred_id, keys),
            (_, None) => Err(StoreError::NotFound(format!(
                "profile '{}' has no stored credential",
                profile.id
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Inserts or replaces a profile, sealing `secret` when given.
    ///
    /// Without a secret, an existing credential is kept.
    pub fn upsert_profile(
        &self,
        mut profile: HostProfile,
        secret: Option<&Credential>,
        keys: &dyn KeySource,
    ) -> Result<HostProfile, StoreError> {
        profile.validate()?;

        if profile.auth.needs_secret() {
            match secret {
                Some(Credential::Agent) => {
                    return Err(StoreError::Invalid(format!(
                        "{} profile needs a {} credential",
                        profile.auth.as_str(),
                        profile.auth.as_str()
                    )));
                }
                Some(credential) => {
                    self.put_credential(&profile.id, credential, keys)?;
                    profile.credential_id = Some(profile.id.clone());
                }
                None => {
                    let existing = self.profile(&profile.id).and_then(|p| p.credential_id);
                    if existing.is_none() && profile.credential_id.is_none() {
                        return Err(StoreError::Invalid(format!(
                            "profile '{}' needs a credential",
                            profile.id
                        )));
                    }
                    profile.credential_id = profile.credential_id.or(existing);
                }
            }
        } else {
            profile.credential_id = None;
        }

        self.mutate_profiles(|profiles| {
            profiles.insert(profile.id.clone(), profile.clone());
        })?;

        info!(profile = %profile.id, identity = %profile.identity(), "Profile saved");
        Ok(profile)
    }

    /// Returns a profile by id.
    #[must_use]
    pub fn profile(&self, id: &ProfileId) -> Option<HostProfile> {
        self.profiles.read().ok().and_then(|p| p.get(id).cloned())
    }

    /// Returns every profile, ordered by id.
    #[must_use]
    pub fn list_profiles(&self) -> Vec<HostProfile> {
        self.profiles
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Deletes a profile and its credential.
    pub fn delete_profile(&self, id: &ProfileId) -> Result<(), StoreError> {
        let mut removed = None;
        self.mutate_profiles(|profiles| removed = profiles.remove(id))?;

        let Some(profile) = removed else {
            return Err(StoreError::NotFound(format!("profile '{id}'")));
        };

        if let Some(cred_id) = &profile.credential_id {
            match self.delete(cred_id) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(profile = %id, "Profile deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Decrypts the record for `id`. Caller holds its lock.
    fn open_locked(&self, id: &ProfileId, master: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let record = self
            .read_record(&self.credential_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("credential '{id}'")))?;

        if record.profile_id != id.as_str() {
            return Err(StoreError::Integrity(format!(
                "record belongs to '{}', not '{id}'",
                record.profile_id
            )));
        }

        let sealed = record.to_sealed()?;
        crypto::open(&sealed, master, id.as_str().as_bytes()).map_err(|e| {
            warn!(profile = %id, error = %e, "Credential failed to open");
            StoreError::from(e)
        })
    }

    /// Seals and atomically writes the record for `id`. Caller holds its
    /// write lock.
    fn seal_locked(&self, id: &ProfileId, secret: &[u8], master: &[u8]) -> Result<(), StoreError> {
        let path = self.credential_path(id);
        let created_at = self.read_record(&path)?.and_then(|r| r.created_at);

        let sealed = crypto::seal(secret, master, &self.kdf, id.as_str().as_bytes())?;
        let record = CredentialRecord::from_sealed(id, &sealed, created_at);
        write_atomic(&path, toml::to_string_pretty(&record)?.as_bytes())?;
        Ok(())
    }

    fn lock_for(&self, id: &ProfileId) -> Arc<RwLock<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    fn credential_path(&self, id: &ProfileId) -> PathBuf {
        self.dir.join(CREDENTIALS_DIR).join(format!("{id}.toml"))
    }

    fn read_record(&self, path: &Path) -> Result<Option<CredentialRecord>, StoreError> {
        let Some(content) = read_bounded(path)? else {
            return Ok(None);
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Integrity(format!("credential record unreadable: {e}")))
    }

    /// Applies `f` to the profile map and persists the result.
    fn mutate_profiles<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<ProfileId, HostProfile>),
    {
        let _writer = self.profiles_write.lock().map_err(|_| poisoned())?;

        let mut next = self.profiles.read().map_err(|_| poisoned())?.clone();
        f(&mut next);

        let file = ProfilesFile {
            profiles: next.values().cloned().collect(),
        };
        write_atomic(&self.dir.join(PROFILES_FILE), toml::to_string_pretty(&file)?.as_bytes())?;

        *self.profiles.write().map_err(|_| poisoned())? = next;
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Io(io::Error::other("store lock poisoned"))
}

/// Reads a file if it exists, refusing oversized files.
pub(crate) fn read_bounded(path: &Path) -> Result<Option<String>, StoreError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if metadata.len() > MAX_FILE_SIZE {
        return Err(StoreError::FileTooLarge);
    }
    Ok(Some(fs::read_to_string(path)?))
}

fn create_private_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Replaces `path` with `content`: temp file, fsync, rename.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let temp_path = path.with_extension("toml.tmp");

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        if let Some(parent) = path.parent() {
            fs::File::open(parent)?.sync_all()?;
        }
    }

    Ok(())
}
