//! Pinned host keys.
//!
//! Stored as `known_hosts.toml` in the storage directory, one entry per
//! `host:port`. Only the SHA-256 fingerprint is compared.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::HostKey;
use crate::store::{StoreError, read_bounded, write_atomic};

/// File name inside the storage directory.
pub const KNOWN_HOSTS_FILE: &str = "known_hosts.toml";

/// A pinned host key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHost {
    /// `host:port`.
    pub host: String,
    /// Key algorithm (ssh-ed25519, ssh-rsa, ...).
    pub key_type: String,
    /// SHA256 fingerprint.
    pub fingerprint: String,
    /// When the key was pinned.
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownHostsFile {
    #[serde(default)]
    hosts: Vec<KnownHost>,
}

/// Verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Presented key matches the pin.
    Trusted,
    /// Nothing pinned for this host.
    Unknown,
    /// Presented key differs from the pin.
    Mismatch {
        /// Pinned fingerprint.
        expected: String,
    },
}

/// Pinned host key database.
#[derive(Debug)]
pub struct KnownHosts {
    /// Backing file; `None` keeps pins in memory only.
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, KnownHost>>,
}

impl KnownHosts {
    /// Loads pins from `path`, starting empty if the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file: KnownHostsFile = match read_bounded(&path)? {
            Some(content) => toml::from_str(&content)?,
            None => KnownHostsFile::default(),
        };

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(file.hosts.into_iter().map(|h| (h.host.clone(), h)).collect()),
        })
    }

    /// Creates a database that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the backing file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Compares a presented key against the pin for `host_port`.
    #[must_use]
    pub fn verify(&self, host_port: &str, key: &HostKey) -> HostKeyStatus {
        let Ok(entries) = self.entries.read() else {
            return HostKeyStatus::Unknown;
        };
        match entries.get(host_port) {
            Some(pin) if pin.fingerprint == key.fingerprint => HostKeyStatus::Trusted,
            Some(pin) => HostKeyStatus::Mismatch {
                expected: pin.fingerprint.clone(),
            },
            None => HostKeyStatus::Unknown,
        }
    }

    /// Returns the pin for `host_port`.
    #[must_use]
    pub fn get(&self, host_port: &str) -> Option<KnownHost> {
        self.entries.read().ok().and_then(|e| e.get(host_port).cloned())
    }

    /// Pins `key` for `host_port`, replacing any previous pin.
    pub fn pin(&self, host_port: &str, key: &HostKey) -> Result<(), StoreError> {
        let entry = KnownHost {
            host: host_port.to_string(),
            key_type: key.key_type.clone(),
            fingerprint: key.fingerprint.clone(),
            first_seen: Utc::now(),
        };
        self.update(|entries| {
            entries.insert(host_port.to_string(), entry);
        })?;
        info!(host = host_port, fingerprint = %key.fingerprint, "Host key pinned");
        Ok(())
    }

    /// Removes the pin for `host_port`. Returns true if one existed.
    pub fn forget(&self, host_port: &str) -> Result<bool, StoreError> {
        let mut existed = false;
        self.update(|entries| existed = entries.remove(host_port).is_some())?;
        Ok(existed)
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, KnownHost>)) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Invalid("known hosts lock poisoned".to_string()))?;
        let mut next = entries.clone();
        f(&mut next);

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = KnownHostsFile {
                hosts: next.values().cloned().collect(),
            };
            write_atomic(path, toml::to_string_pretty(&file)?.as_bytes())?;
        }

        *entries = next;
        Ok(())
    }
}
