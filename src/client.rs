//! Client facade.
//!
//! Wires configuration, the credential store, pinned host keys, the
//! connection pool, and the session manager together and exposes the
//! operations a front end needs.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::ssh::known_hosts::KNOWN_HOSTS_FILE;
use crate::ssh::{Connector, KnownHosts, Ssh2Connector};
use crate::pool::ConnectionPool;
use crate::session::{BlockId, BlockUpdates, SessionError, SessionId, SessionManager, SessionOptions};
use crate::store::{Credential, CredentialStore, HostProfile, KeySource, ProfileId, StoreError};

/// Entry point for embedding ratssh.
pub struct Client {
    config: Config,
    store: Arc<CredentialStore>,
    keys: Arc<dyn KeySource>,
    known_hosts: Arc<KnownHosts>,
    sessions: SessionManager,
}

impl Client {
    /// Opens a client backed by libssh2. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    /// Returns an error if the storage directory cannot be opened.
    pub fn open(config: Config, keys: Arc<dyn KeySource>) -> Result<Self, StoreError> {
        let connector = Arc::new(Ssh2Connector::new());
        Self::with_connector(config, keys, connector)
    }

    /// Opens a client with a custom transport.
    ///
    /// # Errors
    /// Returns an error if the storage directory cannot be opened.
    pub fn with_connector(
        config: Config,
        keys: Arc<dyn KeySource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(CredentialStore::open(&config.storage_dir, config.kdf.clone())?);
        let known_hosts = Arc::new(KnownHosts::load(config.storage_dir.join(KNOWN_HOSTS_FILE))?);
        let pool = ConnectionPool::new(
            config.pool.clone(),
            connector,
            Arc::clone(&store),
            Arc::clone(&keys),
            Arc::clone(&known_hosts),
        );
        let sessions = SessionManager::new(pool, config.session.clone());

        info!(storage = %config.storage_dir.display(), "Client ready");
        Ok(Self {
            config,
            store,
            keys,
            known_hosts,
            sessions,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Credential store.
    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Pinned host keys.
    #[must_use]
    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// Session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Every stored profile, ordered by id.
    #[must_use]
    pub fn list_profiles(&self) -> Vec<HostProfile> {
        self.store.list_profiles()
    }

    /// Saves a profile, sealing `secret` when given. Key derivation runs on
    /// the blocking pool.
    ///
    /// # Errors
    /// Returns validation, key, and storage errors.
    pub async fn upsert_profile(
        &self,
        profile: HostProfile,
        secret: Option<Credential>,
    ) -> Result<HostProfile, StoreError> {
        let store = Arc::clone(&self.store);
        let keys = Arc::clone(&self.keys);
        tokio::task::spawn_blocking(move || store.upsert_profile(profile, secret.as_ref(), keys.as_ref()))
            .await
            .map_err(|e| StoreError::Invalid(format!("store task failed: {e}")))?
    }

    /// Deletes a profile, its credential, and its host key pin.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for an unknown id.
    pub fn remove_profile(&self, id: &ProfileId) -> Result<(), StoreError> {
        let profile = self.store.profile(id);
        self.store.delete_profile(id)?;
        if let Some(profile) = profile {
            let host = profile.host_port();
            let still_used = self.store.list_profiles().iter().any(|p| p.host_port() == host);
            if !still_used {
                self.known_hosts.forget(&host)?;
            }
        }
        Ok(())
    }

    /// Opens a session for `profile_id`.
    ///
    /// # Errors
    /// See [`SessionManager::create_session`].
    pub async fn create_session(
        &self,
        profile_id: &ProfileId,
        options: &SessionOptions,
    ) -> Result<SessionId, SessionError> {
        self.sessions.create_session(profile_id, options).await
    }

    /// Submits a command.
    ///
    /// # Errors
    /// See [`SessionManager::submit_command`].
    pub async fn submit_command(&self, session: SessionId, command: &str) -> Result<BlockId, SessionError> {
        self.sessions.submit_command(session, command).await
    }

    /// Subscribes to a session's updates.
    ///
    /// # Errors
    /// See [`SessionManager::block_updates`].
    pub fn block_updates(&self, session: SessionId) -> Result<BlockUpdates, SessionError> {
        self.sessions.block_updates(session)
    }

    /// Closes a session.
    ///
    /// # Errors
    /// See [`SessionManager::close_session`].
    pub async fn close_session(&self, session: SessionId) -> Result<(), SessionError> {
        self.sessions.close_session(session).await
    }

    /// Closes every session, then every connection.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
        self.sessions.pool().shutdown().await;
    }
}
