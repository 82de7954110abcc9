//! Connection pool.
//!
//! Owns every transport connection, keyed by `user@host:port`. A request
//! reuses the least-loaded Ready connection to its host while that
//! connection is below the multiplexing limit, otherwise opens a new one
//! when the per-host and global caps allow, otherwise waits in a FIFO queue
//! until a slot frees or its timeout elapses.
//!
//! Each Ready connection runs a keep-alive task. Repeated keep-alive
//! failures, or a transport error reported by a session, move it to
//! Degraded; a recovery task then reconnects with exponential backoff
//! inside the grace window and broadcasts either `Restored` or `Lost`.
//!
//! Lock order is pool state, then connection. Neither lock is held across
//! an await.

pub mod backoff;
pub mod connection;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, error, info, warn};

pub use backoff::{RetryConfig, retry_with_backoff};
pub use connection::{ConnectionId, ConnectionState, PooledConnection};

use crate::error::ErrorKind;
use crate::ssh::{Connector, HostKey, HostKeyStatus, KnownHosts, Target, Transport, TransportError};
use crate::store::{Credential, CredentialStore, HostProfile, KeySource, ProfileId, StoreError};

/// Capacity of the event broadcast buffer.
const EVENT_CAPACITY: usize = 256;

/// What to do with host keys that are not pinned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Unknown keys need explicit acceptance.
    #[default]
    Strict,
    /// Unknown keys are pinned on first use.
    Tofu,
}

impl HostKeyPolicy {
    /// Parses a policy name. Unrecognized names fall back to strict.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "tofu" | "accept-new" | "accept_new" => Self::Tofu,
            _ => Self::Strict,
        }
    }

    /// Returns the display name for this policy.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Tofu => "tofu",
        }
    }
}

/// Pool limits and timers.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global connection cap.
    pub max_connections: usize,
    /// Connection cap per host identity.
    pub max_connections_per_host: usize,
    /// Sessions multiplexed over one connection.
    pub max_sessions_per_connection: usize,
    /// Default wait for a free slot.
    pub acquire_timeout: Duration,
    /// TCP connect, handshake, and authentication deadline.
    pub connect_timeout: Duration,
    /// Network retries when first establishing a connection.
    pub connect_retries: u32,
    /// How long an unused connection stays warm.
    pub idle_timeout: Duration,
    /// Keep-alive period.
    pub keepalive_interval: Duration,
    /// Consecutive keep-alive failures tolerated before degrading.
    pub keepalive_max_failures: u32,
    /// Reconnection backoff while Degraded.
    pub reconnect: RetryConfig,
    /// How long bound sessions stay recoverable.
    pub grace_window: Duration,
    /// Handling of unpinned host keys.
    pub host_key_policy: HostKeyPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            max_connections_per_host: 2,
            max_sessions_per_connection: 4,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            connect_retries: 0,
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(30),
            keepalive_max_failures: 3,
            reconnect: RetryConfig::default(),
            grace_window: Duration::from_secs(30),
            host_key_policy: HostKeyPolicy::Strict,
        }
    }
}

/// Errors that can occur while acquiring or supervising connections.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No profile with that id.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Host presented a key that is not pinned.
    #[error("Unknown host key for {host}: {presented}")]
    HostKeyUnknown {
        /// `host:port`.
        host: String,
        /// Key the server presented.
        presented: HostKey,
    },

    /// Host presented a key different from the pinned one.
    #[error("Host key mismatch for {host}: expected {expected}, got {presented}")]
    HostKeyMismatch {
        /// `host:port`.
        host: String,
        /// Pinned fingerprint.
        expected: String,
        /// Key the server presented.
        presented: HostKey,
    },

    /// Transport failure (network, timeout, authentication).
    #[error(transparent)]
    Transport(TransportError),

    /// Credential could not be loaded.
    #[error("Credential unavailable: {0}")]
    Store(#[from] StoreError),

    /// No slot became free in time.
    #[error("Pool exhausted for {identity} after {waited:?}")]
    PoolExhausted {
        /// Requested identity.
        identity: String,
        /// How long the request waited.
        waited: Duration,
    },

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Connection closed for good.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Pool has shut down.
    #[error("Pool shut down")]
    Shutdown,
}

impl PoolError {
    /// Returns the stable error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProfileNotFound(_) => ErrorKind::NotFound,
            Self::HostKeyUnknown { .. } | Self::HostKeyMismatch { .. } => ErrorKind::HostKey,
            Self::Transport(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Presented key for host-key errors, so callers can offer acceptance.
    #[must_use]
    pub fn presented_host_key(&self) -> Option<&HostKey> {
        match self {
            Self::HostKeyUnknown { presented, .. } | Self::HostKeyMismatch { presented, .. } => Some(presented),
            _ => None,
        }
    }
}

impl From<TransportError> for PoolError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A connection changed state.
    StateChanged {
        /// Connection.
        connection: ConnectionId,
        /// `user@host:port`.
        identity: String,
        /// New state.
        state: ConnectionState,
    },
    /// A connection degraded; bound sessions are recoverable for `grace`.
    Degraded {
        /// Connection.
        connection: ConnectionId,
        /// `user@host:port`.
        identity: String,
        /// Grace window.
        grace: Duration,
    },
    /// A degraded connection reconnected.
    Restored {
        /// Connection.
        connection: ConnectionId,
        /// `user@host:port`.
        identity: String,
    },
    /// A degraded connection could not be recovered and is closed.
    Lost {
        /// Connection.
        connection: ConnectionId,
        /// `user@host:port`.
        identity: String,
        /// Why recovery failed.
        reason: String,
    },
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Fingerprint the caller accepts for an unknown or changed host key.
    pub accept_host_key: Option<String>,
    /// Overrides the configured acquire timeout.
    pub timeout: Option<Duration>,
}

/// Point-in-time pool snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections in any non-closed state.
    pub total: usize,
    /// Ready connections.
    pub ready: usize,
    /// Degraded connections.
    pub degraded: usize,
    /// Connections per identity.
    pub per_host: BTreeMap<String, usize>,
    /// Session references across all connections.
    pub refs: usize,
    /// Requests waiting for a slot.
    pub waiting: usize,
}

/// What a queued request is handed.
enum Grant {
    Reuse(Arc<PooledConnection>),
    Establish(Arc<PooledConnection>),
}

/// Capacity held by one in-flight acquire. Dropped armed, it goes back to
/// the pool.
struct Claim {
    inner: Arc<PoolInner>,
    grant: Option<Grant>,
}

impl Claim {
    /// Keeps the capacity; the caller now owns it.
    fn defuse(mut self) {
        self.grant = None;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            self.inner.abandon(grant);
        }
    }
}

/// A request parked in the FIFO queue. Dropping it leaves the queue and
/// returns a grant that arrived in the meantime.
struct Queued {
    inner: Arc<PoolInner>,
    id: u64,
    rx: oneshot::Receiver<Grant>,
}

impl Queued {
    /// Leaves the queue, returning a grant that raced the departure.
    fn leave(&mut self) -> Option<Grant> {
        self.inner.lock_state().waiters.retain(|w| w.id != self.id);
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl Drop for Queued {
    fn drop(&mut self) {
        if let Some(grant) = self.leave() {
            self.inner.abandon(grant);
        }
    }
}

struct Waiter {
    id: u64,
    identity: String,
    profile: HostProfile,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    connections: BTreeMap<ConnectionId, Arc<PooledConnection>>,
    waiters: VecDeque<Waiter>,
    shut_down: bool,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    store: Arc<CredentialStore>,
    keys: Arc<dyn KeySource>,
    known_hosts: Arc<KnownHosts>,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    next_id: AtomicU64,
}

/// Bounded pool of authenticated transport connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool.
    ///
    /// # Panics
    /// Panics if any cap is zero.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        store: Arc<CredentialStore>,
        keys: Arc<dyn KeySource>,
        known_hosts: Arc<KnownHosts>,
    ) -> Self {
        assert!(config.max_connections > 0, "max_connections must be positive");
        assert!(config.max_connections_per_host > 0, "max_connections_per_host must be positive");
        assert!(config.max_sessions_per_connection > 0, "max_sessions_per_connection must be positive");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                store,
                keys,
                known_hosts,
                state: Mutex::new(PoolState::default()),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Returns a Ready connection for `profile_id`, holding one reference.
    ///
    /// # Errors
    /// Host-key, authentication, network, and credential failures are
    /// surfaced unchanged; [`PoolError::PoolExhausted`] if no slot frees in
    /// time.
    pub async fn acquire(
        &self,
        profile_id: &ProfileId,
        options: &AcquireOptions,
    ) -> Result<Arc<PooledConnection>, PoolError> {
        let profile = self
            .inner
            .store
            .profile(profile_id)
            .ok_or_else(|| PoolError::ProfileNotFound(profile_id.to_string()))?;
        self.inner.acquire(profile, options).await
    }

    /// Drops one reference taken by [`Self::acquire`].
    pub fn release(&self, connection: &Arc<PooledConnection>) {
        self.inner.release(connection);
    }

    /// Reports a transport failure seen by a session; degrades the connection.
    pub fn report_transport_error(&self, connection: ConnectionId, detail: &str) {
        let conn = self.inner.lock_state().connections.get(&connection).cloned();
        if let Some(conn) = conn {
            self.inner.degrade(&conn, detail);
        }
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<PooledConnection>> {
        self.inner.lock_state().connections.get(&id).cloned()
    }

    /// Returns a snapshot of pool usage.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        let mut stats = PoolStats {
            waiting: state.waiters.len(),
            ..PoolStats::default()
        };
        for conn in state.connections.values() {
            let (conn_state, refs, _) = conn.usage();
            if conn_state == ConnectionState::Closed {
                continue;
            }
            stats.total += 1;
            stats.refs += refs;
            match conn_state {
                ConnectionState::Ready => stats.ready += 1,
                ConnectionState::Degraded => stats.degraded += 1,
                _ => {}
            }
            *stats.per_host.entry(conn.identity().to_string()).or_default() += 1;
        }
        stats
    }

    /// Closes every connection and fails queued requests.
    pub async fn shutdown(&self) {
        let (connections, waiters) = {
            let mut state = self.inner.lock_state();
            state.shut_down = true;
            let connections: Vec<_> = std::mem::take(&mut state.connections).into_values().collect();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (connections, waiters)
        };
        // Dropping the senders fails the waiters with Shutdown.
        drop(waiters);

        for conn in connections {
            if let Some(transport) = conn.close() {
                self.inner.emit_state(&conn, ConnectionState::Closed);
                if let Some(transport) = transport {
                    transport.disconnect().await;
                }
            }
        }
        info!("Connection pool shut down");
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_state(&self, conn: &PooledConnection, state: ConnectionState) {
        self.emit(PoolEvent::StateChanged {
            connection: conn.id(),
            identity: conn.identity().to_string(),
            state,
        });
    }

    async fn acquire(
        self: &Arc<Self>,
        profile: HostProfile,
        options: &AcquireOptions,
    ) -> Result<Arc<PooledConnection>, PoolError> {
        let identity = profile.identity();
        let started = Instant::now();
        let deadline = started + options.timeout.unwrap_or(self.config.acquire_timeout);

        let (immediate, waiting) = {
            let mut state = self.lock_state();
            if state.shut_down {
                return Err(PoolError::Shutdown);
            }

            // Earlier requests for the same host go first.
            let queued_ahead = state.waiters.iter().any(|w| w.identity == identity);
            let (claim, evicted) = if queued_ahead {
                (None, Vec::new())
            } else {
                self.try_claim(&mut state, &profile)
            };
            self.close_evicted(evicted);

            match claim {
                Some(grant) => (Some(grant), None),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let waiter_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    state.waiters.push_back(Waiter {
                        id: waiter_id,
                        identity: identity.clone(),
                        profile: profile.clone(),
                        tx,
                    });
                    debug!(identity = %identity, queued = state.waiters.len(), "Acquire queued");
                    (
                        None,
                        Some(Queued {
                            inner: Arc::clone(self),
                            id: waiter_id,
                            rx,
                        }),
                    )
                }
            }
        };

        let grant = match (immediate, waiting) {
            (Some(grant), _) => grant,
            (None, Some(mut queued)) => match timeout_at(deadline, &mut queued.rx).await {
                Ok(Ok(grant)) => grant,
                Ok(Err(_)) => return Err(PoolError::Shutdown),
                // A grant may have been sent just before the deadline.
                Err(_) => match queued.leave() {
                    Some(grant) => grant,
                    None => {
                        warn!(identity = %identity, "Acquire timed out waiting for a slot");
                        return Err(PoolError::PoolExhausted {
                            identity,
                            waited: started.elapsed(),
                        });
                    }
                },
            },
            (None, None) => return Err(PoolError::Shutdown),
        };

        // From here on, dropping the future hands the capacity back.
        let claim = Claim {
            inner: Arc::clone(self),
            grant: Some(grant),
        };
        let (conn, reuse) = match claim.grant.as_ref() {
            Some(Grant::Reuse(conn)) => (Arc::clone(conn), true),
            Some(Grant::Establish(conn)) => (Arc::clone(conn), false),
            None => return Err(PoolError::Shutdown),
        };
        if reuse {
            debug!(connection = conn.id(), identity = %identity, refs = conn.ref_count(), "Reusing connection");
            claim.defuse();
            return Ok(conn);
        }

        let result = self.establish(&conn, options.accept_host_key.as_deref()).await;
        claim.defuse();
        match result {
            Ok(()) => {
                info!(connection = conn.id(), identity = %identity, "Connection ready");
                self.dispatch_waiters();
                Ok(conn)
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Connection failed");
                self.discard(&conn).await;
                Err(e)
            }
        }
    }

    /// Returns capacity reserved for a request that went away.
    fn abandon(self: &Arc<Self>, grant: Grant) {
        // Drop can run outside a runtime, where nothing can be spawned.
        let live = tokio::runtime::Handle::try_current().is_ok();
        match grant {
            Grant::Reuse(conn) => {
                debug!(connection = conn.id(), "Returning abandoned reference");
                if live {
                    self.release(&conn);
                } else {
                    let _ = conn.unbind();
                }
            }
            Grant::Establish(conn) => {
                debug!(connection = conn.id(), identity = %conn.identity(), "Abandoning connection attempt");
                self.lock_state().connections.remove(&conn.id());
                if let Some(transport) = conn.close() {
                    self.emit_state(&conn, ConnectionState::Closed);
                    if let (Some(transport), true) = (transport, live) {
                        tokio::spawn(async move { transport.disconnect().await });
                    }
                }
                if live {
                    self.dispatch_waiters();
                }
            }
        }
    }

    /// Reserves capacity for `profile`. Caller holds the state lock.
    fn try_claim(
        &self,
        state: &mut PoolState,
        profile: &HostProfile,
    ) -> (Option<Grant>, Vec<Arc<PooledConnection>>) {
        let identity = profile.identity();
        let limit = self.config.max_sessions_per_connection;

        let mut candidates: Vec<_> = state
            .connections
            .values()
            .filter(|c| c.identity() == identity)
            .filter(|c| {
                let (s, refs, _) = c.usage();
                s == ConnectionState::Ready && refs < limit
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.ref_count());
        for conn in candidates {
            if conn.try_bind(limit) {
                return (Some(Grant::Reuse(conn)), Vec::new());
            }
        }

        let host_count = state
            .connections
            .values()
            .filter(|c| c.identity() == identity)
            .count();
        if host_count >= self.config.max_connections_per_host {
            return (None, Vec::new());
        }

        let mut evicted = Vec::new();
        if state.connections.len() >= self.config.max_connections {
            // Evict the connection idle the longest.
            let oldest_idle = state
                .connections
                .values()
                .filter_map(|c| match c.usage() {
                    (ConnectionState::Ready, 0, Some(since)) => Some((since, c.id())),
                    _ => None,
                })
                .min();
            match oldest_idle.and_then(|(_, id)| state.connections.remove(&id)) {
                Some(victim) => {
                    debug!(connection = victim.id(), identity = %victim.identity(), "Evicting idle connection");
                    evicted.push(victim);
                }
                None => return (None, evicted),
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(PooledConnection::reserved(id, profile.clone()));
        state.connections.insert(id, Arc::clone(&conn));
        (Some(Grant::Establish(conn)), evicted)
    }

    /// Hands freed capacity to queued requests in arrival order.
    fn dispatch_waiters(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.shut_down {
            return;
        }

        let mut blocked: HashSet<String> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(state.waiters.len());
        let mut evicted_all = Vec::new();
        let mut returned = Vec::new();

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            if blocked.contains(&waiter.identity) {
                remaining.push_back(waiter);
                continue;
            }

            let (claim, evicted) = self.try_claim(&mut state, &waiter.profile);
            evicted_all.extend(evicted);
            match claim {
                Some(grant) => {
                    if let Err(grant) = waiter.tx.send(grant) {
                        returned.push(grant);
                    }
                }
                None => {
                    blocked.insert(waiter.identity.clone());
                    remaining.push_back(waiter);
                }
            }
        }

        state.waiters = remaining;
        drop(state);
        self.close_evicted(evicted_all);
        for grant in returned {
            self.abandon(grant);
        }
    }

    fn close_evicted(self: &Arc<Self>, evicted: Vec<Arc<PooledConnection>>) {
        for conn in evicted {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.close_connection(&conn).await;
            });
        }
    }

    /// Connects, verifies the host key, and authenticates a reserved slot.
    async fn establish(self: &Arc<Self>, conn: &Arc<PooledConnection>, accept: Option<&str>) -> Result<(), PoolError> {
        self.emit_state(conn, ConnectionState::Unauthenticated);
        let profile = conn.profile().clone();
        let target = self.target(&profile);

        let retry = RetryConfig {
            max_retries: self.config.connect_retries,
            ..self.config.reconnect.clone()
        };
        let transport = retry_with_backoff(
            &retry,
            |_| self.connect(&target),
            |e: &TransportError| e.kind().is_transient(),
        )
        .await?;

        if let Err(e) = self.check_host_key(&profile, transport.host_key(), accept, self.config.host_key_policy) {
            transport.disconnect().await;
            return Err(e);
        }

        conn.transition(ConnectionState::Authenticating)?;
        self.emit_state(conn, ConnectionState::Authenticating);

        if let Err(e) = self.authenticate(&profile, &transport).await {
            transport.disconnect().await;
            return Err(e);
        }

        if let Err(e) = conn.make_ready(Arc::clone(&transport)) {
            transport.disconnect().await;
            return Err(e);
        }
        self.emit_state(conn, ConnectionState::Ready);
        self.spawn_keepalive(conn);
        Ok(())
    }

    fn target(&self, profile: &HostProfile) -> Target {
        Target {
            host: profile.host.clone(),
            port: profile.port,
            connect_timeout: self.config.connect_timeout,
        }
    }

    async fn connect(&self, target: &Target) -> Result<Arc<dyn Transport>, TransportError> {
        match timeout(self.config.connect_timeout, self.connector.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!("connect to {}", target.host_port()))),
        }
    }

    /// Applies the pinning policy. `accept` is a fingerprint the caller
    /// explicitly trusts.
    fn check_host_key(
        &self,
        profile: &HostProfile,
        key: &HostKey,
        accept: Option<&str>,
        policy: HostKeyPolicy,
    ) -> Result<(), PoolError> {
        let host = profile.host_port();
        let accepted = accept.is_some_and(|fp| fp == key.fingerprint);

        match self.known_hosts.verify(&host, key) {
            HostKeyStatus::Trusted => Ok(()),
            HostKeyStatus::Mismatch { expected } if !accepted => {
                error!(host = %host, expected = %expected, presented = %key.fingerprint, "Host key mismatch");
                Err(PoolError::HostKeyMismatch {
                    host,
                    expected,
                    presented: key.clone(),
                })
            }
            HostKeyStatus::Unknown if !accepted && policy == HostKeyPolicy::Strict => {
                warn!(host = %host, presented = %key.fingerprint, "Unknown host key");
                Err(PoolError::HostKeyUnknown {
                    host,
                    presented: key.clone(),
                })
            }
            HostKeyStatus::Mismatch { .. } | HostKeyStatus::Unknown => {
                self.known_hosts.pin(&host, key)?;
                Ok(())
            }
        }
    }

    async fn load_credential(&self, profile: &HostProfile) -> Result<Credential, PoolError> {
        let store = Arc::clone(&self.store);
        let keys = Arc::clone(&self.keys);
        let profile = profile.clone();
        tokio::task::spawn_blocking(move || store.credential_for(&profile, keys.as_ref()))
            .await
            .map_err(|e| PoolError::InvalidState(format!("credential task failed: {e}")))?
            .map_err(PoolError::from)
    }

    async fn authenticate(&self, profile: &HostProfile, transport: &Arc<dyn Transport>) -> Result<(), PoolError> {
        let credential = self.load_credential(profile).await?;
        let result = timeout(
            self.config.connect_timeout,
            transport.authenticate(&profile.username, &credential),
        )
        .await;
        drop(credential);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PoolError::Transport(e)),
            Err(_) => Err(PoolError::Transport(TransportError::Timeout(format!(
                "authentication to {}",
                profile.identity()
            )))),
        }
    }

    /// Removes a slot whose establishment failed.
    async fn discard(self: &Arc<Self>, conn: &Arc<PooledConnection>) {
        self.lock_state().connections.remove(&conn.id());
        if let Some(transport) = conn.close() {
            self.emit_state(conn, ConnectionState::Closed);
            if let Some(transport) = transport {
                transport.disconnect().await;
            }
        }
        self.dispatch_waiters();
    }

    fn release(self: &Arc<Self>, conn: &Arc<PooledConnection>) {
        let Some(generation) = conn.unbind() else {
            self.dispatch_waiters();
            return;
        };

        debug!(connection = conn.id(), identity = %conn.identity(), "Connection idle");
        let inner = Arc::downgrade(self);
        let idle = Arc::downgrade(conn);
        let idle_timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            sleep(idle_timeout).await;
            let (Some(inner), Some(conn)) = (inner.upgrade(), idle.upgrade()) else {
                return;
            };
            if conn.idle_expired(generation) {
                info!(connection = conn.id(), identity = %conn.identity(), "Closing idle connection");
                inner.close_connection(&conn).await;
            }
        });

        self.dispatch_waiters();
    }

    /// Closes and forgets a connection.
    async fn close_connection(self: &Arc<Self>, conn: &Arc<PooledConnection>) {
        self.lock_state().connections.remove(&conn.id());
        if let Some(transport) = conn.close() {
            self.emit_state(conn, ConnectionState::Closed);
            if let Some(transport) = transport {
                transport.disconnect().await;
            }
        }
        self.dispatch_waiters();
    }

    fn spawn_keepalive(self: &Arc<Self>, conn: &Arc<PooledConnection>) {
        let inner = Arc::downgrade(self);
        let weak = Arc::downgrade(conn);
        let interval = self.config.keepalive_interval;
        let max_failures = self.config.keepalive_max_failures.max(1);

        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                sleep(interval).await;
                let (Some(inner), Some(conn)) = (inner.upgrade(), weak.upgrade()) else {
                    return;
                };
                match conn.state() {
                    ConnectionState::Closed => return,
                    ConnectionState::Ready => {}
                    _ => {
                        failures = 0;
                        continue;
                    }
                }
                let Some(transport) = conn.ready_transport() else {
                    continue;
                };

                match timeout(interval, transport.keepalive()).await {
                    Ok(Ok(())) => failures = 0,
                    Ok(Err(e)) => {
                        failures += 1;
                        warn!(connection = conn.id(), failures, max_failures, error = %e, "Keep-alive failed");
                    }
                    Err(_) => {
                        failures += 1;
                        warn!(connection = conn.id(), failures, max_failures, "Keep-alive timed out");
                    }
                }

                if failures >= max_failures {
                    failures = 0;
                    inner.degrade(&conn, "keep-alive failed");
                }
            }
        });
    }

    /// Ready -> Degraded, then recover in the background.
    fn degrade(self: &Arc<Self>, conn: &Arc<PooledConnection>, reason: &str) {
        let Some(old_transport) = conn.degrade() else {
            return;
        };

        let grace = self.config.grace_window;
        warn!(connection = conn.id(), identity = %conn.identity(), reason, grace_secs = grace.as_secs(), "Connection degraded");
        self.emit_state(conn, ConnectionState::Degraded);
        self.emit(PoolEvent::Degraded {
            connection: conn.id(),
            identity: conn.identity().to_string(),
            grace,
        });

        let inner = Arc::clone(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            if let Some(transport) = old_transport {
                transport.disconnect().await;
            }
            inner.recover(conn).await;
        });
    }

    async fn recover(self: Arc<Self>, conn: Arc<PooledConnection>) {
        let deadline = Instant::now() + self.config.grace_window;
        let attempt = retry_with_backoff(
            &self.config.reconnect,
            |n| {
                debug!(connection = conn.id(), attempt = n + 1, "Reconnecting");
                self.reconnect_once(&conn)
            },
            |e: &PoolError| e.kind().is_transient(),
        );

        let reason = match timeout_at(deadline, attempt).await {
            Ok(Ok(transport)) => match conn.make_ready(Arc::clone(&transport)) {
                Ok(_) => {
                    info!(connection = conn.id(), identity = %conn.identity(), "Connection restored");
                    self.emit_state(&conn, ConnectionState::Ready);
                    self.emit(PoolEvent::Restored {
                        connection: conn.id(),
                        identity: conn.identity().to_string(),
                    });
                    self.dispatch_waiters();
                    return;
                }
                Err(e) => {
                    transport.disconnect().await;
                    e.to_string()
                }
            },
            Ok(Err(e)) => format!("reconnection failed: {e}"),
            Err(_) => "grace window expired".to_string(),
        };

        error!(connection = conn.id(), identity = %conn.identity(), reason = %reason, "Connection lost");
        // Lost goes out before Closed so subscribers see the real reason.
        self.emit(PoolEvent::Lost {
            connection: conn.id(),
            identity: conn.identity().to_string(),
            reason,
        });
        self.close_connection(&conn).await;
    }

    /// One reconnection attempt. The pinned key must match exactly.
    async fn reconnect_once(&self, conn: &PooledConnection) -> Result<Arc<dyn Transport>, PoolError> {
        if conn.state() != ConnectionState::Degraded {
            return Err(PoolError::ConnectionLost("connection closed during recovery".to_string()));
        }
        let profile = conn.profile();
        let transport = self.connect(&self.target(profile)).await?;

        let host = profile.host_port();
        if let HostKeyStatus::Mismatch { expected } = pinned_status(&self.known_hosts, &host, transport.host_key()) {
            transport.disconnect().await;
            return Err(PoolError::HostKeyMismatch {
                host,
                expected,
                presented: transport.host_key().clone(),
            });
        }

        if let Err(e) = self.authenticate(profile, &transport).await {
            transport.disconnect().await;
            return Err(e);
        }
        Ok(transport)
    }
}

/// Like [`KnownHosts::verify`], but reports a missing pin as a mismatch
/// against the empty fingerprint.
fn pinned_status(known_hosts: &KnownHosts, host: &str, key: &HostKey) -> HostKeyStatus {
    match known_hosts.verify(host, key) {
        HostKeyStatus::Unknown => HostKeyStatus::Mismatch {
            expected: String::new(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_policy_parse() {
        assert_eq!(HostKeyPolicy::parse("tofu"), HostKeyPolicy::Tofu);
        assert_eq!(HostKeyPolicy::parse("accept-new"), HostKeyPolicy::Tofu);
        assert_eq!(HostKeyPolicy::parse("strict"), HostKeyPolicy::Strict);
        assert_eq!(HostKeyPolicy::parse("whatever"), HostKeyPolicy::Strict);
    }

    #[test]
    fn test_pool_error_kinds() {
        assert_eq!(
            PoolError::Transport(TransportError::Auth("no".into())).kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            PoolError::PoolExhausted {
                identity: "a@b:22".into(),
                waited: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::PoolExhausted
        );
        let err = PoolError::HostKeyUnknown {
            host: "b:22".into(),
            presented: HostKey::new("ssh-ed25519", "SHA256:x"),
        };
        assert_eq!(err.kind(), ErrorKind::HostKey);
        assert_eq!(err.presented_host_key().map(|k| k.fingerprint.as_str()), Some("SHA256:x"));
        assert_eq!(PoolError::Store(StoreError::AuthRequired).kind(), ErrorKind::AuthRequired);
    }

    #[test]
    fn test_pinned_status_treats_unknown_as_mismatch() {
        let hosts = KnownHosts::in_memory();
        let key = HostKey::new("ssh-ed25519", "SHA256:x");
        assert!(matches!(
            pinned_status(&hosts, "b:22", &key),
            HostKeyStatus::Mismatch { .. }
        ));
    }
}
