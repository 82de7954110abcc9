//! A pooled transport connection and its lifecycle state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::PoolError;
use crate::ssh::{ChannelIo, ChannelRequest, HostKey, Transport};
use crate::store::HostProfile;

/// Pool-unique connection number.
pub type ConnectionId = u64;

/// Connection lifecycle.
///
/// ```text
/// Unauthenticated -> Authenticating -> Ready <-> Degraded
///        \                 \             \          \
///         +-----------------+-------------+----------+--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// TCP and key exchange in progress, host key not yet accepted.
    Unauthenticated,
    /// Host key accepted, credentials being presented.
    Authenticating,
    /// Usable.
    Ready,
    /// Transport failed; reconnecting within the grace window.
    Degraded,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns the display name for this state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }

    /// Returns true if `next` is a legal successor.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unauthenticated, Self::Authenticating)
                | (Self::Authenticating, Self::Ready)
                | (Self::Ready, Self::Degraded)
                | (Self::Degraded, Self::Ready)
                | (Self::Unauthenticated | Self::Authenticating | Self::Ready | Self::Degraded, Self::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    refs: usize,
    last_activity: Instant,
    idle_since: Option<Instant>,
    idle_generation: u64,
}

/// A live connection owned by the pool.
///
/// Sessions hold only a `Weak` reference; the pool's map is the sole owner.
pub struct PooledConnection {
    id: ConnectionId,
    identity: String,
    profile: HostProfile,
    inner: Mutex<Inner>,
}

impl PooledConnection {
    /// Creates a connection placeholder reserved for one requester.
    pub(crate) fn reserved(id: ConnectionId, profile: HostProfile) -> Self {
        Self {
            id,
            identity: profile.identity(),
            profile,
            inner: Mutex::new(Inner {
                state: ConnectionState::Unauthenticated,
                transport: None,
                refs: 1,
                last_activity: Instant::now(),
                idle_since: None,
                idle_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pool-unique id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// `user@host:port`.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Profile this connection was opened for.
    #[must_use]
    pub fn profile(&self) -> &HostProfile {
        &self.profile
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of sessions bound to this connection.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.lock().refs
    }

    /// Last time a session used this connection.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    /// Host key of the current transport.
    #[must_use]
    pub fn host_key(&self) -> Option<HostKey> {
        self.lock().transport.as_ref().map(|t| t.host_key().clone())
    }

    /// Records activity.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Opens a channel on the current transport.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidState`] unless the connection is Ready,
    /// and the transport error if the open fails.
    pub async fn open_channel(&self, request: ChannelRequest) -> Result<ChannelIo, PoolError> {
        let transport = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Ready {
                return Err(PoolError::InvalidState(format!(
                    "connection {} is {}",
                    self.id, inner.state
                )));
            }
            inner.last_activity = Instant::now();
            inner.transport.clone()
        };
        let Some(transport) = transport else {
            return Err(PoolError::InvalidState(format!("connection {} has no transport", self.id)));
        };
        transport.open_channel(request).await.map_err(PoolError::Transport)
    }

    /// Moves to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: ConnectionState) -> Result<ConnectionState, PoolError> {
        let mut inner = self.lock();
        let prev = inner.state;
        if !prev.can_transition_to(next) {
            return Err(PoolError::InvalidState(format!(
                "connection {} cannot go from {prev} to {next}",
                self.id
            )));
        }
        inner.state = next;
        debug!(connection = self.id, identity = %self.identity, from = %prev, to = %next, "Connection state changed");
        Ok(prev)
    }

    /// Installs a transport and moves to Ready in one step.
    pub(crate) fn make_ready(&self, transport: Arc<dyn Transport>) -> Result<ConnectionState, PoolError> {
        let mut inner = self.lock();
        let prev = inner.state;
        if !prev.can_transition_to(ConnectionState::Ready) {
            return Err(PoolError::InvalidState(format!(
                "connection {} cannot become ready from {prev}",
                self.id
            )));
        }
        inner.state = ConnectionState::Ready;
        inner.transport = Some(transport);
        inner.last_activity = Instant::now();
        Ok(prev)
    }

    /// Moves Ready to Degraded, handing back the failed transport.
    pub(crate) fn degrade(&self) -> Option<Option<Arc<dyn Transport>>> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Ready {
            return None;
        }
        inner.state = ConnectionState::Degraded;
        Some(inner.transport.take())
    }

    /// Moves to Closed, handing back the transport. `None` if already closed.
    pub(crate) fn close(&self) -> Option<Option<Arc<dyn Transport>>> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return None;
        }
        inner.state = ConnectionState::Closed;
        Some(inner.transport.take())
    }

    /// Current transport if Ready.
    pub(crate) fn ready_transport(&self) -> Option<Arc<dyn Transport>> {
        let inner = self.lock();
        if inner.state == ConnectionState::Ready {
            inner.transport.clone()
        } else {
            None
        }
    }

    /// Takes a reference if Ready and below `limit`.
    pub(crate) fn try_bind(&self, limit: usize) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Ready || inner.refs >= limit {
            return false;
        }
        inner.refs += 1;
        inner.idle_since = None;
        inner.last_activity = Instant::now();
        true
    }

    /// Drops a reference. Returns the idle generation when it hit zero.
    pub(crate) fn unbind(&self) -> Option<u64> {
        let mut inner = self.lock();
        inner.refs = inner.refs.saturating_sub(1);
        if inner.refs > 0 {
            return None;
        }
        inner.idle_generation += 1;
        inner.idle_since = Some(Instant::now());
        Some(inner.idle_generation)
    }

    /// Load and idleness, read together.
    pub(crate) fn usage(&self) -> (ConnectionState, usize, Option<Instant>) {
        let inner = self.lock();
        (inner.state, inner.refs, inner.idle_since)
    }

    /// True if still idle since `generation` was issued.
    pub(crate) fn idle_expired(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.refs == 0 && inner.idle_generation == generation && inner.state == ConnectionState::Ready
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &inner.state)
            .field("refs", &inner.refs)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{AuthMethod, ProfileId};

    fn conn() -> PooledConnection {
        let profile = HostProfile::new(ProfileId::new("web").unwrap(), "box", "me", AuthMethod::Agent);
        PooledConnection::reserved(1, profile)
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Unauthenticated.can_transition_to(Authenticating));
        assert!(!Unauthenticated.can_transition_to(Ready));
        assert!(Authenticating.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Ready));
        assert!(!Degraded.can_transition_to(Authenticating));
        assert!(Degraded.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_reserved_placeholder() {
        let c = conn();
        assert_eq!(c.state(), ConnectionState::Unauthenticated);
        assert_eq!(c.ref_count(), 1);
        assert_eq!(c.identity(), "me@box:22");
        assert!(!c.try_bind(4));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let c = conn();
        assert!(c.transition(ConnectionState::Degraded).is_err());
        assert_eq!(c.state(), ConnectionState::Unauthenticated);
        assert!(c.transition(ConnectionState::Authenticating).is_ok());
        assert!(c.close().is_some());
        assert!(c.close().is_none());
    }

    #[tokio::test]
    async fn test_open_channel_requires_ready() {
        let c = conn();
        let err = c.open_channel(ChannelRequest::Shell { pty: true }).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidState(_)));
    }

    #[test]
    fn test_unbind_generations() {
        let c = conn();
        let generation = c.unbind().unwrap();
        assert_eq!(c.ref_count(), 0);
        // Not Ready, so never considered expired.
        assert!(!c.idle_expired(generation));
    }
}
