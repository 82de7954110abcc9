//! Session manager.
//!
//! A session is a remote shell bound to one pooled connection plus the
//! ordered list of blocks submitted to it. Each block runs on its own
//! channel through the executor, so sessions sharing a connection never
//! block each other.
//!
//! ```text
//! Initializing -> Active -> Closing -> Closed
//!                   |  ^
//!      (degraded)   v  |  (restored)
//!               recoverable
//! ```
//!
//! Pool events drive recovery: `Degraded` marks bound sessions recoverable
//! and fails their running blocks with ConnectionLost, `Restored` reopens the
//! shell, and `Lost` force-closes them.

pub mod block;
pub mod output;
pub mod updates;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use block::{Block, BlockId, BlockStatus};
pub use output::{DEFAULT_OUTPUT_LIMIT, OutputBuffer, truncation_marker};
pub use updates::{BlockUpdate, BlockUpdates, DEFAULT_UPDATE_BUFFER, UpdateEvent};

use crate::error::{BlockError, ErrorKind};
use crate::executor::{self, Classification, Completion, ExecEvent, ExecOptions, ExecutionControl, classify};
use crate::pool::{AcquireOptions, ConnectionId, ConnectionPool, ConnectionState, PoolError, PoolEvent, PooledConnection};
use crate::ssh::{ChannelCommand, ChannelEvent, ChannelIo, ChannelRequest};
use crate::store::ProfileId;
use updates::Subscriber;

/// Read size when forwarding local input.
const INPUT_CHUNK: usize = 8 * 1024;

/// Default number of closed-session records kept.
const DEFAULT_TOMBSTONES: usize = 128;

/// Session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Shell channel being opened.
    Initializing,
    /// Accepting commands (unless recoverable).
    Active,
    /// Interrupting blocks before teardown.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Returns the display name for this state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live or recently closed session with that id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The session has no such block.
    #[error("Block {block} not found in session {session}")]
    BlockNotFound {
        /// Session.
        session: SessionId,
        /// Block.
        block: BlockId,
    },

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Connection could not be acquired or used.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Local input could not be read.
    #[error("Input error: {0}")]
    Input(#[from] std::io::Error),
}

impl SessionError {
    /// Returns the stable error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::BlockNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Pool(e) => e.kind(),
            Self::Input(_) => ErrorKind::Storage,
        }
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Settings passed to every execution.
    pub exec: ExecOptions,
    /// How long `close_session` waits for interrupted blocks.
    pub close_grace: Duration,
    /// Retained output per block.
    pub output_limit: usize,
    /// Closed-session records kept.
    pub tombstones: usize,
    /// Undelivered updates a subscriber may hold before it is cut off.
    pub update_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            exec: ExecOptions::default(),
            close_grace: Duration::from_secs(5),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            tombstones: DEFAULT_TOMBSTONES,
            update_buffer: DEFAULT_UPDATE_BUFFER,
        }
    }
}

/// Per-session creation options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Fingerprint the caller accepts for an unknown or changed host key.
    pub accept_host_key: Option<String>,
    /// Overrides the pool's acquire timeout.
    pub acquire_timeout: Option<Duration>,
}

/// Snapshot of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session.
    pub id: SessionId,
    /// Profile it was created for.
    pub profile_id: ProfileId,
    /// Bound connection.
    pub connection: ConnectionId,
    /// Lifecycle state.
    pub state: SessionState,
    /// True while the connection is Degraded.
    pub recoverable: bool,
    /// Blocks submitted so far.
    pub blocks: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// What is remembered about a session after it closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    /// Session.
    pub id: SessionId,
    /// Set when the close was forced (connection loss).
    pub reason: Option<BlockError>,
    /// Close time.
    pub closed_at: DateTime<Utc>,
}

struct SessionInner {
    state: SessionState,
    recoverable: bool,
    shell: Option<mpsc::UnboundedSender<ChannelCommand>>,
    shell_epoch: u64,
    blocks: BTreeMap<BlockId, Block>,
    controls: HashMap<BlockId, ExecutionControl>,
    next_block: BlockId,
    seq: u64,
    subscribers: Vec<Subscriber>,
}

struct Session {
    id: SessionId,
    profile_id: ProfileId,
    created_at: DateTime<Utc>,
    connection_id: ConnectionId,
    connection: Weak<PooledConnection>,
    running: watch::Sender<usize>,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(profile_id: ProfileId, connection: &Arc<PooledConnection>) -> Self {
        Self {
            id: SessionId::generate(),
            profile_id,
            created_at: Utc::now(),
            connection_id: connection.id(),
            connection: Arc::downgrade(connection),
            running: watch::Sender::new(0),
            inner: Mutex::new(SessionInner {
                state: SessionState::Initializing,
                recoverable: false,
                shell: None,
                shell_epoch: 0,
                blocks: BTreeMap::new(),
                controls: HashMap::new(),
                next_block: 1,
                seq: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends to the update sequence. Caller holds the session lock, which
    /// keeps sequence numbers and delivery order aligned.
    fn publish(&self, inner: &mut SessionInner, block_id: Option<BlockId>, event: UpdateEvent) {
        inner.seq += 1;
        let update = BlockUpdate {
            seq: inner.seq,
            session_id: self.id,
            block_id,
            event,
        };
        inner.subscribers.retain(|sub| sub.deliver(&update));
    }

    fn sync_running(&self, inner: &SessionInner) {
        let running = inner.blocks.values().filter(|b| b.is_running()).count();
        self.running.send_replace(running);
    }

    fn finish_block(
        &self,
        inner: &mut SessionInner,
        block_id: BlockId,
        completion: Completion,
        exit_code: Option<i32>,
    ) -> bool {
        let Some(block) = inner.blocks.get_mut(&block_id) else {
            return false;
        };
        if !block.finish(completion, exit_code) {
            return false;
        }
        let event = UpdateEvent::BlockFinished {
            status: block.status,
            exit_code: block.exit_code,
            error: block.error.clone(),
        };
        debug!(session = %self.id, block = block_id, status = %block.status, ?exit_code, "Block finished");
        inner.controls.remove(&block_id);
        self.publish(inner, Some(block_id), event);
        self.sync_running(inner);
        true
    }

    /// Ends every running block with `completion`, tearing channels down.
    fn fail_running(&self, inner: &mut SessionInner, completion: &Completion) {
        let open: Vec<BlockId> = inner.blocks.values().filter(|b| b.is_running()).map(|b| b.id).collect();
        let abort = match completion {
            Completion::Failed(error) => error.clone(),
            _ => BlockError::new(ErrorKind::Cancelled, "session closed"),
        };
        for block_id in open {
            if let Some(control) = inner.controls.get(&block_id) {
                control.abort(abort.clone());
            }
            self.finish_block(inner, block_id, completion.clone(), None);
        }
    }

    fn ensure_accepting(&self, inner: &SessionInner) -> Result<(), SessionError> {
        if inner.state != SessionState::Active {
            return Err(SessionError::InvalidState(format!("session {} is {}", self.id, inner.state)));
        }
        if inner.recoverable {
            return Err(SessionError::InvalidState(format!(
                "session {} is waiting for its connection to recover",
                self.id
            )));
        }
        Ok(())
    }

    fn running_block<'a>(&self, inner: &'a SessionInner, block_id: BlockId) -> Result<&'a Block, SessionError> {
        let block = inner.blocks.get(&block_id).ok_or(SessionError::BlockNotFound {
            session: self.id,
            block: block_id,
        })?;
        if !block.is_running() {
            return Err(SessionError::InvalidState(format!("block {block_id} is {}", block.status)));
        }
        Ok(block)
    }

    fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            id: self.id,
            profile_id: self.profile_id.clone(),
            connection: self.connection_id,
            state: inner.state,
            recoverable: inner.recoverable,
            blocks: inner.blocks.len(),
            created_at: self.created_at,
        }
    }
}

struct ManagerInner {
    pool: ConnectionPool,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    closed: Mutex<VecDeque<ClosedSession>>,
}

/// Creates, runs, and tears down sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Creates a manager on top of `pool`. Must be called inside a tokio
    /// runtime; a background task follows the pool's lifecycle events.
    ///
    /// # Panics
    /// Panics if `config.output_limit` is zero.
    #[must_use]
    pub fn new(pool: ConnectionPool, config: SessionConfig) -> Self {
        assert!(config.output_limit > 0, "output limit must be positive");
        let events = pool.subscribe();
        let inner = Arc::new(ManagerInner {
            pool,
            config,
            sessions: Mutex::new(HashMap::new()),
            closed: Mutex::new(VecDeque::new()),
        });
        tokio::spawn(watch_pool(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Opens a session for `profile_id`.
    ///
    /// # Errors
    /// Pool failures (host key, authentication, network, exhaustion) are
    /// returned unchanged.
    pub async fn create_session(
        &self,
        profile_id: &ProfileId,
        options: &SessionOptions,
    ) -> Result<SessionId, SessionError> {
        let acquire = AcquireOptions {
            accept_host_key: options.accept_host_key.clone(),
            timeout: options.acquire_timeout,
        };
        let connection = self.inner.pool.acquire(profile_id, &acquire).await?;
        let session = Arc::new(Session::new(profile_id.clone(), &connection));
        // Registered while Initializing so pool events during the shell open reach it.
        self.inner.lock_sessions().insert(session.id, Arc::clone(&session));

        let shell = match connection.open_channel(ChannelRequest::Shell { pty: true }).await {
            Ok(shell) => shell,
            Err(e) => {
                warn!(profile = %profile_id, error = %e, "Shell channel failed");
                let closing = session.lock().state != SessionState::Initializing;
                self.inner.lock_sessions().remove(&session.id);
                if !closing {
                    self.inner.report_if_network(connection.id(), &e);
                    self.inner.pool.release(&connection);
                }
                return Err(e.into());
            }
        };

        let reopen = {
            let mut inner = session.lock();
            if inner.state != SessionState::Initializing {
                // Closed while opening; the close already returned the reference.
                return Err(PoolError::ConnectionLost("session closed during setup".to_string()).into());
            }
            inner.state = SessionState::Active;
            if inner.recoverable {
                // Degraded while opening: this shell may belong to the old transport.
                drop(shell);
                connection.state() == ConnectionState::Ready
            } else {
                self.inner.attach_shell(&session, &mut inner, shell);
                false
            }
        };
        if reopen {
            self.inner.reopen_shell(Arc::clone(&session), Arc::clone(&connection));
        }
        info!(session = %session.id, profile = %profile_id, connection = connection.id(), "Session active");
        Ok(session.id)
    }

    /// Submits a command, returning its block id. Progress is reported on
    /// the session's update stream.
    ///
    /// # Errors
    /// [`SessionError::InvalidState`] unless the session is Active and not
    /// recovering. Channel failures do not error; they fail the block.
    pub async fn submit_command(&self, id: SessionId, command: &str) -> Result<BlockId, SessionError> {
        self.submit_command_with_category(id, command, None).await
    }

    /// Like [`Self::submit_command`], attaching a display-only category.
    pub async fn submit_command_with_category(
        &self,
        id: SessionId,
        command: &str,
        category: Option<String>,
    ) -> Result<BlockId, SessionError> {
        let session = self.inner.session(id)?;
        let classification = classify(command);

        let (block_id, connection) = {
            let mut inner = session.lock();
            session.ensure_accepting(&inner)?;
            let connection = session
                .connection
                .upgrade()
                .ok_or_else(|| SessionError::InvalidState(format!("session {id} has no connection")))?;

            let block_id = inner.next_block;
            inner.next_block += 1;
            inner.blocks.insert(
                block_id,
                Block::new(block_id, command, classification, category, self.inner.config.output_limit),
            );
            session.publish(
                &mut inner,
                Some(block_id),
                UpdateEvent::BlockCreated {
                    command: command.to_string(),
                    classification,
                },
            );
            session.sync_running(&inner);
            (block_id, connection)
        };
        connection.touch();

        match executor::execute(&connection, command, classification, &self.inner.config.exec).await {
            Ok(execution) => {
                {
                    let mut inner = session.lock();
                    let finished = inner.blocks.get(&block_id).is_none_or(|b| !b.is_running());
                    if finished {
                        // Failed while the channel was opening.
                        execution
                            .control
                            .abort(BlockError::new(ErrorKind::Cancelled, "block already finished"));
                    } else {
                        inner.controls.insert(block_id, execution.control.clone());
                    }
                }
                tokio::spawn(pump(Arc::downgrade(&self.inner), session, block_id, execution.events));
            }
            Err(e) => {
                warn!(session = %id, block = block_id, error = %e, "Command could not start");
                let error = BlockError::new(e.kind(), e.to_string());
                let mut inner = session.lock();
                session.finish_block(&mut inner, block_id, Completion::Failed(error), None);
                drop(inner);
                self.inner.report_if_network(connection.id(), &e);
            }
        }
        Ok(block_id)
    }

    /// Writes to an interactive block's stdin.
    ///
    /// # Errors
    /// Fails unless the block is running and interactive.
    pub fn send_input(&self, id: SessionId, block_id: BlockId, bytes: &[u8]) -> Result<(), SessionError> {
        let session = self.inner.session(id)?;
        let inner = session.lock();
        let control = interactive_control(&session, &inner, block_id)?;
        control.write_stdin(bytes);
        Ok(())
    }

    /// Sends EOF to an interactive block.
    ///
    /// # Errors
    /// Fails unless the block is running and interactive.
    pub fn close_input(&self, id: SessionId, block_id: BlockId) -> Result<(), SessionError> {
        let session = self.inner.session(id)?;
        let inner = session.lock();
        let control = interactive_control(&session, &inner, block_id)?;
        control.close_stdin();
        Ok(())
    }

    /// Copies `reader` into an interactive block's stdin, then sends EOF.
    /// Returns early once the block has finished.
    ///
    /// # Errors
    /// Fails unless the block is running and interactive, or if `reader`
    /// fails.
    pub async fn forward_input<R>(&self, id: SessionId, block_id: BlockId, mut reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        {
            let session = self.inner.session(id)?;
            let inner = session.lock();
            interactive_control(&session, &inner, block_id)?;
        }

        let mut buf = vec![0u8; INPUT_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            let sent = if n == 0 {
                self.close_input(id, block_id)
            } else {
                self.send_input(id, block_id, &buf[..n])
            };
            match sent {
                Ok(()) if n == 0 => return Ok(()),
                Ok(()) => {}
                Err(_) if self.block(id, block_id).is_ok_and(|b| !b.is_running()) => {
                    debug!(session = %id, block = block_id, "Block finished, input forwarding stopped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancels a running block. It reaches Cancelled within the cancel grace
    /// period even if the remote side ignores the interrupt.
    ///
    /// # Errors
    /// Fails if the block does not exist or already finished.
    pub fn cancel_block(&self, id: SessionId, block_id: BlockId) -> Result<(), SessionError> {
        let session = self.inner.session(id)?;
        let mut inner = session.lock();
        session.running_block(&inner, block_id)?;
        if let Some(control) = inner.controls.get(&block_id).cloned() {
            control.cancel();
        } else {
            // Still opening its channel.
            session.finish_block(&mut inner, block_id, Completion::Cancelled, None);
        }
        debug!(session = %id, block = block_id, "Block cancel requested");
        Ok(())
    }

    /// Closes a session: interrupts running blocks, waits up to the close
    /// grace period, force-terminates the rest, and releases the connection.
    /// Closing an already closed session succeeds.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id.
    pub async fn close_session(&self, id: SessionId) -> Result<(), SessionError> {
        let session = match self.inner.lock_sessions().get(&id).cloned() {
            Some(session) => session,
            None if self.inner.closed_session(id).is_some() => return Ok(()),
            None => return Err(SessionError::NotFound(id)),
        };

        {
            let mut inner = session.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return Ok(());
            }
            inner.state = SessionState::Closing;
            for control in inner.controls.values() {
                control.cancel();
            }
        }

        let mut running = session.running.subscribe();
        let drained = matches!(
            timeout(self.inner.config.close_grace, running.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if !drained {
            warn!(session = %id, "Blocks still running after close grace, forcing teardown");
        }

        self.inner.finish_close(&session, None);
        Ok(())
    }

    /// Closes every live session.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.inner.lock_sessions().keys().copied().collect();
        for id in ids {
            let _ = self.close_session(id).await;
        }
    }

    /// Subscribes to a session's updates from now on.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id, InvalidState once closed.
    pub fn block_updates(&self, id: SessionId) -> Result<BlockUpdates, SessionError> {
        let session = self.inner.session(id)?;
        let (subscriber, updates) = Subscriber::channel(self.inner.config.update_buffer);
        session.lock().subscribers.push(subscriber);
        Ok(updates)
    }

    /// Waits until a block is terminal and returns it.
    ///
    /// # Errors
    /// Fails if the session or block does not exist.
    pub async fn wait_for_block(&self, id: SessionId, block_id: BlockId) -> Result<Block, SessionError> {
        let session = self.inner.session(id)?;
        // Every block finish republishes the running count.
        let mut finished = session.running.subscribe();
        loop {
            {
                let inner = session.lock();
                let block = inner.blocks.get(&block_id).ok_or(SessionError::BlockNotFound {
                    session: id,
                    block: block_id,
                })?;
                if !block.is_running() {
                    return Ok(block.clone());
                }
            }
            if finished.changed().await.is_err() {
                break;
            }
        }

        let inner = session.lock();
        inner.blocks.get(&block_id).cloned().ok_or(SessionError::BlockNotFound {
            session: id,
            block: block_id,
        })
    }

    /// Current state. Recently closed sessions report Closed.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id.
    pub fn session_state(&self, id: SessionId) -> Result<SessionState, SessionError> {
        match self.inner.lock_sessions().get(&id).cloned() {
            Some(session) => Ok(session.lock().state),
            None if self.inner.closed_session(id).is_some() => Ok(SessionState::Closed),
            None => Err(SessionError::NotFound(id)),
        }
    }

    /// True while the session waits for its connection to recover.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id, InvalidState once closed.
    pub fn is_recoverable(&self, id: SessionId) -> Result<bool, SessionError> {
        Ok(self.inner.session(id)?.lock().recoverable)
    }

    /// Close record of a recently closed session.
    #[must_use]
    pub fn closed_session(&self, id: SessionId) -> Option<ClosedSession> {
        self.inner.closed_session(id)
    }

    /// Snapshot of one block.
    ///
    /// # Errors
    /// Fails if the session or block does not exist.
    pub fn block(&self, id: SessionId, block_id: BlockId) -> Result<Block, SessionError> {
        let session = self.inner.session(id)?;
        let inner = session.lock();
        inner.blocks.get(&block_id).cloned().ok_or(SessionError::BlockNotFound {
            session: id,
            block: block_id,
        })
    }

    /// Snapshots of every block, in submission order.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id, InvalidState once closed.
    pub fn blocks(&self, id: SessionId) -> Result<Vec<Block>, SessionError> {
        let session = self.inner.session(id)?;
        let inner = session.lock();
        Ok(inner.blocks.values().cloned().collect())
    }

    /// Live sessions, oldest first.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.lock_sessions().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }
}

fn interactive_control(
    session: &Session,
    inner: &SessionInner,
    block_id: BlockId,
) -> Result<ExecutionControl, SessionError> {
    let block = session.running_block(inner, block_id)?;
    if block.classification != Classification::Interactive {
        return Err(SessionError::InvalidState(format!(
            "block {block_id} is {} and takes no input",
            block.classification
        )));
    }
    inner
        .controls
        .get(&block_id)
        .cloned()
        .ok_or_else(|| SessionError::InvalidState(format!("block {block_id} is not running yet")))
}

impl ManagerInner {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_closed(&self) -> MutexGuard<'_, VecDeque<ClosedSession>> {
        match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Live session by id. Recently closed ids are InvalidState, not NotFound.
    fn session(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.lock_sessions().get(&id).cloned() {
            return Ok(session);
        }
        match self.closed_session(id) {
            Some(_) => Err(SessionError::InvalidState(format!("session {id} is closed"))),
            None => Err(SessionError::NotFound(id)),
        }
    }

    fn closed_session(&self, id: SessionId) -> Option<ClosedSession> {
        self.lock_closed().iter().find(|c| c.id == id).cloned()
    }

    fn bound_to(&self, connection: ConnectionId) -> Vec<Arc<Session>> {
        self.lock_sessions()
            .values()
            .filter(|s| s.connection_id == connection)
            .cloned()
            .collect()
    }

    fn report_if_network(&self, connection: ConnectionId, error: &PoolError) {
        if error.kind() == ErrorKind::Network {
            self.pool.report_transport_error(connection, &error.to_string());
        }
    }

    /// Installs a fresh shell channel. Caller holds the session lock.
    fn attach_shell(self: &Arc<Self>, session: &Arc<Session>, inner: &mut SessionInner, shell: ChannelIo) {
        inner.shell_epoch += 1;
        inner.shell = Some(shell.control);
        tokio::spawn(watch_shell(
            Arc::downgrade(self),
            Arc::downgrade(session),
            inner.shell_epoch,
            shell.events,
        ));
    }

    /// Tears a session down and records it. `reason` is set for forced
    /// closes; their running blocks fail with it, otherwise they are
    /// cancelled.
    fn finish_close(&self, session: &Arc<Session>, reason: Option<BlockError>) {
        {
            let mut inner = session.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            let completion = match &reason {
                Some(error) => Completion::Failed(error.clone()),
                None => Completion::Cancelled,
            };
            session.fail_running(&mut inner, &completion);
            if let Some(shell) = inner.shell.take() {
                let _ = shell.send(ChannelCommand::Close);
            }
            inner.state = SessionState::Closed;
            inner.recoverable = false;
            session.publish(&mut inner, None, UpdateEvent::SessionClosed { reason: reason.clone() });
            inner.subscribers.clear();
            inner.controls.clear();
        }

        self.lock_sessions().remove(&session.id);
        {
            let mut closed = self.lock_closed();
            while closed.len() >= self.config.tombstones.max(1) {
                closed.pop_front();
            }
            closed.push_back(ClosedSession {
                id: session.id,
                reason: reason.clone(),
                closed_at: Utc::now(),
            });
        }

        if let Some(connection) = session.connection.upgrade() {
            self.pool.release(&connection);
        }

        match reason {
            Some(error) => warn!(session = %session.id, error = %error, "Session closed"),
            None => info!(session = %session.id, "Session closed"),
        }
    }

    fn on_degraded(&self, connection: ConnectionId, grace: Duration) {
        for session in self.bound_to(connection) {
            let mut inner = session.lock();
            let live = matches!(inner.state, SessionState::Initializing | SessionState::Active);
            if !live || inner.recoverable {
                continue;
            }
            inner.recoverable = true;
            inner.shell = None;
            inner.shell_epoch += 1;
            session.fail_running(
                &mut inner,
                &Completion::Failed(BlockError::connection_lost("connection degraded")),
            );
            session.publish(&mut inner, None, UpdateEvent::SessionRecovering { grace });
            warn!(session = %session.id, connection, grace_secs = grace.as_secs(), "Session recoverable");
        }
    }

    fn on_restored(self: &Arc<Self>, connection: ConnectionId) {
        for session in self.bound_to(connection) {
            if !session.lock().recoverable {
                continue;
            }
            let Some(conn) = session.connection.upgrade() else {
                continue;
            };
            self.reopen_shell(session, conn);
        }
    }

    /// Opens a replacement shell for a recoverable session. A session still
    /// being created is finished by `create_session` instead.
    fn reopen_shell(self: &Arc<Self>, session: Arc<Session>, conn: Arc<PooledConnection>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match conn.open_channel(ChannelRequest::Shell { pty: true }).await {
                Ok(shell) => {
                    let mut inner = session.lock();
                    if inner.state != SessionState::Active || !inner.recoverable {
                        return;
                    }
                    inner.recoverable = false;
                    manager.attach_shell(&session, &mut inner, shell);
                    session.publish(&mut inner, None, UpdateEvent::SessionResumed);
                    info!(session = %session.id, connection = conn.id(), "Session resumed");
                }
                Err(e) => {
                    let reason = BlockError::connection_lost(format!("shell reopen failed: {e}"));
                    manager.finish_close(&session, Some(reason));
                }
            }
        });
    }

    fn on_lost(&self, connection: ConnectionId, reason: &str) {
        for session in self.bound_to(connection) {
            self.finish_close(&session, Some(BlockError::connection_lost(reason)));
        }
    }
}

/// Follows pool lifecycle events for as long as the manager exists.
async fn watch_pool(manager: Weak<ManagerInner>, mut events: broadcast::Receiver<PoolEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Pool events lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(manager) = manager.upgrade() else {
            return;
        };

        match event {
            PoolEvent::Degraded { connection, grace, .. } => manager.on_degraded(connection, grace),
            PoolEvent::Restored { connection, .. } => manager.on_restored(connection),
            PoolEvent::Lost { connection, reason, .. } => manager.on_lost(connection, &reason),
            PoolEvent::StateChanged {
                connection,
                state: ConnectionState::Closed,
                ..
            } => manager.on_lost(connection, "connection closed"),
            PoolEvent::StateChanged { .. } => {}
        }
    }
}

/// Drains a shell channel; a transport error is reported to the pool.
async fn watch_shell(
    manager: Weak<ManagerInner>,
    session: Weak<Session>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Error(e) => {
                let (Some(manager), Some(session)) = (manager.upgrade(), session.upgrade()) else {
                    return;
                };
                let current = {
                    let inner = session.lock();
                    inner.shell_epoch == epoch && inner.state == SessionState::Active && !inner.recoverable
                };
                if current {
                    warn!(session = %session.id, error = %e, "Shell channel failed");
                    manager.pool.report_transport_error(session.connection_id, &e.to_string());
                }
                return;
            }
            ChannelEvent::Closed => return,
            _ => {}
        }
    }
}

/// Applies one execution's events to its block.
async fn pump(
    manager: Weak<ManagerInner>,
    session: Arc<Session>,
    block_id: BlockId,
    mut events: mpsc::UnboundedReceiver<ExecEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut inner = session.lock();
        match event {
            ExecEvent::Started => {
                if inner.blocks.get_mut(&block_id).is_some_and(Block::start) {
                    session.publish(&mut inner, Some(block_id), UpdateEvent::BlockStarted);
                }
            }
            ExecEvent::Output { stream, bytes } => {
                let Some(block) = inner.blocks.get_mut(&block_id).filter(|b| b.is_running()) else {
                    continue;
                };
                let first_truncation = block.output.push(&bytes);
                let limit = block.output.limit();
                session.publish(&mut inner, Some(block_id), UpdateEvent::Output { stream, bytes });
                if first_truncation {
                    session.publish(&mut inner, Some(block_id), UpdateEvent::OutputTruncated { limit });
                }
            }
            ExecEvent::Finished { completion, exit_code } => {
                // A failed channel means the connection went away.
                let (completion, lost) = match completion {
                    Completion::Failed(error) if error.kind == ErrorKind::Network => {
                        let detail = error.detail.clone();
                        (Completion::Failed(BlockError::connection_lost(error.detail)), Some(detail))
                    }
                    other => (other, None),
                };
                session.finish_block(&mut inner, block_id, completion, exit_code);
                drop(inner);
                if let (Some(detail), Some(manager)) = (lost, manager.upgrade()) {
                    manager.pool.report_transport_error(session.connection_id, &detail);
                }
                return;
            }
        }
    }

    let mut inner = session.lock();
    session.finish_block(
        &mut inner,
        block_id,
        Completion::Failed(BlockError::new(ErrorKind::InvalidState, "executor stopped")),
        None,
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::generate();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_session_error_kinds() {
        let id = SessionId::generate();
        assert_eq!(SessionError::NotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            SessionError::BlockNotFound { session: id, block: 3 }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(SessionError::InvalidState("x".into()).kind(), ErrorKind::InvalidState);
        assert_eq!(SessionError::Pool(PoolError::Shutdown).kind(), ErrorKind::Shutdown);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Active.to_string(), "active");
        assert_eq!(SessionState::Closing.as_str(), "closing");
    }
}
