//! libssh2-backed transport.
//!
//! The TCP connect and key exchange run on the blocking pool. Afterwards a
//! dedicated I/O thread owns the `ssh2::Session`: it keeps the session in
//! non-blocking mode while servicing every open channel and every channel
//! still being opened, and switches to blocking mode only for
//! authentication and keep-alive. Async callers reach the thread through a
//! request queue.
//!
//! An interrupt is a ^C on the pseudo terminal while stdin is still open.
//! Without one, or once EOF has gone out, the channel is closed instead;
//! the server then hangs up the remote process.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ssh2::{Channel, ErrorCode, HashType, HostKeyType, Session};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    ChannelCommand, ChannelEnd, ChannelEvent, ChannelIo, ChannelRequest, Connector, HostKey, Target,
    Transport, TransportError,
};
use crate::store::Credential;

/// Read/write timeout in seconds for blocking operations.
const IO_TIMEOUT_SECS: u64 = 30;

/// How long the I/O thread sleeps when nothing happened.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Read buffer size.
const READ_CHUNK: usize = 8192;

/// Pseudo terminal size (columns, rows).
const PTY_SIZE: (u32, u32) = (120, 40);

/// Minimum interval libssh2 waits between keep-alives.
const KEEPALIVE_MIN_SECS: u32 = 1;

/// libssh2 `LIBSSH2_ERROR_EAGAIN`.
const ERROR_EAGAIN: i32 = -37;

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`.
const ERROR_TIMEOUT: i32 = -9;

/// libssh2 socket send / disconnect / recv errors.
const ERROR_SOCKET_SEND: i32 = -7;
const ERROR_SOCKET_DISCONNECT: i32 = -13;
const ERROR_SOCKET_RECV: i32 = -43;

/// Opens libssh2 transports.
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    io_timeout: Duration,
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new()
    }
}

impl Ssh2Connector {
    /// Creates a connector with the default I/O timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }

    /// Overrides the blocking-operation timeout.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "timeout must be positive");
        self.io_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for Ssh2Connector {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn Transport>, TransportError> {
        let target = target.clone();
        let io_timeout = self.io_timeout;
        let label = target.host_port();

        let (session, host_key) = tokio::task::spawn_blocking(move || handshake(&target, io_timeout))
            .await
            .map_err(|e| TransportError::Network(format!("connect task failed: {e}")))??;

        info!(host = %label, key = %host_key, "SSH handshake complete");
        let transport = Ssh2Transport::spawn(session, host_key, label, io_timeout)?;
        Ok(Arc::new(transport))
    }
}

/// Connects TCP and runs the key exchange.
fn handshake(target: &Target, io_timeout: Duration) -> Result<(Session, HostKey), TransportError> {
    assert!(!target.host.is_empty(), "host must not be empty");
    assert!(target.port > 0, "port must be positive");

    let host_port = target.host_port();
    let addrs: Vec<_> = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Network(format!("cannot resolve {host_port}: {e}")))?
        .collect();

    let mut last_error = None;
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, target.connect_timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }

    let tcp = match (stream, last_error) {
        (Some(tcp), _) => tcp,
        (None, Some(e)) if e.kind() == io::ErrorKind::TimedOut => {
            return Err(TransportError::Timeout(format!("connect to {host_port}")));
        }
        (None, Some(e)) => return Err(TransportError::Network(format!("connect to {host_port}: {e}"))),
        (None, None) => return Err(TransportError::Network(format!("no address for {host_port}"))),
    };

    // Set read/write timeouts to prevent indefinite hangs
    let _ = tcp.set_read_timeout(Some(io_timeout));
    let _ = tcp.set_write_timeout(Some(io_timeout));
    let _ = tcp.set_nodelay(true);

    let mut session = Session::new().map_err(map_ssh_error)?;
    session.set_timeout(millis(target.connect_timeout));
    session.set_tcp_stream(tcp);
    session.handshake().map_err(map_ssh_error)?;

    let key_type = session
        .host_key()
        .map(|(_, kind)| key_type_name(kind))
        .unwrap_or("unknown");
    let hash = session
        .host_key_hash(HashType::Sha256)
        .ok_or_else(|| TransportError::Network("server presented no host key".to_string()))?;
    let fingerprint = format!("SHA256:{}", STANDARD_NO_PAD.encode(hash));

    session.set_timeout(millis(io_timeout));
    session.set_keepalive(true, KEEPALIVE_MIN_SECS);

    Ok((session, HostKey::new(key_type, fingerprint)))
}

fn key_type_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Unknown => "unknown",
        _ => "ssh-ed25519",
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn map_ssh_error(err: ssh2::Error) -> TransportError {
    let io_err: io::Error = err.into();
    match io_err.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout(io_err.to_string()),
        _ => TransportError::Network(io_err.to_string()),
    }
}

fn map_auth_error(err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::Session(ERROR_TIMEOUT) => TransportError::Timeout(err.message().to_string()),
        ErrorCode::Session(ERROR_SOCKET_SEND | ERROR_SOCKET_DISCONNECT | ERROR_SOCKET_RECV) => {
            TransportError::Network(err.message().to_string())
        }
        _ => TransportError::Auth(err.message().to_string()),
    }
}

fn would_block(err: &ssh2::Error) -> bool {
    err.code() == ErrorCode::Session(ERROR_EAGAIN)
}

/// Work handed to the I/O thread.
enum IoRequest {
    Authenticate {
        username: String,
        credential: Credential,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Open {
        request: ChannelRequest,
        reply: oneshot::Sender<Result<ChannelIo, TransportError>>,
    },
    Keepalive {
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// A libssh2 connection serviced by its own I/O thread.
pub struct Ssh2Transport {
    host_key: HostKey,
    requests: std_mpsc::Sender<IoRequest>,
}

impl Ssh2Transport {
    fn spawn(session: Session, host_key: HostKey, label: String, io_timeout: Duration) -> Result<Self, TransportError> {
        let (tx, rx) = std_mpsc::channel();
        let io_loop = IoLoop {
            session,
            requests: rx,
            opening: Vec::new(),
            channels: Vec::new(),
            label: label.clone(),
            io_timeout,
        };

        thread::Builder::new()
            .name(format!("ssh-io-{label}"))
            .spawn(move || io_loop.run())
            .map_err(|e| TransportError::Network(format!("cannot start I/O thread: {e}")))?;

        Ok(Self { host_key, requests: tx })
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> IoRequest,
    ) -> Result<T, TransportError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for Ssh2Transport {
    fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    async fn authenticate(&self, username: &str, credential: &Credential) -> Result<(), TransportError> {
        let username = username.to_string();
        let credential = credential.clone();
        self.call(|reply| IoRequest::Authenticate {
            username,
            credential,
            reply,
        })
        .await?
    }

    async fn open_channel(&self, request: ChannelRequest) -> Result<ChannelIo, TransportError> {
        self.call(|reply| IoRequest::Open { request, reply }).await?
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        self.call(|reply| IoRequest::Keepalive { reply }).await?
    }

    async fn disconnect(&self) {
        let _ = self.call(|reply| IoRequest::Disconnect { reply }).await;
    }
}

/// State owned by the I/O thread.
struct IoLoop {
    session: Session,
    requests: std_mpsc::Receiver<IoRequest>,
    opening: Vec<PendingOpen>,
    channels: Vec<LiveChannel>,
    label: String,
    io_timeout: Duration,
}

impl IoLoop {
    fn run(mut self) {
        debug!(host = %self.label, "SSH I/O thread started");
        self.session.set_blocking(false);

        loop {
            let mut progressed = false;

            loop {
                match self.requests.try_recv() {
                    Ok(request) => {
                        progressed = true;
                        if !self.handle(request) {
                            return self.finish("disconnected");
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.finish("transport dropped"),
                }
            }

            progressed |= self.service_opens();
            progressed |= self.service_channels();

            if !progressed {
                match self.requests.recv_timeout(IDLE_POLL) {
                    Ok(request) => {
                        if !self.handle(request) {
                            return self.finish("disconnected");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return self.finish("transport dropped"),
                }
            }
        }
    }

    /// Runs `f` with the session in blocking mode.
    fn blocking<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        self.session.set_blocking(true);
        let result = f(&self.session);
        self.session.set_blocking(false);
        result
    }

    /// Handles one request. Returns false once the session is gone.
    fn handle(&mut self, request: IoRequest) -> bool {
        match request {
            IoRequest::Authenticate {
                username,
                credential,
                reply,
            } => {
                let result = self.blocking(|session| authenticate(session, &username, &credential));
                drop(credential);
                let _ = reply.send(result);
                true
            }
            IoRequest::Open { request, reply } => {
                self.opening.push(PendingOpen::new(request, reply, self.io_timeout));
                true
            }
            IoRequest::Keepalive { reply } => {
                let result = self.blocking(|session| session.keepalive_send().map(|_| ()).map_err(map_ssh_error));
                let _ = reply.send(result);
                true
            }
            IoRequest::Disconnect { reply } => {
                let _ = self.blocking(|session| session.disconnect(None, "closing", None));
                let _ = reply.send(());
                false
            }
        }
    }

    fn service_opens(&mut self) -> bool {
        let mut progressed = false;
        let session = &self.session;
        let channels = &mut self.channels;
        self.opening.retain_mut(|pending| {
            let Some(result) = pending.poll(session) else {
                return still_wanted(pending);
            };
            progressed = true;
            let pty = pending.pty();
            let result = result.map(|channel| {
                let (io, end) = ChannelIo::pair();
                channels.push(LiveChannel::new(channel, end, pty));
                io
            });
            if let Err(e) = &result {
                warn!(error = %e, "SSH channel open failed");
            }
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(result);
            }
            false
        });
        progressed
    }

    fn service_channels(&mut self) -> bool {
        let mut progressed = false;
        let mut buf = [0u8; READ_CHUNK];
        self.channels.retain_mut(|live| {
            let (alive, did_work) = live.service(&mut buf);
            progressed |= did_work;
            alive
        });
        progressed
    }

    fn finish(mut self, reason: &str) {
        for mut pending in self.opening.drain(..) {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(TransportError::Closed));
            }
        }
        for live in self.channels.drain(..) {
            let _ = live.end.events.send(ChannelEvent::Error(TransportError::Closed));
        }
        debug!(host = %self.label, reason, "SSH I/O thread stopped");
    }
}

fn authenticate(session: &Session, username: &str, credential: &Credential) -> Result<(), TransportError> {
    let result = match credential {
        Credential::Password { password } => session.userauth_password(username, password),
        Credential::PrivateKey { pem, passphrase } => {
            pubkey_memory(session, username, pem, passphrase.as_ref().map(|p| p.as_str()))
        }
        Credential::Agent => session.userauth_agent(username),
    };

    match result {
        Ok(()) if session.authenticated() => Ok(()),
        Ok(()) => Err(TransportError::Auth("server did not accept credentials".to_string())),
        Err(e) => Err(map_auth_error(e)),
    }
}

#[cfg(unix)]
fn pubkey_memory(
    session: &Session,
    username: &str,
    pem: &str,
    passphrase: Option<&str>,
) -> Result<(), ssh2::Error> {
    session.userauth_pubkey_memory(username, None, pem, passphrase)
}

#[cfg(not(unix))]
fn pubkey_memory(
    _session: &Session,
    _username: &str,
    _pem: &str,
    _passphrase: Option<&str>,
) -> Result<(), ssh2::Error> {
    Err(ssh2::Error::new(
        ErrorCode::Session(-19),
        "in-memory private keys are not supported on this platform",
    ))
}

/// Keeps polling an open only while someone still waits for it.
fn still_wanted(pending: &PendingOpen) -> bool {
    pending.reply.as_ref().is_some_and(|reply| !reply.is_closed())
}

/// Where a channel open stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenStage {
    Session,
    Pty,
    Start,
}

/// A channel open in progress. A libssh2 call that would block is repeated
/// with the same arguments on the next round.
struct PendingOpen {
    request: ChannelRequest,
    reply: Option<oneshot::Sender<Result<ChannelIo, TransportError>>>,
    channel: Option<Channel>,
    stage: OpenStage,
    deadline: Instant,
}

impl PendingOpen {
    fn new(
        request: ChannelRequest,
        reply: oneshot::Sender<Result<ChannelIo, TransportError>>,
        timeout: Duration,
    ) -> Self {
        Self {
            request,
            reply: Some(reply),
            channel: None,
            stage: OpenStage::Session,
            deadline: Instant::now() + timeout,
        }
    }

    fn pty(&self) -> bool {
        match &self.request {
            ChannelRequest::Shell { pty } | ChannelRequest::Exec { pty, .. } => *pty,
        }
    }

    /// Advances the open. `None` while libssh2 still waits on the socket.
    fn poll(&mut self, session: &Session) -> Option<Result<Channel, TransportError>> {
        if Instant::now() >= self.deadline {
            return Some(Err(TransportError::Timeout("channel open".to_string())));
        }

        loop {
            let err = match self.stage {
                OpenStage::Session => match session.channel_session() {
                    Ok(channel) => {
                        self.channel = Some(channel);
                        self.stage = if self.pty() { OpenStage::Pty } else { OpenStage::Start };
                        continue;
                    }
                    Err(e) => e,
                },
                OpenStage::Pty => {
                    let Some(channel) = self.channel.as_mut() else {
                        return Some(Err(TransportError::Network("channel vanished during open".to_string())));
                    };
                    match channel.request_pty("xterm", None, Some((PTY_SIZE.0, PTY_SIZE.1, 0, 0))) {
                        Ok(()) => {
                            self.stage = OpenStage::Start;
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                OpenStage::Start => {
                    let Some(channel) = self.channel.as_mut() else {
                        return Some(Err(TransportError::Network("channel vanished during open".to_string())));
                    };
                    let started = match &self.request {
                        ChannelRequest::Exec { command, .. } => channel.exec(command),
                        ChannelRequest::Shell { .. } => channel.shell(),
                    };
                    match started {
                        Ok(()) => return self.channel.take().map(Ok),
                        Err(e) => e,
                    }
                }
            };

            if would_block(&err) {
                return None;
            }
            return Some(Err(map_ssh_error(err)));
        }
    }
}

/// ^C, delivered as SIGINT by the remote terminal.
const ETX: u8 = 0x03;

/// Interrupt delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    CtrlC,
    Close,
}

/// How an interrupt reaches the remote process. A ^C only means something
/// to a terminal, and cannot be written once EOF is queued.
fn interrupt_action(pty: bool, eof_requested: bool) -> Interrupt {
    if pty && !eof_requested {
        Interrupt::CtrlC
    } else {
        Interrupt::Close
    }
}

/// A channel being pumped by the I/O thread.
struct LiveChannel {
    channel: Channel,
    end: ChannelEnd,
    pty: bool,
    pending: VecDeque<u8>,
    eof_requested: bool,
    eof_sent: bool,
}

impl LiveChannel {
    fn new(channel: Channel, end: ChannelEnd, pty: bool) -> Self {
        Self {
            channel,
            end,
            pty,
            pending: VecDeque::new(),
            eof_requested: false,
            eof_sent: false,
        }
    }

    /// Closes this channel only. The connection stays up.
    fn close_local(&mut self) -> (bool, bool) {
        let _ = self.channel.close();
        self.emit(ChannelEvent::Closed);
        (false, true)
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.end.events.send(event);
    }

    fn fail(&mut self, detail: String) -> (bool, bool) {
        warn!(detail = %detail, "SSH channel failed");
        let _ = self.channel.close();
        self.emit(ChannelEvent::Error(TransportError::Network(detail)));
        (false, true)
    }

    /// Pumps one round of I/O. Returns (still open, made progress).
    fn service(&mut self, buf: &mut [u8]) -> (bool, bool) {
        let mut progressed = false;

        loop {
            match self.end.control.try_recv() {
                Ok(ChannelCommand::Stdin(bytes)) if self.eof_requested => {
                    debug!(len = bytes.len(), "Dropping stdin after EOF");
                }
                Ok(ChannelCommand::Stdin(bytes)) => self.pending.extend(bytes),
                Ok(ChannelCommand::CloseStdin) => self.eof_requested = true,
                Ok(ChannelCommand::Interrupt) => match interrupt_action(self.pty, self.eof_requested) {
                    Interrupt::CtrlC => self.pending.push_back(ETX),
                    Interrupt::Close => {
                        debug!("Interrupt without an open terminal, closing channel");
                        return self.close_local();
                    }
                },
                Ok(ChannelCommand::Close) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.close_local();
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        if !self.pending.is_empty() {
            let (front, _) = self.pending.as_slices();
            match self.channel.write(front) {
                Ok(n) => {
                    self.pending.drain(..n);
                    progressed |= n > 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return self.fail(format!("stdin write failed: {e}")),
            }
        } else if self.eof_requested && !self.eof_sent {
            match self.channel.send_eof() {
                Ok(()) => {
                    self.eof_sent = true;
                    progressed = true;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return self.fail(format!("stdin eof failed: {e}")),
            }
        }

        let mut read_any = false;
        match self.channel.read(buf) {
            Ok(0) => {}
            Ok(n) => {
                self.emit(ChannelEvent::Stdout(buf[..n].to_vec()));
                read_any = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return self.fail(format!("stdout read failed: {e}")),
        }
        match self.channel.stderr().read(buf) {
            Ok(0) => {}
            Ok(n) => {
                self.emit(ChannelEvent::Stderr(buf[..n].to_vec()));
                read_any = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return self.fail(format!("stderr read failed: {e}")),
        }

        if read_any {
            return (true, true);
        }

        if self.channel.eof() {
            match self.channel.wait_close() {
                Ok(()) => {
                    let code = self.channel.exit_status().unwrap_or(-1);
                    self.emit(ChannelEvent::Exit(code));
                    self.emit(ChannelEvent::Closed);
                    return (false, true);
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return self.fail(format!("close failed: {e}")),
            }
        }

        (true, progressed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_names() {
        assert_eq!(key_type_name(HostKeyType::Rsa), "ssh-rsa");
        assert_eq!(key_type_name(HostKeyType::Ecdsa256), "ecdsa-sha2-nistp256");
        assert_eq!(key_type_name(HostKeyType::Unknown), "unknown");
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::from_secs(u64::MAX / 2)), u32::MAX);
    }

    #[test]
    fn test_auth_error_mapping() {
        let err = ssh2::Error::new(ErrorCode::Session(-18), "Authentication failed");
        assert!(matches!(map_auth_error(err), TransportError::Auth(_)));

        let err = ssh2::Error::new(ErrorCode::Session(ERROR_TIMEOUT), "Timed out");
        assert!(matches!(map_auth_error(err), TransportError::Timeout(_)));

        let err = ssh2::Error::new(ErrorCode::Session(ERROR_SOCKET_RECV), "recv");
        assert!(matches!(map_auth_error(err), TransportError::Network(_)));
    }

    #[test]
    fn test_would_block() {
        assert!(would_block(&ssh2::Error::new(ErrorCode::Session(ERROR_EAGAIN), "again")));
        assert!(!would_block(&ssh2::Error::new(ErrorCode::Session(-1), "other")));
    }

    #[test]
    fn test_channel_open_gives_up_at_deadline() {
        let session = Session::new().unwrap();
        let (reply, _rx) = oneshot::channel();
        let mut pending = PendingOpen::new(ChannelRequest::Shell { pty: true }, reply, Duration::ZERO);
        assert!(pending.pty());
        assert!(still_wanted(&pending));

        match pending.poll(&session) {
            Some(Err(TransportError::Timeout(_))) => {}
            other => panic!("expected timeout, got {:?}", other.map(|r| r.map(|_| ()))),
        }
    }

    #[test]
    fn test_abandoned_open_stops_polling() {
        let (reply, rx) = oneshot::channel();
        let pending = PendingOpen::new(ChannelRequest::Shell { pty: false }, reply, Duration::from_secs(5));
        drop(rx);
        assert!(!still_wanted(&pending));
    }

    #[test]
    fn test_interrupt_needs_open_terminal() {
        assert_eq!(interrupt_action(true, false), Interrupt::CtrlC);
        // EOF already queued: a ^C write would be rejected by the server.
        assert_eq!(interrupt_action(true, true), Interrupt::Close);
        // No terminal to turn ^C into SIGINT.
        assert_eq!(interrupt_action(false, false), Interrupt::Close);
        assert_eq!(interrupt_action(false, true), Interrupt::Close);
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap_or_else(|e| panic!("{e}"));
            listener.local_addr().map(|a| a.port()).unwrap_or(1)
        };
        let target = Target {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
        };
        let err = Ssh2Connector::new().connect(&target).await.err();
        assert!(matches!(
            err,
            Some(TransportError::Network(_) | TransportError::Timeout(_))
        ));
    }
}
