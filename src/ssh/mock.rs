//! In-memory SSH server used by tests.
//!
//! [`MockConnector`] plays every host registered on it. Channels run a tiny
//! command interpreter on tokio tasks, so timer-driven behavior follows the
//! paused test clock:
//!
//! | command              | behavior                                       |
//! |----------------------|------------------------------------------------|
//! | `echo TEXT [>&2]`    | prints `TEXT\n`, exits 0                        |
//! | `true` / `false`     | exits 0 / 1                                    |
//! | `exit N`             | exits N                                        |
//! | `seq N`              | prints `1..=N`, one line per event              |
//! | `sleep SECS`         | exits 0 after SECS                              |
//! | `tail -f`, `yes`, …  | prints `line N` every second until interrupted |
//! | `cat`                | echoes stdin until EOF                         |
//! | anything else        | `not found` on stderr, exits 127               |
//!
//! Interrupts end a running command with exit status 130 unless the host is
//! set to ignore them. A host can also be set to treat an interrupt that
//! arrives after stdin EOF as a failed channel write, the way a server
//! answers a ^C written to a half-closed channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, sleep};

use super::{
    ChannelCommand, ChannelEnd, ChannelEvent, ChannelIo, ChannelRequest, Connector, HostKey, Target,
    Transport, TransportError,
};
use crate::store::Credential;

/// Exit status reported for interrupted commands.
const INTERRUPTED_STATUS: i32 = 130;

/// Exit status reported for unknown commands.
const NOT_FOUND_STATUS: i32 = 127;

/// Output period of streaming commands.
const STREAM_PERIOD: Duration = Duration::from_secs(1);

/// Scripted server state for one `host:port`.
struct MockHost {
    key: HostKey,
    password: Option<String>,
    down: bool,
    epoch: u64,
    kill: watch::Sender<u64>,
    behavior: Behavior,
    failing_keepalives: u32,
    failing_connects: u32,
}

#[derive(Default)]
struct MockState {
    hosts: Mutex<HashMap<String, MockHost>>,
    connects: AtomicUsize,
    auths: AtomicUsize,
    live_channels: AtomicUsize,
    connect_delay: Mutex<Duration>,
    open_delay: Mutex<Duration>,
}

impl MockState {
    fn hosts(&self) -> MutexGuard<'_, HashMap<String, MockHost>> {
        match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_host<T>(&self, host_port: &str, f: impl FnOnce(&mut MockHost) -> T) -> Option<T> {
        self.hosts().get_mut(host_port).map(f)
    }
}

/// Scripted connector. Cloning shares the same simulated network.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Creates a connector with no hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host presenting `key`. Any password is accepted until
    /// [`Self::set_password`] is called.
    pub fn add_host(&self, host_port: &str, key: HostKey) {
        let (kill, _) = watch::channel(0);
        self.state.hosts().insert(
            host_port.to_string(),
            MockHost {
                key,
                password: None,
                down: false,
                epoch: 0,
                kill,
                behavior: Behavior::default(),
                failing_keepalives: 0,
                failing_connects: 0,
            },
        );
    }

    /// Accepts only this password from now on.
    pub fn set_password(&self, host_port: &str, password: &str) {
        self.state
            .with_host(host_port, |h| h.password = Some(password.to_string()));
    }

    /// Makes the host present a different key.
    pub fn set_host_key(&self, host_port: &str, key: HostKey) {
        self.state.with_host(host_port, |h| h.key = key);
    }

    /// Drops every existing connection to the host and refuses new ones.
    pub fn break_host(&self, host_port: &str) {
        self.state.with_host(host_port, |h| {
            h.down = true;
            h.epoch += 1;
            h.kill.send_replace(h.epoch);
        });
    }

    /// Accepts connections to the host again.
    pub fn restore_host(&self, host_port: &str) {
        self.state.with_host(host_port, |h| h.down = false);
    }

    /// Makes the next `count` keep-alives fail without dropping anything.
    pub fn fail_keepalives(&self, host_port: &str, count: u32) {
        self.state.with_host(host_port, |h| h.failing_keepalives = count);
    }

    /// Makes the next `count` connection attempts fail with a network error.
    pub fn fail_connects(&self, host_port: &str, count: u32) {
        self.state.with_host(host_port, |h| h.failing_connects = count);
    }

    /// Makes running commands ignore interrupts.
    pub fn set_ignore_interrupt(&self, host_port: &str, ignore: bool) {
        self.state.with_host(host_port, |h| h.behavior.ignore_interrupt = ignore);
    }

    /// Makes an interrupt after stdin EOF fail the channel with a write error.
    pub fn set_reject_after_eof(&self, host_port: &str, reject: bool) {
        self.state.with_host(host_port, |h| h.behavior.reject_after_eof = reject);
    }

    /// Delays every connection attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.state.connect_delay.lock() {
            *guard = delay;
        }
    }

    /// Delays every channel open after the transport accepted it, so the
    /// transport can go away while the open is still in flight.
    pub fn set_open_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.state.open_delay.lock() {
            *guard = delay;
        }
    }

    /// Number of connection attempts so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of authentication attempts so far.
    #[must_use]
    pub fn auth_count(&self) -> usize {
        self.state.auths.load(Ordering::SeqCst)
    }

    /// Number of channels currently open.
    #[must_use]
    pub fn live_channels(&self) -> usize {
        self.state.live_channels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn Transport>, TransportError> {
        let delay = self.state.connect_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let host_port = target.host_port();

        let mut hosts = self.state.hosts();
        let Some(host) = hosts.get_mut(&host_port) else {
            return Err(TransportError::Network(format!("no route to {host_port}")));
        };
        if host.down {
            return Err(TransportError::Network(format!("connection refused by {host_port}")));
        }
        if host.failing_connects > 0 {
            host.failing_connects -= 1;
            return Err(TransportError::Network(format!("connection reset by {host_port}")));
        }

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MockTransport {
            host_port,
            key: host.key.clone(),
            epoch: host.epoch,
            host_kill: host.kill.subscribe(),
            closed,
            authenticated: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }
}

/// One simulated connection.
struct MockTransport {
    host_port: String,
    key: HostKey,
    epoch: u64,
    host_kill: watch::Receiver<u64>,
    closed: watch::Sender<bool>,
    authenticated: AtomicBool,
    state: Arc<MockState>,
}

impl MockTransport {
    fn check_alive(&self) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        let alive = self
            .state
            .with_host(&self.host_port, |h| !h.down && h.epoch == self.epoch)
            .unwrap_or(false);
        if alive {
            Ok(())
        } else {
            Err(TransportError::Network(format!("connection to {} reset", self.host_port)))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn host_key(&self) -> &HostKey {
        &self.key
    }

    async fn authenticate(&self, _username: &str, credential: &Credential) -> Result<(), TransportError> {
        self.state.auths.fetch_add(1, Ordering::SeqCst);
        self.check_alive()?;

        let expected = self
            .state
            .with_host(&self.host_port, |h| h.password.clone())
            .flatten();
        let accepted = match credential {
            Credential::Password { password } => {
                expected.as_deref().is_none_or(|p| p == password.as_str())
            }
            Credential::PrivateKey { pem, .. } => !pem.is_empty(),
            Credential::Agent => true,
        };

        if accepted {
            self.authenticated.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(TransportError::Auth("permission denied".to_string()))
        }
    }

    async fn open_channel(&self, request: ChannelRequest) -> Result<ChannelIo, TransportError> {
        self.check_alive()?;
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(TransportError::Auth("not authenticated".to_string()));
        }
        let delay = self.state.open_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let behavior = self
            .state
            .with_host(&self.host_port, |h| h.behavior)
            .unwrap_or_default();
        let script = match &request {
            ChannelRequest::Shell { .. } => Script::Shell,
            ChannelRequest::Exec { command, .. } => Script::parse(command),
        };

        let (io, end) = ChannelIo::pair();
        let loss = LossSignal {
            host: self.host_kill.clone(),
            epoch: self.epoch,
            transport: self.closed.subscribe(),
        };
        let counter = LiveGuard::new(Arc::clone(&self.state));
        tokio::spawn(async move {
            let _counter = counter;
            run_channel(script, end, loss, behavior).await;
        });
        Ok(io)
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        let injected = self
            .state
            .with_host(&self.host_port, |h| {
                if h.failing_keepalives > 0 {
                    h.failing_keepalives -= 1;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if injected {
            return Err(TransportError::Timeout("keep-alive unanswered".to_string()));
        }
        self.check_alive()
    }

    async fn disconnect(&self) {
        self.closed.send_replace(true);
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

/// Keeps [`MockConnector::live_channels`] accurate.
struct LiveGuard(Arc<MockState>);

impl LiveGuard {
    fn new(state: Arc<MockState>) -> Self {
        state.live_channels.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves when the connection under a channel goes away.
struct LossSignal {
    host: watch::Receiver<u64>,
    epoch: u64,
    transport: watch::Receiver<bool>,
}

impl LossSignal {
    async fn wait(&mut self) {
        let epoch = self.epoch;
        tokio::select! {
            _ = self.host.wait_for(|e| *e != epoch) => {}
            _ = self.transport.wait_for(|closed| *closed) => {}
        }
    }
}

/// What a channel runs.
#[derive(Debug, Clone, PartialEq)]
enum Script {
    Shell,
    Print { text: String, stderr: bool },
    Exit(i32),
    Seq(u64),
    Sleep(Duration),
    Stream,
    Cat,
    NotFound(String),
}

impl Script {
    fn parse(command: &str) -> Self {
        let command = command.trim();
        let (command, stderr) = match command.strip_suffix(">&2") {
            Some(rest) => (rest.trim_end(), true),
            None => (command, false),
        };

        let mut words = command.split_whitespace();
        let Some(program) = words.next() else {
            return Self::Exit(0);
        };
        let args: Vec<&str> = words.collect();

        match program {
            "echo" => {
                let rest = command["echo".len()..].trim();
                let text = rest.trim_matches(|c| c == '"' || c == '\'');
                Self::Print {
                    text: format!("{text}\n"),
                    stderr,
                }
            }
            "true" | ":" => Self::Exit(0),
            "false" => Self::Exit(1),
            "exit" => Self::Exit(args.first().and_then(|n| n.parse().ok()).unwrap_or(0)),
            "seq" => Self::Seq(args.first().and_then(|n| n.parse().ok()).unwrap_or(0)),
            "sleep" => {
                let secs: f64 = args.first().and_then(|n| n.parse().ok()).unwrap_or(0.0);
                Self::Sleep(Duration::from_secs_f64(secs.max(0.0)))
            }
            "tail" if args.iter().any(|a| matches!(*a, "-f" | "-F")) => Self::Stream,
            "yes" | "watch" | "ping" | "journalctl" | "top" => Self::Stream,
            "cat" if args.is_empty() => Self::Cat,
            other => Self::NotFound(other.to_string()),
        }
    }
}

/// How a host's running commands react to control messages.
#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    ignore_interrupt: bool,
    reject_after_eof: bool,
}

async fn run_channel(script: Script, mut end: ChannelEnd, mut loss: LossSignal, behavior: Behavior) {
    let ignore_interrupt = behavior.ignore_interrupt;
    let mut eof = false;
    let send = |end: &ChannelEnd, event: ChannelEvent| {
        let _ = end.events.send(event);
    };
    let exit = |end: &ChannelEnd, code: i32| {
        let _ = end.events.send(ChannelEvent::Exit(code));
        let _ = end.events.send(ChannelEvent::Closed);
    };

    match script {
        Script::Print { text, stderr } => {
            let bytes = text.into_bytes();
            if stderr {
                send(&end, ChannelEvent::Stderr(bytes));
            } else {
                send(&end, ChannelEvent::Stdout(bytes));
            }
            exit(&end, 0);
        }
        Script::Exit(code) => exit(&end, code),
        Script::Seq(n) => {
            for i in 1..=n {
                send(&end, ChannelEvent::Stdout(format!("{i}\n").into_bytes()));
            }
            exit(&end, 0);
        }
        Script::NotFound(name) => {
            send(
                &end,
                ChannelEvent::Stderr(format!("sh: 1: {name}: not found\n").into_bytes()),
            );
            exit(&end, NOT_FOUND_STATUS);
        }
        Script::Sleep(duration) => {
            let timer = sleep(duration);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    () = &mut timer => return exit(&end, 0),
                    () = loss.wait() => return send(&end, ChannelEvent::Error(lost())),
                    command = end.control.recv() => match command {
                        Some(ChannelCommand::CloseStdin) => eof = true,
                        Some(ChannelCommand::Interrupt) if eof && behavior.reject_after_eof => {
                            return send(&end, ChannelEvent::Error(write_after_eof()));
                        }
                        Some(ChannelCommand::Interrupt) if !ignore_interrupt => {
                            return exit(&end, INTERRUPTED_STATUS);
                        }
                        Some(ChannelCommand::Close) | None => return send(&end, ChannelEvent::Closed),
                        Some(_) => {}
                    },
                }
            }
        }
        Script::Stream => {
            let mut ticker = interval(STREAM_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut line = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        line += 1;
                        send(&end, ChannelEvent::Stdout(format!("line {line}\n").into_bytes()));
                    }
                    () = loss.wait() => return send(&end, ChannelEvent::Error(lost())),
                    command = end.control.recv() => match command {
                        Some(ChannelCommand::CloseStdin) => eof = true,
                        Some(ChannelCommand::Interrupt) if eof && behavior.reject_after_eof => {
                            return send(&end, ChannelEvent::Error(write_after_eof()));
                        }
                        Some(ChannelCommand::Interrupt) if !ignore_interrupt => {
                            return exit(&end, INTERRUPTED_STATUS);
                        }
                        Some(ChannelCommand::Close) | None => return send(&end, ChannelEvent::Closed),
                        Some(_) => {}
                    },
                }
            }
        }
        Script::Cat => loop {
            tokio::select! {
                () = loss.wait() => return send(&end, ChannelEvent::Error(lost())),
                command = end.control.recv() => match command {
                    Some(ChannelCommand::Stdin(bytes)) => send(&end, ChannelEvent::Stdout(bytes)),
                    Some(ChannelCommand::CloseStdin) => return exit(&end, 0),
                    Some(ChannelCommand::Interrupt) if !ignore_interrupt => {
                        return exit(&end, INTERRUPTED_STATUS);
                    }
                    Some(ChannelCommand::Interrupt) => {}
                    Some(ChannelCommand::Close) | None => return send(&end, ChannelEvent::Closed),
                },
            }
        },
        Script::Shell => loop {
            tokio::select! {
                () = loss.wait() => return send(&end, ChannelEvent::Error(lost())),
                command = end.control.recv() => match command {
                    Some(ChannelCommand::Close) | None => return send(&end, ChannelEvent::Closed),
                    Some(_) => {}
                },
            }
        },
    }
}

fn lost() -> TransportError {
    TransportError::Network("connection reset by peer".to_string())
}

fn write_after_eof() -> TransportError {
    TransportError::Network("channel write failed: EOF already sent".to_string())
}
