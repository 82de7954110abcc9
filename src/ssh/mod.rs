//! SSH transport seam.
//!
//! The pool only talks to the [`Connector`] and [`Transport`] traits:
//!
//! - [`client`]: libssh2-backed implementation
//! - [`mock`]: in-memory scripted server used by tests
//! - [`known_hosts`]: pinned host key database
//!
//! A transport multiplexes any number of channels. Each channel is a pair of
//! queues: the transport pushes [`ChannelEvent`]s, the caller pushes
//! [`ChannelCommand`]s.

pub mod client;
pub mod known_hosts;
pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use client::Ssh2Connector;
pub use known_hosts::{HostKeyStatus, KnownHost, KnownHosts};
pub use mock::MockConnector;

use crate::error::ErrorKind;
use crate::store::Credential;
use crate::store::profile::join_host_port;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// TCP or protocol failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server rejected the credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Returns the stable error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Closed => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Auth(_) => ErrorKind::Auth,
        }
    }
}

/// Server host key as presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key algorithm, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// OpenSSH style fingerprint, `SHA256:<base64>`.
    pub fingerprint: String,
}

impl HostKey {
    /// Creates a host key description.
    #[must_use]
    pub fn new(key_type: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, self.fingerprint)
    }
}

/// Where to connect.
#[derive(Debug, Clone)]
pub struct Target {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// TCP connect plus handshake deadline.
    pub connect_timeout: Duration,
}

impl Target {
    /// Returns `host:port`, with IPv6 literals in brackets.
    #[must_use]
    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// What a new channel runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Login shell.
    Shell {
        /// Request a pseudo terminal.
        pty: bool,
    },
    /// Single command.
    Exec {
        /// Command line passed to the remote shell.
        command: String,
        /// Request a pseudo terminal.
        pty: bool,
    },
}

/// Output and status pushed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes on stdout.
    Stdout(Vec<u8>),
    /// Bytes on stderr.
    Stderr(Vec<u8>),
    /// Remote process exit status.
    Exit(i32),
    /// Channel fully closed. Always the last event of a healthy channel.
    Closed,
    /// Channel failed.
    Error(TransportError),
}

/// Instructions pushed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Write bytes to stdin.
    Stdin(Vec<u8>),
    /// Send EOF on stdin.
    CloseStdin,
    /// Interrupt the remote process: Ctrl-C on a terminal with stdin still
    /// open, otherwise the channel is closed and reports `Closed`.
    Interrupt,
    /// Close the channel now.
    Close,
}

/// Both ends of an open channel, as seen by the caller.
#[derive(Debug)]
pub struct ChannelIo {
    /// Events from the remote side.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Commands to the remote side.
    pub control: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelIo {
    /// Creates a connected pair: the caller half and the transport half.
    #[must_use]
    pub fn pair() -> (Self, ChannelEnd) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                events: event_rx,
                control: control_tx,
            },
            ChannelEnd {
                events: event_tx,
                control: control_rx,
            },
        )
    }
}

/// Transport half of a channel.
#[derive(Debug)]
pub struct ChannelEnd {
    /// Where the transport pushes events.
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    /// Where the transport reads commands.
    pub control: mpsc::UnboundedReceiver<ChannelCommand>,
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and completes the key exchange. No authentication yet.
    async fn connect(&self, target: &Target) -> Result<Arc<dyn Transport>, TransportError>;
}

/// One encrypted connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Host key presented during the handshake.
    fn host_key(&self) -> &HostKey;

    /// Authenticates `username` with `credential`.
    async fn authenticate(&self, username: &str, credential: &Credential) -> Result<(), TransportError>;

    /// Opens a new multiplexed channel.
    async fn open_channel(&self, request: ChannelRequest) -> Result<ChannelIo, TransportError>;

    /// Probes liveness.
    async fn keepalive(&self) -> Result<(), TransportError>;

    /// Tears the connection down. Open channels end with an error.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_kinds() {
        assert_eq!(TransportError::Network("reset".into()).kind(), ErrorKind::Network);
        assert_eq!(TransportError::Closed.kind(), ErrorKind::Network);
        assert_eq!(TransportError::Timeout("kex".into()).kind(), ErrorKind::Timeout);
        assert_eq!(TransportError::Auth("denied".into()).kind(), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_channel_pair_wiring() {
        let (mut io, mut end) = ChannelIo::pair();
        end.events.send(ChannelEvent::Stdout(b"hi".to_vec())).ok();
        io.control.send(ChannelCommand::Interrupt).ok();

        assert_eq!(io.events.recv().await, Some(ChannelEvent::Stdout(b"hi".to_vec())));
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Interrupt));
    }
}
