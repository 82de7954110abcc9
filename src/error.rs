//! Stable error taxonomy shared by every subsystem.
//!
//! Each module owns its own `thiserror` enum; all of them collapse onto
//! [`ErrorKind`] so callers can branch on a stable category without
//! matching on module-specific variants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials rejected by the server. Never retried.
    Auth,
    /// Host key unknown or different from the pinned one.
    HostKey,
    /// Transient transport failure.
    Network,
    /// An operation exceeded its deadline.
    Timeout,
    /// No connection slot became available in time.
    PoolExhausted,
    /// Ciphertext or tag failed verification.
    Integrity,
    /// Key derivation parameters missing or corrupted.
    Key,
    /// Operation not valid in the current lifecycle state.
    InvalidState,
    /// The underlying connection was lost for good.
    ConnectionLost,
    /// Requested record does not exist.
    NotFound,
    /// The unlock key is not available.
    AuthRequired,
    /// Local persistence failure (I/O, parse).
    Storage,
    /// Work was cancelled on request.
    Cancelled,
    /// The owning component has shut down.
    Shutdown,
}

impl ErrorKind {
    /// Returns the stable identifier for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::HostKey => "host_key",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::PoolExhausted => "pool_exhausted",
            Self::Integrity => "integrity",
            Self::Key => "key",
            Self::InvalidState => "invalid_state",
            Self::ConnectionLost => "connection_lost",
            Self::NotFound => "not_found",
            Self::AuthRequired => "auth_required",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }

    /// Returns true for failures that a bounded internal retry may fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure attached to a block or a closed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockError {
    /// Stable category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub detail: String,
}

impl BlockError {
    /// Creates a new block error.
    #[must_use]
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Connection lost with the given detail.
    #[must_use]
    pub fn connection_lost(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionLost, detail)
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for BlockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::Auth.is_transient());
        assert!(!ErrorKind::Integrity.is_transient());
        assert!(!ErrorKind::HostKey.is_transient());
    }

    #[test]
    fn test_block_error_display() {
        let err = BlockError::connection_lost("grace window expired");
        assert_eq!(err.to_string(), "connection_lost: grace window expired");
    }
}
