//! Host profile records.
//!
//! A profile names a remote endpoint, the account used on it, and how that
//! account authenticates. Secret material is never part of the profile; it
//! lives in a sealed credential record referenced by `credential_id`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Maximum length of a profile id.
const MAX_ID_LEN: usize = 64;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Joins host and port, bracketing IPv6 literals: `[::1]:22`.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Splits `host[:port]`, `[v6]:port`, or a bare IPv6 literal.
fn split_host_port(rest: &str) -> Result<(&str, u16), StoreError> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| StoreError::Invalid(format!("invalid port '{port}'")))
    };

    if let Some(bracketed) = rest.strip_prefix('[') {
        let Some((host, tail)) = bracketed.split_once(']') else {
            return Err(StoreError::Invalid(format!("unclosed '[' in '{rest}'")));
        };
        return match tail {
            "" => Ok((host, DEFAULT_PORT)),
            _ => match tail.strip_prefix(':') {
                Some(port) => Ok((host, parse_port(port)?)),
                None => Err(StoreError::Invalid(format!("unexpected '{tail}' after ']'"))),
            },
        };
    }

    match rest.split_once(':') {
        // More than one colon and no brackets: an IPv6 literal without a port.
        Some((_, tail)) if tail.contains(':') => Ok((rest, DEFAULT_PORT)),
        Some((host, port)) => Ok((host, parse_port(port)?)),
        None => Ok((rest, DEFAULT_PORT)),
    }
}

/// Validated profile identifier.
///
/// Restricted to `[A-Za-z0-9._-]` so it can name a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    /// Validates and wraps a profile id.
    ///
    /// # Errors
    /// Returns [`StoreError::Invalid`] for empty, overlong, or unsafe ids.
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(StoreError::Invalid(format!(
                "profile id must be 1-{MAX_ID_LEN} characters"
            )));
        }
        if id.starts_with('.') {
            return Err(StoreError::Invalid("profile id must not start with '.'".to_string()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(StoreError::Invalid(format!(
                "profile id '{id}' contains characters outside [A-Za-z0-9._-]"
            )));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProfileId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a profile authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password from the credential store.
    #[default]
    Password,
    /// Private key (and optional passphrase) from the credential store.
    PrivateKey,
    /// Local SSH agent; nothing is stored.
    Agent,
}

impl AuthMethod {
    /// Returns the display name for this method.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PrivateKey => "private_key",
            Self::Agent => "agent",
        }
    }

    /// Returns true if this method needs a stored credential.
    #[must_use]
    pub fn needs_secret(&self) -> bool {
        !matches!(self, Self::Agent)
    }
}

/// A saved remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    /// Unique identifier.
    pub id: ProfileId,
    /// User-friendly name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Remote account.
    pub username: String,
    /// Authentication method.
    #[serde(default)]
    pub auth: AuthMethod,
    /// Sealed credential record backing this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<ProfileId>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl HostProfile {
    /// Creates a profile on the default port.
    ///
    /// # Panics
    /// Panics if `host` or `username` is empty.
    #[must_use]
    pub fn new(id: ProfileId, host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        let host = host.into();
        let username = username.into();
        assert!(!host.is_empty(), "host must not be empty");
        assert!(!username.is_empty(), "username must not be empty");

        Self {
            id,
            display_name: None,
            host,
            port: DEFAULT_PORT,
            username,
            auth,
            credential_id: None,
        }
    }

    /// Sets the port.
    ///
    /// # Panics
    /// Panics if `port` is zero.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        assert!(port > 0, "port must be greater than 0");
        self.port = port;
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Parses `user@host[:port]` into a profile. IPv6 hosts are written
    /// `user@[addr]:port`, or bare without a port.
    ///
    /// # Errors
    /// Returns [`StoreError::Invalid`] if the target is malformed.
    pub fn from_target(id: ProfileId, target: &str, auth: AuthMethod) -> Result<Self, StoreError> {
        let Some((user, rest)) = target.split_once('@') else {
            return Err(StoreError::Invalid(format!(
                "target '{target}' must look like user@host[:port]"
            )));
        };

        let (host, port) = split_host_port(rest)?;

        if user.is_empty() || host.is_empty() || port == 0 {
            return Err(StoreError::Invalid(format!(
                "target '{target}' must look like user@host[:port]"
            )));
        }

        Ok(Self::new(id, host, user, auth).with_port(port))
    }

    /// Returns the display name or the host.
    #[must_use]
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.host)
    }

    /// Returns the pooling identity `user@host:port`.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.host_port())
    }

    /// Returns the known-hosts key `host:port`.
    #[must_use]
    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Checks field invariants before persisting.
    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.host.is_empty() || self.username.is_empty() {
            return Err(StoreError::Invalid("host and username are required".to_string()));
        }
        if self.port == 0 {
            return Err(StoreError::Invalid("port must be greater than 0".to_string()));
        }
        if self.host.chars().any(|c| c.is_whitespace() || c == '@') {
            return Err(StoreError::Invalid(format!("invalid host '{}'", self.host)));
        }
        Ok(())
    }
}
