//! ratssh
//!
//! A secure remote-shell client runtime: pooled, authenticated, supervised
//! SSH connections, command sessions with tracked blocks of output, and an
//! encrypted local credential store.
//!
//! # Architecture
//!
//! - **Crypto Module**: Argon2id key derivation and XChaCha20-Poly1305 sealing
//! - **Store Module**: Host profiles and sealed credentials on disk
//! - **SSH Module**: Transport seam, libssh2 backend, pinned host keys
//! - **Pool Module**: Connection lifecycle, multiplexing, keep-alive, recovery
//! - **Session Module**: Sessions, blocks, and ordered update streams
//! - **Executor Module**: Per-command channels, cancellation, classification
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ratssh::{Client, Config, EnvKeySource, ProfileId, SessionOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::open(Config::load()?, Arc::new(EnvKeySource::default()))?;
//! let profile = ProfileId::new("prod")?;
//! let session = client.create_session(&profile, &SessionOptions::default()).await?;
//! let block = client.submit_command(session, "uptime").await?;
//! let done = client.sessions().wait_for_block(session, block).await?;
//! println!("{}", done.output_text());
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::unnested_or_patterns)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pool;
pub mod session;
pub mod ssh;
pub mod store;

// Re-export main types
pub use client::Client;
pub use config::Config;
pub use error::{BlockError, ErrorKind};
pub use executor::Classification;
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolEvent};
pub use session::{
    Block, BlockId, BlockStatus, BlockUpdate, BlockUpdates, SessionError, SessionId, SessionManager,
    SessionOptions, SessionState, UpdateEvent,
};
pub use store::{
    AuthMethod, Credential, CredentialStore, EnvKeySource, HostProfile, KeySource, MasterPassword, ProfileId,
    StoreError,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
