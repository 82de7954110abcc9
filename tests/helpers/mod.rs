//! Shared fixtures for integration tests.
//!
//! Every environment runs against the in-memory transport and a throwaway
//! storage directory, with key derivation costs low enough for tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use ratssh::crypto::KdfParams;
use ratssh::pool::PoolEvent;
use ratssh::ssh::{HostKey, MockConnector};
use ratssh::{
    AuthMethod, BlockUpdate, BlockUpdates, Client, Config, Credential, HostProfile, MasterPassword, ProfileId,
};

/// Host every fixture profile points at.
pub const HOST: &str = "db.internal:22";

/// Fingerprint the mock host presents.
pub const FINGERPRINT: &str = "SHA256:q3Jb7dQm0kqU5yV3nS1y8lOe6w0oE4xq2hT9mZr1cXo";

/// Master password of every fixture store.
pub const MASTER: &str = "correct horse battery staple";

/// Password the mock host accepts.
pub const PASSWORD: &str = "s3cret";

/// Cheap Argon2id parameters.
pub fn cheap_kdf() -> KdfParams {
    KdfParams::argon2id(8, 1, 1)
}

/// Key the mock host presents.
pub fn host_key() -> HostKey {
    HostKey::new("ssh-ed25519", FINGERPRINT)
}

/// Fixture profile id.
pub fn db() -> ProfileId {
    ProfileId::new("db").unwrap()
}

/// A client wired to a mock network with one saved password profile.
pub struct TestEnv {
    pub dir: TempDir,
    pub connector: MockConnector,
    pub keys: Arc<MasterPassword>,
    pub client: Client,
}

impl TestEnv {
    /// Environment with the host key already pinned.
    pub fn new(adjust: impl FnOnce(&mut Config)) -> Self {
        let env = Self::unpinned(adjust);
        env.client.known_hosts().pin(HOST, &host_key()).unwrap();
        env
    }

    /// Environment with nothing pinned.
    pub fn unpinned(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            config_path: dir.path().join(".ratsshrc"),
            storage_dir: dir.path().join("store"),
            kdf: cheap_kdf(),
            ..Config::default()
        };
        config.log_config.enabled = false;
        adjust(&mut config);

        let connector = MockConnector::new();
        connector.add_host(HOST, host_key());
        connector.set_password(HOST, PASSWORD);

        let keys = Arc::new(MasterPassword::new(MASTER));
        let client = Client::with_connector(config, keys.clone(), Arc::new(connector.clone())).unwrap();

        let profile = HostProfile::from_target(db(), "deploy@db.internal", AuthMethod::Password).unwrap();
        client
            .store()
            .upsert_profile(profile, Some(&Credential::password(PASSWORD)), keys.as_ref())
            .unwrap();

        Self {
            dir,
            connector,
            keys,
            client,
        }
    }
}

/// Receives updates until one matches, failing after a generous timeout.
pub async fn next_update(updates: &mut BlockUpdates, matches: impl Fn(&BlockUpdate) -> bool) -> BlockUpdate {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let update = updates.recv().await.expect("update stream ended");
            if matches(&update) {
                return update;
            }
        }
    })
    .await
    .expect("no matching update")
}

/// Receives pool events until one matches, failing after a generous timeout.
pub async fn next_event(events: &mut broadcast::Receiver<PoolEvent>, matches: impl Fn(&PoolEvent) -> bool) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.expect("pool event stream ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching pool event")
}
