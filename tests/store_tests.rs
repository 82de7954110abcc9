//! Integration tests for profiles and sealed credentials.
//!
//! These tests verify the store through the client facade:
//! - Profiles persist across reopen
//! - Secrets never hit disk in plaintext
//! - Unlock failures surface as stable error kinds
//! - Removing a profile removes its credential and host key pin

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

use std::fs;
use std::sync::Arc;

use helpers::{HOST, MASTER, PASSWORD, TestEnv, cheap_kdf, db, host_key};
use ratssh::ssh::{KnownHosts, MockConnector};
use ratssh::{
    AuthMethod, Client, Credential, CredentialStore, ErrorKind, HostProfile, MasterPassword, ProfileId, StoreError,
};

// ============================================================================
// Profile Tests
// ============================================================================

mod profile_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_profiles_survive_reopen() {
        let env = TestEnv::new(|_| {});
        let profile = HostProfile::from_target(ProfileId::new("web").unwrap(), "ops@web.internal:2222", AuthMethod::Agent)
            .unwrap()
            .with_display_name("Web frontend");
        env.client.upsert_profile(profile, None).await.unwrap();

        let reopened = CredentialStore::open(env.dir.path().join("store"), cheap_kdf()).unwrap();
        let ids: Vec<String> = reopened.list_profiles().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["db".to_string(), "web".to_string()]);

        let web = reopened.profile(&ProfileId::new("web").unwrap()).unwrap();
        assert_eq!(web.port, 2222);
        assert_eq!(web.display(), "Web frontend");
        assert_eq!(web.credential_id, None);
    }

    #[tokio::test]
    async fn test_password_profile_requires_secret() {
        let env = TestEnv::new(|_| {});
        let profile = HostProfile::from_target(ProfileId::new("new").unwrap(), "a@b", AuthMethod::Password).unwrap();
        let err = env.client.upsert_profile(profile, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_update_without_secret_keeps_credential() {
        let env = TestEnv::new(|_| {});
        let existing = env.client.store().profile(&db()).unwrap();
        let renamed = existing.clone().with_display_name("Primary DB");
        let saved = env.client.upsert_profile(renamed, None).await.unwrap();

        assert_eq!(saved.credential_id, existing.credential_id);
        let credential = env.client.store().credential_for(&saved, env.keys.as_ref()).unwrap();
        assert!(matches!(credential, Credential::Password { ref password } if password.as_str() == PASSWORD));
    }

    #[tokio::test]
    async fn test_agent_profile_stores_nothing() {
        let env = TestEnv::new(|_| {});
        let profile = HostProfile::from_target(ProfileId::new("agent").unwrap(), "me@jump", AuthMethod::Agent).unwrap();
        env.client.upsert_profile(profile.clone(), None).await.unwrap();

        let metas = env.client.store().list().unwrap();
        assert!(metas.iter().all(|m| m.profile_id.as_str() != "agent"));
        let credential = env.client.store().credential_for(&profile, env.keys.as_ref()).unwrap();
        assert!(matches!(credential, Credential::Agent));
    }
}

// ============================================================================
// Credential Tests
// ============================================================================

mod credential_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_secret_is_sealed_on_disk() {
        let env = TestEnv::new(|_| {});
        let record = fs::read_to_string(env.dir.path().join("store/credentials/db.toml")).unwrap();
        assert!(!record.contains(PASSWORD));
        assert!(!record.contains(MASTER));
        assert!(record.contains("argon2id"));

        let profiles = fs::read_to_string(env.dir.path().join("store/profiles.toml")).unwrap();
        assert!(!profiles.contains(PASSWORD));
    }

    #[tokio::test]
    async fn test_list_returns_metadata_only() {
        let env = TestEnv::new(|_| {});
        let metas = env.client.store().list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].profile_id, db());
        assert!(metas[0].kdf.is_some());
    }

    #[tokio::test]
    async fn test_wrong_master_password_is_integrity_error() {
        let env = TestEnv::new(|_| {});
        let profile = env.client.store().profile(&db()).unwrap();
        let wrong = MasterPassword::new("not the password");
        let err = env.client.store().credential_for(&profile, &wrong).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_locked_source_is_auth_required() {
        let env = TestEnv::new(|_| {});
        env.keys.lock();
        let profile = env.client.store().profile(&db()).unwrap();
        let err = env.client.store().credential_for(&profile, env.keys.as_ref()).unwrap_err();
        assert!(matches!(err, StoreError::AuthRequired));
    }

    #[tokio::test]
    async fn test_tampered_record_never_deleted() {
        let env = TestEnv::new(|_| {});
        let path = env.dir.path().join("store/credentials/db.toml");
        let record = fs::read_to_string(&path).unwrap();
        fs::write(&path, record.replace("ciphertext = \"", "ciphertext = \"AAAA")).unwrap();

        let profile = env.client.store().profile(&db()).unwrap();
        let err = env.client.store().credential_for(&profile, env.keys.as_ref()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(path.exists());
        assert_eq!(env.client.store().list().unwrap().len(), 1);
    }
}

// ============================================================================
// Removal Tests
// ============================================================================

mod removal_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_remove_profile_drops_credential_and_pin() {
        let env = TestEnv::new(|_| {});
        assert!(env.client.known_hosts().get(HOST).is_some());

        env.client.remove_profile(&db()).unwrap();
        assert!(env.client.list_profiles().is_empty());
        assert!(!env.dir.path().join("store/credentials/db.toml").exists());
        assert!(env.client.known_hosts().get(HOST).is_none());

        let reloaded = KnownHosts::load(env.dir.path().join("store/known_hosts.toml")).unwrap();
        assert!(reloaded.get(HOST).is_none());
    }

    #[tokio::test]
    async fn test_pin_kept_while_another_profile_uses_host() {
        let env = TestEnv::new(|_| {});
        let other = HostProfile::from_target(ProfileId::new("db-ro").unwrap(), "reader@db.internal", AuthMethod::Agent)
            .unwrap();
        env.client.upsert_profile(other, None).await.unwrap();

        env.client.remove_profile(&db()).unwrap();
        assert_eq!(env.client.known_hosts().get(HOST).map(|p| p.fingerprint), Some(host_key().fingerprint));
    }

    #[tokio::test]
    async fn test_remove_unknown_profile_is_not_found() {
        let env = TestEnv::new(|_| {});
        let err = env.client.remove_profile(&ProfileId::new("ghost").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_pins_persist_across_clients() {
        let env = TestEnv::new(|_| {});
        let config = env.client.config().clone();
        let reopened = Client::with_connector(config, Arc::new(MasterPassword::new(MASTER)), Arc::new(MockConnector::new()))
            .unwrap();
        assert_eq!(reopened.known_hosts().get(HOST).map(|p| p.fingerprint), Some(host_key().fingerprint));
        assert_eq!(reopened.list_profiles().len(), 1);
    }
}
