mod common;

use common::{cluster, public_key, roles, trusted_ssh, trusted_tls};

use portcullis::audit::AuditEmitter;
use portcullis::authority::{CAManager, MigrationConfiguration, RotateRequest, RotationConfiguration};
use portcullis::auth::{AuthServer, AuthServerConfig, CertificateConfiguration, Services, UserCerts, UserCertsRequest};
use portcullis::backend::{Backend, MemoryBackend};
use portcullis::identity::{ssh, tls};
use portcullis::keystore::{KeyStore, KeyStoreConfiguration};
use portcullis::locks::{LockWatcher, LockWatcherConfiguration};
use portcullis::services::{Trust, TrustService};
use portcullis::types::{CertAuthID, CertAuthType, CertAuthority, KeyKind, RotationPhase};
use portcullis::utils::system_clock;

use std::sync::Arc;

async fn alice_certs(server: &AuthServer) -> UserCerts {
    server
        .generate_user_certs(UserCertsRequest::new("alice", roles(3600, &["alice"]), public_key().await))
        .await
        .unwrap()
}

async fn verifies(server: &AuthServer, certs: &UserCerts) -> bool {
    let ssh_ok = ssh::decode_trusted(&certs.ssh, &trusted_ssh(server, CertAuthType::User).await).is_ok();
    let tls_ok = tls::decode_trusted(&certs.tls, &trusted_tls(server, CertAuthType::User).await).is_ok();
    assert_eq!(ssh_ok, tls_ok);
    ssh_ok
}

#[tokio::test]
async fn certificates_survive_until_the_rotation_completes() {
    let test = cluster("root.local", vec![]).await;
    let before = alice_certs(&test.server).await;

    let rotate = |phase| RotateRequest::manual(CertAuthType::User, phase);
    test.manager.rotate(rotate(RotationPhase::Init)).await.unwrap();
    assert!(verifies(&test.server, &before).await);

    test.manager
        .rotate(rotate(RotationPhase::UpdateClients))
        .await
        .unwrap();
    let during = alice_certs(&test.server).await;
    assert!(verifies(&test.server, &before).await);
    assert!(verifies(&test.server, &during).await);
    assert_ne!(
        ssh::decode_trusted(&before.ssh, &trusted_ssh(&test.server, CertAuthType::User).await)
            .unwrap()
            .cert
            .signature_key
            .fingerprint()
            .hash,
        ssh::decode_trusted(&during.ssh, &trusted_ssh(&test.server, CertAuthType::User).await)
            .unwrap()
            .cert
            .signature_key
            .fingerprint()
            .hash,
    );

    test.manager
        .rotate(rotate(RotationPhase::UpdateServers))
        .await
        .unwrap();
    test.manager.rotate(rotate(RotationPhase::Standby)).await.unwrap();
    assert!(!verifies(&test.server, &before).await);
    assert!(verifies(&test.server, &during).await);
}

#[tokio::test]
async fn keyring_instances_join_an_existing_cluster() {
    let test = cluster("root.local", vec![]).await;

    let dir = tempfile::tempdir().unwrap();
    let keyring = KeyStoreConfiguration::keyring(dir.path().to_str().unwrap())
        .into_key_store("auth-2")
        .await
        .unwrap();
    let clock = system_clock();
    let (audit, _receiver) = AuditEmitter::channel("root.local", clock.clone());
    let services = Services::backed_by(test.backend.clone());
    let second = Arc::new(CAManager::new(
        "root.local",
        services.trust.clone(),
        keyring.clone(),
        test.backend.clone(),
        clock.clone(),
        audit.clone(),
        RotationConfiguration::default(),
        MigrationConfiguration::default(),
    ));
    second.init().await.unwrap();

    // Until a rotation, the new instance signs with its additional keys and
    // everyone still trusts what it issues
    let lock_watcher = Arc::new(LockWatcher::new(
        test.backend.clone(),
        LockWatcherConfiguration::default(),
        clock.clone(),
    ));
    lock_watcher.wait_for_sync().await;
    let server = AuthServer::new(AuthServerConfig {
        cluster_name: "root.local".to_string(),
        services,
        key_store: keyring,
        lock_watcher,
        audit,
        clock,
        certificates: CertificateConfiguration::default(),
        static_tokens: vec![],
    });
    let certs = alice_certs(&server).await;
    assert!(verifies(&test.server, &certs).await);

    // The keys persist in the data directory
    assert!(std::fs::read_dir(dir.path().join("keyring"))
        .unwrap()
        .next()
        .is_some());
}

#[tokio::test]
async fn legacy_clusters_get_their_new_authorities_from_the_host_authority() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let trust = TrustService::new(backend.clone());
    let key_store = KeyStore::software();
    for ca_type in [CertAuthType::User, CertAuthType::Host, CertAuthType::Jwt] {
        let keys = key_store
            .new_key_set(ca_type.required_kinds(), "legacy.local")
            .await
            .unwrap();
        trust
            .create_cert_authority(&CertAuthority::new(CertAuthID::new(ca_type, "legacy.local"), keys))
            .await
            .unwrap();
    }

    let (audit, _receiver) = AuditEmitter::channel("legacy.local", system_clock());
    CAManager::new(
        "legacy.local",
        Arc::new(TrustService::new(backend.clone())),
        key_store,
        backend,
        system_clock(),
        audit,
        RotationConfiguration::default(),
        MigrationConfiguration::default(),
    )
    .init()
    .await
    .unwrap();

    let host = trust
        .get_cert_authority(&CertAuthID::new(CertAuthType::Host, "legacy.local"), true)
        .await
        .unwrap();
    let database = trust
        .get_cert_authority(&CertAuthID::new(CertAuthType::Database, "legacy.local"), true)
        .await
        .unwrap();
    let openssh = trust
        .get_cert_authority(&CertAuthID::new(CertAuthType::OpenSsh, "legacy.local"), true)
        .await
        .unwrap();
    assert_eq!(database.active_keys.tls, host.active_keys.tls);
    assert!(!database.active_keys.has_kind(KeyKind::Ssh));
    assert_eq!(openssh.active_keys.ssh, host.active_keys.ssh);
}

#[tokio::test]
async fn disabled_migrations_generate_fresh_authorities() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let trust = TrustService::new(backend.clone());
    let key_store = KeyStore::software();
    let keys = key_store
        .new_key_set(CertAuthType::Host.required_kinds(), "legacy.local")
        .await
        .unwrap();
    trust
        .create_cert_authority(&CertAuthority::new(
            CertAuthID::new(CertAuthType::Host, "legacy.local"),
            keys,
        ))
        .await
        .unwrap();

    let (audit, _receiver) = AuditEmitter::channel("legacy.local", system_clock());
    CAManager::new(
        "legacy.local",
        Arc::new(TrustService::new(backend.clone())),
        key_store,
        backend,
        system_clock(),
        audit,
        RotationConfiguration::default(),
        MigrationConfiguration {
            disabled: vec!["db-ca-from-host-ca".to_string()],
        },
    )
    .init()
    .await
    .unwrap();

    let host = trust
        .get_cert_authority(&CertAuthID::new(CertAuthType::Host, "legacy.local"), true)
        .await
        .unwrap();
    let database = trust
        .get_cert_authority(&CertAuthID::new(CertAuthType::Database, "legacy.local"), true)
        .await
        .unwrap();
    assert_ne!(database.active_keys.tls, host.active_keys.tls);
}
