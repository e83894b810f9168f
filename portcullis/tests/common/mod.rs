#![allow(dead_code)]

use portcullis::audit::{AuditEmitter, AuditRecord};
use portcullis::auth::{AuthServer, AuthServerConfig, CertificateConfiguration, Services};
use portcullis::authority::{CAManager, MigrationConfiguration, RotationConfiguration};
use portcullis::backend::{Backend, MemoryBackend};
use portcullis::keystore::KeyStore;
use portcullis::locks::{LockWatcher, LockWatcherConfiguration};
use portcullis::types::{CertAuthID, CertAuthType, ProvisionToken, Role, RoleSet};
use portcullis::utils::system_clock;

use crossbeam_channel::Receiver;
use sshcerts::PublicKey;

use std::sync::Arc;

pub struct Cluster {
    pub backend: Arc<dyn Backend>,
    pub manager: Arc<CAManager>,
    pub server: AuthServer,
    pub audit: Receiver<AuditRecord>,
}

pub async fn cluster(name: &str, static_tokens: Vec<ProvisionToken>) -> Cluster {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let clock = system_clock();
    let (audit, receiver) = AuditEmitter::channel(name, clock.clone());
    let services = Services::backed_by(backend.clone());
    let manager = Arc::new(CAManager::new(
        name,
        services.trust.clone(),
        KeyStore::software(),
        backend.clone(),
        clock.clone(),
        audit.clone(),
        RotationConfiguration::default(),
        MigrationConfiguration::default(),
    ));
    manager.init().await.unwrap();

    let lock_watcher = Arc::new(LockWatcher::new(
        backend.clone(),
        LockWatcherConfiguration::default(),
        clock.clone(),
    ));
    lock_watcher.wait_for_sync().await;
    let server = AuthServer::new(AuthServerConfig {
        cluster_name: name.to_string(),
        services,
        key_store: KeyStore::software(),
        lock_watcher,
        audit,
        clock,
        certificates: CertificateConfiguration::default(),
        static_tokens,
    });
    Cluster {
        backend,
        manager,
        server,
        audit: receiver,
    }
}

pub fn roles(max_ttl: u64, logins: &[&str]) -> Arc<RoleSet> {
    let mut role = Role::new("dev");
    role.options.max_session_ttl_seconds = max_ttl;
    role.allow.logins = logins.iter().map(|l| l.to_string()).collect();
    role.allow.kubernetes_groups = vec!["viewers".to_string()];
    Arc::new(RoleSet::new(vec![role]))
}

pub async fn public_key() -> String {
    KeyStore::software()
        .new_ssh_key_pair()
        .await
        .unwrap()
        .public_key
}

pub async fn trusted_ssh(server: &AuthServer, ca_type: CertAuthType) -> Vec<PublicKey> {
    server
        .get_cert_authority(&CertAuthID::new(ca_type, server.cluster_name()), false)
        .await
        .unwrap()
        .trusted_ssh_public_keys()
        .unwrap()
}

pub async fn trusted_tls(server: &AuthServer, ca_type: CertAuthType) -> Vec<String> {
    server
        .get_cert_authority(&CertAuthID::new(ca_type, server.cluster_name()), false)
        .await
        .unwrap()
        .trusted_tls_certs()
}
