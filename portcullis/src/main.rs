#[macro_use]
extern crate log;

use portcullis::audit::{start_audit_thread, AuditEmitter};
use portcullis::auth::{AuthServer, AuthServerConfig, Services};
use portcullis::authority::CAManager;
use portcullis::config::{self, ConfigurationError};
use portcullis::locks::LockWatcher;
use portcullis::types::CertAuthType;
use portcullis::utils::system_clock;

use tokio_util::sync::CancellationToken;

use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let clock = system_clock();
    let settings = match config::configure(clock.clone()).await {
        Ok(settings) => settings,
        Err(ConfigurationError::ValidateOnly) => {
            println!("Configuration is valid");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let (audit, audit_receiver) = AuditEmitter::channel(&settings.cluster_name, clock.clone());
    let handle = tokio::runtime::Handle::current();
    let audit_configuration = settings.audit;
    let identifier = settings.host_uuid.clone();
    std::thread::spawn(move || {
        start_audit_thread(audit_configuration, audit_receiver, identifier, handle);
    });

    let services = Services::backed_by(settings.backend.clone());
    let ca_manager = Arc::new(CAManager::new(
        &settings.cluster_name,
        services.trust.clone(),
        settings.key_store.clone(),
        settings.backend.clone(),
        clock.clone(),
        audit.clone(),
        settings.rotation,
        settings.migrations,
    ));
    ca_manager.init().await?;

    println!("Starting Portcullis for cluster: {}", settings.cluster_name);
    for ca_type in [CertAuthType::User, CertAuthType::Host] {
        let ca = ca_manager.get_local_authority(ca_type).await?;
        for key in ca.trusted_ssh_public_keys()? {
            info!("{} CA Pubkey: {}", ca_type, key);
            println!("{} CA Fingerprint (SHA256): {}", ca_type, key.fingerprint().hash);
        }
    }

    let lock_watcher = Arc::new(LockWatcher::new(
        settings.backend.clone(),
        settings.locks,
        clock.clone(),
    ));
    let _auth_server = Arc::new(AuthServer::new(AuthServerConfig {
        cluster_name: settings.cluster_name.clone(),
        services,
        key_store: settings.key_store,
        lock_watcher: lock_watcher.clone(),
        audit,
        clock,
        certificates: settings.certificates,
        static_tokens: settings.static_tokens,
    }));

    let shutdown = CancellationToken::new();
    let rotation = ca_manager.clone().spawn_auto_rotation(shutdown.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();
    lock_watcher.close().await;
    rotation.await?;
    Ok(())
}
