//! The issuance engine. `AuthServer` holds a named reference to every
//! collaborator it needs and forwards to them explicitly.

pub mod augment;
mod db_certs;
mod host_certs;
pub mod jwt;
mod kube;
mod openssh;
mod tokens;
mod user_certs;

pub use augment::{AugmentOptions, AugmentedCerts, AuthContext};
pub use db_certs::{DatabaseCert, DatabaseCertRequest};
pub use host_certs::{HostCerts, HostCertsRequest};
pub use jwt::{JwtClaims, JwtRequest};
pub use kube::{KubeCsrRequest, KubeCsrResponse};
pub use openssh::OpenSshCertRequest;
pub use tokens::RegisterRequest;
pub use user_certs::{UserCerts, UserCertsRequest};

use crate::audit::{AuditEmitter, AuditEvent, LockCreated, LockDeleted};
use crate::backend::Backend;
use crate::error::{AuthorityError, AuthorityResult};
use crate::keystore::{KeyStore, SshSigner, TlsSigner};
use crate::locks::LockWatcher;
use crate::services::{
    LockService, LockStore, Presence, PresenceService, ProvisionService, Provisioner, Trust,
    TrustService,
};
use crate::types::{
    CertAuthID, CertAuthType, CertAuthority, KubernetesCluster, Lock, LockTarget, ProvisionToken,
    RemoteCluster,
};
use crate::utils::{unix_seconds, Clock};

use serde::Deserialize;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Certificates are valid from this long before they are issued so hosts
/// with a slightly slow clock accept them.
pub const CLOCK_SKEW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Deserialize)]
pub struct CertificateConfiguration {
    /// Used when a request does not ask for a TTL.
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    /// No certificate outlives this, whatever the roles allow.
    #[serde(default = "max_ttl")]
    pub max_ttl_seconds: u64,
}

fn default_ttl() -> u64 {
    12 * 60 * 60
}

fn max_ttl() -> u64 {
    30 * 60 * 60
}

impl Default for CertificateConfiguration {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl(),
            max_ttl_seconds: max_ttl(),
        }
    }
}

/// The storage capabilities the auth server depends on.
#[derive(Clone)]
pub struct Services {
    pub trust: Arc<dyn Trust>,
    pub locks: Arc<dyn LockStore>,
    pub provisioner: Arc<dyn Provisioner>,
    pub presence: Arc<dyn Presence>,
}

impl Services {
    /// Every capability implemented over one backend.
    pub fn backed_by(backend: Arc<dyn Backend>) -> Self {
        Self {
            trust: Arc::new(TrustService::new(backend.clone())),
            locks: Arc::new(LockService::new(backend.clone())),
            provisioner: Arc::new(ProvisionService::new(backend.clone())),
            presence: Arc::new(PresenceService::new(backend)),
        }
    }
}

pub struct AuthServerConfig {
    pub cluster_name: String,
    pub services: Services,
    pub key_store: KeyStore,
    pub lock_watcher: Arc<LockWatcher>,
    pub audit: AuditEmitter,
    pub clock: Arc<dyn Clock>,
    pub certificates: CertificateConfiguration,
    /// Tokens from configuration. They are never consumed.
    pub static_tokens: Vec<ProvisionToken>,
}

pub struct AuthServer {
    cluster_name: String,
    trust: Arc<dyn Trust>,
    lock_store: Arc<dyn LockStore>,
    provisioner: Arc<dyn Provisioner>,
    presence: Arc<dyn Presence>,
    key_store: KeyStore,
    lock_watcher: Arc<LockWatcher>,
    audit: AuditEmitter,
    clock: Arc<dyn Clock>,
    certificates: CertificateConfiguration,
    static_tokens: Vec<ProvisionToken>,
}

impl AuthServer {
    pub fn new(config: AuthServerConfig) -> Self {
        Self {
            cluster_name: config.cluster_name,
            trust: config.services.trust,
            lock_store: config.services.locks,
            provisioner: config.services.provisioner,
            presence: config.services.presence,
            key_store: config.key_store,
            lock_watcher: config.lock_watcher,
            audit: config.audit,
            clock: config.clock,
            certificates: config.certificates,
            static_tokens: config.static_tokens,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn lock_watcher(&self) -> &Arc<LockWatcher> {
        &self.lock_watcher
    }

    pub async fn get_cert_authority(
        &self,
        id: &CertAuthID,
        load_keys: bool,
    ) -> AuthorityResult<CertAuthority> {
        self.trust.get_cert_authority(id, load_keys).await
    }

    /// Trust the authority of another cluster.
    pub async fn upsert_trusted_cert_authority(&self, ca: &CertAuthority) -> AuthorityResult<()> {
        if ca.domain() == self.cluster_name {
            return Err(AuthorityError::bad_parameter(
                "the local cluster's authorities cannot be replaced by a trusted authority",
            ));
        }
        self.trust.upsert_trusted_cert_authority(ca).await
    }

    pub async fn upsert_lock(&self, mut lock: Lock) -> AuthorityResult<()> {
        if lock.created_at == 0 {
            lock.created_at = unix_seconds(self.clock.now());
        }
        self.lock_store.upsert_lock(&lock).await?;
        self.audit.emit(AuditEvent::LockCreated(LockCreated {
            name: lock.name.clone(),
            target: lock.target.to_string(),
            message: lock.message.clone(),
        }));
        Ok(())
    }

    pub async fn delete_lock(&self, name: &str) -> AuthorityResult<()> {
        self.lock_store.delete_lock(name).await?;
        self.audit.emit(AuditEvent::LockDeleted(LockDeleted {
            name: name.to_string(),
        }));
        Ok(())
    }

    pub async fn get_locks(&self) -> AuthorityResult<Vec<Lock>> {
        self.lock_store.get_locks().await
    }

    pub async fn upsert_kubernetes_cluster(&self, cluster: &KubernetesCluster) -> AuthorityResult<()> {
        self.presence.upsert_kubernetes_cluster(cluster).await
    }

    pub async fn upsert_remote_cluster(&self, cluster: &RemoteCluster) -> AuthorityResult<()> {
        self.presence.upsert_remote_cluster(cluster).await
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn check_locks(&self, targets: &[LockTarget]) -> AuthorityResult<()> {
        self.lock_watcher
            .check_lock_in_force(self.lock_watcher.mode(), targets)
    }

    /// The requested TTL, or the default, capped by the configured maximum.
    fn ttl(&self, requested: Duration) -> Duration {
        let ttl = if requested.is_zero() {
            Duration::from_secs(self.certificates.default_ttl_seconds)
        } else {
            requested
        };
        ttl.min(Duration::from_secs(self.certificates.max_ttl_seconds))
    }

    async fn local_authority(&self, ca_type: CertAuthType) -> AuthorityResult<CertAuthority> {
        self.trust
            .get_cert_authority(&CertAuthID::new(ca_type, &self.cluster_name), true)
            .await
    }

    /// Instances onboarded with keys nobody else can use sign with the
    /// additional trusted keys until a rotation makes them active.
    async fn ssh_signer(&self, ca: &CertAuthority) -> AuthorityResult<SshSigner> {
        match self.key_store.get_ssh_signer(ca).await {
            Err(e) if e.is_not_found() => self.key_store.get_additional_trusted_ssh_signer(ca).await,
            other => other,
        }
    }

    async fn tls_signer(&self, ca: &CertAuthority) -> AuthorityResult<TlsSigner> {
        match self.key_store.get_tls_cert_and_signer(ca).await {
            Err(e) if e.is_not_found() => {
                self.key_store
                    .get_additional_trusted_tls_cert_and_signer(ca)
                    .await
            }
            other => other,
        }
    }
}
