//! Owns the cluster's certificate authorities: creates them on first start,
//! makes sure this instance can sign with them on every start, runs the
//! one time migrations and drives rotations.

pub mod migrations;
pub mod rotation;

pub use rotation::RotateRequest;

use crate::audit::{AuditEmitter, AuditEvent, CertAuthorityCreated, CertAuthorityKeysAdded};
use crate::backend::Backend;
use crate::error::{AuthorityError, AuthorityResult};
use crate::keystore::KeyStore;
use crate::services::Trust;
use crate::types::{CertAuthID, CertAuthType, CertAuthority};
use crate::utils::Clock;

use serde::Deserialize;

use std::sync::Arc;
use std::time::Duration;

/// How many times onboarding retries a lost compare-and-swap before giving
/// up.
const ONBOARDING_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, Deserialize)]
pub struct RotationConfiguration {
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
}

fn default_grace_period() -> u64 {
    30 * 60 * 60
}

fn default_check_interval() -> u64 {
    60
}

impl Default for RotationConfiguration {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
            check_interval_seconds: default_check_interval(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MigrationConfiguration {
    /// Names of migrations that must not run.
    #[serde(default)]
    pub disabled: Vec<String>,
}

pub struct CAManager {
    cluster_name: String,
    trust: Arc<dyn Trust>,
    key_store: KeyStore,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    audit: AuditEmitter,
    rotation: RotationConfiguration,
    migrations: MigrationConfiguration,
}

impl CAManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster_name: &str,
        trust: Arc<dyn Trust>,
        key_store: KeyStore,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        audit: AuditEmitter,
        rotation: RotationConfiguration,
        migrations: MigrationConfiguration,
    ) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            trust,
            key_store,
            backend,
            clock,
            audit,
            rotation,
            migrations,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Bring every local authority into a state this instance can sign
    /// with. Any error returned here must abort startup.
    pub async fn init(&self) -> AuthorityResult<()> {
        migrations::run_migrations(self.trust.as_ref(), &self.cluster_name, &self.migrations.disabled)
            .await
            .map_err(|e| AuthorityError::Fatal(e.to_string()))?;

        for ca_type in CertAuthType::ALL {
            self.ensure_local_authority(ca_type).await.map_err(|e| match e {
                AuthorityError::Fatal(_) => e,
                other => AuthorityError::Fatal(format!(
                    "could not initialize {} authority: {}",
                    ca_type, other
                )),
            })?;
        }
        info!("Certificate authorities for [{}] are ready", self.cluster_name);
        Ok(())
    }

    async fn ensure_local_authority(&self, ca_type: CertAuthType) -> AuthorityResult<()> {
        let id = CertAuthID::new(ca_type, &self.cluster_name);
        let ca = match self.trust.get_cert_authority(&id, true).await {
            Ok(ca) => ca,
            Err(e) if e.is_not_found() => match self.create_authority(&id).await? {
                Some(created) => created,
                // Another instance created it first, use theirs
                None => self.trust.get_cert_authority(&id, true).await?,
            },
            Err(e) => return Err(e),
        };

        if let Err(e) = ca.check_local() {
            return Err(AuthorityError::Fatal(format!(
                "{} cannot sign for the local cluster: {}",
                id, e
            )));
        }

        if self.key_store.has_usable_active_keys(&ca) {
            return Ok(());
        }
        if self.key_store.has_usable_additional_keys(&ca) {
            warn!(
                "This instance can only sign with additional trusted keys of {}. A rotation is required to sign with them for the whole cluster.",
                id
            );
            return Ok(());
        }

        let ca = self.add_local_additional_keys(&id).await?;
        if !self.key_store.has_usable_active_keys(&ca)
            && !self.key_store.has_usable_additional_keys(&ca)
        {
            return Err(AuthorityError::Fatal(format!(
                "this instance has no usable keys for {}",
                id
            )));
        }
        Ok(())
    }

    /// Create a self signed authority with one active key of every kind its
    /// type needs. Returns None if another writer created it first.
    async fn create_authority(&self, id: &CertAuthID) -> AuthorityResult<Option<CertAuthority>> {
        let keys = self
            .key_store
            .new_key_set(id.ca_type.required_kinds(), &self.cluster_name)
            .await?;
        let ca = CertAuthority::new(id.clone(), keys);
        match self.trust.create_cert_authority(&ca).await {
            Ok(()) => {
                info!("Created {} using the [{}] key store", id, self.key_store.backend_name());
                self.audit.emit(AuditEvent::CertAuthorityCreated(CertAuthorityCreated {
                    ca_type: id.ca_type.to_string(),
                    domain: id.domain.clone(),
                }));
                Ok(Some(ca))
            }
            Err(e) if e.is_already_exists() => {
                debug!("{} was created concurrently", id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Generate keys this instance can use and add them to the authority as
    /// additional trusted keys. The active keys are left alone.
    async fn add_local_additional_keys(&self, id: &CertAuthID) -> AuthorityResult<CertAuthority> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = self.trust.get_cert_authority(id, true).await?;
            if self.key_store.has_usable_additional_keys(&existing) {
                return Ok(existing);
            }

            let keys = self
                .key_store
                .new_key_set(id.ca_type.required_kinds(), &self.cluster_name)
                .await?;
            let mut updated = existing.clone();
            updated.additional_trusted_keys.extend(keys);

            match self.trust.compare_and_swap_cert_authority(&updated, &existing).await {
                Ok(()) => {
                    warn!(
                        "Added [{}] keys to {} as additional trusted keys. A rotation is required before they are used to sign for the whole cluster.",
                        self.key_store.backend_name(),
                        id
                    );
                    self.audit.emit(AuditEvent::CertAuthorityKeysAdded(CertAuthorityKeysAdded {
                        ca_type: id.ca_type.to_string(),
                        domain: id.domain.clone(),
                        key_store: self.key_store.backend_name().to_string(),
                    }));
                    return Ok(updated);
                }
                Err(e) if e.is_compare_failed() && attempt < ONBOARDING_ATTEMPTS => {
                    debug!("{} changed while adding keys, retrying", id);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The local authority of the given type with its keys.
    pub async fn get_local_authority(&self, ca_type: CertAuthType) -> AuthorityResult<CertAuthority> {
        self.trust
            .get_cert_authority(&CertAuthID::new(ca_type, &self.cluster_name), true)
            .await
    }
}
