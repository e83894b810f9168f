//! One time data migrations run before the authorities are initialized.
//! Every migration checks whether it still has work to do, so running them
//! on each start is safe.

use crate::error::{AuthorityError, AuthorityResult};
use crate::services::Trust;
use crate::types::{CAKeySet, CertAuthID, CertAuthType, CertAuthority};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Migration {
    /// Clusters created before the database authority existed signed
    /// database certificates with the host authority's TLS keys.
    DatabaseCAFromHostCA,
    /// Agentless nodes trust the host authority's SSH keys until they are
    /// given their own authority.
    OpenSshCAFromHostCA,
}

impl Migration {
    pub const ALL: [Migration; 2] = [Migration::DatabaseCAFromHostCA, Migration::OpenSshCAFromHostCA];

    pub fn name(&self) -> &'static str {
        match self {
            Migration::DatabaseCAFromHostCA => "db-ca-from-host-ca",
            Migration::OpenSshCAFromHostCA => "openssh-ca-from-host-ca",
        }
    }

    fn target(&self) -> CertAuthType {
        match self {
            Migration::DatabaseCAFromHostCA => CertAuthType::Database,
            Migration::OpenSshCAFromHostCA => CertAuthType::OpenSsh,
        }
    }

    /// The part of the host authority's keys the new authority inherits.
    fn inherited(&self, keys: &CAKeySet) -> CAKeySet {
        match self {
            Migration::DatabaseCAFromHostCA => CAKeySet {
                tls: keys.tls.clone(),
                ..Default::default()
            },
            Migration::OpenSshCAFromHostCA => CAKeySet {
                ssh: keys.ssh.clone(),
                ..Default::default()
            },
        }
    }

    /// Returns whether anything was migrated.
    async fn run(&self, trust: &dyn Trust, cluster_name: &str) -> AuthorityResult<bool> {
        let target = CertAuthID::new(self.target(), cluster_name);
        match trust.get_cert_authority(&target, false).await {
            Ok(_) => return Ok(false),
            Err(e) if e.is_not_found() => (),
            Err(e) => return Err(e),
        }

        let host_id = CertAuthID::new(CertAuthType::Host, cluster_name);
        let host = match trust.get_cert_authority(&host_id, true).await {
            Ok(host) => host,
            // A new cluster, the authority will be generated from scratch
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let active_keys = self.inherited(&host.active_keys);
        if active_keys.is_empty() {
            return Err(AuthorityError::bad_parameter(format!(
                "{} has no keys to copy into {}",
                host_id, target
            )));
        }
        let mut ca = CertAuthority::new(target.clone(), active_keys);
        ca.additional_trusted_keys = self.inherited(&host.additional_trusted_keys);

        match trust.create_cert_authority(&ca).await {
            Ok(()) => Ok(true),
            // Another instance migrated first
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Run every migration not named in `disabled`. The first failure is
/// returned wrapped with the migration's name.
pub async fn run_migrations(
    trust: &dyn Trust,
    cluster_name: &str,
    disabled: &[String],
) -> AuthorityResult<()> {
    for migration in Migration::ALL {
        let name = migration.name();
        if disabled.iter().any(|d| d == name) {
            info!("Migration [{}] is disabled", name);
            continue;
        }
        debug!("Starting migration [{}]", name);
        let migrated = migration
            .run(trust, cluster_name)
            .await
            .map_err(|e| e.wrap(&format!("migration {} failed", name)))?;
        if migrated {
            info!("Migration [{}] completed", name);
        } else {
            debug!("Migration [{}] had nothing to do", name);
        }
    }
    Ok(())
}
