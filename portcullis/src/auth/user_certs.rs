use super::{AuthServer, CLOCK_SKEW};
use crate::audit::{AuditEvent, UserCertificateIssued};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{
    ssh, tls, DeviceExtensions, Identity, INTERNAL_JOIN_PRINCIPAL, NO_LOGIN_PRINCIPAL_PREFIX,
};
use crate::types::{AccessChecker, CertAuthType, LockTarget};
use crate::utils::unix_seconds;

use sshcerts::PublicKey;

use std::sync::Arc;
use std::time::Duration;

pub struct UserCertsRequest {
    pub user: String,
    pub checker: Arc<dyn AccessChecker>,
    /// The user's public key in authorized_keys format. Both certificates
    /// certify this key.
    pub public_key: String,
    /// Zero asks for the configured default.
    pub ttl: Duration,
    /// Empty for the local cluster.
    pub route_to_cluster: String,
    pub kubernetes_cluster: String,
    pub mfa_verified: String,
    pub active_requests: Vec<String>,
    pub device_extensions: DeviceExtensions,
    /// The address the request came from, if known.
    pub client_ip: Option<String>,
}

impl UserCertsRequest {
    pub fn new<U: Into<String>, K: Into<String>>(
        user: U,
        checker: Arc<dyn AccessChecker>,
        public_key: K,
    ) -> Self {
        Self {
            user: user.into(),
            checker,
            public_key: public_key.into(),
            ttl: Duration::ZERO,
            route_to_cluster: String::new(),
            kubernetes_cluster: String::new(),
            mfa_verified: String::new(),
            active_requests: vec![],
            device_extensions: DeviceExtensions::default(),
            client_ip: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UserCerts {
    /// authorized_keys formatted SSH certificate.
    pub ssh: String,
    /// PEM x509 certificate.
    pub tls: String,
    /// Host authority keys the client should trust, authorized_keys format.
    pub ssh_ca_keys: Vec<String>,
    /// Host authority certificates the client should trust, PEM.
    pub tls_ca_certs: Vec<String>,
}

/// Lock targets derived from an issued identity.
pub(crate) fn user_lock_targets(identity: &Identity) -> Vec<LockTarget> {
    let mut targets = vec![LockTarget::user(identity.username.as_str())];
    targets.extend(identity.groups.iter().map(|r| LockTarget::role(r.as_str())));
    if !identity.mfa_verified.is_empty() {
        targets.push(LockTarget::mfa_device(identity.mfa_verified.as_str()));
    }
    targets.extend(
        identity
            .active_requests
            .iter()
            .map(|r| LockTarget::access_request(r.as_str())),
    );
    if !identity.device_extensions.device_id.is_empty() {
        targets.push(LockTarget::device(
            identity.device_extensions.device_id.as_str(),
        ));
    }
    targets
}

impl AuthServer {
    pub async fn generate_user_certs(&self, req: UserCertsRequest) -> AuthorityResult<UserCerts> {
        let public_key = PublicKey::from_string(&req.public_key)
            .map_err(|e| AuthorityError::bad_parameter(format!("invalid public key: {}", e)))?;

        let ttl = req.checker.adjust_session_ttl(self.ttl(req.ttl));
        let now = self.now();
        let expires = unix_seconds(now + ttl);

        let route_to_cluster = self.route_to_cluster(&req.route_to_cluster).await?;
        let kubernetes_cluster = self
            .kubernetes_cluster(&route_to_cluster, &req.kubernetes_cluster)
            .await?;

        let pinned_ip = if req.checker.pin_source_ip() {
            match &req.client_ip {
                Some(ip) if !ip.is_empty() => ip.clone(),
                _ => {
                    return Err(AuthorityError::access_denied(
                        "source IP pinning is enabled but the client IP is unknown",
                    ))
                }
            }
        } else {
            String::new()
        };

        let mut principals = req.checker.logins();
        if principals.is_empty() {
            principals.push(format!("{}{}", NO_LOGIN_PRINCIPAL_PREFIX, req.user));
        }
        if !principals.iter().any(|p| p == INTERNAL_JOIN_PRINCIPAL) {
            principals.push(INTERNAL_JOIN_PRINCIPAL.to_string());
        }

        let identity = Identity {
            username: req.user.clone(),
            groups: req.checker.role_names(),
            principals,
            kubernetes_users: req.checker.kubernetes_users(),
            kubernetes_groups: req.checker.kubernetes_groups(),
            kubernetes_cluster,
            route_to_cluster,
            teleport_cluster: self.cluster_name.clone(),
            expires,
            private_key_policy: req.checker.private_key_policy(),
            device_extensions: req.device_extensions.clone(),
            mfa_verified: req.mfa_verified.clone(),
            active_requests: req.active_requests.clone(),
            login_ip: req.client_ip.clone().unwrap_or_default(),
            pinned_ip,
        };

        self.check_locks(&user_lock_targets(&identity))?;

        let user_ca = self.local_authority(CertAuthType::User).await?;
        let not_before = now - CLOCK_SKEW;

        let ssh_signer = self.ssh_signer(&user_ca).await?;
        let ssh_cert =
            ssh::issue_user(&ssh_signer, &identity, &public_key, unix_seconds(not_before)).await?;

        let tls_signer = self.tls_signer(&user_ca).await?;
        let tls_cert = tls::issue(
            &tls_signer,
            &identity,
            tls::subject_key_from_ssh(&public_key)?,
            &[],
            not_before,
        )?;

        let host_ca = self.local_authority(CertAuthType::Host).await?;
        let ssh_ca_keys = host_ca
            .trusted_ssh_public_keys()?
            .iter()
            .map(|k| k.to_string())
            .collect();

        info!(
            "Issued user certificates for [{}] with roles {:?} valid for {}s",
            identity.username,
            identity.groups,
            ttl.as_secs()
        );
        self.audit
            .emit(AuditEvent::UserCertificateIssued(UserCertificateIssued {
                user: identity.username.clone(),
                roles: identity.groups.clone(),
                principals: identity.principals.clone(),
                kubernetes_cluster: identity.kubernetes_cluster.clone(),
                route_to_cluster: identity.route_to_cluster.clone(),
                expires: identity.expires,
            }));

        Ok(UserCerts {
            ssh: ssh_cert.to_string(),
            tls: tls_cert,
            ssh_ca_keys,
            tls_ca_certs: host_ca.trusted_tls_certs(),
        })
    }

    pub(super) async fn route_to_cluster(&self, requested: &str) -> AuthorityResult<String> {
        if requested.is_empty() || requested == self.cluster_name {
            return Ok(self.cluster_name.clone());
        }
        self.presence.get_remote_cluster(requested).await?;
        Ok(requested.to_string())
    }

    /// Pick the kubernetes cluster for a certificate routed to
    /// `route_to_cluster`. Leaf clusters validate their own names.
    pub(super) async fn kubernetes_cluster(
        &self,
        route_to_cluster: &str,
        requested: &str,
    ) -> AuthorityResult<String> {
        if route_to_cluster != self.cluster_name {
            return Ok(requested.to_string());
        }

        let mut names: Vec<String> = self
            .presence
            .get_kubernetes_clusters()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();

        if !requested.is_empty() {
            if names.iter().any(|n| n == requested) {
                return Ok(requested.to_string());
            }
            return Err(AuthorityError::access_denied(format!(
                "kubernetes cluster {:?} is not registered in this cluster",
                requested
            )));
        }

        // With several to choose from the forwarder picks at connection time
        Ok(match names.len() {
            1 => names.remove(0),
            _ => String::new(),
        })
    }
}
