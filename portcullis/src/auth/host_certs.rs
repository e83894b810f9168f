use super::{AuthServer, CLOCK_SKEW};
use crate::audit::{AuditEvent, HostCertificateIssued};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{ssh, tls, Identity};
use crate::types::{CertAuthType, LockTarget, SystemRole};
use crate::utils::unix_seconds;

use sshcerts::PublicKey;

use std::time::Duration;

pub struct HostCertsRequest {
    pub host_id: String,
    pub node_name: String,
    pub role: SystemRole,
    /// authorized_keys format.
    pub public_key: String,
    pub additional_principals: Vec<String>,
    /// Subject alternative names of the x509 half.
    pub dns_names: Vec<String>,
    pub ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct HostCerts {
    pub ssh: String,
    pub tls: String,
    /// User authority keys the host should trust.
    pub ssh_ca_keys: Vec<String>,
    /// Host authority certificates, used to verify other cluster members.
    pub tls_ca_certs: Vec<String>,
}

impl AuthServer {
    pub async fn generate_host_certs(&self, req: HostCertsRequest) -> AuthorityResult<HostCerts> {
        if req.host_id.is_empty() {
            return Err(AuthorityError::bad_parameter("missing host ID"));
        }
        let public_key = PublicKey::from_string(&req.public_key)
            .map_err(|e| AuthorityError::bad_parameter(format!("invalid public key: {}", e)))?;

        // Only nodes can be locked out by name
        if req.role == SystemRole::Node {
            self.check_locks(&[LockTarget::node(req.host_id.as_str())])?;
        }

        let mut principals = vec![
            req.host_id.clone(),
            format!("{}.{}", req.host_id, self.cluster_name),
        ];
        if !req.node_name.is_empty() && req.node_name != req.host_id {
            principals.push(req.node_name.clone());
            principals.push(format!("{}.{}", req.node_name, self.cluster_name));
        }
        for extra in &req.additional_principals {
            if !principals.contains(extra) {
                principals.push(extra.clone());
            }
        }

        let now = self.now();
        let not_before = now - CLOCK_SKEW;
        let identity = Identity {
            username: format!("{}.{}", req.host_id, self.cluster_name),
            groups: vec![req.role.to_string()],
            principals,
            teleport_cluster: self.cluster_name.clone(),
            expires: unix_seconds(now + self.ttl(req.ttl)),
            ..Default::default()
        };

        let host_ca = self.local_authority(CertAuthType::Host).await?;
        let ssh_signer = self.ssh_signer(&host_ca).await?;
        let ssh_cert =
            ssh::issue_host(&ssh_signer, &identity, &public_key, unix_seconds(not_before)).await?;
        let tls_signer = self.tls_signer(&host_ca).await?;
        let tls_cert = tls::issue(
            &tls_signer,
            &identity,
            tls::subject_key_from_ssh(&public_key)?,
            &req.dns_names,
            not_before,
        )?;

        let user_ca = self.local_authority(CertAuthType::User).await?;
        let ssh_ca_keys = user_ca
            .trusted_ssh_public_keys()?
            .iter()
            .map(|k| k.to_string())
            .collect();

        debug!(
            "Issued host certificates for [{}] with role {}",
            req.host_id, req.role
        );
        self.audit
            .emit(AuditEvent::HostCertificateIssued(HostCertificateIssued {
                host_id: req.host_id.clone(),
                node_name: req.node_name.clone(),
                role: req.role.to_string(),
            }));

        Ok(HostCerts {
            ssh: ssh_cert.to_string(),
            tls: tls_cert,
            ssh_ca_keys,
            tls_ca_certs: host_ca.trusted_tls_certs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster, public_key};
    use super::*;
    use crate::types::{CertAuthID, Lock};

    use sshcerts::ssh::CertType;
    use sshcerts::Certificate;

    async fn request(role: SystemRole) -> HostCertsRequest {
        HostCertsRequest {
            host_id: "5d3f0c1e".to_string(),
            node_name: "db-1".to_string(),
            role,
            public_key: public_key().await,
            additional_principals: vec!["10.0.0.7".to_string()],
            dns_names: vec!["db-1.example.com".to_string()],
            ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn host_principals_cover_every_name() {
        let test = cluster("root.local").await;
        let certs = test
            .server
            .generate_host_certs(request(SystemRole::Node).await)
            .await
            .unwrap();

        let cert = Certificate::from_string(&certs.ssh).unwrap();
        assert_eq!(cert.cert_type, CertType::Host);
        assert_eq!(
            cert.principals,
            vec![
                "5d3f0c1e".to_string(),
                "5d3f0c1e.root.local".to_string(),
                "db-1".to_string(),
                "db-1.root.local".to_string(),
                "10.0.0.7".to_string(),
            ]
        );
        assert_eq!(
            cert.extensions.get(ssh::EXT_SYSTEM_ROLE),
            Some(&"Node".to_string())
        );

        let host_ca = test
            .server
            .get_cert_authority(&CertAuthID::new(CertAuthType::Host, "root.local"), false)
            .await
            .unwrap();
        let tls = tls::decode_trusted(&certs.tls, &host_ca.trusted_tls_certs()).unwrap();
        assert_eq!(tls.identity.username, "5d3f0c1e.root.local");
        assert_eq!(tls.identity.groups, vec!["Node".to_string()]);
    }

    #[tokio::test]
    async fn node_locks_only_apply_to_nodes() {
        let test = cluster("root.local").await;
        let subscription = test
            .server
            .lock_watcher()
            .subscribe(vec![LockTarget::node("5d3f0c1e")])
            .unwrap();
        test.server
            .upsert_lock(Lock::new("quarantine", LockTarget::node("5d3f0c1e")))
            .await
            .unwrap();
        subscription.next().await.unwrap();

        let err = test
            .server
            .generate_host_certs(request(SystemRole::Node).await)
            .await
            .unwrap_err();
        assert!(err.is_access_denied());

        test.server
            .generate_host_certs(request(SystemRole::Proxy).await)
            .await
            .unwrap();
    }
}
