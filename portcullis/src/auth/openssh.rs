use super::user_certs::user_lock_targets;
use super::{AuthServer, CLOCK_SKEW};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{ssh, Identity};
use crate::types::{AccessChecker, CertAuthType};
use crate::utils::unix_seconds;

use sshcerts::PublicKey;

use std::sync::Arc;
use std::time::Duration;

/// A user certificate for nodes that run a stock OpenSSH daemon. Those
/// nodes trust the OpenSSH authority, not the user authority.
pub struct OpenSshCertRequest {
    pub user: String,
    pub checker: Arc<dyn AccessChecker>,
    pub public_key: String,
    pub ttl: Duration,
}

impl AuthServer {
    pub async fn generate_openssh_cert(&self, req: OpenSshCertRequest) -> AuthorityResult<String> {
        let public_key = PublicKey::from_string(&req.public_key)
            .map_err(|e| AuthorityError::bad_parameter(format!("invalid public key: {}", e)))?;
        let logins = req.checker.logins();
        if logins.is_empty() {
            return Err(AuthorityError::access_denied(format!(
                "{} has no logins allowed on OpenSSH nodes",
                req.user
            )));
        }

        let now = self.now();
        let identity = Identity {
            username: req.user,
            groups: req.checker.role_names(),
            principals: logins,
            teleport_cluster: self.cluster_name.clone(),
            expires: unix_seconds(now + req.checker.adjust_session_ttl(self.ttl(req.ttl))),
            ..Default::default()
        };
        self.check_locks(&user_lock_targets(&identity))?;

        let ca = self.local_authority(CertAuthType::OpenSsh).await?;
        let signer = self.ssh_signer(&ca).await?;
        let cert = ssh::issue_user(
            &signer,
            &identity,
            &public_key,
            unix_seconds(now - CLOCK_SKEW),
        )
        .await?;
        Ok(cert.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster, public_key, roles};
    use super::*;
    use crate::types::CertAuthID;

    #[tokio::test]
    async fn openssh_certs_are_signed_by_their_own_authority() {
        let test = cluster("root.local").await;
        let cert = test
            .server
            .generate_openssh_cert(OpenSshCertRequest {
                user: "alice".to_string(),
                checker: roles(600, &["ubuntu"]),
                public_key: public_key().await,
                ttl: Duration::ZERO,
            })
            .await
            .unwrap();

        let decoded =
            ssh::decode_trusted(&cert, &trusted(&test.server, CertAuthType::OpenSsh).await)
                .unwrap();
        assert_eq!(decoded.identity.principals, vec!["ubuntu".to_string()]);
        assert!(ssh::decode_trusted(&cert, &trusted(&test.server, CertAuthType::User).await).is_err());
    }

    async fn trusted(server: &AuthServer, ca_type: CertAuthType) -> Vec<PublicKey> {
        server
            .get_cert_authority(&CertAuthID::new(ca_type, "root.local"), false)
            .await
            .unwrap()
            .trusted_ssh_public_keys()
            .unwrap()
    }

    #[tokio::test]
    async fn users_without_logins_are_denied() {
        let test = cluster("root.local").await;
        let err = test
            .server
            .generate_openssh_cert(OpenSshCertRequest {
                user: "alice".to_string(),
                checker: roles(600, &[]),
                public_key: public_key().await,
                ttl: Duration::ZERO,
            })
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
    }
}
