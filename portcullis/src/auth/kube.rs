use super::user_certs::user_lock_targets;
use super::{AuthServer, CLOCK_SKEW};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{tls, Identity};
use crate::types::{AccessChecker, CertAuthType};
use crate::utils::unix_seconds;

use std::sync::Arc;
use std::time::Duration;

/// A CSR generated by the kubernetes proxy for a client credential it
/// uses on the user's behalf.
pub struct KubeCsrRequest {
    /// DER encoded PKCS#10 request.
    pub csr: Vec<u8>,
    pub user: String,
    pub checker: Arc<dyn AccessChecker>,
    pub kubernetes_cluster: String,
    pub route_to_cluster: String,
    pub active_requests: Vec<String>,
    pub ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct KubeCsrResponse {
    pub cert: String,
    /// Host authority certificates, to verify the kubernetes service.
    pub ca_certs: Vec<String>,
    /// Unix seconds.
    pub expires: u64,
}

impl AuthServer {
    pub async fn process_kube_csr(&self, req: KubeCsrRequest) -> AuthorityResult<KubeCsrResponse> {
        if req.user.is_empty() {
            return Err(AuthorityError::bad_parameter("missing user"));
        }
        let route_to_cluster = self.route_to_cluster(&req.route_to_cluster).await?;
        let kubernetes_cluster = self
            .kubernetes_cluster(&route_to_cluster, &req.kubernetes_cluster)
            .await?;

        let now = self.now();
        let ttl = req.checker.adjust_session_ttl(self.ttl(req.ttl));
        let identity = Identity {
            username: req.user,
            groups: req.checker.role_names(),
            principals: req.checker.logins(),
            kubernetes_users: req.checker.kubernetes_users(),
            kubernetes_groups: req.checker.kubernetes_groups(),
            kubernetes_cluster,
            route_to_cluster,
            teleport_cluster: self.cluster_name.clone(),
            expires: unix_seconds(now + ttl),
            private_key_policy: req.checker.private_key_policy(),
            active_requests: req.active_requests,
            ..Default::default()
        };
        self.check_locks(&user_lock_targets(&identity))?;

        let user_ca = self.local_authority(CertAuthType::User).await?;
        let signer = self.tls_signer(&user_ca).await?;
        let cert = tls::issue_from_csr(&signer, &identity, &req.csr, &[], now - CLOCK_SKEW)?;
        let host_ca = self.local_authority(CertAuthType::Host).await?;

        debug!(
            "Signed kubernetes client certificate for [{}] in cluster [{}]",
            identity.username, identity.kubernetes_cluster
        );
        Ok(KubeCsrResponse {
            cert,
            ca_certs: host_ca.trusted_tls_certs(),
            expires: identity.expires,
        })
    }
}
