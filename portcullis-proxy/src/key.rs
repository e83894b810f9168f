use portcullis::identity::Identity;
use portcullis::types::PrivateKeyPolicy;
use portcullis::utils::normalized;

/// Everything about a caller that changes the certificate issued on their
/// behalf. Two callers share cached credentials only if their keys are
/// equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub teleport_cluster: String,
    pub route_to_cluster: String,
    pub username: String,
    /// Role names.
    pub groups: Vec<String>,
    pub principals: Vec<String>,
    pub kubernetes_cluster: String,
    pub kubernetes_users: Vec<String>,
    pub kubernetes_groups: Vec<String>,
    pub active_requests: Vec<String>,
    pub private_key_policy: PrivateKeyPolicy,
    pub mfa_verified: String,
    pub pinned_ip: String,
    /// Expiry of the caller's own certificate, unix seconds. Issued
    /// credentials never outlive it.
    pub expires: u64,
}

impl IdentityKey {
    /// The key for a caller authenticated as `identity`. Lists are sorted
    /// so ordering differences do not split the cache.
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            teleport_cluster: identity.teleport_cluster.clone(),
            route_to_cluster: identity.route_to_cluster.clone(),
            username: identity.username.clone(),
            groups: normalized(&identity.groups),
            principals: normalized(&identity.principals),
            kubernetes_cluster: identity.kubernetes_cluster.clone(),
            kubernetes_users: normalized(&identity.kubernetes_users),
            kubernetes_groups: normalized(&identity.kubernetes_groups),
            active_requests: normalized(&identity.active_requests),
            private_key_policy: identity.private_key_policy,
            mfa_verified: identity.mfa_verified.clone(),
            pinned_ip: identity.pinned_ip.clone(),
            expires: identity.expires,
        }
    }
}
