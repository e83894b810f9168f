//! The identity bound into every certificate, and how it is written to and
//! read back from the SSH and x509 halves of a certificate pair.

pub mod ssh;
pub mod tls;

use crate::types::PrivateKeyPolicy;
use crate::utils::normalized;

/// Always present in user SSH principals so the holder can join sessions
/// through the proxy.
pub const INTERNAL_JOIN_PRINCIPAL: &str = "-teleport-internal-join";

/// Principal used when the user has no allowed logins, so the certificate
/// is never valid for every login.
pub const NO_LOGIN_PRINCIPAL_PREFIX: &str = "-teleport-nologin-";

/// Trusted device data added to certificates by augmentation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceExtensions {
    pub device_id: String,
    pub asset_tag: String,
    pub credential_id: String,
}

impl DeviceExtensions {
    pub fn is_empty(&self) -> bool {
        self.device_id.is_empty() && self.asset_tag.is_empty() && self.credential_id.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        !self.device_id.is_empty() && !self.asset_tag.is_empty() && !self.credential_id.is_empty()
    }
}

/// The decoded content of a certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    /// Role names, or the system role for hosts.
    pub groups: Vec<String>,
    /// Allowed logins.
    pub principals: Vec<String>,
    pub kubernetes_users: Vec<String>,
    pub kubernetes_groups: Vec<String>,
    pub kubernetes_cluster: String,
    pub route_to_cluster: String,
    pub teleport_cluster: String,
    /// Unix seconds.
    pub expires: u64,
    pub private_key_policy: PrivateKeyPolicy,
    pub device_extensions: DeviceExtensions,
    /// The MFA device used to issue the certificate, if any.
    pub mfa_verified: String,
    pub active_requests: Vec<String>,
    /// The address the certificate was requested from.
    pub login_ip: String,
    /// Set when the certificate may only be used from `login_ip`.
    pub pinned_ip: String,
}

impl Identity {
    /// The parts of an identity both halves of a pair carry: username,
    /// principals, groups and expiry. List order is ignored.
    pub fn matches_pair(&self, other: &Identity) -> bool {
        self.username == other.username
            && self.expires == other.expires
            && normalized(&self.principals) == normalized(&other.principals)
            && normalized(&self.groups) == normalized(&other.groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_comparison_ignores_order() {
        let a = Identity {
            username: "alice".to_string(),
            principals: vec!["root".to_string(), "alice".to_string()],
            groups: vec!["dev".to_string()],
            expires: 100,
            ..Default::default()
        };
        let mut b = a.clone();
        b.principals.reverse();
        b.kubernetes_cluster = "root-kube".to_string();
        assert!(a.matches_pair(&b));
        b.expires = 101;
        assert!(!a.matches_pair(&b));
    }
}
