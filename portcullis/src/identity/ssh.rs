//! SSH certificate encoding of an `Identity`. Identity fields that have no
//! native SSH representation travel as certificate extensions.

use super::{DeviceExtensions, Identity};
use crate::error::{AuthorityError, AuthorityResult};
use crate::keystore::SshSigner;
use crate::types::PrivateKeyPolicy;
use crate::utils::random_serial;

use sshcerts::ssh::CertType;
use sshcerts::{Certificate, PublicKey};

use std::collections::HashMap;
use std::net::IpAddr;

pub const EXT_ROLES: &str = "teleport-roles";
pub const EXT_ROUTE_TO_CLUSTER: &str = "teleport-route-to-cluster";
pub const EXT_ACTIVE_REQUESTS: &str = "teleport-active-requests";
pub const EXT_MFA_VERIFIED: &str = "mfa-verified";
pub const EXT_PRIVATE_KEY_POLICY: &str = "private-key-policy";
pub const EXT_LOGIN_IP: &str = "login-ip";
pub const EXT_PIN_IP: &str = "pin-ip";
pub const EXT_DEVICE_ID: &str = "teleport-device-id";
pub const EXT_DEVICE_ASSET_TAG: &str = "teleport-device-asset-tag";
pub const EXT_DEVICE_CREDENTIAL_ID: &str = "teleport-device-credential-id";
pub const EXT_SYSTEM_ROLE: &str = "x-teleport-role";
pub const EXT_CLUSTER_NAME: &str = "x-teleport-authority";

pub const CRITICAL_SOURCE_ADDRESS: &str = "source-address";

/// The source-address value that restricts a certificate to one IP.
pub fn single_address_cidr(ip: &str) -> AuthorityResult<String> {
    let addr: IpAddr = ip
        .parse()
        .map_err(|_| AuthorityError::bad_parameter(format!("invalid client IP: {}", ip)))?;
    Ok(match addr {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    })
}

fn encode_list(values: &[String]) -> AuthorityResult<String> {
    Ok(serde_json::to_string(values)?)
}

fn decode_list(value: &str) -> AuthorityResult<Vec<String>> {
    serde_json::from_str(value)
        .map_err(|e| AuthorityError::bad_parameter(format!("malformed certificate extension: {}", e)))
}

/// The extensions and critical options a user certificate carries for
/// `identity`.
fn user_options(
    identity: &Identity,
) -> AuthorityResult<(HashMap<String, String>, HashMap<String, String>)> {
    let mut extensions = HashMap::new();
    for permit in ["permit-pty", "permit-port-forwarding", "permit-agent-forwarding"] {
        extensions.insert(permit.to_string(), String::new());
    }
    extensions.insert(EXT_ROLES.to_string(), encode_list(&identity.groups)?);

    let scalars = [
        (EXT_ROUTE_TO_CLUSTER, identity.route_to_cluster.as_str()),
        (EXT_MFA_VERIFIED, identity.mfa_verified.as_str()),
        (EXT_LOGIN_IP, identity.login_ip.as_str()),
        (EXT_PIN_IP, identity.pinned_ip.as_str()),
        (EXT_DEVICE_ID, identity.device_extensions.device_id.as_str()),
        (EXT_DEVICE_ASSET_TAG, identity.device_extensions.asset_tag.as_str()),
        (
            EXT_DEVICE_CREDENTIAL_ID,
            identity.device_extensions.credential_id.as_str(),
        ),
    ];
    for (name, value) in scalars {
        if !value.is_empty() {
            extensions.insert(name.to_string(), value.to_string());
        }
    }
    if identity.private_key_policy != PrivateKeyPolicy::None {
        extensions.insert(
            EXT_PRIVATE_KEY_POLICY.to_string(),
            identity.private_key_policy.as_str().to_string(),
        );
    }
    if !identity.active_requests.is_empty() {
        extensions.insert(
            EXT_ACTIVE_REQUESTS.to_string(),
            encode_list(&identity.active_requests)?,
        );
    }

    let mut critical_options = HashMap::new();
    if !identity.pinned_ip.is_empty() {
        critical_options.insert(
            CRITICAL_SOURCE_ADDRESS.to_string(),
            single_address_cidr(&identity.pinned_ip)?,
        );
    }
    Ok((extensions, critical_options))
}

/// Sign a user certificate carrying `identity` for `public_key`.
pub async fn issue_user(
    signer: &SshSigner,
    identity: &Identity,
    public_key: &PublicKey,
    valid_after: u64,
) -> AuthorityResult<Certificate> {
    let (extensions, critical_options) = user_options(identity)?;
    let cert = Certificate::builder(public_key, CertType::User, &signer.public_key)?
        .serial(random_serial()?)
        .key_id(identity.username.clone())
        .set_principals(&identity.principals)
        .valid_after(valid_after)
        .valid_before(identity.expires)
        .set_critical_options(critical_options)
        .set_extensions(extensions);
    signer.sign(cert).await
}

/// Sign a host certificate for `public_key`. Hosts carry their system role
/// and cluster instead of a user identity.
pub async fn issue_host(
    signer: &SshSigner,
    identity: &Identity,
    public_key: &PublicKey,
    valid_after: u64,
) -> AuthorityResult<Certificate> {
    let mut extensions = HashMap::new();
    if let Some(role) = identity.groups.first() {
        extensions.insert(EXT_SYSTEM_ROLE.to_string(), role.clone());
    }
    extensions.insert(EXT_CLUSTER_NAME.to_string(), identity.teleport_cluster.clone());

    let cert = Certificate::builder(public_key, CertType::Host, &signer.public_key)?
        .serial(random_serial()?)
        .key_id(identity.username.clone())
        .set_principals(&identity.principals)
        .valid_after(valid_after)
        .valid_before(identity.expires)
        .set_critical_options(HashMap::new())
        .set_extensions(extensions);
    signer.sign(cert).await
}

/// Sign a copy of `original` that also carries `device`. Principals,
/// expiry, extensions and critical options are kept as they are.
pub async fn reissue_with_device(
    signer: &SshSigner,
    original: &Certificate,
    device: &DeviceExtensions,
    valid_after: u64,
) -> AuthorityResult<Certificate> {
    let mut extensions = original.extensions.clone();
    for (name, value) in [
        (EXT_DEVICE_ID, &device.device_id),
        (EXT_DEVICE_ASSET_TAG, &device.asset_tag),
        (EXT_DEVICE_CREDENTIAL_ID, &device.credential_id),
    ] {
        extensions.insert(name.to_string(), value.clone());
    }

    let cert = Certificate::builder(&original.key, CertType::User, &signer.public_key)?
        .serial(random_serial()?)
        .key_id(original.key_id.clone())
        .set_principals(&original.principals)
        .valid_after(valid_after)
        .valid_before(original.valid_before)
        .set_critical_options(original.critical_options.clone())
        .set_extensions(extensions);
    signer.sign(cert).await
}

/// A parsed SSH certificate and the identity it carries.
pub struct DecodedCertificate {
    pub identity: Identity,
    pub cert: Certificate,
}

/// Read the identity out of a user certificate.
pub fn read_identity(cert: &Certificate) -> AuthorityResult<Identity> {
    let ext = |name: &str| cert.extensions.get(name).cloned().unwrap_or_default();
    let roles = match cert.extensions.get(EXT_ROLES) {
        Some(v) => decode_list(v)?,
        None => vec![],
    };
    let active_requests = match cert.extensions.get(EXT_ACTIVE_REQUESTS) {
        Some(v) => decode_list(v)?,
        None => vec![],
    };
    Ok(Identity {
        username: cert.key_id.clone(),
        groups: roles,
        principals: cert.principals.clone(),
        route_to_cluster: ext(EXT_ROUTE_TO_CLUSTER),
        expires: cert.valid_before,
        private_key_policy: PrivateKeyPolicy::parse(&ext(EXT_PRIVATE_KEY_POLICY))
            .unwrap_or_default(),
        device_extensions: DeviceExtensions {
            device_id: ext(EXT_DEVICE_ID),
            asset_tag: ext(EXT_DEVICE_ASSET_TAG),
            credential_id: ext(EXT_DEVICE_CREDENTIAL_ID),
        },
        mfa_verified: ext(EXT_MFA_VERIFIED),
        active_requests,
        login_ip: ext(EXT_LOGIN_IP),
        pinned_ip: ext(EXT_PIN_IP),
        ..Default::default()
    })
}

/// Parse an authorized_keys formatted certificate, verify it was signed by
/// one of `trusted_keys` and decode its identity.
pub fn decode_trusted(cert: &str, trusted_keys: &[PublicKey]) -> AuthorityResult<DecodedCertificate> {
    // Parsing checks the signature against the embedded signing key
    let cert = Certificate::from_string(cert)
        .map_err(|e| AuthorityError::bad_parameter(format!("malformed SSH certificate: {}", e)))?;
    let signer = cert.signature_key.fingerprint().hash;
    if !trusted_keys.iter().any(|k| k.fingerprint().hash == signer) {
        return Err(AuthorityError::access_denied(
            "SSH certificate is not signed by a trusted authority",
        ));
    }
    Ok(DecodedCertificate {
        identity: read_identity(&cert)?,
        cert,
    })
}

pub fn has_device_extensions(cert: &Certificate) -> bool {
    [EXT_DEVICE_ID, EXT_DEVICE_ASSET_TAG, EXT_DEVICE_CREDENTIAL_ID]
        .iter()
        .any(|e| cert.extensions.contains_key(*e))
}
