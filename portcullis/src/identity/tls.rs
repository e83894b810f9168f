//! x509 encoding of an `Identity`. The username is the subject common name,
//! scalar fields are custom subject attributes and list fields are custom
//! extensions holding a DER SEQUENCE OF UTF8String.

use super::Identity;
use crate::error::{AuthorityError, AuthorityResult};
use crate::keystore::TlsSigner;
use crate::types::PrivateKeyPolicy;
use crate::utils::{from_unix_seconds, random_serial};

use rcgen::{
    Certificate as X509Certificate, CertificateParams, CertificateSigningRequest,
    CustomExtension, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, RcgenError,
    RemoteKeyPair, SignatureAlgorithm,
};
use sshcerts::ssh::{CurveKind, PublicKeyKind};
use sshcerts::PublicKey;
use x509_parser::certificate::X509Certificate as ParsedCertificate;
use x509_parser::pem::parse_x509_pem;

use std::time::SystemTime;

const KUBERNETES_CLUSTER: [u64; 5] = [1, 3, 9999, 1, 1];
const ROUTE_TO_CLUSTER: [u64; 5] = [1, 3, 9999, 1, 2];
const TELEPORT_CLUSTER: [u64; 5] = [1, 3, 9999, 1, 3];
const MFA_VERIFIED: [u64; 5] = [1, 3, 9999, 1, 4];
const PINNED_IP: [u64; 5] = [1, 3, 9999, 1, 5];
const LOGIN_IP: [u64; 5] = [1, 3, 9999, 1, 6];
const PRIVATE_KEY_POLICY: [u64; 5] = [1, 3, 9999, 1, 7];
const DEVICE_ID: [u64; 5] = [1, 3, 9999, 1, 8];
const DEVICE_ASSET_TAG: [u64; 5] = [1, 3, 9999, 1, 9];
const DEVICE_CREDENTIAL_ID: [u64; 5] = [1, 3, 9999, 1, 10];

const GROUPS: [u64; 5] = [1, 3, 9999, 2, 1];
const PRINCIPALS: [u64; 5] = [1, 3, 9999, 2, 2];
const KUBERNETES_USERS: [u64; 5] = [1, 3, 9999, 2, 3];
const KUBERNETES_GROUPS: [u64; 5] = [1, 3, 9999, 2, 4];
const ACTIVE_REQUESTS: [u64; 5] = [1, 3, 9999, 2, 5];

fn oid_string(oid: &[u64]) -> String {
    oid.iter()
        .map(|c| c.to_string())
        .collect::<Vec<String>>()
        .join(".")
}

fn encode_list(values: &[String]) -> AuthorityResult<Vec<u8>> {
    let items: Vec<asn1::Utf8String> = values.iter().map(|v| asn1::Utf8String::new(v)).collect();
    asn1::write_single(&asn1::SequenceOfWriter::new(items))
        .map_err(|e| AuthorityError::Signing(format!("could not encode identity list: {:?}", e)))
}

fn decode_list(der: &[u8]) -> AuthorityResult<Vec<String>> {
    let items = asn1::parse_single::<asn1::SequenceOf<asn1::Utf8String>>(der).map_err(|e| {
        AuthorityError::bad_parameter(format!("malformed identity extension: {:?}", e))
    })?;
    Ok(items.map(|s| s.as_str().to_string()).collect())
}

/// Write `identity` into subject and extensions of `params`.
fn apply_identity(params: &mut CertificateParams, identity: &Identity) -> AuthorityResult<()> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.username.as_str());
    let scalars: [(&[u64], &str); 10] = [
        (&KUBERNETES_CLUSTER[..], identity.kubernetes_cluster.as_str()),
        (&ROUTE_TO_CLUSTER[..], identity.route_to_cluster.as_str()),
        (&TELEPORT_CLUSTER[..], identity.teleport_cluster.as_str()),
        (&MFA_VERIFIED[..], identity.mfa_verified.as_str()),
        (&PINNED_IP[..], identity.pinned_ip.as_str()),
        (&LOGIN_IP[..], identity.login_ip.as_str()),
        (&PRIVATE_KEY_POLICY[..], identity.private_key_policy.as_str()),
        (&DEVICE_ID[..], identity.device_extensions.device_id.as_str()),
        (&DEVICE_ASSET_TAG[..], identity.device_extensions.asset_tag.as_str()),
        (&DEVICE_CREDENTIAL_ID[..], identity.device_extensions.credential_id.as_str()),
    ];
    for (oid, value) in scalars {
        if !value.is_empty() {
            dn.push(DnType::CustomDnType(oid.to_vec()), value);
        }
    }
    params.distinguished_name = dn;

    let lists: [(&[u64], &Vec<String>); 5] = [
        (&GROUPS[..], &identity.groups),
        (&PRINCIPALS[..], &identity.principals),
        (&KUBERNETES_USERS[..], &identity.kubernetes_users),
        (&KUBERNETES_GROUPS[..], &identity.kubernetes_groups),
        (&ACTIVE_REQUESTS[..], &identity.active_requests),
    ];
    params.custom_extensions = vec![];
    for (oid, values) in lists {
        if !values.is_empty() {
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(oid, encode_list(values)?));
        }
    }

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.name_constraints = None;
    params.serial_number = Some(random_serial()?.into());
    params.not_after = from_unix_seconds(identity.expires).into();
    Ok(())
}

/// An rcgen key that only carries a public key. Subject certificates are
/// signed by the CA, so the subject's private key is never needed.
struct PublicOnlyKey {
    raw: Vec<u8>,
    alg: &'static SignatureAlgorithm,
}

impl RemoteKeyPair for PublicOnlyKey {
    fn public_key(&self) -> &[u8] {
        &self.raw
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, RcgenError> {
        Err(RcgenError::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.alg
    }
}

fn ssh_key_material(public_key: &PublicKey) -> AuthorityResult<(Vec<u8>, &'static SignatureAlgorithm)> {
    match &public_key.kind {
        PublicKeyKind::Ecdsa(key) => match key.curve.kind {
            CurveKind::Nistp256 => Ok((key.key.clone(), &rcgen::PKCS_ECDSA_P256_SHA256)),
            CurveKind::Nistp384 => Ok((key.key.clone(), &rcgen::PKCS_ECDSA_P384_SHA384)),
            _ => Err(AuthorityError::bad_parameter(
                "unsupported ECDSA curve for x509 certificates",
            )),
        },
        PublicKeyKind::Ed25519(key) => Ok((key.key.clone(), &rcgen::PKCS_ED25519)),
        _ => Err(AuthorityError::bad_parameter(
            "unsupported key type for x509 certificates",
        )),
    }
}

/// The raw key bytes of an SSH public key, comparable with
/// `DecodedCertificate::public_key`.
pub fn raw_subject_key(public_key: &PublicKey) -> AuthorityResult<Vec<u8>> {
    Ok(ssh_key_material(public_key)?.0)
}

/// The subject key for the x509 half of a pair, so it certifies the same
/// key as the SSH half.
pub fn subject_key_from_ssh(public_key: &PublicKey) -> AuthorityResult<KeyPair> {
    let (raw, alg) = ssh_key_material(public_key)?;
    Ok(KeyPair::from_remote(Box::new(PublicOnlyKey { raw, alg }))?)
}

/// Sign an x509 certificate for `identity` over the given subject key.
/// `dns_names` become subject alternative names.
pub fn issue(
    signer: &TlsSigner,
    identity: &Identity,
    subject_key: KeyPair,
    dns_names: &[String],
    not_before: SystemTime,
) -> AuthorityResult<String> {
    let mut params = CertificateParams::new(dns_names.to_vec());
    params.alg = subject_key.algorithm();
    params.key_pair = Some(subject_key);
    apply_identity(&mut params, identity)?;
    params.not_before = not_before.into();
    let cert = X509Certificate::from_params(params)?;
    Ok(cert.serialize_pem_with_signer(&signer.ca)?)
}

/// Sign a DER encoded CSR, replacing whatever subject it asked for with
/// `identity`. The CSR's signature proves possession of the key.
pub fn issue_from_csr(
    signer: &TlsSigner,
    identity: &Identity,
    csr_der: &[u8],
    dns_names: &[String],
    not_before: SystemTime,
) -> AuthorityResult<String> {
    let mut csr = CertificateSigningRequest::from_der(csr_der)
        .map_err(|e| AuthorityError::bad_parameter(format!("invalid CSR: {}", e)))?;
    apply_identity(&mut csr.params, identity)?;
    csr.params.subject_alt_names = dns_names
        .iter()
        .map(|n| rcgen::SanType::DnsName(n.clone()))
        .collect();
    csr.params.use_authority_key_identifier_extension = false;
    csr.params.not_before = not_before.into();
    Ok(csr.serialize_pem_with_signer(&signer.ca)?)
}

/// A parsed x509 certificate and the identity it carries.
pub struct DecodedCertificate {
    pub identity: Identity,
    /// The raw subject public key.
    pub public_key: Vec<u8>,
    /// None for key types certificates are never issued for.
    pub key_algorithm: Option<&'static SignatureAlgorithm>,
    pub not_before: u64,
    pub not_after: u64,
}

fn key_algorithm(cert: &ParsedCertificate) -> Option<&'static SignatureAlgorithm> {
    let spki = cert.public_key();
    match spki.algorithm.algorithm.to_id_string().as_str() {
        "1.2.840.10045.2.1" => match spki.subject_public_key.data.len() {
            65 => Some(&rcgen::PKCS_ECDSA_P256_SHA256),
            97 => Some(&rcgen::PKCS_ECDSA_P384_SHA384),
            _ => None,
        },
        "1.3.101.112" => Some(&rcgen::PKCS_ED25519),
        _ => None,
    }
}

/// Sign a new certificate for `identity` over the subject key of an
/// already decoded certificate.
pub fn reissue(
    signer: &TlsSigner,
    identity: &Identity,
    decoded: &DecodedCertificate,
    not_before: SystemTime,
) -> AuthorityResult<String> {
    let alg = decoded.key_algorithm.ok_or_else(|| {
        AuthorityError::bad_parameter("unsupported key type for x509 certificates")
    })?;
    let subject_key = KeyPair::from_remote(Box::new(PublicOnlyKey {
        raw: decoded.public_key.clone(),
        alg,
    }))?;
    issue(signer, identity, subject_key, &[], not_before)
}

fn read_identity(cert: &ParsedCertificate) -> AuthorityResult<Identity> {
    let mut identity = Identity::default();
    let subject = cert.subject();
    for attr in subject.iter_attributes() {
        let value = match attr.as_str() {
            Ok(v) => v.to_string(),
            Err(_) => continue,
        };
        let oid = attr.attr_type().to_id_string();
        if oid == "2.5.4.3" {
            identity.username = value;
            continue;
        }
        let field = match oid {
            o if o == oid_string(&KUBERNETES_CLUSTER) => &mut identity.kubernetes_cluster,
            o if o == oid_string(&ROUTE_TO_CLUSTER) => &mut identity.route_to_cluster,
            o if o == oid_string(&TELEPORT_CLUSTER) => &mut identity.teleport_cluster,
            o if o == oid_string(&MFA_VERIFIED) => &mut identity.mfa_verified,
            o if o == oid_string(&PINNED_IP) => &mut identity.pinned_ip,
            o if o == oid_string(&LOGIN_IP) => &mut identity.login_ip,
            o if o == oid_string(&DEVICE_ID) => &mut identity.device_extensions.device_id,
            o if o == oid_string(&DEVICE_ASSET_TAG) => &mut identity.device_extensions.asset_tag,
            o if o == oid_string(&DEVICE_CREDENTIAL_ID) => {
                &mut identity.device_extensions.credential_id
            }
            o if o == oid_string(&PRIVATE_KEY_POLICY) => {
                identity.private_key_policy =
                    PrivateKeyPolicy::parse(&value).unwrap_or_default();
                continue;
            }
            _ => continue,
        };
        *field = value;
    }

    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        let field = match oid {
            o if o == oid_string(&GROUPS) => &mut identity.groups,
            o if o == oid_string(&PRINCIPALS) => &mut identity.principals,
            o if o == oid_string(&KUBERNETES_USERS) => &mut identity.kubernetes_users,
            o if o == oid_string(&KUBERNETES_GROUPS) => &mut identity.kubernetes_groups,
            o if o == oid_string(&ACTIVE_REQUESTS) => &mut identity.active_requests,
            _ => continue,
        };
        *field = decode_list(ext.value)?;
    }

    identity.expires = cert.validity().not_after.timestamp().max(0) as u64;
    Ok(identity)
}

/// Parse a PEM certificate, verify it was signed by one of `trusted_cas`
/// (PEM) and decode its identity.
pub fn decode_trusted(cert_pem: &str, trusted_cas: &[String]) -> AuthorityResult<DecodedCertificate> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| AuthorityError::bad_parameter(format!("malformed x509 certificate: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| AuthorityError::bad_parameter(format!("malformed x509 certificate: {}", e)))?;

    let mut verified = false;
    for ca_pem in trusted_cas {
        let (_, ca_pem) = match parse_x509_pem(ca_pem.as_bytes()) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let ca = match ca_pem.parse_x509() {
            Ok(c) => c,
            Err(_) => continue,
        };
        if cert.verify_signature(Some(ca.public_key())).is_ok() {
            verified = true;
            break;
        }
    }
    if !verified {
        return Err(AuthorityError::access_denied(
            "x509 certificate is not signed by a trusted authority",
        ));
    }

    Ok(DecodedCertificate {
        identity: read_identity(&cert)?,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
        key_algorithm: key_algorithm(&cert),
        not_before: cert.validity().not_before.timestamp().max(0) as u64,
        not_after: cert.validity().not_after.timestamp().max(0) as u64,
    })
}

/// Whether any trusted device data is already bound into the certificate.
pub fn has_device_extensions(identity: &Identity) -> bool {
    !identity.device_extensions.is_empty()
}
