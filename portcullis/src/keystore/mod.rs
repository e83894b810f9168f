//! Signing key storage. A `KeyStore` wraps exactly one key backend and turns
//! the key material recorded in a certificate authority into signers for
//! SSH certificates, x509 certificates and JWTs.

#[cfg(feature = "amazon-kms")]
mod amazon_kms;
mod keyring;
mod software;

pub use software::SoftwareKeys;

use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{
    CAKeySet, CertAuthority, JwtKeyPair, KeyKind, PrivateKeyType, SshKeyPair, TlsKeyPair,
};
use crate::utils::random_serial;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate as X509Certificate, CertificateParams, DnType, IsCa, KeyPair,
    KeyUsagePurpose, RcgenError, RemoteKeyPair, SignatureAlgorithm,
};
use serde::Deserialize;
use sshcerts::utils::format_signature_for_ssh;
use sshcerts::{Certificate, PublicKey};
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How long generated CA certificates are valid for.
const CA_CERT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug)]
pub enum SigningError {
    AccessError(String),
    ParsingError(String),
    SigningFailure,
}

impl std::fmt::Display for SigningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningError::AccessError(e) => write!(f, "Could not access the private key material: {}", e),
            SigningError::ParsingError(e) => write!(f, "Could not parse the key material: {}", e),
            SigningError::SigningFailure => write!(f, "The signing operation failed"),
        }
    }
}

impl From<SigningError> for AuthorityError {
    fn from(e: SigningError) -> Self {
        AuthorityError::Signing(e.to_string())
    }
}

/// A P-256 key that can produce ECDSA SHA-256 signatures. Signatures are
/// ASN.1 DER encoded.
#[async_trait]
pub trait Signer: Send + Sync {
    /// DER encoded SubjectPublicKeyInfo.
    fn public_key_der(&self) -> &[u8];

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError>;

    /// Synchronous form used from inside the x509 serializer.
    fn sign_blocking(&self, data: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// A freshly generated key as it will be recorded in a CA.
pub struct GeneratedKey {
    pub signer: Arc<dyn Signer>,
    pub private_key: Vec<u8>,
    pub private_key_type: PrivateKeyType,
}

/// Anything that can hold CA private keys.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate_key(&self) -> Result<GeneratedKey, SigningError>;

    /// Whether this backend, on this instance, can sign with the key.
    fn can_sign_with(&self, private_key: &[u8], private_key_type: &PrivateKeyType) -> bool;

    async fn load_signer(
        &self,
        private_key: &[u8],
        private_key_type: &PrivateKeyType,
    ) -> Result<Arc<dyn Signer>, SigningError>;
}

/// Exactly one of these may be configured.
#[derive(Deserialize)]
pub struct KeyStoreConfiguration {
    pub software: Option<software::Config>,
    pub keyring: Option<keyring::Config>,
    #[cfg(feature = "amazon-kms")]
    pub amazonkms: Option<amazon_kms::Config>,
}

impl Default for KeyStoreConfiguration {
    fn default() -> Self {
        Self {
            software: Some(software::Config::default()),
            keyring: None,
            #[cfg(feature = "amazon-kms")]
            amazonkms: None,
        }
    }
}

impl KeyStoreConfiguration {
    pub fn keyring(data_dir: &str) -> Self {
        Self {
            software: None,
            keyring: Some(keyring::Config {
                data_dir: data_dir.to_string(),
            }),
            #[cfg(feature = "amazon-kms")]
            amazonkms: None,
        }
    }

    pub async fn into_key_store(self, host_uuid: &str) -> AuthorityResult<KeyStore> {
        let software = self.software.map(|c| c.into_backend());

        let keyring = match self.keyring {
            Some(config) => Some(config.into_backend(host_uuid)?),
            None => None,
        };

        let amazonkms = {
            #[cfg(feature = "amazon-kms")]
            match self.amazonkms {
                Some(config) => Some(config.into_backend().await?),
                None => None,
            }
            #[cfg(not(feature = "amazon-kms"))]
            None::<Box<dyn KeyBackend>>
        };

        let backend = match (software, keyring, amazonkms) {
            (Some(software), None, None) => software,
            (None, Some(keyring), None) => keyring,
            (None, None, Some(amazonkms)) => amazonkms,
            (None, None, None) => {
                return Err(AuthorityError::bad_parameter("no key store is configured"))
            }
            _ => {
                return Err(AuthorityError::bad_parameter(
                    "exactly one key store must be configured",
                ))
            }
        };
        info!("Configured key store: {}", backend.name());
        Ok(KeyStore {
            backend: Arc::from(backend),
        })
    }
}

/// Signs SSH certificates for one CA key.
#[derive(Clone)]
pub struct SshSigner {
    pub public_key: PublicKey,
    signer: Arc<dyn Signer>,
}

impl SshSigner {
    pub async fn sign(&self, cert: Certificate) -> AuthorityResult<Certificate> {
        let der = self.signer.sign(&cert.tbs_certificate()).await?;
        let signature = format_signature_for_ssh(&self.public_key, &der).ok_or_else(|| {
            AuthorityError::Signing("could not encode the SSH signature".to_string())
        })?;
        cert.add_signature(&signature)
            .map_err(|e| AuthorityError::Signing(format!("could not attach SSH signature: {}", e)))
    }
}

/// The CA certificate and a signer for it, ready to issue x509
/// certificates.
pub struct TlsSigner {
    pub cert_pem: String,
    pub ca: X509Certificate,
}

/// Signs JWTs with ES256.
#[derive(Clone)]
pub struct JwtSigner {
    signer: Arc<dyn Signer>,
}

impl JwtSigner {
    pub fn public_key_der(&self) -> &[u8] {
        self.signer.public_key_der()
    }

    /// A raw (r || s) ES256 signature over `data`.
    pub async fn sign(&self, data: &[u8]) -> AuthorityResult<Vec<u8>> {
        let der = self.signer.sign(data).await?;
        Ok(der_signature_to_fixed(&der)?)
    }
}

#[derive(asn1::Asn1Read)]
struct EcdsaSignature<'a> {
    r: asn1::BigUint<'a>,
    s: asn1::BigUint<'a>,
}

fn fixed_scalar(value: &[u8], out: &mut Vec<u8>) -> Result<(), SigningError> {
    let trimmed: Vec<u8> = value.iter().copied().skip_while(|b| *b == 0).collect();
    if trimmed.len() > 32 {
        return Err(SigningError::ParsingError("ECDSA scalar too large".to_string()));
    }
    out.extend(std::iter::repeat(0).take(32 - trimmed.len()));
    out.extend(trimmed);
    Ok(())
}

pub(crate) fn der_signature_to_fixed(der: &[u8]) -> Result<Vec<u8>, SigningError> {
    let sig = asn1::parse_single::<EcdsaSignature>(der)
        .map_err(|e| SigningError::ParsingError(format!("{:?}", e)))?;
    let mut out = Vec::with_capacity(64);
    fixed_scalar(sig.r.as_bytes(), &mut out)?;
    fixed_scalar(sig.s.as_bytes(), &mut out)?;
    Ok(out)
}

/// The raw public key (uncompressed point) inside a SubjectPublicKeyInfo.
pub(crate) fn raw_public_key(spki: &[u8]) -> Result<Vec<u8>, SigningError> {
    let (_, info) = SubjectPublicKeyInfo::from_der(spki)
        .map_err(|e| SigningError::ParsingError(e.to_string()))?;
    Ok(info.subject_public_key.data.to_vec())
}

/// Adapts a `Signer` to rcgen so CA keys never have to leave their
/// backend.
struct RemoteSigner {
    signer: Arc<dyn Signer>,
    raw_public_key: Vec<u8>,
}

impl RemoteKeyPair for RemoteSigner {
    fn public_key(&self) -> &[u8] {
        &self.raw_public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, RcgenError> {
        self.signer.sign_blocking(msg).map_err(|e| {
            error!("Remote x509 signing failed: {}", e);
            RcgenError::RemoteKeyError
        })
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

fn rcgen_key_pair(signer: Arc<dyn Signer>) -> AuthorityResult<KeyPair> {
    let raw_public_key = raw_public_key(signer.public_key_der())?;
    Ok(KeyPair::from_remote(Box::new(RemoteSigner {
        signer,
        raw_public_key,
    }))?)
}

fn ssh_public_key(signer: &dyn Signer) -> AuthorityResult<PublicKey> {
    sshcerts::x509::der_encoding_to_ssh_public_key(signer.public_key_der()).map_err(|e| {
        AuthorityError::Signing(format!("key backend produced an unusable key: {}", e))
    })
}

/// Hands out signers for certificate authorities using the configured
/// backend.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KeyBackend>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KeyBackend>) -> Self {
        Self { backend }
    }

    /// A key store holding software keys.
    pub fn software() -> Self {
        Self::new(Arc::new(software::SoftwareKeys))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn usable_index(&self, keys: &CAKeySet, kind: KeyKind) -> Option<usize> {
        keys.private_keys(kind)
            .iter()
            .position(|k| self.backend.can_sign_with(k.private_key, k.private_key_type))
    }

    fn has_usable(&self, keys: &CAKeySet, ca: &CertAuthority) -> bool {
        ca.ca_type()
            .required_kinds()
            .iter()
            .all(|kind| self.usable_index(keys, *kind).is_some())
    }

    /// True if this instance can sign with the CA's active keys.
    pub fn has_usable_active_keys(&self, ca: &CertAuthority) -> bool {
        self.has_usable(&ca.active_keys, ca)
    }

    /// True if this instance can sign with the CA's additional trusted keys.
    pub fn has_usable_additional_keys(&self, ca: &CertAuthority) -> bool {
        self.has_usable(&ca.additional_trusted_keys, ca)
    }

    async fn ssh_signer_from(&self, ca: &CertAuthority, keys: &CAKeySet) -> AuthorityResult<SshSigner> {
        let index = self.usable_index(keys, KeyKind::Ssh).ok_or_else(|| {
            AuthorityError::not_found(format!("no usable SSH key found in {}", ca.id))
        })?;
        let key = &keys.ssh[index];
        let signer = self
            .backend
            .load_signer(&key.private_key, &key.private_key_type)
            .await?;
        Ok(SshSigner {
            public_key: key.parsed_public_key()?,
            signer,
        })
    }

    async fn tls_signer_from(&self, ca: &CertAuthority, keys: &CAKeySet) -> AuthorityResult<TlsSigner> {
        let index = self.usable_index(keys, KeyKind::Tls).ok_or_else(|| {
            AuthorityError::not_found(format!("no usable TLS key found in {}", ca.id))
        })?;
        let key = &keys.tls[index];
        let signer = self
            .backend
            .load_signer(&key.private_key, &key.private_key_type)
            .await?;
        let params = CertificateParams::from_ca_cert_pem(&key.cert, rcgen_key_pair(signer)?)
            .map_err(|e| {
                AuthorityError::Signing(format!("malformed CA certificate in {}: {}", ca.id, e))
            })?;
        Ok(TlsSigner {
            cert_pem: key.cert.clone(),
            ca: X509Certificate::from_params(params)?,
        })
    }

    pub async fn get_ssh_signer(&self, ca: &CertAuthority) -> AuthorityResult<SshSigner> {
        self.ssh_signer_from(ca, &ca.active_keys).await
    }

    pub async fn get_tls_cert_and_signer(&self, ca: &CertAuthority) -> AuthorityResult<TlsSigner> {
        self.tls_signer_from(ca, &ca.active_keys).await
    }

    /// Signer over the additional trusted keys. Instances that were
    /// onboarded with new keys use these for their own identity until a
    /// rotation makes the keys active.
    pub async fn get_additional_trusted_tls_cert_and_signer(
        &self,
        ca: &CertAuthority,
    ) -> AuthorityResult<TlsSigner> {
        self.tls_signer_from(ca, &ca.additional_trusted_keys).await
    }

    pub async fn get_additional_trusted_ssh_signer(
        &self,
        ca: &CertAuthority,
    ) -> AuthorityResult<SshSigner> {
        self.ssh_signer_from(ca, &ca.additional_trusted_keys).await
    }

    pub async fn get_jwt_signer(&self, ca: &CertAuthority) -> AuthorityResult<JwtSigner> {
        let index = self.usable_index(&ca.active_keys, KeyKind::Jwt).ok_or_else(|| {
            AuthorityError::not_found(format!("no usable JWT key found in {}", ca.id))
        })?;
        let key = &ca.active_keys.jwt[index];
        let signer = self
            .backend
            .load_signer(&key.private_key, &key.private_key_type)
            .await?;
        Ok(JwtSigner { signer })
    }

    pub async fn new_ssh_key_pair(&self) -> AuthorityResult<SshKeyPair> {
        let key = self.backend.generate_key().await?;
        let public_key = ssh_public_key(key.signer.as_ref())?;
        Ok(SshKeyPair {
            public_key: public_key.to_string().trim_end().to_string(),
            private_key: key.private_key,
            private_key_type: key.private_key_type,
        })
    }

    /// A new key and a self signed CA certificate for `cluster_name`.
    pub async fn new_tls_key_pair(&self, cluster_name: &str) -> AuthorityResult<TlsKeyPair> {
        let key = self.backend.generate_key().await?;

        let mut params = CertificateParams::new(vec![]);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name.push(DnType::OrganizationName, cluster_name);
        params.distinguished_name.push(DnType::CommonName, cluster_name);
        params.serial_number = Some(random_serial()?.into());
        let now = SystemTime::now();
        params.not_before = (now - Duration::from_secs(60)).into();
        params.not_after = (now + CA_CERT_VALIDITY).into();
        params.key_pair = Some(rcgen_key_pair(key.signer.clone())?);

        let cert = X509Certificate::from_params(params)?.serialize_pem()?;
        Ok(TlsKeyPair {
            cert,
            private_key: key.private_key,
            private_key_type: key.private_key_type,
        })
    }

    pub async fn new_jwt_key_pair(&self) -> AuthorityResult<JwtKeyPair> {
        let key = self.backend.generate_key().await?;
        Ok(JwtKeyPair {
            public_key: key.signer.public_key_der().to_vec(),
            private_key: key.private_key,
            private_key_type: key.private_key_type,
        })
    }

    /// One new key of every kind `kinds` names.
    pub async fn new_key_set(&self, kinds: &[KeyKind], cluster_name: &str) -> AuthorityResult<CAKeySet> {
        let mut keys = CAKeySet::default();
        for kind in kinds {
            match kind {
                KeyKind::Ssh => keys.ssh.push(self.new_ssh_key_pair().await?),
                KeyKind::Tls => keys.tls.push(self.new_tls_key_pair(cluster_name).await?),
                KeyKind::Jwt => keys.jwt.push(self.new_jwt_key_pair().await?),
            }
        }
        Ok(keys)
    }
}
