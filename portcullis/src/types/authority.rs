use super::rotation::Rotation;
use crate::backend;
use crate::error::{AuthorityError, AuthorityResult};
use crate::utils::base64_bytes;

use serde::{Deserialize, Serialize};
use sshcerts::PublicKey;

use std::fmt;

/// The purpose an authority signs for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertAuthType {
    Host,
    User,
    #[serde(rename = "db")]
    Database,
    #[serde(rename = "openssh")]
    OpenSsh,
    Jwt,
}

/// The different kinds of key material a CA can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Ssh,
    Tls,
    Jwt,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyKind::Ssh => write!(f, "SSH"),
            KeyKind::Tls => write!(f, "TLS"),
            KeyKind::Jwt => write!(f, "JWT"),
        }
    }
}

impl CertAuthType {
    pub const ALL: [CertAuthType; 5] = [
        CertAuthType::Host,
        CertAuthType::User,
        CertAuthType::Database,
        CertAuthType::OpenSsh,
        CertAuthType::Jwt,
    ];

    /// The key kinds a local CA of this type must always be able to sign
    /// with.
    pub fn required_kinds(&self) -> &'static [KeyKind] {
        match self {
            CertAuthType::Host | CertAuthType::User => &[KeyKind::Ssh, KeyKind::Tls],
            CertAuthType::Database => &[KeyKind::Tls],
            CertAuthType::OpenSsh => &[KeyKind::Ssh],
            CertAuthType::Jwt => &[KeyKind::Jwt],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CertAuthType::Host => "host",
            CertAuthType::User => "user",
            CertAuthType::Database => "db",
            CertAuthType::OpenSsh => "openssh",
            CertAuthType::Jwt => "jwt",
        }
    }
}

impl fmt::Display for CertAuthType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertAuthID {
    #[serde(rename = "type")]
    pub ca_type: CertAuthType,
    pub domain: String,
}

impl CertAuthID {
    pub fn new<S: Into<String>>(ca_type: CertAuthType, domain: S) -> Self {
        Self {
            ca_type,
            domain: domain.into(),
        }
    }

    pub fn check(&self) -> AuthorityResult<()> {
        if self.domain.is_empty() {
            return Err(AuthorityError::bad_parameter(format!(
                "missing domain name for {} authority",
                self.ca_type
            )));
        }
        Ok(())
    }

    pub fn backend_key(&self) -> String {
        backend::key(&["authorities", self.ca_type.as_str(), &self.domain])
    }
}

impl fmt::Display for CertAuthID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} authority of {}", self.ca_type, self.domain)
    }
}

/// Where the private half of a key lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrivateKeyType {
    /// PKCS#8 bytes stored alongside the public key.
    Raw,
    /// Held in the local keyring of a single auth server.
    Keyring { host_uuid: String, key_id: String },
    /// Held in Amazon KMS.
    AwsKms {
        account: String,
        region: String,
        arn: String,
    },
}

impl Default for PrivateKeyType {
    fn default() -> Self {
        PrivateKeyType::Raw
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SshKeyPair {
    /// Public key in authorized_keys format.
    pub public_key: String,
    #[serde(with = "base64_bytes", default)]
    pub private_key: Vec<u8>,
    #[serde(default)]
    pub private_key_type: PrivateKeyType,
}

impl SshKeyPair {
    pub fn parsed_public_key(&self) -> AuthorityResult<PublicKey> {
        PublicKey::from_string(&self.public_key).map_err(|e| {
            AuthorityError::bad_parameter(format!("malformed CA SSH public key: {}", e))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TlsKeyPair {
    /// Self signed CA certificate, PEM encoded.
    pub cert: String,
    #[serde(with = "base64_bytes", default)]
    pub private_key: Vec<u8>,
    #[serde(default)]
    pub private_key_type: PrivateKeyType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JwtKeyPair {
    /// DER encoded SubjectPublicKeyInfo.
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub private_key: Vec<u8>,
    #[serde(default)]
    pub private_key_type: PrivateKeyType,
}

/// A reference to the private half of any key pair, used by the key store
/// to decide which backend can sign with it.
pub struct PrivateKeyRef<'a> {
    pub private_key: &'a [u8],
    pub private_key_type: &'a PrivateKeyType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CAKeySet {
    #[serde(default)]
    pub ssh: Vec<SshKeyPair>,
    #[serde(default)]
    pub tls: Vec<TlsKeyPair>,
    #[serde(default)]
    pub jwt: Vec<JwtKeyPair>,
}

fn strip(private_key: &mut Vec<u8>, private_key_type: &mut PrivateKeyType) {
    private_key.clear();
    *private_key_type = PrivateKeyType::Raw;
}

impl CAKeySet {
    pub fn is_empty(&self) -> bool {
        self.ssh.is_empty() && self.tls.is_empty() && self.jwt.is_empty()
    }

    pub fn has_kind(&self, kind: KeyKind) -> bool {
        match kind {
            KeyKind::Ssh => !self.ssh.is_empty(),
            KeyKind::Tls => !self.tls.is_empty(),
            KeyKind::Jwt => !self.jwt.is_empty(),
        }
    }

    /// Private key references for every key of the given kind, in order.
    pub fn private_keys(&self, kind: KeyKind) -> Vec<PrivateKeyRef<'_>> {
        match kind {
            KeyKind::Ssh => self
                .ssh
                .iter()
                .map(|k| PrivateKeyRef {
                    private_key: &k.private_key,
                    private_key_type: &k.private_key_type,
                })
                .collect(),
            KeyKind::Tls => self
                .tls
                .iter()
                .map(|k| PrivateKeyRef {
                    private_key: &k.private_key,
                    private_key_type: &k.private_key_type,
                })
                .collect(),
            KeyKind::Jwt => self
                .jwt
                .iter()
                .map(|k| PrivateKeyRef {
                    private_key: &k.private_key,
                    private_key_type: &k.private_key_type,
                })
                .collect(),
        }
    }

    /// True if any key carries private material or a reference to it.
    pub fn has_secrets(&self) -> bool {
        let secret = |pk: &[u8], t: &PrivateKeyType| !pk.is_empty() || *t != PrivateKeyType::Raw;
        self.ssh.iter().any(|k| secret(&k.private_key, &k.private_key_type))
            || self.tls.iter().any(|k| secret(&k.private_key, &k.private_key_type))
            || self.jwt.iter().any(|k| secret(&k.private_key, &k.private_key_type))
    }

    pub fn without_secrets(&self) -> CAKeySet {
        let mut keys = self.clone();
        for k in keys.ssh.iter_mut() {
            strip(&mut k.private_key, &mut k.private_key_type);
        }
        for k in keys.tls.iter_mut() {
            strip(&mut k.private_key, &mut k.private_key_type);
        }
        for k in keys.jwt.iter_mut() {
            strip(&mut k.private_key, &mut k.private_key_type);
        }
        keys
    }

    pub fn extend(&mut self, other: CAKeySet) {
        self.ssh.extend(other.ssh);
        self.tls.extend(other.tls);
        self.jwt.extend(other.jwt);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertAuthority {
    pub id: CertAuthID,
    /// Keys used for signing (and trusted for verification).
    pub active_keys: CAKeySet,
    /// Keys trusted for verification but not used for signing.
    #[serde(default)]
    pub additional_trusted_keys: CAKeySet,
    #[serde(default)]
    pub rotation: Rotation,
}

impl CertAuthority {
    pub fn new(id: CertAuthID, active_keys: CAKeySet) -> Self {
        Self {
            id,
            active_keys,
            additional_trusted_keys: CAKeySet::default(),
            rotation: Rotation::default(),
        }
    }

    pub fn ca_type(&self) -> CertAuthType {
        self.id.ca_type
    }

    pub fn domain(&self) -> &str {
        &self.id.domain
    }

    /// Active and additional trusted keys together.
    pub fn trusted_keys(&self) -> CAKeySet {
        let mut keys = self.active_keys.clone();
        keys.extend(self.additional_trusted_keys.clone());
        keys
    }

    /// Every SSH public key a certificate from this authority may be
    /// signed with.
    pub fn trusted_ssh_public_keys(&self) -> AuthorityResult<Vec<PublicKey>> {
        self.trusted_keys()
            .ssh
            .iter()
            .map(|k| k.parsed_public_key())
            .collect()
    }

    /// Every CA certificate (PEM) a certificate from this authority may
    /// chain to.
    pub fn trusted_tls_certs(&self) -> Vec<String> {
        self.trusted_keys().tls.into_iter().map(|k| k.cert).collect()
    }

    pub fn without_secrets(&self) -> CertAuthority {
        CertAuthority {
            id: self.id.clone(),
            active_keys: self.active_keys.without_secrets(),
            additional_trusted_keys: self.additional_trusted_keys.without_secrets(),
            rotation: self.rotation.clone(),
        }
    }

    /// Structural validation applied before every write.
    pub fn check(&self) -> AuthorityResult<()> {
        self.id.check()?;
        self.rotation.check()?;
        if self.active_keys.is_empty() {
            return Err(AuthorityError::bad_parameter(format!(
                "{} has no active keys",
                self.id
            )));
        }
        Ok(())
    }

    /// Validation for authorities that must be able to sign for the local
    /// cluster: every required kind has at least one active key.
    pub fn check_local(&self) -> AuthorityResult<()> {
        self.check()?;
        for kind in self.ca_type().required_kinds() {
            if !self.active_keys.has_kind(*kind) {
                return Err(AuthorityError::bad_parameter(format!(
                    "{} has no active {} keys",
                    self.id, kind
                )));
            }
        }
        Ok(())
    }

    /// Validation for authorities of remote clusters, which must never carry
    /// signing material.
    pub fn check_remote(&self) -> AuthorityResult<()> {
        self.check()?;
        if self.active_keys.has_secrets() || self.additional_trusted_keys.has_secrets() {
            return Err(AuthorityError::bad_parameter(format!(
                "{} of a trusted cluster must not contain signing keys",
                self.id
            )));
        }
        Ok(())
    }
}
