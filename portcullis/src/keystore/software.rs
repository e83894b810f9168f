//! Software keys are P-256 PKCS#8 documents stored directly inside the
//! certificate authority. Every instance sharing the backend can use them.

use super::{GeneratedKey, KeyBackend, Signer, SigningError};
use crate::types::PrivateKeyType;

use async_trait::async_trait;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use serde::Deserialize;

use std::sync::Arc;

#[derive(Default, Deserialize)]
pub struct Config {}

impl Config {
    pub fn into_backend(self) -> Box<dyn KeyBackend> {
        Box::new(SoftwareKeys)
    }
}

pub struct SoftwareKeys;

/// A signer over an in-memory PKCS#8 key. Shared with the keyring backend,
/// which only differs in where the document is kept.
pub(super) struct Pkcs8Signer {
    key_pair: EcdsaKeyPair,
    public_key_der: Vec<u8>,
    rng: SystemRandom,
}

impl Pkcs8Signer {
    pub(super) fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, SigningError> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
            .map_err(|e| SigningError::ParsingError(e.to_string()))?;
        let public_key_der = spki_from_raw(key_pair.public_key().as_ref());
        Ok(Self {
            key_pair,
            public_key_der,
            rng,
        })
    }
}

/// Wrap a raw uncompressed P-256 point in a SubjectPublicKeyInfo.
fn spki_from_raw(raw: &[u8]) -> Vec<u8> {
    // SEQUENCE { SEQUENCE { id-ecPublicKey, prime256v1 }, BIT STRING }
    const PREFIX: [u8; 26] = [
        0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
        0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
    ];
    let mut spki = PREFIX.to_vec();
    spki.extend_from_slice(raw);
    spki
}

pub(super) fn generate_pkcs8() -> Result<Vec<u8>, SigningError> {
    let rng = SystemRandom::new();
    let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
        .map_err(|_| SigningError::SigningFailure)?;
    Ok(document.as_ref().to_vec())
}

#[async_trait]
impl Signer for Pkcs8Signer {
    fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        self.sign_blocking(data)
    }

    fn sign_blocking(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        self.key_pair
            .sign(&self.rng, data)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| SigningError::SigningFailure)
    }
}

#[async_trait]
impl KeyBackend for SoftwareKeys {
    fn name(&self) -> &'static str {
        "software"
    }

    async fn generate_key(&self) -> Result<GeneratedKey, SigningError> {
        let pkcs8 = generate_pkcs8()?;
        let signer = Pkcs8Signer::from_pkcs8(&pkcs8)?;
        Ok(GeneratedKey {
            signer: Arc::new(signer),
            private_key: pkcs8,
            private_key_type: PrivateKeyType::Raw,
        })
    }

    fn can_sign_with(&self, private_key: &[u8], private_key_type: &PrivateKeyType) -> bool {
        *private_key_type == PrivateKeyType::Raw && !private_key.is_empty()
    }

    async fn load_signer(
        &self,
        private_key: &[u8],
        private_key_type: &PrivateKeyType,
    ) -> Result<Arc<dyn Signer>, SigningError> {
        if !self.can_sign_with(private_key, private_key_type) {
            return Err(SigningError::AccessError(
                "key is not held in software".to_string(),
            ));
        }
        Ok(Arc::new(Pkcs8Signer::from_pkcs8(private_key)?))
    }
}
