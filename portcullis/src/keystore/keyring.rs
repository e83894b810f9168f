//! A host-local keyring. Private keys never enter the backend: the CA only
//! records which host holds the key and under what id, so only that auth
//! server can sign with it. This mirrors how an HSM attached to a single
//! instance behaves.

use super::software::{generate_pkcs8, Pkcs8Signer};
use super::{GeneratedKey, KeyBackend, Signer, SigningError};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::PrivateKeyType;
use crate::utils::random_id;

use async_trait::async_trait;
use serde::Deserialize;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct Config {
    /// Keys are kept under `<data_dir>/keyring`. Defaults to the
    /// instance's data_dir.
    #[serde(default)]
    pub data_dir: String,
}

impl Config {
    pub fn into_backend(self, host_uuid: &str) -> AuthorityResult<Box<dyn KeyBackend>> {
        if self.data_dir.is_empty() {
            return Err(AuthorityError::bad_parameter("keyring requires a data_dir"));
        }
        if host_uuid.is_empty() {
            return Err(AuthorityError::bad_parameter("keyring requires a host_uuid"));
        }
        Ok(Box::new(Keyring {
            dir: PathBuf::from(self.data_dir).join("keyring"),
            host_uuid: host_uuid.to_string(),
        }))
    }
}

pub struct Keyring {
    dir: PathBuf,
    host_uuid: String,
}

impl Keyring {
    fn key_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{}.pk8", key_id))
    }

    fn owned_key_id<'a>(&self, private_key_type: &'a PrivateKeyType) -> Option<&'a str> {
        match private_key_type {
            PrivateKeyType::Keyring { host_uuid, key_id } if *host_uuid == self.host_uuid => {
                Some(key_id.as_str())
            }
            _ => None,
        }
    }

    fn store(&self, key_id: &str, pkcs8: &[u8]) -> Result<(), SigningError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SigningError::AccessError(format!("could not create {}: {}", self.dir.display(), e))
        })?;
        let path = self.key_path(key_id);
        fs::write(&path, pkcs8).map_err(|e| {
            SigningError::AccessError(format!("could not write {}: {}", path.display(), e))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                SigningError::AccessError(format!("could not protect {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyBackend for Keyring {
    fn name(&self) -> &'static str {
        "keyring"
    }

    async fn generate_key(&self) -> Result<GeneratedKey, SigningError> {
        let key_id = random_id().map_err(|_| SigningError::SigningFailure)?;
        let pkcs8 = generate_pkcs8()?;
        self.store(&key_id, &pkcs8)?;
        debug!("Generated keyring key [{}] on host [{}]", key_id, self.host_uuid);

        Ok(GeneratedKey {
            signer: Arc::new(Pkcs8Signer::from_pkcs8(&pkcs8)?),
            private_key: vec![],
            private_key_type: PrivateKeyType::Keyring {
                host_uuid: self.host_uuid.clone(),
                key_id,
            },
        })
    }

    fn can_sign_with(&self, _private_key: &[u8], private_key_type: &PrivateKeyType) -> bool {
        self.owned_key_id(private_key_type).is_some()
    }

    async fn load_signer(
        &self,
        _private_key: &[u8],
        private_key_type: &PrivateKeyType,
    ) -> Result<Arc<dyn Signer>, SigningError> {
        let key_id = self.owned_key_id(private_key_type).ok_or_else(|| {
            SigningError::AccessError(format!("key is not held by host {}", self.host_uuid))
        })?;
        let path = self.key_path(key_id);
        let pkcs8 = fs::read(&path).map_err(|e| {
            SigningError::AccessError(format!("could not read {}: {}", path.display(), e))
        })?;
        Ok(Arc::new(Pkcs8Signer::from_pkcs8(&pkcs8)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_are_rejected() {
        let err = Config {
            data_dir: String::new(),
        }
        .into_backend("host-1")
        .err()
        .unwrap();
        assert!(err.is_bad_parameter());

        let err = Config {
            data_dir: "/var/lib/portcullis".to_string(),
        }
        .into_backend("")
        .err()
        .unwrap();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn keys_are_only_usable_by_their_host() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap().to_string();
        let host_1 = Config {
            data_dir: data_dir.clone(),
        }
        .into_backend("host-1")
        .unwrap();
        let host_2 = Config { data_dir }.into_backend("host-2").unwrap();

        let key = host_1.generate_key().await.unwrap();
        assert!(key.private_key.is_empty());
        assert!(host_1.can_sign_with(&key.private_key, &key.private_key_type));
        assert!(!host_2.can_sign_with(&key.private_key, &key.private_key_type));

        let signer = host_1
            .load_signer(&key.private_key, &key.private_key_type)
            .await
            .unwrap();
        assert_eq!(signer.public_key_der(), key.signer.public_key_der());
    }
}
