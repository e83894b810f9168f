use super::{from_item, to_item};
use crate::backend::{self, Backend};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{CertAuthID, CertAuthType, CertAuthority};

use async_trait::async_trait;

use std::sync::Arc;

/// Storage of certificate authorities, local and trusted.
#[async_trait]
pub trait Trust: Send + Sync {
    /// Store a new local authority. AlreadyExists if another writer got
    /// there first.
    async fn create_cert_authority(&self, ca: &CertAuthority) -> AuthorityResult<()>;

    /// Replace `existing` with `new` only if nobody changed it in between.
    async fn compare_and_swap_cert_authority(
        &self,
        new: &CertAuthority,
        existing: &CertAuthority,
    ) -> AuthorityResult<()>;

    /// Store the authority of a trusted cluster. Signing keys are refused.
    async fn upsert_trusted_cert_authority(&self, ca: &CertAuthority) -> AuthorityResult<()>;

    /// Without `load_keys` the returned copy has its private keys stripped.
    async fn get_cert_authority(&self, id: &CertAuthID, load_keys: bool)
        -> AuthorityResult<CertAuthority>;

    async fn get_cert_authorities(
        &self,
        ca_type: CertAuthType,
        load_keys: bool,
    ) -> AuthorityResult<Vec<CertAuthority>>;

    async fn delete_cert_authority(&self, id: &CertAuthID) -> AuthorityResult<()>;
}

pub struct TrustService {
    backend: Arc<dyn Backend>,
}

impl TrustService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

fn strip(ca: CertAuthority, load_keys: bool) -> CertAuthority {
    if load_keys {
        ca
    } else {
        ca.without_secrets()
    }
}

#[async_trait]
impl Trust for TrustService {
    async fn create_cert_authority(&self, ca: &CertAuthority) -> AuthorityResult<()> {
        ca.check()?;
        self.backend.create(to_item(ca.id.backend_key(), ca)?).await
    }

    async fn compare_and_swap_cert_authority(
        &self,
        new: &CertAuthority,
        existing: &CertAuthority,
    ) -> AuthorityResult<()> {
        if new.id != existing.id {
            return Err(AuthorityError::bad_parameter(format!(
                "cannot replace {} with {}",
                existing.id, new.id
            )));
        }
        new.check()?;
        let expected = to_item(existing.id.backend_key(), existing)?;
        self.backend
            .compare_and_swap(&expected, to_item(new.id.backend_key(), new)?)
            .await
    }

    async fn upsert_trusted_cert_authority(&self, ca: &CertAuthority) -> AuthorityResult<()> {
        ca.check_remote()?;
        self.backend.put(to_item(ca.id.backend_key(), ca)?).await
    }

    async fn get_cert_authority(
        &self,
        id: &CertAuthID,
        load_keys: bool,
    ) -> AuthorityResult<CertAuthority> {
        id.check()?;
        let item = self.backend.get(&id.backend_key()).await.map_err(|e| {
            if e.is_not_found() {
                AuthorityError::not_found(format!("{} is not found", id))
            } else {
                e
            }
        })?;
        Ok(strip(from_item(&item)?, load_keys))
    }

    async fn get_cert_authorities(
        &self,
        ca_type: CertAuthType,
        load_keys: bool,
    ) -> AuthorityResult<Vec<CertAuthority>> {
        let prefix = format!("{}/", backend::key(&["authorities", ca_type.as_str()]));
        self.backend
            .get_range(&prefix)
            .await?
            .iter()
            .map(|item| Ok(strip(from_item(item)?, load_keys)))
            .collect()
    }

    async fn delete_cert_authority(&self, id: &CertAuthID) -> AuthorityResult<()> {
        id.check()?;
        self.backend.delete(&id.backend_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::keystore::KeyStore;
    use crate::types::KeyKind;

    async fn authority(domain: &str) -> CertAuthority {
        let keys = KeyStore::software()
            .new_key_set(&[KeyKind::Ssh], domain)
            .await
            .unwrap();
        CertAuthority::new(CertAuthID::new(CertAuthType::OpenSsh, domain), keys)
    }

    #[tokio::test]
    async fn keys_are_only_returned_on_request() {
        let trust = TrustService::new(Arc::new(MemoryBackend::new()));
        let ca = authority("root.local").await;
        trust.create_cert_authority(&ca).await.unwrap();
        assert!(trust.create_cert_authority(&ca).await.unwrap_err().is_already_exists());

        let stripped = trust.get_cert_authority(&ca.id, false).await.unwrap();
        assert!(!stripped.active_keys.has_secrets());
        let full = trust.get_cert_authority(&ca.id, true).await.unwrap();
        assert_eq!(full, ca);
    }

    #[tokio::test]
    async fn trusted_authorities_must_not_carry_keys() {
        let trust = TrustService::new(Arc::new(MemoryBackend::new()));
        let ca = authority("leaf.local").await;
        assert!(trust
            .upsert_trusted_cert_authority(&ca)
            .await
            .unwrap_err()
            .is_bad_parameter());
        trust
            .upsert_trusted_cert_authority(&ca.without_secrets())
            .await
            .unwrap();
        let all = trust
            .get_cert_authorities(CertAuthType::OpenSsh, true)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn stale_swaps_are_rejected() {
        let trust = TrustService::new(Arc::new(MemoryBackend::new()));
        let ca = authority("root.local").await;
        trust.create_cert_authority(&ca).await.unwrap();

        let mut first = ca.clone();
        first.rotation.last_rotated = 1;
        trust.compare_and_swap_cert_authority(&first, &ca).await.unwrap();

        let mut second = ca.clone();
        second.rotation.last_rotated = 2;
        let err = trust
            .compare_and_swap_cert_authority(&second, &ca)
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());
    }
}
