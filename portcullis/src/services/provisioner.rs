use super::{from_item, to_item};
use crate::backend::{self, Backend};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{token_key, ProvisionToken};

use async_trait::async_trait;

use std::sync::Arc;

/// Storage of dynamic join tokens.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn upsert_token(&self, token: &ProvisionToken) -> AuthorityResult<()>;
    async fn get_token(&self, name: &str) -> AuthorityResult<ProvisionToken>;
    async fn get_tokens(&self) -> AuthorityResult<Vec<ProvisionToken>>;
    async fn delete_token(&self, name: &str) -> AuthorityResult<()>;
}

pub struct ProvisionService {
    backend: Arc<dyn Backend>,
}

impl ProvisionService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Provisioner for ProvisionService {
    async fn upsert_token(&self, token: &ProvisionToken) -> AuthorityResult<()> {
        token.check()?;
        self.backend.put(to_item(token.backend_key(), token)?).await
    }

    async fn get_token(&self, name: &str) -> AuthorityResult<ProvisionToken> {
        if name.is_empty() {
            return Err(AuthorityError::bad_parameter("missing token name"));
        }
        // The token name is a secret so it is left out of the error
        let item = self.backend.get(&token_key(name)).await.map_err(|e| {
            if e.is_not_found() {
                AuthorityError::not_found("provisioning token is not found")
            } else {
                e
            }
        })?;
        from_item(&item)
    }

    async fn get_tokens(&self) -> AuthorityResult<Vec<ProvisionToken>> {
        let prefix = format!("{}/", backend::key(&["tokens"]));
        self.backend
            .get_range(&prefix)
            .await?
            .iter()
            .map(from_item)
            .collect()
    }

    async fn delete_token(&self, name: &str) -> AuthorityResult<()> {
        self.backend.delete(&token_key(name)).await
    }
}
