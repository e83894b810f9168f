use super::{from_item, to_item};
use crate::backend::{self, Backend};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{lock_key, Lock};

use async_trait::async_trait;

use std::sync::Arc;

#[async_trait]
pub trait LockStore: Send + Sync {
    async fn upsert_lock(&self, lock: &Lock) -> AuthorityResult<()>;
    async fn get_lock(&self, name: &str) -> AuthorityResult<Lock>;
    async fn get_locks(&self) -> AuthorityResult<Vec<Lock>>;
    async fn delete_lock(&self, name: &str) -> AuthorityResult<()>;
}

pub struct LockService {
    backend: Arc<dyn Backend>,
}

impl LockService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LockStore for LockService {
    async fn upsert_lock(&self, lock: &Lock) -> AuthorityResult<()> {
        lock.check()?;
        self.backend.put(to_item(lock.backend_key(), lock)?).await
    }

    async fn get_lock(&self, name: &str) -> AuthorityResult<Lock> {
        let item = self.backend.get(&lock_key(name)).await.map_err(|e| {
            if e.is_not_found() {
                AuthorityError::not_found(format!("lock {} is not found", name))
            } else {
                e
            }
        })?;
        from_item(&item)
    }

    async fn get_locks(&self) -> AuthorityResult<Vec<Lock>> {
        let prefix = format!("{}/", backend::key(&["locks"]));
        self.backend
            .get_range(&prefix)
            .await?
            .iter()
            .map(from_item)
            .collect()
    }

    async fn delete_lock(&self, name: &str) -> AuthorityResult<()> {
        self.backend.delete(&lock_key(name)).await
    }
}
