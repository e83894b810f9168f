use super::{from_item, to_item};
use crate::backend::{self, Backend};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{KubernetesCluster, RemoteCluster};

use async_trait::async_trait;

use std::sync::Arc;

/// What is registered with the cluster: Kubernetes clusters served by its
/// agents and the leaf clusters connected to it.
#[async_trait]
pub trait Presence: Send + Sync {
    async fn upsert_kubernetes_cluster(&self, cluster: &KubernetesCluster) -> AuthorityResult<()>;
    async fn get_kubernetes_clusters(&self) -> AuthorityResult<Vec<KubernetesCluster>>;
    async fn upsert_remote_cluster(&self, cluster: &RemoteCluster) -> AuthorityResult<()>;
    async fn get_remote_cluster(&self, name: &str) -> AuthorityResult<RemoteCluster>;
}

pub struct PresenceService {
    backend: Arc<dyn Backend>,
}

impl PresenceService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Presence for PresenceService {
    async fn upsert_kubernetes_cluster(&self, cluster: &KubernetesCluster) -> AuthorityResult<()> {
        if cluster.name.is_empty() {
            return Err(AuthorityError::bad_parameter("missing kubernetes cluster name"));
        }
        self.backend.put(to_item(cluster.backend_key(), cluster)?).await
    }

    async fn get_kubernetes_clusters(&self) -> AuthorityResult<Vec<KubernetesCluster>> {
        let prefix = format!("{}/", backend::key(&["kubernetes"]));
        self.backend
            .get_range(&prefix)
            .await?
            .iter()
            .map(from_item)
            .collect()
    }

    async fn upsert_remote_cluster(&self, cluster: &RemoteCluster) -> AuthorityResult<()> {
        if cluster.name.is_empty() {
            return Err(AuthorityError::bad_parameter("missing remote cluster name"));
        }
        self.backend.put(to_item(cluster.backend_key(), cluster)?).await
    }

    async fn get_remote_cluster(&self, name: &str) -> AuthorityResult<RemoteCluster> {
        let key = RemoteCluster::new(name).backend_key();
        let item = self.backend.get(&key).await.map_err(|e| {
            if e.is_not_found() {
                AuthorityError::not_found(format!("remote cluster {} is not found", name))
            } else {
                e
            }
        })?;
        from_item(&item)
    }
}
