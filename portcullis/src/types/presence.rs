use crate::backend;

use serde::{Deserialize, Serialize};

use std::collections::HashMap;

/// A Kubernetes cluster registered with this cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesCluster {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl KubernetesCluster {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
        }
    }

    pub fn backend_key(&self) -> String {
        backend::key(&["kubernetes", &self.name])
    }
}

/// A leaf cluster that trusts this one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCluster {
    pub name: String,
}

impl RemoteCluster {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    pub fn backend_key(&self) -> String {
        backend::key(&["remote_clusters", &self.name])
    }
}
