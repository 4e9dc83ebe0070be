//! Cached and direct access to pods and nodes.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Client,
    runtime::reflector::{ObjectRef, Store},
};

/// Reflector-backed read caches for the resources the controller consults
/// during scans. Cheap to clone; all clones observe the same cache.
#[derive(Clone)]
pub struct Listers {
    pub pods: Store<Pod>,
    pub nodes: Store<Node>,
}

impl Listers {
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    pub fn node_exists(&self, name: &str) -> bool {
        self.node(name).is_some()
    }
}

/// Direct pod lookup against the API server, used when the controller wants
/// higher confidence than the cache can give before destroying state.
#[async_trait]
pub trait PodQuerier: Send + Sync {
    /// `Ok(None)` means the pod definitively does not exist. Errors mean the
    /// state could not be determined and callers should assume the pod is
    /// still there.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error>;
}

pub struct ApiPodQuerier {
    client: Client,
}

impl ApiPodQuerier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodQuerier for ApiPodQuerier {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }
}
