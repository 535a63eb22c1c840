//! Narrow cluster capabilities used by the control loops
//!
//! Each trait covers exactly what one loop needs from the cluster, so tests
//! can substitute the in-memory implementations from [`crate::mock`].

use async_trait::async_trait;
use comp_core::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use std::collections::BTreeMap;

/// Pod listing and mutation
#[async_trait]
pub trait PodApi: Send + Sync {
    /// List pods matching a label selector. `namespace = None` means all
    /// namespaces.
    async fn list_labeled(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Pod>>;

    /// List pods scheduled on a node, across all namespaces
    async fn list_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// Fetch one pod
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Replace one pod object (fails with a conflict on version skew)
    async fn update(&self, pod: &Pod) -> Result<Pod>;

    /// Delete one pod
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge labels into one pod
    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Node listing and mutation
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// List every node
    async fn list(&self) -> Result<Vec<Node>>;

    /// Fetch one node
    async fn get(&self, name: &str) -> Result<Node>;

    /// Replace one node object (fails with a conflict on version skew)
    async fn update(&self, node: &Node) -> Result<Node>;

    /// Merge labels into one node; `None` values remove the key
    async fn patch_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()>;
}

/// Configuration-object reads
#[async_trait]
pub trait ConfigApi: Send + Sync {
    /// Fetch the data section of a config map
    async fn config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;
}

/// Kube-client-backed implementation of the cluster capabilities
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl PodApi for KubeCluster {
    async fn list_labeled(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn list_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        Ok(self.pods(None).list(&params).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod> {
        Ok(self.pods(Some(namespace)).get(name).await?)
    }

    async fn update(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .pods(Some(namespace))
            .replace(name, &PostParams::default(), pod)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(Some(namespace))
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.pods(Some(namespace))
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeApi for KubeCluster {
    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.nodes().list(&ListParams::default()).await?.items)
    }

    async fn get(&self, name: &str) -> Result<Node> {
        Ok(self.nodes().get(name).await?)
    }

    async fn update(&self, node: &Node) -> Result<Node> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .nodes()
            .replace(name, &PostParams::default(), node)
            .await?)
    }

    async fn patch_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigApi for KubeCluster {
    async fn config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = api.get(name).await?;
        Ok(config_map.data.unwrap_or_default())
    }
}
