//! In-memory implementations of the cluster and workload seams
//!
//! Used by unit tests across the control-plane crates and by local
//! development without a cluster. The workload mock materializes a numbered
//! revision whenever a service template changes, mirroring the serving
//! controller closely enough for the applier and loop to be exercised
//! end to end.

use crate::cluster::{ConfigApi, NodeApi, PodApi};
use crate::serving::{Revision, RevisionSpec, RevisionTemplate, Service, ServiceSpec, ServiceStatus};
use crate::util::PodRef;
use crate::workload::WorkloadApi;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use comp_core::labels::{KNATIVE_REVISION_LABEL, KNATIVE_SERVICE_LABEL};
use comp_core::{Error, Result};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeSpec, NodeStatus, Pod, PodCondition, PodSpec, PodStatus,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Builder for pod fixtures
#[derive(Debug, Clone)]
pub struct PodBuilder {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    node: Option<String>,
    uid: Option<String>,
    slice_resource: Option<(String, i64)>,
    phase: String,
    ready: bool,
    deleting: bool,
}

impl PodBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            node: None,
            uid: None,
            slice_resource: None,
            phase: "Running".to_string(),
            ready: true,
            deleting: false,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Attach the serving labels a workload pod carries
    pub fn serving(mut self, service: &str, revision: &str) -> Self {
        self.labels
            .insert(KNATIVE_SERVICE_LABEL.to_string(), service.to_string());
        self.labels
            .insert(KNATIVE_REVISION_LABEL.to_string(), revision.to_string());
        self
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Request `count` of a slice resource in the first container
    pub fn slice(mut self, resource: impl Into<String>, count: i64) -> Self {
        self.slice_resource = Some((resource.into(), count));
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn deleting(mut self) -> Self {
        self.deleting = true;
        self
    }

    pub fn build(self) -> Pod {
        let mut requests = BTreeMap::new();
        if let Some((resource, count)) = &self.slice_resource {
            requests.insert(resource.clone(), Quantity(count.to_string()));
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                labels: if self.labels.is_empty() {
                    None
                } else {
                    Some(self.labels)
                },
                deletion_timestamp: if self.deleting {
                    Some(Time(Utc.timestamp_opt(0, 0).unwrap()))
                } else {
                    None
                },
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: self.node,
                containers: vec![Container {
                    name: "serving".to_string(),
                    resources: if requests.is_empty() {
                        None
                    } else {
                        Some(ResourceRequirements {
                            requests: Some(requests.clone()),
                            limits: Some(requests),
                            ..ResourceRequirements::default()
                        })
                    },
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some(self.phase),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if self.ready { "True" } else { "False" }.to_string(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
        }
    }
}

/// Build a node fixture with the given allocatable slice counts and labels
pub fn node_fixture(
    name: &str,
    allocatable: &[(&str, i64)],
    labels: &[(&str, &str)],
) -> Node {
    let allocatable: BTreeMap<String, Quantity> = allocatable
        .iter()
        .map(|(resource, count)| (resource.to_string(), Quantity(count.to_string())))
        .collect();
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: if labels.is_empty() { None } else { Some(labels) },
            ..ObjectMeta::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            allocatable: Some(allocatable),
            ..NodeStatus::default()
        }),
    }
}

#[derive(Default)]
struct WorkloadsInner {
    services: BTreeMap<String, Service>,
    revisions: Vec<Revision>,
    counters: BTreeMap<String, u32>,
    deleted: Vec<(String, Duration)>,
    clock: i64,
}

/// In-memory workload client
#[derive(Default)]
pub struct MockWorkloads {
    inner: Mutex<WorkloadsInner>,
}

impl MockWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service whose template requests one unit of
    /// `slice_resource`, along with its initial ready revision.
    pub fn add_service(&self, name: &str, slice_resource: Option<&str>) -> String {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("1".to_string()));
        requests.insert("memory".to_string(), Quantity("10Gi".to_string()));
        if let Some(resource) = slice_resource {
            requests.insert(resource.to_string(), Quantity("1".to_string()));
        }

        let spec = ServiceSpec {
            template: RevisionTemplate {
                metadata: None,
                spec: RevisionSpec {
                    pod_spec: PodSpec {
                        containers: vec![Container {
                            name: "serving".to_string(),
                            resources: Some(ResourceRequirements {
                                requests: Some(requests.clone()),
                                limits: Some(requests),
                                ..ResourceRequirements::default()
                            }),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    },
                    container_concurrency: None,
                    timeout_seconds: None,
                },
            },
            traffic: Vec::new(),
        };

        let mut inner = self.inner.lock().unwrap();
        let service = Service::new(name, spec);
        inner.services.insert(name.to_string(), service);
        Self::materialize_revision(&mut inner, name)
    }

    /// Register a prebuilt service object without creating a revision
    pub fn insert_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.inner.lock().unwrap().services.insert(name, service);
    }

    fn materialize_revision(inner: &mut WorkloadsInner, service_name: &str) -> String {
        let counter = inner.counters.entry(service_name.to_string()).or_insert(0);
        *counter += 1;
        let revision_name = format!("{}-{:05}", service_name, counter);

        inner.clock += 1;
        let created = Time(Utc.timestamp_opt(inner.clock, 0).unwrap());

        let template_spec = inner.services[service_name].spec.template.spec.clone();
        let namespace = inner.services[service_name].metadata.namespace.clone();

        let mut revision = Revision::new(&revision_name, template_spec);
        revision.metadata.namespace = namespace;
        revision.metadata.creation_timestamp = Some(created);
        revision.metadata.labels = Some(BTreeMap::from([(
            KNATIVE_SERVICE_LABEL.to_string(),
            service_name.to_string(),
        )]));
        inner.revisions.push(revision);

        let service = inner.services.get_mut(service_name).unwrap();
        let status = service.status.get_or_insert_with(ServiceStatus::default);
        status.latest_created_revision_name = Some(revision_name.clone());
        status.latest_ready_revision_name = Some(revision_name.clone());
        revision_name
    }

    /// The current state of a registered service
    pub fn service(&self, name: &str) -> Option<Service> {
        self.inner.lock().unwrap().services.get(name).cloned()
    }

    /// Names of a service's live revisions, in creation order
    pub fn revision_names(&self, service: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .revisions
            .iter()
            .filter(|r| {
                r.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(KNATIVE_SERVICE_LABEL))
                    .map(String::as_str)
                    == Some(service)
            })
            .filter_map(|r| r.metadata.name.clone())
            .collect()
    }

    /// Revisions deleted so far, with the grace period used
    pub fn deleted_revisions(&self) -> Vec<(String, Duration)> {
        self.inner.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl WorkloadApi for MockWorkloads {
    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.inner.lock().unwrap().services.values().cloned().collect())
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        self.inner
            .lock()
            .unwrap()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service {}", name)))
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("service without a name"))?;

        let mut inner = self.inner.lock().unwrap();
        let template_changed = match inner.services.get(&name) {
            Some(existing) => existing.spec.template != service.spec.template,
            None => return Err(Error::not_found(format!("service {}", name))),
        };

        let existing_status = inner.services.get(&name).and_then(|s| s.status.clone());
        let mut stored = service.clone();
        stored.status = existing_status;
        inner.services.insert(name.clone(), stored);

        if template_changed {
            Self::materialize_revision(&mut inner, &name);
        }

        Ok(inner.services.get(&name).cloned().unwrap())
    }

    async fn set_service_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let service = inner
            .services
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))?;
        service.set_label(key, value);
        Ok(())
    }

    async fn list_revisions(&self, service: &str) -> Result<Vec<Revision>> {
        let inner = self.inner.lock().unwrap();
        let mut revisions: Vec<Revision> = inner
            .revisions
            .iter()
            .filter(|r| {
                r.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(KNATIVE_SERVICE_LABEL))
                    .map(String::as_str)
                    == Some(service)
            })
            .cloned()
            .collect();
        revisions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Ok(revisions)
    }

    async fn delete_revision(&self, name: &str, grace: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .revisions
            .retain(|r| r.metadata.name.as_deref() != Some(name));
        inner.deleted.push((name.to_string(), grace));
        Ok(())
    }

    async fn wait_for_new_ready_revision(
        &self,
        service: &str,
        previous: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        let latest = inner
            .services
            .get(service)
            .and_then(|s| s.latest_ready_revision().map(str::to_string));
        match latest {
            Some(latest) if Some(latest.as_str()) != previous => Ok(latest),
            _ => Err(Error::scale_timeout(format!(
                "service {} produced no new ready revision within {:?}",
                service, timeout
            ))),
        }
    }
}

#[derive(Default)]
struct ClusterInner {
    pods: BTreeMap<(String, String), Pod>,
    nodes: BTreeMap<String, Node>,
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    deleted_pods: Vec<PodRef>,
}

/// In-memory pod/node/configmap store
#[derive(Default)]
pub struct MockCluster {
    inner: Mutex<ClusterInner>,
    fail_next_pod_update: AtomicBool,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.inner.lock().unwrap().pods.insert(key, pod);
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.inner.lock().unwrap().nodes.insert(name, node);
    }

    pub fn add_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.inner
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Make the next pod update fail with a conflict
    pub fn fail_next_pod_update(&self) {
        self.fail_next_pod_update.store(true, Ordering::SeqCst);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.inner
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.inner.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn deleted_pods(&self) -> Vec<PodRef> {
        self.inner.lock().unwrap().deleted_pods.clone()
    }

    fn match_selector(pod: &Pod, selector: &str) -> bool {
        selector.split(',').all(|clause| {
            match clause.split_once('=') {
                Some((key, value)) => pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(key.trim()))
                    .map(String::as_str)
                    == Some(value.trim()),
                None => false,
            }
        })
    }
}

#[async_trait]
impl PodApi for MockCluster {
    async fn list_labeled(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Pod>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pods
            .values()
            .filter(|pod| {
                namespace.map_or(true, |ns| pod.metadata.namespace.as_deref() == Some(ns))
            })
            .filter(|pod| Self::match_selector(pod, selector))
            .cloned()
            .collect())
    }

    async fn list_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pods
            .values()
            .filter(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(node)
            })
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pod(namespace, name)
            .ok_or_else(|| Error::not_found(format!("pod {}/{}", namespace, name)))
    }

    async fn update(&self, pod: &Pod) -> Result<Pod> {
        if self.fail_next_pod_update.swap(false, Ordering::SeqCst) {
            return Err(Error::conflict("simulated version skew"));
        }
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        let mut inner = self.inner.lock().unwrap();
        if !inner.pods.contains_key(&key) {
            return Err(Error::not_found(format!("pod {}/{}", key.0, key.1)));
        }
        inner.pods.insert(key, pod.clone());
        Ok(pod.clone())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.lock().unwrap();
        if inner.pods.remove(&key).is_none() {
            return Err(Error::not_found(format!("pod {}/{}", namespace, name)));
        }
        inner.deleted_pods.push(PodRef::new(name, namespace));
        Ok(())
    }

    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.lock().unwrap();
        let pod = inner
            .pods
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(format!("pod {}/{}", namespace, name)))?;
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
        Ok(())
    }
}

#[async_trait]
impl NodeApi for MockCluster {
    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.inner.lock().unwrap().nodes.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Node> {
        self.node(name)
            .ok_or_else(|| Error::not_found(format!("node {}", name)))
    }

    async fn update(&self, node: &Node) -> Result<Node> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(&name) {
            return Err(Error::not_found(format!("node {}", name)));
        }
        inner.nodes.insert(name, node.clone());
        Ok(node.clone())
    }

    async fn patch_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("node {}", name)))?;
        let node_labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            match value {
                Some(value) => {
                    node_labels.insert(key, value);
                }
                None => {
                    node_labels.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigApi for MockCluster {
    async fn config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        self.inner
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("configmap {}/{}", namespace, name)))
    }
}
