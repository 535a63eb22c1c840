//! Knative serving CRD types
//!
//! Defines the `serving.knative.dev/v1` `Service` and `Revision` resources
//! with the fields the control plane reads and writes: the pod template the
//! applier revises, the traffic split the rebalancer rewrites, and the
//! latest-ready-revision status the readiness wait polls.

use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Knative Service: the serving object that owns revisions and routes
/// traffic among them
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    plural = "services",
    namespaced,
    status = "ServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Pod template; any change materializes a new revision
    pub template: RevisionTemplate,

    /// Traffic split across revisions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

/// The revision template embedded in a service spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTemplate {
    /// Template metadata (labels and annotations carried onto pods)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// Revision spec (pod spec plus serving knobs)
    pub spec: RevisionSpec,
}

/// Knative Revision: an immutable snapshot of a workload's pod template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Revision",
    plural = "revisions",
    namespaced,
    status = "RevisionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    /// The pod spec served by this revision
    #[serde(flatten)]
    pub pod_spec: PodSpec,

    /// Maximum in-flight requests per pod (0 = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,

    /// Request timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

/// One entry of a service's traffic split
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    /// Revision receiving this share
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    /// Percent of traffic, 0..=100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,

    /// Whether this target tracks the latest ready revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<bool>,

    /// Optional tag exposing a dedicated URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl TrafficTarget {
    /// Target a revision with a fixed percent
    pub fn fixed(revision: impl Into<String>, percent: i64) -> Self {
        Self {
            revision_name: Some(revision.into()),
            percent: Some(percent),
            latest_revision: Some(false),
            tag: None,
        }
    }
}

/// Observed state of a Knative Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Most recent revision that has passed readiness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,

    /// Most recent revision created from the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_created_revision_name: Option<String>,

    /// Traffic split currently programmed into the route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<Vec<TrafficTarget>>,

    /// External URL of the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Observed state of a Knative Revision
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    /// Generation most recently processed by the serving controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Service {
    /// Name of the latest ready revision, if any
    pub fn latest_ready_revision(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.latest_ready_revision_name.as_deref())
    }

    /// Read a label off the service object
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Set a label on the service object
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// Set an annotation on the service object
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// Mutable labels of the pod template, created on demand
    pub fn template_labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.spec
            .template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
    }

    /// Mutable reference to the first container of the pod template
    pub fn first_container_mut(&mut self) -> Option<&mut Container> {
        self.spec.template.spec.pod_spec.containers.first_mut()
    }
}

impl Revision {
    /// Creation timestamp used to order revisions
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }
}
