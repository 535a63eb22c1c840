//! Pod preprocessor
//!
//! Fast hook over pod-create events. Pods whose template hash matches a
//! pending re-pin queued by the reconfigurator get the node-affinity label
//! pointing at their original node; everything else is just marked
//! preprocessed so the scheduler can run. Handling is serialized through an
//! internal FIFO channel; update conflicts requeue.

use comp_core::labels::{NODE_AFFINITY_LABEL, PREPROCESS_DONE, PREPROCESS_LABEL};
use comp_core::{PinQueue, Result};
use comp_kube::util::{pod_label, pod_template_hash, PodRef};
use comp_kube::PodApi;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The pod preprocessor
pub struct PodPreprocessor {
    pods: Arc<dyn PodApi>,
    pins: Arc<PinQueue>,
}

impl PodPreprocessor {
    pub fn new(pods: Arc<dyn PodApi>, pins: Arc<PinQueue>) -> Self {
        Self { pods, pins }
    }

    /// Watch pod creations and drain them serially until shutdown
    pub async fn run(&self, client: kube::Client, cancel: CancellationToken) -> Result<()> {
        let api: Api<Pod> = Api::all(client);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));
        let (tx, mut rx) = mpsc::unbounded_channel::<PodRef>();

        info!("pod preprocessor watching pod creations");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(pod)))
                    | Ok(Some(watcher::Event::InitApply(pod))) => {
                        if pod_label(&pod, PREPROCESS_LABEL).is_none() {
                            let _ = tx.send(PodRef::from_pod(&pod));
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        warn!("pod watch error, retrying: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
                Some(pod_ref) = rx.recv() => {
                    self.handle(&pod_ref, &tx).await;
                }
            }
        }
    }

    /// Preprocess one pod. Idempotent: a pod that already carries the
    /// marker is left untouched.
    pub async fn handle(&self, pod_ref: &PodRef, requeue: &mpsc::UnboundedSender<PodRef>) {
        let pod = match self.pods.get(&pod_ref.namespace, &pod_ref.name).await {
            Ok(pod) => pod,
            Err(e) => {
                debug!(pod = %pod_ref, "pod not preprocessable: {}", e);
                return;
            }
        };

        if pod_label(&pod, PREPROCESS_LABEL).is_some() {
            return;
        }

        if let Some(hash) = pod_template_hash(&pod).map(str::to_string) {
            if let Some(node) = self.pins.first(&hash) {
                if self.pin_to_node(&pod, &node).await {
                    self.pins.pop_first(&hash);
                    info!(pod = %pod_ref, node = %node, "pod re-pinned to original node");
                } else {
                    // conflicting update: try again in FIFO order
                    let _ = requeue.send(pod_ref.clone());
                }
                return;
            }
        }

        if let Err(e) = self.mark_preprocessed(pod_ref).await {
            warn!(pod = %pod_ref, "failed to mark pod preprocessed: {}", e);
        }
    }

    /// Atomically set the preprocessed marker and the affinity target.
    /// Returns false when the update conflicted and should be retried.
    async fn pin_to_node(&self, pod: &Pod, node: &str) -> bool {
        let mut pinned = pod.clone();
        let labels = pinned.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(PREPROCESS_LABEL.to_string(), PREPROCESS_DONE.to_string());
        labels.insert(NODE_AFFINITY_LABEL.to_string(), node.to_string());

        match self.pods.update(&pinned).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    pod = %PodRef::from_pod(pod),
                    "re-pin update failed, requeueing: {}",
                    e
                );
                false
            }
        }
    }

    async fn mark_preprocessed(&self, pod_ref: &PodRef) -> Result<()> {
        self.pods
            .patch_labels(
                &pod_ref.namespace,
                &pod_ref.name,
                BTreeMap::from([(PREPROCESS_LABEL.to_string(), PREPROCESS_DONE.to_string())]),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comp_core::labels::POD_TEMPLATE_HASH_LABEL;
    use comp_kube::mock::{MockCluster, PodBuilder};

    fn preprocessor(cluster: Arc<MockCluster>, pins: Arc<PinQueue>) -> PodPreprocessor {
        PodPreprocessor::new(cluster, pins)
    }

    fn channel() -> (
        mpsc::UnboundedSender<PodRef>,
        mpsc::UnboundedReceiver<PodRef>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_replacement_pod_is_re_pinned() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod(
            PodBuilder::new("replacement")
                .label(POD_TEMPLATE_HASH_LABEL, "abcd")
                .build(),
        );
        let pins = Arc::new(PinQueue::new());
        pins.push("abcd", "node-n");

        let preprocessor = preprocessor(cluster.clone(), pins.clone());
        let (tx, mut rx) = channel();
        preprocessor
            .handle(&PodRef::new("replacement", "default"), &tx)
            .await;

        let labels = cluster.pod("default", "replacement").unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get(PREPROCESS_LABEL).map(String::as_str), Some("done"));
        assert_eq!(
            labels.get(NODE_AFFINITY_LABEL).map(String::as_str),
            Some("node-n")
        );
        // the pin entry drained
        assert!(pins.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrelated_pod_is_only_marked() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod(
            PodBuilder::new("fresh")
                .label(POD_TEMPLATE_HASH_LABEL, "zzzz")
                .build(),
        );
        let pins = Arc::new(PinQueue::new());
        pins.push("abcd", "node-n");

        let preprocessor = preprocessor(cluster.clone(), pins.clone());
        let (tx, _rx) = channel();
        preprocessor.handle(&PodRef::new("fresh", "default"), &tx).await;

        let labels = cluster.pod("default", "fresh").unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get(PREPROCESS_LABEL).map(String::as_str), Some("done"));
        assert!(!labels.contains_key(NODE_AFFINITY_LABEL));
        // the unrelated pin stays queued
        assert_eq!(pins.first("abcd").as_deref(), Some("node-n"));
    }

    #[tokio::test]
    async fn test_preprocessing_is_idempotent() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod(
            PodBuilder::new("done-pod")
                .label(PREPROCESS_LABEL, PREPROCESS_DONE)
                .label(POD_TEMPLATE_HASH_LABEL, "abcd")
                .build(),
        );
        let pins = Arc::new(PinQueue::new());
        pins.push("abcd", "node-n");

        let preprocessor = preprocessor(cluster.clone(), pins.clone());
        let (tx, _rx) = channel();

        let before = cluster.pod("default", "done-pod").unwrap();
        preprocessor.handle(&PodRef::new("done-pod", "default"), &tx).await;
        preprocessor.handle(&PodRef::new("done-pod", "default"), &tx).await;
        let after = cluster.pod("default", "done-pod").unwrap();

        // nothing changed and the pin was not consumed
        assert_eq!(before, after);
        assert_eq!(pins.first("abcd").as_deref(), Some("node-n"));
    }

    #[tokio::test]
    async fn test_conflict_requeues_in_fifo_order() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod(
            PodBuilder::new("replacement")
                .label(POD_TEMPLATE_HASH_LABEL, "abcd")
                .build(),
        );
        let pins = Arc::new(PinQueue::new());
        pins.push("abcd", "node-n");

        let preprocessor = preprocessor(cluster.clone(), pins.clone());
        let (tx, mut rx) = channel();

        cluster.fail_next_pod_update();
        let pod_ref = PodRef::new("replacement", "default");
        preprocessor.handle(&pod_ref, &tx).await;

        // pin kept, pod requeued
        assert_eq!(pins.first("abcd").as_deref(), Some("node-n"));
        let requeued = rx.try_recv().unwrap();
        assert_eq!(requeued, pod_ref);

        // the retry succeeds
        preprocessor.handle(&requeued, &tx).await;
        assert!(pins.is_empty());
        let labels = cluster.pod("default", "replacement").unwrap().metadata.labels.unwrap();
        assert_eq!(
            labels.get(NODE_AFFINITY_LABEL).map(String::as_str),
            Some("node-n")
        );
    }
}
