//! Scale applier
//!
//! Realizes a scale decision against the serving object: revise the pod
//! template, wait for the new revision to become ready, rebalance traffic
//! across the retained revisions, and retire the superseded one.

use crate::decider::{ScaleDecision, WorkloadSnapshot};
use crate::traffic::rebalance;
use chrono::{SecondsFormat, Utc};
use comp_core::labels::{SLO_LABEL, UPDATED_AT_ANNOTATION};
use comp_core::{Error, Result, ScaleKind};
use comp_kube::WorkloadApi;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Applies scale decisions to workload services
pub struct ScaleApplier {
    workloads: Arc<dyn WorkloadApi>,
    scale_timeout: Duration,
    revision_grace: Duration,
}

impl ScaleApplier {
    pub fn new(
        workloads: Arc<dyn WorkloadApi>,
        scale_timeout: Duration,
        revision_grace: Duration,
    ) -> Self {
        Self {
            workloads,
            scale_timeout,
            revision_grace,
        }
    }

    /// Apply a non-trivial decision.
    ///
    /// Up/down/out revise the template and wait for the new revision; in
    /// skips straight to traffic rebalancing. Up/down/in retire the
    /// superseded revision afterwards, out keeps every revision serving.
    pub async fn apply(
        &self,
        decision: &ScaleDecision,
        requirements: Option<&ResourceRequirements>,
        snapshot: &WorkloadSnapshot,
    ) -> Result<()> {
        let kind = decision.kind();
        match kind {
            ScaleKind::Up | ScaleKind::Down | ScaleKind::Out => {
                let requirements = requirements
                    .ok_or_else(|| Error::internal("scale decision without resource record"))?;
                self.revise_template(snapshot, requirements).await?;
            }
            ScaleKind::In => {}
            ScaleKind::None => return Ok(()),
        }

        self.rebalance_traffic(kind, snapshot).await?;

        if matches!(kind, ScaleKind::Up | ScaleKind::Down | ScaleKind::In) {
            self.workloads
                .delete_revision(&snapshot.revision, self.revision_grace)
                .await?;
            info!(
                service = %snapshot.service,
                revision = %snapshot.revision,
                "superseded revision retired"
            );
        }

        Ok(())
    }

    async fn revise_template(
        &self,
        snapshot: &WorkloadSnapshot,
        requirements: &ResourceRequirements,
    ) -> Result<()> {
        let mut service = self.workloads.get_service(&snapshot.service).await?;
        let previous = service.latest_ready_revision().map(str::to_string);

        let container = service
            .first_container_mut()
            .ok_or_else(|| Error::internal(format!("service {} has no container", snapshot.service)))?;
        container.resources = Some(requirements.clone());

        if let Some(slo) = snapshot.primary_slo() {
            service
                .template_labels_mut()
                .insert(SLO_LABEL.to_string(), slo.to_string());
        }

        // fresh stamp so the orchestrator materializes a new revision even
        // when the template is otherwise unchanged (scale-out)
        service
            .spec
            .template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                UPDATED_AT_ANNOTATION.to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            );

        self.workloads.update_service(&service).await?;

        let ready = self
            .workloads
            .wait_for_new_ready_revision(&snapshot.service, previous.as_deref(), self.scale_timeout)
            .await?;
        info!(service = %snapshot.service, revision = %ready, "new revision ready");
        Ok(())
    }

    async fn rebalance_traffic(&self, kind: ScaleKind, snapshot: &WorkloadSnapshot) -> Result<()> {
        let revisions = self.workloads.list_revisions(&snapshot.service).await?;
        let superseded = match kind {
            ScaleKind::Out => None,
            _ => Some(snapshot.revision.as_str()),
        };
        let targets = rebalance(kind, &revisions, superseded)?;

        let mut service = self.workloads.get_service(&snapshot.service).await?;
        service.spec.traffic = targets;
        self.workloads.update_service(&service).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decider::{ResourceDefaults, ScaleDecider};
    use crate::registry::SliceTierRegistry;
    use comp_core::tier::SliceTier;
    use comp_kube::mock::{node_fixture, MockCluster, MockWorkloads};

    fn snapshot(service: &str, revision: &str, current: &str) -> WorkloadSnapshot {
        WorkloadSnapshot {
            service: service.into(),
            revision: revision.into(),
            pod: format!("{}-deployment-abc", revision),
            current: SliceTier::parse(current).unwrap(),
            metrics: Vec::new(),
        }
    }

    fn decider() -> ScaleDecider {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(node_fixture(
            "node-a",
            &[("nvidia.com/mig-3g.20gb", 2), ("nvidia.com/mig-2g.10gb", 2)],
            &[],
        ));
        ScaleDecider::new(
            Arc::new(SliceTierRegistry::new(cluster)),
            ResourceDefaults {
                cpu: "1".into(),
                memory: "10Gi".into(),
            },
        )
    }

    fn applier(workloads: Arc<MockWorkloads>) -> ScaleApplier {
        ScaleApplier::new(
            workloads,
            Duration::from_secs(600),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_scale_up_end_to_end() {
        let workloads = Arc::new(MockWorkloads::new());
        workloads.add_service("llama", Some("nvidia.com/mig-2g.10gb"));

        let decider = decider();
        let decision = ScaleDecision::Up(SliceTier::parse("nvidia.com/mig-3g.20gb").unwrap());
        let requirements = decider.requirements(&decision);

        applier(workloads.clone())
            .apply(
                &decision,
                requirements.as_ref(),
                &snapshot("llama", "llama-00001", "nvidia.com/mig-2g.10gb"),
            )
            .await
            .unwrap();

        // old revision retired with the configured grace
        assert_eq!(
            workloads.deleted_revisions(),
            vec![("llama-00001".to_string(), Duration::from_secs(300))]
        );
        // traffic moved entirely to the new revision
        let service = workloads.service("llama").unwrap();
        let traffic = &service.spec.traffic;
        assert_eq!(traffic.len(), 1);
        assert_eq!(traffic[0].revision_name.as_deref(), Some("llama-00002"));
        assert_eq!(traffic[0].percent, Some(100));
        // template now requests the larger slice
        let requests = service.spec.template.spec.pod_spec.containers[0]
            .resources
            .clone()
            .unwrap()
            .requests
            .unwrap();
        assert!(requests.contains_key("nvidia.com/mig-3g.20gb"));
        assert!(!requests.contains_key("nvidia.com/mig-2g.10gb"));
    }

    #[tokio::test]
    async fn test_scale_out_keeps_all_revisions() {
        let workloads = Arc::new(MockWorkloads::new());
        workloads.add_service("llama", Some("nvidia.com/mig-2g.10gb"));

        let decider = decider();
        let decision = ScaleDecision::Out(SliceTier::parse("nvidia.com/mig-2g.10gb").unwrap());
        let requirements = decider.requirements(&decision);

        applier(workloads.clone())
            .apply(
                &decision,
                requirements.as_ref(),
                &snapshot("llama", "llama-00001", "nvidia.com/mig-2g.10gb"),
            )
            .await
            .unwrap();

        // nothing deleted; both revisions split traffic
        assert!(workloads.deleted_revisions().is_empty());
        let service = workloads.service("llama").unwrap();
        let percents: Vec<i64> = service
            .spec
            .traffic
            .iter()
            .filter_map(|t| t.percent)
            .collect();
        assert_eq!(percents, vec![50, 50]);
    }

    #[tokio::test]
    async fn test_scale_in_skips_template_revision() {
        let workloads = Arc::new(MockWorkloads::new());
        workloads.add_service("llama", Some("nvidia.com/mig-2g.10gb"));

        // materialize a second revision via a template change
        let mut service = workloads.get_service("llama").await.unwrap();
        service
            .template_labels_mut()
            .insert("rev".to_string(), "two".to_string());
        workloads.update_service(&service).await.unwrap();
        assert_eq!(workloads.revision_names("llama").len(), 2);

        applier(workloads.clone())
            .apply(
                &ScaleDecision::In,
                None,
                &snapshot("llama", "llama-00001", "nvidia.com/mig-2g.10gb"),
            )
            .await
            .unwrap();

        assert_eq!(workloads.revision_names("llama"), vec!["llama-00002"]);
        let service = workloads.service("llama").unwrap();
        assert_eq!(
            service.spec.traffic[0].revision_name.as_deref(),
            Some("llama-00002")
        );
        assert_eq!(service.spec.traffic[0].percent, Some(100));
    }

    #[tokio::test]
    async fn test_scale_in_on_last_revision_fails() {
        let workloads = Arc::new(MockWorkloads::new());
        workloads.add_service("llama", Some("nvidia.com/mig-2g.10gb"));

        let err = applier(workloads.clone())
            .apply(
                &ScaleDecision::In,
                None,
                &snapshot("llama", "llama-00001", "nvidia.com/mig-2g.10gb"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CannotScaleInFurther(_)));
        assert!(workloads.deleted_revisions().is_empty());
    }
}
