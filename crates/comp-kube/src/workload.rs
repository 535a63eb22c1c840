//! Workload client façade over the serving-object API
//!
//! Thin adapter the scale applier and autoscaler loop talk to instead of
//! the raw orchestrator client: list/get/update services, wait for a new
//! ready revision, list and delete revisions. Update conflicts are retried
//! here so callers never see version skew.

use crate::serving::{Revision, Service};
use crate::wait::wait_until;
use async_trait::async_trait;
use comp_core::labels::KNATIVE_SERVICE_LABEL;
use comp_core::{Error, Result};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll cadence while waiting for a revision to become ready
const READY_POLL: Duration = Duration::from_secs(1);

/// How often a conflicting update is retried before giving up
const CONFLICT_RETRIES: u32 = 5;

/// Backoff between conflict retries
const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

/// Serving-object operations used by the scaling path
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// List every workload service in the managed namespace
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Fetch one workload service
    async fn get_service(&self, name: &str) -> Result<Service>;

    /// Persist a mutated service, retrying on update conflicts
    async fn update_service(&self, service: &Service) -> Result<Service>;

    /// Merge one label onto a service
    async fn set_service_label(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// List a service's revisions ordered by creation time (most recent last)
    async fn list_revisions(&self, service: &str) -> Result<Vec<Revision>>;

    /// Delete one revision with the given grace period
    async fn delete_revision(&self, name: &str, grace: Duration) -> Result<()>;

    /// Wait until the service's latest ready revision differs from
    /// `previous`, returning the new revision name. Fails with
    /// [`Error::ScaleTimeout`] when the deadline passes.
    async fn wait_for_new_ready_revision(
        &self,
        service: &str,
        previous: Option<&str>,
        timeout: Duration,
    ) -> Result<String>;
}

/// Knative-backed workload client
#[derive(Clone)]
pub struct KnativeWorkloads {
    services: Api<Service>,
    revisions: Api<Revision>,
    cancel: CancellationToken,
}

impl KnativeWorkloads {
    pub fn new(client: kube::Client, namespace: &str, cancel: CancellationToken) -> Self {
        Self {
            services: Api::namespaced(client.clone(), namespace),
            revisions: Api::namespaced(client, namespace),
            cancel,
        }
    }
}

#[async_trait]
impl WorkloadApi for KnativeWorkloads {
    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.services.list(&ListParams::default()).await?.items)
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        Ok(self.services.get(name).await?)
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("service without a name"))?;

        let mut desired = service.clone();
        let mut attempt = 0;
        loop {
            match self
                .services
                .replace(name, &PostParams::default(), &desired)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e) => {
                    let err = Error::from(e);
                    attempt += 1;
                    if !err.is_conflict() || attempt > CONFLICT_RETRIES {
                        return Err(err);
                    }
                    warn!(service = name, attempt, "update conflict, retrying");
                    tokio::time::sleep(CONFLICT_BACKOFF).await;
                    // refresh the object version, keep the desired state
                    let current = self.services.get(name).await?;
                    desired.metadata.resource_version = current.metadata.resource_version;
                }
            }
        }
    }

    async fn set_service_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
        self.services
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_revisions(&self, service: &str) -> Result<Vec<Revision>> {
        let params =
            ListParams::default().labels(&format!("{}={}", KNATIVE_SERVICE_LABEL, service));
        let mut revisions = self.revisions.list(&params).await?.items;
        revisions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Ok(revisions)
    }

    async fn delete_revision(&self, name: &str, grace: Duration) -> Result<()> {
        let params = DeleteParams::default().grace_period(grace.as_secs() as u32);
        match self.revisions.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    debug!(revision = name, "revision already gone");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn wait_for_new_ready_revision(
        &self,
        service: &str,
        previous: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let result = wait_until(READY_POLL, Some(timeout), &self.cancel, || {
            let services = self.services.clone();
            let service = service.to_string();
            let previous = previous.map(str::to_string);
            async move {
                let current = services.get(&service).await?;
                match current.latest_ready_revision() {
                    Some(latest) if Some(latest) != previous.as_deref() => {
                        Ok(Some(latest.to_string()))
                    }
                    _ => Ok(None),
                }
            }
        })
        .await;

        match result {
            Err(Error::Timeout(_)) => Err(Error::scale_timeout(format!(
                "service {} produced no new ready revision within {:?}",
                service, timeout
            ))),
            other => other,
        }
    }
}
