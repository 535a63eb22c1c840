//! Metric fetcher
//!
//! Reads the per-family metric descriptors from the autoscaler config map,
//! substitutes the pod name into each query template, and fetches the
//! scalar result from the time-series endpoint. An empty result set is a
//! legal NaN ("metric not produced yet"); endpoint failures surface as
//! `MetricUnavailable`.

use async_trait::async_trait;
use comp_core::labels::{app_family, APP_LABEL};
use comp_core::{Error, Result};
use comp_kube::util::pod_label;
use comp_kube::ConfigApi;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Placeholder replaced by the pod name in query templates
pub const POD_PLACEHOLDER: &str = "%s";

/// One configured metric descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name (for logs and events)
    pub name: String,

    /// Query template with [`POD_PLACEHOLDER`] occurrences
    pub query: String,

    /// Service-level objective the metric is compared against
    pub slo: f64,

    /// Values below `slo * scaleDownFactor` ask for a smaller slice
    #[serde(rename = "scaleDownFactor")]
    pub scale_down_factor: f64,

    /// Values above `slo * scaleUpFactor` ask for a larger slice
    #[serde(rename = "scaleUpFactor")]
    pub scale_up_factor: f64,
}

impl MetricSpec {
    /// Validate the descriptor invariants
    pub fn validate(&self) -> Result<()> {
        if self.query.is_empty() {
            return Err(Error::config(format!("metric {} has an empty query", self.name)));
        }
        if self.slo <= 0.0 {
            return Err(Error::config(format!("metric {} needs a positive SLO", self.name)));
        }
        if !(0.0..1.0).contains(&self.scale_down_factor) {
            return Err(Error::config(format!(
                "metric {}: scaleDownFactor must be in [0, 1)",
                self.name
            )));
        }
        if self.scale_up_factor <= 1.0 {
            return Err(Error::config(format!(
                "metric {}: scaleUpFactor must be above 1",
                self.name
            )));
        }
        Ok(())
    }

    /// Substitute every placeholder occurrence with the pod name
    pub fn query_for(&self, pod_name: &str) -> String {
        self.query.replace(POD_PLACEHOLDER, pod_name)
    }
}

/// A fetched metric value with its descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub spec: MetricSpec,
    pub value: f64,
}

/// Scalar query endpoint
#[async_trait]
pub trait MetricBackend: Send + Sync {
    /// Evaluate a query and return its scalar result; NaN when the query
    /// produced no samples.
    async fn query_scalar(&self, query: &str) -> Result<f64>;
}

/// Prometheus HTTP query API backend
pub struct PrometheusBackend {
    endpoint: String,
    client: reqwest::Client,
}

impl PrometheusBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetricBackend for PrometheusBackend {
    async fn query_scalar(&self, query: &str) -> Result<f64> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| Error::metric_unavailable(format!("query request failed: {}", e)))?;

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::metric_unavailable(format!("malformed query response: {}", e)))?;

        scalar_from_response(&body)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: QueryData,
}

#[derive(Debug, Default, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    #[serde(default)]
    #[allow(dead_code)]
    metric: HashMap<String, String>,
    /// `[timestamp, stringified float]`
    value: (f64, String),
}

fn scalar_from_response(response: &QueryResponse) -> Result<f64> {
    match response.data.result.last() {
        Some(sample) => sample
            .value
            .1
            .parse()
            .map_err(|e| Error::metric_unavailable(format!("unparseable sample value: {}", e))),
        None => Ok(f64::NAN),
    }
}

/// Per-pod metric collection
#[async_trait]
pub trait MetricFetcher: Send + Sync {
    /// Fetch every configured metric for a pod
    async fn fetch(&self, pod: &Pod) -> Result<Vec<MetricSample>>;
}

/// Fetcher reading descriptors from the autoscaler config map
pub struct ConfigMapFetcher {
    configs: Arc<dyn ConfigApi>,
    backend: Arc<dyn MetricBackend>,
    namespace: String,
    config_map: String,
}

impl ConfigMapFetcher {
    pub fn new(
        configs: Arc<dyn ConfigApi>,
        backend: Arc<dyn MetricBackend>,
        namespace: impl Into<String>,
        config_map: impl Into<String>,
    ) -> Self {
        Self {
            configs,
            backend,
            namespace: namespace.into(),
            config_map: config_map.into(),
        }
    }

    fn specs_for(&self, data: &std::collections::BTreeMap<String, String>, family: &str) -> Result<Vec<MetricSpec>> {
        let raw = data.get(family).ok_or_else(|| {
            Error::no_metric_config(format!("no metric entry for family {}", family))
        })?;
        let specs: Vec<MetricSpec> = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("malformed metric entry for {}: {}", family, e)))?;
        for spec in &specs {
            spec.validate()?;
        }
        Ok(specs)
    }
}

#[async_trait]
impl MetricFetcher for ConfigMapFetcher {
    async fn fetch(&self, pod: &Pod) -> Result<Vec<MetricSample>> {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let family = pod_label(pod, APP_LABEL)
            .and_then(app_family)
            .ok_or_else(|| {
                Error::no_metric_config(format!("pod {} has no app label", pod_name))
            })?;

        let data = match self.configs.config_map(&self.namespace, &self.config_map).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Err(Error::no_metric_config(format!(
                    "config map {} not found",
                    self.config_map
                )))
            }
            Err(e) => return Err(e),
        };

        let specs = self.specs_for(&data, family)?;
        let mut samples = Vec::with_capacity(specs.len());
        for spec in specs {
            let query = spec.query_for(pod_name);
            let value = self.backend.query_scalar(&query).await?;
            debug!(pod = pod_name, metric = %spec.name, value, "fetched metric");
            samples.push(MetricSample { spec, value });
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comp_kube::mock::{MockCluster, PodBuilder};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const METRIC_ENTRY: &str = r#"
- name: mean_time_per_token
  query: increase(request_duration_sum{pod="%s"}[1m])/increase(request_duration_count{pod="%s"}[1m])
  slo: 0.4
  scaleDownFactor: 0.5
  scaleUpFactor: 1.5
"#;

    struct StaticBackend {
        value: f64,
        queries: Mutex<Vec<String>>,
    }

    impl StaticBackend {
        fn new(value: f64) -> Self {
            Self {
                value,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MetricBackend for StaticBackend {
        async fn query_scalar(&self, query: &str) -> Result<f64> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.value)
        }
    }

    fn fetcher_with(
        entry_key: &str,
        backend: Arc<dyn MetricBackend>,
    ) -> (ConfigMapFetcher, Arc<MockCluster>) {
        let cluster = Arc::new(MockCluster::new());
        let mut data = BTreeMap::new();
        data.insert(entry_key.to_string(), METRIC_ENTRY.to_string());
        cluster.add_config_map("default", "autoscaler-config", data);
        (
            ConfigMapFetcher::new(cluster.clone(), backend, "default", "autoscaler-config"),
            cluster,
        )
    }

    #[test]
    fn test_query_substitution() {
        let spec = MetricSpec {
            name: "m".into(),
            query: "rate(x{pod=\"%s\"}[1m]) / rate(y{pod=\"%s\"}[1m])".into(),
            slo: 1.0,
            scale_down_factor: 0.5,
            scale_up_factor: 1.5,
        };
        let query = spec.query_for("llama-00001-deployment-abc");
        assert!(!query.contains(POD_PLACEHOLDER));
        assert_eq!(query.matches("llama-00001-deployment-abc").count(), 2);
    }

    #[test]
    fn test_spec_validation() {
        let mut spec = MetricSpec {
            name: "m".into(),
            query: "up".into(),
            slo: 0.4,
            scale_down_factor: 0.5,
            scale_up_factor: 1.5,
        };
        assert!(spec.validate().is_ok());

        spec.slo = 0.0;
        assert!(spec.validate().is_err());
        spec.slo = 0.4;

        spec.scale_down_factor = 1.0;
        assert!(spec.validate().is_err());
        spec.scale_down_factor = 0.5;

        spec.scale_up_factor = 1.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_scalar_from_response() {
        let body: QueryResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{"pod":"p"},"value":[1712000000.1,"0.82"]}]}}"#,
        )
        .unwrap();
        assert_eq!(scalar_from_response(&body).unwrap(), 0.82);

        let empty: QueryResponse =
            serde_json::from_str(r#"{"data":{"result":[]}}"#).unwrap();
        assert!(scalar_from_response(&empty).unwrap().is_nan());

        let bad: QueryResponse = serde_json::from_str(
            r#"{"data":{"result":[{"metric":{},"value":[1.0,"not-a-number"]}]}}"#,
        )
        .unwrap();
        assert!(matches!(
            scalar_from_response(&bad).unwrap_err(),
            Error::MetricUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_resolves_family_and_substitutes() {
        let backend = Arc::new(StaticBackend::new(0.8));
        let (fetcher, _cluster) = fetcher_with("llama", backend.clone());

        let pod = PodBuilder::new("llama-00001-deployment-abc")
            .label(APP_LABEL, "llama-00001")
            .build();

        let samples = fetcher.fetch(&pod).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 0.8);
        assert_eq!(samples[0].spec.slo, 0.4);

        let queries = backend.queries.lock().unwrap();
        assert!(queries[0].contains("pod=\"llama-00001-deployment-abc\""));
    }

    #[tokio::test]
    async fn test_fetch_without_family_config() {
        let backend = Arc::new(StaticBackend::new(0.8));
        let (fetcher, _cluster) = fetcher_with("llama", backend);

        let pod = PodBuilder::new("bert-00001")
            .label(APP_LABEL, "bert-00001")
            .build();
        let err = fetcher.fetch(&pod).await.unwrap_err();
        assert!(matches!(err, Error::NoMetricConfig(_)));

        let unlabeled = PodBuilder::new("stray").build();
        let err = fetcher.fetch(&unlabeled).await.unwrap_err();
        assert!(matches!(err, Error::NoMetricConfig(_)));
    }

    #[tokio::test]
    async fn test_fetch_with_missing_config_map() {
        let cluster = Arc::new(MockCluster::new());
        let fetcher = ConfigMapFetcher::new(
            cluster,
            Arc::new(StaticBackend::new(0.8)),
            "default",
            "autoscaler-config",
        );
        let pod = PodBuilder::new("llama-1").label(APP_LABEL, "llama-1").build();
        let err = fetcher.fetch(&pod).await.unwrap_err();
        assert!(matches!(err, Error::NoMetricConfig(_)));
    }
}
