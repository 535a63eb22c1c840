//! Environment-driven settings for the control-plane processes
//!
//! All processes read the same environment surface; each binary uses the
//! subset it needs. Invalid values are fatal at boot.

use crate::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime settings shared by the control-plane binaries
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Autoscaler tick and exporter update interval
    pub scrape_interval: Duration,

    /// Namespace the managed workload services live in
    pub namespace: String,

    /// Workload-name substrings the autoscaler refuses to manage
    pub ignore_list: Vec<String>,

    /// Base URL of the metric query endpoint
    pub prometheus_url: String,

    /// CPU request/limit written into every new revision
    pub default_cpu: String,

    /// Memory request/limit written into every new revision
    pub default_memory: String,

    /// Name of the metric configuration object
    pub config_map_name: String,

    /// This process's pod name (informational, set by the downward API)
    pub pod_name: String,

    /// This process's pod namespace (downward API)
    pub pod_namespace: String,

    /// How long to wait for a new revision to become ready
    pub scale_timeout: Duration,

    /// Grace period used when deleting superseded revisions
    pub revision_grace: Duration,

    /// Bind address of the metrics exporter endpoint
    pub metrics_bind: SocketAddr,
}

impl Settings {
    /// Load settings from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an explicit lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let settings = Self {
            scrape_interval: seconds(&lookup, "METRICS_SCRAPE_INTERVAL", 10)?,
            namespace: lookup("NAMESPACE").unwrap_or_else(|| "default".to_string()),
            ignore_list: lookup("IGNORE_LIST")
                .unwrap_or_else(|| "autoscaler,dispatcher".to_string())
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
            prometheus_url: lookup("PROMETHEUS_URL").unwrap_or_else(|| {
                "http://prometheus-kube-prometheus-prometheus.monitoring.svc.cluster.local:9090/api/v1/query"
                    .to_string()
            }),
            default_cpu: lookup("DEFAULT_CPU").unwrap_or_else(|| "1".to_string()),
            default_memory: lookup("DEFAULT_MEMORY").unwrap_or_else(|| "10Gi".to_string()),
            config_map_name: lookup("CONFIG_MAP_NAME")
                .unwrap_or_else(|| "autoscaler-config".to_string()),
            pod_name: lookup("POD_NAME").unwrap_or_default(),
            pod_namespace: lookup("POD_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            scale_timeout: seconds(&lookup, "SCALE_TIMEOUT", 600)?,
            revision_grace: seconds(&lookup, "REVISION_GRACE_PERIOD", 300)?,
            metrics_bind: match lookup("METRICS_BIND_ADDR") {
                Some(addr) => addr.parse().map_err(|e| {
                    Error::config(format!("invalid METRICS_BIND_ADDR {:?}: {}", addr, e))
                })?,
                None => "0.0.0.0:8080".parse().unwrap(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.scrape_interval.is_zero() {
            return Err(Error::config("scrape interval must be positive"));
        }
        if self.scale_timeout.is_zero() {
            return Err(Error::config("scale timeout must be positive"));
        }
        if self.namespace.is_empty() {
            return Err(Error::config("namespace cannot be empty"));
        }
        if self.prometheus_url.is_empty() {
            return Err(Error::config("metric endpoint URL cannot be empty"));
        }
        Ok(())
    }

    /// Whether a workload name is on the ignore list
    pub fn is_ignored(&self, workload_name: &str) -> bool {
        self.ignore_list
            .iter()
            .any(|fragment| workload_name.contains(fragment))
    }
}

fn seconds(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration> {
    match lookup(key) {
        Some(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("invalid {} {:?}: {}", key, raw, e)))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(default)),
    }
}
