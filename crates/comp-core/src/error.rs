//! Error handling for KubeComp
//!
//! Provides a unified error type and result type for use across all KubeComp
//! components. Per-workload and per-node errors are reported through this
//! type and never terminate the process; only initialization paths are
//! allowed to exit.

/// Result type alias for KubeComp operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for KubeComp
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration file or environment variable (fatal at boot)
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// The metric endpoint is unreachable or returned an unparseable result
    #[error("Metric unavailable: {0}")]
    MetricUnavailable(String),

    /// No metric descriptors are configured for this application family
    #[error("No metric configuration: {0}")]
    NoMetricConfig(String),

    /// The requested-direction slice tier has no free inventory
    #[error("No available tier: {0}")]
    NoAvailableTier(String),

    /// A new revision never became ready within the scaling timeout
    #[error("Scale timeout: {0}")]
    ScaleTimeout(String),

    /// No partition profile covers the aggregate slice demand
    #[error("No viable partition profile: {0}")]
    NoViableProfile(String),

    /// The partitioning agent reported failure for a reconfiguration
    #[error("Partition reconfiguration failed: {0}")]
    PartitionFailed(String),

    /// Scaling in would leave the workload without any revision
    #[error("Cannot scale in further: {0}")]
    CannotScaleInFurther(String),

    /// Optimistic-concurrency conflict on an orchestrator update
    #[error("Update conflict: {0}")]
    Conflict(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation aborted by process shutdown
    #[error("Operation canceled: {0}")]
    Canceled(String),

    /// Accelerator device library error
    #[error("Device error: {0}")]
    Device(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Kubernetes API errors
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a metric-unavailable error
    pub fn metric_unavailable(msg: impl Into<String>) -> Self {
        Self::MetricUnavailable(msg.into())
    }

    /// Create a no-metric-config error
    pub fn no_metric_config(msg: impl Into<String>) -> Self {
        Self::NoMetricConfig(msg.into())
    }

    /// Create a no-available-tier error
    pub fn no_available_tier(msg: impl Into<String>) -> Self {
        Self::NoAvailableTier(msg.into())
    }

    /// Create a scale-timeout error
    pub fn scale_timeout(msg: impl Into<String>) -> Self {
        Self::ScaleTimeout(msg.into())
    }

    /// Create a no-viable-profile error
    pub fn no_viable_profile(msg: impl Into<String>) -> Self {
        Self::NoViableProfile(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a canceled error
    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::Canceled(msg.into())
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is an orchestrator write conflict (409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Api(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }

    /// Check if this error is a missing-object response (404)
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Api(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Check if retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MetricUnavailable(_) | Error::Timeout(_) | Error::Io(_) => true,
            _ => self.is_conflict(),
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::MetricUnavailable(_) => "metric_unavailable",
            Error::NoMetricConfig(_) => "no_metric_config",
            Error::NoAvailableTier(_) => "no_available_tier",
            Error::ScaleTimeout(_) => "scale_timeout",
            Error::NoViableProfile(_) => "no_viable_profile",
            Error::PartitionFailed(_) => "partition_failed",
            Error::CannotScaleInFurther(_) => "cannot_scale_in",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::Canceled(_) => "canceled",
            Error::Device(_) => "device",
            Error::Internal(_) => "internal",
            Error::Api(_) => "api",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
        }
    }
}
