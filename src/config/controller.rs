//! # Reconciler Configuration
//!
//! Broker client, requeue and backoff settings loaded from environment variables.

use super::env_var_or_default;
use crate::constants::{
    DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS, DEFAULT_OSB_API_VERSION,
    DEFAULT_OSB_POLL_INTERVAL_SECS, DEFAULT_OSB_REQUEST_TIMEOUT_SECS,
    DEFAULT_RECONCILE_CONCURRENCY, DEFAULT_RESYNC_INTERVAL_SECS,
};
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Value of the `X-Broker-API-Version` header
    pub osb_api_version: String,
    /// Upper bound for a single broker HTTP call (seconds)
    pub osb_request_timeout_secs: u64,
    /// Requeue delay while an async broker operation is pending (seconds)
    pub osb_poll_interval_secs: u64,
    /// Requeue delay for settled resources (seconds)
    pub resync_interval_secs: u64,
    /// Smallest error backoff (seconds)
    pub backoff_min_secs: u64,
    /// Largest error backoff (seconds)
    pub backoff_max_secs: u64,
    /// Keys reconciled in parallel per controller
    pub reconcile_concurrency: u16,
    /// Image used for route service proxy deployments.
    /// Route services cannot be reconciled without it.
    pub route_service_proxy_image: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            osb_api_version: DEFAULT_OSB_API_VERSION.to_string(),
            osb_request_timeout_secs: DEFAULT_OSB_REQUEST_TIMEOUT_SECS,
            osb_poll_interval_secs: DEFAULT_OSB_POLL_INTERVAL_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            route_service_proxy_image: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            osb_api_version: env_var_or_default(
                "OSB_API_VERSION",
                DEFAULT_OSB_API_VERSION.to_string(),
            ),
            osb_request_timeout_secs: env_var_or_default(
                "OSB_REQUEST_TIMEOUT_SECS",
                DEFAULT_OSB_REQUEST_TIMEOUT_SECS,
            ),
            osb_poll_interval_secs: env_var_or_default(
                "OSB_POLL_INTERVAL_SECS",
                DEFAULT_OSB_POLL_INTERVAL_SECS,
            ),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            backoff_min_secs: env_var_or_default("BACKOFF_MIN_SECS", DEFAULT_BACKOFF_MIN_SECS),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            reconcile_concurrency: env_var_or_default(
                "RECONCILE_CONCURRENCY",
                DEFAULT_RECONCILE_CONCURRENCY,
            ),
            route_service_proxy_image: std::env::var("ROUTE_SERVICE_PROXY_IMAGE")
                .ok()
                .filter(|image| !image.trim().is_empty()),
        }
    }

    pub fn osb_request_timeout(&self) -> Duration {
        Duration::from_secs(self.osb_request_timeout_secs)
    }

    pub fn osb_poll_interval(&self) -> Duration {
        Duration::from_secs(self.osb_poll_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}
