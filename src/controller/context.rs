//! # Reconciler Context
//!
//! Shared state handed to every reconcile: the resource store, the broker
//! client factory, configuration and per-resource error backoff.

use crate::config::ControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::error::ReconcilerError;
use crate::controller::store::{ResourceStore, StoreError};
use crate::crd::ServiceInstance;
use crate::osb::{OsbClient, OsbClientFactory};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Consecutive failures of one resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
    pub last_error: Instant,
}

impl BackoffState {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_secs, max_secs),
            error_count: 0,
            last_error: Instant::now(),
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Instant::now();
    }
}

pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub osb_factory: Arc<dyn OsbClientFactory>,
    pub config: ControllerConfig,
    /// Keyed by `kind/namespace/name`
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        osb_factory: Arc<dyn OsbClientFactory>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            osb_factory,
            config,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the error history of a resource after a clean reconcile
    pub fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }

    /// Build a broker client for an OSB backed instance.
    ///
    /// Namespaced brokers are looked up in the instance's namespace and keep
    /// their credentials there too. Cluster brokers name the Secret's namespace.
    pub async fn client_for_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Arc<dyn OsbClient>, ReconcilerError> {
        let Some(osb) = instance.spec.osb.as_ref() else {
            return Err(ReconcilerError::Invalid(
                "service isn't a backed by a service broker".to_string(),
            ));
        };
        let namespace = instance.namespace().unwrap_or_default();

        let (secret_namespace, secret_name) = if osb.namespaced {
            let broker = self
                .store
                .get_service_broker(&namespace, &osb.broker_name)
                .await?
                .ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "ServiceBroker {namespace}/{}",
                        osb.broker_name
                    ))
                })?;
            (namespace, broker.spec.credentials.name)
        } else {
            let broker = self
                .store
                .get_cluster_service_broker(&osb.broker_name)
                .await?
                .ok_or_else(|| {
                    StoreError::NotFound(format!("ClusterServiceBroker {}", osb.broker_name))
                })?;
            (
                broker.spec.credentials.namespace,
                broker.spec.credentials.name,
            )
        };

        let secret = self
            .store
            .get_secret(&secret_namespace, &secret_name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Secret {secret_namespace}/{secret_name}")))?;

        Ok(self.osb_factory.new_client_for_broker(&secret)?)
    }
}
