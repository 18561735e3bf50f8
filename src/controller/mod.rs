//! # Controller
//!
//! Reconcilers for ServiceInstances, ServiceInstanceBindings and service
//! brokers, plus the primitives they share.
//!
//! Every reconcile reads the object fresh from the [`store::ResourceStore`],
//! works on a copy and writes status back only when it changed.

pub mod backoff;
pub mod conflict;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod names;
pub mod service_broker;
pub mod service_instance;
pub mod service_instance_binding;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{BackoffState, Context};
pub use error::ReconcilerError;
pub use store::{KubeStore, ResourceStore, StoreError};

use k8s_openapi::api::core::v1::Namespace;

/// When the object should be looked at again after a clean reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// A broker operation or a deletion is still in flight
    Poll,
    /// Settled; revisit on the periodic resync
    Resync,
    /// Gone, or waiting for the watch event our own write causes
    Never,
}

/// Missing and terminating namespaces are not reconciled
pub(crate) async fn is_namespace_terminating(
    store: &dyn ResourceStore,
    namespace: &str,
) -> Result<bool, StoreError> {
    Ok(store
        .get_namespace(namespace)
        .await?
        .is_none_or(|ns| is_terminating(&ns)))
}

fn is_terminating(namespace: &Namespace) -> bool {
    namespace.metadata.deletion_timestamp.is_some()
        || namespace
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Terminating")
}

/// View a broker call result the way the status propagators take it
pub(crate) fn broker_result<T>(
    result: &Result<T, crate::osb::OsbError>,
) -> Result<&T, &(dyn std::error::Error + 'static)> {
    result
        .as_ref()
        .map_err(|e| e as &(dyn std::error::Error + 'static))
}
