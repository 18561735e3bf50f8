//! # Error Policy
//!
//! Requeue decisions for failed reconciles and classification of the errors
//! the controller streams surface.

use crate::controller::{BackoffState, Context, ReconcilerError};
use crate::observability::metrics;
use kube::Resource;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Requeue a failed resource with its own Fibonacci backoff.
///
/// Backoff is tracked per `kind/namespace/name` so one broken resource does
/// not slow down the others. It is reset by the watch loop after a clean reconcile.
pub fn handle_reconciliation_error<K>(
    obj: Arc<K>,
    error: &ReconcilerError,
    ctx: Arc<Context>,
) -> Action
where
    K: Resource,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).into_owned();
    let name = obj.meta().name.as_deref().unwrap_or("unknown");
    let namespace = obj.meta().namespace.as_deref().unwrap_or_default();

    let span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconciliation_error",
        resource.kind = %kind,
        resource.name = name,
        resource.namespace = namespace,
        error = %error
    );
    let _guard = span.enter();

    error!("reconciliation failed: {error}");
    metrics::increment_reconciliation_errors(&kind);

    let (seconds, error_count) = next_backoff(&ctx, &backoff_key(&kind, namespace, name));
    info!(
        backoff_secs = seconds,
        error_count, "retrying after error backoff"
    );
    metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(seconds))
}

pub(crate) fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

fn next_backoff(ctx: &Context, key: &str) -> (u64, u32) {
    let (min, max) = (ctx.config.backoff_min_secs, ctx.config.backoff_max_secs);
    match ctx.backoff_states.lock() {
        Ok(mut states) => {
            prune_stale_backoffs(&mut states, Instant::now(), stale_after(max));
            let state = states
                .entry(key.to_string())
                .or_insert_with(|| BackoffState::new(min, max));
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("backoff state lock poisoned, using minimum backoff: {e}");
            (min, 0)
        }
    }
}

/// A failing resource is retried at least every `max` seconds. An entry idle
/// for several of those belongs to a resource that was deleted while failing.
fn stale_after(max_secs: u64) -> Duration {
    Duration::from_secs(max_secs.max(1).saturating_mul(4))
}

fn prune_stale_backoffs(
    states: &mut HashMap<String, BackoffState>,
    now: Instant,
    stale_after: Duration,
) {
    states.retain(|_, state| now.saturating_duration_since(state.last_error) < stale_after);
}

/// Broad class of an error reported by a controller's watch stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// RBAC revoked or token expired
    Unauthorized,
    /// Resource version too old; the watcher relists
    Expired,
    /// API server storage is (re)initializing
    Throttled,
    /// The object went away between event and reconcile
    NotFound,
    Other,
}

pub fn classify_watch_error(message: &str) -> WatchErrorKind {
    if message.contains("401") || message.contains("Unauthorized") {
        WatchErrorKind::Unauthorized
    } else if message.contains("410")
        || message.contains("too old resource version")
        || message.contains("Expired")
        || message.contains("Gone")
    {
        WatchErrorKind::Expired
    } else if message.contains("429")
        || message.contains("storage is (re)initializing")
        || message.contains("TooManyRequests")
    {
        WatchErrorKind::Throttled
    } else if message.contains("ObjectNotFound")
        || (message.contains("404") && message.contains("not found"))
    {
        WatchErrorKind::NotFound
    } else {
        WatchErrorKind::Other
    }
}

/// Log a controller stream error at the level its class deserves
pub fn log_watch_error(kind: &str, message: &str) {
    match classify_watch_error(message) {
        WatchErrorKind::Unauthorized => {
            error!(
                resource.kind = kind,
                "watch unauthorized, check the controller's ClusterRole and ServiceAccount: {message}"
            );
        }
        WatchErrorKind::Expired => {
            warn!(resource.kind = kind, "watch resource version expired, relisting");
        }
        WatchErrorKind::Throttled => {
            warn!(resource.kind = kind, "API server throttling watch: {message}");
        }
        WatchErrorKind::NotFound => {
            info!(resource.kind = kind, "object deleted before reconcile");
        }
        WatchErrorKind::Other => {
            error!(resource.kind = kind, "controller stream error: {message}");
        }
    }
}
