//! # Watch Loop
//!
//! Runs one kube-runtime [`Controller`] per reconciled kind. The controllers
//! give single-flight per key and at-least-once delivery; the reconcilers
//! read the object fresh by key every time.
//!
//! Cross-kind triggers:
//!
//! - a binding event re-runs the instance it references, so a deletion that
//!   was blocked by the binding can proceed
//! - an instance event re-runs every binding referencing it, so bindings
//!   waiting for the instance to become ready are picked up

use crate::config::ControllerConfig;
use crate::controller::{
    service_broker, service_instance, service_instance_binding, Context, ReconcilerError,
    Requeue,
};
use crate::crd::{ClusterServiceBroker, ServiceBroker, ServiceInstance, ServiceInstanceBinding};
use crate::observability::metrics;
use crate::runtime::error_policy::{backoff_key, handle_reconciliation_error, log_watch_error};
use crate::server::ServerState;
use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{
    Action, Config as ControllerSettings, Controller, Error as ControllerError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, Instrument, Span};

/// Start every controller and run them until a shutdown signal arrives
pub async fn run_watch_loop(
    client: Client,
    ctx: Arc<Context>,
    server_state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let settings = ControllerSettings::default().concurrency(ctx.config.reconcile_concurrency);

    let instances: Api<ServiceInstance> = Api::all(client.clone());
    let bindings: Api<ServiceInstanceBinding> = Api::all(client.clone());
    let brokers: Api<ServiceBroker> = Api::all(client.clone());
    let cluster_brokers: Api<ClusterServiceBroker> = Api::all(client);

    let instance_controller = Controller::new(instances.clone(), WatcherConfig::default())
        .with_config(settings.clone())
        .watches(bindings.clone(), WatcherConfig::default(), |binding| {
            let namespace = binding.namespace()?;
            Some(ObjectRef::new(&binding.spec.instance_ref.name).within(&namespace))
        })
        .shutdown_on_signal()
        .run(
            reconcile_service_instance,
            handle_reconciliation_error::<ServiceInstance>,
            Arc::clone(&ctx),
        )
        .for_each(|result| log_result("ServiceInstance", result));

    let binding_controller = Controller::new(bindings, WatcherConfig::default());
    let known_bindings = binding_controller.store();
    let binding_controller = binding_controller
        .with_config(settings.clone())
        .watches(instances, WatcherConfig::default(), move |instance| {
            let namespace = instance.namespace();
            let name = instance.name_any();
            known_bindings
                .state()
                .into_iter()
                .filter(|b| b.namespace() == namespace && b.spec.instance_ref.name == name)
                .map(|b| ObjectRef::from_obj(&*b))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(
            reconcile_service_instance_binding,
            handle_reconciliation_error::<ServiceInstanceBinding>,
            Arc::clone(&ctx),
        )
        .for_each(|result| log_result("ServiceInstanceBinding", result));

    let broker_controller = Controller::new(brokers, WatcherConfig::default())
        .with_config(settings.clone())
        .shutdown_on_signal()
        .run(
            reconcile_service_broker,
            handle_reconciliation_error::<ServiceBroker>,
            Arc::clone(&ctx),
        )
        .for_each(|result| log_result("ServiceBroker", result));

    let cluster_broker_controller = Controller::new(cluster_brokers, WatcherConfig::default())
        .with_config(settings)
        .shutdown_on_signal()
        .run(
            reconcile_cluster_service_broker,
            handle_reconciliation_error::<ClusterServiceBroker>,
            ctx,
        )
        .for_each(|result| log_result("ClusterServiceBroker", result));

    server_state.mark_ready();
    info!("controllers started: ServiceInstance, ServiceInstanceBinding, ServiceBroker, ClusterServiceBroker");

    futures::join!(
        instance_controller,
        binding_controller,
        broker_controller,
        cluster_broker_controller
    );

    info!("controllers stopped");
    Ok(())
}

async fn reconcile_service_instance(
    obj: Arc<ServiceInstance>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let span = tracing::info_span!(
        "controller.service_instance.reconcile",
        resource.kind = "ServiceInstance",
        resource.namespace = %namespace,
        resource.name = %name
    );
    let reconcile = service_instance::reconcile(&ctx, &namespace, &name);
    drive("ServiceInstance", &ctx, &namespace, &name, reconcile, span).await
}

async fn reconcile_service_instance_binding(
    obj: Arc<ServiceInstanceBinding>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let span = tracing::info_span!(
        "controller.service_instance_binding.reconcile",
        resource.kind = "ServiceInstanceBinding",
        resource.namespace = %namespace,
        resource.name = %name
    );
    let reconcile = service_instance_binding::reconcile(&ctx, &namespace, &name);
    drive("ServiceInstanceBinding", &ctx, &namespace, &name, reconcile, span).await
}

async fn reconcile_service_broker(
    obj: Arc<ServiceBroker>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let span = tracing::info_span!(
        "controller.service_broker.reconcile",
        resource.kind = "ServiceBroker",
        resource.namespace = %namespace,
        resource.name = %name
    );
    let reconcile = service_broker::reconcile_service_broker(&ctx, &namespace, &name);
    drive("ServiceBroker", &ctx, &namespace, &name, reconcile, span).await
}

async fn reconcile_cluster_service_broker(
    obj: Arc<ClusterServiceBroker>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let name = obj.name_any();
    let span = tracing::info_span!(
        "controller.cluster_service_broker.reconcile",
        resource.kind = "ClusterServiceBroker",
        resource.name = %name
    );
    let reconcile = service_broker::reconcile_cluster_service_broker(&ctx, &name);
    drive("ClusterServiceBroker", &ctx, "", &name, reconcile, span).await
}

/// Run one reconcile inside its span, record metrics and turn the outcome
/// into a requeue
async fn drive<F>(
    kind: &str,
    ctx: &Context,
    namespace: &str,
    name: &str,
    reconcile: F,
    span: Span,
) -> Result<Action, ReconcilerError>
where
    F: Future<Output = Result<Requeue, ReconcilerError>>,
{
    metrics::increment_reconciliations(kind);
    let start = Instant::now();
    let result = reconcile.instrument(span).await;
    metrics::observe_reconciliation_duration(kind, start.elapsed().as_secs_f64());

    let requeue = result?;
    ctx.reset_backoff(&backoff_key(kind, namespace, name));
    Ok(requeue_action(&ctx.config, requeue))
}

pub(crate) fn requeue_action(config: &ControllerConfig, requeue: Requeue) -> Action {
    match requeue {
        Requeue::Poll => {
            metrics::increment_requeues_total("osb-poll");
            Action::requeue(config.osb_poll_interval())
        }
        Requeue::Resync => {
            metrics::increment_requeues_total("resync");
            Action::requeue(config.resync_interval())
        }
        Requeue::Never => Action::await_change(),
    }
}

async fn log_result<K: Resource>(
    kind: &'static str,
    result: Result<(ObjectRef<K>, Action), ControllerError<ReconcilerError, watcher::Error>>,
) {
    match result {
        Ok((obj, action)) => debug!(resource.kind = kind, object = %obj, ?action, "reconciled"),
        // Already logged and requeued by the error policy
        Err(ControllerError::ReconcilerFailed(err, obj)) => {
            debug!(resource.kind = kind, object = %obj, "reconcile failed: {err}");
        }
        Err(e) => log_watch_error(kind, &e.to_string()),
    }
}
