//! # Broker Catalog Reconciler
//!
//! Keeps the catalog cached on ServiceBrokers and ClusterServiceBrokers in
//! line with what the broker advertises. The catalog is fetched once and
//! again whenever `spec.updateRequests` is bumped.

use crate::controller::context::Context;
use crate::controller::error::ReconcilerError;
use crate::controller::Requeue;
use crate::crd::{ClusterServiceBroker, ServiceBroker, ServiceBrokerStatus};
use crate::osb::factory::BrokerCredentials;
use crate::osb::map_catalog;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Reconcile the namespaced ServiceBroker `namespace/name`
pub async fn reconcile_service_broker(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Requeue, ReconcilerError> {
    let Some(original) = ctx.store.get_service_broker(namespace, name).await? else {
        info!("resource no longer exists");
        return Ok(Requeue::Never);
    };

    let mut to_reconcile = original.clone();
    let status = to_reconcile
        .status
        .get_or_insert_with(ServiceBrokerStatus::default);
    status.observed_generation = original.metadata.generation;

    let result = if original.metadata.deletion_timestamp.is_some() {
        status.propagate_terminating();
        Ok(())
    } else {
        let creds = ctx
            .store
            .get_secret(namespace, &original.spec.credentials.name)
            .await;
        apply_changes(ctx, status, creds, original.spec.update_requests).await
    };

    if original.status != to_reconcile.status {
        ctx.store
            .update_service_broker_status(&to_reconcile)
            .await
            .inspect_err(|e| warn!("failed to update resource status: {e}"))?;
    }
    result.map(|()| Requeue::Resync)
}

/// Reconcile the ClusterServiceBroker `name`
pub async fn reconcile_cluster_service_broker(
    ctx: &Context,
    name: &str,
) -> Result<Requeue, ReconcilerError> {
    let Some(original) = ctx.store.get_cluster_service_broker(name).await? else {
        info!("resource no longer exists");
        return Ok(Requeue::Never);
    };

    let mut to_reconcile = original.clone();
    let status = to_reconcile
        .status
        .get_or_insert_with(ServiceBrokerStatus::default);
    status.observed_generation = original.metadata.generation;

    let result = if original.metadata.deletion_timestamp.is_some() {
        status.propagate_terminating();
        Ok(())
    } else {
        let creds_ref = &original.spec.credentials;
        let creds = ctx
            .store
            .get_secret(&creds_ref.namespace, &creds_ref.name)
            .await;
        apply_changes(ctx, status, creds, original.spec.update_requests).await
    };

    if original.status != to_reconcile.status {
        ctx.store
            .update_cluster_service_broker_status(&to_reconcile)
            .await
            .inspect_err(|e| warn!("failed to update resource status: {e}"))?;
    }
    result.map(|()| Requeue::Resync)
}

async fn apply_changes(
    ctx: &Context,
    status: &mut ServiceBrokerStatus,
    creds: Result<Option<Secret>, crate::controller::StoreError>,
    update_requests: i64,
) -> Result<(), ReconcilerError> {
    status.initialize_conditions();

    debug!("reconciling creds secret");
    let secret = match creds {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            info!("Waiting for secret to be created; exiting early");
            status
                .creds_secret_condition()
                .mark_unknown("SecretMissing", "Secret for broker credentials doesn't exist");
            return Ok(());
        }
        Err(e) => {
            return Err(status
                .creds_secret_condition()
                .mark_reconciliation_error("getting latest", &e)
                .into());
        }
    };
    status.creds_secret_condition().mark_success();

    if let Err(e) = BrokerCredentials::from_secret(&secret) {
        return Err(status
            .creds_secret_populated_condition()
            .mark_template_error(&e)
            .into());
    }
    status.creds_secret_populated_condition().mark_success();

    if status.catalog_is_current(update_requests) {
        return Ok(());
    }

    info!(
        secret = %secret.name_any(),
        "fetching catalog"
    );
    let client = ctx.osb_factory.new_client_for_broker(&secret).map_err(|e| {
        status
            .catalog_condition()
            .mark_reconciliation_error("ConstructingClient", &e)
    })?;
    let catalog = client.get_catalog().await.map_err(|e| {
        status
            .catalog_condition()
            .mark_reconciliation_error("fetching catalog", &e)
    })?;

    status.services = map_catalog(&catalog);
    status.update_requests = update_requests;
    status.catalog_condition().mark_success();
    Ok(())
}
