//! # ServiceInstance Reconciler
//!
//! Drives a ServiceInstance through its lifecycle:
//!
//! 1. A finalizer is added before anything else happens
//! 2. The Space and parameters Secret are checked
//! 3. Category specific work runs: nothing for plain user-provided services,
//!    a proxy Deployment and Service for route services, provision and poll
//!    for OSB instances, a claim and NFS volume for volume instances
//! 4. On deletion the broker instance or volume is torn down, but only once
//!    no binding references the instance any more
//!
//! Status is written back only when it changed, and never after a broker 409.

pub mod requests;
pub mod resources;

use crate::constants::SERVICE_INSTANCE_FINALIZER;
use crate::controller::conflict::is_conflict_osb_error;
use crate::controller::context::Context;
use crate::controller::error::ReconcilerError;
use crate::controller::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::controller::store::StoreError;
use crate::controller::{broker_result, is_namespace_terminating, Requeue};
use crate::crd::condition::SingleCondition;
use crate::crd::service_instance::{
    VolumeInstanceParams, SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY,
};
use crate::crd::{
    Condition, InstanceOsbStatus, ServiceCategory, ServiceInstance, ServiceInstanceStatus,
};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use requests::{deprovision_request, last_operation_request, provision_request};
use resources::{
    is_controlled_by, make_deployment, make_persistent_volume, make_persistent_volume_claim,
    make_service, persistent_volume_claim_name, persistent_volume_name, reconcile_deployment,
    reconcile_service,
};
use tracing::{debug, info, warn};

fn status_mut(instance: &mut ServiceInstance) -> &mut ServiceInstanceStatus {
    instance
        .status
        .get_or_insert_with(ServiceInstanceStatus::default)
}

fn backing(instance: &mut ServiceInstance) -> SingleCondition<'_> {
    status_mut(instance).backing_resource_condition()
}

fn osb_status(instance: &ServiceInstance) -> InstanceOsbStatus {
    instance
        .status
        .as_ref()
        .map(|s| s.osb_status.clone())
        .unwrap_or_default()
}

/// Reconcile the ServiceInstance `namespace/name`
pub async fn reconcile(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Requeue, ReconcilerError> {
    let Some(original) = ctx.store.get_service_instance(namespace, name).await? else {
        info!("resource no longer exists");
        return Ok(Requeue::Never);
    };

    if original.metadata.deletion_timestamp.is_some() {
        return finalize(ctx, original).await;
    }

    if !has_finalizer(&original, SERVICE_INSTANCE_FINALIZER) {
        let mut to_update = original.clone();
        add_finalizer(&mut to_update, SERVICE_INSTANCE_FINALIZER);
        ctx.store
            .replace_service_instance(&to_update)
            .await
            .inspect_err(|e| warn!("Failed to update ServiceInstance with finalizer: {e}"))?;
        return Ok(Requeue::Never);
    }

    if is_namespace_terminating(ctx.store.as_ref(), namespace).await? {
        info!("namespace is terminating, skipping reconciliation");
        return Ok(Requeue::Never);
    }

    let mut to_reconcile = original.clone();
    status_mut(&mut to_reconcile).observed_generation = original.metadata.generation;

    let result = apply_changes(ctx, &mut to_reconcile).await;
    if let Err(e) = &result {
        debug!("ServiceInstance reconcile error: {e}");
    }

    // A 409 means someone else is acting on the broker instance; the status we
    // derived may already be stale
    let conflict = result.as_ref().is_err_and(is_conflict_osb_error);
    if !conflict {
        write_status(ctx, &original, &to_reconcile).await?;
    }

    result.map(|()| requeue_after(&to_reconcile))
}

fn requeue_after(instance: &ServiceInstance) -> Requeue {
    let Some(status) = instance.status.as_ref() else {
        return Requeue::Resync;
    };
    let rolling_out = instance.spec.route_service_url().is_some()
        && status
            .get_condition(SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY)
            .is_some_and(Condition::is_unknown);
    let in_flight = matches!(
        status.osb_status,
        InstanceOsbStatus::Provisioning { .. } | InstanceOsbStatus::Deprovisioning { .. }
    );
    if in_flight || rolling_out {
        Requeue::Poll
    } else {
        Requeue::Resync
    }
}

async fn write_status(
    ctx: &Context,
    original: &ServiceInstance,
    desired: &ServiceInstance,
) -> Result<(), ReconcilerError> {
    if original.status == desired.status {
        return Ok(());
    }
    ctx.store
        .update_service_instance_status(desired)
        .await
        .inspect_err(|e| warn!("Failed to update ServiceInstance status: {e}"))?;
    Ok(())
}

async fn finalize(ctx: &Context, original: ServiceInstance) -> Result<Requeue, ReconcilerError> {
    info!("resource deletion requested");
    let namespace = original.namespace().unwrap_or_default();
    let name = original.name_any();

    if !has_finalizer(&original, SERVICE_INSTANCE_FINALIZER) {
        let mut to_update = original.clone();
        let status = status_mut(&mut to_update);
        status.observed_generation = original.metadata.generation;
        status.propagate_terminating_status();
        write_status(ctx, &original, &to_update).await?;
        return Ok(Requeue::Never);
    }

    let bindings = ctx.store.list_service_instance_bindings(&namespace).await?;
    if bindings.iter().any(|b| b.spec.instance_ref.name == name) {
        info!("ServiceInstance is part of a service binding, deletion blocked");
        let mut to_update = original.clone();
        let status = status_mut(&mut to_update);
        status.observed_generation = original.metadata.generation;
        status.propagate_deletion_blocked_status();
        write_status(ctx, &original, &to_update).await?;
        return Ok(Requeue::Never);
    }

    // Read around any cache so a deprovision is never sent twice
    let Some(latest) = ctx.store.get_service_instance(&namespace, &name).await? else {
        return Ok(Requeue::Never);
    };
    let mut to_update = latest.clone();
    status_mut(&mut to_update).observed_generation = latest.metadata.generation;

    match delete_service(ctx, &mut to_update).await {
        Ok(true) => {
            remove_finalizer(&mut to_update, SERVICE_INSTANCE_FINALIZER);
            ctx.store
                .replace_service_instance(&to_update)
                .await
                .inspect_err(|e| warn!("Failed to update ServiceInstance: {e}"))?;
            info!("finalizer removed");
            Ok(Requeue::Never)
        }
        Ok(false) => {
            write_status(ctx, &latest, &to_update).await?;
            debug!("service instance not deleted yet");
            Ok(Requeue::Poll)
        }
        Err(e) => {
            if !is_conflict_osb_error(&e) {
                write_status(ctx, &latest, &to_update).await?;
            }
            Err(e)
        }
    }
}

/// Bring the instance's backing resources in line with its spec
async fn apply_changes(ctx: &Context, instance: &mut ServiceInstance) -> Result<(), ReconcilerError> {
    instance.spec.set_defaults();
    status_mut(instance).initialize_conditions();
    let namespace = instance.namespace().unwrap_or_default();

    match ctx.store.get_space(&namespace).await {
        Ok(Some(_)) => status_mut(instance).mark_space_healthy(),
        Ok(None) => {
            let err = StoreError::NotFound(format!("spaces.kf.dev {namespace:?} not found"));
            status_mut(instance).mark_space_unhealthy("GettingSpace", &err.to_string());
            return Err(err.into());
        }
        Err(err) => {
            status_mut(instance).mark_space_unhealthy("GettingSpace", &err.to_string());
            return Err(err.into());
        }
    }

    let secret_name = instance.spec.parameters_from.name.clone();
    let params_secret = match ctx.store.get_secret(&namespace, &secret_name).await {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            status_mut(instance).propagate_secret_status(None);
            return Ok(());
        }
        Err(err) => {
            return Err(status_mut(instance)
                .params_secret_condition()
                .mark_reconciliation_error("getting latest", &err)
                .into());
        }
    };
    if !is_controlled_by(&params_secret.metadata, &*instance) {
        return Err(status_mut(instance)
            .params_secret_condition()
            .mark_child_not_owned(&secret_name)
            .into());
    }
    status_mut(instance).propagate_secret_status(Some(&params_secret));
    if status_mut(instance)
        .params_secret_populated_condition()
        .is_pending()
    {
        return Ok(());
    }

    let spec = instance.spec.clone();
    match spec.category() {
        ServiceCategory::UserProvided(_) if spec.route_service_url().is_some() => {
            reconcile_route_service(ctx, instance).await?;
        }
        ServiceCategory::UserProvided(_) => status_mut(instance).mark_backing_resource_ready(),
        ServiceCategory::LegacyBrokered(_) => {
            backing(instance).mark_false(
                "UnsupportedVersion",
                "Kubernetes Service Catalog backed services are no longer supported.",
            );
            return Ok(());
        }
        ServiceCategory::Osb(_) => provision(ctx, instance, &params_secret).await?,
        ServiceCategory::Volume(_) => reconcile_volume(ctx, instance, &params_secret).await?,
        ServiceCategory::Undetermined => {
            return Err(ReconcilerError::Invalid(format!(
                "ServiceType can't be determined for service instance {}",
                instance.name_any()
            )));
        }
    }

    let status = instance
        .status
        .get_or_insert_with(ServiceInstanceStatus::default);
    status.propagate_service_fields_status(&instance.spec);
    status.propagate_route_service_url_status(&instance.spec);
    Ok(())
}

async fn reconcile_route_service(
    ctx: &Context,
    instance: &mut ServiceInstance,
) -> Result<(), ReconcilerError> {
    let namespace = instance.namespace().unwrap_or_default();

    debug!("reconciling Deployment for route service proxy");
    let desired = make_deployment(instance, ctx.config.route_service_proxy_image.as_deref())
        .map_err(|e| backing(instance).mark_template_error(&e))?;
    let name = desired.name_any();
    let actual = match ctx.store.get_deployment(&namespace, &name).await {
        Ok(None) => ctx
            .store
            .create_deployment(&desired)
            .await
            .map_err(|e| backing(instance).mark_reconciliation_error("creating deployment", &e))?,
        Err(e) => {
            return Err(backing(instance)
                .mark_reconciliation_error("getting latest deployment", &e)
                .into());
        }
        Ok(Some(actual)) if !is_controlled_by(&actual.metadata, &*instance) => {
            return Err(backing(instance).mark_child_not_owned(&name).into());
        }
        Ok(Some(actual)) => match reconcile_deployment(&desired, &actual) {
            None => actual,
            Some(updated) => ctx.store.replace_deployment(&updated).await.map_err(|e| {
                backing(instance).mark_reconciliation_error("updating existing deployment", &e)
            })?,
        },
    };
    status_mut(instance).propagate_deployment_status(&actual);

    debug!("reconciling Service for route service proxy");
    let desired = make_service(instance);
    let name = desired.name_any();
    match ctx.store.get_service(&namespace, &name).await {
        Ok(None) => {
            ctx.store
                .create_service(&desired)
                .await
                .map_err(|e| backing(instance).mark_reconciliation_error("creating Service", &e))?;
        }
        Err(e) => {
            return Err(backing(instance)
                .mark_reconciliation_error("getting latest Service", &e)
                .into());
        }
        Ok(Some(actual)) if !is_controlled_by(&actual.metadata, &*instance) => {
            return Err(backing(instance).mark_child_not_owned(&name).into());
        }
        Ok(Some(actual)) => {
            if let Some(updated) = reconcile_service(&desired, &actual) {
                ctx.store.replace_service(&updated).await.map_err(|e| {
                    backing(instance).mark_reconciliation_error("updating existing Service", &e)
                })?;
            }
        }
    }
    // Services have no readiness; BackingResourceReady follows the Deployment
    Ok(())
}

async fn provision(
    ctx: &Context,
    instance: &mut ServiceInstance,
    params_secret: &Secret,
) -> Result<(), ReconcilerError> {
    // Already actuated
    if !backing(instance).is_pending() {
        return Ok(());
    }

    let deadline = instance.spec.progress_deadline();
    if let Err(timeout) = backing(instance).error_if_timeout(deadline) {
        status_mut(instance)
            .propagate_provision_status(Err(&timeout as &(dyn std::error::Error + 'static)));
        return Ok(());
    }

    let client = match ctx.client_for_instance(instance).await {
        Ok(client) => client,
        Err(e) => {
            backing(instance).mark_reconciliation_error("InstantiatingClient", &e);
            return Ok(());
        }
    };

    if osb_status(instance).is_blank() {
        let namespace_name = instance.namespace().unwrap_or_default();
        let namespace = match ctx.store.get_namespace(&namespace_name).await {
            Ok(Some(namespace)) => namespace,
            Ok(None) => {
                let err = StoreError::NotFound(format!("namespaces {namespace_name:?} not found"));
                return Err(backing(instance)
                    .mark_reconciliation_error("GettingNamespace", &err)
                    .into());
            }
            Err(e) => {
                return Err(backing(instance)
                    .mark_reconciliation_error("GettingNamespace", &e)
                    .into());
            }
        };

        let request = provision_request(instance, &namespace, params_secret)
            .map_err(|e| backing(instance).mark_template_error(&e))?;

        info!("provisioning instance with broker");
        match client.provision_instance(&request).await {
            Err(e) if e.is_conflict() => return Err(e.into()),
            result => status_mut(instance).propagate_provision_status(broker_result(&result)),
        }
    }

    if let InstanceOsbStatus::Provisioning { operation_key } = osb_status(instance) {
        let request = last_operation_request(instance, operation_key.as_deref());
        let result = client.poll_last_operation(&request).await;
        status_mut(instance).propagate_provision_async_status(broker_result(&result));
    }
    Ok(())
}

async fn reconcile_volume(
    ctx: &Context,
    instance: &mut ServiceInstance,
    params_secret: &Secret,
) -> Result<(), ReconcilerError> {
    let namespace = instance.namespace().unwrap_or_default();
    let params = VolumeInstanceParams::from_secret(params_secret).map_err(|e| {
        backing(instance)
            .mark_template_error(&format!("Error parsing VolumeInstanceParams, err: {e}"))
    })?;

    let desired_claim = make_persistent_volume_claim(instance);
    let claim_name = desired_claim.name_any();
    let claim = match ctx
        .store
        .get_persistent_volume_claim(&namespace, &claim_name)
        .await
    {
        Ok(Some(claim)) => claim,
        Ok(None) => ctx
            .store
            .create_persistent_volume_claim(&desired_claim)
            .await
            .map_err(|e| {
                backing(instance).mark_reconciliation_error("creating PersistentVolumeClaim", &e)
            })?,
        Err(e) => {
            return Err(backing(instance)
                .mark_reconciliation_error("getting PersistentVolumeClaim", &e)
                .into());
        }
    };

    debug!("reconciling PersistentVolume for volume service");
    let (server, path) = params
        .server_and_path()
        .map_err(|e| backing(instance).mark_template_error(&e))?;
    let desired_volume = make_persistent_volume(instance, &server, &path, &claim);
    let volume_name = desired_volume.name_any();
    let volume = match ctx.store.get_persistent_volume(&volume_name).await {
        Ok(Some(volume)) => volume,
        Ok(None) => ctx
            .store
            .create_persistent_volume(&desired_volume)
            .await
            .map_err(|e| {
                backing(instance).mark_reconciliation_error("creating persistentvolume", &e)
            })?,
        Err(e) => {
            return Err(backing(instance)
                .mark_reconciliation_error("getting persistentvolume", &e)
                .into());
        }
    };

    let status = instance
        .status
        .get_or_insert_with(ServiceInstanceStatus::default);
    status.propagate_volume_service_status(&instance.spec, &volume.name_any(), &claim.name_any());
    // A PersistentVolume can't be altered after creation
    status.mark_backing_resource_ready();
    Ok(())
}

/// Tear down whatever backs the instance; true once it can be finalized.
///
/// Fails only when the broker answers 409, leaving the status as it was read.
async fn delete_service(
    ctx: &Context,
    instance: &mut ServiceInstance,
) -> Result<bool, ReconcilerError> {
    instance.spec.set_defaults();
    match instance.spec.category() {
        ServiceCategory::Volume(_) => Ok(delete_volume(ctx, instance).await),
        ServiceCategory::Osb(_) => deprovision(ctx, instance).await,
        // Remaining children are owner-referenced and garbage collected
        _ => Ok(true),
    }
}

/// Deletes the claim, then the volume. Done once both are gone.
async fn delete_volume(ctx: &Context, instance: &mut ServiceInstance) -> bool {
    let namespace = instance.namespace().unwrap_or_default();

    let claim_name = persistent_volume_claim_name(instance);
    match ctx
        .store
        .get_persistent_volume_claim(&namespace, &claim_name)
        .await
    {
        Ok(None) => {}
        Ok(Some(_)) => {
            if let Err(e) = ctx
                .store
                .delete_persistent_volume_claim(&namespace, &claim_name)
                .await
            {
                backing(instance).mark_reconciliation_error("deleting PersistentVolumeClaim", &e);
            }
            return false;
        }
        Err(e) => {
            backing(instance).mark_reconciliation_error("getting PersistentVolumeClaim", &e);
            return false;
        }
    }

    let volume_name = persistent_volume_name(instance);
    match ctx.store.get_persistent_volume(&volume_name).await {
        Ok(None) => true,
        Ok(Some(_)) => {
            if let Err(e) = ctx.store.delete_persistent_volume(&volume_name).await {
                backing(instance).mark_reconciliation_error("deleting PersistentVolume", &e);
            }
            false
        }
        Err(e) => {
            backing(instance).mark_reconciliation_error("getting PersistentVolume", &e);
            false
        }
    }
}

async fn deprovision(
    ctx: &Context,
    instance: &mut ServiceInstance,
) -> Result<bool, ReconcilerError> {
    let current = osb_status(instance);

    // The broker cleaned up after a failed provision
    if matches!(
        current,
        InstanceOsbStatus::ProvisionFailed | InstanceOsbStatus::Deprovisioned
    ) {
        return Ok(true);
    }

    let requested = instance.spec.delete_requests;
    let retry_delete = status_mut(instance).delete_requests != requested;

    if !retry_delete
        && matches!(
            current,
            InstanceOsbStatus::DeprovisionFailed | InstanceOsbStatus::Provisioning { .. }
        )
    {
        return Ok(false);
    }

    // Only a running deprovision can time out; an old instance that was never
    // deprovisioned must still be deletable
    if matches!(current, InstanceOsbStatus::Deprovisioning { .. }) {
        let deadline = instance.spec.progress_deadline();
        if let Err(timeout) = backing(instance).error_if_timeout(deadline) {
            status_mut(instance)
                .propagate_deprovision_status(Err(&timeout as &(dyn std::error::Error + 'static)));
            return Ok(false);
        }
    }

    let client = match ctx.client_for_instance(instance).await {
        Ok(client) => client,
        Err(e) => {
            backing(instance).mark_reconciliation_error("InstantiatingClient", &e);
            return Ok(false);
        }
    };

    if matches!(current, InstanceOsbStatus::Provisioned) || retry_delete {
        info!("deprovisioning instance with broker");
        let result = match client
            .deprovision_instance(&deprovision_request(instance))
            .await
        {
            Err(e) if e.is_conflict() => return Err(e.into()),
            result => result,
        };
        let status = status_mut(instance);
        status.propagate_deprovision_status(broker_result(&result));
        status.delete_requests = requested;
    }

    if let InstanceOsbStatus::Deprovisioning { operation_key } = osb_status(instance) {
        let request = last_operation_request(instance, operation_key.as_deref());
        let result = client.poll_last_operation(&request).await;
        status_mut(instance).propagate_deprovision_async_status(broker_result(&result));
    }

    Ok(matches!(osb_status(instance), InstanceOsbStatus::Deprovisioned))
}
