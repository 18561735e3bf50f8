//! # ServiceInstanceBinding Reconciler
//!
//! Binds an application or route to a ServiceInstance. Nothing happens until
//! the referenced instance is Ready; after that OSB instances are bound with
//! their broker and every binding gets a credentials Secret.
//!
//! Credentials come from the bind response, from a single `GetBinding` call
//! after an asynchronous bind, or for user-provided and volume instances from
//! the instance's own parameters merged with the binding's. Once the Secret is
//! referenced from status the broker is never asked for credentials again.

pub mod credentials;
pub mod requests;

use crate::constants::SERVICE_INSTANCE_BINDING_FINALIZER;
use crate::controller::conflict::is_conflict_osb_error;
use crate::controller::context::Context;
use crate::controller::error::ReconcilerError;
use crate::controller::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::controller::store::StoreError;
use crate::controller::{broker_result, is_namespace_terminating, Requeue};
use crate::crd::condition::{MessageError, SingleCondition};
use crate::crd::{
    BindingOsbStatus, ServiceInstance, ServiceInstanceBinding, ServiceInstanceBindingStatus,
};
use credentials::{make_credentials_secret, merge_credentials_secret};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use requests::{bind_request, binding_last_operation_request, get_binding_request, unbind_request};
use tracing::{debug, info, warn};

fn status_mut(binding: &mut ServiceInstanceBinding) -> &mut ServiceInstanceBindingStatus {
    binding
        .status
        .get_or_insert_with(ServiceInstanceBindingStatus::default)
}

fn backing(binding: &mut ServiceInstanceBinding) -> SingleCondition<'_> {
    status_mut(binding).backing_resource_condition()
}

fn osb_status(binding: &ServiceInstanceBinding) -> BindingOsbStatus {
    binding
        .status
        .as_ref()
        .map(|s| s.osb_status.clone())
        .unwrap_or_default()
}

/// Reconcile the ServiceInstanceBinding `namespace/name`
pub async fn reconcile(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Requeue, ReconcilerError> {
    let Some(original) = ctx
        .store
        .get_service_instance_binding(namespace, name)
        .await?
    else {
        info!("resource no longer exists");
        return Ok(Requeue::Never);
    };

    if original.metadata.deletion_timestamp.is_some() {
        return finalize(ctx, original).await;
    }

    if !has_finalizer(&original, SERVICE_INSTANCE_BINDING_FINALIZER) {
        let mut to_update = original.clone();
        add_finalizer(&mut to_update, SERVICE_INSTANCE_BINDING_FINALIZER);
        ctx.store
            .replace_service_instance_binding(&to_update)
            .await
            .inspect_err(|e| warn!("Failed to update resource with finalizer: {e}"))?;
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
        debug!("ServiceInstanceBinding reconcile error: {e}");
    }

    if !result.as_ref().is_err_and(is_conflict_osb_error) {
        write_status(ctx, &original, &to_reconcile).await?;
    }

    result.map(|()| requeue_after(&to_reconcile))
}

fn requeue_after(binding: &ServiceInstanceBinding) -> Requeue {
    match osb_status(binding) {
        BindingOsbStatus::Binding { .. } | BindingOsbStatus::Unbinding { .. } => Requeue::Poll,
        _ => Requeue::Resync,
    }
}

async fn write_status(
    ctx: &Context,
    original: &ServiceInstanceBinding,
    desired: &ServiceInstanceBinding,
) -> Result<(), ReconcilerError> {
    if original.status == desired.status {
        return Ok(());
    }
    ctx.store
        .update_service_instance_binding_status(desired)
        .await
        .inspect_err(|e| warn!("Failed to update ServiceInstanceBinding status: {e}"))?;
    Ok(())
}

async fn finalize(
    ctx: &Context,
    original: ServiceInstanceBinding,
) -> Result<Requeue, ReconcilerError> {
    info!("resource deletion requested");
    let mut to_update = original.clone();
    status_mut(&mut to_update).observed_generation = original.metadata.generation;

    if !has_finalizer(&original, SERVICE_INSTANCE_BINDING_FINALIZER) {
        status_mut(&mut to_update).propagate_terminating_status();
        write_status(ctx, &original, &to_update).await?;
        return Ok(Requeue::Never);
    }

    match delete_binding(ctx, &mut to_update).await {
        Ok(true) => {
            remove_finalizer(&mut to_update, SERVICE_INSTANCE_BINDING_FINALIZER);
            ctx.store
                .replace_service_instance_binding(&to_update)
                .await
                .inspect_err(|e| warn!("Failed to update resource: {e}"))?;
            info!("finalizer removed");
            Ok(Requeue::Never)
        }
        Ok(false) => {
            write_status(ctx, &original, &to_update).await?;
            Ok(Requeue::Poll)
        }
        Err(e) => {
            if !is_conflict_osb_error(&e) {
                write_status(ctx, &original, &to_update).await?;
            }
            Err(e)
        }
    }
}

async fn instance_for_binding(
    ctx: &Context,
    binding: &ServiceInstanceBinding,
) -> Result<ServiceInstance, StoreError> {
    let namespace = binding.namespace().unwrap_or_default();
    let name = &binding.spec.instance_ref.name;
    ctx.store
        .get_service_instance(&namespace, name)
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "serviceinstances.kf.dev {name:?} not found"
            ))
        })
}

async fn apply_changes(
    ctx: &Context,
    binding: &mut ServiceInstanceBinding,
) -> Result<(), ReconcilerError> {
    binding.spec.set_defaults();
    status_mut(binding).initialize_conditions();
    let namespace = binding.namespace().unwrap_or_default();

    debug!("reconciling params secret");
    let params_secret = match ctx
        .store
        .get_secret(&namespace, &binding.spec.parameters_from.name)
        .await
    {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            info!("Waiting for params secret to be created; exiting early");
            status_mut(binding).propagate_params_secret_status(None);
            return Ok(());
        }
        Err(e) => {
            return Err(status_mut(binding)
                .params_secret_condition()
                .mark_reconciliation_error("getting latest", &e)
                .into());
        }
    };
    status_mut(binding).propagate_params_secret_status(Some(&params_secret));
    if status_mut(binding)
        .params_secret_populated_condition()
        .is_pending()
    {
        info!("Waiting for params secret to be populated; exiting early");
        return Ok(());
    }

    let instance = match instance_for_binding(ctx, binding).await {
        Ok(instance) => instance,
        Err(e) => {
            return Err(status_mut(binding)
                .service_instance_condition()
                .mark_reconciliation_error("getting service instance", &e)
                .into());
        }
    };

    status_mut(binding).propagate_service_instance_status(&instance);
    if status_mut(binding).service_instance_condition().is_pending() {
        info!("Waiting for service instance in binding to be ready; exiting early");
        return Ok(());
    }

    let status = binding
        .status
        .get_or_insert_with(ServiceInstanceBindingStatus::default);
    status.propagate_service_fields_status(&instance);
    status.propagate_binding_name_status(&binding.spec);
    status.propagate_route_service_url_status(&instance);
    status.propagate_volume_status(&instance, &params_secret);

    if instance.spec.has_no_backing_resources() {
        status_mut(binding).mark_backing_resource_ready();
        return reconcile_merged_credentials(ctx, binding, &instance, &params_secret).await;
    }
    if instance.spec.brokered.is_some() {
        backing(binding).mark_false(
            "UnsupportedVersion",
            "Kubernetes Service Catalog backed services are no longer supported.",
        );
        return Ok(());
    }
    if !instance.spec.is_kf_brokered() {
        return Err(ReconcilerError::Invalid(format!(
            "ServiceType can't be determined for service instance {}",
            instance.name_any()
        )));
    }

    bind(ctx, binding, &instance, &params_secret).await?;
    reconcile_broker_credentials(ctx, binding, &instance).await
}

async fn bind(
    ctx: &Context,
    binding: &mut ServiceInstanceBinding,
    instance: &ServiceInstance,
    params_secret: &Secret,
) -> Result<(), ReconcilerError> {
    // Already actuated
    if !backing(binding).is_pending() {
        return Ok(());
    }

    let deadline = binding.spec.progress_deadline();
    if let Err(timeout) = backing(binding).error_if_timeout(deadline) {
        status_mut(binding)
            .propagate_bind_status(Err(&timeout as &(dyn std::error::Error + 'static)));
        return Ok(());
    }

    let client = match ctx.client_for_instance(instance).await {
        Ok(client) => client,
        Err(e) => {
            backing(binding).mark_reconciliation_error("InstantiatingClient", &e);
            return Ok(());
        }
    };

    if osb_status(binding).is_blank() {
        let namespace_name = instance.namespace().unwrap_or_default();
        let namespace = match ctx.store.get_namespace(&namespace_name).await {
            Ok(Some(namespace)) => namespace,
            Ok(None) => {
                let err = StoreError::NotFound(format!("namespaces {namespace_name:?} not found"));
                return Err(backing(binding)
                    .mark_reconciliation_error("GettingNamespace", &err)
                    .into());
            }
            Err(e) => {
                return Err(backing(binding)
                    .mark_reconciliation_error("GettingNamespace", &e)
                    .into());
            }
        };

        let request = bind_request(instance, binding, &namespace, params_secret)
            .map_err(|e| backing(binding).mark_template_error(&e))?;

        info!("binding with broker");
        let result = match client.bind(&request).await {
            Err(e) if e.is_conflict() => return Err(e.into()),
            result => result,
        };
        status_mut(binding).propagate_bind_status(broker_result(&result));

        // Synchronous binds hand back the credentials right away
        if let Ok(response) = &result {
            if !response.is_async {
                let desired = make_credentials_secret(
                    binding,
                    &response.credentials.clone().unwrap_or_default(),
                );
                if let Err(e) = upsert_credentials_secret(ctx, binding, Ok(desired)).await {
                    warn!("Failed to write credentials from bind response: {e}");
                }
            }
        }
    }

    if let BindingOsbStatus::Binding { operation_key } = osb_status(binding) {
        let request =
            binding_last_operation_request(instance, binding, operation_key.as_deref());
        let result = client.poll_binding_last_operation(&request).await;
        status_mut(binding).propagate_bind_last_operation_status(broker_result(&result));
    }
    Ok(())
}

/// User-provided and volume instances keep their credentials in their own
/// params Secret
async fn reconcile_merged_credentials(
    ctx: &Context,
    binding: &mut ServiceInstanceBinding,
    instance: &ServiceInstance,
    params_secret: &Secret,
) -> Result<(), ReconcilerError> {
    debug!("reconciling binding credentials secret");
    let namespace = instance.namespace().unwrap_or_default();
    let instance_secret = match ctx
        .store
        .get_secret(&namespace, &instance.spec.parameters_from.name)
        .await
    {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            info!("Waiting for service instance credentials secret to be created; exiting early");
            return Ok(());
        }
        Err(e) => {
            return Err(status_mut(binding)
                .credentials_secret_condition()
                .mark_reconciliation_error("getting latest", &e)
                .into());
        }
    };
    let desired = merge_credentials_secret(binding, &instance_secret, params_secret);
    upsert_credentials_secret(ctx, binding, desired).await
}

async fn reconcile_broker_credentials(
    ctx: &Context,
    binding: &mut ServiceInstanceBinding,
    instance: &ServiceInstance,
) -> Result<(), ReconcilerError> {
    if osb_status(binding) != BindingOsbStatus::Bound {
        info!("Waiting binding to be ready, exiting early");
        return Ok(());
    }

    // Brokers don't have to return the same credentials twice
    if binding
        .status
        .as_ref()
        .is_some_and(|s| !s.credentials_secret_ref.name.is_empty())
    {
        debug!("credentials secret already exists");
        return Ok(());
    }

    let client = ctx.client_for_instance(instance).await.map_err(|e| {
        status_mut(binding)
            .credentials_secret_condition()
            .mark_reconciliation_error("InstantiatingClient", &e)
    })?;

    let response = client
        .get_binding(&get_binding_request(instance, binding))
        .await
        .map_err(|e| {
            status_mut(binding)
                .credentials_secret_condition()
                .mark_reconciliation_error("GettingBindingCreds", &e)
        })?;

    let desired = make_credentials_secret(binding, &response.credentials);
    upsert_credentials_secret(ctx, binding, Ok(desired)).await
}

/// Create the credentials Secret or bring its data in line
async fn upsert_credentials_secret(
    ctx: &Context,
    binding: &mut ServiceInstanceBinding,
    desired: Result<Secret, MessageError>,
) -> Result<(), ReconcilerError> {
    let desired = desired.map_err(|e| {
        status_mut(binding)
            .credentials_secret_condition()
            .mark_template_error(&e)
    })?;
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let actual = match ctx.store.get_secret(&namespace, &name).await {
        Ok(None) => ctx.store.create_secret(&desired).await.map_err(|e| {
            status_mut(binding)
                .credentials_secret_condition()
                .mark_reconciliation_error("creating", &e)
        })?,
        Err(e) => {
            return Err(status_mut(binding)
                .credentials_secret_condition()
                .mark_reconciliation_error("getting latest", &e)
                .into());
        }
        Ok(Some(actual)) if actual.data == desired.data => actual,
        Ok(Some(actual)) => {
            let mut existing = actual;
            existing.data = desired.data;
            ctx.store.replace_secret(&existing).await?
        }
    };
    status_mut(binding).propagate_credentials_secret_status(Some(&actual));
    Ok(())
}

/// Unbind from the broker; true once the binding can be finalized.
///
/// A broker 409 is returned as an error before any status is derived from it.
async fn delete_binding(
    ctx: &Context,
    binding: &mut ServiceInstanceBinding,
) -> Result<bool, ReconcilerError> {
    binding.spec.set_defaults();

    let instance = match instance_for_binding(ctx, binding).await {
        Ok(instance) => instance,
        Err(e) => {
            backing(binding).mark_reconciliation_error("GettingInstance", &e);
            return Ok(false);
        }
    };

    // Children of other categories go away with their own finalizers
    if !instance.spec.is_kf_brokered() {
        return Ok(true);
    }

    let current = osb_status(binding);
    if matches!(
        current,
        BindingOsbStatus::BindFailed | BindingOsbStatus::Unbound
    ) {
        return Ok(true);
    }
    if matches!(current, BindingOsbStatus::Binding { .. }) {
        return Ok(false);
    }

    let requested = binding.spec.unbind_requests;
    let retry_unbind = status_mut(binding).unbind_requests != requested;
    if !retry_unbind && current == BindingOsbStatus::UnbindFailed {
        return Ok(false);
    }

    // Only a running unbind can time out
    if matches!(current, BindingOsbStatus::Unbinding { .. }) {
        let deadline = binding.spec.progress_deadline();
        if let Err(timeout) = backing(binding).error_if_timeout(deadline) {
            status_mut(binding)
                .propagate_unbind_status(Err(&timeout as &(dyn std::error::Error + 'static)));
            return Ok(false);
        }
    }

    let client = match ctx.client_for_instance(&instance).await {
        Ok(client) => client,
        Err(e) => {
            backing(binding).mark_reconciliation_error("InstantiatingClient", &e);
            return Ok(false);
        }
    };

    if current == BindingOsbStatus::Bound || retry_unbind {
        info!("unbinding from broker");
        let result = match client.unbind(&unbind_request(&instance, binding)).await {
            Err(e) if e.is_conflict() => return Err(e.into()),
            result => result,
        };
        let status = status_mut(binding);
        status.propagate_unbind_status(broker_result(&result));
        status.unbind_requests = requested;
    }

    if let BindingOsbStatus::Unbinding { operation_key } = osb_status(binding) {
        let request =
            binding_last_operation_request(&instance, binding, operation_key.as_deref());
        let result = client.poll_binding_last_operation(&request).await;
        status_mut(binding).propagate_unbind_last_operation_status(broker_result(&result));
    }

    Ok(osb_status(binding) == BindingOsbStatus::Unbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PARAMS_SECRET_KEY;
    use crate::controller::testing::{
        age_conditions, binding, context, deleting, osb_instance, params_secret, seed_space,
        FakeBroker, MemoryStore, BINDING_NAME, BINDING_PARAMS, INSTANCE_PARAMS, NAMESPACE,
    };
    use crate::crd::service_instance::BrokeredInstance;
    use crate::crd::{
        ConditionStatus, InstanceOsbStatus, ServiceInstanceStatus, UserProvidedInstance,
        CONDITION_READY,
    };
    use crate::osb::client::MockOsbClient;
    use crate::osb::error::OsbError;
    use crate::osb::types::{
        BindResponse, GetBindingResponse, LastOperationState, UnbindResponse,
    };
    use crate::osb::OsbClient;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn ready(mut instance: ServiceInstance, credentials: &str) -> (ServiceInstance, Secret) {
        let secret = params_secret(INSTANCE_PARAMS, credentials, Some(&instance));
        let mut status = ServiceInstanceStatus::default();
        status.initialize_conditions();
        status.mark_space_healthy();
        status.propagate_secret_status(Some(&secret));
        status.mark_backing_resource_ready();
        status.propagate_service_fields_status(&instance.spec);
        if instance.spec.osb.is_some() {
            status.osb_status = InstanceOsbStatus::Provisioned;
        }
        instance.status = Some(status);
        (instance, secret)
    }

    fn setup_with(
        instance: ServiceInstance,
        mut binding: ServiceInstanceBinding,
        client: Arc<dyn OsbClient>,
    ) -> (Arc<MemoryStore>, Context) {
        let store = Arc::new(MemoryStore::new());
        seed_space(&store);
        let (instance, instance_secret) = ready(instance, r#"{"user":"a","password":"p"}"#);
        store.insert(&instance_secret);
        store.insert(&instance);
        if binding.metadata.finalizers.is_none() {
            binding.metadata.finalizers =
                Some(vec![SERVICE_INSTANCE_BINDING_FINALIZER.to_string()]);
        }
        store.insert(&params_secret(BINDING_PARAMS, r#"{"user":"b"}"#, None));
        store.insert(&binding);
        let ctx = context(&store, client);
        (store, ctx)
    }

    fn setup(
        instance: ServiceInstance,
        binding: ServiceInstanceBinding,
    ) -> (Arc<MemoryStore>, Arc<FakeBroker>, Context) {
        let broker = Arc::new(FakeBroker::default());
        let (store, ctx) = setup_with(instance, binding, Arc::clone(&broker) as Arc<dyn OsbClient>);
        (store, broker, ctx)
    }

    fn stored(store: &MemoryStore) -> ServiceInstanceBinding {
        store.get(NAMESPACE, BINDING_NAME).unwrap()
    }

    fn credentials(store: &MemoryStore) -> Option<Secret> {
        let binding = stored(store);
        let name = binding.status?.credentials_secret_ref.name;
        store.get(NAMESPACE, &name)
    }

    fn secret_value(secret: &Secret, key: &str) -> Option<String> {
        secret
            .data
            .as_ref()?
            .get(key)
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
    }

    fn bound_credentials() -> serde_json::Map<String, Value> {
        let Value::Object(creds) = json!({"uri": "mysql://db", "port": 3306}) else {
            unreachable!()
        };
        creds
    }

    #[tokio::test]
    async fn test_finalizer_is_added_first() {
        let mut fresh = binding();
        fresh.metadata.finalizers = Some(vec![]);
        let (store, broker, ctx) = setup(osb_instance(), fresh);

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Never);
        assert!(has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_pending_instance() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        let mut instance = store
            .get::<ServiceInstance>(NAMESPACE, &binding().spec.instance_ref.name)
            .unwrap();
        if let Some(status) = instance.status.as_mut() {
            status
                .backing_resource_condition()
                .mark_unknown("ProvisioningInstance", "operation is pending");
        }
        store.insert(&instance);

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Resync);
        assert!(broker.calls().is_empty());
        let status = stored(&store).status.unwrap();
        assert_eq!(status.osb_status, BindingOsbStatus::Blank);
        assert_eq!(
            status
                .get_condition("ServiceInstanceReady")
                .map(|c| c.status),
            Some(ConditionStatus::Unknown)
        );
    }

    #[tokio::test]
    async fn test_synchronous_bind_writes_credentials() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        broker.bind.lock().unwrap().push_back(Ok(BindResponse {
            is_async: false,
            credentials: Some(bound_credentials()),
            operation_key: None,
        }));

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Resync);
        assert_eq!(broker.calls(), vec!["bind"]);
        let status = stored(&store).status.unwrap();
        assert_eq!(status.osb_status, BindingOsbStatus::Bound);
        assert_eq!(status.binding_name, "my-db");
        assert_eq!(status.class_name, "mysql");
        assert!(status
            .get_condition(CONDITION_READY)
            .is_some_and(|c| c.is_true()));

        let secret = credentials(&store).unwrap();
        assert_eq!(secret_value(&secret, "uri").as_deref(), Some("mysql://db"));
        assert_eq!(secret_value(&secret, "port").as_deref(), Some("3306"));

        let request = broker.bind_requests.lock().unwrap()[0].clone();
        assert_eq!(
            request.parameters.and_then(|p| p.get("user").cloned()),
            Some(Value::from("b"))
        );
    }

    #[tokio::test]
    async fn test_async_bind_fetches_credentials_once() {
        let mut client = MockOsbClient::new();
        client.expect_bind().times(1).returning(|_| {
            Ok(BindResponse {
                is_async: true,
                credentials: None,
                operation_key: Some("op-1".to_string()),
            })
        });
        client
            .expect_poll_binding_last_operation()
            .times(1)
            .returning(|_| {
                Ok(crate::controller::testing::last_operation(
                    LastOperationState::Succeeded,
                ))
            });
        client.expect_get_binding().times(1).returning(|_| {
            Ok(GetBindingResponse {
                credentials: bound_credentials(),
            })
        });
        let (store, ctx) = setup_with(osb_instance(), binding(), Arc::new(client));

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
        assert_eq!(
            stored(&store).status.map(|s| s.osb_status),
            Some(BindingOsbStatus::Bound)
        );
        assert!(credentials(&store).is_some());

        // The Secret is the record from now on
        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
    }

    #[tokio::test]
    async fn test_async_bind_polls_while_in_progress() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        broker.bind.lock().unwrap().push_back(Ok(BindResponse {
            is_async: true,
            credentials: None,
            operation_key: Some("op-7".to_string()),
        }));
        broker
            .binding_last_operation
            .lock()
            .unwrap()
            .push_back(Ok(crate::controller::testing::last_operation(
                LastOperationState::InProgress,
            )));

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Poll);
        assert_eq!(
            stored(&store).status.map(|s| s.osb_status),
            Some(BindingOsbStatus::Binding {
                operation_key: Some("op-7".to_string())
            })
        );
        assert_eq!(broker.count("get_binding"), 0);
        assert!(credentials(&store).is_none());
    }

    #[tokio::test]
    async fn test_conflict_leaves_status_untouched() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        broker
            .bind
            .lock()
            .unwrap()
            .push_back(Err(OsbError::http(StatusCode::CONFLICT)));

        let err = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap_err();

        assert!(is_conflict_osb_error(&err));
        assert_eq!(store.status_writes("ServiceInstanceBinding"), 0);
    }

    #[tokio::test]
    async fn test_stuck_bind_times_out() {
        let mut stuck = binding();
        let mut status = ServiceInstanceBindingStatus::default();
        status.initialize_conditions();
        status
            .backing_resource_condition()
            .mark_unknown("BindingAsync", "operation is pending");
        age_conditions(&mut status.conditions);
        status.osb_status = BindingOsbStatus::Binding {
            operation_key: None,
        };
        stuck.status = Some(status);
        let (store, broker, ctx) = setup(osb_instance(), stuck);

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(
            stored(&store).status.map(|s| s.osb_status),
            Some(BindingOsbStatus::BindFailed)
        );
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_user_provided_credentials_are_merged() {
        let mut instance = osb_instance();
        instance.spec.osb = None;
        instance.spec.user_provided = Some(UserProvidedInstance::default());
        let (store, broker, ctx) = setup(instance, binding());

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        let secret = credentials(&store).unwrap();
        assert_eq!(secret_value(&secret, "user").as_deref(), Some("b"));
        assert_eq!(secret_value(&secret, "password").as_deref(), Some("p"));
        assert!(broker.calls().is_empty());
        assert!(stored(&store)
            .status
            .unwrap()
            .get_condition(CONDITION_READY)
            .is_some_and(|c| c.is_true()));
    }

    #[tokio::test]
    async fn test_volume_binding_requires_mount() {
        let mut instance = osb_instance();
        instance.spec.volume = instance.spec.osb.take();
        let (store, _broker, ctx) = setup(instance.clone(), binding());
        let (mut instance, _) = ready(instance, "{}");
        if let Some(status) = instance.status.as_mut() {
            status.volume_status = Some(crate::crd::service_instance::VolumeStatus {
                persistent_volume_name: "pv".to_string(),
                persistent_volume_claim_name: "pvc".to_string(),
            });
        }
        store.insert(&instance);

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
        let status = stored(&store).status.unwrap();
        assert_eq!(
            status
                .get_condition("VolumeParamsPopulatedReady")
                .map(|c| c.status),
            Some(ConditionStatus::False)
        );

        store.insert(&params_secret(
            BINDING_PARAMS,
            r#"{"mount":"/data","UID":"1000","GID":2000}"#,
            None,
        ));
        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
        let volume = stored(&store).status.unwrap().volume_status.unwrap();
        assert_eq!(volume.mount, "/data");
        assert_eq!(volume.persistent_volume_claim_name, "pvc");
        assert_eq!(volume.uid, "1000");
        assert_eq!(volume.gid, "2000");
    }

    #[tokio::test]
    async fn test_legacy_instance_is_unsupported() {
        let mut instance = osb_instance();
        instance.spec.osb = None;
        instance.spec.brokered = Some(BrokeredInstance::default());
        let (store, broker, ctx) = setup(instance, binding());

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert!(broker.calls().is_empty());
        let status = stored(&store).status.unwrap();
        assert_eq!(
            status
                .get_condition("BackingResourceReady")
                .and_then(|c| c.reason.clone())
                .as_deref(),
            Some("UnsupportedVersion")
        );
    }

    #[tokio::test]
    async fn test_missing_params_secret_waits() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        let mut unparameterized = stored(&store);
        unparameterized.spec.parameters_from.name = "missing".to_string();
        store.insert(&unparameterized);

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert!(broker.calls().is_empty());
        assert_eq!(
            stored(&store)
                .status
                .unwrap()
                .get_condition("ParamsSecretReady")
                .and_then(|c| c.reason.clone())
                .as_deref(),
            Some("SecretMissing")
        );
    }

    #[tokio::test]
    async fn test_unpopulated_params_secret_waits() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        let mut empty = params_secret(BINDING_PARAMS, "{}", None);
        if let Some(data) = empty.data.as_mut() {
            data.remove(PARAMS_SECRET_KEY);
        }
        store.insert(&empty);

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert!(broker.calls().is_empty());
    }

    fn deleted_binding(status: BindingOsbStatus, unbind_requests: i64) -> ServiceInstanceBinding {
        let mut deleted = binding();
        deleted.spec.unbind_requests = unbind_requests;
        deleting(&mut deleted.metadata, Some(SERVICE_INSTANCE_BINDING_FINALIZER));
        let mut binding_status = ServiceInstanceBindingStatus::default();
        binding_status.initialize_conditions();
        binding_status.osb_status = status;
        deleted.status = Some(binding_status);
        deleted
    }

    #[tokio::test]
    async fn test_unbind_then_finalize() {
        let (store, broker, ctx) =
            setup(osb_instance(), deleted_binding(BindingOsbStatus::Bound, 0));

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Never);
        assert_eq!(broker.calls(), vec!["unbind"]);
        assert!(!has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
    }

    #[tokio::test]
    async fn test_failed_unbind_waits_for_retry() {
        let (store, broker, ctx) = setup(
            osb_instance(),
            deleted_binding(BindingOsbStatus::UnbindFailed, 0),
        );

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Poll);
        assert!(broker.calls().is_empty());
        assert!(has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
    }

    #[tokio::test]
    async fn test_retried_unbind() {
        let (store, broker, ctx) = setup(
            osb_instance(),
            deleted_binding(BindingOsbStatus::UnbindFailed, 1),
        );
        broker.unbind.lock().unwrap().push_back(Ok(UnbindResponse {
            is_async: true,
            operation_key: Some("op-3".to_string()),
        }));
        broker
            .binding_last_operation
            .lock()
            .unwrap()
            .push_back(Ok(crate::controller::testing::last_operation(
                LastOperationState::InProgress,
            )));

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Poll);
        let status = stored(&store).status.unwrap();
        assert_eq!(status.unbind_requests, 1);
        assert_eq!(
            status.osb_status,
            BindingOsbStatus::Unbinding {
                operation_key: Some("op-3".to_string())
            }
        );

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
        assert_eq!(broker.count("unbind"), 1);
        assert!(!has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
    }

    #[tokio::test]
    async fn test_unbind_of_gone_binding_succeeds() {
        let (store, broker, ctx) =
            setup(osb_instance(), deleted_binding(BindingOsbStatus::Bound, 0));
        broker
            .unbind
            .lock()
            .unwrap()
            .push_back(Err(OsbError::http(StatusCode::GONE)));

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert!(!has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
    }

    #[tokio::test]
    async fn test_non_brokered_binding_deletes_immediately() {
        let mut instance = osb_instance();
        instance.spec.osb = None;
        instance.spec.user_provided = Some(UserProvidedInstance::default());
        let (store, broker, ctx) = setup(instance, deleted_binding(BindingOsbStatus::Blank, 0));

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Never);
        assert!(broker.calls().is_empty());
        assert!(!has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
    }

    #[tokio::test]
    async fn test_terminating_without_finalizer() {
        let mut gone = binding();
        deleting(&mut gone.metadata, None);
        gone.metadata.finalizers = Some(vec!["other".to_string()]);
        let (store, _broker, ctx) = setup(osb_instance(), gone);

        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(
            stored(&store)
                .status
                .unwrap()
                .get_condition(CONDITION_READY)
                .and_then(|c| c.reason.clone())
                .as_deref(),
            Some("Terminating")
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (store, broker, ctx) = setup(osb_instance(), binding());
        broker.bind.lock().unwrap().push_back(Ok(BindResponse {
            is_async: false,
            credentials: Some(bound_credentials()),
            operation_key: None,
        }));
        reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();
        let first = stored(&store).status;
        store.clear_writes();

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Resync);
        assert_eq!(stored(&store).status, first);
        assert_eq!(store.status_writes("ServiceInstanceBinding"), 0);
        assert_eq!(broker.calls(), vec!["bind"]);
    }

    #[tokio::test]
    async fn test_unbind_conflict_leaves_status_untouched() {
        let (store, broker, ctx) =
            setup(osb_instance(), deleted_binding(BindingOsbStatus::Bound, 0));
        broker
            .unbind
            .lock()
            .unwrap()
            .push_back(Err(OsbError::http(StatusCode::CONFLICT)));
        let before = stored(&store).status;

        let err = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap_err();

        assert!(is_conflict_osb_error(&err));
        assert_eq!(broker.calls(), vec!["unbind"]);
        assert_eq!(stored(&store).status, before);
        assert_eq!(store.status_writes("ServiceInstanceBinding"), 0);
        assert!(has_finalizer(&stored(&store), SERVICE_INSTANCE_BINDING_FINALIZER));
    }

    #[tokio::test]
    async fn test_stuck_unbind_times_out() {
        let mut stuck = deleted_binding(
            BindingOsbStatus::Unbinding {
                operation_key: Some("op-4".to_string()),
            },
            0,
        );
        if let Some(status) = stuck.status.as_mut() {
            status
                .backing_resource_condition()
                .mark_unknown("Unbinding", "operation is pending");
            age_conditions(&mut status.conditions);
        }
        let (store, broker, ctx) = setup(osb_instance(), stuck);

        let requeue = reconcile(&ctx, NAMESPACE, BINDING_NAME).await.unwrap();

        assert_eq!(requeue, Requeue::Poll);
        assert!(broker.calls().is_empty());
        let binding = stored(&store);
        assert_eq!(
            binding.status.as_ref().map(|s| s.osb_status.clone()),
            Some(BindingOsbStatus::UnbindFailed)
        );
        assert!(has_finalizer(&binding, SERVICE_INSTANCE_BINDING_FINALIZER));
    }
}
