//! Broker requests for a ServiceInstance.
//!
//! The instance UID is the broker's instance id so that a repeated provision
//! only ever creates one instance. No originating identity is sent.

use crate::constants::PARAMS_SECRET_KEY;
use crate::crd::condition::MessageError;
use crate::crd::ServiceInstance;
use crate::osb::types::{
    DeprovisionRequest, JsonObject, LastOperationRequest, ProvisionRequest,
};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::ResourceExt;
use serde_json::Value;

/// Class and plan ids of an OSB instance
pub(crate) fn service_and_plan(instance: &ServiceInstance) -> (String, String) {
    instance.spec.osb.as_ref().map_or_else(
        || (String::new(), String::new()),
        |osb| (osb.class_uid.clone(), osb.plan_uid.clone()),
    )
}

/// Decode the JSON object stored under `params`
pub(crate) fn params_from_secret(secret: &Secret) -> Result<JsonObject, MessageError> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(PARAMS_SECRET_KEY))
        .ok_or_else(|| {
            MessageError(format!("Secret was missing key {PARAMS_SECRET_KEY:?}"))
        })?;
    serde_json::from_slice(&raw.0)
        .map_err(|e| MessageError(format!("couldn't unmarshal params from Secret: {e}")))
}

/// Platform context sent with provision and bind requests
pub(crate) fn osb_context(instance: &ServiceInstance, namespace: &Namespace) -> JsonObject {
    let namespace_uid = namespace.uid().unwrap_or_default();
    let namespace_name = namespace.name_any();
    let mut context = JsonObject::new();
    context.insert("platform".into(), Value::from("kf"));
    context.insert("instance_name".into(), Value::from(instance.name_any()));
    context.insert("organization_guid".into(), Value::from(namespace_uid.clone()));
    context.insert("organization_name".into(), Value::from(namespace_name.clone()));
    context.insert("space_guid".into(), Value::from(namespace_uid));
    context.insert("space_name".into(), Value::from(namespace_name));
    context.insert(
        "namespace".into(),
        Value::from(instance.namespace().unwrap_or_default()),
    );
    context
}

pub fn provision_request(
    instance: &ServiceInstance,
    namespace: &Namespace,
    params_secret: &Secret,
) -> Result<ProvisionRequest, MessageError> {
    let parameters = params_from_secret(params_secret)?;
    let (service_id, plan_id) = service_and_plan(instance);
    let namespace_uid = namespace.uid().unwrap_or_default();
    Ok(ProvisionRequest {
        instance_id: instance.uid().unwrap_or_default(),
        accepts_incomplete: true,
        service_id,
        plan_id,
        organization_guid: namespace_uid.clone(),
        space_guid: namespace_uid,
        parameters: Some(parameters),
        context: osb_context(instance, namespace),
    })
}

pub fn deprovision_request(instance: &ServiceInstance) -> DeprovisionRequest {
    let (service_id, plan_id) = service_and_plan(instance);
    DeprovisionRequest {
        instance_id: instance.uid().unwrap_or_default(),
        accepts_incomplete: true,
        service_id,
        plan_id,
    }
}

pub fn last_operation_request(
    instance: &ServiceInstance,
    operation_key: Option<&str>,
) -> LastOperationRequest {
    let (service_id, plan_id) = service_and_plan(instance);
    LastOperationRequest {
        instance_id: instance.uid().unwrap_or_default(),
        service_id: Some(service_id),
        plan_id: Some(plan_id),
        operation_key: operation_key.map(str::to_string),
    }
}
