//! Broker requests for a ServiceInstanceBinding.
//!
//! The binding UID is the broker's binding id; the instance UID identifies the
//! instance it belongs to.

use crate::controller::service_instance::requests::{
    osb_context, params_from_secret, service_and_plan,
};
use crate::crd::condition::MessageError;
use crate::crd::{ServiceInstance, ServiceInstanceBinding};
use crate::osb::types::{
    BindRequest, BindingLastOperationRequest, GetBindingRequest, UnbindRequest,
};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::ResourceExt;

fn ids(instance: &ServiceInstance, binding: &ServiceInstanceBinding) -> (String, String) {
    (
        instance.uid().unwrap_or_default(),
        binding.uid().unwrap_or_default(),
    )
}

pub fn bind_request(
    instance: &ServiceInstance,
    binding: &ServiceInstanceBinding,
    namespace: &Namespace,
    params_secret: &Secret,
) -> Result<BindRequest, MessageError> {
    let parameters = params_from_secret(params_secret)?;
    let (instance_id, binding_id) = ids(instance, binding);
    let (service_id, plan_id) = service_and_plan(instance);
    Ok(BindRequest {
        binding_id,
        instance_id,
        accepts_incomplete: true,
        service_id,
        plan_id,
        parameters: Some(parameters),
        context: osb_context(instance, namespace),
    })
}

pub fn unbind_request(instance: &ServiceInstance, binding: &ServiceInstanceBinding) -> UnbindRequest {
    let (instance_id, binding_id) = ids(instance, binding);
    let (service_id, plan_id) = service_and_plan(instance);
    UnbindRequest {
        instance_id,
        binding_id,
        accepts_incomplete: true,
        service_id,
        plan_id,
    }
}

pub fn binding_last_operation_request(
    instance: &ServiceInstance,
    binding: &ServiceInstanceBinding,
    operation_key: Option<&str>,
) -> BindingLastOperationRequest {
    let (instance_id, binding_id) = ids(instance, binding);
    let (service_id, plan_id) = service_and_plan(instance);
    BindingLastOperationRequest {
        instance_id,
        binding_id,
        service_id: Some(service_id),
        plan_id: Some(plan_id),
        operation_key: operation_key.map(str::to_string),
    }
}

pub fn get_binding_request(
    instance: &ServiceInstance,
    binding: &ServiceInstanceBinding,
) -> GetBindingRequest {
    let (instance_id, binding_id) = ids(instance, binding);
    GetBindingRequest {
        instance_id,
        binding_id,
    }
}
