//! # ServiceInstanceBinding
//!
//! A ServiceInstanceBinding attaches a ServiceInstance to an App or Route and
//! materializes the binding credentials into a Secret.

use crate::constants::{DEFAULT_PROGRESS_DEADLINE_SECONDS, PARAMS_SECRET_KEY};
use crate::crd::condition::{
    Condition, ConditionSet, MessageError, SingleCondition, CONDITION_READY,
};
use crate::crd::osb_status::BindingOsbStatus;
use crate::crd::service_broker::LocalObjectReference;
use crate::crd::service_instance::{propagate_params_populated, ServiceInstance};
use crate::osb::error::{is_deleted_error, is_retryable_error};
use crate::osb::types::{
    format_operation_message, BindResponse, LastOperationResponse, LastOperationState,
    UnbindResponse,
};
use k8s_openapi::api::core::v1::Secret;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BINDING_CONDITION_SERVICE_INSTANCE_READY: &str = "ServiceInstanceReady";
pub const BINDING_CONDITION_BACKING_RESOURCE_READY: &str = "BackingResourceReady";
pub const BINDING_CONDITION_PARAMS_SECRET_READY: &str = "ParamsSecretReady";
pub const BINDING_CONDITION_PARAMS_SECRET_POPULATED_READY: &str = "ParamsSecretPopulatedReady";
pub const BINDING_CONDITION_CREDENTIALS_SECRET_READY: &str = "CredentialsSecretReady";
pub const BINDING_CONDITION_VOLUME_PARAMS_POPULATED_READY: &str = "VolumeParamsPopulatedReady";

pub const BINDING_CONDITION_SET: ConditionSet = ConditionSet::new(&[
    BINDING_CONDITION_SERVICE_INSTANCE_READY,
    BINDING_CONDITION_BACKING_RESOURCE_READY,
    BINDING_CONDITION_PARAMS_SECRET_READY,
    BINDING_CONDITION_PARAMS_SECRET_POPULATED_READY,
    BINDING_CONDITION_CREDENTIALS_SECRET_READY,
    BINDING_CONDITION_VOLUME_PARAMS_POPULATED_READY,
]);

/// ServiceInstanceBinding Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: kf.dev/v1alpha1
/// kind: ServiceInstanceBinding
/// metadata:
///   name: my-app-my-db
///   namespace: my-space
/// spec:
///   app:
///     name: my-app
///   instanceRef:
///     name: my-db
///   parametersFrom:
///     name: my-app-my-db-params
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "ServiceInstanceBinding",
    group = "kf.dev",
    version = "v1alpha1",
    namespaced,
    status = "ServiceInstanceBindingStatus",
    shortname = "sib",
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.app.name"}, {"name":"Instance", "type":"string", "jsonPath":".spec.instanceRef.name"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceBindingSpec {
    /// App the instance is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<LocalObjectReference>,
    /// Route the instance is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteRef>,
    /// ServiceInstance in the same namespace
    pub instance_ref: LocalObjectReference,
    /// Secret holding the JSON binding parameters under the key `params`
    #[serde(default)]
    pub parameters_from: LocalObjectReference,
    /// Name applications see the binding under; defaults to the instance name
    #[serde(default)]
    pub binding_name_override: String,
    #[serde(default)]
    pub progress_deadline_seconds: i64,
    /// Incrementing this asks the controller to retry a failed unbind
    #[serde(default)]
    pub unbind_requests: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RouteRef {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

/// Volume mount settings resolved for a binding to a volume instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct BindingVolumeStatus {
    pub mount: String,
    #[serde(default, rename = "volumeName")]
    pub persistent_volume_name: String,
    #[serde(default, rename = "claimName")]
    pub persistent_volume_claim_name: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, rename = "UID", skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, rename = "GID", skip_serializing_if = "String::is_empty")]
    pub gid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub binding_name: String,
    /// Secret holding the resolved credentials; written once
    #[serde(default)]
    pub credentials_secret_ref: LocalObjectReference,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub plan_name: String,
    #[serde(
        default,
        rename = "routeServiceURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub route_service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_status: Option<BindingVolumeStatus>,
    #[serde(default)]
    pub osb_status: BindingOsbStatus,
    /// Last `spec.unbindRequests` acted upon
    #[serde(default)]
    pub unbind_requests: i64,
}

impl ServiceInstanceBindingSpec {
    pub fn set_defaults(&mut self) {
        if self.progress_deadline_seconds == 0 {
            self.progress_deadline_seconds = DEFAULT_PROGRESS_DEADLINE_SECONDS;
        }
    }

    pub fn progress_deadline(&self) -> chrono::Duration {
        let seconds = if self.progress_deadline_seconds > 0 {
            self.progress_deadline_seconds
        } else {
            DEFAULT_PROGRESS_DEADLINE_SECONDS
        };
        chrono::Duration::seconds(seconds)
    }
}

/// Parse a UID/GID value given as a string or a number
fn parse_id(value: Option<&Value>) -> Result<Option<String>, MessageError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .parse::<u32>()
            .map(|id| Some(id.to_string()))
            .map_err(|_| MessageError(s.clone())),
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|id| u32::try_from(*id).is_ok())
            .map(|id| Some(id.to_string()))
            .ok_or_else(|| MessageError(n.to_string())),
        Some(other) => Err(MessageError(other.to_string())),
    }
}

impl ServiceInstanceBindingStatus {
    pub fn initialize_conditions(&mut self) {
        BINDING_CONDITION_SET
            .manage(&mut self.conditions)
            .initialize_conditions();
    }

    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    pub fn ready_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            CONDITION_READY,
            "ServiceInstanceBinding",
        )
    }

    pub fn service_instance_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            BINDING_CONDITION_SERVICE_INSTANCE_READY,
            "ServiceInstance",
        )
    }

    pub fn backing_resource_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            BINDING_CONDITION_BACKING_RESOURCE_READY,
            "BackingResource",
        )
    }

    pub fn params_secret_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            BINDING_CONDITION_PARAMS_SECRET_READY,
            "ParamsSecret",
        )
    }

    pub fn params_secret_populated_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            BINDING_CONDITION_PARAMS_SECRET_POPULATED_READY,
            "ParamsSecretPopulated",
        )
    }

    pub fn credentials_secret_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            BINDING_CONDITION_CREDENTIALS_SECRET_READY,
            "CredentialsSecret",
        )
    }

    pub fn volume_params_populated_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BINDING_CONDITION_SET,
            &mut self.conditions,
            BINDING_CONDITION_VOLUME_PARAMS_POPULATED_READY,
            "VolumeParamsPopulated",
        )
    }

    pub fn propagate_params_secret_status(&mut self, secret: Option<&Secret>) {
        let Some(secret) = secret else {
            self.params_secret_condition().mark_unknown(
                "SecretMissing",
                "Secret for binding parameters doesn't exist",
            );
            return;
        };

        self.params_secret_condition().mark_success();
        propagate_params_populated(&mut self.params_secret_populated_condition(), secret);
    }

    /// Validate the volume mount parameters for bindings to volume instances
    pub fn propagate_volume_status(&mut self, instance: &ServiceInstance, secret: &Secret) {
        let Some(instance_volume) = instance
            .status
            .as_ref()
            .and_then(|s| s.volume_status.as_ref())
        else {
            self.volume_params_populated_condition().mark_success();
            return;
        };

        let Some(params_json) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(PARAMS_SECRET_KEY))
        else {
            self.volume_params_populated_condition().mark_false(
                "ParamsMissing",
                &format!("Secret is missing key {PARAMS_SECRET_KEY:?}"),
            );
            return;
        };

        let params: serde_json::Map<String, Value> = match serde_json::from_slice(&params_json.0)
        {
            Ok(params) => params,
            Err(e) => {
                self.volume_params_populated_condition().mark_false(
                    "ParamsInvalid",
                    &format!("failed to unmarshal params from Secret: {e}"),
                );
                return;
            }
        };

        let Ok(uid) = parse_id(params.get("UID")) else {
            self.volume_params_populated_condition()
                .mark_false("Invalid UID", "UID needs to be non-negative integers");
            return;
        };
        let Ok(gid) = parse_id(params.get("GID")) else {
            self.volume_params_populated_condition()
                .mark_false("Invalid GID", "GID need to be non-negative integers");
            return;
        };

        let mount = params
            .get("mount")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if mount.is_empty() {
            self.volume_params_populated_condition()
                .mark_false("mount missing", "Mount Path is required for VolumeBindings");
            return;
        }

        self.volume_status = Some(BindingVolumeStatus {
            mount: mount.to_string(),
            persistent_volume_name: instance_volume.persistent_volume_name.clone(),
            persistent_volume_claim_name: instance_volume.persistent_volume_claim_name.clone(),
            readonly: params
                .get("readonly")
                .and_then(Value::as_bool)
                .unwrap_or_default(),
            uid: uid.unwrap_or_default(),
            gid: gid.unwrap_or_default(),
        });
        self.volume_params_populated_condition().mark_success();
    }

    /// Record the credentials Secret; `None` clears the reference
    pub fn propagate_credentials_secret_status(&mut self, secret: Option<&Secret>) {
        let Some(secret) = secret else {
            self.credentials_secret_ref.name = String::new();
            self.credentials_secret_condition().mark_unknown(
                "SecretMissing",
                "Secret for binding credentials doesn't exist",
            );
            return;
        };
        self.credentials_secret_ref.name = secret.metadata.name.clone().unwrap_or_default();
        self.credentials_secret_condition().mark_success();
    }

    pub fn propagate_service_fields_status(&mut self, instance: &ServiceInstance) {
        let status = instance.status.clone().unwrap_or_default();
        self.tags = status.tags;
        self.class_name = status.class_name;
        self.plan_name = status.plan_name;
    }

    /// Mirror the instance Ready condition onto ServiceInstanceReady
    pub fn propagate_service_instance_status(&mut self, instance: &ServiceInstance) {
        let source = instance
            .status
            .as_ref()
            .and_then(|s| s.get_condition(CONDITION_READY));
        self.service_instance_condition().propagate(source);
    }

    pub fn propagate_binding_name_status(&mut self, spec: &ServiceInstanceBindingSpec) {
        self.binding_name = if spec.binding_name_override.is_empty() {
            spec.instance_ref.name.clone()
        } else {
            spec.binding_name_override.clone()
        };
    }

    pub fn propagate_route_service_url_status(&mut self, instance: &ServiceInstance) {
        self.route_service_url = instance
            .status
            .as_ref()
            .and_then(|s| s.route_service_url.clone());
    }

    /// Always true if no backing resource exists
    pub fn mark_backing_resource_ready(&mut self) {
        self.backing_resource_condition().mark_success();
    }

    pub fn propagate_terminating_status(&mut self) {
        self.ready_condition()
            .mark_false("Terminating", "resource is terminating");
    }

    /// Apply the result of a bind call
    pub fn propagate_bind_status(
        &mut self,
        result: Result<&BindResponse, &(dyn std::error::Error + 'static)>,
    ) {
        match result {
            Err(err) => {
                self.backing_resource_condition()
                    .mark_reconciliation_error("Binding", err);
                self.osb_status = BindingOsbStatus::BindFailed;
            }
            Ok(response) if response.is_async => {
                self.backing_resource_condition()
                    .mark_unknown("BindingAsync", "operation is pending");
                self.osb_status = BindingOsbStatus::Binding {
                    operation_key: response.operation_key.clone(),
                };
            }
            Ok(_) => {
                self.backing_resource_condition().mark_success();
                self.osb_status = BindingOsbStatus::Bound;
            }
        }
    }

    /// Apply the result of polling a pending bind
    pub fn propagate_bind_last_operation_status(
        &mut self,
        result: Result<&LastOperationResponse, &(dyn std::error::Error + 'static)>,
    ) {
        let mut condition = self.backing_resource_condition();
        let next = match result {
            Err(err) if is_retryable_error(err) => {
                condition.mark_unknown(
                    "BindingAsync",
                    &format!("temporary error while polling: {err}"),
                );
                None
            }
            Err(err) => {
                condition.mark_reconciliation_error("PollingOperation", err);
                Some(BindingOsbStatus::BindFailed)
            }
            Ok(response) => match &response.state {
                LastOperationState::InProgress => {
                    condition.mark_unknown(
                        "BindingAsync",
                        &format_operation_message(Some(response)),
                    );
                    None
                }
                LastOperationState::Succeeded => {
                    condition.mark_success();
                    Some(BindingOsbStatus::Bound)
                }
                LastOperationState::Failed => {
                    let err = MessageError(format!(
                        "bind failed: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("BindFailed", &err);
                    Some(BindingOsbStatus::BindFailed)
                }
                LastOperationState::Unknown(_) => {
                    let err = MessageError(format!(
                        "unknown state: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("UnknownState", &err);
                    Some(BindingOsbStatus::BindFailed)
                }
            },
        };
        if let Some(next) = next {
            self.osb_status = next;
        }
    }

    /// Apply the result of an unbind call
    pub fn propagate_unbind_status(
        &mut self,
        result: Result<&UnbindResponse, &(dyn std::error::Error + 'static)>,
    ) {
        match result {
            Err(err) if is_deleted_error(err) => {
                self.backing_resource_condition().mark_success();
                self.osb_status = BindingOsbStatus::Unbound;
            }
            Err(err) => {
                self.backing_resource_condition()
                    .mark_reconciliation_error("Unbinding", err);
                self.osb_status = BindingOsbStatus::UnbindFailed;
            }
            Ok(response) if response.is_async => {
                self.backing_resource_condition()
                    .mark_unknown("Unbinding", "operation is pending");
                self.osb_status = BindingOsbStatus::Unbinding {
                    operation_key: response.operation_key.clone(),
                };
            }
            Ok(_) => {
                self.backing_resource_condition().mark_success();
                self.osb_status = BindingOsbStatus::Unbound;
            }
        }
    }

    /// Apply the result of polling a pending unbind
    pub fn propagate_unbind_last_operation_status(
        &mut self,
        result: Result<&LastOperationResponse, &(dyn std::error::Error + 'static)>,
    ) {
        let mut condition = self.backing_resource_condition();
        let next = match result {
            Err(err) if is_retryable_error(err) => {
                condition.mark_unknown(
                    "PollingOperation",
                    &format!("temporary error while polling: {err}"),
                );
                None
            }
            Err(err) if is_deleted_error(err) => {
                condition.mark_success();
                Some(BindingOsbStatus::Unbound)
            }
            Err(err) => {
                condition.mark_reconciliation_error("PollingOperation", err);
                Some(BindingOsbStatus::UnbindFailed)
            }
            Ok(response) => match &response.state {
                LastOperationState::InProgress => {
                    condition.mark_unknown(
                        "UnbindingAsync",
                        &format_operation_message(Some(response)),
                    );
                    None
                }
                LastOperationState::Succeeded => {
                    condition.mark_success();
                    Some(BindingOsbStatus::Unbound)
                }
                LastOperationState::Failed => {
                    let err = MessageError(format!(
                        "unbind failed: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("UnbindFailed", &err);
                    Some(BindingOsbStatus::UnbindFailed)
                }
                LastOperationState::Unknown(_) => {
                    let err = MessageError(format!(
                        "unknown state: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("UnknownState", &err);
                    Some(BindingOsbStatus::UnbindFailed)
                }
            },
        };
        if let Some(next) = next {
            self.osb_status = next;
        }
    }
}
