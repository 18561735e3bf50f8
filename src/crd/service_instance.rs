//! # ServiceInstance
//!
//! A ServiceInstance represents a provisioned service: user-provided, brokered
//! through OSB, volume backed, or (no longer supported) brokered through the
//! Kubernetes Service Catalog.
//!
//! The `propagate_*` methods translate observations (Secrets, Deployments,
//! broker responses) into status conditions and the OSB state.

use crate::constants::{
    BROKERED_SERVICE_DESCRIPTION, DEFAULT_PROGRESS_DEADLINE_SECONDS, PARAMS_SECRET_KEY,
    USER_PROVIDED_SERVICE_CLASS_NAME, USER_PROVIDED_SERVICE_DESCRIPTION,
    VOLUME_SERVICE_DESCRIPTION,
};
use crate::crd::condition::{
    Condition, ConditionSet, MessageError, SingleCondition, CONDITION_READY,
};
use crate::crd::osb_status::InstanceOsbStatus;
use crate::crd::service_broker::LocalObjectReference;
use crate::osb::error::{is_deleted_error, is_retryable_error};
use crate::osb::types::{
    format_operation_message, DeprovisionResponse, LastOperationResponse, LastOperationState,
    ProvisionResponse,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const SERVICE_INSTANCE_CONDITION_SPACE_READY: &str = "SpaceReady";
pub const SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY: &str = "BackingResourceReady";
pub const SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_READY: &str = "ParamsSecretReady";
pub const SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_POPULATED_READY: &str =
    "ParamsSecretPopulatedReady";

pub const SERVICE_INSTANCE_CONDITION_SET: ConditionSet = ConditionSet::new(&[
    SERVICE_INSTANCE_CONDITION_SPACE_READY,
    SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY,
    SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_READY,
    SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_POPULATED_READY,
]);

/// ServiceInstance Custom Resource Definition
///
/// Exactly one of `userProvided`, `brokered`, `osb` or `volume` is set.
///
/// # Example
///
/// ```yaml
/// apiVersion: kf.dev/v1alpha1
/// kind: ServiceInstance
/// metadata:
///   name: my-db
///   namespace: my-space
/// spec:
///   osb:
///     brokerName: my-broker
///     namespaced: true
///     classUID: 1b2c...
///     className: mysql
///     planUID: 9f8e...
///     planName: small
///   parametersFrom:
///     name: my-db-params
///   tags: [sql]
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "ServiceInstance",
    group = "kf.dev",
    version = "v1alpha1",
    namespaced,
    status = "ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Class", "type":"string", "jsonPath":".status.className"}, {"name":"Plan", "type":"string", "jsonPath":".status.planName"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_provided: Option<UserProvidedInstance>,
    /// Kubernetes Service Catalog instance (deprecated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brokered: Option<BrokeredInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osb: Option<OsbInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<OsbInstance>,
    /// Tags exposed to applications through VCAP_SERVICES
    #[serde(default)]
    pub tags: Vec<String>,
    /// Secret holding the JSON provisioning parameters under the key `params`
    #[serde(default)]
    pub parameters_from: LocalObjectReference,
    /// Incrementing this asks the controller to retry a failed delete
    #[serde(default)]
    pub delete_requests: i64,
}

/// A user-provided service, optionally acting as a route service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProvidedInstance {
    #[serde(
        default,
        rename = "routeServiceURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub route_service_url: Option<String>,
    /// Overrides the class name shown to applications
    #[serde(default)]
    pub mock_class_name: String,
    #[serde(default)]
    pub mock_plan_name: String,
}

/// An instance owned by the Kubernetes Service Catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokeredInstance {
    #[serde(default)]
    pub broker: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub plan_name: String,
    #[serde(default)]
    pub namespaced: bool,
}

/// An instance provisioned through a kf ServiceBroker or ClusterServiceBroker
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OsbInstance {
    #[serde(default)]
    pub broker_name: String,
    /// True selects a namespaced ServiceBroker, false a ClusterServiceBroker
    #[serde(default)]
    pub namespaced: bool,
    #[serde(default, rename = "classUID")]
    pub class_uid: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default, rename = "planUID")]
    pub plan_uid: String,
    #[serde(default)]
    pub plan_name: String,
    /// Seconds an operation may stay pending before it is failed
    #[serde(default)]
    pub progress_deadline_seconds: i64,
}

/// Names of the volume objects backing a volume instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct VolumeStatus {
    #[serde(default, rename = "PersistentVolumeName")]
    pub persistent_volume_name: String,
    #[serde(default, rename = "PersistentVolumeClaimName")]
    pub persistent_volume_claim_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// `user-provided`, `brokered` or `volume`
    #[serde(default)]
    pub service_type_description: String,
    /// Name of the parameters Secret once it has been found
    #[serde(default)]
    pub secret_name: String,
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
    #[serde(default)]
    pub osb_status: InstanceOsbStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_status: Option<VolumeStatus>,
    /// Last `spec.deleteRequests` acted upon
    #[serde(default)]
    pub delete_requests: i64,
}

/// Parameters of a volume instance, read from its params Secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeInstanceParams {
    /// NFS share as `server/path`
    #[serde(default)]
    pub share: String,
    #[serde(default)]
    pub capacity: String,
    #[serde(default)]
    pub version: String,
}

impl VolumeInstanceParams {
    /// Parse the parameters stored in the instance params Secret
    pub fn from_secret(secret: &Secret) -> Result<Self, MessageError> {
        let params = secret
            .data
            .as_ref()
            .and_then(|data| data.get(PARAMS_SECRET_KEY))
            .ok_or_else(|| {
                MessageError(format!("secret is missing key {PARAMS_SECRET_KEY:?}"))
            })?;
        serde_json::from_slice(&params.0)
            .map_err(|e| MessageError(format!("failed to unmarshal params: {e}")))
    }

    /// Split the share into NFS server and path
    pub fn server_and_path(&self) -> Result<(String, String), MessageError> {
        match self.share.split_once('/') {
            Some((server, path)) if !server.is_empty() => {
                Ok((server.to_string(), format!("/{path}")))
            }
            _ => Err(MessageError(format!(
                "share {:?} must be in the form server/path",
                self.share
            ))),
        }
    }
}

/// The kind of service behind an instance, decided once per reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCategory<'a> {
    UserProvided(&'a UserProvidedInstance),
    LegacyBrokered(&'a BrokeredInstance),
    Osb(&'a OsbInstance),
    Volume(&'a OsbInstance),
    Undetermined,
}

impl ServiceInstanceSpec {
    pub fn category(&self) -> ServiceCategory<'_> {
        if let Some(ups) = &self.user_provided {
            ServiceCategory::UserProvided(ups)
        } else if let Some(brokered) = &self.brokered {
            ServiceCategory::LegacyBrokered(brokered)
        } else if let Some(osb) = &self.osb {
            ServiceCategory::Osb(osb)
        } else if let Some(volume) = &self.volume {
            ServiceCategory::Volume(volume)
        } else {
            ServiceCategory::Undetermined
        }
    }

    /// Instances whose lifecycle does not involve a broker
    pub fn has_no_backing_resources(&self) -> bool {
        self.user_provided.is_some() || self.volume.is_some()
    }

    pub fn is_kf_brokered(&self) -> bool {
        self.osb.is_some()
    }

    /// Route service URL when the instance is a user-provided route service
    pub fn route_service_url(&self) -> Option<&str> {
        self.user_provided
            .as_ref()
            .and_then(|ups| ups.route_service_url.as_deref())
    }

    /// Broker backed settings for OSB and volume instances
    pub fn broker_settings(&self) -> Option<&OsbInstance> {
        self.osb.as_ref().or(self.volume.as_ref())
    }

    pub fn set_defaults(&mut self) {
        for instance in [self.osb.as_mut(), self.volume.as_mut()].into_iter().flatten() {
            if instance.progress_deadline_seconds == 0 {
                instance.progress_deadline_seconds = DEFAULT_PROGRESS_DEADLINE_SECONDS;
            }
        }
    }

    /// Deadline for pending broker operations
    pub fn progress_deadline(&self) -> chrono::Duration {
        let seconds = self
            .broker_settings()
            .map(|s| s.progress_deadline_seconds)
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS);
        chrono::Duration::seconds(seconds)
    }
}

impl ServiceInstanceStatus {
    pub fn initialize_conditions(&mut self) {
        SERVICE_INSTANCE_CONDITION_SET
            .manage(&mut self.conditions)
            .initialize_conditions();
    }

    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    pub fn is_ready(&self) -> bool {
        self.get_condition(CONDITION_READY)
            .is_some_and(Condition::is_true)
    }

    pub fn ready_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            SERVICE_INSTANCE_CONDITION_SET,
            &mut self.conditions,
            CONDITION_READY,
            "ServiceInstance",
        )
    }

    pub fn space_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            SERVICE_INSTANCE_CONDITION_SET,
            &mut self.conditions,
            SERVICE_INSTANCE_CONDITION_SPACE_READY,
            "Space",
        )
    }

    pub fn backing_resource_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            SERVICE_INSTANCE_CONDITION_SET,
            &mut self.conditions,
            SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY,
            "BackingResource",
        )
    }

    pub fn params_secret_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            SERVICE_INSTANCE_CONDITION_SET,
            &mut self.conditions,
            SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_READY,
            "ParamsSecret",
        )
    }

    pub fn params_secret_populated_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            SERVICE_INSTANCE_CONDITION_SET,
            &mut self.conditions,
            SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_POPULATED_READY,
            "ParamsSecretPopulated",
        )
    }

    /// Record whether the parameters Secret exists and holds valid JSON
    pub fn propagate_secret_status(&mut self, secret: Option<&Secret>) {
        let Some(secret) = secret else {
            self.params_secret_condition().mark_unknown(
                "SecretMissing",
                "Secret for instance parameters does not exist",
            );
            return;
        };

        self.secret_name = secret.metadata.name.clone().unwrap_or_default();
        self.params_secret_condition().mark_success();
        propagate_params_populated(&mut self.params_secret_populated_condition(), secret);
    }

    /// Copy tags, class and plan from the spec
    pub fn propagate_service_fields_status(&mut self, spec: &ServiceInstanceSpec) {
        self.tags.clone_from(&spec.tags);
        let (description, class_name, plan_name) = match spec.category() {
            ServiceCategory::UserProvided(ups) => {
                let class_name = if ups.mock_class_name.is_empty() {
                    USER_PROVIDED_SERVICE_CLASS_NAME.to_string()
                } else {
                    ups.mock_class_name.clone()
                };
                (
                    USER_PROVIDED_SERVICE_DESCRIPTION,
                    class_name,
                    ups.mock_plan_name.clone(),
                )
            }
            ServiceCategory::LegacyBrokered(brokered) => (
                BROKERED_SERVICE_DESCRIPTION,
                brokered.class_name.clone(),
                brokered.plan_name.clone(),
            ),
            ServiceCategory::Osb(osb) => (
                BROKERED_SERVICE_DESCRIPTION,
                osb.class_name.clone(),
                osb.plan_name.clone(),
            ),
            ServiceCategory::Volume(volume) => (
                VOLUME_SERVICE_DESCRIPTION,
                volume.class_name.clone(),
                volume.plan_name.clone(),
            ),
            ServiceCategory::Undetermined => return,
        };
        self.service_type_description = description.to_string();
        self.class_name = class_name;
        self.plan_name = plan_name;
    }

    pub fn propagate_route_service_url_status(&mut self, spec: &ServiceInstanceSpec) {
        self.route_service_url = spec.route_service_url().map(str::to_string);
    }

    pub fn propagate_volume_service_status(
        &mut self,
        spec: &ServiceInstanceSpec,
        volume_name: &str,
        volume_claim_name: &str,
    ) {
        self.volume_status = spec.volume.is_some().then(|| VolumeStatus {
            persistent_volume_name: volume_name.to_string(),
            persistent_volume_claim_name: volume_claim_name.to_string(),
        });
    }

    /// Reflect the route service proxy Deployment rollout on BackingResourceReady
    pub fn propagate_deployment_status(&mut self, deployment: &Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let status = deployment.status.clone().unwrap_or_default();
        let conditions = status.conditions.clone().unwrap_or_default();
        let mut backing = self.backing_resource_condition();

        if let Some(failure) = conditions
            .iter()
            .find(|c| c.type_ == "ReplicaFailure" && c.status == "True")
        {
            backing.mark_false(
                failure.reason.as_deref().unwrap_or_default(),
                failure.message.as_deref().unwrap_or_default(),
            );
            return;
        }

        if deployment.metadata.generation.unwrap_or_default()
            > status.observed_generation.unwrap_or_default()
        {
            backing.mark_unknown(
                "GenerationOutOfDate",
                "waiting for deployment spec update to be observed",
            );
            return;
        }

        if conditions.iter().any(|c| {
            c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        }) {
            backing.mark_false(
                "DeadlineExceeded",
                &format!("deployment {name:?} exceeded its progress deadline"),
            );
            return;
        }

        let updated = status.updated_replicas.unwrap_or_default();
        let replicas = status.replicas.unwrap_or_default();
        let available = status.available_replicas.unwrap_or_default();
        if let Some(desired) = deployment.spec.as_ref().and_then(|s| s.replicas) {
            if updated < desired {
                backing.mark_unknown(
                    "UpdatingReplicas",
                    &format!(
                        "waiting for deployment {name:?} rollout to finish: {updated} out of {desired} new replicas have been updated"
                    ),
                );
                return;
            }
        }
        if replicas > updated {
            backing.mark_unknown(
                "TerminatingOldReplicas",
                &format!(
                    "waiting for deployment {name:?} rollout to finish: {} old replicas are pending termination",
                    replicas - updated
                ),
            );
            return;
        }
        if available < updated {
            backing.mark_unknown(
                "InitializingPods",
                &format!(
                    "waiting for deployment {name:?} rollout to finish: {available} of {updated} updated replicas are available"
                ),
            );
            return;
        }

        backing.mark_success();
    }

    /// Ready False while bindings still reference a deleted instance
    pub fn propagate_deletion_blocked_status(&mut self) {
        self.ready_condition().mark_false(
            "DeletionBlocked",
            "ServiceInstance is part of a service binding",
        );
    }

    pub fn propagate_terminating_status(&mut self) {
        self.ready_condition()
            .mark_false("Terminating", "resource is terminating");
    }

    pub fn mark_space_healthy(&mut self) {
        self.space_condition().mark_success();
    }

    pub fn mark_space_unhealthy(&mut self, reason: &str, message: &str) {
        self.space_condition().mark_false(reason, message);
    }

    /// Always true for instances without a backing resource
    pub fn mark_backing_resource_ready(&mut self) {
        self.backing_resource_condition().mark_success();
    }

    /// Apply the result of a provision call
    pub fn propagate_provision_status(
        &mut self,
        result: Result<&ProvisionResponse, &(dyn std::error::Error + 'static)>,
    ) {
        match result {
            Err(err) => {
                let wrapped = MessageError(format!("couldn't provision: {err}"));
                self.backing_resource_condition()
                    .mark_reconciliation_error("ProvisioningInstance", &wrapped);
                self.osb_status = InstanceOsbStatus::ProvisionFailed;
            }
            Ok(response) if response.is_async => {
                self.osb_status = InstanceOsbStatus::Provisioning {
                    operation_key: response.operation_key.clone(),
                };
                self.backing_resource_condition()
                    .mark_unknown("ProvisioningInstance", "operation is pending");
            }
            Ok(_) => {
                self.osb_status = InstanceOsbStatus::Provisioned;
                self.backing_resource_condition().mark_success();
            }
        }
    }

    /// Apply the result of polling a pending provision
    pub fn propagate_provision_async_status(
        &mut self,
        result: Result<&LastOperationResponse, &(dyn std::error::Error + 'static)>,
    ) {
        let mut condition = self.backing_resource_condition();
        let next = match result {
            Err(err) if is_retryable_error(err) => {
                condition.mark_unknown(
                    "ProvisioningInstance",
                    &format!("temporary error while polling: {err}"),
                );
                None
            }
            Err(err) => {
                condition.mark_reconciliation_error("PollingOperation", err);
                Some(InstanceOsbStatus::ProvisionFailed)
            }
            Ok(response) => match &response.state {
                LastOperationState::InProgress => {
                    condition.mark_unknown(
                        "ProvisioningInstance",
                        &format_operation_message(Some(response)),
                    );
                    None
                }
                LastOperationState::Succeeded => {
                    condition.mark_success();
                    Some(InstanceOsbStatus::Provisioned)
                }
                LastOperationState::Failed => {
                    let err = MessageError(format!(
                        "provision failed: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("ProvisionFailed", &err);
                    Some(InstanceOsbStatus::ProvisionFailed)
                }
                LastOperationState::Unknown(_) => {
                    let err = MessageError(format!(
                        "unknown state: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("UnknownState", &err);
                    Some(InstanceOsbStatus::ProvisionFailed)
                }
            },
        };
        if let Some(next) = next {
            self.osb_status = next;
        }
    }

    /// Apply the result of a deprovision call
    pub fn propagate_deprovision_status(
        &mut self,
        result: Result<&DeprovisionResponse, &(dyn std::error::Error + 'static)>,
    ) {
        match result {
            Err(err) if is_deleted_error(err) => {
                self.backing_resource_condition().mark_success();
                self.osb_status = InstanceOsbStatus::Deprovisioned;
            }
            Err(err) => {
                self.osb_status = InstanceOsbStatus::DeprovisionFailed;
                self.backing_resource_condition()
                    .mark_reconciliation_error("DeprovisioningInstance", err);
            }
            Ok(response) if response.is_async => {
                self.osb_status = InstanceOsbStatus::Deprovisioning {
                    operation_key: response.operation_key.clone(),
                };
                self.backing_resource_condition()
                    .mark_unknown("DeprovisioningInstance", "operation is pending");
            }
            Ok(_) => {
                self.osb_status = InstanceOsbStatus::Deprovisioned;
                self.backing_resource_condition().mark_success();
            }
        }
    }

    /// Apply the result of polling a pending deprovision
    pub fn propagate_deprovision_async_status(
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
                Some(InstanceOsbStatus::Deprovisioned)
            }
            Err(err) => {
                condition.mark_reconciliation_error("PollingOperation", err);
                Some(InstanceOsbStatus::DeprovisionFailed)
            }
            Ok(response) => match &response.state {
                LastOperationState::InProgress => {
                    condition.mark_unknown(
                        "DeprovisioningInstance",
                        &format_operation_message(Some(response)),
                    );
                    None
                }
                LastOperationState::Succeeded => {
                    condition.mark_success();
                    Some(InstanceOsbStatus::Deprovisioned)
                }
                LastOperationState::Failed => {
                    let err = MessageError(format!(
                        "deprovision failed: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("DeprovisionFailed", &err);
                    Some(InstanceOsbStatus::DeprovisionFailed)
                }
                LastOperationState::Unknown(_) => {
                    let err = MessageError(format!(
                        "unknown state: {}",
                        format_operation_message(Some(response))
                    ));
                    condition.mark_reconciliation_error("UnknownState", &err);
                    Some(InstanceOsbStatus::DeprovisionFailed)
                }
            },
        };
        if let Some(next) = next {
            self.osb_status = next;
        }
    }
}

/// Check the `params` key of a parameters Secret
pub(crate) fn propagate_params_populated(condition: &mut SingleCondition<'_>, secret: &Secret) {
    match secret
        .data
        .as_ref()
        .and_then(|data| data.get(PARAMS_SECRET_KEY))
    {
        None => condition.mark_unknown(
            "SecretNotPopulated",
            &format!("secret is missing key: {PARAMS_SECRET_KEY:?}"),
        ),
        Some(contents) if serde_json::from_slice::<serde_json::Value>(&contents.0).is_err() => {
            condition.mark_false(
                "SecretInvalid",
                &format!("secret key {PARAMS_SECRET_KEY:?} must be valid JSON"),
            );
        }
        Some(_) => condition.mark_success(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::condition::ConditionStatus;
    use crate::osb::error::OsbError;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn params_secret(params: Option<&str>) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("params".to_string());
        secret.data = params.map(|p| {
            BTreeMap::from([(
                PARAMS_SECRET_KEY.to_string(),
                ByteString(p.as_bytes().to_vec()),
            )])
        });
        secret
    }

    fn reason(status: &ServiceInstanceStatus, condition_type: &str) -> Option<String> {
        status
            .get_condition(condition_type)
            .and_then(|c| c.reason.clone())
    }

    #[test]
    fn test_set_defaults_fills_progress_deadline() {
        let mut spec = ServiceInstanceSpec {
            osb: Some(OsbInstance::default()),
            ..ServiceInstanceSpec::default()
        };
        spec.set_defaults();
        assert_eq!(
            spec.osb.map(|o| o.progress_deadline_seconds),
            Some(DEFAULT_PROGRESS_DEADLINE_SECONDS)
        );
    }

    #[test]
    fn test_category_dispatch() {
        let spec = ServiceInstanceSpec {
            user_provided: Some(UserProvidedInstance::default()),
            ..ServiceInstanceSpec::default()
        };
        assert!(matches!(spec.category(), ServiceCategory::UserProvided(_)));
        assert!(spec.has_no_backing_resources());
        assert_eq!(
            ServiceInstanceSpec::default().category(),
            ServiceCategory::Undetermined
        );
    }

    #[test]
    fn test_propagate_secret_status() {
        let mut status = ServiceInstanceStatus::default();
        status.initialize_conditions();

        status.propagate_secret_status(None);
        assert_eq!(
            reason(&status, SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_READY).as_deref(),
            Some("SecretMissing")
        );

        status.propagate_secret_status(Some(&params_secret(None)));
        assert_eq!(status.secret_name, "params");
        assert_eq!(
            reason(&status, SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_POPULATED_READY).as_deref(),
            Some("SecretNotPopulated")
        );

        status.propagate_secret_status(Some(&params_secret(Some("{not json"))));
        assert_eq!(
            reason(&status, SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_POPULATED_READY).as_deref(),
            Some("SecretInvalid")
        );

        status.propagate_secret_status(Some(&params_secret(Some("{}"))));
        assert!(status
            .get_condition(SERVICE_INSTANCE_CONDITION_PARAMS_SECRET_POPULATED_READY)
            .is_some_and(Condition::is_true));
    }

    #[test]
    fn test_user_provided_class_defaults() {
        let spec = ServiceInstanceSpec {
            user_provided: Some(UserProvidedInstance {
                route_service_url: Some("https://proxy.example.com".to_string()),
                ..UserProvidedInstance::default()
            }),
            tags: vec!["a".to_string()],
            ..ServiceInstanceSpec::default()
        };
        let mut status = ServiceInstanceStatus::default();
        status.propagate_service_fields_status(&spec);
        status.propagate_route_service_url_status(&spec);
        assert_eq!(status.class_name, USER_PROVIDED_SERVICE_CLASS_NAME);
        assert_eq!(status.service_type_description, "user-provided");
        assert_eq!(
            status.route_service_url.as_deref(),
            Some("https://proxy.example.com")
        );
    }

    #[test]
    fn test_provision_status_transitions() {
        let mut status = ServiceInstanceStatus::default();
        status.initialize_conditions();

        status.propagate_provision_status(Ok(&ProvisionResponse {
            is_async: true,
            operation_key: Some("op-1".to_string()),
            ..ProvisionResponse::default()
        }));
        assert_eq!(status.osb_status.operation_key(), Some("op-1"));

        let err = OsbError::http(reqwest::StatusCode::SERVICE_UNAVAILABLE);
        status.propagate_provision_async_status(Err(&err));
        assert_eq!(status.osb_status.operation_key(), Some("op-1"));

        status.propagate_provision_async_status(Ok(&LastOperationResponse {
            state: LastOperationState::Succeeded,
            description: None,
        }));
        assert_eq!(status.osb_status, InstanceOsbStatus::Provisioned);
        assert!(status
            .get_condition(SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY)
            .is_some_and(Condition::is_true));
    }

    #[test]
    fn test_provision_failure_message() {
        let mut status = ServiceInstanceStatus::default();
        status.initialize_conditions();
        let err = OsbError::http(reqwest::StatusCode::BAD_REQUEST);
        status.propagate_provision_status(Err(&err));

        assert_eq!(status.osb_status, InstanceOsbStatus::ProvisionFailed);
        let condition = status
            .get_condition(SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY)
            .cloned();
        assert_eq!(
            condition.and_then(|c| c.message),
            Some(
                "Error occurred while ProvisioningInstance BackingResource: couldn't provision: Status: 400; ErrorMessage: <nil>; Description: <nil>"
                    .to_string()
            )
        );
    }

    #[test]
    fn test_deprovision_gone_is_deprovisioned() {
        let mut status = ServiceInstanceStatus {
            osb_status: InstanceOsbStatus::Provisioned,
            ..ServiceInstanceStatus::default()
        };
        let err = OsbError::http(reqwest::StatusCode::GONE);
        status.propagate_deprovision_status(Err(&err));
        assert_eq!(status.osb_status, InstanceOsbStatus::Deprovisioned);
    }

    #[test]
    fn test_deprovision_poll_failed() {
        let mut status = ServiceInstanceStatus {
            osb_status: InstanceOsbStatus::Deprovisioning {
                operation_key: None,
            },
            ..ServiceInstanceStatus::default()
        };
        status.initialize_conditions();
        status.propagate_deprovision_async_status(Ok(&LastOperationResponse {
            state: LastOperationState::Failed,
            description: Some("busy".to_string()),
        }));
        assert_eq!(status.osb_status, InstanceOsbStatus::DeprovisionFailed);
        assert_eq!(
            status
                .get_condition(CONDITION_READY)
                .map(|c| c.status),
            Some(ConditionStatus::False)
        );
    }

    #[test]
    fn test_deployment_waiting_for_generation() {
        let mut deployment = Deployment::default();
        deployment.metadata.generation = Some(2);
        deployment.status = Some(k8s_openapi::api::apps::v1::DeploymentStatus {
            observed_generation: Some(1),
            ..Default::default()
        });
        let mut status = ServiceInstanceStatus::default();
        status.propagate_deployment_status(&deployment);
        assert_eq!(
            reason(&status, SERVICE_INSTANCE_CONDITION_BACKING_RESOURCE_READY).as_deref(),
            Some("GenerationOutOfDate")
        );
    }
}
