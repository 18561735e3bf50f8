//! # Service Brokers
//!
//! `ServiceBroker` (namespaced) and `ClusterServiceBroker` (cluster-scoped)
//! point at a broker credentials Secret and cache the broker catalog in status.

use crate::crd::condition::{Condition, ConditionSet, SingleCondition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const BROKER_CONDITION_CREDS_SECRET_READY: &str = "CredsSecretReady";
pub const BROKER_CONDITION_CREDS_SECRET_POPULATED_READY: &str = "CredsSecretPopulatedReady";
pub const BROKER_CONDITION_CATALOG_READY: &str = "CatalogReady";

pub const BROKER_CONDITION_SET: ConditionSet = ConditionSet::new(&[
    BROKER_CONDITION_CREDS_SECRET_READY,
    BROKER_CONDITION_CREDS_SECRET_POPULATED_READY,
    BROKER_CONDITION_CATALOG_READY,
]);

/// Reference to a Secret in the broker's own namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct LocalObjectReference {
    #[serde(default)]
    pub name: String,
}

/// Reference to a Secret in any namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NamespacedObjectReference {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// ServiceBroker registers an OSB broker for a single namespace
///
/// # Example
///
/// ```yaml
/// apiVersion: kf.dev/v1alpha1
/// kind: ServiceBroker
/// metadata:
///   name: my-broker
///   namespace: my-space
/// spec:
///   credentials:
///     name: my-broker-creds
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "ServiceBroker",
    group = "kf.dev",
    version = "v1alpha1",
    namespaced,
    status = "ServiceBrokerStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    /// Secret of type `kf.dev/servicebrokercreds` in the same namespace
    pub credentials: LocalObjectReference,
    /// Incrementing this refetches the catalog
    #[serde(default)]
    pub update_requests: i64,
}

/// ClusterServiceBroker registers an OSB broker for every namespace
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "ClusterServiceBroker",
    group = "kf.dev",
    version = "v1alpha1",
    status = "ServiceBrokerStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerSpec {
    pub credentials: NamespacedObjectReference,
    #[serde(default)]
    pub update_requests: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Last `spec.updateRequests` acted upon
    #[serde(default)]
    pub update_requests: i64,
    /// Offerings from the broker catalog
    #[serde(default)]
    pub services: Vec<ServiceOffering>,
}

/// A service advertised by a broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOffering {
    pub display_name: String,
    pub uid: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plans: Vec<ServicePlan>,
}

/// A plan of a service offering
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlan {
    pub display_name: String,
    pub uid: String,
    pub free: bool,
    #[serde(default)]
    pub description: String,
}

impl ServiceBrokerStatus {
    pub fn initialize_conditions(&mut self) {
        BROKER_CONDITION_SET
            .manage(&mut self.conditions)
            .initialize_conditions();
    }

    pub fn creds_secret_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BROKER_CONDITION_SET,
            &mut self.conditions,
            BROKER_CONDITION_CREDS_SECRET_READY,
            "CredsSecret",
        )
    }

    pub fn creds_secret_populated_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BROKER_CONDITION_SET,
            &mut self.conditions,
            BROKER_CONDITION_CREDS_SECRET_POPULATED_READY,
            "CredsSecretPopulated",
        )
    }

    pub fn catalog_condition(&mut self) -> SingleCondition<'_> {
        SingleCondition::new(
            BROKER_CONDITION_SET,
            &mut self.conditions,
            BROKER_CONDITION_CATALOG_READY,
            "Catalog",
        )
    }

    /// Ready once the catalog has been fetched for the current `updateRequests`
    pub fn catalog_is_current(&mut self, update_requests: i64) -> bool {
        self.update_requests == update_requests
            && self
                .catalog_condition()
                .get()
                .is_some_and(Condition::is_true)
    }

    pub fn propagate_terminating(&mut self) {
        BROKER_CONDITION_SET.manage(&mut self.conditions).mark_false(
            crate::crd::condition::CONDITION_READY,
            "Terminating",
            "resource is terminating",
        );
    }
}
