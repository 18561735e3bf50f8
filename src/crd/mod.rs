//! # Custom Resource Definitions
//!
//! CRD types for the Service Catalog Controller.
//!
//! All resources live in the `kf.dev/v1alpha1` API group:
//!
//! - [`ServiceInstance`] and [`ServiceInstanceBinding`], driven through the OSB lifecycle
//! - [`ServiceBroker`] and [`ClusterServiceBroker`], which cache a broker catalog
//! - [`Space`], whose existence marks a namespace as able to host services

pub mod condition;
pub mod osb_status;
pub mod service_broker;
pub mod service_instance;
pub mod service_instance_binding;

pub use condition::{Condition, ConditionError, ConditionStatus, CONDITION_READY};
pub use osb_status::{BindingOsbStatus, InstanceOsbStatus};
pub use service_broker::{
    ClusterServiceBroker, ClusterServiceBrokerSpec, LocalObjectReference,
    NamespacedObjectReference, ServiceBroker, ServiceBrokerSpec, ServiceBrokerStatus,
    ServiceOffering, ServicePlan,
};
pub use service_instance::{
    OsbInstance, ServiceCategory, ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus,
    UserProvidedInstance,
};
pub use service_instance_binding::{
    ServiceInstanceBinding, ServiceInstanceBindingSpec, ServiceInstanceBindingStatus,
};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Space Custom Resource Definition
///
/// A Space shares its name with the namespace it governs. This controller only
/// checks that it exists.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(kind = "Space", group = "kf.dev", version = "v1alpha1")]
#[allow(
    clippy::empty_structs_with_brackets,
    reason = "spec must serialize as an empty object"
)]
pub struct SpaceSpec {}
