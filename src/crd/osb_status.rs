//! # OSB Status
//!
//! Lifecycle state of the broker side of an instance or binding.
//!
//! In memory the state is an enum so exactly one variant holds at a time.
//! On the wire it keeps the one-populated-field object shape:
//!
//! ```yaml
//! osbStatus:
//!   provisioning:
//!     operationKey: op-1
//! ```
//!
//! An empty object is `Blank`. Documents with more than one populated field are rejected.

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Payload of a populated state field
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OsbState {
    /// Broker operation key for long running operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_key: Option<String>,
}

impl OsbState {
    fn with_key(operation_key: Option<String>) -> Self {
        Self { operation_key }
    }
}

/// Broker state of a ServiceInstance.
///
/// The failed states carry no reason; it is kept on the BackingResourceReady
/// condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "InstanceOsbStatusFields", into = "InstanceOsbStatusFields")]
pub enum InstanceOsbStatus {
    #[default]
    Blank,
    Provisioning {
        operation_key: Option<String>,
    },
    Provisioned,
    ProvisionFailed,
    Deprovisioning {
        operation_key: Option<String>,
    },
    Deprovisioned,
    DeprovisionFailed,
}

impl InstanceOsbStatus {
    pub fn is_blank(&self) -> bool {
        matches!(self, InstanceOsbStatus::Blank)
    }

    pub fn operation_key(&self) -> Option<&str> {
        match self {
            InstanceOsbStatus::Provisioning { operation_key }
            | InstanceOsbStatus::Deprovisioning { operation_key } => operation_key.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct InstanceOsbStatusFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisioning: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisioned: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provision_failed: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deprovisioning: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deprovisioned: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deprovision_failed: Option<OsbState>,
}

impl TryFrom<InstanceOsbStatusFields> for InstanceOsbStatus {
    type Error = String;

    fn try_from(fields: InstanceOsbStatusFields) -> Result<Self, Self::Error> {
        let populated: Vec<InstanceOsbStatus> = [
            fields.provisioning.map(|s| InstanceOsbStatus::Provisioning {
                operation_key: s.operation_key,
            }),
            fields.provisioned.map(|_| InstanceOsbStatus::Provisioned),
            fields
                .provision_failed
                .map(|_| InstanceOsbStatus::ProvisionFailed),
            fields.deprovisioning.map(|s| InstanceOsbStatus::Deprovisioning {
                operation_key: s.operation_key,
            }),
            fields.deprovisioned.map(|_| InstanceOsbStatus::Deprovisioned),
            fields
                .deprovision_failed
                .map(|_| InstanceOsbStatus::DeprovisionFailed),
        ]
        .into_iter()
        .flatten()
        .collect();

        single_state(populated)
    }
}

impl From<InstanceOsbStatus> for InstanceOsbStatusFields {
    fn from(status: InstanceOsbStatus) -> Self {
        let mut fields = InstanceOsbStatusFields::default();
        match status {
            InstanceOsbStatus::Blank => {}
            InstanceOsbStatus::Provisioning { operation_key } => {
                fields.provisioning = Some(OsbState::with_key(operation_key));
            }
            InstanceOsbStatus::Provisioned => fields.provisioned = Some(OsbState::default()),
            InstanceOsbStatus::ProvisionFailed => {
                fields.provision_failed = Some(OsbState::default());
            }
            InstanceOsbStatus::Deprovisioning { operation_key } => {
                fields.deprovisioning = Some(OsbState::with_key(operation_key));
            }
            InstanceOsbStatus::Deprovisioned => fields.deprovisioned = Some(OsbState::default()),
            InstanceOsbStatus::DeprovisionFailed => {
                fields.deprovision_failed = Some(OsbState::default());
            }
        }
        fields
    }
}

impl JsonSchema for InstanceOsbStatus {
    fn schema_name() -> Cow<'static, str> {
        "InstanceOsbStatus".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        InstanceOsbStatusFields::json_schema(generator)
    }
}

/// Broker state of a ServiceInstanceBinding.
///
/// As with instances, the reason for a failed state is on the
/// BackingResourceReady condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "BindingOsbStatusFields", into = "BindingOsbStatusFields")]
pub enum BindingOsbStatus {
    #[default]
    Blank,
    Binding {
        operation_key: Option<String>,
    },
    Bound,
    BindFailed,
    Unbinding {
        operation_key: Option<String>,
    },
    Unbound,
    UnbindFailed,
}

impl BindingOsbStatus {
    pub fn is_blank(&self) -> bool {
        matches!(self, BindingOsbStatus::Blank)
    }

    pub fn operation_key(&self) -> Option<&str> {
        match self {
            BindingOsbStatus::Binding { operation_key }
            | BindingOsbStatus::Unbinding { operation_key } => operation_key.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct BindingOsbStatusFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    binding: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bound: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bind_failed: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unbinding: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unbound: Option<OsbState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unbind_failed: Option<OsbState>,
}

impl TryFrom<BindingOsbStatusFields> for BindingOsbStatus {
    type Error = String;

    fn try_from(fields: BindingOsbStatusFields) -> Result<Self, Self::Error> {
        let populated: Vec<BindingOsbStatus> = [
            fields.binding.map(|s| BindingOsbStatus::Binding {
                operation_key: s.operation_key,
            }),
            fields.bound.map(|_| BindingOsbStatus::Bound),
            fields.bind_failed.map(|_| BindingOsbStatus::BindFailed),
            fields.unbinding.map(|s| BindingOsbStatus::Unbinding {
                operation_key: s.operation_key,
            }),
            fields.unbound.map(|_| BindingOsbStatus::Unbound),
            fields.unbind_failed.map(|_| BindingOsbStatus::UnbindFailed),
        ]
        .into_iter()
        .flatten()
        .collect();

        single_state(populated)
    }
}

impl From<BindingOsbStatus> for BindingOsbStatusFields {
    fn from(status: BindingOsbStatus) -> Self {
        let mut fields = BindingOsbStatusFields::default();
        match status {
            BindingOsbStatus::Blank => {}
            BindingOsbStatus::Binding { operation_key } => {
                fields.binding = Some(OsbState::with_key(operation_key));
            }
            BindingOsbStatus::Bound => fields.bound = Some(OsbState::default()),
            BindingOsbStatus::BindFailed => fields.bind_failed = Some(OsbState::default()),
            BindingOsbStatus::Unbinding { operation_key } => {
                fields.unbinding = Some(OsbState::with_key(operation_key));
            }
            BindingOsbStatus::Unbound => fields.unbound = Some(OsbState::default()),
            BindingOsbStatus::UnbindFailed => fields.unbind_failed = Some(OsbState::default()),
        }
        fields
    }
}

impl JsonSchema for BindingOsbStatus {
    fn schema_name() -> Cow<'static, str> {
        "BindingOsbStatus".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        BindingOsbStatusFields::json_schema(generator)
    }
}

fn single_state<T: Default>(mut populated: Vec<T>) -> Result<T, String> {
    match populated.len() {
        0 => Ok(T::default()),
        1 => Ok(populated.remove(0)),
        n => Err(format!(
            "osbStatus must have at most one populated field, found {n}"
        )),
    }
}
