//! # OSB Protocol Types
//!
//! Request and response records for the broker operations the controller uses.
//! Path parameters are skipped during serialization; the remaining fields form the JSON body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// JSON object used for parameters, context and credentials
pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvisionRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<JsonObject>,
    pub context: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprovisionResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

/// Poll request for an instance operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

/// Poll request for a binding operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

/// State of a long running broker operation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum LastOperationState {
    InProgress,
    Succeeded,
    Failed,
    /// Any state outside the protocol
    Unknown(String),
}

impl From<String> for LastOperationState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "in progress" => LastOperationState::InProgress,
            "succeeded" => LastOperationState::Succeeded,
            "failed" => LastOperationState::Failed,
            _ => LastOperationState::Unknown(state),
        }
    }
}

impl From<LastOperationState> for String {
    fn from(state: LastOperationState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for LastOperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastOperationState::InProgress => f.write_str("in progress"),
            LastOperationState::Succeeded => f.write_str("succeeded"),
            LastOperationState::Failed => f.write_str("failed"),
            LastOperationState::Unknown(state) => f.write_str(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Human readable summary of a poll response
pub fn format_operation_message(response: Option<&LastOperationResponse>) -> String {
    let Some(response) = response else {
        return "(nil operation)".to_string();
    };
    let mut message = format!("operation state: {:?}", response.state.to_string());
    if let Some(description) = &response.description {
        message.push_str(&format!(" description: {description:?}"));
    }
    message
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BindRequest {
    #[serde(skip)]
    pub binding_id: String,
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<JsonObject>,
    pub context: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindResponse {
    pub is_async: bool,
    pub credentials: Option<JsonObject>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnbindResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GetBindingResponse {
    #[serde(default)]
    pub credentials: JsonObject,
}

/// `GET /v2/catalog` response
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub services: Vec<CatalogService>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plans: Vec<CatalogPlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Absent means the plan is free
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
}

/// Body of 200/201/202 responses to provision, bind, deprovision and unbind
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct AsyncOperationBody {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub credentials: Option<JsonObject>,
}

/// Body of broker error responses
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
