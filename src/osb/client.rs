//! # OSB Client
//!
//! The [`OsbClient`] trait is the only way reconcilers talk to a service broker.
//! [`HttpOsbClient`] implements it over HTTP with basic auth.

use crate::observability::metrics;
use crate::osb::error::OsbError;
use crate::osb::types::{
    AsyncOperationBody, BindRequest, BindResponse, BindingLastOperationRequest, CatalogResponse,
    DeprovisionRequest, DeprovisionResponse, ErrorBody, GetBindingRequest, GetBindingResponse,
    LastOperationRequest, LastOperationResponse, ProvisionRequest, ProvisionResponse,
    UnbindRequest, UnbindResponse,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, Instrument};

#[cfg(test)]
use mockall::automock;

/// Header carrying the OSB API version on every request
pub const API_VERSION_HEADER: &str = "X-Broker-API-Version";

/// Operations the controller needs from a service broker
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OsbClient: Send + Sync {
    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError>;

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError>;

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError>;

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError>;

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError>;

    async fn get_binding(&self, request: &GetBindingRequest)
        -> Result<GetBindingResponse, OsbError>;

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;
}

/// Settings for one broker connection
#[derive(Debug, Clone)]
pub struct HttpOsbClientConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub api_version: String,
    pub timeout: Duration,
}

/// OSB client speaking HTTP to a single broker
#[derive(Debug, Clone)]
pub struct HttpOsbClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    api_version: String,
}

impl HttpOsbClient {
    /// Build a client for the broker at `config.url`
    pub fn new(config: HttpOsbClientConfig) -> Result<Self, OsbError> {
        let parsed = reqwest::Url::parse(&config.url)
            .map_err(|e| OsbError::Configuration(format!("invalid broker url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(OsbError::Configuration(format!(
                "invalid broker url: unsupported scheme {:?}",
                parsed.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
            api_version: config.api_version,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
            .header(API_VERSION_HEADER, &self.api_version)
    }

    /// Send a request and record the outcome under `operation`
    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response, OsbError> {
        let span = tracing::span!(
            tracing::Level::DEBUG,
            "osb.request",
            osb.operation = operation
        );
        let start = Instant::now();
        let result = builder.send().instrument(span).await;
        let outcome = match &result {
            Ok(response) if response.status().is_success() => "success",
            _ => "error",
        };
        metrics::record_osb_request(operation, outcome, start.elapsed().as_secs_f64());
        let response = result?;
        debug!(
            osb.operation = operation,
            status = response.status().as_u16(),
            "broker responded"
        );
        Ok(response)
    }
}

fn instance_path(instance_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}")
}

fn binding_path(instance_id: &str, binding_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}/service_bindings/{binding_id}")
}

fn optional_query(pairs: &[(&'static str, Option<&String>)]) -> Vec<(&'static str, String)> {
    pairs
        .iter()
        .filter_map(|(k, v)| v.map(|v| (*k, v.clone())))
        .collect()
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, OsbError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| OsbError::Decode(e.to_string()))
}

/// Decode a body that may legitimately be empty
async fn decode_optional<T: DeserializeOwned + Default>(response: Response) -> Result<T, OsbError> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| OsbError::Decode(e.to_string()))
}

async fn http_error(response: Response) -> OsbError {
    let status = response.status().as_u16();
    let body: ErrorBody = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => ErrorBody::default(),
    };
    OsbError::Http {
        status,
        error: body.error,
        description: body.description,
    }
}

#[async_trait]
impl OsbClient for HttpOsbClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        let response = self
            .send("get_catalog", self.request(Method::GET, "/v2/catalog"))
            .await?;
        if response.status() != StatusCode::OK {
            return Err(http_error(response).await);
        }
        decode(response).await
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError> {
        let builder = self
            .request(Method::PUT, &instance_path(&request.instance_id))
            .query(&[("accepts_incomplete", request.accepts_incomplete)])
            .json(request);
        let response = self.send("provision", builder).await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body: AsyncOperationBody = decode_optional(response).await?;
                Ok(ProvisionResponse {
                    is_async: false,
                    dashboard_url: body.dashboard_url,
                    operation_key: None,
                })
            }
            StatusCode::ACCEPTED => {
                let body: AsyncOperationBody = decode_optional(response).await?;
                Ok(ProvisionResponse {
                    is_async: true,
                    dashboard_url: body.dashboard_url,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(response).await),
        }
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError> {
        let builder = self
            .request(Method::DELETE, &instance_path(&request.instance_id))
            .query(&[
                ("accepts_incomplete", request.accepts_incomplete.to_string()),
                ("service_id", request.service_id.clone()),
                ("plan_id", request.plan_id.clone()),
            ]);
        let response = self.send("deprovision", builder).await?;

        match response.status() {
            StatusCode::OK | StatusCode::GONE => Ok(DeprovisionResponse::default()),
            StatusCode::ACCEPTED => {
                let body: AsyncOperationBody = decode_optional(response).await?;
                Ok(DeprovisionResponse {
                    is_async: true,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(response).await),
        }
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let path = format!("{}/last_operation", instance_path(&request.instance_id));
        let builder = self.request(Method::GET, &path).query(&optional_query(&[
            ("service_id", request.service_id.as_ref()),
            ("plan_id", request.plan_id.as_ref()),
            ("operation", request.operation_key.as_ref()),
        ]));
        let response = self.send("poll_last_operation", builder).await?;

        if response.status() != StatusCode::OK {
            return Err(http_error(response).await);
        }
        decode(response).await
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        let builder = self
            .request(
                Method::PUT,
                &binding_path(&request.instance_id, &request.binding_id),
            )
            .query(&[("accepts_incomplete", request.accepts_incomplete)])
            .json(request);
        let response = self.send("bind", builder).await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body: AsyncOperationBody = decode_optional(response).await?;
                Ok(BindResponse {
                    is_async: false,
                    credentials: body.credentials,
                    operation_key: None,
                })
            }
            StatusCode::ACCEPTED => {
                let body: AsyncOperationBody = decode_optional(response).await?;
                Ok(BindResponse {
                    is_async: true,
                    credentials: None,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(response).await),
        }
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        let builder = self
            .request(
                Method::DELETE,
                &binding_path(&request.instance_id, &request.binding_id),
            )
            .query(&[
                ("accepts_incomplete", request.accepts_incomplete.to_string()),
                ("service_id", request.service_id.clone()),
                ("plan_id", request.plan_id.clone()),
            ]);
        let response = self.send("unbind", builder).await?;

        match response.status() {
            StatusCode::OK | StatusCode::GONE => Ok(UnbindResponse::default()),
            StatusCode::ACCEPTED => {
                let body: AsyncOperationBody = decode_optional(response).await?;
                Ok(UnbindResponse {
                    is_async: true,
                    operation_key: body.operation,
                })
            }
            _ => Err(http_error(response).await),
        }
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, OsbError> {
        let builder = self.request(
            Method::GET,
            &binding_path(&request.instance_id, &request.binding_id),
        );
        let response = self.send("get_binding", builder).await?;

        if response.status() != StatusCode::OK {
            return Err(http_error(response).await);
        }
        decode(response).await
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let path = format!(
            "{}/last_operation",
            binding_path(&request.instance_id, &request.binding_id)
        );
        let builder = self.request(Method::GET, &path).query(&optional_query(&[
            ("service_id", request.service_id.as_ref()),
            ("plan_id", request.plan_id.as_ref()),
            ("operation", request.operation_key.as_ref()),
        ]));
        let response = self.send("poll_binding_last_operation", builder).await?;

        if response.status() != StatusCode::OK {
            return Err(http_error(response).await);
        }
        decode(response).await
    }
}
