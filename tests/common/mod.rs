//! Mock Open Service Broker
//!
//! An axum server on an ephemeral port. Each broker operation answers from a
//! queue of scripted responses, falling back to a success answer, and every
//! request is recorded for later assertions.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub const USERNAME: &str = "broker-user";
pub const PASSWORD: &str = "broker-pass";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub operation: &'static str,
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub api_version: Option<String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
pub struct MockBroker {
    responses: Mutex<HashMap<&'static str, VecDeque<(StatusCode, Value)>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockBroker {
    /// Queue the next answer for `operation`
    pub fn respond(&self, operation: &'static str, status: StatusCode, body: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back((status, body));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last(&self, operation: &str) -> RecordedRequest {
        self.requests()
            .into_iter()
            .rev()
            .find(|r| r.operation == operation)
            .unwrap_or_else(|| panic!("no {operation} request recorded"))
    }

    fn next(&self, operation: &'static str) -> (StatusCode, Value) {
        self.responses
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| default_response(operation))
    }
}

fn default_response(operation: &str) -> (StatusCode, Value) {
    match operation {
        "get_catalog" => (StatusCode::OK, json!({"services": []})),
        "provision" | "bind" => (StatusCode::CREATED, json!({})),
        "last_operation" | "binding_last_operation" => {
            (StatusCode::OK, json!({"state": "succeeded"}))
        }
        "get_binding" => (StatusCode::OK, json!({"credentials": {}})),
        "unknown" => (StatusCode::NOT_FOUND, json!({})),
        _ => (StatusCode::OK, json!({})),
    }
}

/// Name the broker operation a request addresses
fn operation(method: &Method, path: &str) -> &'static str {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["v2", "catalog"]) => "get_catalog",
        (&Method::PUT, ["v2", "service_instances", _]) => "provision",
        (&Method::DELETE, ["v2", "service_instances", _]) => "deprovision",
        (&Method::GET, ["v2", "service_instances", _, "last_operation"]) => "last_operation",
        (&Method::PUT, ["v2", "service_instances", _, "service_bindings", _]) => "bind",
        (&Method::DELETE, ["v2", "service_instances", _, "service_bindings", _]) => "unbind",
        (&Method::GET, ["v2", "service_instances", _, "service_bindings", _]) => "get_binding",
        (&Method::GET, ["v2", "service_instances", _, "service_bindings", _, "last_operation"]) => {
            "binding_last_operation"
        }
        _ => "unknown",
    }
}

async fn handle(
    State(broker): State<Arc<MockBroker>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let operation = operation(&method, uri.path());
    let query = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    broker.requests.lock().unwrap().push(RecordedRequest {
        operation,
        method,
        path: uri.path().to_string(),
        query,
        api_version: header("x-broker-api-version"),
        authorization: header("authorization"),
        body: serde_json::from_slice(&body).ok(),
    });

    let (status, body) = broker.next(operation);
    (status, axum::Json(body)).into_response()
}

/// Start a mock broker and return its base URL
pub async fn start() -> (String, Arc<MockBroker>) {
    let broker = Arc::new(MockBroker::default());
    let app = Router::new()
        .fallback(handle)
        .with_state(Arc::clone(&broker));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), broker)
}
