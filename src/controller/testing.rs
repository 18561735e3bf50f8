//! In-memory collaborators for reconciler tests.
//!
//! [`MemoryStore`] keeps objects as JSON, bumps `resourceVersion` on every
//! write and rejects stale writes with a conflict. [`FakeBroker`] answers from
//! scripted queues and records every call.

use crate::config::ControllerConfig;
use crate::constants::{BROKER_CREDS_SECRET_TYPE, PARAMS_SECRET_KEY};
use crate::controller::context::Context;
use crate::controller::store::{ResourceStore, StoreError};
use crate::crd::{
    ClusterServiceBroker, LocalObjectReference, OsbInstance, ServiceBroker, ServiceBrokerSpec,
    ServiceInstance, ServiceInstanceBinding, ServiceInstanceBindingSpec, ServiceInstanceSpec,
    Space, SpaceSpec,
};
use crate::osb::error::OsbError;
use crate::osb::types::{
    BindRequest, BindResponse, BindingLastOperationRequest, CatalogResponse, DeprovisionRequest,
    DeprovisionResponse, GetBindingRequest, GetBindingResponse, LastOperationRequest,
    LastOperationResponse, LastOperationState, ProvisionRequest, ProvisionResponse, UnbindRequest,
    UnbindResponse,
};
use crate::osb::{OsbClient, OsbClientFactory};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "my-space";
pub const NAMESPACE_UID: &str = "namespace-uid";
pub const BROKER_NAME: &str = "my-broker";
pub const INSTANCE_NAME: &str = "my-db";
pub const INSTANCE_UID: &str = "instance-uid";
pub const INSTANCE_PARAMS: &str = "my-db-params";
pub const BINDING_NAME: &str = "my-binding";
pub const BINDING_UID: &str = "binding-uid";
pub const BINDING_PARAMS: &str = "my-binding-params";

type Key = (String, String, String);

/// A write made against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub op: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    writes: Mutex<Vec<Write>>,
    version: AtomicU64,
}

fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).into_owned(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn key_of<K: Resource<DynamicType = ()>>(obj: &K) -> Key {
    key::<K>(&obj.namespace().unwrap_or_default(), &obj.name_any())
}

fn to_value<K: Serialize>(obj: &K) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Other(e.to_string()))
}

fn from_value<K: DeserializeOwned>(value: Value) -> Result<K, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Other(e.to_string()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> Value {
        Value::String((self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    fn record(&self, op: &'static str, key: &Key) {
        self.writes.lock().unwrap().push(Write {
            op,
            kind: key.0.clone(),
            name: key.2.clone(),
        });
    }

    /// Seed an object without recording a write
    pub fn insert<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut value = to_value(obj).unwrap();
        value["metadata"]["resourceVersion"] = self.next_version();
        self.objects.lock().unwrap().insert(key_of(obj), value);
    }

    /// Current copy of an object
    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.read::<K>(namespace, name).unwrap()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }

    pub fn status_writes(&self, kind: &str) -> usize {
        self.writes()
            .iter()
            .filter(|w| w.op == "update_status" && w.kind == kind)
            .count()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    fn read<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let value = self
            .objects
            .lock()
            .unwrap()
            .get(&key::<K>(namespace, name))
            .cloned();
        value.map(from_value).transpose()
    }

    fn list<K>(&self, namespace: &str) -> Result<Vec<K>, StoreError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = K::kind(&()).into_owned();
        let values: Vec<Value> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        values.into_iter().map(from_value).collect()
    }

    fn create<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = key_of(obj);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.2));
        }
        let mut value = to_value(obj)?;
        value["metadata"]["resourceVersion"] = self.next_version();
        objects.insert(key.clone(), value.clone());
        drop(objects);
        self.record("create", &key);
        from_value(value)
    }

    /// Replace everything but the status
    fn replace<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        self.write(obj, "replace", |stored, mut incoming| {
            if let Some(status) = stored.get("status") {
                incoming["status"] = status.clone();
            } else if let Some(map) = incoming.as_object_mut() {
                map.remove("status");
            }
            incoming
        })
    }

    /// Replace only the status
    fn update_status<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        self.write(obj, "update_status", |stored, incoming| {
            let mut next = stored.clone();
            next["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
            next
        })
    }

    fn write<K>(
        &self,
        obj: &K,
        op: &'static str,
        merge: impl FnOnce(&Value, Value) -> Value,
    ) -> Result<K, StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = key_of(obj);
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get(&key) else {
            return Err(StoreError::NotFound(key.2));
        };
        let stored_version = stored["metadata"]["resourceVersion"].clone();
        if let Some(version) = obj.resource_version() {
            if Value::String(version) != stored_version {
                return Err(StoreError::Conflict(format!(
                    "the object {} has been modified",
                    key.2
                )));
            }
        }
        let mut next = merge(stored, to_value(obj)?);
        next["metadata"]["resourceVersion"] = self.next_version();
        objects.insert(key.clone(), next.clone());
        drop(objects);
        self.record(op, &key);
        from_value(next)
    }

    fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), StoreError>
    where
        K: Resource<DynamicType = ()>,
    {
        let key = key::<K>(namespace, name);
        if self.objects.lock().unwrap().remove(&key).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.record("delete", &key);
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_service_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>, StoreError> {
        self.read(namespace, name)
    }

    async fn replace_service_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError> {
        self.replace(instance)
    }

    async fn update_service_instance_status(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError> {
        self.update_status(instance)
    }

    async fn get_service_instance_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstanceBinding>, StoreError> {
        self.read(namespace, name)
    }

    async fn list_service_instance_bindings(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceInstanceBinding>, StoreError> {
        self.list(namespace)
    }

    async fn replace_service_instance_binding(
        &self,
        binding: &ServiceInstanceBinding,
    ) -> Result<ServiceInstanceBinding, StoreError> {
        self.replace(binding)
    }

    async fn update_service_instance_binding_status(
        &self,
        binding: &ServiceInstanceBinding,
    ) -> Result<ServiceInstanceBinding, StoreError> {
        self.update_status(binding)
    }

    async fn get_service_broker(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceBroker>, StoreError> {
        self.read(namespace, name)
    }

    async fn update_service_broker_status(
        &self,
        broker: &ServiceBroker,
    ) -> Result<ServiceBroker, StoreError> {
        self.update_status(broker)
    }

    async fn get_cluster_service_broker(
        &self,
        name: &str,
    ) -> Result<Option<ClusterServiceBroker>, StoreError> {
        self.read("", name)
    }

    async fn update_cluster_service_broker_status(
        &self,
        broker: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, StoreError> {
        self.update_status(broker)
    }

    async fn get_space(&self, name: &str) -> Result<Option<Space>, StoreError> {
        self.read("", name)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        self.read("", name)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        self.read(namespace, name)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.create(secret)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.replace(secret)
    }

    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolume>, StoreError> {
        self.read("", name)
    }

    async fn create_persistent_volume(
        &self,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError> {
        self.create(volume)
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<(), StoreError> {
        self.delete::<PersistentVolume>("", name)
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        self.read(namespace, name)
    }

    async fn create_persistent_volume_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        self.create(claim)
    }

    async fn delete_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.delete::<PersistentVolumeClaim>(namespace, name)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        self.read(namespace, name)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.create(deployment)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.replace(deployment)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, StoreError> {
        self.read(namespace, name)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError> {
        self.create(service)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, StoreError> {
        self.replace(service)
    }
}

/// Broker that answers from per-operation queues.
///
/// An empty queue answers with a synchronous success.
#[derive(Debug, Default)]
pub struct FakeBroker {
    pub provision: Mutex<VecDeque<Result<ProvisionResponse, OsbError>>>,
    pub deprovision: Mutex<VecDeque<Result<DeprovisionResponse, OsbError>>>,
    pub last_operation: Mutex<VecDeque<Result<LastOperationResponse, OsbError>>>,
    pub bind: Mutex<VecDeque<Result<BindResponse, OsbError>>>,
    pub unbind: Mutex<VecDeque<Result<UnbindResponse, OsbError>>>,
    pub get_binding: Mutex<VecDeque<Result<GetBindingResponse, OsbError>>>,
    pub binding_last_operation: Mutex<VecDeque<Result<LastOperationResponse, OsbError>>>,
    pub catalog: Mutex<VecDeque<Result<CatalogResponse, OsbError>>>,
    calls: Mutex<Vec<&'static str>>,
    pub provision_requests: Mutex<Vec<ProvisionRequest>>,
    pub bind_requests: Mutex<Vec<BindRequest>>,
}

fn next<T: Default>(queue: &Mutex<VecDeque<Result<T, OsbError>>>) -> Result<T, OsbError> {
    queue.lock().unwrap().pop_front().unwrap_or_else(|| Ok(T::default()))
}

impl FakeBroker {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| **c == operation).count()
    }

    fn call(&self, operation: &'static str) {
        self.calls.lock().unwrap().push(operation);
    }
}

pub fn last_operation(state: LastOperationState) -> LastOperationResponse {
    LastOperationResponse {
        state,
        description: None,
    }
}

#[async_trait]
impl OsbClient for FakeBroker {
    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        self.call("get_catalog");
        next(&self.catalog)
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError> {
        self.call("provision");
        self.provision_requests.lock().unwrap().push(request.clone());
        next(&self.provision)
    }

    async fn deprovision_instance(
        &self,
        _request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError> {
        self.call("deprovision");
        next(&self.deprovision)
    }

    async fn poll_last_operation(
        &self,
        _request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        self.call("last_operation");
        self.last_operation
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(last_operation(LastOperationState::Succeeded)))
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        self.call("bind");
        self.bind_requests.lock().unwrap().push(request.clone());
        next(&self.bind)
    }

    async fn unbind(&self, _request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        self.call("unbind");
        next(&self.unbind)
    }

    async fn get_binding(
        &self,
        _request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, OsbError> {
        self.call("get_binding");
        next(&self.get_binding)
    }

    async fn poll_binding_last_operation(
        &self,
        _request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        self.call("binding_last_operation");
        self.binding_last_operation
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(last_operation(LastOperationState::Succeeded)))
    }
}

/// Hands out the same client for every broker
pub struct FixedClientFactory(pub Arc<dyn OsbClient>);

impl std::fmt::Debug for FixedClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedClientFactory")
    }
}

impl OsbClientFactory for FixedClientFactory {
    fn new_client_for_broker(&self, _secret: &Secret) -> Result<Arc<dyn OsbClient>, OsbError> {
        Ok(Arc::clone(&self.0))
    }
}

pub fn context(store: &Arc<MemoryStore>, client: Arc<dyn OsbClient>) -> Context {
    let config = ControllerConfig {
        route_service_proxy_image: Some("gcr.io/kf/route-service-proxy".to_string()),
        ..ControllerConfig::default()
    };
    Context::new(
        Arc::clone(store) as Arc<dyn ResourceStore>,
        Arc::new(FixedClientFactory(client)),
        config,
    )
}

pub fn meta(namespace: Option<&str>, name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        uid: (!uid.is_empty()).then(|| uid.to_string()),
        generation: Some(1),
        ..ObjectMeta::default()
    }
}

pub fn params_secret(name: &str, params: &str, owner: Option<&ServiceInstance>) -> Secret {
    let mut metadata = meta(Some(NAMESPACE), name, "");
    if let Some(owner) = owner {
        metadata.owner_references = owner.controller_owner_ref(&()).map(|r| vec![r]);
    }
    Secret {
        metadata,
        data: Some(BTreeMap::from([(
            PARAMS_SECRET_KEY.to_string(),
            ByteString(params.as_bytes().to_vec()),
        )])),
        ..Secret::default()
    }
}

pub fn osb_instance() -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        INSTANCE_NAME,
        ServiceInstanceSpec {
            osb: Some(OsbInstance {
                broker_name: BROKER_NAME.to_string(),
                namespaced: true,
                class_uid: "class-uid".to_string(),
                class_name: "mysql".to_string(),
                plan_uid: "plan-uid".to_string(),
                plan_name: "small".to_string(),
                progress_deadline_seconds: 0,
            }),
            parameters_from: LocalObjectReference {
                name: INSTANCE_PARAMS.to_string(),
            },
            tags: vec!["sql".to_string()],
            ..ServiceInstanceSpec::default()
        },
    );
    instance.metadata = meta(Some(NAMESPACE), INSTANCE_NAME, INSTANCE_UID);
    instance
}

pub fn binding() -> ServiceInstanceBinding {
    let mut binding = ServiceInstanceBinding::new(
        BINDING_NAME,
        ServiceInstanceBindingSpec {
            instance_ref: LocalObjectReference {
                name: INSTANCE_NAME.to_string(),
            },
            parameters_from: LocalObjectReference {
                name: BINDING_PARAMS.to_string(),
            },
            ..ServiceInstanceBindingSpec::default()
        },
    );
    binding.metadata = meta(Some(NAMESPACE), BINDING_NAME, BINDING_UID);
    binding
}

/// Namespace, Space and a namespaced broker with its credentials
pub fn seed_space(store: &MemoryStore) {
    store.insert(&Namespace {
        metadata: meta(None, NAMESPACE, NAMESPACE_UID),
        ..Namespace::default()
    });
    let mut space = Space::new(NAMESPACE, SpaceSpec {});
    space.metadata = meta(None, NAMESPACE, "space-uid");
    store.insert(&space);

    let mut broker = ServiceBroker::new(
        BROKER_NAME,
        ServiceBrokerSpec {
            credentials: LocalObjectReference {
                name: "broker-creds".to_string(),
            },
            update_requests: 0,
        },
    );
    broker.metadata = meta(Some(NAMESPACE), BROKER_NAME, "broker-uid");
    store.insert(&broker);

    store.insert(&broker_creds(NAMESPACE, "broker-creds"));
}

/// A well formed broker credentials Secret
pub fn broker_creds(namespace: &str, name: &str) -> Secret {
    let field = |value: &str| ByteString(value.as_bytes().to_vec());
    Secret {
        metadata: meta(Some(namespace), name, ""),
        type_: Some(BROKER_CREDS_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([
            ("username".to_string(), field("admin")),
            ("password".to_string(), field("secret")),
            ("url".to_string(), field("http://broker.example.com")),
        ])),
        ..Secret::default()
    }
}

/// Marks an object as being deleted
pub fn deleting(metadata: &mut ObjectMeta, finalizer: Option<&str>) {
    metadata.deletion_timestamp =
        Some(serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap());
    metadata.finalizers = finalizer.map(|f| vec![f.to_string()]);
}

/// Pretend every condition last moved long ago
pub fn age_conditions(conditions: &mut [crate::crd::Condition]) {
    for condition in conditions {
        condition.last_transition_time = Some("2000-01-01T00:00:00Z".to_string());
    }
}
