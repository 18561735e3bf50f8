//! # Resource Store
//!
//! Typed access to every Kubernetes object the reconcilers read or write.
//!
//! Reconcilers only talk to the cluster through [`ResourceStore`], so they can
//! be driven against an in-memory store in tests. [`KubeStore`] is the
//! production implementation over `kube::Client`.

use crate::constants::FIELD_MANAGER;
use crate::crd::{
    ClusterServiceBroker, ServiceBroker, ServiceInstance, ServiceInstanceBinding, Space,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Errors returned by the resource store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure, the write was based on a stale copy
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message.clone()),
            _ => StoreError::Other(err.to_string()),
        }
    }
}

/// Object access used by the reconcilers.
///
/// `get_*` returns `Ok(None)` when the object does not exist. Deletes of a
/// missing object return [`StoreError::NotFound`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_service_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>, StoreError>;

    /// Full replace, used for metadata (finalizer) changes
    async fn replace_service_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError>;

    /// Write the status of the given copy, failing with a conflict if it is stale
    async fn update_service_instance_status(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError>;

    async fn get_service_instance_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstanceBinding>, StoreError>;

    async fn list_service_instance_bindings(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceInstanceBinding>, StoreError>;

    async fn replace_service_instance_binding(
        &self,
        binding: &ServiceInstanceBinding,
    ) -> Result<ServiceInstanceBinding, StoreError>;

    async fn update_service_instance_binding_status(
        &self,
        binding: &ServiceInstanceBinding,
    ) -> Result<ServiceInstanceBinding, StoreError>;

    async fn get_service_broker(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceBroker>, StoreError>;

    async fn update_service_broker_status(
        &self,
        broker: &ServiceBroker,
    ) -> Result<ServiceBroker, StoreError>;

    async fn get_cluster_service_broker(
        &self,
        name: &str,
    ) -> Result<Option<ClusterServiceBroker>, StoreError>;

    async fn update_cluster_service_broker_status(
        &self,
        broker: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, StoreError>;

    async fn get_space(&self, name: &str) -> Result<Option<Space>, StoreError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, StoreError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;

    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolume>, StoreError>;

    async fn create_persistent_volume(
        &self,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError>;

    async fn delete_persistent_volume(&self, name: &str) -> Result<(), StoreError>;

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError>;

    async fn create_persistent_volume_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError>;

    async fn delete_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    async fn replace_deployment(&self, deployment: &Deployment)
        -> Result<Deployment, StoreError>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, StoreError>;

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError>;

    async fn replace_service(&self, service: &Service) -> Result<Service, StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    fn api_for<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        self.namespaced(obj.namespace().as_deref().unwrap_or_default())
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<K, StoreError>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn replace<K>(api: Api<K>, obj: &K) -> Result<K, StoreError>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    Ok(api.replace(&obj.name_any(), &PostParams::default(), obj).await?)
}

/// Merge patch of the status carrying the read resourceVersion as a precondition
async fn patch_status<K, S>(api: Api<K>, obj: &K, status: &S) -> Result<K, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": obj.resource_version() },
        "status": status,
    });
    Ok(api
        .patch_status(
            &obj.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?)
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<(), StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_service_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn replace_service_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError> {
        replace(self.api_for(instance), instance).await
    }

    async fn update_service_instance_status(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError> {
        patch_status(self.api_for(instance), instance, &instance.status).await
    }

    async fn get_service_instance_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstanceBinding>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn list_service_instance_bindings(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceInstanceBinding>, StoreError> {
        let api: Api<ServiceInstanceBinding> = self.namespaced(namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn replace_service_instance_binding(
        &self,
        binding: &ServiceInstanceBinding,
    ) -> Result<ServiceInstanceBinding, StoreError> {
        replace(self.api_for(binding), binding).await
    }

    async fn update_service_instance_binding_status(
        &self,
        binding: &ServiceInstanceBinding,
    ) -> Result<ServiceInstanceBinding, StoreError> {
        patch_status(self.api_for(binding), binding, &binding.status).await
    }

    async fn get_service_broker(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceBroker>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn update_service_broker_status(
        &self,
        broker: &ServiceBroker,
    ) -> Result<ServiceBroker, StoreError> {
        patch_status(self.api_for(broker), broker, &broker.status).await
    }

    async fn get_cluster_service_broker(
        &self,
        name: &str,
    ) -> Result<Option<ClusterServiceBroker>, StoreError> {
        get_opt(self.cluster(), name).await
    }

    async fn update_cluster_service_broker_status(
        &self,
        broker: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, StoreError> {
        patch_status(self.cluster(), broker, &broker.status).await
    }

    async fn get_space(&self, name: &str) -> Result<Option<Space>, StoreError> {
        get_opt(self.cluster(), name).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        get_opt(self.cluster(), name).await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        create(self.api_for(secret), secret).await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        replace(self.api_for(secret), secret).await
    }

    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolume>, StoreError> {
        get_opt(self.cluster(), name).await
    }

    async fn create_persistent_volume(
        &self,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError> {
        create(self.cluster(), volume).await
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<(), StoreError> {
        delete::<PersistentVolume>(self.cluster(), name).await
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn create_persistent_volume_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        create(self.api_for(claim), claim).await
    }

    async fn delete_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        delete::<PersistentVolumeClaim>(self.namespaced(namespace), name).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        create(self.api_for(deployment), deployment).await
    }

    async fn replace_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, StoreError> {
        replace(self.api_for(deployment), deployment).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, StoreError> {
        get_opt(self.namespaced(namespace), name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError> {
        create(self.api_for(service), service).await
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, StoreError> {
        replace(self.api_for(service), service).await
    }
}
